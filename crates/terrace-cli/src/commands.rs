use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use terrace_config::{BackendSettings, Settings};
use terrace_domain::{Address, ResourceSpec};
use terrace_provider::{LocalProvider, ProviderRegistry};
use terrace_reconciler::{ApplyOptions, Plan, PlanOptions, Reconciler, ReconcilerSettings};
use terrace_store::{
    AcquirePolicy, Backend, InMemoryStore, PostgresStore, RedbStore, WorkspaceConfig,
    WorkspaceManager, DEFAULT_WORKSPACE,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cli::{GlobalArgs, GraphOutput, StateCommand, WorkspaceCommand};
use crate::output;

/// Records which workspace `workspace select` chose, relative to the working
/// directory.
const ENVIRONMENT_FILE: &str = ".terrace/environment";

/// Exit codes shared by every command.
pub const EXIT_OK: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CHANGES: u8 = 2;

/// Everything a command needs: the reconciler and the workspace to act on.
pub struct Session {
    pub reconciler: Reconciler,
    pub workspace: String,
    holder_id: String,
}

// ── Setup ─────────────────────────────────────────────────────────────────────

pub async fn session(global: &GlobalArgs) -> Result<Session> {
    let settings = settings(global)?;
    let backend = open_backend(&settings.backend).await?;
    let workspaces = WorkspaceManager::new(
        backend,
        WorkspaceConfig {
            key_prefix: settings.workspace.key_prefix.clone(),
            state_key: settings.workspace.state_key.clone(),
        },
    );

    let mut providers = ProviderRegistry::new();
    providers.register("local", Arc::new(LocalProvider::new()));

    let lock_policy = if settings.lock.timeout_secs == 0 {
        AcquirePolicy::fail_fast()
    } else {
        AcquirePolicy::retry_for(settings.lock.timeout(), settings.lock.backoff())
    };
    let holder_id = holder_id();
    let mut reconciler = Reconciler::new(
        workspaces,
        Arc::new(providers),
        ReconcilerSettings {
            parallelism: settings.parallelism,
            lock_policy,
            holder_id: holder_id.clone(),
        },
    );

    let workspace = match &global.workspace {
        Some(name) => {
            reconciler
                .workspaces_mut()
                .select(name)
                .await
                .with_context(|| format!("Workspace '{name}' is not available"))?;
            name.clone()
        }
        None => {
            let remembered = selected_workspace()?;
            match reconciler.workspaces_mut().select(&remembered).await {
                Ok(()) => remembered,
                Err(e) => {
                    warn!(workspace = %remembered, error = %e, "selected workspace is gone; using default");
                    DEFAULT_WORKSPACE.to_string()
                }
            }
        }
    };
    debug!(workspace = %workspace, "workspace selected");

    Ok(Session {
        reconciler,
        workspace,
        holder_id,
    })
}

fn settings(global: &GlobalArgs) -> Result<Settings> {
    let mut settings = Settings::load(&global.config)
        .with_context(|| format!("Failed to load settings from {}", global.config.display()))?;
    if let Some(path) = &global.state_path {
        settings.backend = BackendSettings::Local { path: path.clone() };
    }
    if let Some(url) = &global.postgres_url {
        settings.backend = BackendSettings::Postgres { url: url.clone() };
    }
    if let Some(parallelism) = global.parallelism {
        if parallelism == 0 {
            bail!("--parallelism must be at least 1");
        }
        settings.parallelism = parallelism;
    }
    if let Some(timeout) = global.lock_timeout {
        settings.lock.timeout_secs = timeout;
    }
    Ok(settings)
}

async fn open_backend(settings: &BackendSettings) -> Result<Arc<dyn Backend>> {
    let backend: Arc<dyn Backend> = match settings {
        BackendSettings::Memory => {
            warn!("using the in-memory backend; state is discarded on exit");
            Arc::new(InMemoryStore::new())
        }
        BackendSettings::Local { path } => Arc::new(
            RedbStore::open(path)
                .with_context(|| format!("Failed to open state database {}", path.display()))?,
        ),
        BackendSettings::Postgres { url } => Arc::new(
            PostgresStore::connect(url)
                .await
                .context("Failed to connect to the PostgreSQL backend")?,
        ),
    };
    Ok(backend)
}

fn holder_id() -> String {
    let user = std::env::var("USER").unwrap_or_else(|_| "terrace".into());
    format!("{user}:{}", std::process::id())
}

fn selected_workspace() -> Result<String> {
    match std::fs::read_to_string(ENVIRONMENT_FILE) {
        Ok(name) if !name.trim().is_empty() => Ok(name.trim().to_string()),
        Ok(_) => Ok(DEFAULT_WORKSPACE.to_string()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DEFAULT_WORKSPACE.to_string()),
        Err(e) => Err(e).with_context(|| format!("Failed to read {ENVIRONMENT_FILE}")),
    }
}

fn remember_workspace(name: &str) -> Result<()> {
    let path = Path::new(ENVIRONMENT_FILE);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, format!("{name}\n"))
        .with_context(|| format!("Failed to write {ENVIRONMENT_FILE}"))
}

fn load(dir: &Path) -> Result<Vec<ResourceSpec>> {
    terrace_config::load_specs(dir)
        .with_context(|| format!("Failed to load resources from {}", dir.display()))
}

/// Cancel `token` on Ctrl-C; running operations are still awaited.
fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; waiting for running operations to finish");
            child.cancel();
        }
    });
    token
}

fn apply_options(cancel: CancellationToken) -> ApplyOptions {
    ApplyOptions {
        // Bounded again by the configured parallelism.
        parallelism: usize::MAX,
        cancel,
    }
}

// ── Plan ──────────────────────────────────────────────────────────────────────

pub async fn plan(
    session: &Session,
    dir: PathBuf,
    out: Option<PathBuf>,
    refresh: bool,
    json: bool,
) -> Result<u8> {
    let specs = load(&dir)?;
    let plan = session
        .reconciler
        .plan(&session.workspace, &specs, &PlanOptions { refresh })
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        print!("{}", output::render_plan(&plan));
    }
    if let Some(path) = out {
        let bytes = plan.to_bytes()?;
        std::fs::write(&path, bytes)
            .with_context(|| format!("Failed to write plan to {}", path.display()))?;
        eprintln!("Saved plan to {} (sha256 {})", path.display(), plan.digest()?);
    }
    Ok(if plan.has_changes() { EXIT_CHANGES } else { EXIT_OK })
}

// ── Apply ─────────────────────────────────────────────────────────────────────

pub async fn apply(
    session: &Session,
    dir: Option<PathBuf>,
    plan_file: Option<PathBuf>,
    refresh: bool,
    json: bool,
) -> Result<u8> {
    let options = apply_options(cancel_on_interrupt());
    let (plan, report) = match (dir, plan_file) {
        (_, Some(path)) => {
            let bytes = std::fs::read(&path)
                .with_context(|| format!("Failed to read plan {}", path.display()))?;
            let plan = Plan::from_bytes(&bytes)
                .with_context(|| format!("Failed to parse plan {}", path.display()))?;
            let report = session.reconciler.apply(&session.workspace, &plan, &options).await?;
            (plan, report)
        }
        (Some(dir), None) => {
            let specs = load(&dir)?;
            session
                .reconciler
                .apply_specs(&session.workspace, &specs, &PlanOptions { refresh }, &options)
                .await?
        }
        (None, None) => bail!("apply needs a resource directory or --plan"),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", output::render_plan(&plan));
        if plan.has_changes() {
            println!();
            print!("{}", output::render_report(&report));
        }
    }
    Ok(exit_code(report.outcome().exit_code()))
}

// ── Destroy ───────────────────────────────────────────────────────────────────

pub async fn destroy(session: &Session, yes: bool, refresh: bool) -> Result<u8> {
    let plan_options = PlanOptions { refresh };
    if !yes {
        let plan = session.reconciler.plan(&session.workspace, &[], &plan_options).await?;
        print!("{}", output::render_plan(&plan));
        if plan.has_changes() {
            eprintln!("\nNothing was destroyed. Re-run with --yes to delete these resources.");
            return Ok(EXIT_FAILURE);
        }
        return Ok(EXIT_OK);
    }

    let options = apply_options(cancel_on_interrupt());
    let (plan, report) = session
        .reconciler
        .destroy(&session.workspace, &plan_options, &options)
        .await?;
    print!("{}", output::render_plan(&plan));
    if plan.has_changes() {
        println!();
        print!("{}", output::render_report(&report));
    }
    Ok(exit_code(report.outcome().exit_code()))
}

// ── Workspace ─────────────────────────────────────────────────────────────────

pub async fn workspace(session: &mut Session, command: WorkspaceCommand) -> Result<u8> {
    match command {
        WorkspaceCommand::New { name } => {
            let manager = session.reconciler.workspaces_mut();
            manager.create(&name).await?;
            manager.select(&name).await?;
            remember_workspace(&name)?;
            println!("Created and selected workspace '{name}'.");
        }
        WorkspaceCommand::List => {
            for name in session.reconciler.workspaces().list().await? {
                let marker = if name == session.workspace { "*" } else { " " };
                println!("{marker} {name}");
            }
        }
        WorkspaceCommand::Select { name } => {
            session.reconciler.workspaces_mut().select(&name).await?;
            remember_workspace(&name)?;
            println!("Switched to workspace '{name}'.");
        }
        WorkspaceCommand::Show => println!("{}", session.workspace),
        WorkspaceCommand::Delete { name, force } => {
            session
                .reconciler
                .workspaces()
                .delete(&name, &session.holder_id, force)
                .await?;
            println!("Deleted workspace '{name}'.");
        }
    }
    Ok(EXIT_OK)
}

// ── Force unlock ──────────────────────────────────────────────────────────────

pub async fn force_unlock(session: &Session, lock_id: Uuid) -> Result<u8> {
    let removed = session
        .reconciler
        .workspaces()
        .force_unlock(&session.workspace, lock_id)
        .await?;
    match removed {
        Some(lock) => println!(
            "Removed lock {} on workspace '{}' (held by {} for {} since {}).",
            lock.id, lock.workspace, lock.holder_id, lock.operation, lock.acquired_at
        ),
        None => println!("Workspace '{}' is not locked.", session.workspace),
    }
    Ok(EXIT_OK)
}

// ── Graph ─────────────────────────────────────────────────────────────────────

pub async fn graph(session: &Session, dir: PathBuf, output_format: GraphOutput) -> Result<u8> {
    let specs = load(&dir)?;
    let graph = session.reconciler.graph(&session.workspace, &specs).await?;
    match output_format {
        GraphOutput::Text => print!("{}", output::render_graph_text(&graph)),
        GraphOutput::Dot => println!("{}", graph.to_dot()),
        GraphOutput::Json => println!("{}", serde_json::to_string_pretty(&graph.views())?),
    }
    Ok(EXIT_OK)
}

// ── State ─────────────────────────────────────────────────────────────────────

pub async fn state(session: &Session, command: StateCommand) -> Result<u8> {
    let snapshot = session.reconciler.workspaces().read(&session.workspace).await?;
    match command {
        StateCommand::List => print!("{}", output::render_state(&session.workspace, &snapshot)),
        StateCommand::Show { address } => {
            let address = Address::parse(&address)?;
            let Some(entity) = snapshot.entity(&address) else {
                bail!("{address} is not recorded in workspace '{}'", session.workspace);
            };
            println!("{}", serde_json::to_string_pretty(entity)?);
        }
    }
    Ok(EXIT_OK)
}

fn exit_code(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(EXIT_FAILURE)
}
