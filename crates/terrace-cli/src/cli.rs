use clap::{ArgGroup, Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(
    name = "terrace",
    about = "Declarative infrastructure reconciliation against locked, versioned state",
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Settings file.
    #[arg(long, env = "TERRACE_CONFIG", global = true, default_value = terrace_config::SETTINGS_FILE)]
    pub config: PathBuf,

    /// Workspace to operate on instead of the selected one.
    #[arg(long, short = 'w', env = "TERRACE_WORKSPACE", global = true)]
    pub workspace: Option<String>,

    /// Keep state in this redb file instead of the configured backend.
    #[arg(long, env = "TERRACE_STATE_PATH", global = true, conflicts_with = "postgres_url")]
    pub state_path: Option<PathBuf>,

    /// Keep state in PostgreSQL instead of the configured backend.
    #[arg(long, env = "TERRACE_POSTGRES_URL", global = true)]
    pub postgres_url: Option<String>,

    /// Maximum number of provider operations running at once.
    #[arg(long, env = "TERRACE_PARALLELISM", global = true)]
    pub parallelism: Option<usize>,

    /// Seconds to keep retrying a held lock (0 fails immediately).
    #[arg(long, env = "TERRACE_LOCK_TIMEOUT", global = true)]
    pub lock_timeout: Option<u64>,

    /// Emit logs as JSON lines.
    #[arg(long, env = "TERRACE_LOG_JSON", global = true)]
    pub log_json: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show what would change without applying.
    Plan {
        /// Directory of resource documents.
        dir: PathBuf,

        /// Save the plan for a later `apply --plan`.
        #[arg(long)]
        out: Option<PathBuf>,

        /// Re-read recorded objects before diffing.
        #[arg(long)]
        refresh: bool,

        /// Print the plan as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Converge real infrastructure on the configuration.
    #[command(group(ArgGroup::new("source").required(true).args(["dir", "plan"])))]
    Apply {
        /// Directory of resource documents; planned and applied under one lock.
        dir: Option<PathBuf>,

        /// Apply a plan saved by `plan --out`.
        #[arg(long)]
        plan: Option<PathBuf>,

        /// Re-read recorded objects before diffing.
        #[arg(long, conflicts_with = "plan")]
        refresh: bool,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Delete every object recorded in the workspace.
    Destroy {
        /// Skip the confirmation; without it only the plan is shown.
        #[arg(long)]
        yes: bool,

        #[arg(long)]
        refresh: bool,
    },

    /// Manage workspaces.
    Workspace {
        #[command(subcommand)]
        command: WorkspaceCommand,
    },

    /// Remove a lock left behind by a crashed session.
    ForceUnlock {
        /// Id of the lock to remove, as reported by the failed command.
        lock_id: Uuid,
    },

    /// Render the dependency graph.
    Graph {
        /// Directory of resource documents.
        dir: PathBuf,

        /// Output format.
        #[arg(long, default_value = "text")]
        output: GraphOutput,
    },

    /// Inspect recorded state.
    State {
        #[command(subcommand)]
        command: StateCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum WorkspaceCommand {
    /// Create a workspace and select it.
    New { name: String },
    /// List workspaces; the selected one is marked.
    List,
    /// Select the workspace later commands operate on.
    Select { name: String },
    /// Print the selected workspace.
    Show,
    /// Delete a workspace and its state.
    Delete {
        name: String,
        /// Delete even if the workspace still tracks resources.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum StateCommand {
    /// List recorded resources.
    List,
    /// Print one recorded resource as JSON.
    Show { address: String },
}

#[derive(Debug, Clone, ValueEnum)]
pub enum GraphOutput {
    Text,
    Json,
    Dot,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn apply_needs_a_source() {
        assert!(Cli::try_parse_from(["terrace", "apply"]).is_err());
        assert!(Cli::try_parse_from(["terrace", "apply", "stack"]).is_ok());
        assert!(Cli::try_parse_from(["terrace", "apply", "--plan", "p.json"]).is_ok());
        assert!(Cli::try_parse_from(["terrace", "apply", "stack", "--plan", "p.json"]).is_err());
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let cli = Cli::try_parse_from(["terrace", "plan", "stack", "-w", "dev", "--parallelism", "3"])
            .unwrap();
        assert_eq!(cli.global.workspace.as_deref(), Some("dev"));
        assert_eq!(cli.global.parallelism, Some(3));
    }

    #[test]
    fn force_unlock_takes_a_lock_id() {
        assert!(Cli::try_parse_from(["terrace", "force-unlock", "not-a-uuid"]).is_err());
        let id = Uuid::new_v4().to_string();
        assert!(Cli::try_parse_from(["terrace", "force-unlock", id.as_str()]).is_ok());
    }
}
