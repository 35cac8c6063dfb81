use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use terrace_domain::{
    Address, AttributeBehavior, ChangeAction, Reference, ResourceSchema, ResourceSpec, Value,
};
use terrace_graph::GraphError;
use terrace_provider::{LocalProvider, OperationRequest, Provider, ProviderError, ProviderRegistry};
use terrace_reconciler::{
    ApplyOptions, ApplyOutcome, NodeStatus, PlanOptions, ReconcileError, Reconciler,
    ReconcilerSettings,
};
use terrace_store::{
    AcquirePolicy, InMemoryStore, LockManager, LockOperation, LockRequest, RedbStore, StateEntity,
    StoreError, WorkspaceConfig, WorkspaceManager, DEFAULT_WORKSPACE,
};

const WS: &str = DEFAULT_WORKSPACE;

// ── Helpers ───────────────────────────────────────────────────────────────────

fn reconciler_with(provider: Arc<dyn Provider>, store: Arc<InMemoryStore>) -> Reconciler {
    let mut providers = ProviderRegistry::new();
    providers.register("local", provider);
    Reconciler::new(
        WorkspaceManager::new(store, WorkspaceConfig::default()),
        Arc::new(providers),
        ReconcilerSettings::default(),
    )
}

fn reconciler(provider: &LocalProvider) -> Reconciler {
    reconciler_with(Arc::new(provider.clone()), Arc::new(InMemoryStore::new()))
}

fn host(name: &str, size: &str) -> ResourceSpec {
    ResourceSpec::new("host", name, "local").with_attribute("size", size)
}

fn addr(s: &str) -> Address {
    Address::parse(s).unwrap()
}

fn zoned_provider(create_before_destroy: bool) -> LocalProvider {
    LocalProvider::new().with_schema(
        ResourceSchema::new("host")
            .with_attribute("zone", AttributeBehavior::ForcesReplacement)
            .with_create_before_destroy(create_before_destroy),
    )
}

async fn apply(r: &Reconciler, specs: &[ResourceSpec]) -> terrace_reconciler::ApplyReport {
    let (_, report) = r
        .apply_specs(WS, specs, &PlanOptions::default(), &ApplyOptions::default())
        .await
        .unwrap();
    report
}

// ── Create / no-op / delete ───────────────────────────────────────────────────

#[tokio::test]
async fn create_then_converged() {
    let provider = LocalProvider::new();
    let r = reconciler(&provider);
    let before = r.workspaces().read(WS).await.unwrap();

    let report = apply(&r, &[host("a", "small")]).await;
    assert_eq!(report.outcome(), ApplyOutcome::Applied);
    assert_eq!(report.outcome().exit_code(), 2);

    let after = r.workspaces().read(WS).await.unwrap();
    assert_eq!(after.serial, before.serial + 1);
    assert_eq!(after.lineage, before.lineage);
    assert_eq!(after.resource_count(), 1);
    assert!(provider.object(&addr("host.a")).await.is_some());

    let plan = r.plan(WS, &[host("a", "small")], &PlanOptions::default()).await.unwrap();
    assert!(!plan.has_changes());
    let report = apply(&r, &[host("a", "small")]).await;
    assert_eq!(report.outcome(), ApplyOutcome::NoChanges);
    assert_eq!(r.workspaces().read(WS).await.unwrap().serial, after.serial);
}

#[tokio::test]
async fn removed_resource_is_deleted() {
    let provider = LocalProvider::new();
    let r = reconciler(&provider);
    apply(&r, &[host("a", "small")]).await;

    let report = apply(&r, &[]).await;
    assert_eq!(report.outcome(), ApplyOutcome::Applied);
    assert!(r.workspaces().read(WS).await.unwrap().is_empty());
    assert!(provider.object(&addr("host.a")).await.is_none());
}

#[tokio::test]
async fn destroy_tears_down_dependents_first() {
    let provider = LocalProvider::new();
    let r = reconciler(&provider);
    let net = ResourceSpec::new("net", "main", "local").with_attribute("cidr", "10.0.0.0/16");
    let web = host("web", "small")
        .with_attribute("net", Value::from(Reference::new(addr("net.main"), "id")));
    apply(&r, &[net, web]).await;

    let (plan, report) = r
        .destroy(WS, &PlanOptions::default(), &ApplyOptions::default())
        .await
        .unwrap();
    let order: Vec<&str> = plan.entries.iter().map(|e| e.address.as_str()).collect();
    assert_eq!(order, vec!["host.web", "net.main"]);
    assert_eq!(report.outcome(), ApplyOutcome::Applied);
    assert!(r.workspaces().read(WS).await.unwrap().is_empty());
}

#[tokio::test]
async fn references_resolve_to_created_ids() {
    let provider = LocalProvider::new();
    let r = reconciler(&provider);
    let net = ResourceSpec::new("net", "main", "local");
    let web = host("web", "small")
        .with_attribute("net", Value::from(Reference::new(addr("net.main"), "id")));
    apply(&r, &[net, web]).await;

    let state = r.workspaces().read(WS).await.unwrap();
    let net_id = state.entity(&addr("net.main")).unwrap().attribute("id").cloned();
    let web = state.entity(&addr("host.web")).unwrap();
    assert_eq!(web.attribute("net").cloned(), net_id);
    assert!(web.dependencies.contains(&addr("net.main")));
}

// ── Replacement ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn destroy_before_create_replacement() {
    let provider = zoned_provider(false);
    let r = reconciler(&provider);
    apply(&r, &[host("a", "small").with_attribute("zone", "a")]).await;
    let old_id = r.workspaces().read(WS).await.unwrap().entity(&addr("host.a")).unwrap().attribute("id").cloned();

    let (plan, report) = r
        .apply_specs(
            WS,
            &[host("a", "small").with_attribute("zone", "b")],
            &PlanOptions::default(),
            &ApplyOptions::default(),
        )
        .await
        .unwrap();
    let ops: Vec<ChangeAction> = plan.entries.iter().map(|e| e.operation).collect();
    assert_eq!(ops, vec![ChangeAction::Delete, ChangeAction::Create]);
    assert_eq!(report.outcome(), ApplyOutcome::Applied);

    let state = r.workspaces().read(WS).await.unwrap();
    let entity = state.entity(&addr("host.a")).unwrap();
    assert_eq!(entity.attribute("zone"), Some(&Value::from("b")));
    assert_ne!(entity.attribute("id").cloned(), old_id);
    assert!(state.deposed.is_empty());
}

#[tokio::test]
async fn create_before_destroy_replacement() {
    let provider = zoned_provider(true);
    let r = reconciler(&provider);
    apply(&r, &[host("a", "small").with_attribute("zone", "a")]).await;

    let (plan, report) = r
        .apply_specs(
            WS,
            &[host("a", "small").with_attribute("zone", "b")],
            &PlanOptions::default(),
            &ApplyOptions::default(),
        )
        .await
        .unwrap();
    let ops: Vec<(ChangeAction, bool)> = plan.entries.iter().map(|e| (e.operation, e.deposed)).collect();
    assert_eq!(ops, vec![(ChangeAction::Create, false), (ChangeAction::Delete, true)]);
    assert_eq!(report.outcome(), ApplyOutcome::Applied);

    let state = r.workspaces().read(WS).await.unwrap();
    assert!(state.deposed.is_empty());
    assert_eq!(state.entity(&addr("host.a")).unwrap().attribute("zone"), Some(&Value::from("b")));
    let live = provider.object(&addr("host.a")).await.unwrap();
    assert_eq!(live.get("zone"), Some(&Value::from("b")));
}

/// Refuses every delete.
struct KeepsObjects {
    inner: LocalProvider,
}

#[async_trait]
impl Provider for KeepsObjects {
    fn name(&self) -> &str {
        "keeps-objects"
    }

    fn schema(&self, resource_type: &str) -> Option<ResourceSchema> {
        self.inner.schema(resource_type)
    }

    async fn apply_operation(
        &self,
        request: OperationRequest<'_>,
    ) -> Result<Option<StateEntity>, ProviderError> {
        if request.action == ChangeAction::Delete {
            return Err(ProviderError::OperationFailed {
                address: request.address.clone(),
                action: request.action,
                message: "delete refused".into(),
            });
        }
        self.inner.apply_operation(request).await
    }

    async fn read(&self, entity: &StateEntity) -> Result<Option<StateEntity>, ProviderError> {
        self.inner.read(entity).await
    }
}

#[tokio::test]
async fn failed_deposed_delete_is_retried_next_run() {
    let store = Arc::new(InMemoryStore::new());
    let provider = zoned_provider(true);
    let desired = [host("a", "small").with_attribute("zone", "b")];

    let r = reconciler_with(Arc::new(provider.clone()), store.clone());
    apply(&r, &[host("a", "small").with_attribute("zone", "a")]).await;

    let stubborn = reconciler_with(Arc::new(KeepsObjects { inner: provider.clone() }), store.clone());
    let report = apply(&stubborn, &desired).await;
    assert_eq!(report.outcome(), ApplyOutcome::Failed);
    let state = r.workspaces().read(WS).await.unwrap();
    assert_eq!(state.deposed.len(), 1);
    assert_eq!(state.deposed[0].attribute("zone"), Some(&Value::from("a")));
    assert_eq!(state.entity(&addr("host.a")).unwrap().attribute("zone"), Some(&Value::from("b")));

    let retry = r.plan(WS, &desired, &PlanOptions::default()).await.unwrap();
    let ops: Vec<(ChangeAction, bool)> = retry.entries.iter().map(|e| (e.operation, e.deposed)).collect();
    assert_eq!(ops, vec![(ChangeAction::NoOp, false), (ChangeAction::Delete, true)]);

    apply(&r, &desired).await;
    assert!(r.workspaces().read(WS).await.unwrap().deposed.is_empty());
}

// ── Failure handling ──────────────────────────────────────────────────────────

#[tokio::test]
async fn failure_blocks_dependents_and_keeps_independent_progress() {
    let provider = LocalProvider::new();
    let r = reconciler(&provider);
    let chain = |size: &str| {
        vec![
            host("a", size),
            host("b", size).with_depends_on(addr("host.a")),
            host("c", size).with_depends_on(addr("host.b")),
        ]
    };
    apply(&r, &chain("small")).await;
    provider.fail_on(addr("host.b")).await;

    let report = apply(&r, &chain("large")).await;
    assert_eq!(report.outcome(), ApplyOutcome::Failed);
    assert_eq!(report.outcome().exit_code(), 1);
    let status = |a: &str| report.outcome_for(&addr(a))[0].status;
    assert_eq!(status("host.a"), NodeStatus::Succeeded);
    assert_eq!(status("host.b"), NodeStatus::Failed);
    assert_eq!(status("host.c"), NodeStatus::Blocked);

    let state = r.workspaces().read(WS).await.unwrap();
    let size = |a: &str| state.entity(&addr(a)).unwrap().attribute("size").cloned();
    assert_eq!(size("host.a"), Some(Value::from("large")));
    assert_eq!(size("host.b"), Some(Value::from("small")));
    assert_eq!(size("host.c"), Some(Value::from("small")));
}

// ── Plans ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn identical_inputs_give_identical_plan_bytes() {
    let provider = LocalProvider::new();
    let r = reconciler(&provider);
    apply(&r, &[host("a", "small"), host("b", "small")]).await;
    let specs = [host("b", "large"), host("c", "small"), host("a", "small")];

    let first = r.plan(WS, &specs, &PlanOptions::default()).await.unwrap();
    let second = r.plan(WS, &specs, &PlanOptions::default()).await.unwrap();
    assert_eq!(first.to_bytes().unwrap(), second.to_bytes().unwrap());
    assert_eq!(first.digest().unwrap(), second.digest().unwrap());
}

#[tokio::test]
async fn saved_plan_applies_once() {
    let provider = LocalProvider::new();
    let r = reconciler(&provider);
    let plan = r.plan(WS, &[host("a", "small")], &PlanOptions::default()).await.unwrap();
    let saved = terrace_reconciler::Plan::from_bytes(&plan.to_bytes().unwrap()).unwrap();

    let report = r.apply(WS, &saved, &ApplyOptions::default()).await.unwrap();
    assert_eq!(report.outcome(), ApplyOutcome::Applied);

    let err = r.apply(WS, &saved, &ApplyOptions::default()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::StalePlan { .. }));
}

#[tokio::test]
async fn stale_plan_is_rejected_without_side_effects() {
    let provider = LocalProvider::new();
    let r = reconciler(&provider);
    let plan = r.plan(WS, &[host("a", "small")], &PlanOptions::default()).await.unwrap();
    apply(&r, &[host("b", "small")]).await;

    let err = r.apply(WS, &plan, &ApplyOptions::default()).await.unwrap_err();
    match err {
        ReconcileError::StalePlan { planned_serial, current_serial, .. } => {
            assert_eq!(current_serial, planned_serial + 1)
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(provider.object(&addr("host.a")).await.is_none());
    assert!(r.workspaces().current_lock(WS).await.unwrap().is_none());
}

#[tokio::test]
async fn refresh_detects_drift() {
    let provider = LocalProvider::new();
    let r = reconciler(&provider);
    apply(&r, &[host("a", "small")]).await;
    provider.drift(&addr("host.a"), "size", Value::from("huge")).await;

    let stale = r.plan(WS, &[host("a", "small")], &PlanOptions::default()).await.unwrap();
    assert!(!stale.has_changes());

    let refreshed = r
        .plan(WS, &[host("a", "small")], &PlanOptions { refresh: true })
        .await
        .unwrap();
    assert_eq!(refreshed.entries[0].operation, ChangeAction::Update);
}

#[tokio::test]
async fn refresh_recreates_objects_deleted_out_of_band() {
    let provider = LocalProvider::new();
    let r = reconciler(&provider);
    apply(&r, &[host("a", "small")]).await;
    provider.remove_out_of_band(&addr("host.a")).await;

    let plan = r
        .plan(WS, &[host("a", "small")], &PlanOptions { refresh: true })
        .await
        .unwrap();
    assert_eq!(plan.entries[0].operation, ChangeAction::Create);
}

#[tokio::test]
async fn cycle_is_reported_before_locking() {
    let provider = LocalProvider::new();
    let r = reconciler(&provider);
    let a = host("a", "small").with_attribute("peer", Value::from(Reference::new(addr("host.b"), "id")));
    let b = host("b", "small").with_attribute("peer", Value::from(Reference::new(addr("host.a"), "id")));

    // A held lock would fail the call if validation ran after locking.
    r.workspaces()
        .lock(WS, &LockRequest::new("other", LockOperation::Apply), &AcquirePolicy::fail_fast())
        .await
        .unwrap();
    let err = r
        .apply_specs(WS, &[a, b], &PlanOptions::default(), &ApplyOptions::default())
        .await
        .unwrap_err();
    match err {
        ReconcileError::Graph(GraphError::Cycle(cycle)) => {
            assert!(cycle.contains(&addr("host.a")) && cycle.contains(&addr("host.b")))
        }
        other => panic!("unexpected error: {other}"),
    }
}

// ── Locking ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn held_lock_fails_apply() {
    let provider = LocalProvider::new();
    let r = reconciler(&provider);
    let held = r
        .workspaces()
        .lock(WS, &LockRequest::new("ci-runner", LockOperation::Apply), &AcquirePolicy::fail_fast())
        .await
        .unwrap();

    let err = r
        .apply_specs(WS, &[host("a", "small")], &PlanOptions::default(), &ApplyOptions::default())
        .await
        .unwrap_err();
    match err {
        ReconcileError::Store(StoreError::LockHeld(current)) => {
            assert_eq!(current.id, held.id);
            assert_eq!(current.holder_id, "ci-runner");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(provider.object(&addr("host.a")).await.is_none());
}

/// Force-unlocks the workspace from under the running session on its first call.
struct Hijacker {
    inner: LocalProvider,
    store: Arc<InMemoryStore>,
    lock_key: String,
}

#[async_trait]
impl Provider for Hijacker {
    fn name(&self) -> &str {
        "hijacker"
    }

    fn schema(&self, resource_type: &str) -> Option<ResourceSchema> {
        self.inner.schema(resource_type)
    }

    async fn apply_operation(
        &self,
        request: OperationRequest<'_>,
    ) -> Result<Option<StateEntity>, ProviderError> {
        if let Ok(Some(lock)) = self.store.current(&self.lock_key).await {
            let _ = self.store.force_unlock(&self.lock_key, lock.id).await;
        }
        self.inner.apply_operation(request).await
    }

    async fn read(&self, entity: &StateEntity) -> Result<Option<StateEntity>, ProviderError> {
        self.inner.read(entity).await
    }
}

#[tokio::test]
async fn lost_lock_aborts_without_writing() {
    let store = Arc::new(InMemoryStore::new());
    let lock_key = WorkspaceManager::new(store.clone(), WorkspaceConfig::default())
        .key(WS)
        .unwrap()
        .lock_key;
    let hijacker = Hijacker {
        inner: LocalProvider::new(),
        store: store.clone(),
        lock_key,
    };
    let r = reconciler_with(Arc::new(hijacker), store);
    let before = r.workspaces().read(WS).await.unwrap();

    let options = ApplyOptions { parallelism: 1, ..ApplyOptions::default() };
    let (_, report) = r
        .apply_specs(WS, &[host("a", "small"), host("b", "small")], &PlanOptions::default(), &options)
        .await
        .unwrap();
    assert!(report.aborted.is_some());
    assert_eq!(report.outcome(), ApplyOutcome::Failed);
    assert_eq!(report.outcome_for(&addr("host.a"))[0].status, NodeStatus::Failed);
    assert_eq!(report.outcome_for(&addr("host.b"))[0].status, NodeStatus::Skipped);
    assert_eq!(r.workspaces().read(WS).await.unwrap().serial, before.serial);
}

// ── Scheduling ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn cancelled_session_dispatches_nothing() {
    let provider = LocalProvider::new();
    let r = reconciler(&provider);
    let before = r.workspaces().read(WS).await.unwrap();
    let options = ApplyOptions::default();
    options.cancel.cancel();

    let (_, report) = r
        .apply_specs(WS, &[host("a", "small"), host("b", "small")], &PlanOptions::default(), &options)
        .await
        .unwrap();
    assert!(report.cancelled);
    assert!(report.outcomes.iter().all(|o| o.status == NodeStatus::Skipped));
    assert_eq!(report.outcome(), ApplyOutcome::Failed);
    assert_eq!(r.workspaces().read(WS).await.unwrap().serial, before.serial);
    assert!(r.workspaces().current_lock(WS).await.unwrap().is_none());
}

/// Records the highest number of operations running at once.
#[derive(Default)]
struct Gauge {
    inner: LocalProvider,
    running: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl Provider for Gauge {
    fn name(&self) -> &str {
        "gauge"
    }

    fn schema(&self, resource_type: &str) -> Option<ResourceSchema> {
        self.inner.schema(resource_type)
    }

    async fn apply_operation(
        &self,
        request: OperationRequest<'_>,
    ) -> Result<Option<StateEntity>, ProviderError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let result = self.inner.apply_operation(request).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn read(&self, entity: &StateEntity) -> Result<Option<StateEntity>, ProviderError> {
        self.inner.read(entity).await
    }
}

#[tokio::test]
async fn parallelism_bounds_in_flight_operations() {
    let gauge = Arc::new(Gauge::default());
    let r = reconciler_with(gauge.clone(), Arc::new(InMemoryStore::new()));
    let specs: Vec<ResourceSpec> = (0..6).map(|i| host(&format!("h{i}"), "small")).collect();

    let options = ApplyOptions { parallelism: 2, ..ApplyOptions::default() };
    let (_, report) = r
        .apply_specs(WS, &specs, &PlanOptions::default(), &options)
        .await
        .unwrap();
    assert_eq!(report.with_status(NodeStatus::Succeeded).len(), 6);
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);
    assert_eq!(r.workspaces().read(WS).await.unwrap().resource_count(), 6);
}

// ── Persistent backend ────────────────────────────────────────────────────────

#[tokio::test]
async fn state_survives_reopening_redb_backend() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.redb");
    let provider = LocalProvider::new();
    let mut providers = ProviderRegistry::new();
    providers.register("local", Arc::new(provider.clone()));
    let providers = Arc::new(providers);

    let serial = {
        let backend = Arc::new(RedbStore::open(&path).unwrap());
        let r = Reconciler::new(
            WorkspaceManager::new(backend, WorkspaceConfig::default()),
            providers.clone(),
            ReconcilerSettings::default(),
        );
        apply(&r, &[host("a", "small")]).await;
        r.workspaces().read(WS).await.unwrap().serial
    };

    let backend = Arc::new(RedbStore::open(&path).unwrap());
    let r = Reconciler::new(
        WorkspaceManager::new(backend, WorkspaceConfig::default()),
        providers,
        ReconcilerSettings::default(),
    );
    let state = r.workspaces().read(WS).await.unwrap();
    assert_eq!(state.serial, serial);
    assert!(state.entity(&addr("host.a")).is_some());
    let plan = r.plan(WS, &[host("a", "small")], &PlanOptions::default()).await.unwrap();
    assert!(!plan.has_changes());
}
