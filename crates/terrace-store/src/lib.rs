pub mod error;
pub mod lock;
pub mod memory;
pub mod postgres_store;
pub mod redb_store;
pub mod state;
pub mod store;
pub mod workspace;

pub use error::StoreError;
pub use lock::{AcquirePolicy, Lock, LockManager, LockOperation, LockRequest};
pub use memory::InMemoryStore;
pub use postgres_store::PostgresStore;
pub use redb_store::RedbStore;
pub use state::{StateEntity, StateSnapshot};
pub use store::StateStore;
pub use workspace::{WorkspaceConfig, WorkspaceKey, WorkspaceManager, DEFAULT_WORKSPACE};

/// A backend that persists snapshots and arbitrates locks for the same keys.
pub trait Backend: StateStore + LockManager {}

impl<T: StateStore + LockManager> Backend for T {}
