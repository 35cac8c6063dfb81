use async_trait::async_trait;

use crate::error::StoreError;
use crate::state::StateSnapshot;

/// Blob storage for one snapshot per key.
///
/// Backends read and write whole snapshots atomically; there are no partial
/// field updates.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    /// `None` when nothing has been written under `key` yet.
    async fn read(&self, key: &str) -> Result<Option<StateSnapshot>, StoreError>;

    /// Compare-and-swap on `serial`.
    ///
    /// Fails with [`StoreError::Conflict`] when the stored serial (0 for an
    /// absent key) differs from `expected_serial`, and with
    /// [`StoreError::LineageMismatch`] when the lineages differ. On success
    /// returns the serial now stored: `expected_serial + 1`, or
    /// `expected_serial` when the content was unchanged.
    async fn write(
        &self,
        key: &str,
        snapshot: &StateSnapshot,
        expected_serial: u64,
    ) -> Result<u64, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Keys starting with `prefix`, sorted.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}
