use std::{
    collections::{BTreeSet, HashMap},
    fmt::Debug,
    sync::Arc,
};

use async_trait::async_trait;

use crate::error::ListerError;

pub type ListerResult<T> = Result<T, ListerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicDescription {
    pub partition_count: i32,
    pub replication_factor: i16,
}

/// The broker's authoritative view of its resources, reached through an admin client.
#[async_trait]
pub trait ResourceLister: Send + Sync + Debug {
    async fn list_live_resources(&self) -> ListerResult<BTreeSet<String>>;

    /// Describes `names` in one call. Resources that no longer exist are absent from the result.
    async fn describe(
        &self,
        names: &BTreeSet<String>,
    ) -> ListerResult<HashMap<String, TopicDescription>>;

    /// Releases the admin connection. Called once when the owning auditor shuts down.
    async fn close(&self) {}
}

/// Creates the resource lister an auditor owns between `start` and `close`.
pub trait ResourceListerConnector: Send + Sync + Debug {
    /// `options` are the auditor options prefixed with `admin.`, prefix stripped.
    ///
    /// # Errors
    /// Returns an error if the lister cannot be constructed from `options`.
    fn connect(&self, options: &HashMap<String, String>) -> ListerResult<Arc<dyn ResourceLister>>;
}
