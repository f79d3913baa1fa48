use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt::Debug,
    sync::Arc,
};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::CatalogError;

pub type CatalogResult<T> = Result<T, CatalogError>;

pub const ATTRIBUTE_QUALIFIED_NAME: &str = "qualifiedName";
pub const ATTRIBUTE_CLUSTER_NAME: &str = "clusterName";
pub const ATTRIBUTE_TOPIC: &str = "topic";
pub const ATTRIBUTE_NAME: &str = "name";
pub const ATTRIBUTE_DESCRIPTION: &str = "description";
pub const ATTRIBUTE_URI: &str = "uri";
pub const ATTRIBUTE_PARTITION_COUNT: &str = "partitionCount";
pub const ATTRIBUTE_REPLICATION_FACTOR: &str = "replicationFactor";

const QUALIFIED_NAME_SEPARATOR: char = '@';

/// `<resource_name>@<cluster_namespace>`
#[must_use]
pub fn qualify(resource_name: &str, cluster_namespace: &str) -> String {
    format!("{resource_name}{QUALIFIED_NAME_SEPARATOR}{cluster_namespace}")
}

/// Inverse of [`qualify`]: everything before the first `@`, or the whole input if there is none.
#[must_use]
pub fn unqualify(qualified_name: &str) -> &str {
    qualified_name
        .split_once(QUALIFIED_NAME_SEPARATOR)
        .map_or(qualified_name, |(resource_name, _)| resource_name)
}

/// Opaque handle the catalog assigns to an entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display)]
pub struct CatalogId(String);

impl From<String> for CatalogId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for CatalogId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl CatalogId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// An entity as stored in the external catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntity {
    pub catalog_id: CatalogId,
    pub qualified_name: String,
    pub cluster_namespace: String,
    pub resource_name: String,
    pub attributes: BTreeMap<String, Value>,
}

/// An entity to be created; the catalog assigns the id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCatalogEntity {
    pub type_name: String,
    pub qualified_name: String,
    pub cluster_namespace: String,
    pub resource_name: String,
    pub attributes: BTreeMap<String, Value>,
}

impl NewCatalogEntity {
    /// Catalog representation of a topic.
    #[must_use]
    pub fn topic(
        type_name: &str,
        cluster_namespace: &str,
        topic: &str,
        partitions: i32,
        replication_factor: i16,
    ) -> Self {
        let qualified_name = qualify(topic, cluster_namespace);
        let attributes = BTreeMap::from([
            (
                ATTRIBUTE_QUALIFIED_NAME.to_string(),
                Value::from(qualified_name.clone()),
            ),
            (
                ATTRIBUTE_CLUSTER_NAME.to_string(),
                Value::from(cluster_namespace),
            ),
            (ATTRIBUTE_TOPIC.to_string(), Value::from(topic)),
            (ATTRIBUTE_NAME.to_string(), Value::from(topic)),
            (ATTRIBUTE_DESCRIPTION.to_string(), Value::from(topic)),
            (ATTRIBUTE_URI.to_string(), Value::from(topic)),
            (ATTRIBUTE_PARTITION_COUNT.to_string(), Value::from(partitions)),
            (
                ATTRIBUTE_REPLICATION_FACTOR.to_string(),
                Value::from(replication_factor),
            ),
        ]);

        Self {
            type_name: type_name.to_string(),
            qualified_name,
            cluster_namespace: cluster_namespace.to_string(),
            resource_name: topic.to_string(),
            attributes,
        }
    }
}

/// Narrow view of the external metadata catalog.
///
/// Batch operations return one result per submitted item, in submission order. A
/// whole-call `Err` means nothing is known about the individual items.
#[async_trait]
pub trait CatalogClient: Send + Sync + Debug {
    /// All entities of `type_name` whose `attribute` equals any of `values`, in one call.
    async fn find_by_attribute(
        &self,
        type_name: &str,
        attribute: &str,
        values: &BTreeSet<String>,
    ) -> CatalogResult<Vec<CatalogEntity>>;

    async fn get_by_attribute(
        &self,
        type_name: &str,
        attribute: &str,
        value: &str,
    ) -> CatalogResult<Option<CatalogEntity>>;

    /// Not assumed to be an upsert: creating an existing qualified name may store a duplicate.
    async fn create_entities(
        &self,
        entities: Vec<NewCatalogEntity>,
    ) -> CatalogResult<Vec<CatalogResult<CatalogId>>>;

    async fn delete_by_ids(&self, ids: &[CatalogId]) -> CatalogResult<Vec<CatalogResult<()>>>;

    async fn delete_by_id(&self, id: &CatalogId) -> CatalogResult<()>;

    /// Releases the connection. Called once when the owning auditor shuts down.
    async fn close(&self) {}
}

/// Creates the catalog client an auditor owns between `start` and `close`.
pub trait CatalogConnector: Send + Sync + Debug {
    /// `options` are the auditor options prefixed with `catalog.`, prefix stripped.
    ///
    /// # Errors
    /// Returns an error if the client cannot be constructed from `options`.
    fn connect(&self, options: &HashMap<String, String>) -> CatalogResult<Arc<dyn CatalogClient>>;
}
