//! In-memory collaborators for tests and local experiments.
//!
//! Both types are cheap handles around shared state: clones observe and mutate the same
//! catalog or topic listing, so a test can keep one handle while the auditor owns another.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    catalog::{
        CatalogClient, CatalogConnector, CatalogEntity, CatalogId, CatalogResult, NewCatalogEntity,
        ATTRIBUTE_QUALIFIED_NAME,
    },
    error::{CatalogError, ListerError},
    lister::{ListerResult, ResourceLister, ResourceListerConnector, TopicDescription},
};

/// Number of calls received per catalog operation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CatalogCalls {
    pub find_by_attribute: usize,
    pub get_by_attribute: usize,
    pub create_entities: usize,
    pub delete_by_ids: usize,
    pub delete_by_id: usize,
}

impl CatalogCalls {
    #[must_use]
    pub fn mutations(&self) -> usize {
        self.create_entities + self.delete_by_ids + self.delete_by_id
    }
}

#[derive(Debug, Default)]
struct CatalogState {
    entities: BTreeMap<CatalogId, (String, CatalogEntity)>,
    next_id: u64,
    unavailable: bool,
    rejected: BTreeSet<String>,
    append_only: bool,
    calls: CatalogCalls,
    connect_options: Option<HashMap<String, String>>,
    closed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    state: Arc<Mutex<CatalogState>>,
}

impl InMemoryCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, CatalogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `entity` without counting it as a client call.
    pub fn insert(&self, entity: NewCatalogEntity) -> CatalogId {
        self.state().upsert(entity)
    }

    #[must_use]
    pub fn entities(&self) -> Vec<CatalogEntity> {
        self.state()
            .entities
            .values()
            .map(|(_, entity)| entity.clone())
            .collect()
    }

    /// Looks up an entity by qualified name without counting a client call.
    #[must_use]
    pub fn get(&self, qualified_name: &str) -> Option<CatalogEntity> {
        self.state()
            .entities
            .values()
            .map(|(_, entity)| entity)
            .find(|entity| {
                entity
                    .attributes
                    .get(ATTRIBUTE_QUALIFIED_NAME)
                    .and_then(Value::as_str)
                    == Some(qualified_name)
            })
            .cloned()
    }

    #[must_use]
    pub fn qualified_names(&self) -> BTreeSet<String> {
        self.state()
            .entities
            .values()
            .map(|(_, entity)| entity.qualified_name.clone())
            .collect()
    }

    /// While set, every call fails with [`CatalogError::ServiceUnavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// While set, every creation stores a new entity, even if one with the same qualified
    /// name exists. Mimics catalogs without upsert semantics.
    pub fn set_append_only(&self, append_only: bool) {
        self.state().append_only = append_only;
    }

    /// Creation of `qualified_name` fails with [`CatalogError::Rejected`] until cleared.
    pub fn reject_creation_of(&self, qualified_name: impl Into<String>) {
        self.state().rejected.insert(qualified_name.into());
    }

    pub fn clear_rejections(&self) {
        self.state().rejected.clear();
    }

    #[must_use]
    pub fn calls(&self) -> CatalogCalls {
        self.state().calls
    }

    #[must_use]
    pub fn connect_options(&self) -> Option<HashMap<String, String>> {
        self.state().connect_options.clone()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

impl CatalogState {
    fn check_available(&self) -> CatalogResult<()> {
        if self.unavailable {
            return Err(CatalogError::ServiceUnavailable(
                "in-memory catalog is marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    /// Unless append-only, entities are unique by qualified name and creating an existing one
    /// updates it in place.
    fn upsert(&mut self, new: NewCatalogEntity) -> CatalogId {
        let existing = (!self.append_only)
            .then(|| self.entities.iter().find(|(_, (type_name, entity))| {
                *type_name == new.type_name && entity.qualified_name == new.qualified_name
            }))
            .flatten()
            .map(|(id, _)| id.clone());

        let catalog_id = existing.unwrap_or_else(|| {
            self.next_id += 1;
            CatalogId::from(format!("guid-{}", self.next_id))
        });
        let entity = CatalogEntity {
            catalog_id: catalog_id.clone(),
            qualified_name: new.qualified_name,
            cluster_namespace: new.cluster_namespace,
            resource_name: new.resource_name,
            attributes: new.attributes,
        };
        self.entities
            .insert(catalog_id.clone(), (new.type_name, entity));
        catalog_id
    }

    fn matching<'a>(
        &'a self,
        type_name: &'a str,
        attribute: &'a str,
        accept: impl Fn(&str) -> bool + 'a,
    ) -> impl Iterator<Item = &'a CatalogEntity> + 'a {
        self.entities
            .values()
            .filter(move |(entity_type, _)| entity_type == type_name)
            .map(|(_, entity)| entity)
            .filter(move |entity| {
                entity
                    .attributes
                    .get(attribute)
                    .and_then(Value::as_str)
                    .is_some_and(&accept)
            })
    }

    fn remove(&mut self, id: &CatalogId) -> CatalogResult<()> {
        self.entities
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))
    }
}

#[async_trait]
impl CatalogClient for InMemoryCatalog {
    async fn find_by_attribute(
        &self,
        type_name: &str,
        attribute: &str,
        values: &BTreeSet<String>,
    ) -> CatalogResult<Vec<CatalogEntity>> {
        let mut state = self.state();
        state.calls.find_by_attribute += 1;
        state.check_available()?;
        Ok(state
            .matching(type_name, attribute, |value| values.contains(value))
            .cloned()
            .collect())
    }

    async fn get_by_attribute(
        &self,
        type_name: &str,
        attribute: &str,
        value: &str,
    ) -> CatalogResult<Option<CatalogEntity>> {
        let mut state = self.state();
        state.calls.get_by_attribute += 1;
        state.check_available()?;
        Ok(state
            .matching(type_name, attribute, |candidate| candidate == value)
            .next()
            .cloned())
    }

    async fn create_entities(
        &self,
        entities: Vec<NewCatalogEntity>,
    ) -> CatalogResult<Vec<CatalogResult<CatalogId>>> {
        let mut state = self.state();
        state.calls.create_entities += 1;
        state.check_available()?;
        Ok(entities
            .into_iter()
            .map(|entity| {
                if state.rejected.contains(&entity.qualified_name) {
                    Err(CatalogError::Rejected {
                        qualified_name: entity.qualified_name,
                        reason: "rejected by test configuration".to_string(),
                    })
                } else {
                    Ok(state.upsert(entity))
                }
            })
            .collect())
    }

    async fn delete_by_ids(&self, ids: &[CatalogId]) -> CatalogResult<Vec<CatalogResult<()>>> {
        let mut state = self.state();
        state.calls.delete_by_ids += 1;
        state.check_available()?;
        Ok(ids.iter().map(|id| state.remove(id)).collect())
    }

    async fn delete_by_id(&self, id: &CatalogId) -> CatalogResult<()> {
        let mut state = self.state();
        state.calls.delete_by_id += 1;
        state.check_available()?;
        state.remove(id)
    }

    async fn close(&self) {
        self.state().closed = true;
    }
}

impl CatalogConnector for InMemoryCatalog {
    fn connect(&self, options: &HashMap<String, String>) -> CatalogResult<Arc<dyn CatalogClient>> {
        let mut state = self.state();
        state.connect_options = Some(options.clone());
        state.closed = false;
        drop(state);
        Ok(Arc::new(self.clone()))
    }
}

#[derive(Debug, Default)]
struct ListerState {
    topics: BTreeMap<String, TopicDescription>,
    unavailable: bool,
    list_calls: usize,
    describe_calls: usize,
    connect_options: Option<HashMap<String, String>>,
    closed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryResourceLister {
    state: Arc<Mutex<ListerState>>,
}

impl InMemoryResourceLister {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_topics<'a>(topics: impl IntoIterator<Item = &'a str>) -> Self {
        let lister = Self::new();
        for topic in topics {
            lister.create_topic(topic, 1, 1);
        }
        lister
    }

    fn state(&self) -> MutexGuard<'_, ListerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create_topic(&self, name: &str, partition_count: i32, replication_factor: i16) {
        self.state().topics.insert(
            name.to_string(),
            TopicDescription {
                partition_count,
                replication_factor,
            },
        );
    }

    pub fn delete_topic(&self, name: &str) {
        self.state().topics.remove(name);
    }

    /// While set, every call fails with [`ListerError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    #[must_use]
    pub fn list_calls(&self) -> usize {
        self.state().list_calls
    }

    #[must_use]
    pub fn describe_calls(&self) -> usize {
        self.state().describe_calls
    }

    #[must_use]
    pub fn connect_options(&self) -> Option<HashMap<String, String>> {
        self.state().connect_options.clone()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

impl ListerState {
    fn check_available(&self) -> ListerResult<()> {
        if self.unavailable {
            return Err(ListerError::Unavailable(
                "in-memory lister is marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceLister for InMemoryResourceLister {
    async fn list_live_resources(&self) -> ListerResult<BTreeSet<String>> {
        let mut state = self.state();
        state.list_calls += 1;
        state.check_available()?;
        Ok(state.topics.keys().cloned().collect())
    }

    async fn describe(
        &self,
        names: &BTreeSet<String>,
    ) -> ListerResult<HashMap<String, TopicDescription>> {
        let mut state = self.state();
        state.describe_calls += 1;
        state.check_available()?;
        Ok(names
            .iter()
            .filter_map(|name| {
                state
                    .topics
                    .get(name)
                    .map(|description| (name.clone(), *description))
            })
            .collect())
    }

    async fn close(&self) {
        self.state().closed = true;
    }
}

impl ResourceListerConnector for InMemoryResourceLister {
    fn connect(&self, options: &HashMap<String, String>) -> ListerResult<Arc<dyn ResourceLister>> {
        let mut state = self.state();
        state.connect_options = Some(options.clone());
        state.closed = false;
        drop(state);
        Ok(Arc::new(self.clone()))
    }
}
