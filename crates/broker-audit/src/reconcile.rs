//! Converges the catalog's view of a cluster namespace to the broker's live resources.
//!
//! A pass lists the live resources, fetches every catalog entity of the namespace with a
//! single lookup and applies the existence diff: deletions first, then creations. Attribute
//! drift on entities present on both sides is not reconciled.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use itertools::{EitherOrBoth, Itertools};

use crate::{
    catalog::{
        ATTRIBUTE_CLUSTER_NAME, CatalogClient, CatalogEntity, CatalogId, CatalogResult,
        NewCatalogEntity, qualify,
    },
    error::{BatchItemError, CatalogError, ReconcileError},
    lister::ResourceLister,
};

/// Catalog mutations needed to converge one namespace.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    /// Catalog entities whose resource no longer exists.
    pub to_delete: Vec<CatalogEntity>,
    /// Live resource names without a catalog entity.
    pub to_create: BTreeSet<String>,
}

impl ReconcilePlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_delete.is_empty() && self.to_create.is_empty()
    }
}

/// Existence diff between the live resources and the catalog entities of `cluster_namespace`.
///
/// Entities are matched by qualified name only. If several entities share a desired
/// qualified name, the first one is kept and the others are deleted.
#[must_use]
pub fn plan(
    live_resources: &BTreeSet<String>,
    cluster_namespace: &str,
    actual: Vec<CatalogEntity>,
) -> ReconcilePlan {
    let desired: BTreeMap<String, &String> = live_resources
        .iter()
        .map(|name| (qualify(name, cluster_namespace), name))
        .collect();

    let mut present = BTreeSet::new();
    let to_delete = actual
        .into_iter()
        .filter(|entity| {
            !desired.contains_key(&entity.qualified_name)
                || !present.insert(entity.qualified_name.clone())
        })
        .collect();

    let to_create = desired
        .into_iter()
        .filter(|(qualified_name, _)| !present.contains(qualified_name))
        .map(|(_, name)| name.clone())
        .collect();

    ReconcilePlan {
        to_delete,
        to_create,
    }
}

/// Outcome of one item of a batch. Siblings are independent of each other.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemOutcome {
    pub qualified_name: String,
    pub result: Result<CatalogId, BatchItemError>,
}

impl ItemOutcome {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub deleted: Vec<ItemOutcome>,
    pub created: Vec<ItemOutcome>,
}

impl ReconcileReport {
    /// True if the pass found nothing to do.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.deleted.is_empty() && self.created.is_empty()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.deleted
            .iter()
            .chain(self.created.iter())
            .filter(|outcome| !outcome.is_ok())
    }

    /// Qualified names of the entities that were created successfully.
    #[must_use]
    pub fn created_names(&self) -> BTreeSet<&str> {
        succeeded(&self.created)
    }

    /// Qualified names of the entities that were deleted successfully.
    #[must_use]
    pub fn deleted_names(&self) -> BTreeSet<&str> {
        succeeded(&self.deleted)
    }
}

fn succeeded(outcomes: &[ItemOutcome]) -> BTreeSet<&str> {
    outcomes
        .iter()
        .filter(|outcome| outcome.is_ok())
        .map(|outcome| outcome.qualified_name.as_str())
        .collect()
}

/// Runs reconciliation passes for one cluster namespace.
#[derive(Debug, Clone)]
pub struct Reconciler {
    catalog: Arc<dyn CatalogClient>,
    lister: Arc<dyn ResourceLister>,
    cluster_namespace: String,
    entity_type: String,
}

impl Reconciler {
    #[must_use]
    pub fn new(
        catalog: Arc<dyn CatalogClient>,
        lister: Arc<dyn ResourceLister>,
        cluster_namespace: impl Into<String>,
        entity_type: impl Into<String>,
    ) -> Self {
        Self {
            catalog,
            lister,
            cluster_namespace: cluster_namespace.into(),
            entity_type: entity_type.into(),
        }
    }

    #[must_use]
    pub fn cluster_namespace(&self) -> &str {
        &self.cluster_namespace
    }

    /// Runs one pass.
    ///
    /// # Errors
    /// Fails if the live resources cannot be listed or the catalog lookup fails. Nothing
    /// has been mutated in that case. Failures of individual creations or deletions are
    /// reported per item in the returned [`ReconcileReport`].
    pub async fn reconcile(&self) -> Result<ReconcileReport, ReconcileError> {
        let live_resources = self.lister.list_live_resources().await?;
        let actual = self
            .catalog
            .find_by_attribute(
                &self.entity_type,
                ATTRIBUTE_CLUSTER_NAME,
                &BTreeSet::from([self.cluster_namespace.clone()]),
            )
            .await?;

        let plan = plan(&live_resources, &self.cluster_namespace, actual);
        if plan.is_empty() {
            tracing::debug!(
                "Catalog is in sync with {} live resources of namespace {}",
                live_resources.len(),
                self.cluster_namespace
            );
            return Ok(ReconcileReport::default());
        }

        tracing::info!(
            "Reconciling namespace {}: deleting [{}], creating [{}]",
            self.cluster_namespace,
            plan.to_delete
                .iter()
                .map(|entity| &entity.qualified_name)
                .join(", "),
            plan.to_create.iter().join(", ")
        );

        let report = ReconcileReport {
            deleted: self.delete(plan.to_delete).await,
            created: self.create(plan.to_create).await,
        };

        for failure in report.failures() {
            if let Err(e) = &failure.result {
                tracing::warn!(
                    "Reconciliation of `{}` failed: {e}",
                    failure.qualified_name
                );
            }
        }
        tracing::info!(
            "Reconciliation of namespace {} finished: {} deleted, {} created, {} failed",
            self.cluster_namespace,
            report.deleted_names().len(),
            report.created_names().len(),
            report.failures().count()
        );

        Ok(report)
    }

    async fn delete(&self, entities: Vec<CatalogEntity>) -> Vec<ItemOutcome> {
        if entities.is_empty() {
            return Vec::new();
        }
        let ids = entities
            .iter()
            .map(|entity| entity.catalog_id.clone())
            .collect_vec();
        let results = self.catalog.delete_by_ids(&ids).await;

        per_item(entities, results, |entity| entity.qualified_name.clone())
            .into_iter()
            .map(|(entity, result)| ItemOutcome {
                qualified_name: entity.qualified_name,
                result: result.map(|()| entity.catalog_id).map_err(Into::into),
            })
            .collect()
    }

    async fn create(&self, names: BTreeSet<String>) -> Vec<ItemOutcome> {
        if names.is_empty() {
            return Vec::new();
        }

        let descriptions = match self.lister.describe(&names).await {
            Ok(descriptions) => descriptions,
            Err(e) => {
                return names
                    .iter()
                    .map(|name| ItemOutcome {
                        qualified_name: qualify(name, &self.cluster_namespace),
                        result: Err(e.clone().into()),
                    })
                    .collect();
            }
        };

        let (entities, vanished): (Vec<_>, Vec<_>) =
            names.into_iter().partition_map(|name| match descriptions.get(&name) {
                Some(description) => itertools::Either::Left(NewCatalogEntity::topic(
                    &self.entity_type,
                    &self.cluster_namespace,
                    &name,
                    description.partition_count,
                    description.replication_factor,
                )),
                None => itertools::Either::Right(ItemOutcome {
                    qualified_name: qualify(&name, &self.cluster_namespace),
                    result: Err(BatchItemError::Vanished(name)),
                }),
            });

        let mut outcomes = vanished;
        if !entities.is_empty() {
            let results = self.catalog.create_entities(entities.clone()).await;
            outcomes.extend(
                per_item(entities, results, |entity| entity.qualified_name.clone())
                    .into_iter()
                    .map(|(entity, result)| ItemOutcome {
                        qualified_name: entity.qualified_name,
                        result: result.map_err(Into::into),
                    }),
            );
        }
        outcomes.sort_by(|a, b| a.qualified_name.cmp(&b.qualified_name));
        outcomes
    }
}

/// Pairs submitted items with their per-item results.
///
/// A failed call fails every item with the same error. Items without a result fail with
/// [`CatalogError::MissingResult`].
fn per_item<I, T>(
    items: Vec<I>,
    results: CatalogResult<Vec<CatalogResult<T>>>,
    qualified_name: impl Fn(&I) -> String,
) -> Vec<(I, CatalogResult<T>)> {
    let results = match results {
        Ok(results) => results,
        Err(e) => {
            return items
                .into_iter()
                .map(|item| (item, Err(e.clone())))
                .collect();
        }
    };

    let submitted = items.len();
    let received = results.len();
    if submitted != received {
        tracing::warn!(
            "Catalog returned {received} results for a batch of {submitted} items"
        );
    }

    items
        .into_iter()
        .zip_longest(results)
        .filter_map(|pair| match pair {
            EitherOrBoth::Both(item, result) => Some((item, result)),
            EitherOrBoth::Left(item) => {
                let missing = CatalogError::MissingResult(qualified_name(&item));
                Some((item, Err(missing)))
            }
            EitherOrBoth::Right(_) => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use maplit::btreeset;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        error::ListerError,
        memory::{CatalogCalls, InMemoryCatalog, InMemoryResourceLister},
    };

    const NAMESPACE: &str = "prod";
    const ENTITY_TYPE: &str = "kafka_topic";

    fn entity(name: &str, id: &str) -> CatalogEntity {
        let new = NewCatalogEntity::topic(ENTITY_TYPE, NAMESPACE, name, 1, 1);
        CatalogEntity {
            catalog_id: CatalogId::from(id),
            qualified_name: new.qualified_name,
            cluster_namespace: new.cluster_namespace,
            resource_name: new.resource_name,
            attributes: new.attributes,
        }
    }

    fn reconciler(catalog: &InMemoryCatalog, lister: &InMemoryResourceLister) -> Reconciler {
        Reconciler::new(
            Arc::new(catalog.clone()),
            Arc::new(lister.clone()),
            NAMESPACE,
            ENTITY_TYPE,
        )
    }

    fn seed(catalog: &InMemoryCatalog, names: &[&str]) {
        for name in names {
            catalog.insert(NewCatalogEntity::topic(ENTITY_TYPE, NAMESPACE, name, 1, 1));
        }
    }

    #[test]
    fn test_plan_diff() {
        let live = btreeset! {"a".to_string(), "b".to_string(), "c".to_string()};
        let actual = vec![entity("b", "1"), entity("c", "2"), entity("d", "3")];

        let plan = plan(&live, NAMESPACE, actual);

        assert_eq!(plan.to_create, btreeset! {"a".to_string()});
        assert_eq!(plan.to_delete, vec![entity("d", "3")]);
    }

    #[test]
    fn test_plan_deletes_duplicate_entities() {
        let live = btreeset! {"a".to_string()};
        let actual = vec![entity("a", "guid-1"), entity("a", "guid-2"), entity("a", "guid-3")];

        let plan = plan(&live, NAMESPACE, actual);

        assert!(plan.to_create.is_empty());
        assert_eq!(
            plan.to_delete,
            vec![entity("a", "guid-2"), entity("a", "guid-3")]
        );
    }

    #[tokio::test]
    async fn test_reconcile_repairs_duplicates_in_append_only_catalog() {
        let catalog = InMemoryCatalog::new();
        catalog.set_append_only(true);
        seed(&catalog, &["a", "a", "gone"]);
        let lister = InMemoryResourceLister::with_topics(["a"]);
        let reconciler = reconciler(&catalog, &lister);

        let report = reconciler.reconcile().await.unwrap();

        assert_eq!(report.deleted_names(), btreeset! {"a@prod", "gone@prod"});
        assert!(report.created.is_empty());
        assert_eq!(catalog.entities().len(), 1);
        assert_eq!(catalog.qualified_names(), btreeset! {"a@prod".to_string()});
        assert!(reconciler.reconcile().await.unwrap().is_noop());
    }

    #[test]
    fn test_plan_in_sync_is_empty() {
        let live = btreeset! {"b".to_string()};
        assert!(plan(&live, NAMESPACE, vec![entity("b", "1")]).is_empty());
        assert!(plan(&BTreeSet::new(), NAMESPACE, Vec::new()).is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_converges_and_is_idempotent() {
        let catalog = InMemoryCatalog::new();
        seed(&catalog, &["b", "c", "d"]);
        let lister = InMemoryResourceLister::with_topics(["a", "b", "c"]);
        lister.create_topic("a", 6, 3);
        let reconciler = reconciler(&catalog, &lister);

        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.created_names(), btreeset! {"a@prod"});
        assert_eq!(report.deleted_names(), btreeset! {"d@prod"});
        assert_eq!(report.failures().count(), 0);
        assert_eq!(
            catalog.qualified_names(),
            btreeset! {"a@prod".to_string(), "b@prod".to_string(), "c@prod".to_string()}
        );
        let created = catalog.get("a@prod").unwrap();
        assert_eq!(created.attributes["partitionCount"], serde_json::json!(6));
        assert_eq!(created.attributes["replicationFactor"], serde_json::json!(3));

        let mutations = catalog.calls().mutations();
        let report = reconciler.reconcile().await.unwrap();
        assert!(report.is_noop());
        assert_eq!(catalog.calls().mutations(), mutations);
    }

    #[tokio::test]
    async fn test_reconcile_uses_a_single_lookup() {
        let catalog = InMemoryCatalog::new();
        seed(&catalog, &["x", "y"]);
        let lister = InMemoryResourceLister::with_topics(["a", "b", "c", "d"]);

        reconciler(&catalog, &lister).reconcile().await.unwrap();

        let calls = catalog.calls();
        assert_eq!(calls.find_by_attribute, 1);
        assert_eq!(calls.get_by_attribute, 0);
        assert_eq!(calls.delete_by_ids, 1);
        assert_eq!(calls.create_entities, 1);
        assert_eq!(lister.describe_calls(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_ignores_other_namespaces() {
        let catalog = InMemoryCatalog::new();
        catalog.insert(NewCatalogEntity::topic(ENTITY_TYPE, "staging", "a", 1, 1));
        let lister = InMemoryResourceLister::with_topics(["a"]);

        let report = reconciler(&catalog, &lister).reconcile().await.unwrap();

        assert_eq!(report.created_names(), btreeset! {"a@prod"});
        assert!(report.deleted.is_empty());
        assert_eq!(
            catalog.qualified_names(),
            btreeset! {"a@prod".to_string(), "a@staging".to_string()}
        );
    }

    #[tokio::test]
    async fn test_catalog_unavailable_aborts_pass() {
        let catalog = InMemoryCatalog::new();
        seed(&catalog, &["d"]);
        catalog.set_unavailable(true);
        let lister = InMemoryResourceLister::with_topics(["a"]);

        let err = reconciler(&catalog, &lister).reconcile().await.unwrap_err();

        assert!(matches!(
            err,
            ReconcileError::Catalog(CatalogError::ServiceUnavailable(_))
        ));
        assert_eq!(catalog.calls().mutations(), 0);
        assert_eq!(catalog.qualified_names(), btreeset! {"d@prod".to_string()});
    }

    #[tokio::test]
    async fn test_lister_unavailable_aborts_pass() {
        let catalog = InMemoryCatalog::new();
        seed(&catalog, &["d"]);
        let lister = InMemoryResourceLister::with_topics(["a"]);
        lister.set_unavailable(true);

        let err = reconciler(&catalog, &lister).reconcile().await.unwrap_err();

        assert!(matches!(err, ReconcileError::Lister(ListerError::Unavailable(_))));
        assert_eq!(catalog.calls(), CatalogCalls::default());
    }

    #[tokio::test]
    async fn test_failed_creation_does_not_affect_siblings() {
        let catalog = InMemoryCatalog::new();
        catalog.reject_creation_of("b@prod");
        let lister = InMemoryResourceLister::with_topics(["a", "b", "c"]);
        let reconciler = reconciler(&catalog, &lister);

        let report = reconciler.reconcile().await.unwrap();

        assert_eq!(report.created_names(), btreeset! {"a@prod", "c@prod"});
        let failures = report.failures().collect_vec();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].qualified_name, "b@prod");
        assert!(matches!(
            failures[0].result,
            Err(BatchItemError::Catalog(CatalogError::Rejected { .. }))
        ));

        // The next pass retries only what is still missing.
        catalog.clear_rejections();
        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.created_names(), btreeset! {"b@prod"});
        assert!(report.deleted.is_empty());
    }

    #[tokio::test]
    async fn test_failed_deletion_is_reported_per_item() {
        let catalog = InMemoryCatalog::new();
        let lister = InMemoryResourceLister::with_topics(["a"]);
        let stale = vec![entity("gone", "guid-404")];

        let reconciler = reconciler(&catalog, &lister);
        let deleted = reconciler.delete(stale).await;
        let created = reconciler.create(btreeset! {"a".to_string()}).await;

        assert_eq!(deleted.len(), 1);
        assert!(matches!(
            deleted[0].result,
            Err(BatchItemError::Catalog(CatalogError::NotFound(_)))
        ));
        assert_eq!(succeeded(&created), btreeset! {"a@prod"});
    }

    #[tokio::test]
    async fn test_vanished_resource_is_reported() {
        let catalog = InMemoryCatalog::new();
        let lister = InMemoryResourceLister::with_topics(["a"]);

        let outcomes = reconciler(&catalog, &lister)
            .create(btreeset! {"a".to_string(), "gone".to_string()})
            .await;

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].is_ok());
        assert_eq!(
            outcomes[1],
            ItemOutcome {
                qualified_name: "gone@prod".to_string(),
                result: Err(BatchItemError::Vanished("gone".to_string())),
            }
        );
        assert_eq!(catalog.qualified_names(), btreeset! {"a@prod".to_string()});
    }

    #[test]
    fn test_per_item_missing_results() {
        let items = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let paired = per_item(items, Ok(vec![Ok(1), Err(CatalogError::NotFound("b".into()))]), |s| {
            s.clone()
        });

        assert_eq!(
            paired,
            vec![
                ("a".to_string(), Ok(1)),
                ("b".to_string(), Err(CatalogError::NotFound("b".into()))),
                ("c".to_string(), Err(CatalogError::MissingResult("c".into()))),
            ]
        );
    }

    #[test]
    fn test_per_item_whole_call_failure() {
        let err = CatalogError::PermissionDenied("nope".to_string());
        let paired = per_item(vec![1, 2], Err::<Vec<CatalogResult<()>>, _>(err.clone()), |i| {
            i.to_string()
        });

        assert_eq!(paired, vec![(1, Err(err.clone())), (2, Err(err))]);
    }
}
