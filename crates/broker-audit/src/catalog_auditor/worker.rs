use std::{sync::Arc, time::Duration};

use tokio::{
    sync::mpsc,
    time::{Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    catalog::{
        ATTRIBUTE_QUALIFIED_NAME, CatalogClient, CatalogEntity, CatalogResult, NewCatalogEntity,
        qualify,
    },
    error::RetryableError,
    lister::ResourceLister,
    reconcile::Reconciler,
};

/// Catalog work, executed one item at a time in submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WorkItem {
    Reconcile,
    TopicCreated {
        name: String,
        partitions: i32,
        replication_factor: i16,
    },
    TopicDeleted {
        name: String,
    },
}

/// The single task that talks to the catalog.
#[derive(Debug)]
pub(crate) struct Worker {
    catalog: Arc<dyn CatalogClient>,
    reconciler: Reconciler,
    cluster_namespace: String,
    entity_type: String,
}

impl Worker {
    pub(crate) fn new(
        catalog: Arc<dyn CatalogClient>,
        lister: Arc<dyn ResourceLister>,
        cluster_namespace: &str,
        entity_type: &str,
    ) -> Self {
        Self {
            reconciler: Reconciler::new(
                Arc::clone(&catalog),
                lister,
                cluster_namespace,
                entity_type,
            ),
            catalog,
            cluster_namespace: cluster_namespace.to_string(),
            entity_type: entity_type.to_string(),
        }
    }

    /// Processes work until `cancellation_token` fires or every sender is gone.
    ///
    /// With `reconcile_interval` set, the first pass runs immediately. On cancellation the
    /// queue is closed and already submitted single-topic work is drained; queued passes are
    /// skipped.
    pub(crate) async fn run(
        self,
        mut rx: mpsc::Receiver<WorkItem>,
        cancellation_token: CancellationToken,
        reconcile_interval: Option<Duration>,
    ) {
        let mut ticker = reconcile_interval.map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                biased;
                () = cancellation_token.cancelled() => {
                    tracing::debug!("Catalog worker cancelled");
                    break;
                }
                item = rx.recv() => match item {
                    Some(item) => self.handle(item).await,
                    None => {
                        tracing::debug!("Catalog work queue closed");
                        break;
                    }
                },
                () = tick(ticker.as_mut()) => self.reconcile().await,
            }
        }

        rx.close();
        let mut drained = 0;
        while let Ok(item) = rx.try_recv() {
            if item != WorkItem::Reconcile {
                self.handle(item).await;
                drained += 1;
            }
        }
        tracing::info!("Catalog worker stopped after draining {drained} pending items");
    }

    async fn handle(&self, item: WorkItem) {
        match item {
            WorkItem::Reconcile => self.reconcile().await,
            WorkItem::TopicCreated {
                name,
                partitions,
                replication_factor,
            } => {
                self.create_topic(&name, partitions, replication_factor)
                    .await;
            }
            WorkItem::TopicDeleted { name } => self.delete_topic(&name).await,
        }
    }

    async fn reconcile(&self) {
        match self.reconciler.reconcile().await {
            Ok(_) => {}
            Err(e) if e.should_retry() => {
                tracing::warn!("Reconciliation pass aborted, retrying next cycle: {e}");
            }
            Err(e) => tracing::error!("Reconciliation pass failed: {e}"),
        }
    }

    /// Creates the entity unless one already exists, so redelivered events stay harmless.
    async fn create_topic(&self, name: &str, partitions: i32, replication_factor: i16) {
        let qualified_name = qualify(name, &self.cluster_namespace);
        match self.find_entity(&qualified_name).await {
            Ok(None) => {}
            Ok(Some(entity)) => {
                tracing::debug!(
                    "Catalog entity {} for `{qualified_name}` already exists",
                    entity.catalog_id
                );
                return;
            }
            Err(e) => {
                tracing::warn!("Failed to look up catalog entity `{qualified_name}`: {e}");
                return;
            }
        }

        let entity = NewCatalogEntity::topic(
            &self.entity_type,
            &self.cluster_namespace,
            name,
            partitions,
            replication_factor,
        );

        match self.catalog.create_entities(vec![entity]).await {
            Ok(results) => match results.into_iter().next() {
                Some(Ok(catalog_id)) => {
                    tracing::info!("Created catalog entity {catalog_id} for `{qualified_name}`");
                }
                Some(Err(e)) => {
                    tracing::warn!("Failed to create catalog entity `{qualified_name}`: {e}");
                }
                None => tracing::warn!(
                    "Catalog returned no result for the creation of `{qualified_name}`"
                ),
            },
            Err(e) => {
                tracing::warn!("Failed to create catalog entity `{qualified_name}`: {e}");
            }
        }
    }

    async fn delete_topic(&self, name: &str) {
        let qualified_name = qualify(name, &self.cluster_namespace);

        let entity = match self.find_entity(&qualified_name).await {
            Ok(Some(entity)) => entity,
            Ok(None) => {
                tracing::warn!("No catalog entity `{qualified_name}` to delete");
                return;
            }
            Err(e) => {
                tracing::warn!("Failed to look up catalog entity `{qualified_name}`: {e}");
                return;
            }
        };

        match self.catalog.delete_by_id(&entity.catalog_id).await {
            Ok(()) => tracing::info!(
                "Deleted catalog entity {} for `{qualified_name}`",
                entity.catalog_id
            ),
            Err(e) => {
                tracing::warn!("Failed to delete catalog entity `{qualified_name}`: {e}");
            }
        }
    }

    async fn find_entity(&self, qualified_name: &str) -> CatalogResult<Option<CatalogEntity>> {
        self.catalog
            .get_by_attribute(&self.entity_type, ATTRIBUTE_QUALIFIED_NAME, qualified_name)
            .await
    }
}

async fn tick(ticker: Option<&mut Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use maplit::btreeset;
    use tracing_test::traced_test;

    use super::*;
    use crate::memory::{InMemoryCatalog, InMemoryResourceLister};

    fn worker(catalog: &InMemoryCatalog, lister: &InMemoryResourceLister) -> Worker {
        Worker::new(
            Arc::new(catalog.clone()),
            Arc::new(lister.clone()),
            "prod",
            "kafka_topic",
        )
    }

    #[tokio::test]
    async fn test_single_topic_work_is_applied_in_order() {
        let catalog = InMemoryCatalog::new();
        let lister = InMemoryResourceLister::new();
        let (tx, rx) = mpsc::channel(8);

        tx.send(WorkItem::TopicCreated {
            name: "orders".to_string(),
            partitions: 3,
            replication_factor: 2,
        })
        .await
        .unwrap();
        tx.send(WorkItem::TopicCreated {
            name: "payments".to_string(),
            partitions: 1,
            replication_factor: 1,
        })
        .await
        .unwrap();
        tx.send(WorkItem::TopicDeleted {
            name: "orders".to_string(),
        })
        .await
        .unwrap();
        drop(tx);

        worker(&catalog, &lister)
            .run(rx, CancellationToken::new(), None)
            .await;

        assert_eq!(
            catalog.qualified_names(),
            btreeset! {"payments@prod".to_string()}
        );
        let calls = catalog.calls();
        assert_eq!(calls.create_entities, 2);
        assert_eq!(calls.get_by_attribute, 3);
        assert_eq!(calls.delete_by_id, 1);
        assert_eq!(calls.find_by_attribute, 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_deleting_unknown_topic_is_not_an_error() {
        let catalog = InMemoryCatalog::new();
        let worker = worker(&catalog, &InMemoryResourceLister::new());

        worker.delete_topic("ghost").await;

        assert_eq!(catalog.calls().get_by_attribute, 1);
        assert_eq!(catalog.calls().delete_by_id, 0);
        assert!(logs_contain("No catalog entity `ghost@prod` to delete"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failed_creation_is_logged() {
        let catalog = InMemoryCatalog::new();
        catalog.reject_creation_of("payments@prod");
        let worker = worker(&catalog, &InMemoryResourceLister::new());
        worker.create_topic("payments", 1, 1).await;
        assert!(logs_contain("Failed to create catalog entity `payments@prod`"));

        catalog.set_unavailable(true);
        worker.create_topic("orders", 1, 1).await;
        worker.reconcile().await;

        assert!(logs_contain("Failed to look up catalog entity `orders@prod`"));
        assert!(logs_contain("retrying next cycle"));
        assert!(catalog.qualified_names().is_empty());
    }

    #[tokio::test]
    async fn test_redelivered_creation_does_not_duplicate() {
        let catalog = InMemoryCatalog::new();
        catalog.set_append_only(true);
        let worker = worker(&catalog, &InMemoryResourceLister::new());

        worker.create_topic("orders", 3, 2).await;
        worker.create_topic("orders", 3, 2).await;

        assert_eq!(catalog.entities().len(), 1);
        assert_eq!(catalog.calls().create_entities, 1);
    }

    #[tokio::test]
    async fn test_interval_runs_first_pass_immediately() {
        let catalog = InMemoryCatalog::new();
        let lister = InMemoryResourceLister::with_topics(["orders"]);
        let (tx, rx) = mpsc::channel(8);
        let cancellation_token = CancellationToken::new();

        let handle = tokio::spawn(worker(&catalog, &lister).run(
            rx,
            cancellation_token.clone(),
            Some(Duration::from_secs(3600)),
        ));
        tokio::time::timeout(Duration::from_secs(5), async {
            while catalog.qualified_names().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        cancellation_token.cancel();
        handle.await.unwrap();
        drop(tx);
        assert_eq!(catalog.qualified_names(), btreeset! {"orders@prod".to_string()});
        assert_eq!(lister.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_drains_single_topic_work_only() {
        let catalog = InMemoryCatalog::new();
        let lister = InMemoryResourceLister::with_topics(["orders"]);
        let (tx, rx) = mpsc::channel(8);
        let cancellation_token = CancellationToken::new();

        tx.send(WorkItem::Reconcile).await.unwrap();
        tx.send(WorkItem::TopicCreated {
            name: "payments".to_string(),
            partitions: 1,
            replication_factor: 1,
        })
        .await
        .unwrap();
        cancellation_token.cancel();

        worker(&catalog, &lister)
            .run(rx, cancellation_token, None)
            .await;

        assert_eq!(catalog.qualified_names(), btreeset! {"payments@prod".to_string()});
        assert_eq!(lister.list_calls(), 0);
        assert!(tx.is_closed());
    }
}
