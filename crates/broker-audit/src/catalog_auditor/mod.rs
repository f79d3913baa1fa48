//! Mirrors topic lifecycle into an external metadata catalog.
//!
//! Request threads call [`Auditor::audit`], which only does in-memory work: produce events
//! are recorded in the [`ActivityCache`], topic creations and deletions are queued for the
//! background worker. The worker owns the catalog and admin connections, applies queued
//! single-topic mutations in order and runs a full reconciliation pass on a fixed interval
//! to repair anything that was missed.

mod worker;

use std::{
    collections::{BTreeSet, HashMap},
    fmt::Display,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use async_trait::async_trait;
use tokio::{
    runtime::Handle,
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use worker::{WorkItem, Worker};

use crate::{
    auditor::{Auditor, AuditorState},
    cache::{ActivityCache, RecordOutcome},
    catalog::{CatalogClient, CatalogConnector},
    config::{AuditorConfig, AuditorOptions},
    error::AuditorError,
    events::{AuditEvent, AuditEventPayload, RequestContext, TopicPartition},
    lister::{ResourceLister, ResourceListerConnector},
    logging::{AuditContextData, AuditRecord, records::NewProducerObservedRecord},
};

#[derive(Debug)]
enum State {
    Unconfigured,
    Configured(AuditorOptions),
    Started(Running),
    Closed,
}

#[derive(Debug)]
struct Running {
    config: AuditorConfig,
    cache: ActivityCache<TopicPartition>,
    tx: mpsc::Sender<WorkItem>,
    cancellation_token: CancellationToken,
    worker: JoinHandle<()>,
    catalog: Arc<dyn CatalogClient>,
    lister: Arc<dyn ResourceLister>,
}

/// Auditor that keeps a metadata catalog in sync with the broker's topics.
#[derive(Debug)]
pub struct CatalogAuditor {
    catalog_connector: Arc<dyn CatalogConnector>,
    lister_connector: Arc<dyn ResourceListerConnector>,
    state: RwLock<State>,
}

impl Display for CatalogAuditor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CatalogAuditor")
    }
}

impl CatalogAuditor {
    #[must_use]
    pub fn new(
        catalog_connector: Arc<dyn CatalogConnector>,
        lister_connector: Arc<dyn ResourceListerConnector>,
    ) -> Self {
        Self {
            catalog_connector,
            lister_connector,
            state: RwLock::new(State::Unconfigured),
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_running<T>(
        &self,
        f: impl FnOnce(&Running) -> Result<T, AuditorError>,
    ) -> Result<T, AuditorError> {
        match &*self.read_state() {
            State::Started(running) => f(running),
            State::Unconfigured | State::Configured(_) => Err(AuditorError::NotStarted),
            State::Closed => Err(AuditorError::Closed),
        }
    }

    /// The cache of recently producing clients. Clones share the same entries.
    ///
    /// # Errors
    /// Fails unless the auditor is started.
    pub fn activity_cache(&self) -> Result<ActivityCache<TopicPartition>, AuditorError> {
        self.with_running(|running| Ok(running.cache.clone()))
    }

    /// Queues a full reconciliation pass on the worker.
    ///
    /// # Errors
    /// Fails unless the auditor is started. A full queue is logged, not returned.
    pub fn request_reconciliation(&self) -> Result<(), AuditorError> {
        self.with_running(|running| {
            running.submit(WorkItem::Reconcile);
            Ok(())
        })
    }

    /// Records that the client of `request_context` wrote to `partitions`.
    ///
    /// Returns `true` if the client was not in the activity window, in which case a
    /// `new_producer_observed` audit record is logged.
    ///
    /// # Errors
    /// Fails unless the auditor is started.
    pub fn observe_produce(
        &self,
        request_context: &RequestContext,
        partitions: &BTreeSet<TopicPartition>,
    ) -> Result<bool, AuditorError> {
        self.with_running(|running| Ok(running.observe_produce(request_context, partitions)))
    }

    fn connect(
        &self,
        options: &AuditorOptions,
    ) -> Result<(Arc<dyn CatalogClient>, Arc<dyn ResourceLister>), AuditorError> {
        let catalog = self
            .catalog_connector
            .connect(&options.catalog)
            .map_err(AuditorError::CatalogConnect)?;
        let lister = self
            .lister_connector
            .connect(&options.admin)
            .map_err(AuditorError::ListerConnect)?;
        Ok((catalog, lister))
    }

    fn launch(
        &self,
        runtime: &Handle,
        options: &AuditorOptions,
        catalog: Arc<dyn CatalogClient>,
        lister: Arc<dyn ResourceLister>,
    ) -> Running {
        let config = options.config.clone();
        let (tx, rx) = mpsc::channel(config.queue.capacity);
        let cancellation_token = CancellationToken::new();
        let worker = Worker::new(
            Arc::clone(&catalog),
            Arc::clone(&lister),
            config.cluster_namespace(),
            &config.entity_type,
        );
        let span = tracing::info_span!(
            "catalog_auditor",
            cluster_namespace = %config.cluster_namespace()
        );
        let worker = runtime.spawn(
            worker
                .run(rx, cancellation_token.clone(), config.reconcile_interval())
                .instrument(span),
        );

        tracing::info!(
            "{self} started for namespace {} with entity type {}",
            config.cluster_namespace(),
            config.entity_type
        );

        Running {
            cache: ActivityCache::new(config.cache_settings()),
            config,
            tx,
            cancellation_token,
            worker,
            catalog,
            lister,
        }
    }
}

/// Closes connections that lost a race against a concurrent `start`, `configure` or `close`.
fn release_in_background(
    runtime: &Handle,
    catalog: Arc<dyn CatalogClient>,
    lister: Arc<dyn ResourceLister>,
) {
    runtime.spawn(async move {
        catalog.close().await;
        lister.close().await;
    });
}

impl Running {
    fn submit(&self, item: WorkItem) {
        match self.tx.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(item)) => tracing::warn!(
                "Catalog work queue is full ({} items), dropping {item:?}",
                self.config.queue.capacity
            ),
            Err(TrySendError::Closed(item)) => {
                tracing::warn!("Catalog worker is gone, dropping {item:?}");
            }
        }
    }

    fn observe_produce<D: AuditContextData>(
        &self,
        ctx: &D,
        partitions: &BTreeSet<TopicPartition>,
    ) -> bool {
        let client_id = &ctx.request_context().client_id;
        let mut new_client = false;
        for partition in partitions {
            if self.cache.record(client_id, partition.clone()) == RecordOutcome::NewClient {
                new_client = true;
            }
        }
        if new_client {
            NewProducerObservedRecord {
                producer: client_id.clone(),
            }
            .log(ctx);
        }
        new_client
    }

    fn dispatch(&self, event: &AuditEvent) {
        match event.payload() {
            AuditEventPayload::TopicCreated {
                name,
                partitions,
                replication_factor,
            } => self.submit(WorkItem::TopicCreated {
                name: name.clone(),
                partitions: *partitions,
                replication_factor: *replication_factor,
            }),
            AuditEventPayload::TopicDeleted { name } => {
                self.submit(WorkItem::TopicDeleted { name: name.clone() });
            }
            AuditEventPayload::TopicUpdated { name, update, .. } => {
                tracing::debug!("Not mirroring update {update:?} of topic {name}");
            }
            AuditEventPayload::Produced { partitions } => {
                self.observe_produce(event, partitions);
            }
            AuditEventPayload::NewProducerObserved { .. } | AuditEventPayload::AclMutation { .. } => {
                tracing::trace!("Ignoring {event}");
            }
        }
    }

    async fn shutdown(self) {
        let Running {
            config,
            tx,
            cancellation_token,
            mut worker,
            catalog,
            lister,
            ..
        } = self;
        drop(tx);
        cancellation_token.cancel();

        let grace_period = config.grace_period();
        match tokio::time::timeout(grace_period, &mut worker).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("Catalog worker failed: {e}"),
            Err(_) => {
                tracing::warn!(
                    "Catalog worker did not finish within {grace_period:?}, discarding outstanding work"
                );
                worker.abort();
            }
        }

        let release = async {
            catalog.close().await;
            lister.close().await;
        };
        if tokio::time::timeout(grace_period, release).await.is_err() {
            tracing::warn!("Closing catalog connections did not finish within {grace_period:?}");
        }
    }
}

#[async_trait]
impl Auditor for CatalogAuditor {
    fn configure(&self, options: &HashMap<String, String>) -> Result<(), AuditorError> {
        let mut state = self.write_state();
        match &*state {
            State::Unconfigured | State::Configured(_) => {}
            State::Started(_) => return Err(AuditorError::AlreadyStarted),
            State::Closed => return Err(AuditorError::Closed),
        }
        let options = AuditorOptions::parse(options)?;
        tracing::debug!("{self} configured: {:?}", options.config);
        *state = State::Configured(options);
        Ok(())
    }

    /// Connects the collaborators without holding the state lock, so concurrent `audit`
    /// calls fail fast with [`AuditorError::NotStarted`] instead of waiting for the connect.
    fn start(&self) -> Result<(), AuditorError> {
        loop {
            let options = match &*self.read_state() {
                State::Unconfigured => return Err(AuditorError::NotConfigured),
                State::Configured(options) => options.clone(),
                State::Started(_) => {
                    tracing::info!("{self} is already started");
                    return Ok(());
                }
                State::Closed => return Err(AuditorError::Closed),
            };
            let runtime = Handle::try_current().map_err(|_| AuditorError::NoRuntime)?;
            let (catalog, lister) = self.connect(&options)?;

            let mut state = self.write_state();
            if matches!(&*state, State::Configured(current) if *current == options) {
                *state = State::Started(self.launch(&runtime, &options, catalog, lister));
                return Ok(());
            }
            let outcome = match &*state {
                // Reconfigured while connecting: connect again with the new options.
                State::Configured(_) => None,
                State::Started(_) => {
                    tracing::info!("{self} is already started");
                    Some(Ok(()))
                }
                State::Unconfigured => Some(Err(AuditorError::NotConfigured)),
                State::Closed => Some(Err(AuditorError::Closed)),
            };
            drop(state);
            release_in_background(&runtime, catalog, lister);
            if let Some(outcome) = outcome {
                return outcome;
            }
        }
    }

    fn audit(&self, event: Arc<AuditEvent>) -> Result<(), AuditorError> {
        self.with_running(|running| {
            running.dispatch(&event);
            Ok(())
        })
    }

    async fn close(&self) {
        let previous = std::mem::replace(&mut *self.write_state(), State::Closed);
        match previous {
            State::Started(running) => {
                running.shutdown().await;
                tracing::info!("{self} closed");
            }
            State::Unconfigured | State::Configured(_) | State::Closed => {}
        }
    }

    fn state(&self) -> AuditorState {
        match &*self.read_state() {
            State::Unconfigured => AuditorState::Unconfigured,
            State::Configured(_) => AuditorState::Configured,
            State::Started(_) => AuditorState::Started,
            State::Closed => AuditorState::Closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        time::{Duration, Instant},
    };

    use maplit::{btreeset, hashmap};
    use pretty_assertions::assert_eq;
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        catalog::CatalogResult,
        logging::test_utils::capture_logs,
        memory::{InMemoryCatalog, InMemoryResourceLister},
    };

    /// Blocks in `connect` for `delay`. `connecting` is set once a connect is underway.
    #[derive(Debug)]
    struct SlowConnector {
        catalog: InMemoryCatalog,
        connecting: Arc<AtomicBool>,
        delay: Duration,
    }

    impl CatalogConnector for SlowConnector {
        fn connect(
            &self,
            options: &HashMap<String, String>,
        ) -> CatalogResult<Arc<dyn CatalogClient>> {
            self.connecting.store(true, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.catalog.connect(options)
        }
    }

    fn auditor() -> (CatalogAuditor, InMemoryCatalog, InMemoryResourceLister) {
        let catalog = InMemoryCatalog::new();
        let lister = InMemoryResourceLister::new();
        let auditor = CatalogAuditor::new(Arc::new(catalog.clone()), Arc::new(lister.clone()));
        (auditor, catalog, lister)
    }

    fn options() -> HashMap<String, String> {
        hashmap! {
            "cluster_namespace".to_string() => "prod".to_string(),
            "reconcile.enabled".to_string() => "false".to_string(),
        }
    }

    fn producer(client_id: &str) -> RequestContext {
        RequestContext::builder()
            .principal("User:app")
            .client_id(client_id)
            .build()
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let (auditor, _, _) = auditor();
        assert_eq!(auditor.state(), AuditorState::Unconfigured);
        assert!(matches!(auditor.start(), Err(AuditorError::NotConfigured)));

        auditor.configure(&options()).unwrap();
        assert_eq!(auditor.state(), AuditorState::Configured);
        assert!(matches!(
            auditor.request_reconciliation(),
            Err(AuditorError::NotStarted)
        ));

        auditor.start().unwrap();
        auditor.start().unwrap();
        assert_eq!(auditor.state(), AuditorState::Started);
        assert!(matches!(
            auditor.configure(&options()),
            Err(AuditorError::AlreadyStarted)
        ));

        auditor.close().await;
        assert_eq!(auditor.state(), AuditorState::Closed);
        assert!(matches!(auditor.start(), Err(AuditorError::Closed)));
        assert!(matches!(auditor.activity_cache(), Err(AuditorError::Closed)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_audit_fails_fast_while_start_connects() {
        let catalog = InMemoryCatalog::new();
        let connecting = Arc::new(AtomicBool::new(false));
        let auditor = Arc::new(CatalogAuditor::new(
            Arc::new(SlowConnector {
                catalog: catalog.clone(),
                connecting: Arc::clone(&connecting),
                delay: Duration::from_millis(500),
            }),
            Arc::new(InMemoryResourceLister::new()),
        ));
        auditor.configure(&options()).unwrap();

        let starting = Arc::clone(&auditor);
        let start = tokio::task::spawn_blocking(move || starting.start());
        eventually(|| connecting.load(Ordering::SeqCst)).await;

        let started = Instant::now();
        let result = auditor.audit(Arc::new(AuditEvent::new(
            producer("admin"),
            AuditEventPayload::TopicDeleted {
                name: "orders".to_string(),
            },
        )));
        assert!(matches!(result, Err(AuditorError::NotStarted)));
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(auditor.state(), AuditorState::Configured);

        start.await.unwrap().unwrap();
        assert_eq!(auditor.state(), AuditorState::Started);
        auditor.close().await;
        assert!(catalog.is_closed());
    }

    #[tokio::test]
    async fn test_invalid_options_keep_auditor_unconfigured() {
        let (auditor, _, _) = auditor();
        let err = auditor
            .configure(&hashmap! {"cache.max_entries".to_string() => "0".to_string()})
            .unwrap_err();

        assert!(matches!(err, AuditorError::Configuration(_)));
        assert_eq!(auditor.state(), AuditorState::Unconfigured);
    }

    #[test]
    fn test_start_requires_runtime() {
        let (auditor, _, _) = auditor();
        auditor.configure(&options()).unwrap();

        assert!(matches!(auditor.start(), Err(AuditorError::NoRuntime)));
        assert_eq!(auditor.state(), AuditorState::Configured);
    }

    #[tokio::test]
    async fn test_topic_events_reach_catalog() {
        let (auditor, catalog, _) = auditor();
        auditor.configure(&options()).unwrap();
        auditor.start().unwrap();

        auditor
            .audit(Arc::new(AuditEvent::new(
                producer("admin"),
                AuditEventPayload::TopicCreated {
                    name: "orders".to_string(),
                    partitions: 3,
                    replication_factor: 1,
                },
            )))
            .unwrap();
        eventually(|| catalog.get("orders@prod").is_some()).await;

        auditor
            .audit(Arc::new(AuditEvent::new(
                producer("admin"),
                AuditEventPayload::TopicDeleted {
                    name: "orders".to_string(),
                },
            )))
            .unwrap();
        eventually(|| catalog.get("orders@prod").is_none()).await;

        auditor.close().await;
        assert!(catalog.is_closed());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_queue_overflow_is_dropped_and_logged() {
        let (auditor, catalog, _) = auditor();
        let mut options = options();
        options.insert("queue.capacity".to_string(), "1".to_string());
        auditor.configure(&options).unwrap();
        auditor.start().unwrap();

        // The worker cannot run before the test yields, so only the first item fits.
        for name in ["orders", "payments", "refunds"] {
            auditor
                .audit(Arc::new(AuditEvent::new(
                    producer("admin"),
                    AuditEventPayload::TopicCreated {
                        name: name.to_string(),
                        partitions: 1,
                        replication_factor: 1,
                    },
                )))
                .unwrap();
        }
        auditor.close().await;

        assert!(logs_contain("Catalog work queue is full (1 items), dropping"));
        assert!(logs_contain("payments"));
        assert_eq!(catalog.qualified_names(), btreeset! {"orders@prod".to_string()});
    }

    #[tokio::test]
    async fn test_request_reconciliation() {
        let (auditor, catalog, lister) = auditor();
        lister.create_topic("orders", 1, 1);
        auditor.configure(&options()).unwrap();
        auditor.start().unwrap();

        auditor.request_reconciliation().unwrap();
        eventually(|| catalog.get("orders@prod").is_some()).await;

        auditor.close().await;
        assert!(lister.is_closed());
    }

    #[tokio::test]
    async fn test_produce_observation_is_suppressed_within_window() {
        let (auditor, _, _) = auditor();
        auditor.configure(&options()).unwrap();
        auditor.start().unwrap();
        let partitions = btreeset! {TopicPartition::new("orders", 0), TopicPartition::new("orders", 1)};

        let combined = capture_logs(|| {
            assert!(auditor.observe_produce(&producer("app-1"), &partitions).unwrap());
            assert!(!auditor.observe_produce(&producer("app-1"), &partitions).unwrap());
            assert!(auditor.observe_produce(&producer("app-2"), &partitions).unwrap());
        });

        assert_eq!(combined.matches("new_producer_observed{").count(), 2);
        assert!(combined.contains("producer=app-1"), "{combined}");
        let cache = auditor.activity_cache().unwrap();
        assert!(cache.contains("app-1", &TopicPartition::new("orders", 1)));

        auditor.close().await;
    }

    #[tokio::test]
    async fn test_produced_event_is_recorded() {
        let (auditor, catalog, _) = auditor();
        auditor.configure(&options()).unwrap();
        auditor.start().unwrap();

        auditor
            .audit(Arc::new(AuditEvent::new(
                producer("app-1"),
                AuditEventPayload::Produced {
                    partitions: btreeset! {TopicPartition::new("orders", 0)},
                },
            )))
            .unwrap();

        let cache = auditor.activity_cache().unwrap();
        assert!(cache.contains("app-1", &TopicPartition::new("orders", 0)));
        auditor.close().await;
        assert_eq!(catalog.calls().mutations(), 0);
    }
}
