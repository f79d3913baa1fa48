#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::pedantic
)]
#![allow(clippy::module_name_repetitions)]
#![forbid(unsafe_code)]

pub mod auditor;
pub mod cache;
pub mod catalog;
pub mod catalog_auditor;
pub mod config;
pub mod error;
pub mod events;
pub mod lister;
pub mod logging;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod reconcile;

pub use auditor::{Auditor, AuditorCollection, AuditorState};
pub use cache::{ActivityCache, ActivityCacheSettings, EvictionCause, RecordOutcome};
pub use catalog::{CatalogClient, CatalogConnector, CatalogEntity, CatalogId, qualify, unqualify};
pub use catalog_auditor::CatalogAuditor;
pub use config::{AuditorConfig, AuditorOptions};
pub use error::{AuditorError, CatalogError, ConfigurationError, ListerError, RetryableError};
pub use events::{AuditEvent, AuditEventPayload, RequestContext, TopicPartition};
pub use lister::{ResourceLister, ResourceListerConnector};
pub use logging::AuditLogAuditor;
