//! Structured audit log.
//!
//! Every record is emitted as a `tracing` span named after its action, carrying
//! `event_source = "audit"`, the request identity and the record's own fields, with one
//! `info` event inside it. Installing a subscriber is up to the host.

mod auditor;
pub mod records;

pub use auditor::AuditLogAuditor;
use uuid::Uuid;

use crate::events::{AuditEvent, RequestContext};

pub const AUDIT_LOG_EVENT_SOURCE: &str = "audit";

pub trait AuditRecord {
    fn action(&self) -> &'static str;
    fn log<D: AuditContextData>(&self, ctx: &D);
    fn log_without_context(&self);
}

pub trait AuditContext {
    fn log_audit<R: AuditRecord>(&self, record: R);
}

impl<T> AuditContext for T
where
    T: AuditContextData,
{
    fn log_audit<R: AuditRecord>(&self, record: R) {
        record.log(self);
    }
}

pub trait AuditContextData {
    fn request_context(&self) -> &RequestContext;

    fn event_id(&self) -> Option<Uuid> {
        None
    }
}

impl AuditContextData for RequestContext {
    fn request_context(&self) -> &RequestContext {
        self
    }
}

impl AuditContextData for AuditEvent {
    fn request_context(&self) -> &RequestContext {
        AuditEvent::request_context(self)
    }

    fn event_id(&self) -> Option<Uuid> {
        Some(self.id())
    }
}
