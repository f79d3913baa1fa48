//! One audit record per audit-log action.

use std::collections::BTreeMap;

use broker_audit_logging_derive::AuditRecord;

use crate::{
    events::{AclMutationKind, AuditEvent, AuditEventPayload, ErrorCode},
    logging::{AUDIT_LOG_EVENT_SOURCE, AuditContextData, AuditRecord},
};

#[derive(Debug, AuditRecord)]
pub struct TopicCreatedRecord {
    pub topic: String,
    pub partitions: i32,
    pub replication_factor: i16,
}

#[derive(Debug, AuditRecord)]
pub struct TopicDeletedRecord {
    pub topic: String,
}

#[derive(Debug, AuditRecord)]
pub struct TopicUpdatedRecord {
    pub topic: String,
    #[audit(skip_none)]
    pub new_partitions: Option<i32>,
    #[audit(skip_none)]
    pub new_replication_factor: Option<i16>,
    pub error_code: ErrorCode,
}

/// A client produced for the first time within the activity window.
#[derive(Debug, AuditRecord)]
pub struct NewProducerObservedRecord {
    pub producer: String,
}

#[derive(Debug, AuditRecord)]
pub struct AclMutationRecord {
    pub kind: AclMutationKind,
    #[audit(debug)]
    pub bindings: Vec<String>,
    /// Non-zero outcome codes keyed by binding.
    #[audit(debug)]
    pub failures: BTreeMap<String, i32>,
}

/// Writes `event` to the audit log. Returns `false` for data-path events, which are not
/// audit-logged.
pub fn log_event(event: &AuditEvent) -> bool {
    match event.payload() {
        AuditEventPayload::TopicCreated {
            name,
            partitions,
            replication_factor,
        } => TopicCreatedRecord {
            topic: name.clone(),
            partitions: *partitions,
            replication_factor: *replication_factor,
        }
        .log(event),
        AuditEventPayload::TopicDeleted { name } => {
            TopicDeletedRecord { topic: name.clone() }.log(event);
        }
        AuditEventPayload::TopicUpdated {
            name,
            update,
            error,
        } => TopicUpdatedRecord {
            topic: name.clone(),
            new_partitions: update.new_partitions(),
            new_replication_factor: update.new_replication_factor(),
            error_code: *error,
        }
        .log(event),
        AuditEventPayload::NewProducerObserved { client_id } => NewProducerObservedRecord {
            producer: client_id.clone(),
        }
        .log(event),
        AuditEventPayload::AclMutation {
            kind,
            entities,
            results,
        } => AclMutationRecord {
            kind: *kind,
            bindings: entities.iter().map(ToString::to_string).collect(),
            failures: results
                .iter()
                .filter(|(_, code)| **code != 0)
                .map(|(binding, code)| (binding.to_string(), *code))
                .collect(),
        }
        .log(event),
        AuditEventPayload::Produced { .. } => return false,
    }
    true
}
