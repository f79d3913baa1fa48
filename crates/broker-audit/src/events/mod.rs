mod acl;

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Display,
    net::IpAddr,
};

pub use acl::{AclBinding, AclEntry, AclMutationKind, AclPermission, PatternType, ResourcePattern, ResourceType};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Identity of the request an audit event originates from.
#[derive(Debug, Clone, PartialEq, Eq, typed_builder::TypedBuilder)]
pub struct RequestContext {
    #[builder(setter(into))]
    pub principal: String,
    #[builder(setter(into))]
    pub client_id: String,
    #[builder(default, setter(strip_option))]
    pub client_address: Option<IpAddr>,
}

/// A typed, immutable description of one completed broker request.
///
/// Events are created once per request and handed to every auditor behind an `Arc`;
/// auditors only ever read them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    id: Uuid,
    occurred_at: DateTime<Utc>,
    request_context: RequestContext,
    payload: AuditEventPayload,
}

impl AuditEvent {
    #[must_use]
    pub fn new(request_context: RequestContext, payload: AuditEventPayload) -> Self {
        Self {
            id: Uuid::now_v7(),
            occurred_at: Utc::now(),
            request_context,
            payload,
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    #[must_use]
    pub fn request_context(&self) -> &RequestContext {
        &self.request_context
    }

    #[must_use]
    pub fn payload(&self) -> &AuditEventPayload {
        &self.payload
    }
}

impl Display for AuditEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "AuditEvent{{id={}, principal={}, client_id={}, kind={}}}",
            self.id,
            self.request_context.principal,
            self.request_context.client_id,
            self.payload.kind()
        )
    }
}

/// What happened. The variant set is closed; consumers dispatch with an exhaustive `match`.
#[derive(Debug, Clone, PartialEq, Eq, strum_macros::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum AuditEventPayload {
    TopicCreated {
        name: String,
        partitions: i32,
        replication_factor: i16,
    },
    TopicDeleted {
        name: String,
    },
    TopicUpdated {
        name: String,
        update: TopicUpdate,
        error: ErrorCode,
    },
    NewProducerObserved {
        client_id: String,
    },
    AclMutation {
        kind: AclMutationKind,
        entities: BTreeSet<AclBinding>,
        results: BTreeMap<AclBinding, i32>,
    },
    /// A produce request completed; `partitions` are the partitions written to.
    Produced {
        partitions: BTreeSet<TopicPartition>,
    },
}

impl AuditEventPayload {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.into()
    }
}

/// The two mutually exclusive ways a topic can be altered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicUpdate {
    Partitions(i32),
    ReplicationFactor(i16),
}

impl TopicUpdate {
    #[must_use]
    pub fn new_partitions(&self) -> Option<i32> {
        match self {
            TopicUpdate::Partitions(p) => Some(*p),
            TopicUpdate::ReplicationFactor(_) => None,
        }
    }

    #[must_use]
    pub fn new_replication_factor(&self) -> Option<i16> {
        match self {
            TopicUpdate::Partitions(_) => None,
            TopicUpdate::ReplicationFactor(rf) => Some(*rf),
        }
    }
}

/// Broker protocol error code attached to a request outcome. `0` means success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, derive_more::Display)]
#[display("{_0}")]
pub struct ErrorCode(pub i16);

impl ErrorCode {
    pub const NONE: ErrorCode = ErrorCode(0);

    #[must_use]
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display)]
#[display("{topic}-{partition}")]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    #[must_use]
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}
