#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum AclMutationKind {
    Create,
    Delete,
    Describe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ResourceType {
    Topic,
    Group,
    Cluster,
    TransactionalId,
    DelegationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum PatternType {
    Literal,
    Prefixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum AclPermission {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display)]
#[display("{resource_type}:{pattern_type}:{name}")]
pub struct ResourcePattern {
    pub resource_type: ResourceType,
    pub name: String,
    pub pattern_type: PatternType,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display)]
#[display("{principal} {permission} {operation} from {host}")]
pub struct AclEntry {
    pub principal: String,
    pub host: String,
    pub operation: String,
    pub permission: AclPermission,
}

/// A resource pattern together with the access control entry applied to it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display)]
#[display("({pattern}, {entry})")]
pub struct AclBinding {
    pub pattern: ResourcePattern,
    pub entry: AclEntry,
}
