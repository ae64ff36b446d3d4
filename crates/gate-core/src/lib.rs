// gate-core: sessions, permissions, audit, rate limiting, and the
// collaborator interfaces the gateway consumes.

pub mod audit;
pub mod backend;
pub mod permissions;
pub mod ratelimit;
pub mod session;

pub use audit::{AuditEntry, AuditFilter, AuditLog, AuditResult};
pub use backend::{
    Aggregate, AuthGrant, IdentityBackend, PushSink, RuleBackend, StoreBackend, StoreSubscription,
    SubscriptionGuard,
};
pub use permissions::{
    AclEntry, PermissionEngine, Resource, ResourceKind, RolePermission, SubjectKind,
    extract_resource,
};
pub use ratelimit::RateLimiter;
pub use session::{ROLE_ADMIN, ROLE_READER, ROLE_SUPERADMIN, ROLE_WRITER, Session};

/// Current time as epoch milliseconds.
pub fn epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
