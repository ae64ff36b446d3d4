//! Collaborator interfaces.
//!
//! The store, rules, and identity engines live behind these traits; the
//! gateway holds `Arc<dyn …>` handles and never takes additional locks over
//! them.  Payloads stay `serde_json::Value` end to end -- the router
//! forwards engine results verbatim.

use crate::permissions::{AclEntry, Resource};
use crate::session::Session;
use async_trait::async_trait;
use gate_protocol::GatewayError;
use serde_json::Value;
use std::sync::Arc;

/// Push callback handed to an engine at subscription time.  Sinks only
/// enqueue into the owning connection's inbox; they never touch socket or
/// session state.
pub type PushSink = Arc<dyn Fn(Value) + Send + Sync>;

/// Detaches a subscription from its source.
///
/// Detach-on-drop guarantees release on every exit path, including panic
/// unwind.  After `detach` returns no further push for this subscription
/// enters the sink.
pub struct SubscriptionGuard {
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SubscriptionGuard {
    pub fn new(detach: impl FnOnce() + Send + Sync + 'static) -> Self {
        SubscriptionGuard {
            detach: Some(Box::new(detach)),
        }
    }

    pub fn detach(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionGuard")
            .field("detached", &self.detach.is_none())
            .finish()
    }
}

/// Result of registering a store-query subscription: the query's current
/// result plus the detach handle.
#[derive(Debug)]
pub struct StoreSubscription {
    pub initial: Value,
    pub guard: SubscriptionGuard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Sum,
    Avg,
    Min,
    Max,
}

/// The schemaed key-value store.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    async fn get(&self, bucket: &str, key: &str) -> Result<Value, GatewayError>;
    async fn all(&self, bucket: &str) -> Result<Value, GatewayError>;
    async fn find_where(&self, bucket: &str, filter: &Value) -> Result<Value, GatewayError>;
    async fn find_one(&self, bucket: &str, filter: &Value) -> Result<Value, GatewayError>;
    async fn count(&self, bucket: &str, filter: Option<&Value>) -> Result<Value, GatewayError>;
    async fn first(&self, bucket: &str) -> Result<Value, GatewayError>;
    async fn last(&self, bucket: &str) -> Result<Value, GatewayError>;
    async fn paginate(&self, bucket: &str, options: &Value) -> Result<Value, GatewayError>;
    async fn aggregate(
        &self,
        bucket: &str,
        aggregate: Aggregate,
        field: &str,
        filter: Option<&Value>,
    ) -> Result<Value, GatewayError>;

    async fn insert(&self, bucket: &str, record: &Value) -> Result<Value, GatewayError>;
    async fn update(&self, bucket: &str, key: &str, patch: &Value) -> Result<Value, GatewayError>;
    async fn delete(&self, bucket: &str, key: &str) -> Result<Value, GatewayError>;
    async fn clear(&self, bucket: &str) -> Result<Value, GatewayError>;

    async fn buckets(&self) -> Result<Value, GatewayError>;
    async fn stats(&self) -> Result<Value, GatewayError>;
    async fn define_bucket(&self, definition: &Value) -> Result<Value, GatewayError>;
    async fn drop_bucket(&self, bucket: &str) -> Result<Value, GatewayError>;
    async fn update_bucket(&self, bucket: &str, definition: &Value)
    -> Result<Value, GatewayError>;
    async fn get_bucket_schema(&self, bucket: &str) -> Result<Value, GatewayError>;

    async fn define_query(&self, definition: &Value) -> Result<Value, GatewayError>;
    async fn undefine_query(&self, name: &str) -> Result<Value, GatewayError>;
    async fn list_queries(&self) -> Result<Value, GatewayError>;

    /// Apply the operation list atomically; rollback on any failure.  One
    /// commit produces at most one notification per affected subscription.
    async fn transaction(&self, operations: &Value) -> Result<Value, GatewayError>;

    /// Evaluate the named query once and register a change listener.  The
    /// sink receives the full post-change result whenever it differs from
    /// the last delivered one.
    async fn register_subscription(
        &self,
        query: &str,
        params: Option<&Value>,
        sink: PushSink,
    ) -> Result<StoreSubscription, GatewayError>;
}

/// The rules/event engine.
#[async_trait]
pub trait RuleBackend: Send + Sync {
    async fn emit(&self, topic: &str, event: &Value) -> Result<Value, GatewayError>;
    async fn emit_correlated(
        &self,
        topic: &str,
        event: &Value,
        correlation_id: &str,
    ) -> Result<Value, GatewayError>;

    async fn set_fact(&self, key: &str, value: &Value) -> Result<Value, GatewayError>;
    async fn get_fact(&self, key: &str) -> Result<Value, GatewayError>;
    async fn delete_fact(&self, key: &str) -> Result<Value, GatewayError>;
    async fn query_facts(&self, pattern: &str) -> Result<Value, GatewayError>;
    async fn get_all_facts(&self) -> Result<Value, GatewayError>;

    async fn register_rule(&self, definition: &Value) -> Result<Value, GatewayError>;
    async fn unregister_rule(&self, id: &str) -> Result<Value, GatewayError>;
    async fn update_rule(&self, id: &str, definition: &Value) -> Result<Value, GatewayError>;
    async fn enable_rule(&self, id: &str) -> Result<Value, GatewayError>;
    async fn disable_rule(&self, id: &str) -> Result<Value, GatewayError>;
    async fn get_rule(&self, id: &str) -> Result<Value, GatewayError>;
    async fn list_rules(&self) -> Result<Value, GatewayError>;
    async fn validate_rule(&self, definition: &Value) -> Result<Value, GatewayError>;

    /// Deliver `{topic, event}` to the sink for every emitted event whose
    /// topic matches the pattern.  No initial data.
    async fn subscribe(
        &self,
        pattern: &str,
        sink: PushSink,
    ) -> Result<SubscriptionGuard, GatewayError>;

    async fn stats(&self) -> Result<Value, GatewayError>;
}

/// A successful login: the opaque session token plus the session itself.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthGrant {
    pub token: String,
    pub session: Session,
}

/// The built-in identity store.
#[async_trait]
pub trait IdentityBackend: Send + Sync {
    async fn login(&self, username: &str, password: &str) -> Result<AuthGrant, GatewayError>;
    async fn login_with_secret(&self, secret: &str) -> Result<AuthGrant, GatewayError>;
    async fn logout(&self, token: &str) -> Result<(), GatewayError>;
    /// `None` for unknown, revoked, or expired tokens.
    async fn validate_session(&self, token: &str) -> Option<Session>;
    async fn refresh_session(&self, token: &str) -> Result<AuthGrant, GatewayError>;

    async fn create_user(&self, definition: &Value) -> Result<Value, GatewayError>;
    async fn update_user(&self, username: &str, patch: &Value) -> Result<Value, GatewayError>;
    async fn delete_user(&self, username: &str) -> Result<Value, GatewayError>;
    async fn get_user(&self, username: &str) -> Result<Value, GatewayError>;
    async fn list_users(&self) -> Result<Value, GatewayError>;

    async fn create_role(&self, role: &str) -> Result<Value, GatewayError>;
    async fn delete_role(&self, role: &str) -> Result<Value, GatewayError>;
    async fn list_roles(&self) -> Result<Value, GatewayError>;
    async fn assign_role(&self, username: &str, role: &str) -> Result<Value, GatewayError>;
    async fn revoke_role(&self, username: &str, role: &str) -> Result<Value, GatewayError>;

    async fn grant(&self, entry: AclEntry) -> Result<Value, GatewayError>;
    async fn revoke(&self, entry: &AclEntry) -> Result<Value, GatewayError>;
    async fn list_acl(&self) -> Result<Value, GatewayError>;
    /// Entries whose subject is this session's user or one of its roles.
    async fn acl_for(&self, session: &Session) -> Vec<AclEntry>;

    async fn set_owner(&self, resource: &Resource, user_id: &str) -> Result<Value, GatewayError>;
    async fn owner_of(&self, resource: &Resource) -> Option<String>;
}
