//! Shared gateway state.

use crate::config::GatewayConfig;
use crate::supervisor::ConnectionSupervisor;
use gate_core::{
    AuditLog, IdentityBackend, PermissionEngine, RateLimiter, RuleBackend, StoreBackend,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub store: Arc<dyn StoreBackend>,
    pub rules: Option<Arc<dyn RuleBackend>>,
    pub identity: Arc<dyn IdentityBackend>,
    pub audit: Arc<AuditLog>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub permissions: Arc<PermissionEngine>,
    pub supervisor: Arc<ConnectionSupervisor>,
    pub started_at: i64,
}

impl AppState {
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn StoreBackend>,
        rules: Option<Arc<dyn RuleBackend>>,
        identity: Arc<dyn IdentityBackend>,
    ) -> Self {
        let audit = Arc::new(AuditLog::new(config.audit.capacity));
        let rate_limiter = config
            .rate_limit
            .map(|rl| Arc::new(RateLimiter::new(rl.max_requests, rl.window_ms)));
        let permissions = Arc::new(PermissionEngine::new(
            config.permissions.roles.clone(),
            config.permissions.default_allow,
        ));
        AppState {
            config: Arc::new(config),
            store,
            rules,
            identity,
            audit,
            rate_limiter,
            permissions,
            supervisor: Arc::new(ConnectionSupervisor::new()),
            started_at: gate_core::epoch_ms(),
        }
    }
}
