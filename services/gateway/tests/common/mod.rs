// Shared harness for the gateway integration suites: boots a real listener
// on an ephemeral port with the in-memory backends.
#![allow(dead_code)]

use gate_backend::{IdentityOptions, MemoryIdentity, MemoryRules, MemoryStore};
use gate_core::{IdentityBackend, RuleBackend, StoreBackend};
use gateway::{AppState, GatewayConfig, build_router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub const SUPERADMIN_SECRET: &str = "bootstrap-secret";

pub struct TestGateway {
    pub url: String,
    pub state: AppState,
    server: JoinHandle<()>,
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.server.abort();
    }
}

/// Seeded users: alice/admin, wendy/writer, rita/reader, omar/ops (custom).
pub fn seeded_identity(config: &GatewayConfig) -> MemoryIdentity {
    MemoryIdentity::new(IdentityOptions {
        session_ttl_ms: config.auth.session_ttl_ms,
        superadmin_secret: config.auth.superadmin_secret.clone(),
    })
    .with_user("alice", "pw-alice", &["admin"])
    .with_user("wendy", "pw-wendy", &["writer"])
    .with_user("rita", "pw-rita", &["reader"])
    .with_user("omar", "pw-omar", &["ops"])
}

pub async fn spawn_gateway(config: GatewayConfig) -> TestGateway {
    let identity = seeded_identity(&config);
    spawn_gateway_with(
        config,
        Arc::new(MemoryStore::new()),
        Some(Arc::new(MemoryRules::new())),
        Arc::new(identity),
    )
    .await
}

pub async fn spawn_gateway_with(
    config: GatewayConfig,
    store: Arc<dyn StoreBackend>,
    rules: Option<Arc<dyn RuleBackend>>,
    identity: Arc<dyn IdentityBackend>,
) -> TestGateway {
    let state = AppState::new(config, store, rules, identity);
    let router = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    let url = format!("ws://{}{}", addr, state.config.server.ws_path);
    let server = tokio::spawn(async move {
        let _ = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await;
    });
    TestGateway { url, state, server }
}

/// Default config with auth off; tweak fields per suite.
pub fn base_config() -> GatewayConfig {
    GatewayConfig::default()
}

/// Auth-required config with the bootstrap secret installed.
pub fn auth_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.auth.required = true;
    config.auth.superadmin_secret = Some(SUPERADMIN_SECRET.to_owned());
    config
}
