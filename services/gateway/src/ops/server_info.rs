//! Server introspection handlers.

use crate::actor::ConnectionActor;
use gate_core::epoch_ms;
use gate_protocol::PROTOCOL_VERSION;
use serde_json::{Value, json};

pub fn stats(actor: &ConnectionActor) -> Value {
    let state = &actor.state;
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "version": env!("CARGO_PKG_VERSION"),
        "startedAt": state.started_at,
        "uptimeMs": epoch_ms() - state.started_at,
        "connections": state.supervisor.count(),
        "authRequired": state.config.auth.required,
        "heartbeat": {
            "intervalMs": state.config.heartbeat.interval_ms,
            "timeoutMs": state.config.heartbeat.timeout_ms,
        },
        "auditEntries": state.audit.len(),
    })
}

pub fn connections(actor: &ConnectionActor) -> Value {
    let connections = actor.state.supervisor.list_connections();
    json!({
        "count": connections.len(),
        "connections": connections,
    })
}
