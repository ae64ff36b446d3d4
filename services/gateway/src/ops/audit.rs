//! Audit query handler.

use crate::actor::ConnectionActor;
use gate_core::audit::AuditFilter;
use gate_protocol::{GatewayError, Request};
use serde_json::{Value, json};

pub fn query(actor: &ConnectionActor, req: &Request) -> Result<Value, GatewayError> {
    let filter: AuditFilter = serde_json::from_value(Value::Object(req.body.clone()))
        .map_err(|e| GatewayError::validation(format!("invalid audit filter: {e}")))?;
    let entries = actor.state.audit.query(&filter);
    Ok(json!({ "entries": entries }))
}
