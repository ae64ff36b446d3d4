//! Rules handlers.  Every operation yields `RULES_NOT_AVAILABLE` when no
//! rules engine is wired in.

use crate::actor::ConnectionActor;
use gate_core::RuleBackend;
use gate_protocol::{Channel, GatewayError, Operation, Request};
use serde_json::{Value, json};
use std::sync::Arc;

fn engine(actor: &ConnectionActor) -> Result<Arc<dyn RuleBackend>, GatewayError> {
    actor
        .state
        .rules
        .clone()
        .ok_or_else(GatewayError::rules_not_available)
}

pub async fn dispatch(
    actor: &ConnectionActor,
    op: Operation,
    req: &Request,
) -> Result<Value, GatewayError> {
    let rules = engine(actor)?;
    match op {
        Operation::RulesEmit => {
            let event = req.field("event").cloned().unwrap_or_else(|| json!({}));
            rules.emit(req.require_str("topic")?, &event).await
        }
        Operation::RulesEmitCorrelated => {
            let event = req.field("event").cloned().unwrap_or_else(|| json!({}));
            rules
                .emit_correlated(
                    req.require_str("topic")?,
                    &event,
                    req.require_str("correlationId")?,
                )
                .await
        }
        Operation::RulesSetFact => {
            rules
                .set_fact(req.require_str("key")?, req.require_field("value")?)
                .await
        }
        Operation::RulesGetFact => rules.get_fact(req.require_str("key")?).await,
        Operation::RulesDeleteFact => rules.delete_fact(req.require_str("key")?).await,
        Operation::RulesQueryFacts => rules.query_facts(req.require_str("pattern")?).await,
        Operation::RulesGetAllFacts => rules.get_all_facts().await,
        // Rule definitions travel under `rule` and rule identity under
        // `ruleId`; a bare `id` would collide with the request id.
        Operation::RulesRegister => rules.register_rule(req.require_field("rule")?).await,
        Operation::RulesUnregister => rules.unregister_rule(req.require_str("ruleId")?).await,
        Operation::RulesUpdate => {
            rules
                .update_rule(req.require_str("ruleId")?, req.require_field("rule")?)
                .await
        }
        Operation::RulesEnable => rules.enable_rule(req.require_str("ruleId")?).await,
        Operation::RulesDisable => rules.disable_rule(req.require_str("ruleId")?).await,
        Operation::RulesGet => rules.get_rule(req.require_str("ruleId")?).await,
        Operation::RulesList => rules.list_rules().await,
        Operation::RulesValidate => rules.validate_rule(req.require_field("rule")?).await,
        Operation::RulesStats => rules.stats().await,
        _ => Err(GatewayError::internal("operation routed to the wrong handler")),
    }
}

/// Register a rules-topic subscription.  Rules pushes carry
/// `{topic, event}` envelopes and have no initial data.
pub async fn subscribe(
    actor: &mut ConnectionActor,
    req: &Request,
) -> Result<Value, GatewayError> {
    let rules = engine(actor)?;
    let pattern = req.require_str("pattern")?.to_owned();
    actor.ensure_subscription_capacity()?;

    let subscription_id = actor.allocate_subscription_id();
    let sink = actor.push_sink(subscription_id.clone(), Channel::Event);
    let guard = rules.subscribe(&pattern, sink).await?;
    actor.insert_subscription(subscription_id.clone(), Channel::Event, guard);
    Ok(json!({ "subscriptionId": subscription_id }))
}

pub fn unsubscribe(actor: &mut ConnectionActor, req: &Request) -> Result<Value, GatewayError> {
    let subscription_id = req.require_str("subscriptionId")?;
    match actor.remove_subscription(subscription_id) {
        Some(entry) => {
            entry.guard.detach();
            Ok(json!({ "unsubscribed": true, "subscriptionId": subscription_id }))
        }
        None => Err(GatewayError::not_found(format!(
            "subscription `{subscription_id}` not found on this connection"
        ))),
    }
}
