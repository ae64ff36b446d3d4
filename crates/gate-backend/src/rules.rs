//! In-memory rules/event engine.
//!
//! Facts are a flat key/value map.  Rules bind a topic pattern to a list of
//! actions (`emit` a derived event or `setFact`); emits cascade through
//! matching rules up to a fixed depth.  Topic subscriptions receive
//! `{topic, event}` envelopes for every matching emit.

use async_trait::async_trait;
use gate_core::backend::{PushSink, RuleBackend, SubscriptionGuard};
use gate_core::permissions::wildcard_match;
use gate_protocol::GatewayError;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Emits triggered by rule actions cascade at most this deep.
const MAX_CASCADE_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum RuleAction {
    Emit { topic: String, event: Value },
    SetFact { key: String, value: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDef {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Topic pattern the rule fires on (`*` and `prefix.*` supported).
    pub topic: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub actions: Vec<RuleAction>,
}

fn default_enabled() -> bool {
    true
}

struct RuleSub {
    id: u64,
    pattern: String,
    sink: PushSink,
}

#[derive(Default)]
struct Counters {
    emitted: u64,
    delivered: u64,
    fired: u64,
}

struct RulesInner {
    facts: BTreeMap<String, Value>,
    rules: BTreeMap<String, RuleDef>,
    subscriptions: Vec<RuleSub>,
    next_sub_id: u64,
    counters: Counters,
}

pub struct MemoryRules {
    inner: Arc<Mutex<RulesInner>>,
}

impl Default for MemoryRules {
    fn default() -> Self {
        MemoryRules::new()
    }
}

impl MemoryRules {
    pub fn new() -> Self {
        MemoryRules {
            inner: Arc::new(Mutex::new(RulesInner {
                facts: BTreeMap::new(),
                rules: BTreeMap::new(),
                subscriptions: Vec::new(),
                next_sub_id: 1,
                counters: Counters::default(),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RulesInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Deliver one emit to subscribers, then run matching rules; rule `emit`
/// actions join the queue until the depth cap.
fn run_emit(
    inner: &mut RulesInner,
    topic: &str,
    event: &Value,
    correlation_id: Option<&str>,
) -> u64 {
    let mut queue: Vec<(String, Value, usize)> = vec![(topic.to_owned(), event.clone(), 0)];
    let mut matched_rules = 0u64;

    while let Some((topic, event, depth)) = queue.pop() {
        inner.counters.emitted += 1;

        let mut envelope = json!({ "topic": topic, "event": event });
        if let Some(cid) = correlation_id {
            envelope["correlationId"] = json!(cid);
        }
        for sub in &inner.subscriptions {
            if wildcard_match(&sub.pattern, &topic) {
                inner.counters.delivered += 1;
                (sub.sink)(envelope.clone());
            }
        }

        if depth >= MAX_CASCADE_DEPTH {
            continue;
        }
        let fired: Vec<RuleAction> = inner
            .rules
            .values()
            .filter(|r| r.enabled && wildcard_match(&r.topic, &topic))
            .flat_map(|r| r.actions.clone())
            .collect();
        for action in fired {
            matched_rules += 1;
            inner.counters.fired += 1;
            match action {
                RuleAction::Emit { topic, event } => queue.push((topic, event, depth + 1)),
                RuleAction::SetFact { key, value } => {
                    inner.facts.insert(key, value);
                }
            }
        }
    }
    matched_rules
}

fn parse_rule(definition: &Value) -> Result<RuleDef, GatewayError> {
    serde_json::from_value(definition.clone())
        .map_err(|e| GatewayError::validation(format!("invalid rule definition: {e}")))
}

#[async_trait]
impl RuleBackend for MemoryRules {
    async fn emit(&self, topic: &str, event: &Value) -> Result<Value, GatewayError> {
        let mut inner = self.lock();
        let matched = run_emit(&mut inner, topic, event, None);
        Ok(json!({ "emitted": true, "topic": topic, "matchedRules": matched }))
    }

    async fn emit_correlated(
        &self,
        topic: &str,
        event: &Value,
        correlation_id: &str,
    ) -> Result<Value, GatewayError> {
        let mut inner = self.lock();
        let matched = run_emit(&mut inner, topic, event, Some(correlation_id));
        Ok(json!({
            "emitted": true,
            "topic": topic,
            "correlationId": correlation_id,
            "matchedRules": matched,
        }))
    }

    async fn set_fact(&self, key: &str, value: &Value) -> Result<Value, GatewayError> {
        let mut inner = self.lock();
        inner.facts.insert(key.to_owned(), value.clone());
        Ok(json!({ "key": key, "value": value }))
    }

    async fn get_fact(&self, key: &str) -> Result<Value, GatewayError> {
        let inner = self.lock();
        Ok(inner.facts.get(key).cloned().unwrap_or(Value::Null))
    }

    async fn delete_fact(&self, key: &str) -> Result<Value, GatewayError> {
        let mut inner = self.lock();
        let deleted = inner.facts.remove(key).is_some();
        Ok(json!({ "deleted": deleted }))
    }

    async fn query_facts(&self, pattern: &str) -> Result<Value, GatewayError> {
        let inner = self.lock();
        let matches: serde_json::Map<String, Value> = inner
            .facts
            .iter()
            .filter(|(key, _)| wildcard_match(pattern, key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Ok(Value::Object(matches))
    }

    async fn get_all_facts(&self) -> Result<Value, GatewayError> {
        let inner = self.lock();
        Ok(json!(inner.facts))
    }

    async fn register_rule(&self, definition: &Value) -> Result<Value, GatewayError> {
        let mut rule = parse_rule(definition)?;
        let id = rule
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        rule.id = Some(id.clone());
        let mut inner = self.lock();
        if inner.rules.contains_key(&id) {
            return Err(GatewayError::already_exists(format!(
                "rule `{id}` already exists"
            )));
        }
        inner.rules.insert(id.clone(), rule);
        Ok(json!({ "registered": true, "id": id }))
    }

    async fn unregister_rule(&self, id: &str) -> Result<Value, GatewayError> {
        let mut inner = self.lock();
        if inner.rules.remove(id).is_none() {
            return Err(GatewayError::not_found(format!("rule `{id}` not found")));
        }
        Ok(json!({ "unregistered": true, "id": id }))
    }

    async fn update_rule(&self, id: &str, definition: &Value) -> Result<Value, GatewayError> {
        let mut rule = parse_rule(definition)?;
        rule.id = Some(id.to_owned());
        let mut inner = self.lock();
        if !inner.rules.contains_key(id) {
            return Err(GatewayError::not_found(format!("rule `{id}` not found")));
        }
        inner.rules.insert(id.to_owned(), rule);
        Ok(json!({ "updated": true, "id": id }))
    }

    async fn enable_rule(&self, id: &str) -> Result<Value, GatewayError> {
        let mut inner = self.lock();
        let rule = inner
            .rules
            .get_mut(id)
            .ok_or_else(|| GatewayError::not_found(format!("rule `{id}` not found")))?;
        rule.enabled = true;
        Ok(json!({ "enabled": true, "id": id }))
    }

    async fn disable_rule(&self, id: &str) -> Result<Value, GatewayError> {
        let mut inner = self.lock();
        let rule = inner
            .rules
            .get_mut(id)
            .ok_or_else(|| GatewayError::not_found(format!("rule `{id}` not found")))?;
        rule.enabled = false;
        Ok(json!({ "enabled": false, "id": id }))
    }

    async fn get_rule(&self, id: &str) -> Result<Value, GatewayError> {
        let inner = self.lock();
        let rule = inner
            .rules
            .get(id)
            .ok_or_else(|| GatewayError::not_found(format!("rule `{id}` not found")))?;
        Ok(serde_json::to_value(rule)?)
    }

    async fn list_rules(&self) -> Result<Value, GatewayError> {
        let inner = self.lock();
        Ok(serde_json::to_value(
            inner.rules.values().collect::<Vec<_>>(),
        )?)
    }

    async fn validate_rule(&self, definition: &Value) -> Result<Value, GatewayError> {
        match parse_rule(definition) {
            Ok(_) => Ok(json!({ "valid": true })),
            Err(e) => Ok(json!({ "valid": false, "errors": [e.message] })),
        }
    }

    async fn subscribe(
        &self,
        pattern: &str,
        sink: PushSink,
    ) -> Result<SubscriptionGuard, GatewayError> {
        let mut inner = self.lock();
        let id = inner.next_sub_id;
        inner.next_sub_id += 1;
        inner.subscriptions.push(RuleSub {
            id,
            pattern: pattern.to_owned(),
            sink,
        });
        let handle = Arc::clone(&self.inner);
        Ok(SubscriptionGuard::new(move || {
            handle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .subscriptions
                .retain(|s| s.id != id);
        }))
    }

    async fn stats(&self) -> Result<Value, GatewayError> {
        let inner = self.lock();
        Ok(json!({
            "rules": inner.rules.len(),
            "facts": inner.facts.len(),
            "subscriptions": inner.subscriptions.len(),
            "emitted": inner.counters.emitted,
            "delivered": inner.counters.delivered,
            "fired": inner.counters.fired,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_sink() -> (PushSink, Arc<AtomicUsize>, Arc<Mutex<Vec<Value>>>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_count = Arc::clone(&count);
        let sink_seen = Arc::clone(&seen);
        let sink: PushSink = Arc::new(move |value| {
            sink_count.fetch_add(1, Ordering::SeqCst);
            sink_seen.lock().unwrap().push(value);
        });
        (sink, count, seen)
    }

    #[tokio::test]
    async fn facts_round_trip_and_delete_leaves_null() {
        let rules = MemoryRules::new();
        rules.set_fact("door.open", &json!(true)).await.unwrap();
        assert_eq!(rules.get_fact("door.open").await.unwrap(), json!(true));
        assert_eq!(
            rules.delete_fact("door.open").await.unwrap(),
            json!({ "deleted": true })
        );
        assert_eq!(rules.get_fact("door.open").await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn query_facts_matches_wildcard_keys() {
        let rules = MemoryRules::new();
        rules.set_fact("room.a.temp", &json!(20)).await.unwrap();
        rules.set_fact("room.b.temp", &json!(22)).await.unwrap();
        rules.set_fact("hall.temp", &json!(18)).await.unwrap();
        let matches = rules.query_facts("room.*").await.unwrap();
        let keys: Vec<&String> = matches.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["room.a.temp", "room.b.temp"]);
    }

    #[tokio::test]
    async fn emit_delivers_topic_envelopes_to_matching_subscribers() {
        let rules = MemoryRules::new();
        let (sink, count, seen) = counting_sink();
        let guard = rules.subscribe("orders.*", sink).await.unwrap();

        rules
            .emit("orders.created", &json!({ "orderId": 7 }))
            .await
            .unwrap();
        rules.emit("billing.charged", &json!({})).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        {
            let seen = seen.lock().unwrap();
            assert_eq!(seen[0]["topic"], "orders.created");
            assert_eq!(seen[0]["event"]["orderId"], 7);
        }

        guard.detach();
        rules.emit("orders.created", &json!({})).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1, "no delivery after detach");
    }

    #[tokio::test]
    async fn emit_correlated_stamps_the_envelope() {
        let rules = MemoryRules::new();
        let (sink, _, seen) = counting_sink();
        let _guard = rules.subscribe("*", sink).await.unwrap();
        rules
            .emit_correlated("jobs.done", &json!({}), "corr-1")
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap()[0]["correlationId"], "corr-1");
    }

    #[tokio::test]
    async fn rules_cascade_and_disable_stops_them() {
        let rules = MemoryRules::new();
        rules
            .register_rule(&json!({
                "id": "escalate",
                "topic": "alarm.raised",
                "actions": [
                    { "action": "emit", "topic": "pager.notify", "event": { "level": "high" } },
                    { "action": "setFact", "key": "alarm.active", "value": true },
                ]
            }))
            .await
            .unwrap();

        let (sink, count, _) = counting_sink();
        let _guard = rules.subscribe("pager.*", sink).await.unwrap();

        rules.emit("alarm.raised", &json!({})).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1, "derived emit delivered");
        assert_eq!(rules.get_fact("alarm.active").await.unwrap(), json!(true));

        rules.disable_rule("escalate").await.unwrap();
        rules.emit("alarm.raised", &json!({})).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1, "disabled rule stays quiet");
    }

    #[tokio::test]
    async fn self_triggering_rule_is_bounded_by_the_cascade_cap() {
        let rules = MemoryRules::new();
        rules
            .register_rule(&json!({
                "id": "loop",
                "topic": "tick",
                "actions": [{ "action": "emit", "topic": "tick", "event": {} }]
            }))
            .await
            .unwrap();
        // Must terminate.
        let result = rules.emit("tick", &json!({})).await.unwrap();
        assert_eq!(result["emitted"], true);
    }

    #[tokio::test]
    async fn rule_registry_crud_and_validation() {
        let rules = MemoryRules::new();
        let err = rules.get_rule("nope").await.unwrap_err();
        assert_eq!(err.code, gate_protocol::ErrorCode::NotFound);

        rules
            .register_rule(&json!({ "id": "r1", "topic": "a.b" }))
            .await
            .unwrap();
        let err = rules
            .register_rule(&json!({ "id": "r1", "topic": "a.b" }))
            .await
            .unwrap_err();
        assert_eq!(err.code, gate_protocol::ErrorCode::AlreadyExists);

        rules
            .update_rule("r1", &json!({ "topic": "a.c" }))
            .await
            .unwrap();
        assert_eq!(rules.get_rule("r1").await.unwrap()["topic"], "a.c");

        let ok = rules.validate_rule(&json!({ "topic": "x.*" })).await.unwrap();
        assert_eq!(ok["valid"], true);
        let bad = rules.validate_rule(&json!({ "actions": 4 })).await.unwrap();
        assert_eq!(bad["valid"], false);

        rules.unregister_rule("r1").await.unwrap();
        assert_eq!(rules.list_rules().await.unwrap(), json!([]));
    }
}
