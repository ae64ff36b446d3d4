//! Callback-to-inbox inversion for subscription pushes.
//!
//! Engines call the sink from their own context; the sink only enqueues
//! into the owning connection's inbox, so engine threads never touch socket
//! or session state.

use crate::supervisor::ActorMessage;
use gate_core::backend::{PushSink, SubscriptionGuard};
use gate_protocol::Channel;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// One live subscription owned by a connection.
#[derive(Debug)]
pub struct SubscriptionEntry {
    pub channel: Channel,
    pub guard: SubscriptionGuard,
}

/// Build the sink handed to an engine for one subscription.
///
/// A full (or closed) inbox drops the push: pushes are idempotent snapshots,
/// so the next change delivers the current state anyway.
pub fn push_sink(
    inbox: mpsc::Sender<ActorMessage>,
    subscription_id: String,
    channel: Channel,
) -> PushSink {
    Arc::new(move |data| {
        let message = ActorMessage::Push {
            subscription_id: subscription_id.clone(),
            channel,
            data,
        };
        if inbox.try_send(message).is_err() {
            trace!(subscription_id = %subscription_id, "push dropped: inbox unavailable");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn sink_enqueues_push_messages_in_order() {
        let (tx, mut rx) = mpsc::channel(8);
        let sink = push_sink(tx, "s1".to_owned(), Channel::Subscription);
        sink(json!([1]));
        sink(json!([1, 2]));

        for expected in [json!([1]), json!([1, 2])] {
            match rx.recv().await {
                Some(ActorMessage::Push {
                    subscription_id,
                    channel,
                    data,
                }) => {
                    assert_eq!(subscription_id, "s1");
                    assert_eq!(channel, Channel::Subscription);
                    assert_eq!(data, expected);
                }
                other => panic!("expected push, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn sink_drops_when_the_inbox_is_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = push_sink(tx, "s1".to_owned(), Channel::Event);
        sink(json!(1));
        sink(json!(2)); // dropped, capacity 1
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }
}
