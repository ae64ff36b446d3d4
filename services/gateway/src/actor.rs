//! The connection actor.
//!
//! One actor owns one WebSocket.  All connection state (session,
//! subscription map, heartbeat timestamps) is mutated by this task only;
//! concurrency reaches the actor exclusively through its inbox.  Socket
//! writes go through a dedicated writer task so a slow client never stalls
//! request processing; the queued-byte counter drives push backpressure.

use crate::router;
use crate::state::AppState;
use crate::subscriptions::SubscriptionEntry;
use crate::supervisor::{ActorMessage, ConnectionHandle};
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use gate_core::backend::{AuthGrant, PushSink, SubscriptionGuard};
use gate_core::{Session, epoch_ms};
use gate_protocol::{
    Channel, ErrorCode, GatewayError, Inbound, PROTOCOL_VERSION, PingFrame, PushFrame, ServerFrame,
    SystemFrame, Welcome, decode,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

pub const INBOX_CAPACITY: usize = 256;
const OUTBOUND_CAPACITY: usize = 64;

/// Close codes and reasons used on actor-driven closes.
const CLOSE_NORMAL: u16 = 1000;
const CLOSE_HEARTBEAT: u16 = 4001;

enum WriteCommand {
    Frame(String),
    Close { code: u16, reason: &'static str },
}

pub struct ConnectionActor {
    pub connection_id: String,
    pub remote_address: String,
    pub state: AppState,
    handle: Arc<ConnectionHandle>,
    inbox_tx: mpsc::Sender<ActorMessage>,
    pub(crate) session: Option<Session>,
    pub(crate) session_token: Option<String>,
    subscriptions: HashMap<String, SubscriptionEntry>,
    next_subscription_id: u64,
    last_ping_at: Option<i64>,
    last_pong_at: Option<i64>,
    outbound_tx: mpsc::Sender<WriteCommand>,
    outbound_rx: Option<mpsc::Receiver<WriteCommand>>,
    buffered: Arc<AtomicUsize>,
}

impl ConnectionActor {
    pub fn new(
        connection_id: String,
        remote_address: String,
        state: AppState,
        handle: Arc<ConnectionHandle>,
        inbox_tx: mpsc::Sender<ActorMessage>,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        ConnectionActor {
            connection_id,
            remote_address,
            state,
            handle,
            inbox_tx,
            session: None,
            session_token: None,
            subscriptions: HashMap::new(),
            next_subscription_id: 1,
            last_ping_at: None,
            last_pong_at: None,
            outbound_tx,
            outbound_rx: Some(outbound_rx),
            buffered: Arc::new(AtomicUsize::new(0)),
        }
    }

    // -----------------------------------------------------------------------
    // Session and subscription bookkeeping (called from handlers)
    // -----------------------------------------------------------------------

    pub fn install_session(&mut self, grant: &AuthGrant) {
        self.session = Some(grant.session.clone());
        self.session_token = Some(grant.token.clone());
        self.handle.set_auth(Some(grant.session.user_id.clone()));
    }

    pub fn clear_session(&mut self) {
        self.session = None;
        self.session_token = None;
        self.handle.set_auth(None);
    }

    pub fn ensure_subscription_capacity(&self) -> Result<(), GatewayError> {
        let max = self.state.config.limits.max_subscriptions_per_connection;
        if self.subscriptions.len() >= max {
            return Err(GatewayError::new(
                ErrorCode::RateLimited,
                format!("subscription limit of {max} per connection reached"),
            ));
        }
        Ok(())
    }

    pub fn allocate_subscription_id(&mut self) -> String {
        let id = format!("s{}", self.next_subscription_id);
        self.next_subscription_id += 1;
        id
    }

    pub fn push_sink(&self, subscription_id: String, channel: Channel) -> PushSink {
        crate::subscriptions::push_sink(self.inbox_tx.clone(), subscription_id, channel)
    }

    pub fn insert_subscription(&mut self, id: String, channel: Channel, guard: SubscriptionGuard) {
        self.subscriptions
            .insert(id, SubscriptionEntry { channel, guard });
        self.sync_subscription_counts();
    }

    pub fn remove_subscription(&mut self, id: &str) -> Option<SubscriptionEntry> {
        let entry = self.subscriptions.remove(id);
        if entry.is_some() {
            self.sync_subscription_counts();
        }
        entry
    }

    fn sync_subscription_counts(&self) {
        let store = self
            .subscriptions
            .values()
            .filter(|e| e.channel == Channel::Subscription)
            .count();
        self.handle
            .set_subscription_counts(store, self.subscriptions.len() - store);
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Queue a request/response or control frame; always written.
    async fn send_frame(&self, frame: &ServerFrame) {
        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!(connection_id = %self.connection_id, error = %e, "failed to encode frame");
                return;
            }
        };
        let len = text.len();
        self.buffered.fetch_add(len, Ordering::SeqCst);
        if self.outbound_tx.send(WriteCommand::Frame(text)).await.is_err() {
            self.buffered.fetch_sub(len, Ordering::SeqCst);
        }
    }

    /// Queue a push frame; silently dropped above the backpressure
    /// threshold.  The next change delivers the current snapshot, so only
    /// latency degrades.
    fn send_push(&self, frame: &ServerFrame) {
        let Ok(text) = frame.encode() else { return };
        let threshold = self.state.config.limits.backpressure_threshold();
        if self.buffered.load(Ordering::SeqCst) > threshold {
            trace!(connection_id = %self.connection_id, "push dropped under backpressure");
            return;
        }
        let len = text.len();
        self.buffered.fetch_add(len, Ordering::SeqCst);
        if self.outbound_tx.try_send(WriteCommand::Frame(text)).is_err() {
            self.buffered.fetch_sub(len, Ordering::SeqCst);
            trace!(connection_id = %self.connection_id, "push dropped: outbound queue full");
        }
    }

    // -----------------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------------

    pub async fn run(mut self, socket: WebSocket, mut inbox: mpsc::Receiver<ActorMessage>) {
        let (sink, mut stream) = socket.split();
        let Some(outbound_rx) = self.outbound_rx.take() else {
            return;
        };
        let writer = tokio::spawn(writer_task(sink, outbound_rx, Arc::clone(&self.buffered)));

        self.send_frame(&ServerFrame::Welcome(Welcome {
            version: PROTOCOL_VERSION.to_owned(),
            server_time: epoch_ms(),
            requires_auth: self.state.config.auth.required,
        }))
        .await;

        let mut heartbeat = tokio::time::interval(Duration::from_millis(
            self.state.config.heartbeat.interval_ms,
        ));
        heartbeat.tick().await; // consume the immediate first tick

        let close = loop {
            tokio::select! {
                biased;
                msg = inbox.recv() => match msg {
                    Some(ActorMessage::Push { subscription_id, channel, data }) => {
                        // A push may race a just-removed subscription; only
                        // forward for ids this connection still owns.
                        if self.subscriptions.contains_key(&subscription_id) {
                            self.send_push(&ServerFrame::Push(PushFrame {
                                channel,
                                subscription_id,
                                data,
                            }));
                        }
                    }
                    Some(ActorMessage::ShutdownNotice { grace_period_ms }) => {
                        self.send_frame(&ServerFrame::System(SystemFrame {
                            event: "shutdown".to_owned(),
                            grace_period_ms: Some(grace_period_ms),
                        }))
                        .await;
                    }
                    Some(ActorMessage::Terminate) => {
                        break Some((CLOSE_NORMAL, "server_shutdown"));
                    }
                    None => break Some((CLOSE_NORMAL, "normal_closure")),
                },
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()).await,
                    Some(Ok(Message::Close(_))) | None => break None,
                    Some(Ok(_)) => {} // protocol pings are answered by the transport
                    Some(Err(e)) => {
                        debug!(connection_id = %self.connection_id, error = %e, "socket error");
                        break None;
                    }
                },
                _ = heartbeat.tick() => {
                    if heartbeat_missed(self.last_ping_at, self.last_pong_at) {
                        info!(connection_id = %self.connection_id, "heartbeat timeout");
                        break Some((CLOSE_HEARTBEAT, "heartbeat_timeout"));
                    }
                    let now = epoch_ms();
                    self.send_frame(&ServerFrame::Ping(PingFrame { timestamp: now })).await;
                    self.last_ping_at = Some(now);
                }
            }
        };
        self.teardown(close, writer).await;
    }

    async fn handle_text(&mut self, text: &str) {
        match decode(text) {
            Ok(Inbound::Request(req)) => {
                trace!(connection_id = %self.connection_id, op = %req.op, "request");
                let frame = router::process(self, req).await;
                self.send_frame(&frame).await;
            }
            Ok(Inbound::Pong { .. }) => {
                self.last_pong_at = Some(epoch_ms());
            }
            Ok(Inbound::Ignored) => {}
            Err(err) => {
                self.send_frame(&ServerFrame::error_without_id(err)).await;
            }
        }
    }

    /// Fixed teardown order: subscriptions, then session, then the close
    /// frame.  No push can be fanned out after the close frame because the
    /// loop has exited and every source is detached first.
    async fn teardown(mut self, close: Option<(u16, &'static str)>, writer: JoinHandle<()>) {
        for (_, entry) in self.subscriptions.drain() {
            entry.guard.detach();
        }
        self.handle.set_subscription_counts(0, 0);
        self.clear_session();

        if let Some((code, reason)) = close {
            let _ = self.outbound_tx.send(WriteCommand::Close { code, reason }).await;
        }
        info!(connection_id = %self.connection_id, "connection closed");
        drop(self); // closes the outbound queue so the writer drains and ends

        let mut writer = writer;
        if tokio::time::timeout(Duration::from_secs(1), &mut writer)
            .await
            .is_err()
        {
            writer.abort();
        }
    }
}

/// A ping is outstanding with no pong at or after it.
fn heartbeat_missed(last_ping_at: Option<i64>, last_pong_at: Option<i64>) -> bool {
    match (last_ping_at, last_pong_at) {
        (Some(ping), Some(pong)) => pong < ping,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

async fn writer_task(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<WriteCommand>,
    buffered: Arc<AtomicUsize>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            WriteCommand::Frame(text) => {
                let len = text.len();
                let result = sink.send(Message::Text(text.into())).await;
                buffered.fetch_sub(len, Ordering::SeqCst);
                if result.is_err() {
                    break;
                }
            }
            WriteCommand::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_missed_requires_an_unanswered_ping() {
        // No ping sent yet: never a timeout.
        assert!(!heartbeat_missed(None, None));
        assert!(!heartbeat_missed(None, Some(10)));
        // Ping sent, no pong at all.
        assert!(heartbeat_missed(Some(10), None));
        // Pong older than the last ping.
        assert!(heartbeat_missed(Some(10), Some(9)));
        // Pong at or after the last ping.
        assert!(!heartbeat_missed(Some(10), Some(10)));
        assert!(!heartbeat_missed(Some(10), Some(11)));
    }
}
