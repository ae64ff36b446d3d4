use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::time::Duration;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::tungstenite::protocol::Message;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type BoxError = Box<dyn std::error::Error + Send + Sync>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Close code and reason observed on the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

/// A plain JSON-over-WebSocket client for driving the gateway in tests.
pub struct TestClient {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
}

impl TestClient {
    pub async fn connect(url: &str) -> Result<Self, BoxError> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        let (write, read) = ws_stream.split();
        Ok(Self { write, read })
    }

    pub async fn send_json(&mut self, value: &Value) -> Result<(), BoxError> {
        self.write
            .send(Message::Text(value.to_string().into()))
            .await?;
        Ok(())
    }

    pub async fn send_text(&mut self, text: &str) -> Result<(), BoxError> {
        self.write.send(Message::Text(text.to_owned().into())).await?;
        Ok(())
    }

    /// Send a request frame: `{id, type, ...fields}`.
    pub async fn request(&mut self, id: u64, op: &str, fields: Value) -> Result<(), BoxError> {
        let mut frame = json!({ "id": id, "type": op });
        if let Value::Object(extra) = fields {
            for (k, v) in extra {
                frame[k] = v;
            }
        }
        self.send_json(&frame).await
    }

    pub async fn send_pong(&mut self, timestamp: i64) -> Result<(), BoxError> {
        self.send_json(&json!({ "type": "pong", "timestamp": timestamp }))
            .await
    }

    /// Next text frame as JSON, including heartbeat pings.
    pub async fn recv_frame(&mut self) -> Result<Value, BoxError> {
        loop {
            let msg = tokio::time::timeout(RECV_TIMEOUT, self.read.next())
                .await
                .map_err(|_| "timed out waiting for a frame")?;
            match msg {
                Some(Ok(Message::Text(text))) => return Ok(serde_json::from_str(&text)?),
                Some(Ok(Message::Close(frame))) => {
                    let info = frame.map_or_else(
                        || "connection closed".to_owned(),
                        |f| format!("connection closed: {} {}", u16::from(f.code), f.reason),
                    );
                    return Err(info.into());
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }

    /// Next frame that is not a heartbeat ping.
    pub async fn recv_non_ping(&mut self) -> Result<Value, BoxError> {
        loop {
            let frame = self.recv_frame().await?;
            if frame["type"] != "ping" {
                return Ok(frame);
            }
        }
    }

    /// Next terminal frame (`result` or `error`) for the given id, skipping
    /// pings, pushes, and system frames.
    pub async fn recv_response(&mut self, id: u64) -> Result<Value, BoxError> {
        loop {
            let frame = self.recv_non_ping().await?;
            let kind = frame["type"].as_str().unwrap_or_default();
            if (kind == "result" || kind == "error") && frame["id"] == json!(id) {
                return Ok(frame);
            }
        }
    }

    /// Issue a request and unwrap a `result` frame's `data`.
    pub async fn call(&mut self, id: u64, op: &str, fields: Value) -> Result<Value, BoxError> {
        self.request(id, op, fields).await?;
        let frame = self.recv_response(id).await?;
        if frame["type"] != "result" {
            return Err(format!("expected result, got {frame}").into());
        }
        Ok(frame["data"].clone())
    }

    /// Issue a request and expect an `error` frame; returns `(code, frame)`.
    pub async fn call_err(
        &mut self,
        id: u64,
        op: &str,
        fields: Value,
    ) -> Result<(String, Value), BoxError> {
        self.request(id, op, fields).await?;
        let frame = self.recv_response(id).await?;
        if frame["type"] != "error" {
            return Err(format!("expected error, got {frame}").into());
        }
        let code = frame["code"].as_str().unwrap_or_default().to_owned();
        Ok((code, frame))
    }

    /// Wait for the server to close the socket; returns code and reason.
    pub async fn recv_close(&mut self) -> Result<CloseInfo, BoxError> {
        loop {
            let msg = tokio::time::timeout(RECV_TIMEOUT, self.read.next())
                .await
                .map_err(|_| "timed out waiting for close")?;
            match msg {
                Some(Ok(Message::Close(Some(frame)))) => {
                    return Ok(CloseInfo {
                        code: u16::from(frame.code),
                        reason: frame.reason.to_string(),
                    });
                }
                Some(Ok(Message::Close(None))) => {
                    return Ok(CloseInfo {
                        code: 1005,
                        reason: String::new(),
                    });
                }
                Some(Ok(_)) => continue,
                Some(Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)) | None => {
                    return Ok(CloseInfo {
                        code: 1006,
                        reason: String::new(),
                    });
                }
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), BoxError> {
        self.write.send(Message::Close(None)).await?;
        Ok(())
    }
}
