//! In-process websocket peer that plays the service side of a session.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::StatusCode,
        Message,
    },
    WebSocketStream,
};

/// What the peer saw from the client, in arrival order.
#[derive(Debug, Clone)]
pub enum Received {
    Json(Value),
    Binary(Vec<u8>),
}

pub struct Peer {
    ws: WebSocketStream<TcpStream>,
    log: Arc<Mutex<Vec<Received>>>,
}

impl Peer {
    /// Next client message, or `None` once the client closes.
    pub async fn recv(&mut self) -> Option<Received> {
        while let Some(msg) = self.ws.next().await {
            let received = match msg.ok()? {
                Message::Text(text) => Received::Json(
                    serde_json::from_str(&text).unwrap_or(Value::String(text)),
                ),
                Message::Binary(bytes) => Received::Binary(bytes),
                Message::Close(_) => return None,
                _ => continue,
            };
            self.log.lock().push(received.clone());
            return Some(received);
        }
        None
    }

    pub async fn recv_json(&mut self) -> Value {
        match self.recv().await {
            Some(Received::Json(v)) => v,
            other => panic!("expected a JSON message, got {other:?}"),
        }
    }

    /// Receive with a deadline; `None` on timeout or close.
    pub async fn recv_within(&mut self, limit: Duration) -> Option<Received> {
        tokio::time::timeout(limit, self.recv()).await.ok().flatten()
    }

    pub async fn send_json(&mut self, value: Value) {
        self.ws
            .send(Message::Text(value.to_string()))
            .await
            .expect("mock send");
    }

    pub async fn send_text(&mut self, raw: &str) {
        self.ws
            .send(Message::Text(raw.to_owned()))
            .await
            .expect("mock send");
    }

    pub async fn send_binary(&mut self, bytes: Vec<u8>) {
        self.ws
            .send(Message::Binary(bytes))
            .await
            .expect("mock send");
    }

    /// Record everything until the client goes away.
    pub async fn drain(&mut self) {
        while self.recv().await.is_some() {}
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

pub struct MockServer {
    pub url: String,
    pub log: Arc<Mutex<Vec<Received>>>,
    task: JoinHandle<()>,
}

impl MockServer {
    /// Accept one connection and run `script` against it.
    pub async fn start<F, Fut>(script: F) -> Self
    where
        F: FnOnce(Peer) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("ws://{}", listener.local_addr().expect("addr"));
        let log = Arc::new(Mutex::new(Vec::new()));
        let peer_log = Arc::clone(&log);
        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let ws = tokio_tungstenite::accept_async(stream)
                .await
                .expect("websocket upgrade");
            script(Peer { ws, log: peer_log }).await;
        });
        Self { url, log, task }
    }

    /// Accept one connection and refuse the upgrade with `status`.
    pub async fn refuse(status: StatusCode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("ws://{}", listener.local_addr().expect("addr"));
        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let reject = move |_req: &Request, _resp: Response| -> Result<Response, ErrorResponse> {
                let mut response = ErrorResponse::new(Some("unauthorized".into()));
                *response.status_mut() = status;
                Err(response)
            };
            let _ = tokio_tungstenite::accept_hdr_async(stream, reject).await;
        });
        Self {
            url,
            log: Arc::new(Mutex::new(Vec::new())),
            task,
        }
    }

    /// Wait for the script to finish and return what it recorded.
    pub async fn finish(self) -> Vec<Received> {
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("mock server did not finish")
            .expect("mock server panicked");
        self.log.lock().clone()
    }

    pub fn json_messages(log: &[Received]) -> Vec<Value> {
        log.iter()
            .filter_map(|r| match r {
                Received::Json(v) => Some(v.clone()),
                Received::Binary(_) => None,
            })
            .collect()
    }
}

/// One 20 ms frame of a constant sample value.
pub fn frame_of(value: i16) -> Vec<u8> {
    std::iter::repeat(value.to_le_bytes())
        .take(480)
        .flatten()
        .collect()
}
