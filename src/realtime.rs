//! Real-time test client.
//!
//! One configurable WebSocket client covers the chat, log-viewer and
//! collaborative-editing scenarios: the room-join event name and payload
//! are caller-supplied, and only subscribed event names are recorded. The
//! session cookie produced by [`crate::HttpSession`] is the sole credential,
//! sent as a `Cookie` header during the handshake.
//!
//! Wire format: JSON text frames `{"event": <name>, "data": <payload>}`.
//! The server's own event protocol semantics are not modeled here.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

pub struct RealtimeClient {
    sink: WsSink,
    received: Arc<Mutex<Vec<Event>>>,
    subscriptions: Arc<Mutex<HashSet<String>>>,
    reader: JoinHandle<()>,
}

impl RealtimeClient {
    /// Open a WebSocket to `url` (a `ws://` endpoint), presenting `cookie`
    /// as the session credential when given. A background reader starts
    /// recording subscribed events immediately.
    pub async fn connect(url: &str, cookie: Option<&str>) -> Result<Self> {
        let mut request = url
            .into_client_request()
            .with_context(|| format!("building websocket request for {url}"))?;
        if let Some(cookie) = cookie {
            request
                .headers_mut()
                .insert(COOKIE, cookie.parse().context("encoding session cookie")?);
        }
        let (stream, _) = connect_async(request)
            .await
            .with_context(|| format!("connecting websocket {url}"))?;
        let (sink, source) = stream.split();
        let received = Arc::new(Mutex::new(Vec::new()));
        let subscriptions = Arc::new(Mutex::new(HashSet::new()));
        let reader = tokio::spawn(read_events(
            source,
            received.clone(),
            subscriptions.clone(),
        ));
        Ok(Self {
            sink,
            received,
            subscriptions,
            reader,
        })
    }

    /// Record incoming frames carrying this event name. Unsubscribed events
    /// are dropped.
    pub fn subscribe(&self, event: &str) {
        self.subscriptions
            .lock()
            .expect("subscription set poisoned")
            .insert(event.to_string());
    }

    pub async fn emit(&mut self, event: &str, data: Value) -> Result<()> {
        let frame = serde_json::to_string(&Event {
            event: event.to_string(),
            data,
        })
        .context("encoding event frame")?;
        self.sink
            .send(Message::Text(frame))
            .await
            .with_context(|| format!("sending {event} event"))
    }

    /// Join a room. The join event name and payload shape belong to the
    /// server under test, e.g. `join_room` with `["rooms_view", 1]` or
    /// `join_log_room` with the tenant name.
    pub async fn join_room(&mut self, join_event: &str, payload: Value) -> Result<()> {
        self.emit(join_event, payload).await
    }

    /// Data payloads of recorded events with this name, in arrival order.
    pub fn events(&self, event: &str) -> Vec<Value> {
        self.received
            .lock()
            .expect("event buffer poisoned")
            .iter()
            .filter(|received| received.event == event)
            .map(|received| received.data.clone())
            .collect()
    }

    pub fn event_count(&self, event: &str) -> usize {
        self.events(event).len()
    }

    /// Best-effort close; the reader task is stopped with it.
    pub async fn close(mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
        self.reader.abort();
    }
}

async fn read_events(
    mut source: WsSource,
    received: Arc<Mutex<Vec<Event>>>,
    subscriptions: Arc<Mutex<HashSet<String>>>,
) {
    while let Some(frame) = source.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(err) => {
                debug!("websocket closed: {err}");
                break;
            }
        };
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(event) = serde_json::from_str::<Event>(&text) else {
            debug!("ignoring non-event frame: {text}");
            continue;
        };
        let wanted = subscriptions
            .lock()
            .map(|subs| subs.contains(&event.event))
            .unwrap_or(false);
        if wanted {
            if let Ok(mut buffer) = received.lock() {
                buffer.push(event);
            }
        }
    }
}
