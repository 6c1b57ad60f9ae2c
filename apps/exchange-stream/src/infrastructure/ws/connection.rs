//! Connection Handle
//!
//! One physical WebSocket to one endpoint. A send loop drains the outbound
//! queue and a receive loop decodes inbound frames and hands each unit to a
//! [`FrameHandler`] in arrival order.
//!
//! Handles are crash-only: when the socket fails both loops stop, the
//! handle is marked dead, and a [`ConnectionEvent::Closed`] tells the owner
//! to replace it. A handle is never repaired in place.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::codec::{DecodedFrame, JsonCodec};
use crate::domain::subscription::ConnId;
use crate::infrastructure::config::ConnectionSettings;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One-shot callback for a correlated reply.
pub type ReplyCallback = Box<dyn FnOnce(Value) + Send>;

// =============================================================================
// Errors and Events
// =============================================================================

/// Connection failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    /// Dialing failed.
    #[error("connect to {url} failed: {reason}")]
    Connect {
        /// Endpoint URL.
        url: String,
        /// Underlying failure.
        reason: String,
    },

    /// Dialing did not finish in time.
    #[error("connect to {url} timed out")]
    ConnectTimeout {
        /// Endpoint URL.
        url: String,
    },

    /// Reading from the socket failed.
    #[error("read failed: {0}")]
    Read(String),

    /// A frame could not be encoded.
    #[error("encode failed: {0}")]
    Encode(String),

    /// The peer reset the connection.
    #[error("connection reset by peer")]
    Reset,

    /// The stream ended without a close frame.
    #[error("unexpected end of stream")]
    Eof,

    /// The peer sent a close frame.
    #[error("closed by peer ({code}): {reason}")]
    Closed {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },

    /// The connection is no longer accepting frames.
    #[error("send queue closed")]
    SendQueueClosed,

    /// The outbound queue is full.
    #[error("send queue full")]
    SendQueueFull,

    /// The endpoint client was closed.
    #[error("endpoint client closed")]
    ClientClosed,
}

/// Where a frame came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameOrigin {
    /// Key of the endpoint client owning the connection.
    pub client_key: Arc<str>,
    /// Connection id within that client.
    pub conn_id: ConnId,
}

/// Lifecycle events reported to the connection owner.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The receive loop stopped on an error.
    Closed {
        /// Connection that failed.
        origin: FrameOrigin,
        /// What ended it.
        error: ConnectionError,
    },
}

/// Consumer of decoded inbound units.
pub trait FrameHandler: Send + Sync + 'static {
    /// Handle one decoded unit that matched no pending reply.
    fn on_unit(&self, origin: &FrameOrigin, unit: Value);

    /// Handle heartbeat traffic.
    fn on_heartbeat(&self, _origin: &FrameOrigin) {}

    /// A frame that did not decode was dropped.
    fn on_malformed(&self, _origin: &FrameOrigin) {}
}

// =============================================================================
// Handle
// =============================================================================

struct Inner {
    origin: FrameOrigin,
    url: String,
    correlation_field: &'static str,
    outbound: mpsc::Sender<Message>,
    pending: Mutex<HashMap<String, ReplyCallback>>,
    alive: AtomicBool,
    cancel: CancellationToken,
    codec: JsonCodec,
}

/// Cloneable handle to one live connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("origin", &self.inner.origin)
            .field("url", &self.inner.url)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    /// Dial `url` and start the send and receive loops.
    ///
    /// # Errors
    ///
    /// Returns an error if dialing fails or exceeds the connect timeout.
    pub async fn connect(
        url: &str,
        origin: FrameOrigin,
        settings: &ConnectionSettings,
        correlation_field: &'static str,
        handler: Arc<dyn FrameHandler>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Self, ConnectionError> {
        info!(url, conn_id = origin.conn_id, "Connecting");

        let (ws, _response) =
            tokio::time::timeout(settings.connect_timeout, tokio_tungstenite::connect_async(url))
                .await
                .map_err(|_| ConnectionError::ConnectTimeout {
                    url: url.to_string(),
                })?
                .map_err(|e| ConnectionError::Connect {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;

        let (sink, stream) = ws.split();
        let (outbound, rx) = mpsc::channel(settings.send_queue_capacity.max(1));

        let inner = Arc::new(Inner {
            origin,
            url: url.to_string(),
            correlation_field,
            outbound,
            pending: Mutex::new(HashMap::new()),
            alive: AtomicBool::new(true),
            cancel: CancellationToken::new(),
            codec: JsonCodec::new(),
        });

        tokio::spawn(send_loop(
            sink,
            rx,
            inner.cancel.clone(),
            inner.origin.conn_id,
        ));
        tokio::spawn(receive_loop(Arc::clone(&inner), stream, handler, events));

        info!(url, conn_id = inner.origin.conn_id, "Connected");
        Ok(Self { inner })
    }

    /// Enqueue a text frame, waiting while the send queue is full.
    ///
    /// `reply` registers a one-shot callback for the reply carrying the
    /// given correlation id.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::SendQueueClosed`] if the connection is dead.
    pub async fn write(
        &self,
        text: String,
        reply: Option<(String, ReplyCallback)>,
    ) -> Result<(), ConnectionError> {
        if !self.is_alive() {
            return Err(ConnectionError::SendQueueClosed);
        }

        let correlation_id = reply.map(|(id, callback)| {
            self.inner.pending.lock().insert(id.clone(), callback);
            id
        });

        if self.inner.outbound.send(Message::Text(text.into())).await.is_err() {
            if let Some(id) = correlation_id {
                self.inner.pending.lock().remove(&id);
            }
            return Err(ConnectionError::SendQueueClosed);
        }
        Ok(())
    }

    /// Enqueue a text frame without waiting.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue is full or the connection is dead.
    pub fn try_write(&self, text: String) -> Result<(), ConnectionError> {
        if !self.is_alive() {
            return Err(ConnectionError::SendQueueClosed);
        }
        self.inner
            .outbound
            .try_send(Message::Text(text.into()))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ConnectionError::SendQueueFull,
                mpsc::error::TrySendError::Closed(_) => ConnectionError::SendQueueClosed,
            })
    }

    /// Request a graceful shutdown. No close event is reported.
    pub fn close(&self) {
        self.inner.shutdown();
    }

    /// Connection id.
    #[must_use]
    pub fn conn_id(&self) -> ConnId {
        self.inner.origin.conn_id
    }

    /// Origin stamped on frames from this connection.
    #[must_use]
    pub fn origin(&self) -> &FrameOrigin {
        &self.inner.origin
    }

    /// Endpoint URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Whether both loops are still running.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    /// Number of replies still awaited.
    #[must_use]
    pub fn pending_replies(&self) -> usize {
        self.inner.pending.lock().len()
    }
}

impl Inner {
    fn shutdown(&self) {
        self.alive.store(false, Ordering::Release);
        self.cancel.cancel();
        self.pending.lock().clear();
    }

    fn take_reply(&self, unit: &Value) -> Option<ReplyCallback> {
        let id = match unit.get(self.correlation_field)? {
            Value::String(s) if !s.is_empty() => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        self.pending.lock().remove(&id)
    }

    fn dispatch_text(&self, text: &str, handler: &dyn FrameHandler) {
        match self.codec.decode(text) {
            Ok(DecodedFrame::Heartbeat) => handler.on_heartbeat(&self.origin),
            Ok(DecodedFrame::Units(units)) => {
                for unit in units {
                    if let Some(callback) = self.take_reply(&unit) {
                        callback(unit);
                    } else {
                        handler.on_unit(&self.origin, unit);
                    }
                }
            }
            Err(e) => {
                warn!(
                    conn_id = self.origin.conn_id,
                    error = %e,
                    "Dropping malformed frame"
                );
                handler.on_malformed(&self.origin);
            }
        }
    }
}

// =============================================================================
// Loops
// =============================================================================

async fn send_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut rx: mpsc::Receiver<Message>,
    cancel: CancellationToken,
    conn_id: ConnId,
) {
    loop {
        let first = tokio::select! {
            () = cancel.cancelled() => {
                drain(&mut sink, &mut rx, conn_id).await;
                break;
            }
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        match write_batch(&mut sink, first, &mut rx).await {
            Ok(count) if count > 1 => debug!(conn_id, count, "Flushed coalesced frames"),
            Ok(_) => {}
            Err(e) => {
                warn!(conn_id, error = %e, "Send failed, stopping send loop");
                return;
            }
        }
    }

    let _ = sink.close().await;
    debug!(conn_id, "Send loop stopped");
}

/// Flush frames enqueued before a graceful close.
async fn drain(
    sink: &mut SplitSink<WsStream, Message>,
    rx: &mut mpsc::Receiver<Message>,
    conn_id: ConnId,
) {
    rx.close();
    let Some(first) = rx.recv().await else {
        return;
    };
    match write_batch(sink, first, rx).await {
        Ok(count) => debug!(conn_id, count, "Flushed queued frames before close"),
        Err(e) => warn!(conn_id, error = %e, "Flush before close failed"),
    }
}

/// Write `first` plus any backlog, then flush once.
async fn write_batch(
    sink: &mut SplitSink<WsStream, Message>,
    first: Message,
    rx: &mut mpsc::Receiver<Message>,
) -> Result<usize, tungstenite::Error> {
    sink.feed(first).await?;
    let mut count = 1;
    while let Ok(next) = rx.try_recv() {
        sink.feed(next).await?;
        count += 1;
    }
    sink.flush().await?;
    Ok(count)
}

async fn receive_loop(
    inner: Arc<Inner>,
    mut stream: SplitStream<WsStream>,
    handler: Arc<dyn FrameHandler>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    let error = loop {
        let msg = tokio::select! {
            () = inner.cancel.cancelled() => {
                debug!(conn_id = inner.origin.conn_id, "Receive loop cancelled");
                inner.shutdown();
                return;
            }
            msg = stream.next() => msg,
        };

        match msg {
            Some(Ok(Message::Text(text))) => inner.dispatch_text(text.as_str(), handler.as_ref()),
            Some(Ok(Message::Pong(_))) => handler.on_heartbeat(&inner.origin),
            Some(Ok(Message::Close(frame))) => {
                break frame.map_or(
                    ConnectionError::Closed {
                        code: 1005,
                        reason: String::new(),
                    },
                    |f| ConnectionError::Closed {
                        code: u16::from(f.code),
                        reason: f.reason.to_string(),
                    },
                );
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => break classify(e),
            None => break ConnectionError::Eof,
        }
    };

    inner.shutdown();
    warn!(
        url = %inner.url,
        conn_id = inner.origin.conn_id,
        error = %error,
        "Connection lost"
    );
    let _ = events.send(ConnectionEvent::Closed {
        origin: inner.origin.clone(),
        error,
    });
}

fn classify(error: tungstenite::Error) -> ConnectionError {
    match error {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            ConnectionError::Eof
        }
        tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            ConnectionError::Reset
        }
        tungstenite::Error::Io(io) => match io.kind() {
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => ConnectionError::Reset,
            std::io::ErrorKind::UnexpectedEof => ConnectionError::Eof,
            _ => ConnectionError::Read(io.to_string()),
        },
        other => ConnectionError::Read(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        units: Mutex<Vec<Value>>,
        heartbeats: Mutex<usize>,
        malformed: Mutex<usize>,
    }

    impl FrameHandler for Recorder {
        fn on_unit(&self, _origin: &FrameOrigin, unit: Value) {
            self.units.lock().push(unit);
        }

        fn on_heartbeat(&self, _origin: &FrameOrigin) {
            *self.heartbeats.lock() += 1;
        }

        fn on_malformed(&self, _origin: &FrameOrigin) {
            *self.malformed.lock() += 1;
        }
    }

    fn origin() -> FrameOrigin {
        FrameOrigin {
            client_key: Arc::from("test"),
            conn_id: 1,
        }
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    /// Server that pushes `script` frames after the first client frame,
    /// echoes every client frame back, then closes with `close_code`.
    async fn spawn_server(script: Vec<&'static str>, close_code: Option<u16>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            if let Some(Ok(Message::Text(first))) = ws.next().await {
                ws.send(Message::Text(first)).await.unwrap();
            }
            for frame in script {
                ws.send(Message::Text(frame.into())).await.unwrap();
            }
            if let Some(code) = close_code {
                ws.close(Some(tungstenite::protocol::CloseFrame {
                    code: code.into(),
                    reason: "bye".into(),
                }))
                .await
                .unwrap();
            }
            while ws.next().await.is_some() {}
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn correlated_reply_goes_to_callback() {
        let url = spawn_server(vec![r#"{"arg":{"channel":"trades"}}"#], None).await;
        let recorder = Arc::new(Recorder::default());
        let (events, _rx) = mpsc::unbounded_channel();
        let conn = ConnectionHandle::connect(
            &url,
            origin(),
            &ConnectionSettings::default(),
            "id",
            recorder.clone(),
            events,
        )
        .await
        .unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        conn.write(
            r#"{"id":"abc","op":"subscribe"}"#.to_string(),
            Some(("abc".to_string(), Box::new(move |v| drop(tx.send(v))))),
        )
        .await
        .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
        assert_eq!(reply["op"], "subscribe");

        eventually(|| recorder.units.lock().len() == 1).await;
        assert_eq!(recorder.units.lock()[0]["arg"]["channel"], "trades");
        assert_eq!(conn.pending_replies(), 0);
    }

    #[tokio::test]
    async fn array_frames_keep_order_and_pong_is_heartbeat() {
        let url = spawn_server(vec![r#"[{"n":1},{"n":2}]"#, "pong", "not json", r#"{"n":3}"#], None).await;
        let recorder = Arc::new(Recorder::default());
        let (events, _rx) = mpsc::unbounded_channel();
        let conn = ConnectionHandle::connect(
            &url,
            origin(),
            &ConnectionSettings::default(),
            "id",
            recorder.clone(),
            events,
        )
        .await
        .unwrap();

        // The echoed "hello" and "not json" do not decode.
        conn.write("hello".to_string(), None).await.unwrap();
        eventually(|| recorder.units.lock().len() == 3).await;
        eventually(|| *recorder.malformed.lock() == 2).await;

        let order: Vec<i64> = recorder
            .units
            .lock()
            .iter()
            .filter_map(|u| u.get("n").and_then(Value::as_i64))
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(*recorder.heartbeats.lock(), 1);
        assert!(conn.is_alive());
    }

    #[tokio::test]
    async fn peer_close_reports_code() {
        let url = spawn_server(vec![], Some(1013)).await;
        let recorder = Arc::new(Recorder::default());
        let (events, mut rx) = mpsc::unbounded_channel();
        let conn = ConnectionHandle::connect(
            &url,
            origin(),
            &ConnectionSettings::default(),
            "id",
            recorder,
            events,
        )
        .await
        .unwrap();
        conn.write("hello".to_string(), None).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let ConnectionEvent::Closed { origin, error } = event;
        assert_eq!(origin.conn_id, 1);
        assert!(matches!(error, ConnectionError::Closed { code: 1013, .. }));
        assert!(!conn.is_alive());
        assert!(matches!(
            conn.write("late".to_string(), None).await,
            Err(ConnectionError::SendQueueClosed)
        ));
    }

    #[tokio::test]
    async fn graceful_close_reports_nothing() {
        let url = spawn_server(vec![], None).await;
        let (events, mut rx) = mpsc::unbounded_channel();
        let conn = ConnectionHandle::connect(
            &url,
            origin(),
            &ConnectionSettings::default(),
            "id",
            Arc::new(Recorder::default()),
            events,
        )
        .await
        .unwrap();

        conn.close();
        assert!(!conn.is_alive());
        let waited = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(!matches!(waited, Ok(Some(_))));
    }

    #[tokio::test]
    async fn close_flushes_queued_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received: Arc<Mutex<Vec<String>>> = Arc::default();
        {
            let received = Arc::clone(&received);
            tokio::spawn(async move {
                let (tcp, _) = listener.accept().await.unwrap();
                let mut ws = accept_async(tcp).await.unwrap();
                while let Some(Ok(msg)) = ws.next().await {
                    if let Message::Text(text) = msg {
                        received.lock().push(text.to_string());
                    }
                }
            });
        }

        let (events, _rx) = mpsc::unbounded_channel();
        let conn = ConnectionHandle::connect(
            &format!("ws://{addr}"),
            origin(),
            &ConnectionSettings::default(),
            "id",
            Arc::new(Recorder::default()),
            events,
        )
        .await
        .unwrap();

        for n in 0..3 {
            conn.write(format!(r#"{{"n":{n}}}"#), None).await.unwrap();
        }
        conn.close();
        assert!(conn.write("late".to_string(), None).await.is_err());

        eventually(|| received.lock().len() == 3).await;
        assert_eq!(received.lock()[2], r#"{"n":2}"#);
    }

    #[tokio::test]
    async fn connect_failure_is_typed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (events, _rx) = mpsc::unbounded_channel();
        let err = ConnectionHandle::connect(
            &format!("ws://{addr}"),
            origin(),
            &ConnectionSettings::default(),
            "id",
            Arc::new(Recorder::default()),
            events,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ConnectionError::Connect { .. }));
    }

    #[test]
    fn classify_io_errors() {
        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert!(matches!(classify(tungstenite::Error::Io(reset)), ConnectionError::Reset));
        assert!(matches!(
            classify(tungstenite::Error::ConnectionClosed),
            ConnectionError::Eof
        ));
    }
}
