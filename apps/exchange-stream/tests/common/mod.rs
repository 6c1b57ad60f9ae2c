//! Scripted OKX-style exchange for engine integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use exchange_stream::{
    Credentials, EngineConfig, MarketInfo, MarketType, OkxProtocol, StaticMarketCatalog,
    StreamEngine,
};

enum Command {
    Push(String),
    Drop,
}

/// Local WebSocket server speaking enough of the OKX protocol.
///
/// Every JSON frame a client sends is recorded. Subscribe requests are
/// acknowledged, logins succeed after `login_delay`.
pub struct MockExchange {
    pub url: String,
    frames: Arc<Mutex<Vec<Value>>>,
    conns: Arc<Mutex<Vec<mpsc::UnboundedSender<Command>>>>,
    accepted: Arc<AtomicUsize>,
}

impl MockExchange {
    pub async fn start() -> Self {
        Self::with_login_delay(Duration::ZERO).await
    }

    pub async fn with_login_delay(login_delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let frames: Arc<Mutex<Vec<Value>>> = Arc::default();
        let conns: Arc<Mutex<Vec<mpsc::UnboundedSender<Command>>>> = Arc::default();
        let accepted = Arc::new(AtomicUsize::new(0));

        {
            let frames = Arc::clone(&frames);
            let conns = Arc::clone(&conns);
            let accepted = Arc::clone(&accepted);
            tokio::spawn(async move {
                while let Ok((tcp, _)) = listener.accept().await {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    let (tx, rx) = mpsc::unbounded_channel();
                    conns.lock().push(tx);
                    tokio::spawn(serve(tcp, rx, Arc::clone(&frames), login_delay));
                }
            });
        }

        Self {
            url: format!("ws://{addr}"),
            frames,
            conns,
            accepted,
        }
    }

    /// Engine talking to this server, with fast reconnects.
    pub fn engine(&self, markets: StaticMarketCatalog, config: EngineConfig) -> StreamEngine {
        StreamEngine::new(
            Arc::new(OkxProtocol::with_base_url(self.url.clone())),
            Arc::new(markets),
            config,
        )
    }

    /// Frames received so far whose `op` matches.
    pub fn frames(&self, op: &str) -> Vec<Value> {
        self.frames
            .lock()
            .iter()
            .filter(|f| f["op"] == op)
            .cloned()
            .collect()
    }

    /// `op` of every frame received so far, in arrival order.
    pub fn ops(&self) -> Vec<String> {
        self.frames
            .lock()
            .iter()
            .filter_map(|f| f["op"].as_str().map(ToString::to_string))
            .collect()
    }

    /// Every `args` entry of the frames whose `op` matches.
    pub fn args(&self, op: &str) -> Vec<Value> {
        self.frames(op)
            .iter()
            .flat_map(|f| f["args"].as_array().cloned().unwrap_or_default())
            .collect()
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Push a text frame on every open connection.
    pub fn push(&self, unit: &Value) {
        let text = unit.to_string();
        self.conns
            .lock()
            .retain(|tx| tx.send(Command::Push(text.clone())).is_ok());
    }

    /// Drop every open connection without a close handshake.
    pub fn drop_connections(&self) {
        for tx in self.conns.lock().drain(..) {
            let _ = tx.send(Command::Drop);
        }
    }
}

async fn serve(
    tcp: tokio::net::TcpStream,
    mut commands: mpsc::UnboundedReceiver<Command>,
    frames: Arc<Mutex<Vec<Value>>>,
    login_delay: Duration,
) {
    let Ok(mut ws) = accept_async(tcp).await else {
        return;
    };
    loop {
        tokio::select! {
            msg = ws.next() => {
                let Some(Ok(msg)) = msg else { break };
                let Message::Text(text) = msg else { continue };
                if text.as_str() == "ping" {
                    let _ = ws.send(Message::Text("pong".to_string().into())).await;
                    continue;
                }
                let Ok(value) = serde_json::from_str::<Value>(text.as_str()) else {
                    continue;
                };
                frames.lock().push(value.clone());

                let reply = match value["op"].as_str() {
                    Some("login") => {
                        tokio::time::sleep(login_delay).await;
                        json!({"event": "login", "code": "0", "msg": ""})
                    }
                    Some(op @ ("subscribe" | "unsubscribe")) => {
                        json!({"id": value["id"], "event": op, "arg": value["args"][0]})
                    }
                    _ => continue,
                };
                if ws.send(Message::Text(reply.to_string().into())).await.is_err() {
                    break;
                }
            }
            command = commands.recv() => match command {
                Some(Command::Push(text)) => {
                    if ws.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(Command::Drop) | None => break,
            },
        }
    }
}

pub fn market(symbol: &str, wire_id: &str, market_type: MarketType) -> MarketInfo {
    let (base, rest) = symbol.split_once('/').unwrap();
    let quote = rest.split(':').next().unwrap();
    MarketInfo {
        symbol: symbol.to_string(),
        wire_id: wire_id.to_string(),
        market_type,
        base: base.to_string(),
        quote: quote.to_string(),
    }
}

pub fn spot_catalog() -> StaticMarketCatalog {
    StaticMarketCatalog::spot(&["BTC/USDT".to_string(), "ETH/USDT".to_string()], "-")
}

/// Configuration with quick reconnects and one funded account.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.reconnect.max_delay = Duration::from_millis(200);
    config.reconnect.jitter = 0.0;
    config.auth.login_timeout = Duration::from_secs(2);
    config.accounts.insert(
        config.default_account.clone(),
        Credentials::new("key".into(), "secret".into(), Some("pass".into())),
    );
    config
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

pub fn books5(inst_id: &str, bids: &[(&str, &str)], asks: &[(&str, &str)]) -> Value {
    let side = |levels: &[(&str, &str)]| -> Vec<Value> {
        levels.iter().map(|(p, s)| json!([p, s, "0", "1"])).collect()
    };
    json!({
        "arg": {"channel": "books5", "instId": inst_id},
        "data": [{"bids": side(bids), "asks": side(asks), "ts": "1700000000000"}]
    })
}

pub fn trade(inst_id: &str, id: &str, px: &str) -> Value {
    json!({
        "arg": {"channel": "trades", "instId": inst_id},
        "data": [{
            "instId": inst_id, "tradeId": id, "px": px, "sz": "0.5",
            "side": "buy", "ts": "1700000000000"
        }]
    })
}
