//! Bybit v5 WebSocket Protocol
//!
//! Subscriptions are combined topic strings (`orderbook.50.BTCUSDT`,
//! `publicTrade.BTCUSDT`, `kline.60.BTCUSDT`, `tickers.BTCUSDT`, `wallet`,
//! `position.linear`, `execution`). Public endpoints are split by category
//! (`spot`, `linear`, `option`); private topics share one endpoint.
//!
//! ```json
//! {"req_id":"…","op":"subscribe","args":["orderbook.50.BTCUSDT"]}
//! {"topic":"orderbook.50.BTCUSDT","type":"snapshot","ts":1672304484978,"data":{"s":"BTCUSDT","b":[["16493.50","0.006"]],"a":[],"u":1,"seq":7961638724}}
//! {"success":true,"ret_msg":"","op":"auth","conn_id":"…"}
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{
    MAX_ARGS_PER_FRAME, correlation_id, decimal, hmac_sha256, levels, millis, opt_decimal,
    opt_millis, require_text, resolve_symbol, rows, text,
};
use crate::application::ports::{
    ChannelBinding, ChannelRequest, DecodeError, EndpointScope, ExchangeProtocol, InboundEvent,
    LoginRejection, MarketCatalog, OutboundFrame,
};
use crate::domain::account::Credentials;
use crate::domain::orderbook::{BookAction, BookUpdate};
use crate::domain::streaming::{
    Asset, Balances, Fee, Kline, MarketType, MyTrade, Position, PositionSide, Side, SymbolKline,
    Trade,
};
use crate::domain::subscription::SubscriptionKey;
use crate::error::StreamError;

const PRODUCTION_BASE: &str = "wss://stream.bybit.com/v5";
const TESTNET_BASE: &str = "wss://stream-testnet.bybit.com/v5";

/// Validity window of an `auth` signature.
const AUTH_EXPIRY_MS: i64 = 10_000;

/// Return code meaning "already subscribed"; treated as success.
const ALREADY_SUBSCRIBED: &str = "20001";

// =============================================================================
// Wire Types
// =============================================================================

/// Envelope shared by op replies and topic pushes.
#[derive(Debug, Default, Deserialize)]
struct BybitEnvelope {
    #[serde(default)]
    op: Option<String>,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default, alias = "retMsg")]
    ret_msg: Option<String>,
    #[serde(default, alias = "retCode")]
    ret_code: Option<i64>,
}

impl BybitEnvelope {
    fn rejection(&self) -> Option<LoginRejection> {
        let code = self.ret_code.map(|c| c.to_string()).unwrap_or_default();
        let failed = match self.success {
            Some(ok) => !ok,
            None => !(code.is_empty() || code == "0" || code == ALREADY_SUBSCRIBED),
        };
        failed.then(|| LoginRejection {
            code,
            message: self
                .ret_msg
                .clone()
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| "request failed".to_string()),
        })
    }
}

fn category_of(market_type: MarketType) -> &'static str {
    match market_type {
        MarketType::Spot | MarketType::Margin => "spot",
        MarketType::Swap | MarketType::Future => "linear",
        MarketType::Option => "option",
    }
}

fn market_type_of(category: &str) -> Option<MarketType> {
    match category.to_ascii_lowercase().as_str() {
        "spot" => Some(MarketType::Spot),
        "linear" | "inverse" => Some(MarketType::Swap),
        "option" => Some(MarketType::Option),
        _ => None,
    }
}

/// Nearest supported book depth at or above `limit`.
const fn book_depth(market_type: MarketType, limit: usize) -> usize {
    if matches!(market_type, MarketType::Option) {
        return if limit <= 25 { 25 } else { 100 };
    }
    match limit {
        0..=1 => 1,
        2..=50 => 50,
        51..=200 => 200,
        _ => 1000,
    }
}

/// Unified timeframe to kline interval.
fn interval_of(timeframe: &str) -> Option<&'static str> {
    Some(match timeframe {
        "1m" => "1",
        "3m" => "3",
        "5m" => "5",
        "15m" => "15",
        "30m" => "30",
        "1h" => "60",
        "2h" => "120",
        "4h" => "240",
        "6h" => "360",
        "12h" => "720",
        "1d" => "D",
        "1w" => "W",
        "1M" => "M",
        _ => return None,
    })
}

fn timeframe_of(interval: &str) -> String {
    match interval {
        "1" => "1m",
        "3" => "3m",
        "5" => "5m",
        "15" => "15m",
        "30" => "30m",
        "60" => "1h",
        "120" => "2h",
        "240" => "4h",
        "360" => "6h",
        "720" => "12h",
        "D" => "1d",
        "W" => "1w",
        "M" => "1M",
        other => other,
    }
    .to_string()
}

/// `prefix.mid.symbol`, any part may be empty.
fn split_topic(topic: &str) -> (&str, &str, &str) {
    let mut parts = topic.splitn(3, '.');
    (
        parts.next().unwrap_or_default(),
        parts.next().unwrap_or_default(),
        parts.next().unwrap_or_default(),
    )
}

fn topic_key(topic: String) -> SubscriptionKey {
    SubscriptionKey::channel_only(topic)
}

// =============================================================================
// Protocol
// =============================================================================

/// Bybit v5 streaming protocol.
#[derive(Debug, Clone)]
pub struct BybitProtocol {
    base_url: String,
}

impl Default for BybitProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl BybitProtocol {
    /// Production endpoints.
    #[must_use]
    pub fn new() -> Self {
        Self::with_base_url(PRODUCTION_BASE)
    }

    /// Testnet endpoints.
    #[must_use]
    pub fn testnet() -> Self {
        Self::with_base_url(TESTNET_BASE)
    }

    /// Endpoints under a custom base, e.g. `ws://127.0.0.1:9000/v5`.
    #[must_use]
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl ExchangeProtocol for BybitProtocol {
    fn name(&self) -> &'static str {
        "bybit"
    }

    fn endpoint_url(
        &self,
        scope: EndpointScope,
        market_type: MarketType,
    ) -> Result<String, StreamError> {
        match scope {
            EndpointScope::Public => Ok(format!(
                "{}/public/{}",
                self.base_url,
                category_of(market_type)
            )),
            EndpointScope::Private => Ok(format!("{}/private", self.base_url)),
            EndpointScope::Business => Err(StreamError::NotSupported(
                "bybit has no business endpoint".into(),
            )),
        }
    }

    fn bind(&self, request: &ChannelRequest) -> Result<ChannelBinding, StreamError> {
        let public = |topic: String, market_type: MarketType| ChannelBinding {
            key: topic_key(topic),
            scope: EndpointScope::Public,
            market_type,
        };
        let private = |topic: String, market_type: Option<MarketType>| ChannelBinding {
            key: topic_key(topic),
            scope: EndpointScope::Private,
            market_type: market_type.unwrap_or(MarketType::Swap),
        };

        let binding = match request {
            ChannelRequest::OrderBook { market, depth } => {
                if *depth == 0 {
                    return Err(StreamError::ParamInvalid("depth must be positive".into()));
                }
                let depth = book_depth(market.market_type, *depth);
                public(
                    format!("orderbook.{depth}.{}", market.wire_id),
                    market.market_type,
                )
            }
            ChannelRequest::Trades { market } => public(
                format!("publicTrade.{}", market.wire_id),
                market.market_type,
            ),
            ChannelRequest::Kline { market, timeframe } => {
                let interval = interval_of(timeframe).ok_or_else(|| {
                    StreamError::ParamInvalid(format!("unsupported timeframe {timeframe}"))
                })?;
                public(
                    format!("kline.{interval}.{}", market.wire_id),
                    market.market_type,
                )
            }
            ChannelRequest::MarkPrice { market } => {
                if !market.market_type.is_contract() {
                    return Err(StreamError::NotSupported(format!(
                        "mark price for {} market {}",
                        market.market_type, market.symbol
                    )));
                }
                public(format!("tickers.{}", market.wire_id), market.market_type)
            }
            ChannelRequest::Balance => private("wallet".to_string(), None),
            ChannelRequest::Positions { market_type } => {
                if let Some(t @ (MarketType::Spot | MarketType::Margin)) = market_type {
                    return Err(StreamError::NotSupported(format!("positions for {t} markets")));
                }
                let topic = market_type.map_or_else(
                    || "position".to_string(),
                    |t| format!("position.{}", category_of(t)),
                );
                private(topic, *market_type)
            }
            ChannelRequest::MyTrades {
                market,
                market_type,
            } => {
                let market_type = market.as_ref().map(|m| m.market_type).or(*market_type);
                let topic = market_type.map_or_else(
                    || "execution".to_string(),
                    |t| format!("execution.{}", category_of(t)),
                );
                private(topic, market_type)
            }
        };
        Ok(binding)
    }

    fn subscribe_frames(&self, keys: &[SubscriptionKey], subscribe: bool) -> Vec<OutboundFrame> {
        let op = if subscribe { "subscribe" } else { "unsubscribe" };
        keys.chunks(MAX_ARGS_PER_FRAME)
            .map(|chunk| {
                let args: Vec<String> = chunk.iter().map(ToString::to_string).collect();
                let id = correlation_id();
                OutboundFrame {
                    text: json!({ "req_id": id, "op": op, "args": args }).to_string(),
                    correlation_id: Some(id),
                }
            })
            .collect()
    }

    fn login_frame(
        &self,
        credentials: &Credentials,
        now: DateTime<Utc>,
    ) -> Result<String, StreamError> {
        let expires = now.timestamp_millis() + AUTH_EXPIRY_MS;
        let signature = hmac_sha256(credentials.secret(), &format!("GET/realtime{expires}"))
            .map_err(StreamError::InvalidMessage)?;
        Ok(json!({
            "op": "auth",
            "args": [credentials.api_key(), expires, hex::encode(signature)],
        })
        .to_string())
    }

    fn ping_frame(&self) -> String {
        json!({ "op": "ping" }).to_string()
    }

    fn correlation_field(&self) -> &'static str {
        "req_id"
    }

    fn ack_error(&self, reply: &Value) -> Option<LoginRejection> {
        serde_json::from_value::<BybitEnvelope>(reply.clone())
            .ok()?
            .rejection()
    }

    fn max_silence(&self, key: &SubscriptionKey) -> Option<Duration> {
        let (prefix, ..) = split_topic(key.channel());
        match prefix {
            "orderbook" => Some(Duration::from_secs(30)),
            "tickers" => Some(Duration::from_secs(60)),
            _ => None,
        }
    }

    fn decode(
        &self,
        unit: &Value,
        market_type: MarketType,
        markets: &dyn MarketCatalog,
    ) -> Result<Vec<InboundEvent>, DecodeError> {
        let envelope: BybitEnvelope =
            serde_json::from_value(unit.clone()).map_err(|_| DecodeError::NoDiscriminator)?;

        if let Some(op) = envelope.op.as_deref() {
            return Ok(decode_op(op, &envelope));
        }
        let Some(topic) = envelope.topic.as_deref() else {
            return Err(DecodeError::NoDiscriminator);
        };

        let key = topic_key(topic.to_string());
        let (prefix, mid, tail) = split_topic(topic);
        match prefix {
            "orderbook" => decode_book(unit, &envelope, key, market_type, markets),
            "publicTrade" => {
                let trades = rows(unit)
                    .into_iter()
                    .map(|row| parse_trade(row, market_type, markets))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(vec![InboundEvent::Trades { key, trades }])
            }
            "kline" => {
                let symbol = resolve_symbol(markets, tail, market_type)?;
                let timeframe = timeframe_of(mid);
                let klines = rows(unit)
                    .into_iter()
                    .map(|row| {
                        Ok(SymbolKline {
                            symbol: symbol.clone(),
                            timeframe: timeframe.clone(),
                            kline: parse_kline(row)?,
                        })
                    })
                    .collect::<Result<Vec<_>, DecodeError>>()?;
                Ok(vec![InboundEvent::Klines { key, klines }])
            }
            "tickers" => {
                let mut prices = Vec::new();
                for row in rows(unit) {
                    // Delta pushes omit unchanged fields.
                    let Some(mark) = opt_decimal(row, "markPrice")? else {
                        continue;
                    };
                    let wire_id = text(row, "symbol").unwrap_or_else(|| mid.to_string());
                    prices.push((resolve_symbol(markets, &wire_id, market_type)?, mark));
                }
                if prices.is_empty() {
                    return Ok(Vec::new());
                }
                Ok(vec![InboundEvent::MarkPrices {
                    key,
                    market_type,
                    prices,
                }])
            }
            "wallet" => decode_wallet(unit, key),
            "position" => {
                let positions = rows(unit)
                    .into_iter()
                    .map(|row| parse_position(row, markets))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(vec![InboundEvent::Positions { key, positions }])
            }
            "execution" => {
                let trades = rows(unit)
                    .into_iter()
                    .map(|row| parse_execution(row, markets))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(vec![InboundEvent::MyTrades { key, trades }])
            }
            other => Err(DecodeError::UnknownChannel(other.to_string())),
        }
    }
}

// =============================================================================
// Decoding
// =============================================================================

fn decode_op(op: &str, envelope: &BybitEnvelope) -> Vec<InboundEvent> {
    let rejection = envelope.rejection();
    let event = match op {
        "ping" | "pong" => InboundEvent::Pong,
        "auth" => InboundEvent::Login(rejection.map_or(Ok(()), Err)),
        "subscribe" | "unsubscribe" => match rejection {
            Some(LoginRejection { code, message }) => InboundEvent::Error { code, message },
            None => InboundEvent::Ack {
                key: None,
                subscribed: op == "subscribe",
            },
        },
        _ => match rejection {
            Some(LoginRejection { code, message }) => InboundEvent::Error { code, message },
            None => return Vec::new(),
        },
    };
    vec![event]
}

fn decode_book(
    unit: &Value,
    envelope: &BybitEnvelope,
    key: SubscriptionKey,
    market_type: MarketType,
    markets: &dyn MarketCatalog,
) -> Result<Vec<InboundEvent>, DecodeError> {
    let data = unit.get("data").ok_or(DecodeError::MissingField("data"))?;
    let update_id = text(data, "u").and_then(|u| u.parse::<i64>().ok());

    // Update id 1 means the server restarted the book.
    let action = if envelope.kind.as_deref() == Some("snapshot") || update_id == Some(1) {
        BookAction::Snapshot
    } else {
        BookAction::Diff
    };
    let timestamp = match opt_millis(data, "ts")? {
        Some(ts) => Some(ts),
        None => opt_millis(unit, "ts")?,
    };

    Ok(vec![InboundEvent::Book {
        key,
        update: BookUpdate {
            symbol: resolve_symbol(markets, &require_text(data, "s")?, market_type)?,
            action,
            bids: levels(data, "b")?,
            asks: levels(data, "a")?,
            timestamp,
            nonce: update_id,
        },
    }])
}

fn decode_wallet(unit: &Value, key: SubscriptionKey) -> Result<Vec<InboundEvent>, DecodeError> {
    let Some(account) = rows(unit).into_iter().next() else {
        return Ok(Vec::new());
    };
    let mut balances = Balances {
        timestamp: opt_millis(unit, "creationTime")?,
        ..Balances::default()
    };
    for coin in account
        .get("coin")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let total = match opt_decimal(coin, "walletBalance")? {
            Some(total) => total,
            None => decimal(coin, "equity")?,
        };
        let used = opt_decimal(coin, "locked")?.unwrap_or_default();
        balances.assets.insert(
            require_text(coin, "coin")?,
            Asset {
                free: total - used,
                used,
                total,
            },
        );
    }
    Ok(vec![InboundEvent::Balance { key, balances }])
}

fn parse_trade(
    row: &Value,
    market_type: MarketType,
    markets: &dyn MarketCatalog,
) -> Result<Trade, DecodeError> {
    let price = decimal(row, "p")?;
    let amount = decimal(row, "v")?;
    Ok(Trade {
        id: require_text(row, "i")?,
        symbol: resolve_symbol(markets, &require_text(row, "s")?, market_type)?,
        side: text(row, "S").as_deref().and_then(Side::parse),
        price,
        amount,
        cost: price * amount,
        timestamp: millis(row, "T")?,
    })
}

fn parse_kline(row: &Value) -> Result<Kline, DecodeError> {
    Ok(Kline {
        open_time: millis(row, "start")?,
        open: decimal(row, "open")?,
        high: decimal(row, "high")?,
        low: decimal(row, "low")?,
        close: decimal(row, "close")?,
        volume: decimal(row, "volume")?,
    })
}

fn row_market_type(row: &Value) -> MarketType {
    text(row, "category")
        .as_deref()
        .and_then(market_type_of)
        .unwrap_or(MarketType::Swap)
}

fn parse_position(row: &Value, markets: &dyn MarketCatalog) -> Result<Position, DecodeError> {
    let side = match text(row, "side").as_deref() {
        Some("Buy") => PositionSide::Long,
        Some("Sell") => PositionSide::Short,
        _ => PositionSide::Net,
    };
    Ok(Position {
        symbol: resolve_symbol(markets, &require_text(row, "symbol")?, row_market_type(row))?,
        side,
        contracts: decimal(row, "size")?,
        entry_price: match opt_decimal(row, "entryPrice")? {
            Some(price) => Some(price),
            None => opt_decimal(row, "avgPrice")?,
        },
        mark_price: opt_decimal(row, "markPrice")?,
        unrealized_pnl: opt_decimal(row, "unrealisedPnl")?,
        leverage: opt_decimal(row, "leverage")?,
        timestamp: opt_millis(row, "updatedTime")?,
    })
}

fn parse_execution(row: &Value, markets: &dyn MarketCatalog) -> Result<MyTrade, DecodeError> {
    let fee = opt_decimal(row, "execFee")?
        .filter(|cost| !cost.is_zero())
        .map(|cost| Fee {
            cost,
            currency: text(row, "feeCurrency").unwrap_or_default(),
        });
    Ok(MyTrade {
        id: require_text(row, "execId")?,
        order_id: require_text(row, "orderId")?,
        symbol: resolve_symbol(markets, &require_text(row, "symbol")?, row_market_type(row))?,
        side: text(row, "side").as_deref().and_then(Side::parse),
        price: decimal(row, "execPrice")?,
        amount: decimal(row, "execQty")?,
        fee,
        timestamp: millis(row, "execTime")?,
    })
}

// =============================================================================
// Tests
// =============================================================================
