//! OKX v5 WebSocket Protocol
//!
//! # Endpoints
//!
//! - `/ws/v5/public`: order books, trades, mark prices
//! - `/ws/v5/business`: candles
//! - `/ws/v5/private`: balances, positions, order fills (login required)
//!
//! # Wire Format
//!
//! ```json
//! {"id":"…","op":"subscribe","args":[{"channel":"books5","instId":"BTC-USDT"}]}
//! {"arg":{"channel":"books5","instId":"BTC-USDT"},"data":[{"asks":[["41006.8","0.6","0","1"]],"bids":[],"ts":"1597026383085"}]}
//! {"event":"login","code":"0","msg":""}
//! {"event":"error","code":"60009","msg":"Login failed."}
//! ```
//!
//! Heartbeats are the raw text `ping`, answered with a raw `pong`.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
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
use crate::domain::orderbook::{BookAction, BookUpdate, DEFAULT_DEPTH};
use crate::domain::streaming::{
    Asset, Balances, Fee, Kline, MarketType, MyTrade, Position, PositionSide, Side, SymbolKline,
    Trade,
};
use crate::domain::subscription::SubscriptionKey;
use crate::error::StreamError;

const PRODUCTION_BASE: &str = "wss://ws.okx.com:8443/ws/v5";
const DEMO_BASE: &str = "wss://wspap.okx.com:8443/ws/v5";

const CH_BOOKS: &str = "books";
const CH_BOOKS5: &str = "books5";
const CH_TRADES: &str = "trades";
const CH_MARK_PRICE: &str = "mark-price";
const CH_BALANCE_POSITION: &str = "balance_and_position";
const CH_ORDERS: &str = "orders";
const CANDLE_PREFIX: &str = "candle";

/// Deepest book channel depth.
const BOOKS5_DEPTH: usize = 5;

/// Error codes of failed or missing logins.
const AUTH_ERROR_CODES: [&str; 3] = ["60009", "60011", "60012"];

/// Challenge appended to the timestamp before signing a login.
const LOGIN_CHALLENGE: &str = "GET/users/self/verify";

// =============================================================================
// Wire Types
// =============================================================================

/// Channel descriptor echoed in every push and ack.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OkxArg {
    channel: String,
    #[serde(default)]
    inst_type: Option<String>,
    #[serde(default)]
    inst_id: Option<String>,
}

impl OkxArg {
    fn key(&self) -> SubscriptionKey {
        SubscriptionKey::new(
            self.channel.as_str(),
            self.inst_type.as_deref(),
            self.inst_id.as_deref(),
        )
    }
}

/// `{"event": ...}` control messages.
#[derive(Debug, Deserialize)]
struct OkxEvent {
    event: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    arg: Option<OkxArg>,
}

fn inst_type_of(market_type: MarketType) -> &'static str {
    match market_type {
        MarketType::Spot => "SPOT",
        MarketType::Margin => "MARGIN",
        MarketType::Swap => "SWAP",
        MarketType::Future => "FUTURES",
        MarketType::Option => "OPTION",
    }
}

fn market_type_of(inst_type: &str) -> Option<MarketType> {
    match inst_type.to_ascii_uppercase().as_str() {
        "SPOT" => Some(MarketType::Spot),
        "MARGIN" => Some(MarketType::Margin),
        "SWAP" => Some(MarketType::Swap),
        "FUTURES" => Some(MarketType::Future),
        "OPTION" => Some(MarketType::Option),
        _ => None,
    }
}

/// Unified timeframe to candle channel suffix.
fn candle_suffix(timeframe: &str) -> Option<&'static str> {
    Some(match timeframe {
        "1m" => "1m",
        "3m" => "3m",
        "5m" => "5m",
        "15m" => "15m",
        "30m" => "30m",
        "1h" => "1H",
        "2h" => "2H",
        "4h" => "4H",
        "6h" => "6H",
        "12h" => "12H",
        "1d" => "1D",
        "1w" => "1W",
        "1M" => "1M",
        _ => return None,
    })
}

/// Candle channel suffix back to the unified timeframe.
fn timeframe_of(suffix: &str) -> String {
    match suffix {
        "1H" | "2H" | "4H" | "6H" | "12H" | "1D" | "1W" => suffix.to_ascii_lowercase(),
        other => other.to_string(),
    }
}

// =============================================================================
// Protocol
// =============================================================================

/// OKX v5 streaming protocol.
#[derive(Debug, Clone)]
pub struct OkxProtocol {
    base_url: String,
}

impl Default for OkxProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl OkxProtocol {
    /// Production endpoints.
    #[must_use]
    pub fn new() -> Self {
        Self::with_base_url(PRODUCTION_BASE)
    }

    /// Demo-trading endpoints.
    #[must_use]
    pub fn demo() -> Self {
        Self::with_base_url(DEMO_BASE)
    }

    /// Endpoints under a custom base, e.g. `ws://127.0.0.1:9000/ws/v5`.
    #[must_use]
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

// =============================================================================
// Decoding
// =============================================================================

fn decode_event(unit: &Value) -> Result<Vec<InboundEvent>, DecodeError> {
    let event: OkxEvent =
        serde_json::from_value(unit.clone()).map_err(|_| DecodeError::NoDiscriminator)?;
    let code = event.code.unwrap_or_default();
    let message = event.msg.unwrap_or_default();

    let decoded = match event.event.as_str() {
        "login" if code.is_empty() || code == "0" => InboundEvent::Login(Ok(())),
        "login" => InboundEvent::Login(Err(LoginRejection { code, message })),
        "error" if AUTH_ERROR_CODES.contains(&code.as_str()) => {
            InboundEvent::Login(Err(LoginRejection { code, message }))
        }
        "error" => InboundEvent::Error { code, message },
        "subscribe" | "unsubscribe" => InboundEvent::Ack {
            key: event.arg.as_ref().map(OkxArg::key),
            subscribed: event.event == "subscribe",
        },
        other => return Err(DecodeError::UnknownChannel(format!("event {other}"))),
    };
    Ok(vec![decoded])
}

fn decode_push(
    unit: &Value,
    arg: &OkxArg,
    market_type: MarketType,
    markets: &dyn MarketCatalog,
) -> Result<Vec<InboundEvent>, DecodeError> {
    let key = arg.key();
    let market_type = arg
        .inst_type
        .as_deref()
        .and_then(market_type_of)
        .unwrap_or(market_type);

    match arg.channel.as_str() {
        CH_BOOKS | CH_BOOKS5 => {
            let inst_id = arg.inst_id.as_deref().ok_or(DecodeError::MissingField("instId"))?;
            let symbol = resolve_symbol(markets, inst_id, market_type)?;
            let action = match unit.get("action").and_then(Value::as_str) {
                Some("update") => BookAction::Diff,
                _ => BookAction::Snapshot,
            };
            rows(unit)
                .into_iter()
                .map(|row| {
                    Ok(InboundEvent::Book {
                        key: key.clone(),
                        update: BookUpdate {
                            symbol: symbol.clone(),
                            action,
                            bids: levels(row, "bids")?,
                            asks: levels(row, "asks")?,
                            timestamp: opt_millis(row, "ts")?,
                            nonce: text(row, "seqId").and_then(|s| s.parse().ok()),
                        },
                    })
                })
                .collect()
        }
        CH_TRADES => {
            let trades = rows(unit)
                .into_iter()
                .map(|row| parse_trade(row, market_type, markets))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(vec![InboundEvent::Trades { key, trades }])
        }
        CH_MARK_PRICE => {
            let mut prices = Vec::new();
            for row in rows(unit) {
                let row_type = text(row, "instType")
                    .as_deref()
                    .and_then(market_type_of)
                    .unwrap_or(market_type);
                let symbol = resolve_symbol(markets, &require_text(row, "instId")?, row_type)?;
                prices.push((symbol, decimal(row, "markPx")?));
            }
            Ok(vec![InboundEvent::MarkPrices {
                key,
                market_type,
                prices,
            }])
        }
        CH_BALANCE_POSITION => parse_balance_and_position(unit, &key, markets),
        CH_ORDERS => {
            let trades = rows(unit)
                .into_iter()
                .filter_map(|row| parse_fill(row, market_type, markets).transpose())
                .collect::<Result<Vec<_>, _>>()?;
            if trades.is_empty() {
                return Ok(Vec::new());
            }
            Ok(vec![InboundEvent::MyTrades { key, trades }])
        }
        channel if channel.starts_with(CANDLE_PREFIX) => {
            let inst_id = arg.inst_id.as_deref().ok_or(DecodeError::MissingField("instId"))?;
            let symbol = resolve_symbol(markets, inst_id, market_type)?;
            let timeframe = timeframe_of(&channel[CANDLE_PREFIX.len()..]);
            let klines = rows(unit)
                .into_iter()
                .map(|row| {
                    Ok(SymbolKline {
                        symbol: symbol.clone(),
                        timeframe: timeframe.clone(),
                        kline: parse_candle(row)?,
                    })
                })
                .collect::<Result<Vec<_>, DecodeError>>()?;
            Ok(vec![InboundEvent::Klines { key, klines }])
        }
        other => Err(DecodeError::UnknownChannel(other.to_string())),
    }
}

impl ExchangeProtocol for OkxProtocol {
    fn name(&self) -> &'static str {
        "okx"
    }

    fn endpoint_url(
        &self,
        scope: EndpointScope,
        _market_type: MarketType,
    ) -> Result<String, StreamError> {
        let path = match scope {
            EndpointScope::Public => "public",
            EndpointScope::Business => "business",
            EndpointScope::Private => "private",
        };
        Ok(format!("{}/{path}", self.base_url))
    }

    fn bind(&self, request: &ChannelRequest) -> Result<ChannelBinding, StreamError> {
        let binding = match request {
            ChannelRequest::OrderBook { market, depth } => {
                let channel = match *depth {
                    0 => return Err(StreamError::ParamInvalid("depth must be positive".into())),
                    d if d <= BOOKS5_DEPTH => CH_BOOKS5,
                    d if d <= DEFAULT_DEPTH => CH_BOOKS,
                    d => {
                        return Err(StreamError::ParamInvalid(format!(
                            "depth {d} exceeds {DEFAULT_DEPTH}"
                        )));
                    }
                };
                ChannelBinding {
                    key: SubscriptionKey::instrument(channel, &market.wire_id),
                    scope: EndpointScope::Public,
                    market_type: market.market_type,
                }
            }
            ChannelRequest::Trades { market } => ChannelBinding {
                key: SubscriptionKey::instrument(CH_TRADES, &market.wire_id),
                scope: EndpointScope::Public,
                market_type: market.market_type,
            },
            ChannelRequest::Kline { market, timeframe } => {
                let suffix = candle_suffix(timeframe).ok_or_else(|| {
                    StreamError::ParamInvalid(format!("unsupported timeframe {timeframe}"))
                })?;
                ChannelBinding {
                    key: SubscriptionKey::instrument(
                        format!("{CANDLE_PREFIX}{suffix}"),
                        &market.wire_id,
                    ),
                    scope: EndpointScope::Business,
                    market_type: market.market_type,
                }
            }
            ChannelRequest::MarkPrice { market } => ChannelBinding {
                key: SubscriptionKey::instrument(CH_MARK_PRICE, &market.wire_id),
                scope: EndpointScope::Public,
                market_type: market.market_type,
            },
            ChannelRequest::Balance | ChannelRequest::Positions { .. } => ChannelBinding {
                key: SubscriptionKey::channel_only(CH_BALANCE_POSITION),
                scope: EndpointScope::Private,
                market_type: MarketType::Spot,
            },
            ChannelRequest::MyTrades {
                market,
                market_type,
            } => {
                let market_type = market
                    .as_ref()
                    .map(|m| m.market_type)
                    .or(*market_type);
                let inst_type = market_type.map_or("ANY", inst_type_of);
                ChannelBinding {
                    key: SubscriptionKey::new(
                        CH_ORDERS,
                        Some(inst_type),
                        market.as_ref().map(|m| m.wire_id.as_str()),
                    ),
                    scope: EndpointScope::Private,
                    market_type: market_type.unwrap_or(MarketType::Spot),
                }
            }
        };
        Ok(binding)
    }

    fn subscribe_frames(&self, keys: &[SubscriptionKey], subscribe: bool) -> Vec<OutboundFrame> {
        let op = if subscribe { "subscribe" } else { "unsubscribe" };
        keys.chunks(MAX_ARGS_PER_FRAME)
            .map(|chunk| {
                let args: Vec<Value> = chunk
                    .iter()
                    .map(|key| {
                        let mut arg = json!({ "channel": key.channel() });
                        if let Some(inst_type) = key.inst_type() {
                            arg["instType"] = json!(inst_type);
                        }
                        if let Some(inst_id) = key.inst_id() {
                            arg["instId"] = json!(inst_id);
                        }
                        arg
                    })
                    .collect();
                let id = correlation_id();
                OutboundFrame {
                    text: json!({ "id": id, "op": op, "args": args }).to_string(),
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
        let passphrase = credentials
            .passphrase()
            .ok_or_else(|| StreamError::Unauthorized("passphrase required".into()))?;
        let timestamp = now.timestamp().to_string();
        let signature = hmac_sha256(credentials.secret(), &format!("{timestamp}{LOGIN_CHALLENGE}"))
            .map_err(StreamError::InvalidMessage)?;

        Ok(json!({
            "op": "login",
            "args": [{
                "apiKey": credentials.api_key(),
                "passphrase": passphrase,
                "timestamp": timestamp,
                "sign": BASE64.encode(signature),
            }]
        })
        .to_string())
    }

    fn ping_frame(&self) -> String {
        "ping".to_string()
    }

    fn correlation_field(&self) -> &'static str {
        "id"
    }

    fn ack_error(&self, reply: &Value) -> Option<LoginRejection> {
        let code = text(reply, "code").unwrap_or_default();
        let is_error = reply.get("event").and_then(Value::as_str) == Some("error")
            || !(code.is_empty() || code == "0");
        is_error.then(|| LoginRejection {
            code,
            message: text(reply, "msg").unwrap_or_default(),
        })
    }

    fn max_silence(&self, key: &SubscriptionKey) -> Option<Duration> {
        match key.channel() {
            CH_BOOKS | CH_BOOKS5 => Some(Duration::from_secs(30)),
            CH_MARK_PRICE => Some(Duration::from_secs(60)),
            _ => None,
        }
    }

    fn decode(
        &self,
        unit: &Value,
        market_type: MarketType,
        markets: &dyn MarketCatalog,
    ) -> Result<Vec<InboundEvent>, DecodeError> {
        if unit.get("event").is_some() {
            return decode_event(unit);
        }
        let Some(arg) = unit.get("arg") else {
            return Err(DecodeError::NoDiscriminator);
        };
        let arg: OkxArg =
            serde_json::from_value(arg.clone()).map_err(|_| DecodeError::MissingField("channel"))?;
        decode_push(unit, &arg, market_type, markets)
    }
}

// =============================================================================
// Row Parsers
// =============================================================================

fn parse_trade(
    row: &Value,
    market_type: MarketType,
    markets: &dyn MarketCatalog,
) -> Result<Trade, DecodeError> {
    let price = decimal(row, "px")?;
    let amount = decimal(row, "sz")?;
    Ok(Trade {
        id: require_text(row, "tradeId")?,
        symbol: resolve_symbol(markets, &require_text(row, "instId")?, market_type)?,
        side: text(row, "side").as_deref().and_then(Side::parse),
        price,
        amount,
        cost: price * amount,
        timestamp: millis(row, "ts")?,
    })
}

/// Candle rows are positional: `[ts, o, h, l, c, vol, ...]`.
fn parse_candle(row: &Value) -> Result<Kline, DecodeError> {
    let cells = row.as_array().ok_or_else(|| DecodeError::InvalidField {
        field: "candle",
        value: row.to_string(),
    })?;
    let cell = |idx: usize, field: &'static str| -> Result<String, DecodeError> {
        cells
            .get(idx)
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or(DecodeError::MissingField(field))
    };
    let number = |idx: usize, field: &'static str| -> Result<_, DecodeError> {
        super::parse_decimal(field, &cell(idx, field)?)
    };

    Ok(Kline {
        open_time: super::parse_millis("ts", &cell(0, "ts")?)?,
        open: number(1, "open")?,
        high: number(2, "high")?,
        low: number(3, "low")?,
        close: number(4, "close")?,
        volume: number(5, "volume")?,
    })
}

fn parse_balance_and_position(
    unit: &Value,
    key: &SubscriptionKey,
    markets: &dyn MarketCatalog,
) -> Result<Vec<InboundEvent>, DecodeError> {
    let mut events = Vec::new();
    for row in rows(unit) {
        let stamp = opt_millis(row, "pTime")?;

        if let Some(entries) = row.get("balData").and_then(Value::as_array) {
            let mut balances = Balances {
                timestamp: stamp,
                ..Balances::default()
            };
            for entry in entries {
                let free = match opt_decimal(entry, "availBal")? {
                    Some(free) => free,
                    None => decimal(entry, "cashBal")?,
                };
                let used = opt_decimal(entry, "frozenBal")?.unwrap_or_default();
                let total = opt_decimal(entry, "eq")?.unwrap_or(free + used);
                balances
                    .assets
                    .insert(require_text(entry, "ccy")?, Asset { free, used, total });
            }
            events.push(InboundEvent::Balance {
                key: key.clone(),
                balances,
            });
        }

        if let Some(entries) = row.get("posData").and_then(Value::as_array) {
            let positions = entries
                .iter()
                .map(|entry| parse_position(entry, stamp, markets))
                .collect::<Result<Vec<_>, _>>()?;
            events.push(InboundEvent::Positions {
                key: key.clone(),
                positions,
            });
        }
    }
    Ok(events)
}

fn parse_position(
    entry: &Value,
    stamp: Option<DateTime<Utc>>,
    markets: &dyn MarketCatalog,
) -> Result<Position, DecodeError> {
    let market_type = text(entry, "instType")
        .as_deref()
        .and_then(market_type_of)
        .unwrap_or(MarketType::Swap);
    let side = match text(entry, "posSide").as_deref() {
        Some("long") => PositionSide::Long,
        Some("short") => PositionSide::Short,
        _ => PositionSide::Net,
    };
    Ok(Position {
        symbol: resolve_symbol(markets, &require_text(entry, "instId")?, market_type)?,
        side,
        contracts: decimal(entry, "pos")?,
        entry_price: opt_decimal(entry, "avgPx")?,
        mark_price: opt_decimal(entry, "markPx")?,
        unrealized_pnl: opt_decimal(entry, "upl")?,
        leverage: opt_decimal(entry, "lever")?,
        timestamp: opt_millis(entry, "uTime")?.or(stamp),
    })
}

/// An order update carrying a fill. Updates without one yield `None`.
fn parse_fill(
    row: &Value,
    market_type: MarketType,
    markets: &dyn MarketCatalog,
) -> Result<Option<MyTrade>, DecodeError> {
    let amount = opt_decimal(row, "fillSz")?.unwrap_or_default();
    if amount.is_zero() {
        return Ok(None);
    }
    let row_type = text(row, "instType")
        .as_deref()
        .and_then(market_type_of)
        .unwrap_or(market_type);
    let price = match opt_decimal(row, "fillPx")? {
        Some(price) => price,
        None => decimal(row, "avgPx")?,
    };
    let fee = match opt_decimal(row, "fillFee")? {
        Some(cost) => text(row, "fillFeeCcy").map(|currency| Fee {
            cost: -cost,
            currency,
        }),
        None => opt_decimal(row, "fee")?
            .zip(text(row, "feeCcy"))
            .map(|(cost, currency)| Fee {
                cost: -cost,
                currency,
            }),
    };
    let timestamp = match opt_millis(row, "fillTime")? {
        Some(ts) => ts,
        None => millis(row, "uTime")?,
    };

    Ok(Some(MyTrade {
        id: require_text(row, "tradeId")?,
        order_id: require_text(row, "ordId")?,
        symbol: resolve_symbol(markets, &require_text(row, "instId")?, row_type)?,
        side: text(row, "side").as_deref().and_then(Side::parse),
        price,
        amount,
        fee,
        timestamp,
    }))
}

// =============================================================================
// Tests
// =============================================================================
