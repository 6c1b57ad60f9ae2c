//! Application Ports (Driven)
//!
//! Ports define the collaborators the streaming core depends on:
//! - `MarketCatalog`: unified symbol ↔ wire instrument id resolution
//! - `ExchangeProtocol`: endpoint URLs, subscribe/login frames and decoding
//!   of raw push messages into normalized rows

mod exchange_protocol_port;
mod market_catalog_port;

pub use exchange_protocol_port::{
    ChannelBinding, ChannelRequest, DecodeError, EndpointScope, ExchangeProtocol, InboundEvent,
    LoginRejection, OutboundFrame,
};
#[cfg(test)]
pub use market_catalog_port::MockMarketCatalog;
pub use market_catalog_port::{CatalogError, MarketCatalog, MarketInfo};
