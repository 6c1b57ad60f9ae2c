//! WebSocket Layer
//!
//! Connection handles, the frame codec, endpoint clients, the auth
//! coordinator and the reconnect and keepalive policies.

pub mod auth;
pub mod client;
pub mod codec;
pub mod connection;
pub mod keepalive;
pub mod reconnect;

pub use auth::{AuthCoordinator, AuthError, AuthState, PendingRestore};
pub use client::{Hold, WsClient, client_key, now_ms};
pub use codec::{CodecError, DecodedFrame, JsonCodec};
pub use connection::{
    ConnectionError, ConnectionEvent, ConnectionHandle, FrameHandler, FrameOrigin, ReplyCallback,
};
pub use keepalive::{KeepaliveEvent, KeepaliveTimer};
pub use reconnect::{ReconnectPolicy, initial_delay_for};
