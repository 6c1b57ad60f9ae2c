//! Infrastructure Layer - Adapters and runtime.
//!
//! This layer contains the WebSocket machinery, the exchange protocol
//! adapters and the engine that ties them to the output queues.

/// Configuration loaded from the environment.
pub mod config;

/// The streaming engine (watch/unwatch, dispatch, supervision).
pub mod engine;

/// Exchange protocol adapters and the static market catalog.
pub mod exchange;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Bounded fan-out output queues.
pub mod router;

/// Tracing subscriber setup.
pub mod telemetry;

/// Connections, codec, auth, keepalive and reconnect.
pub mod ws;
