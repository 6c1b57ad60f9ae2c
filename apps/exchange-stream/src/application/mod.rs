//! Application Layer - Port definitions.
//!
//! This layer contains the port interfaces that define how the streaming
//! core talks to exchange-specific collaborators.

/// Port interfaces for market metadata and exchange wire protocols.
pub mod ports;
