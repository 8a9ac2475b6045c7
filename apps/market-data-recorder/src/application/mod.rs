//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the backfill and capture services and the port
//! interfaces they drive. Services depend only on the domain and on the
//! ports; infrastructure adapters are injected at startup.

/// Port interfaces for external systems (bars provider, sinks, streams).
pub mod ports;

/// Application services for historical backfill and streaming capture.
pub mod services;
