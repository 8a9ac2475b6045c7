//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Alpaca REST and WebSocket adapters (bars, market data, trade updates).
pub mod alpaca;

/// Configuration loaded from the environment.
pub mod config;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// CSV bar files and append-only capture logs.
pub mod storage;

/// Tracing subscriber and OpenTelemetry integration.
pub mod telemetry;
