//! # vlink-core
//!
//! Resilient connection core for commanding a vehicle over an intermittent
//! short-range wireless link.
//!
//! This crate provides:
//! - A circuit breaker that fails fast while the link is known to be down
//! - Bounded retries with exponential backoff and jitter
//! - A connection state machine (scan, connect, session, health, reconnect)
//! - A client façade exposing retried, circuit-protected queries and commands
//! - Configuration loading, validation and hot reload
//!
//! ## Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`client`] - Public façade combining the pieces below
//! - [`connection`] - Lifecycle of the session with one vehicle
//! - [`retry`] - Retry loop routing every attempt through the breaker
//! - [`circuit_breaker`] - Closed / open / half-open failure tracking
//! - [`backoff`] - Retry delay computation
//! - [`context`] - Cancellation and deadlines for blocking operations
//! - [`transport`] - The seam to the BLE link and vehicle protocol
//! - [`config`] - Configuration loading, saving, and validation
//! - [`config_manager`] - Live configuration with change callbacks and file watching
//! - [`error`] - Unified error types for the crate
//! - [`types`] - Shared result types
//!
//! With the `simulator` feature, `sim` provides an in-memory vehicle that
//! implements [`Transport`] for drills and tests.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod backoff;
pub mod circuit_breaker;
pub mod client;
pub mod config;
pub mod config_manager;
pub mod connection;
pub mod context;
pub mod error;
pub mod retry;
#[cfg(any(test, feature = "simulator"))]
pub mod sim;
pub mod transport;
pub mod types;

// Re-export primary types for convenience
pub use backoff::RetryConfig;
pub use circuit_breaker::{
    BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState, HalfOpenPolicy,
};
pub use client::{Client, OperationTimeouts};
pub use config::{
    ClientConfig, ConfigError, LinkConfig, LogFormat, LogOutput, LoggingConfig, ValidationProblem,
    VehicleConfig,
};
pub use config_manager::{ChangeCallback, ConfigManager, ConfigWatch};
pub use connection::{ConnectionSettings, ConnectionState, VehicleConnection};
pub use context::OpContext;
pub use error::{LinkError, Result, TransportError};
pub use retry::RetryExecutor;
#[cfg(any(test, feature = "simulator"))]
pub use sim::SimulatedVehicle;
pub use transport::{
    Advertisement, Command, Credentials, SeatPosition, SessionHandle, Transport, TransportResult,
};
pub use types::{ConnectionInfo, VehicleState};
