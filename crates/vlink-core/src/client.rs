//! Public façade over the resilient vehicle link.
//!
//! Every state query and command runs the same way:
//!
//! 1. derive a context bounded by the operation's timeout,
//! 2. hand the operation to the [`RetryExecutor`], which retries with
//!    exponential backoff and routes each attempt through the
//!    [`CircuitBreaker`],
//! 3. inside the attempt, fail fast with
//!    [`LinkError::NotConnected`](crate::LinkError::NotConnected) unless a
//!    session is active, otherwise talk to the vehicle.
//!
//! The client never schedules work on its own. Keep-alives and periodic
//! health checks are the caller's job ([`Client::check_health`],
//! [`Client::ensure_connection`]).
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vlink_core::{Client, LinkConfig, OpContext, SimulatedVehicle};
//!
//! # async fn run() -> vlink_core::Result<()> {
//! let mut config = LinkConfig::default();
//! config.vehicle.vin = "5YJ3E1EA4KF000001".into();
//!
//! let vehicle = Arc::new(SimulatedVehicle::new("5YJ3E1EA4KF000001"));
//! let client = Client::new(vehicle, &config);
//!
//! let ctx = OpContext::background();
//! client.connect(&ctx).await?;
//! client.climate_on(&ctx).await?;
//! let state = client.get_state(&ctx).await?;
//! println!("{:?}", state.get_bool("is_climate_on"));
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::info;

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::config::{LinkConfig, VehicleConfig};
use crate::config_manager::ConfigManager;
use crate::connection::{ConnectionSettings, ConnectionState, VehicleConnection};
use crate::context::OpContext;
use crate::error::Result;
use crate::retry::RetryExecutor;
use crate::transport::{Command, Credentials, Transport};
use crate::types::{ConnectionInfo, VehicleState};

/// Per-operation time budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationTimeouts {
    /// Whole connect, outer retries included.
    pub connect: Duration,
    /// State query, retries included.
    pub state_query: Duration,
    /// Command send, retries included.
    pub command: Duration,
}

impl OperationTimeouts {
    /// Extracts timeouts from the vehicle section.
    #[must_use]
    pub const fn from_config(vehicle: &VehicleConfig) -> Self {
        Self {
            connect: vehicle.connection_timeout,
            state_query: vehicle.request_timeout,
            command: vehicle.command_timeout,
        }
    }
}

impl Default for OperationTimeouts {
    fn default() -> Self {
        Self::from_config(&VehicleConfig::default())
    }
}

/// Everything an operation needs besides the connection, swapped as a unit.
#[derive(Debug)]
struct ResiliencePolicy {
    executor: RetryExecutor,
    timeouts: OperationTimeouts,
    auto_reconnect: bool,
}

impl ResiliencePolicy {
    fn from_config(config: &LinkConfig) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker.clone()));
        Self {
            executor: RetryExecutor::new(config.retry.clone(), breaker),
            timeouts: OperationTimeouts::from_config(&config.vehicle),
            auto_reconnect: config.client.enable_auto_reconnect,
        }
    }
}

/// Resilient client for one vehicle.
///
/// All methods take `&self` and are safe to call concurrently; the circuit
/// breaker serializes the actual link traffic.
pub struct Client {
    connection: VehicleConnection,
    policy: ArcSwap<ResiliencePolicy>,
    credentials: ArcSwap<Credentials>,
}

impl Client {
    /// Creates a disconnected client.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: &LinkConfig) -> Self {
        let settings = ConnectionSettings::from_config(&config.vehicle, &config.client);
        Self {
            connection: VehicleConnection::new(transport, settings),
            policy: ArcSwap::from_pointee(ResiliencePolicy::from_config(config)),
            credentials: ArcSwap::from_pointee(credentials_from(config)),
        }
    }

    // =========================================================================
    // CONNECTION
    // =========================================================================

    /// Connects to the vehicle, retrying with backoff on top of the
    /// connection's own scan retries.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::RetryExhausted`](crate::LinkError::RetryExhausted)
    /// if every attempt failed, or the context's error.
    pub async fn connect(&self, ctx: &OpContext) -> Result<()> {
        let policy = self.policy.load_full();
        let credentials = self.credentials.load_full();
        let ctx = ctx.with_timeout(policy.timeouts.connect);
        info!(vin = %self.vin(), "connecting to vehicle");

        policy
            .executor
            .retry(&ctx, "connect", || self.connection.connect(&ctx, &credentials))
            .await
    }

    /// Tears down the current session and connects afresh.
    ///
    /// # Errors
    ///
    /// Same as [`connect`](Self::connect).
    pub async fn reconnect(&self, ctx: &OpContext) -> Result<()> {
        let policy = self.policy.load_full();
        let credentials = self.credentials.load_full();
        let ctx = ctx.with_timeout(policy.timeouts.connect);

        policy
            .executor
            .retry(&ctx, "reconnect", || self.connection.reconnect(&ctx, &credentials))
            .await
    }

    /// Closes the session. Safe to call at any time.
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    /// Whether an authenticated session is active.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Probes the session, rate-limited by `health_check_min_interval`.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::NotConnected`](crate::LinkError::NotConnected),
    /// [`LinkError::ConnectionLost`](crate::LinkError::ConnectionLost) or the
    /// context's error.
    pub async fn check_health(&self, ctx: &OpContext) -> Result<()> {
        let ctx = ctx.with_timeout(self.policy.load().timeouts.state_query);
        self.connection.check_health(&ctx).await
    }

    /// Probes the session and reconnects if it is dead.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::NotConnected`](crate::LinkError::NotConnected) if
    /// there is no session to heal, or the reconnect failure.
    pub async fn ensure_connection(&self, ctx: &OpContext) -> Result<()> {
        let credentials = self.credentials.load_full();
        let ctx = ctx.with_timeout(self.policy.load().timeouts.connect);
        self.connection.ensure_connection(&ctx, &credentials).await
    }

    // =========================================================================
    // OPERATIONS
    // =========================================================================

    /// Fetches the vehicle state.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::RetryExhausted`](crate::LinkError::RetryExhausted)
    /// wrapping the last failure, or the context's error.
    pub async fn get_state(&self, ctx: &OpContext) -> Result<VehicleState> {
        let policy = self.policy.load_full();
        let ctx = ctx.with_timeout(policy.timeouts.state_query);
        let vin = self.vin();

        policy
            .executor
            .retry(&ctx, "get_state", || async {
                let blob = self.connection.query_state(&ctx).await?;
                VehicleState::from_blob(&vin, &blob)
            })
            .await
    }

    /// Sends a command to the vehicle.
    ///
    /// With auto-reconnect enabled and a session present, the session is
    /// health-checked (and healed if needed) before the command is sent.
    ///
    /// # Errors
    ///
    /// Returns the healing failure,
    /// [`LinkError::RetryExhausted`](crate::LinkError::RetryExhausted)
    /// wrapping the last send failure, or the context's error.
    pub async fn send_command(&self, ctx: &OpContext, command: Command) -> Result<()> {
        let policy = self.policy.load_full();

        if policy.auto_reconnect && self.connection.is_connected() {
            self.ensure_connection(ctx).await?;
        }

        let ctx = ctx.with_timeout(policy.timeouts.command);
        info!(command = %command, "sending command");
        policy
            .executor
            .retry(&ctx, command.name(), || {
                self.connection.execute(&ctx, &command)
            })
            .await
    }

    /// Turns climate control on.
    ///
    /// # Errors
    ///
    /// See [`send_command`](Self::send_command).
    pub async fn climate_on(&self, ctx: &OpContext) -> Result<()> {
        self.send_command(ctx, Command::ClimateOn).await
    }

    /// Turns climate control off.
    ///
    /// # Errors
    ///
    /// See [`send_command`](Self::send_command).
    pub async fn climate_off(&self, ctx: &OpContext) -> Result<()> {
        self.send_command(ctx, Command::ClimateOff).await
    }

    /// Sets driver and passenger temperature targets in Celsius.
    ///
    /// # Errors
    ///
    /// See [`send_command`](Self::send_command).
    pub async fn set_temperature(
        &self,
        ctx: &OpContext,
        driver_celsius: f32,
        passenger_celsius: f32,
    ) -> Result<()> {
        self.send_command(
            ctx,
            Command::SetTemperature {
                driver_celsius,
                passenger_celsius,
            },
        )
        .await
    }

    // =========================================================================
    // STATUS
    // =========================================================================

    /// VIN of the target vehicle.
    #[must_use]
    pub fn vin(&self) -> String {
        self.connection.settings().vin.clone()
    }

    /// Connection lifecycle state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Snapshot of the connection.
    #[must_use]
    pub fn connection_info(&self) -> ConnectionInfo {
        self.connection.connection_info()
    }

    /// State of the circuit breaker currently in use.
    #[must_use]
    pub fn circuit_state(&self) -> CircuitState {
        self.policy.load().executor.breaker().state()
    }

    /// Timeouts currently in use.
    #[must_use]
    pub fn timeouts(&self) -> OperationTimeouts {
        self.policy.load().timeouts
    }

    // =========================================================================
    // CONFIGURATION
    // =========================================================================

    /// Replaces retry policy, circuit breaker, timeouts, credentials and
    /// connection settings with ones built from `config`.
    ///
    /// The breaker is always a fresh instance. Operations already running
    /// finish under the policy they started with.
    pub fn apply_config(&self, config: &LinkConfig) {
        self.policy
            .store(Arc::new(ResiliencePolicy::from_config(config)));
        self.credentials.store(Arc::new(credentials_from(config)));
        self.connection
            .update_settings(ConnectionSettings::from_config(&config.vehicle, &config.client));
        info!(vin = %config.vehicle.vin, "client configuration applied");
    }

    /// Applies every configuration change made through `manager`.
    pub fn follow(self: &Arc<Self>, manager: &ConfigManager) {
        let client: Weak<Self> = Arc::downgrade(self);
        manager.on_change(move |_, new| {
            if let Some(client) = client.upgrade() {
                client.apply_config(new);
            }
            Ok(())
        });
    }
}

fn credentials_from(config: &LinkConfig) -> Credentials {
    Credentials {
        private_key_file: config.vehicle.private_key_file.clone(),
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("connection", &self.connection)
            .field("circuit_state", &self.circuit_state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::RetryConfig;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::error::LinkError;
    use crate::sim::SimulatedVehicle;

    const VIN: &str = "5YJ3E1EA4KF000001";

    fn test_config() -> LinkConfig {
        let mut config = LinkConfig::default();
        config.vehicle.vin = VIN.into();
        config.vehicle.scan_delay = Duration::from_millis(10);
        config.retry = RetryConfig::new()
            .with_max_retries(3)
            .with_initial_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(100))
            .with_jitter(false);
        config
    }

    fn client_with(config: &LinkConfig) -> (Arc<SimulatedVehicle>, Client) {
        let vehicle = Arc::new(SimulatedVehicle::new(VIN));
        let client = Client::new(vehicle.clone(), config);
        (vehicle, client)
    }

    async fn connected() -> (Arc<SimulatedVehicle>, Client) {
        let (vehicle, client) = client_with(&test_config());
        client.connect(&OpContext::background()).await.unwrap();
        (vehicle, client)
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_state_requires_connection() {
        let (vehicle, client) = client_with(&test_config());

        let err = client.get_state(&OpContext::background()).await.unwrap_err();

        assert!(err.is_retry_exhausted());
        assert!(matches!(err.root_cause(), LinkError::NotConnected));
        assert_eq!(vehicle.query_calls(), 0);
    }

    #[tokio::test]
    async fn test_connect_and_query() {
        let (_, client) = connected().await;
        assert!(client.is_connected());
        assert_eq!(client.connection_state(), ConnectionState::SessionActive);

        let state = client.get_state(&OpContext::background()).await.unwrap();
        assert_eq!(state.vin, VIN);
        assert_eq!(state.get_bool("is_climate_on"), Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_query_failures_are_retried() {
        let (vehicle, client) = connected().await;
        vehicle.fail_next_queries(2);

        client.get_state(&OpContext::background()).await.unwrap();

        assert_eq!(vehicle.query_calls(), 3);
        assert_eq!(client.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_and_outer_retries_compose() {
        let mut config = test_config();
        config.vehicle.scan_retries = 2;
        let (vehicle, client) = client_with(&config);
        vehicle.fail_next_scans(3);

        client.connect(&OpContext::background()).await.unwrap();

        assert_eq!(vehicle.scan_calls(), 4);
        assert!(client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_and_fails_fast() {
        let mut config = test_config();
        config.retry = config.retry.with_max_retries(0);
        config.circuit_breaker = CircuitBreakerConfig::default()
            .with_max_failures(2)
            .with_reset_timeout(Duration::from_secs(60));
        let (vehicle, client) = client_with(&config);
        client.connect(&OpContext::background()).await.unwrap();
        vehicle.fail_next_queries(100);

        let ctx = OpContext::background();
        assert!(client.get_state(&ctx).await.is_err());
        assert!(client.get_state(&ctx).await.is_err());
        assert_eq!(client.circuit_state(), CircuitState::Open);

        let err = client.get_state(&ctx).await.unwrap_err();
        assert!(err.root_cause().is_circuit_open());
        assert_eq!(vehicle.query_calls(), 2);
    }

    #[tokio::test]
    async fn test_command_heals_dropped_session() {
        let (vehicle, client) = connected().await;
        vehicle.drop_link();

        client.climate_on(&OpContext::background()).await.unwrap();

        assert_eq!(vehicle.open_calls(), 2);
        assert_eq!(vehicle.live_sessions(), 1);
        assert_eq!(
            vehicle.state_value("is_climate_on"),
            Some(serde_json::Value::Bool(true))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_during_scan_lands_in_error() {
        let mut config = test_config();
        config.vehicle.connection_timeout = Duration::from_millis(50);
        let vehicle = Arc::new(SimulatedVehicle::new(VIN).with_latency(Duration::from_secs(1)));
        let client = Client::new(vehicle.clone(), &config);

        let err = client.connect(&OpContext::background()).await.unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(client.connection_state(), ConnectionState::Error);
        assert_eq!(
            client.connection_info().last_error.as_deref(),
            Some("operation timed out")
        );
        assert!(!client.is_connected());
        assert_eq!(vehicle.open_calls(), 0);
        assert_eq!(vehicle.live_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_handshake_lands_in_error() {
        let (vehicle, client) = client_with(&test_config());
        vehicle.set_handshake_delay(Duration::from_secs(5));
        let ctx = OpContext::background();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let err = client.connect(&ctx).await.unwrap_err();

        assert!(matches!(err, LinkError::Cancelled));
        assert_eq!(vehicle.open_calls(), 1);
        assert_eq!(client.connection_state(), ConnectionState::Error);
        assert_eq!(
            client.connection_info().last_error.as_deref(),
            Some("operation cancelled")
        );
        assert_eq!(vehicle.live_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_timeout_releases_old_session() {
        let (vehicle, client) = connected().await;
        vehicle.set_handshake_delay(Duration::from_secs(5));

        let err = client
            .reconnect(&OpContext::with_deadline_in(Duration::from_millis(100)))
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(client.connection_state(), ConnectionState::Error);
        assert!(!client.is_connected());
        assert_eq!(vehicle.close_calls(), 1);
        assert_eq!(vehicle.live_sessions(), 0);

        vehicle.set_handshake_delay(Duration::ZERO);
        client.connect(&OpContext::background()).await.unwrap();
        assert!(client.is_connected());
        assert!(client.connection_info().last_error.is_none());
    }

    #[tokio::test]
    async fn test_set_temperature_passes_values_through() {
        let (vehicle, client) = connected().await;

        client
            .set_temperature(&OpContext::background(), 22.5, 20.0)
            .await
            .unwrap();

        assert_eq!(
            vehicle.state_value("driver_temp_setting"),
            Some(serde_json::json!(22.5))
        );
    }

    #[tokio::test]
    async fn test_disconnect_then_query_fails_fast() {
        let (vehicle, client) = connected().await;
        client.disconnect().await;
        client.disconnect().await;

        let mut config = test_config();
        config.retry = config.retry.with_max_retries(0);
        client.apply_config(&config);

        let err = client.get_state(&OpContext::background()).await.unwrap_err();
        assert!(matches!(err.root_cause(), LinkError::NotConnected));
        assert_eq!(vehicle.query_calls(), 0);
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_config_installs_fresh_breaker() {
        let mut config = test_config();
        config.retry = config.retry.with_max_retries(0);
        config.circuit_breaker = CircuitBreakerConfig::default().with_max_failures(1);
        let (_, client) = client_with(&config);

        let _ = client.get_state(&OpContext::background()).await;
        assert_eq!(client.circuit_state(), CircuitState::Open);

        client.apply_config(&config);
        assert_eq!(client.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_follow_picks_up_config_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = test_config();
        config.save(&path).unwrap();

        let manager = ConfigManager::open(&path).unwrap();
        let (_, client) = client_with(&manager.config());
        let client = Arc::new(client);
        client.follow(&manager);

        manager
            .update(|c| c.vehicle.request_timeout = Duration::from_secs(3))
            .unwrap();

        assert_eq!(client.timeouts().state_query, Duration::from_secs(3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_queries() {
        let (_, client) = connected().await;
        let client = Arc::new(client);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let client = Arc::clone(&client);
                tokio::spawn(async move { client.get_state(&OpContext::background()).await })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    }
}
