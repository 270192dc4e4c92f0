//! Lifecycle of the link to one vehicle.
//!
//! ```text
//! Disconnected ─► Scanning ─► Connecting ─► Connected ─► SessionActive
//!                    │            │             │              │
//!                    └────────────┴──── fail ───┴──────────────┴─► Error
//! ```
//!
//! [`VehicleConnection::disconnect`] is reachable from every state and always
//! lands in `Disconnected`. A connection owns at most one [`SessionHandle`];
//! every path that opens a new session closes the old one first.
//!
//! # Locking
//!
//! - `session` (async mutex) owns the handle and serializes connect,
//!   disconnect and every use of the handle.
//! - `status` (reader/writer lock) holds what callers observe. It is only
//!   ever held briefly and never across an `.await`.
//! - `probe` (async mutex) serializes health probes so the rate limit holds
//!   under concurrent callers. It is always taken before `session`.

use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, VehicleConfig};
use crate::context::OpContext;
use crate::error::{LinkError, Result};
use crate::transport::{Advertisement, Command, Credentials, SessionHandle, Transport};
use crate::types::ConnectionInfo;

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No link and no session.
    #[default]
    Disconnected,
    /// Looking for the vehicle's advertisement.
    Scanning,
    /// Opening the link.
    Connecting,
    /// Link open, session not yet marked active.
    Connected,
    /// Authenticated session ready for queries and commands.
    SessionActive,
    /// The last connect attempt failed.
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Scanning => "scanning",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::SessionActive => "session_active",
            Self::Error => "error",
        })
    }
}

/// Parameters the connection reads on every connect and health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// VIN to scan for.
    pub vin: String,
    /// Budget for one scan attempt.
    pub scan_timeout: Duration,
    /// Scan attempts per connect.
    pub scan_retries: u32,
    /// Fixed pause between scan attempts.
    pub scan_delay: Duration,
    /// Health probes closer together than this are skipped.
    pub health_check_min_interval: Duration,
}

impl ConnectionSettings {
    /// Settings for `vin` with default timing.
    #[must_use]
    pub fn for_vin(vin: impl Into<String>) -> Self {
        let vehicle = VehicleConfig {
            vin: vin.into(),
            ..VehicleConfig::default()
        };
        Self::from_config(&vehicle, &ClientConfig::default())
    }

    /// Extracts connection settings from configuration sections.
    #[must_use]
    pub fn from_config(vehicle: &VehicleConfig, client: &ClientConfig) -> Self {
        Self {
            vin: vehicle.vin.clone(),
            scan_timeout: vehicle.scan_timeout,
            scan_retries: vehicle.scan_retries,
            scan_delay: vehicle.scan_delay,
            health_check_min_interval: client.health_check_min_interval,
        }
    }
}

#[derive(Debug, Default)]
struct ConnectionStatus {
    state: ConnectionState,
    session_active: bool,
    connected_at: Option<DateTime<Utc>>,
    last_error: Option<LinkError>,
    device: Option<Advertisement>,
}

/// State machine owning the session with one vehicle.
pub struct VehicleConnection {
    transport: Arc<dyn Transport>,
    settings: ArcSwap<ConnectionSettings>,
    status: RwLock<ConnectionStatus>,
    session: tokio::sync::Mutex<Option<SessionHandle>>,
    probe: tokio::sync::Mutex<()>,
    last_health_check: Mutex<Option<Instant>>,
}

impl VehicleConnection {
    /// Creates a disconnected connection.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, settings: ConnectionSettings) -> Self {
        Self {
            transport,
            settings: ArcSwap::from_pointee(settings),
            status: RwLock::new(ConnectionStatus::default()),
            session: tokio::sync::Mutex::new(None),
            probe: tokio::sync::Mutex::new(()),
            last_health_check: Mutex::new(None),
        }
    }

    // =========================================================================
    // OBSERVATION
    // =========================================================================

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.read_status().state
    }

    /// Whether an authenticated session is active.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        let status = self.read_status();
        status.session_active && status.state == ConnectionState::SessionActive
    }

    /// The failure that put the connection into `Error`, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<LinkError> {
        self.read_status().last_error.clone()
    }

    /// Current settings.
    #[must_use]
    pub fn settings(&self) -> Arc<ConnectionSettings> {
        self.settings.load_full()
    }

    /// Replaces the settings used by subsequent connects and health checks.
    pub fn update_settings(&self, settings: ConnectionSettings) {
        self.settings.store(Arc::new(settings));
    }

    /// Snapshot for status reporting.
    #[must_use]
    pub fn connection_info(&self) -> ConnectionInfo {
        let vin = self.settings.load().vin.clone();
        let status = self.read_status();
        ConnectionInfo {
            vin,
            state: status.state,
            session_active: status.session_active,
            connected_at: status.connected_at,
            last_error: status.last_error.as_ref().map(ToString::to_string),
            device: status.device.clone(),
        }
    }

    fn read_status(&self) -> std::sync::RwLockReadGuard<'_, ConnectionStatus> {
        self.status
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_status(&self) -> std::sync::RwLockWriteGuard<'_, ConnectionStatus> {
        self.status
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(&self, to: ConnectionState) {
        let mut status = self.write_status();
        let from = status.state;
        status.state = to;
        drop(status);
        if from != to {
            debug!(%from, %to, "connection state changed");
        }
    }

    fn reset_health_check(&self) {
        *self
            .last_health_check
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Scans for the vehicle, opens the link and activates the session.
    ///
    /// Does nothing if a session is already active.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::ScanFailed`] if every scan attempt failed, the
    /// wrapped transport error if opening failed, or the context's error if
    /// it ended first. The connection is left in `Error` on failure.
    pub async fn connect(&self, ctx: &OpContext, credentials: &Credentials) -> Result<()> {
        let mut session = ctx.run(async { Ok(self.session.lock().await) }).await?;
        if session.is_some() && self.is_connected() {
            return Ok(());
        }
        self.establish(&mut session, ctx, credentials).await
    }

    /// Tears down any existing session, then connects afresh.
    ///
    /// # Errors
    ///
    /// Same as [`connect`](Self::connect).
    pub async fn reconnect(&self, ctx: &OpContext, credentials: &Credentials) -> Result<()> {
        let mut session = ctx.run(async { Ok(self.session.lock().await) }).await?;
        info!(vin = %self.settings.load().vin, "reconnecting to vehicle");
        self.establish(&mut session, ctx, credentials).await
    }

    /// Closes the session and returns to `Disconnected`. Safe to call in any
    /// state, any number of times.
    ///
    /// Waits for a connect that is already in progress to finish (or for its
    /// context to end) and then tears the result down; it does not interrupt
    /// the connect. Cancel the connect's [`OpContext`] to abort it early.
    pub async fn disconnect(&self) {
        let mut session = self.session.lock().await;
        let had_session = self.release(&mut session).await;
        {
            let mut status = self.write_status();
            status.session_active = false;
            status.connected_at = None;
        }
        self.transition(ConnectionState::Disconnected);
        self.reset_health_check();
        if had_session {
            info!(vin = %self.settings.load().vin, "disconnected from vehicle");
        }
    }

    async fn release(&self, session: &mut Option<SessionHandle>) -> bool {
        match session.take() {
            Some(handle) => {
                debug!(session = handle.id(), "closing session");
                self.transport.close(handle).await;
                true
            }
            None => false,
        }
    }

    async fn establish(
        &self,
        session: &mut Option<SessionHandle>,
        ctx: &OpContext,
        credentials: &Credentials,
    ) -> Result<()> {
        let abandoned = AbandonedConnect {
            connection: self,
            ctx,
            armed: true,
        };

        self.release(session).await;
        {
            let mut status = self.write_status();
            status.session_active = false;
            status.connected_at = None;
        }
        self.reset_health_check();

        let settings = self.settings.load_full();
        let result = self.open_session(ctx, &settings, credentials).await;
        abandoned.disarm();

        match result {
            Ok((handle, device)) => {
                *session = Some(handle);
                self.transition(ConnectionState::Connected);
                {
                    let mut status = self.write_status();
                    status.session_active = true;
                    status.connected_at = Some(Utc::now());
                    status.last_error = None;
                    status.device = Some(device);
                }
                self.transition(ConnectionState::SessionActive);
                info!(vin = %settings.vin, "connected to vehicle");
                Ok(())
            }
            Err(err) => {
                self.write_status().last_error = Some(err.clone());
                self.transition(ConnectionState::Error);
                warn!(vin = %settings.vin, error = %err, "failed to connect to vehicle");
                Err(err)
            }
        }
    }

    async fn open_session(
        &self,
        ctx: &OpContext,
        settings: &ConnectionSettings,
        credentials: &Credentials,
    ) -> Result<(SessionHandle, Advertisement)> {
        self.transition(ConnectionState::Scanning);
        let device = self.scan(ctx, settings).await?;
        info!(
            name = %device.local_name,
            address = %device.address,
            rssi = device.rssi,
            "found vehicle"
        );

        self.transition(ConnectionState::Connecting);
        let handle = ctx
            .run(async {
                self.transport
                    .open(&device, credentials)
                    .await
                    .map_err(|err| LinkError::transport("open session", err))
            })
            .await?;
        Ok((handle, device))
    }

    /// Scans with a fixed number of attempts and a fixed pause between them.
    async fn scan(&self, ctx: &OpContext, settings: &ConnectionSettings) -> Result<Advertisement> {
        let attempts = settings.scan_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let scan_ctx = ctx.with_timeout(settings.scan_timeout);
            let err = match scan_ctx
                .run(async {
                    self.transport
                        .scan(&settings.vin)
                        .await
                        .map_err(|err| LinkError::transport("scan for vehicle", err))
                })
                .await
            {
                Ok(device) => return Ok(device),
                Err(err) => err,
            };

            if let Some(ctx_err) = ctx.err() {
                return Err(ctx_err);
            }
            if attempt >= attempts {
                return Err(LinkError::ScanFailed {
                    vin: settings.vin.clone(),
                    attempts,
                    source: Box::new(err),
                });
            }

            warn!(
                attempt,
                max_attempts = attempts,
                delay_ms = u64::try_from(settings.scan_delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "scan attempt failed, retrying"
            );
            ctx.sleep(settings.scan_delay).await?;
        }
    }

    // =========================================================================
    // HEALTH
    // =========================================================================

    /// Probes the session with a state query.
    ///
    /// A probe within `health_check_min_interval` of the last successful one
    /// is skipped and reported healthy. A failed probe does not change the
    /// connection state; acting on it is up to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::NotConnected`] without a session,
    /// [`LinkError::ConnectionLost`] if the probe failed, or the context's
    /// error.
    pub async fn check_health(&self, ctx: &OpContext) -> Result<()> {
        let _probe = ctx.run(async { Ok(self.probe.lock().await) }).await?;

        let min_interval = self.settings.load().health_check_min_interval;
        let last = *self
            .last_health_check
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if last.is_some_and(|at| at.elapsed() < min_interval) {
            return Ok(());
        }

        let probe = ctx
            .run(async {
                let session = self.session.lock().await;
                let handle = session.as_ref().ok_or(LinkError::NotConnected)?;
                self.transport
                    .query(handle)
                    .await
                    .map(drop)
                    .map_err(|err| LinkError::transport("probe connection", err))
            })
            .await;

        match probe {
            Ok(()) => {
                *self
                    .last_health_check
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Instant::now());
                Ok(())
            }
            Err(err @ (LinkError::NotConnected | LinkError::ConnectionLost { .. })) => Err(err),
            Err(err) if err.is_context_error() => Err(err),
            Err(err) => {
                warn!(error = %err, "health check failed");
                Err(LinkError::ConnectionLost {
                    source: Box::new(err),
                })
            }
        }
    }

    /// Makes sure a healthy session exists, reconnecting if the health probe
    /// fails.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::NotConnected`] if there is no session to heal, the
    /// context's error, or the reconnect failure.
    pub async fn ensure_connection(&self, ctx: &OpContext, credentials: &Credentials) -> Result<()> {
        if !self.read_status().session_active {
            return Err(LinkError::NotConnected);
        }

        match self.check_health(ctx).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_context_error() => Err(err),
            Err(err) => {
                warn!(error = %err, "connection unhealthy, reconnecting");
                self.disconnect().await;
                self.connect(ctx, credentials).await
            }
        }
    }

    // =========================================================================
    // SESSION USE
    // =========================================================================

    /// Fetches the raw state document.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::NotConnected`] immediately without a session, the
    /// wrapped transport error, or the context's error.
    pub async fn query_state(&self, ctx: &OpContext) -> Result<Vec<u8>> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        ctx.run(async {
            let session = self.session.lock().await;
            let handle = session.as_ref().ok_or(LinkError::NotConnected)?;
            self.transport
                .query(handle)
                .await
                .map_err(|err| LinkError::transport("query vehicle state", err))
        })
        .await
    }

    /// Delivers a command over the active session.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::NotConnected`] immediately without a session, the
    /// wrapped transport error, or the context's error.
    pub async fn execute(&self, ctx: &OpContext, command: &Command) -> Result<()> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        ctx.run(async {
            let session = self.session.lock().await;
            let handle = session.as_ref().ok_or(LinkError::NotConnected)?;
            self.transport
                .execute(handle, command)
                .await
                .map_err(|err| LinkError::transport(command.name(), err))
        })
        .await
    }
}

/// Moves the connection to `Error` when an in-progress connect is dropped
/// before it finishes, e.g. because an outer context raced it and won.
struct AbandonedConnect<'a> {
    connection: &'a VehicleConnection,
    ctx: &'a OpContext,
    armed: bool,
}

impl AbandonedConnect<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AbandonedConnect<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let err = self.ctx.err().unwrap_or(LinkError::Cancelled);
        {
            let mut status = self.connection.write_status();
            status.session_active = false;
            status.connected_at = None;
            status.last_error = Some(err.clone());
        }
        self.connection.transition(ConnectionState::Error);
        warn!(error = %err, "connect abandoned before completion");
    }
}

impl fmt::Debug for VehicleConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VehicleConnection")
            .field("settings", &*self.settings.load_full())
            .field("status", &*self.read_status())
            .finish_non_exhaustive()
    }
}
