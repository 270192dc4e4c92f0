//! In-process vehicle for tests and drills.
//!
//! [`SimulatedVehicle`] implements [`Transport`] against an in-memory state
//! document. Failures are scripted per operation ("fail the next N scans"),
//! the whole vehicle can be taken offline, and every call is counted so tests
//! can assert exactly how often the core touched the link.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::error::TransportError;
use crate::transport::{
    Advertisement, Command, Credentials, SeatPosition, SessionHandle, Transport, TransportResult,
};

#[derive(Debug)]
struct SimState {
    offline: bool,
    scan_failures: u32,
    open_failures: u32,
    query_failures: u32,
    command_failures: u32,
    handshake_delay: Duration,
    next_session: u64,
    live: HashSet<u64>,
    max_live: usize,
    document: Map<String, Value>,
}

/// A scripted, in-memory vehicle.
#[derive(Debug)]
pub struct SimulatedVehicle {
    vin: String,
    latency: Duration,
    state: Mutex<SimState>,
    scans: AtomicU32,
    opens: AtomicU32,
    queries: AtomicU32,
    commands: AtomicU32,
    closes: AtomicU32,
}

impl SimulatedVehicle {
    /// Creates an online vehicle with no scripted failures.
    #[must_use]
    pub fn new(vin: impl Into<String>) -> Self {
        let document = json!({
            "is_climate_on": false,
            "driver_temp_setting": 21.0,
            "passenger_temp_setting": 21.0,
            "inside_temp_celsius": 18.5,
            "outside_temp_celsius": 12.0,
            "fan_status": 0,
            "is_preconditioning": false,
            "bioweapon_mode_on": false,
            "steering_wheel_heater": false,
        });
        let document = match document {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        Self {
            vin: vin.into(),
            latency: Duration::ZERO,
            state: Mutex::new(SimState {
                offline: false,
                scan_failures: 0,
                open_failures: 0,
                query_failures: 0,
                command_failures: 0,
                handshake_delay: Duration::ZERO,
                next_session: 1,
                live: HashSet::new(),
                max_live: 0,
                document,
            }),
            scans: AtomicU32::new(0),
            opens: AtomicU32::new(0),
            queries: AtomicU32::new(0),
            commands: AtomicU32::new(0),
            closes: AtomicU32::new(0),
        }
    }

    /// Adds a fixed delay to every transport call.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // =========================================================================
    // SCRIPTING
    // =========================================================================

    /// Makes the next `n` scans report the vehicle as not found.
    pub fn fail_next_scans(&self, n: u32) {
        self.lock().scan_failures = n;
    }

    /// Makes the next `n` session handshakes fail.
    pub fn fail_next_opens(&self, n: u32) {
        self.lock().open_failures = n;
    }

    /// Makes the next `n` state queries fail with an I/O error.
    pub fn fail_next_queries(&self, n: u32) {
        self.lock().query_failures = n;
    }

    /// Makes the next `n` commands fail with an I/O error.
    pub fn fail_next_commands(&self, n: u32) {
        self.lock().command_failures = n;
    }

    /// Makes every session handshake take `delay` on top of the latency.
    pub fn set_handshake_delay(&self, delay: Duration) {
        self.lock().handshake_delay = delay;
    }

    /// Takes the vehicle out of range (or brings it back). Going offline
    /// drops every open session.
    pub fn set_offline(&self, offline: bool) {
        let mut state = self.lock();
        state.offline = offline;
        if offline {
            state.live.clear();
        }
    }

    /// Drops every open session while leaving the vehicle reachable.
    pub fn drop_link(&self) {
        self.lock().live.clear();
    }

    // =========================================================================
    // INSPECTION
    // =========================================================================

    /// Number of `scan` calls.
    #[must_use]
    pub fn scan_calls(&self) -> u32 {
        self.scans.load(Ordering::SeqCst)
    }

    /// Number of `open` calls.
    #[must_use]
    pub fn open_calls(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    /// Number of `query` calls.
    #[must_use]
    pub fn query_calls(&self) -> u32 {
        self.queries.load(Ordering::SeqCst)
    }

    /// Number of `execute` calls.
    #[must_use]
    pub fn command_calls(&self) -> u32 {
        self.commands.load(Ordering::SeqCst)
    }

    /// Number of `close` calls.
    #[must_use]
    pub fn close_calls(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }

    /// Sessions currently open.
    #[must_use]
    pub fn live_sessions(&self) -> usize {
        self.lock().live.len()
    }

    /// Highest number of sessions ever open at the same time.
    #[must_use]
    pub fn max_live_sessions(&self) -> usize {
        self.lock().max_live
    }

    /// Reads a field of the vehicle's state document.
    #[must_use]
    pub fn state_value(&self, key: &str) -> Option<Value> {
        self.lock().document.get(key).cloned()
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

fn take_failure(counter: &mut u32) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

const fn seat_key(seat: SeatPosition) -> &'static str {
    match seat {
        SeatPosition::FrontLeft => "seat_heater_front_left",
        SeatPosition::FrontRight => "seat_heater_front_right",
        SeatPosition::RearLeft => "seat_heater_rear_left",
        SeatPosition::RearCenter => "seat_heater_rear_center",
        SeatPosition::RearRight => "seat_heater_rear_right",
    }
}

const fn seat_cooler_key(seat: SeatPosition) -> &'static str {
    match seat {
        SeatPosition::FrontLeft => "seat_cooler_front_left",
        SeatPosition::FrontRight => "seat_cooler_front_right",
        SeatPosition::RearLeft => "seat_cooler_rear_left",
        SeatPosition::RearCenter => "seat_cooler_rear_center",
        SeatPosition::RearRight => "seat_cooler_rear_right",
    }
}

fn apply(document: &mut Map<String, Value>, command: &Command) {
    match command {
        Command::ClimateOn => {
            document.insert("is_climate_on".into(), json!(true));
        }
        Command::ClimateOff => {
            document.insert("is_climate_on".into(), json!(false));
        }
        Command::SetTemperature {
            driver_celsius,
            passenger_celsius,
        } => {
            document.insert("driver_temp_setting".into(), json!(driver_celsius));
            document.insert("passenger_temp_setting".into(), json!(passenger_celsius));
        }
        Command::SetSeatHeater { seat, level } => {
            document.insert(seat_key(*seat).into(), json!(level));
        }
        Command::SetSeatCooler { seat, level } => {
            document.insert(seat_cooler_key(*seat).into(), json!(level));
        }
        Command::SetSteeringWheelHeater { enabled } => {
            document.insert("steering_wheel_heater".into(), json!(enabled));
        }
        Command::SetPreconditioningMax { enabled, .. } => {
            document.insert("is_preconditioning".into(), json!(enabled));
        }
        Command::SetBioweaponDefenseMode { enabled, .. } => {
            document.insert("bioweapon_mode_on".into(), json!(enabled));
        }
    }
}

#[async_trait]
impl Transport for SimulatedVehicle {
    async fn scan(&self, vin: &str) -> TransportResult<Advertisement> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        self.delay().await;

        let mut state = self.lock();
        if state.offline || vin != self.vin || take_failure(&mut state.scan_failures) {
            return Err(TransportError::DeviceNotFound { vin: vin.to_owned() });
        }

        let suffix: String = self.vin.chars().rev().take(6).collect();
        Ok(Advertisement {
            vin: self.vin.clone(),
            local_name: format!("S{suffix}C"),
            address: "00:11:22:33:44:55".into(),
            rssi: Some(-58),
        })
    }

    async fn open(
        &self,
        advertisement: &Advertisement,
        _credentials: &Credentials,
    ) -> TransportResult<SessionHandle> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        let handshake = self.lock().handshake_delay;
        if !handshake.is_zero() {
            tokio::time::sleep(handshake).await;
        }

        let mut state = self.lock();
        if state.offline {
            return Err(TransportError::ConnectFailed {
                message: format!("{} is out of range", advertisement.address),
            });
        }
        if take_failure(&mut state.open_failures) {
            return Err(TransportError::HandshakeFailed {
                message: "vehicle did not answer session request".into(),
            });
        }

        let id = state.next_session;
        state.next_session += 1;
        state.live.insert(id);
        state.max_live = state.max_live.max(state.live.len());
        Ok(SessionHandle::new(id))
    }

    async fn query(&self, session: &SessionHandle) -> TransportResult<Vec<u8>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.delay().await;

        let mut state = self.lock();
        if !state.live.contains(&session.id()) {
            return Err(TransportError::Disconnected);
        }
        if take_failure(&mut state.query_failures) {
            return Err(TransportError::Io {
                message: "simulated read failure".into(),
            });
        }
        serde_json::to_vec(&state.document).map_err(|err| TransportError::Io {
            message: err.to_string(),
        })
    }

    async fn execute(&self, session: &SessionHandle, command: &Command) -> TransportResult<()> {
        self.commands.fetch_add(1, Ordering::SeqCst);
        self.delay().await;

        let mut state = self.lock();
        if !state.live.contains(&session.id()) {
            return Err(TransportError::Disconnected);
        }
        if take_failure(&mut state.command_failures) {
            return Err(TransportError::Io {
                message: "simulated write failure".into(),
            });
        }
        apply(&mut state.document, command);
        Ok(())
    }

    async fn close(&self, session: SessionHandle) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.lock().live.remove(&session.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VIN: &str = "5YJ3E1EA4KF000001";

    #[tokio::test]
    async fn test_scripted_scan_failures() {
        let vehicle = SimulatedVehicle::new(VIN);
        vehicle.fail_next_scans(2);

        assert!(vehicle.scan(VIN).await.is_err());
        assert!(vehicle.scan(VIN).await.is_err());
        let ad = vehicle.scan(VIN).await.unwrap();

        assert_eq!(ad.vin, VIN);
        assert_eq!(vehicle.scan_calls(), 3);
    }

    #[tokio::test]
    async fn test_scan_for_other_vin_fails() {
        let vehicle = SimulatedVehicle::new(VIN);
        let err = vehicle.scan("5YJ3E1EA4KF999999").await.unwrap_err();
        assert!(matches!(err, TransportError::DeviceNotFound { .. }));
    }

    #[tokio::test]
    async fn test_session_lifecycle_and_commands() {
        let vehicle = SimulatedVehicle::new(VIN);
        let ad = vehicle.scan(VIN).await.unwrap();
        let session = vehicle.open(&ad, &Credentials::default()).await.unwrap();
        assert_eq!(vehicle.live_sessions(), 1);

        vehicle.execute(&session, &Command::ClimateOn).await.unwrap();
        let blob = vehicle.query(&session).await.unwrap();
        let doc: Value = serde_json::from_slice(&blob).unwrap();
        assert_eq!(doc["is_climate_on"], true);

        vehicle.close(session).await;
        assert_eq!(vehicle.live_sessions(), 0);
        assert_eq!(vehicle.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_seat_cooler_is_passed_through() {
        let vehicle = SimulatedVehicle::new(VIN);
        let ad = vehicle.scan(VIN).await.unwrap();
        let session = vehicle.open(&ad, &Credentials::default()).await.unwrap();

        vehicle
            .execute(
                &session,
                &Command::SetSeatCooler {
                    seat: SeatPosition::FrontRight,
                    level: 2,
                },
            )
            .await
            .unwrap();

        assert_eq!(vehicle.state_value("seat_cooler_front_right"), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_dropped_link_reports_disconnected() {
        let vehicle = SimulatedVehicle::new(VIN);
        let ad = vehicle.scan(VIN).await.unwrap();
        let session = vehicle.open(&ad, &Credentials::default()).await.unwrap();

        vehicle.drop_link();

        assert_eq!(
            vehicle.query(&session).await.unwrap_err(),
            TransportError::Disconnected
        );
    }

    #[tokio::test]
    async fn test_offline_vehicle_cannot_be_found() {
        let vehicle = SimulatedVehicle::new(VIN);
        vehicle.set_offline(true);
        assert!(vehicle.scan(VIN).await.is_err());

        vehicle.set_offline(false);
        assert!(vehicle.scan(VIN).await.is_ok());
    }
}
