//! The seam between the resilience core and the vehicle link.
//!
//! A [`Transport`] performs the real work: BLE scanning, the authenticated
//! session handshake, state queries and command delivery. The core never
//! looks inside a session. It only decides when to scan, when to give up
//! and when to tear a session down.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Result type returned by transports.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// What a scan found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    /// VIN the advertisement belongs to.
    pub vin: String,
    /// Advertised BLE local name.
    pub local_name: String,
    /// Device address.
    pub address: String,
    /// Signal strength in dBm, if reported.
    pub rssi: Option<i16>,
}

/// Opaque handle to an open, authenticated session.
///
/// Deliberately neither `Clone` nor `Copy`: a connection owns exactly one
/// handle, and [`Transport::close`] consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct SessionHandle {
    id: u64,
}

impl SessionHandle {
    /// Wraps a transport-assigned session id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self { id }
    }

    /// Transport-assigned session id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }
}

/// Key material used to open a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Private key file, if the vehicle requires one.
    pub private_key_file: Option<PathBuf>,
}

impl Credentials {
    /// Credentials backed by a private key file.
    #[must_use]
    pub fn from_key_file(path: impl Into<PathBuf>) -> Self {
        Self {
            private_key_file: Some(path.into()),
        }
    }
}

/// Seat addressed by a seat heater command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeatPosition {
    /// Driver seat (left-hand drive).
    FrontLeft,
    /// Front passenger seat (left-hand drive).
    FrontRight,
    /// Rear left.
    RearLeft,
    /// Rear center.
    RearCenter,
    /// Rear right.
    RearRight,
}

/// A vehicle command, passed through to the transport untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Start climate control.
    ClimateOn,
    /// Stop climate control.
    ClimateOff,
    /// Set cabin temperature targets in Celsius.
    SetTemperature {
        /// Driver side target.
        driver_celsius: f32,
        /// Passenger side target.
        passenger_celsius: f32,
    },
    /// Set a seat heater level.
    SetSeatHeater {
        /// Which seat.
        seat: SeatPosition,
        /// Vehicle-defined level.
        level: u8,
    },
    /// Set a seat cooler level.
    SetSeatCooler {
        /// Which seat.
        seat: SeatPosition,
        /// Vehicle-defined level.
        level: u8,
    },
    /// Toggle the steering wheel heater.
    SetSteeringWheelHeater {
        /// Heater on or off.
        enabled: bool,
    },
    /// Toggle max preconditioning.
    SetPreconditioningMax {
        /// Mode on or off.
        enabled: bool,
        /// Override the vehicle's own scheduling.
        manual_override: bool,
    },
    /// Toggle bioweapon defense mode.
    SetBioweaponDefenseMode {
        /// Mode on or off.
        enabled: bool,
        /// Override the vehicle's own scheduling.
        manual_override: bool,
    },
}

impl Command {
    /// Stable operation label used for retries and logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ClimateOn => "set_climate_on",
            Self::ClimateOff => "set_climate_off",
            Self::SetTemperature { .. } => "set_temperature",
            Self::SetSeatHeater { .. } => "set_seat_heater",
            Self::SetSeatCooler { .. } => "set_seat_cooler",
            Self::SetSteeringWheelHeater { .. } => "set_steering_wheel_heater",
            Self::SetPreconditioningMax { .. } => "set_preconditioning_max",
            Self::SetBioweaponDefenseMode { .. } => "set_bioweapon_defense_mode",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Physical link plus vehicle protocol.
///
/// Implementations need not be cancellation aware: the core races every call
/// against its operation context and drops the future when the context ends.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Waits for an advertisement from `vin`.
    async fn scan(&self, vin: &str) -> TransportResult<Advertisement>;

    /// Connects to the advertised device and completes the session handshake.
    async fn open(
        &self,
        advertisement: &Advertisement,
        credentials: &Credentials,
    ) -> TransportResult<SessionHandle>;

    /// Fetches the vehicle state as a JSON document.
    async fn query(&self, session: &SessionHandle) -> TransportResult<Vec<u8>>;

    /// Delivers a command.
    async fn execute(&self, session: &SessionHandle, command: &Command) -> TransportResult<()>;

    /// Releases the session and its link. Never fails.
    async fn close(&self, session: SessionHandle);
}
