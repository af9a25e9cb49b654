use std::fmt;
use indexmap::{IndexMap, IndexSet};
use uuid::Uuid;

use crate::device::constants::UNKNOWN_SIGNAL_STRENGTH;
use crate::device::decoder::{BloodPressureMeasurement, HeartRateMeasurement, QdgFrame, Reading, WeightMeasurement};
use crate::error::DecodeError;

/// Opaque, platform assigned peripheral identifier. Stable for the lifetime of the
/// Bluetooth session, not across application runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        DeviceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        DeviceId::new(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeasurementKind {
    HeartRate,
    BloodPressure,
    Weight,
    Qdg,
}

impl fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self {
            MeasurementKind::HeartRate => "Heart Rate",
            MeasurementKind::BloodPressure => "Blood Pressure",
            MeasurementKind::Weight => "Weight",
            MeasurementKind::Qdg => "QDG",
        };

        write!(f, "{}", result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Discovered,
    Connecting,
    Connected,
    ServicesResolving,
    Ready,
    Disconnected,
    Failed,
    TimedOut,
}

impl ConnectionState {
    /// States from which a new connect request may be issued.
    pub fn can_connect(&self) -> bool {
        matches!(
            self,
            ConnectionState::Discovered
                | ConnectionState::Failed
                | ConnectionState::TimedOut
                | ConnectionState::Disconnected
        )
    }
}

/// Power/permission state of the local Bluetooth adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdapterState {
    #[default]
    Unknown,
    PoweredOn,
    PoweredOff,
    Unauthorized,
    Unsupported,
}

/// Latest decoded value per measurement kind. Values are replaced, never merged.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Measurements {
    pub battery_level: Option<u8>,
    pub heart_rate: Option<HeartRateMeasurement>,
    pub blood_pressure: Option<BloodPressureMeasurement>,
    pub weight: Option<WeightMeasurement>,
    pub qdg: Option<QdgFrame>,
}

impl Measurements {
    pub fn with_reading(&self, reading: Reading) -> Measurements {
        let mut next = self.clone();
        match reading {
            Reading::BatteryLevel(level) => next.battery_level = Some(level),
            Reading::HeartRate(value) => next.heart_rate = Some(value),
            Reading::BloodPressure(value) => next.blood_pressure = Some(value),
            Reading::Weight(value) => next.weight = Some(value),
            Reading::Qdg(value) => next.qdg = Some(value),
        }
        next
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub signal_strength: i16,
    pub state: ConnectionState,
    pub capabilities: IndexSet<MeasurementKind>,
    /// service -> characteristics, as reported by discovery
    pub services: IndexMap<Uuid, Vec<Uuid>>,
    /// only characteristics whose notification subscription succeeded
    pub subscriptions: IndexMap<MeasurementKind, Uuid>,
    pub measurements: Measurements,
    pub(crate) pending_services: IndexSet<Uuid>,
    pub(crate) pending_subscriptions: IndexMap<Uuid, MeasurementKind>,
}

impl Device {
    pub fn new(id: DeviceId, name: String, signal_strength: i16, state: ConnectionState) -> Self {
        Device {
            id,
            name,
            signal_strength,
            state,
            capabilities: IndexSet::new(),
            services: IndexMap::new(),
            subscriptions: IndexMap::new(),
            measurements: Measurements::default(),
            pending_services: IndexSet::new(),
            pending_subscriptions: IndexMap::new(),
        }
    }

    /// A device recovered from the platform's connected-peripheral query.
    pub fn bare(id: DeviceId, name: String) -> Self {
        Device::new(id, name, UNKNOWN_SIGNAL_STRENGTH, ConnectionState::Connected)
    }

    /// The service a characteristic was discovered under, if any.
    pub fn service_of(&self, characteristic: &Uuid) -> Option<&Uuid> {
        self.services
            .iter()
            .find(|(_, characteristics)| characteristics.contains(characteristic))
            .map(|(service, _)| service)
    }
}

/// What a pending operation is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingOperation {
    Connect,
    Discovery,
}

impl fmt::Display for PendingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PendingOperation::Connect => write!(f, "connect"),
            PendingOperation::Discovery => write!(f, "service discovery"),
        }
    }
}

/// Non-fatal failures, surfaced to observers instead of being returned.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    ConnectFailed(DeviceId),
    Disconnected(DeviceId),
    TimedOut(DeviceId, PendingOperation),
    SubscribeFailed(DeviceId, Uuid),
    Decode(DeviceId, Uuid, DecodeError),
    UnknownDevice(DeviceId),
}

/// Immutable view of the engine, published after every change.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Snapshot {
    pub version: u64,
    pub adapter: AdapterState,
    pub scanning: bool,
    pub discovered: Vec<Device>,
    pub connected: Vec<Device>,
    pub diagnostics: Vec<Diagnostic>,
}

impl Snapshot {
    pub fn connected_device(&self, id: &DeviceId) -> Option<&Device> {
        self.connected.iter().find(|device| &device.id == id)
    }

    pub fn discovered_device(&self, id: &DeviceId) -> Option<&Device> {
        self.discovered.iter().find(|device| &device.id == id)
    }
}

/// Requests from the presentation layer to the session.
#[derive(Debug, Clone)]
pub enum SessionCommand {
    Scan(bool),
    Connect(DeviceId),
    Reconcile,
    ResolveServices(DeviceId),
}
