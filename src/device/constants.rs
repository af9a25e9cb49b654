use btleplug::api::bleuuid::uuid_from_u16;
use uuid::Uuid;

/**
 * How long (milliseconds) a connect request may stay pending before the device is marked as timed out.
 */
pub const CONNECT_DEADLINE: u64 = 10_000;

/**
 * How long (milliseconds) service and characteristic discovery may take after connecting.
 */
pub const DISCOVERY_DEADLINE: u64 = 10_000;

/**
 * How often (milliseconds) the session checks pending requests against their deadline.
 */
pub const EXPIRY_POLL_DELAY: u64 = 250;

/**
 * How many diagnostics are kept in a snapshot, oldest dropped first.
 */
pub const DIAGNOSTICS_CAPACITY: usize = 32;

/**
 * Signal strength reported for devices whose strength is not known, e.g. devices recovered by reconciliation.
 */
pub const UNKNOWN_SIGNAL_STRENGTH: i16 = -1;

/// Name given to a discovered device that does not advertise a local name.
pub const DISCOVERED_FALLBACK_NAME: &str = "Bluetooth Device";

/// Name given to a device recovered by reconciliation without a name.
pub const RECONCILED_FALLBACK_NAME: &str = "Unknown Device";

/**
 * The UUID of the custom QDG ("HE") service. Every characteristic below it carries QDG frames.
 */
pub const QDG_SERVICE: &str = "b7779a75-f00a-05b4-147b-abf02f0d9b16";

pub const HEART_RATE_SERVICE: Uuid = uuid_from_u16(0x180D);
pub const BLOOD_PRESSURE_SERVICE: Uuid = uuid_from_u16(0x1810);
pub const WEIGHT_SCALE_SERVICE: Uuid = uuid_from_u16(0x181D);
pub const BATTERY_SERVICE: Uuid = uuid_from_u16(0x180F);

pub const BATTERY_LEVEL_CHARACTERISTIC: Uuid = uuid_from_u16(0x2A19);
pub const BLOOD_PRESSURE_MEASUREMENT_CHARACTERISTIC: Uuid = uuid_from_u16(0x2A35);
pub const HEART_RATE_MEASUREMENT_CHARACTERISTIC: Uuid = uuid_from_u16(0x2A37);
pub const WEIGHT_MEASUREMENT_CHARACTERISTIC: Uuid = uuid_from_u16(0x2A9D);

pub const QDG_SERVICE_UUID: Uuid = Uuid::from_u128(0xb7779a75_f00a_05b4_147b_abf02f0d9b16);

/// Services used to filter scans and connected-peripheral queries when the config does not name any.
pub fn default_scan_services() -> Vec<Uuid> {
    vec![
        QDG_SERVICE_UUID,
        HEART_RATE_SERVICE,
        BLOOD_PRESSURE_SERVICE,
        WEIGHT_SCALE_SERVICE,
    ]
}
