//! Decoders for characteristic values.
//!
//! Every decoder is a pure function of the raw bytes and never indexes past the end of
//! the buffer; truncated input is reported as [`DecodeError::TooShort`].

use std::fmt;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::device::types::MeasurementKind;
use crate::error::DecodeError;

/// Wire format of a characteristic value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PayloadFormat {
    BatteryLevel,
    HeartRate,
    BloodPressure,
    Weight,
    QdgFrame,
}

impl PayloadFormat {
    /// The measurement kind this format reports, if it is a measurement at all.
    pub fn kind(&self) -> Option<MeasurementKind> {
        match self {
            PayloadFormat::BatteryLevel => None,
            PayloadFormat::HeartRate => Some(MeasurementKind::HeartRate),
            PayloadFormat::BloodPressure => Some(MeasurementKind::BloodPressure),
            PayloadFormat::Weight => Some(MeasurementKind::Weight),
            PayloadFormat::QdgFrame => Some(MeasurementKind::Qdg),
        }
    }
}

impl fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self {
            PayloadFormat::BatteryLevel => "battery level",
            PayloadFormat::HeartRate => "heart rate measurement",
            PayloadFormat::BloodPressure => "blood pressure measurement",
            PayloadFormat::Weight => "weight measurement",
            PayloadFormat::QdgFrame => "QDG frame",
        };

        write!(f, "{}", result)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    BatteryLevel(u8),
    HeartRate(HeartRateMeasurement),
    BloodPressure(BloodPressureMeasurement),
    Weight(WeightMeasurement),
    Qdg(QdgFrame),
}

pub fn decode(format: PayloadFormat, bytes: &[u8]) -> Result<Reading, DecodeError> {
    let reading = match format {
        PayloadFormat::BatteryLevel => Reading::BatteryLevel(decode_battery_level(bytes)?),
        PayloadFormat::HeartRate => Reading::HeartRate(HeartRateMeasurement::decode(bytes)?),
        PayloadFormat::BloodPressure => Reading::BloodPressure(BloodPressureMeasurement::decode(bytes)?),
        PayloadFormat::Weight => Reading::Weight(WeightMeasurement::decode(bytes)?),
        PayloadFormat::QdgFrame => Reading::Qdg(QdgFrame::decode(bytes)?),
    };
    debug!("Decoded {}: {:?}", format, reading);
    Ok(reading)
}

fn require(format: PayloadFormat, bytes: &[u8], required: usize) -> Result<(), DecodeError> {
    if bytes.len() < required {
        return Err(DecodeError::TooShort { format, required, actual: bytes.len() });
    }
    Ok(())
}

fn u16_le(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

pub fn decode_battery_level(bytes: &[u8]) -> Result<u8, DecodeError> {
    require(PayloadFormat::BatteryLevel, bytes, 1)?;
    Ok(bytes[0])
}

// Blood pressure measurement flag bits
const BP_FLAG_KPA: u8 = 0x01;
const BP_FLAG_TIMESTAMP: u8 = 0x01 << 1;
const BP_FLAG_PULSE: u8 = 0x01 << 2;
const BP_FLAG_USER_ID: u8 = 0x01 << 3;
const BP_FLAG_STATUS: u8 = 0x01 << 4;

// Field offsets are fixed, optional fields never shift them.
const BP_SYSTOLIC_OFFSET: usize = 1;
const BP_DIASTOLIC_OFFSET: usize = 3;
const BP_PULSE_OFFSET: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureUnit {
    MmHg,
    KPa,
}

impl fmt::Display for PressureUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PressureUnit::MmHg => write!(f, "mmHg"),
            PressureUnit::KPa => write!(f, "kPa"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloodPressureMeasurement {
    pub unit: PressureUnit,
    pub systolic: u16,
    pub diastolic: u16,
    pub pulse: Option<u16>,
    pub timestamp_present: bool,
    pub user_id_present: bool,
    pub status_present: bool,
}

impl BloodPressureMeasurement {
    /// Decodes the flags-based blood pressure layout.
    ///
    /// Systolic, diastolic and pulse are read as the single low-order byte at offsets
    /// 1, 3 and 5 respectively, whatever the timestamp and user id flags say.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let format = PayloadFormat::BloodPressure;
        require(format, bytes, BP_DIASTOLIC_OFFSET + 1)?;

        let flags = bytes[0];
        let pulse = if flags & BP_FLAG_PULSE != 0 {
            require(format, bytes, BP_PULSE_OFFSET + 1)?;
            Some(u16::from(bytes[BP_PULSE_OFFSET]))
        } else {
            None
        };

        Ok(BloodPressureMeasurement {
            unit: if flags & BP_FLAG_KPA == 0 { PressureUnit::MmHg } else { PressureUnit::KPa },
            systolic: u16::from(bytes[BP_SYSTOLIC_OFFSET]),
            diastolic: u16::from(bytes[BP_DIASTOLIC_OFFSET]),
            pulse,
            timestamp_present: flags & BP_FLAG_TIMESTAMP != 0,
            user_id_present: flags & BP_FLAG_USER_ID != 0,
            status_present: flags & BP_FLAG_STATUS != 0,
        })
    }
}

const HR_FLAG_U16: u8 = 0x01;
const HR_FLAG_CONTACT_SUPPORTED: u8 = 0x01 << 2;
const HR_FLAG_CONTACT_DETECTED: u8 = 0x01 << 1;
const HR_FLAG_ENERGY: u8 = 0x01 << 3;
const HR_FLAG_RR: u8 = 0x01 << 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartRateMeasurement {
    pub bpm: u16,
    /// None when the sensor does not support contact detection
    pub sensor_contact: Option<bool>,
    pub energy_expended: Option<u16>,
    /// RR intervals in units of 1/1024 second
    pub rr_intervals: Vec<u16>,
}

impl HeartRateMeasurement {
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let format = PayloadFormat::HeartRate;
        require(format, bytes, 2)?;

        let flags = bytes[0];
        let mut offset = 1;

        let bpm = if flags & HR_FLAG_U16 != 0 {
            require(format, bytes, offset + 2)?;
            offset += 2;
            u16_le(bytes, 1)
        } else {
            offset += 1;
            u16::from(bytes[1])
        };

        let sensor_contact = if flags & HR_FLAG_CONTACT_SUPPORTED != 0 {
            Some(flags & HR_FLAG_CONTACT_DETECTED != 0)
        } else {
            None
        };

        let energy_expended = if flags & HR_FLAG_ENERGY != 0 {
            require(format, bytes, offset + 2)?;
            let value = u16_le(bytes, offset);
            offset += 2;
            Some(value)
        } else {
            None
        };

        let rr_intervals = if flags & HR_FLAG_RR != 0 {
            bytes[offset..]
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect()
        } else {
            Vec::new()
        };

        Ok(HeartRateMeasurement { bpm, sensor_contact, energy_expended, rr_intervals })
    }
}

const WEIGHT_FLAG_IMPERIAL: u8 = 0x01;
const WEIGHT_RESOLUTION_KG: f32 = 0.005;
const WEIGHT_RESOLUTION_LB: f32 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightUnit {
    Kilograms,
    Pounds,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeightMeasurement {
    pub unit: WeightUnit,
    pub weight: f32,
}

impl WeightMeasurement {
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        require(PayloadFormat::Weight, bytes, 3)?;

        let raw = f32::from(u16_le(bytes, 1));
        let measurement = if bytes[0] & WEIGHT_FLAG_IMPERIAL == 0 {
            WeightMeasurement { unit: WeightUnit::Kilograms, weight: raw * WEIGHT_RESOLUTION_KG }
        } else {
            WeightMeasurement { unit: WeightUnit::Pounds, weight: raw * WEIGHT_RESOLUTION_LB }
        };
        Ok(measurement)
    }
}

/// Size of the QDG header in bytes.
pub const QDG_HEADER_LEN: usize = 7;

/// Fixed QDG frame header. Fields are byte addressed and little-endian:
///
/// ```text
/// [0-1] : message size (u16)
/// [2]   : protocol id
/// [3]   : message id
/// [4-5] : sequence number (u16)
/// [6]   : reserved
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QdgHeader {
    pub message_size: u16,
    pub protocol_id: u8,
    pub message_id: u8,
    pub sequence: u16,
    pub reserved: u8,
}

impl QdgHeader {
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        require(PayloadFormat::QdgFrame, bytes, QDG_HEADER_LEN)?;

        Ok(QdgHeader {
            message_size: u16_le(bytes, 0),
            protocol_id: bytes[2],
            message_id: bytes[3],
            sequence: u16_le(bytes, 4),
            reserved: bytes[6],
        })
    }

    pub fn encode(&self) -> [u8; QDG_HEADER_LEN] {
        let size = self.message_size.to_le_bytes();
        let sequence = self.sequence.to_le_bytes();
        [size[0], size[1], self.protocol_id, self.message_id, sequence[0], sequence[1], self.reserved]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QdgFrame {
    pub header: QdgHeader,
    /// bytes following the header, uninterpreted
    pub body: Vec<u8>,
}

impl QdgFrame {
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let header = QdgHeader::decode(bytes)?;
        Ok(QdgFrame { header, body: bytes[QDG_HEADER_LEN..].to_vec() })
    }
}
