use indexmap::IndexMap;
use log::debug;
use uuid::Uuid;

use crate::config::types::{CustomRoute, RouteAction};
use crate::device::constants::{
    BATTERY_LEVEL_CHARACTERISTIC, BLOOD_PRESSURE_MEASUREMENT_CHARACTERISTIC, BLOOD_PRESSURE_SERVICE,
    HEART_RATE_MEASUREMENT_CHARACTERISTIC, HEART_RATE_SERVICE, QDG_SERVICE_UUID,
    WEIGHT_MEASUREMENT_CHARACTERISTIC, WEIGHT_SCALE_SERVICE,
};
use crate::device::decoder::PayloadFormat;
use crate::device::types::MeasurementKind;
use crate::error::DecodeError;

/// How a discovered characteristic is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Subscribe(PayloadFormat),
    ReadOnce(PayloadFormat),
    Ignore,
}

impl Action {
    pub fn format(&self) -> Option<PayloadFormat> {
        match self {
            Action::Subscribe(format) | Action::ReadOnce(format) => Some(*format),
            Action::Ignore => None,
        }
    }
}

impl From<&CustomRoute> for Action {
    fn from(route: &CustomRoute) -> Self {
        match route.action {
            RouteAction::Subscribe => Action::Subscribe(route.format),
            RouteAction::ReadOnce => Action::ReadOnce(route.format),
        }
    }
}

/// Static mapping from characteristic (or whole service) to its handling policy.
#[derive(Debug, Clone)]
pub struct Router {
    characteristics: IndexMap<Uuid, Action>,
    services: IndexMap<Uuid, Action>,
    capabilities: IndexMap<Uuid, MeasurementKind>,
}

impl Default for Router {
    fn default() -> Self {
        let characteristics = IndexMap::from([
            (BATTERY_LEVEL_CHARACTERISTIC, Action::ReadOnce(PayloadFormat::BatteryLevel)),
            (HEART_RATE_MEASUREMENT_CHARACTERISTIC, Action::Subscribe(PayloadFormat::HeartRate)),
            (BLOOD_PRESSURE_MEASUREMENT_CHARACTERISTIC, Action::Subscribe(PayloadFormat::BloodPressure)),
            (WEIGHT_MEASUREMENT_CHARACTERISTIC, Action::Subscribe(PayloadFormat::Weight)),
        ]);

        let services = IndexMap::from([
            (QDG_SERVICE_UUID, Action::Subscribe(PayloadFormat::QdgFrame)),
        ]);

        let capabilities = IndexMap::from([
            (HEART_RATE_SERVICE, MeasurementKind::HeartRate),
            (BLOOD_PRESSURE_SERVICE, MeasurementKind::BloodPressure),
            (WEIGHT_SCALE_SERVICE, MeasurementKind::Weight),
            (QDG_SERVICE_UUID, MeasurementKind::Qdg),
        ]);

        Router { characteristics, services, capabilities }
    }
}

impl Router {
    /// The default table extended with routes from the config. Custom routes override defaults.
    pub fn with_custom_routes(routes: &[CustomRoute]) -> Self {
        let mut router = Router::default();
        for route in routes {
            let action = Action::from(route);
            match route.characteristic {
                Some(characteristic) => { router.characteristics.insert(characteristic, action); },
                None => match route.service {
                    Some(service) => { router.services.insert(service, action); },
                    None => debug!("Ignoring custom route without characteristic or service: {:?}", route),
                },
            }
        }
        router
    }

    /// Exact characteristic entries win over service-wide entries.
    pub fn route(&self, characteristic: &Uuid, service: Option<&Uuid>) -> Action {
        if let Some(action) = self.characteristics.get(characteristic) {
            return *action;
        }

        if let Some(action) = service.and_then(|service| self.services.get(service)) {
            return *action;
        }

        debug!("No route for characteristic {} (service {:?})", characteristic, service);
        Action::Ignore
    }

    /// The decoder for values arriving on `characteristic`.
    pub fn format_for(&self, characteristic: &Uuid, service: Option<&Uuid>) -> Result<PayloadFormat, DecodeError> {
        self.route(characteristic, service)
            .format()
            .ok_or(DecodeError::UnknownCharacteristic(*characteristic))
    }

    /// The measurement kind implied by a service being present on a device.
    pub fn service_capability(&self, service: &Uuid) -> Option<MeasurementKind> {
        self.capabilities.get(service).copied()
    }
}
