//! Boundary to the platform Bluetooth stack.
//!
//! Requests are fire-and-forget: a [`Platform`] never blocks on the remote device, and
//! every outcome comes back later as a [`PlatformEvent`].

use uuid::Uuid;

use crate::device::types::{AdapterState, DeviceId};

/// A peripheral reported by the "currently connected" query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralSummary {
    pub id: DeviceId,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlatformEvent {
    AdapterStateChanged(AdapterState),
    DeviceDiscovered { id: DeviceId, name: Option<String>, signal_strength: i16 },
    Connected(DeviceId),
    ConnectFailed(DeviceId),
    Disconnected(DeviceId),
    ConnectedQueried(Vec<PeripheralSummary>),
    ServicesDiscovered { id: DeviceId, services: Vec<Uuid> },
    CharacteristicsDiscovered { id: DeviceId, service: Uuid, characteristics: Vec<Uuid> },
    NotifyStateChanged { id: DeviceId, characteristic: Uuid, ok: bool },
    ValueUpdated { id: DeviceId, characteristic: Uuid, value: Vec<u8> },
}

pub trait Platform: Send {
    fn start_scan(&mut self, services: &[Uuid]);
    fn stop_scan(&mut self);
    fn connect(&mut self, id: &DeviceId);
    /// Answered with [`PlatformEvent::ConnectedQueried`].
    fn query_connected(&mut self, services: &[Uuid]);
    fn discover_services(&mut self, id: &DeviceId);
    fn discover_characteristics(&mut self, id: &DeviceId, service: Uuid);
    fn set_notify(&mut self, id: &DeviceId, characteristic: Uuid, enabled: bool);
    fn read_value(&mut self, id: &DeviceId, characteristic: Uuid);
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Request {
        StartScan(Vec<Uuid>),
        StopScan,
        Connect(DeviceId),
        QueryConnected(Vec<Uuid>),
        DiscoverServices(DeviceId),
        DiscoverCharacteristics(DeviceId, Uuid),
        SetNotify(DeviceId, Uuid, bool),
        ReadValue(DeviceId, Uuid),
    }

    /// Records every request; clones share the same log.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct RecordingPlatform {
        requests: Arc<Mutex<Vec<Request>>>,
    }

    impl RecordingPlatform {
        pub(crate) fn requests(&self) -> Vec<Request> {
            self.requests.lock().unwrap().clone()
        }

        pub(crate) fn take(&self) -> Vec<Request> {
            std::mem::take(&mut *self.requests.lock().unwrap())
        }

        fn push(&self, request: Request) {
            self.requests.lock().unwrap().push(request);
        }
    }

    impl Platform for RecordingPlatform {
        fn start_scan(&mut self, services: &[Uuid]) {
            self.push(Request::StartScan(services.to_vec()));
        }

        fn stop_scan(&mut self) {
            self.push(Request::StopScan);
        }

        fn connect(&mut self, id: &DeviceId) {
            self.push(Request::Connect(id.clone()));
        }

        fn query_connected(&mut self, services: &[Uuid]) {
            self.push(Request::QueryConnected(services.to_vec()));
        }

        fn discover_services(&mut self, id: &DeviceId) {
            self.push(Request::DiscoverServices(id.clone()));
        }

        fn discover_characteristics(&mut self, id: &DeviceId, service: Uuid) {
            self.push(Request::DiscoverCharacteristics(id.clone(), service));
        }

        fn set_notify(&mut self, id: &DeviceId, characteristic: Uuid, enabled: bool) {
            self.push(Request::SetNotify(id.clone(), characteristic, enabled));
        }

        fn read_value(&mut self, id: &DeviceId, characteristic: Uuid) {
            self.push(Request::ReadValue(id.clone(), characteristic));
        }
    }
}
