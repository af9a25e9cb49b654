//! Connection state machine and reconciliation.
//!
//! The engine is synchronous and owns every device collection. It is driven by one
//! owner (see `session`), which feeds it presentation requests, platform events and
//! timeout ticks. After every change a complete [`Snapshot`] is published on a watch
//! channel; observers never see the live collections.

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use indexmap::{IndexMap, IndexSet};
use log::{debug, info, warn};
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::types::Config;
use crate::device::constants::{DISCOVERED_FALLBACK_NAME, RECONCILED_FALLBACK_NAME, UNKNOWN_SIGNAL_STRENGTH};
use crate::device::decoder::decode;
use crate::device::platform::{PeripheralSummary, Platform, PlatformEvent};
use crate::device::registry::Registry;
use crate::device::router::{Action, Router};
use crate::device::types::{
    AdapterState, ConnectionState, Device, DeviceId, Diagnostic, PendingOperation, Snapshot,
};
use crate::error::DeviceError;

#[derive(Debug, Clone, Copy)]
struct Pending {
    operation: PendingOperation,
    deadline: Instant,
}

pub struct Engine<P: Platform> {
    platform: P,
    router: Router,
    scan_services: Vec<Uuid>,
    connect_timeout: Duration,
    discovery_timeout: Duration,
    diagnostics_capacity: usize,

    adapter: AdapterState,
    scanning: bool,
    discovered: Registry,
    connected: Registry,
    pending: IndexMap<DeviceId, Pending>,
    diagnostics: VecDeque<Diagnostic>,

    version: u64,
    publisher: watch::Sender<Snapshot>,
}

impl<P: Platform> Engine<P> {
    pub fn new(platform: P, router: Router, config: &Config) -> Self {
        let (publisher, _) = watch::channel(Snapshot::default());

        Engine {
            platform,
            router,
            scan_services: config.scan_services.clone(),
            connect_timeout: config.connect_timeout(),
            discovery_timeout: config.discovery_timeout(),
            diagnostics_capacity: config.diagnostics_capacity,
            adapter: AdapterState::Unknown,
            scanning: false,
            discovered: Registry::new(),
            connected: Registry::new(),
            pending: IndexMap::new(),
            diagnostics: VecDeque::new(),
            version: 0,
            publisher,
        }
    }

    /// Receiver for published snapshots. The current snapshot is available immediately.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.publisher.subscribe()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            version: self.version,
            adapter: self.adapter,
            scanning: self.scanning,
            discovered: self.discovered.to_vec(),
            connected: self.connected.to_vec(),
            diagnostics: self.diagnostics.iter().cloned().collect(),
        }
    }

    fn publish(&mut self) {
        self.version += 1;
        let snapshot = self.snapshot();
        self.publisher.send_replace(snapshot);
    }

    fn record(&mut self, diagnostic: Diagnostic) {
        warn!("{:?}", diagnostic);
        if self.diagnostics_capacity == 0 {
            return;
        }
        while self.diagnostics.len() >= self.diagnostics_capacity {
            self.diagnostics.pop_front();
        }
        self.diagnostics.push_back(diagnostic);
    }

    fn arm(&mut self, id: &DeviceId, operation: PendingOperation) {
        let timeout = match operation {
            PendingOperation::Connect => self.connect_timeout,
            PendingOperation::Discovery => self.discovery_timeout,
        };
        self.pending.insert(id.clone(), Pending { operation, deadline: Instant::now() + timeout });
    }

    fn disarm(&mut self, id: &DeviceId, operation: PendingOperation) {
        if self.pending.get(id).map(|pending| pending.operation) == Some(operation) {
            self.pending.shift_remove(id);
        }
    }

    fn set_state(&mut self, id: &DeviceId, state: ConnectionState) {
        if let Some(device) = self.discovered.get_mut(id) {
            device.state = state;
        }
        if let Some(device) = self.connected.get_mut(id) {
            device.state = state;
        }
    }

    /// Clears the discovered list and starts scanning for the configured services.
    pub fn begin_scan(&mut self) {
        info!("Starting scan");
        self.discovered.clear();
        self.scanning = true;
        self.platform.start_scan(&self.scan_services);
        self.publish();
    }

    pub fn end_scan(&mut self) {
        info!("Stopping scan");
        self.scanning = false;
        self.platform.stop_scan();
        self.publish();
    }

    /// Issues a connect request. The outcome arrives later as a platform event.
    pub fn connect(&mut self, id: &DeviceId) -> Result<(), DeviceError> {
        let state = self.discovered.get(id)
            .or_else(|| self.connected.get(id))
            .map(|device| device.state)
            .ok_or_else(|| DeviceError::UnknownDevice(id.clone()))?;

        if !state.can_connect() {
            return Err(DeviceError::InvalidState { id: id.clone(), state });
        }

        info!("Connecting to {}", id);
        self.set_state(id, ConnectionState::Connecting);
        self.arm(id, PendingOperation::Connect);
        self.platform.connect(id);
        self.publish();
        Ok(())
    }

    /// Asks the platform for its connected peripherals; the answer is applied by [`Engine::reconcile`].
    pub fn request_reconcile(&mut self) {
        debug!("Querying connected peripherals");
        self.platform.query_connected(&self.scan_services);
    }

    /// Re-runs service discovery for a connected device, e.g. one that reconciliation added bare.
    pub fn request_services(&mut self, id: &DeviceId) -> Result<(), DeviceError> {
        let device = self.connected.get_mut(id).ok_or_else(|| DeviceError::UnknownDevice(id.clone()))?;

        if !matches!(device.state, ConnectionState::Connected | ConnectionState::Ready) {
            return Err(DeviceError::InvalidState { id: id.clone(), state: device.state });
        }

        device.pending_services.clear();
        self.begin_discovery(id);
        self.publish();
        Ok(())
    }

    fn begin_discovery(&mut self, id: &DeviceId) {
        self.set_state(id, ConnectionState::ServicesResolving);
        self.arm(id, PendingOperation::Discovery);
        self.platform.discover_services(id);
    }

    /// Rebuilds the connected list from a freshly queried connected set.
    ///
    /// Devices still present keep their position and accumulated state; devices missing
    /// from `fresh` are dropped; unseen ids are appended as bare devices.
    pub fn reconcile(&mut self, fresh: Vec<PeripheralSummary>) {
        let before = self.connected.len();
        let dropped: Vec<DeviceId> = self.connected.iter()
            .filter(|device| !fresh.iter().any(|peripheral| peripheral.id == device.id))
            .map(|device| device.id.clone())
            .collect();
        self.connected.retain(|device| fresh.iter().any(|peripheral| peripheral.id == device.id));
        let retained = self.connected.len();

        for id in &dropped {
            // a connect already in flight owns the discovered copy
            let connecting = self.pending.get(id).map(|pending| pending.operation) == Some(PendingOperation::Connect);
            if let Some(device) = self.discovered.get_mut(id) {
                if !connecting {
                    device.state = ConnectionState::Disconnected;
                }
            }
        }

        for peripheral in fresh {
            if self.connected.contains(&peripheral.id) {
                continue;
            }
            let name = peripheral.name.unwrap_or_else(|| RECONCILED_FALLBACK_NAME.to_string());
            let id = peripheral.id;
            self.connected.upsert(&id, || Device::bare(id.clone(), name));
        }

        let connected = &self.connected;
        let discovered = &self.discovered;
        self.pending.retain(|id, _| connected.contains(id) || discovered.contains(id));

        info!(
            "Reconciled connected devices: {} retained, {} dropped, {} added",
            retained,
            before - retained,
            self.connected.len() - retained,
        );
        self.publish();
    }

    /// Moves every pending request whose deadline passed to `TimedOut`.
    pub fn expire_pending(&mut self, now: Instant) {
        let expired: Vec<(DeviceId, PendingOperation)> = self.pending
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(id, pending)| (id.clone(), pending.operation))
            .collect();

        if expired.is_empty() {
            return;
        }

        for (id, operation) in expired {
            self.pending.shift_remove(&id);
            self.set_state(&id, ConnectionState::TimedOut);
            self.record(Diagnostic::TimedOut(id, operation));
        }
        self.publish();
    }

    pub fn handle(&mut self, event: PlatformEvent) {
        match event {
            PlatformEvent::AdapterStateChanged(state) => self.adapter_state_changed(state),
            PlatformEvent::DeviceDiscovered { id, name, signal_strength } => self.device_discovered(id, name, signal_strength),
            PlatformEvent::Connected(id) => self.connected(id),
            PlatformEvent::ConnectFailed(id) => self.connect_failed(id),
            PlatformEvent::Disconnected(id) => self.disconnected(id),
            PlatformEvent::ConnectedQueried(fresh) => return self.reconcile(fresh),
            PlatformEvent::ServicesDiscovered { id, services } => self.services_discovered(id, services),
            PlatformEvent::CharacteristicsDiscovered { id, service, characteristics } => {
                self.characteristics_discovered(id, service, characteristics)
            },
            PlatformEvent::NotifyStateChanged { id, characteristic, ok } => self.notify_state_changed(id, characteristic, ok),
            PlatformEvent::ValueUpdated { id, characteristic, value } => self.value_updated(id, characteristic, &value),
        }
        self.publish();
    }

    fn adapter_state_changed(&mut self, state: AdapterState) {
        info!("Adapter state: {:?}", state);
        self.adapter = state;
        if state != AdapterState::PoweredOn {
            self.scanning = false;
        }
    }

    fn device_discovered(&mut self, id: DeviceId, name: Option<String>, signal_strength: i16) {
        let device = self.discovered.upsert(&id, || {
            debug!("Discovered {} ({:?}, {})", id, name, signal_strength);
            Device::new(id.clone(), DISCOVERED_FALLBACK_NAME.to_string(), signal_strength, ConnectionState::Discovered)
        });

        if let Some(name) = name {
            device.name = name;
        }
        device.signal_strength = signal_strength;
    }

    fn connected(&mut self, id: DeviceId) {
        info!("Connected to {}", id);
        self.disarm(&id, PendingOperation::Connect);

        let template = self.discovered.get(&id).cloned();
        let device = self.connected.upsert(&id, || {
            template.unwrap_or_else(|| {
                Device::new(id.clone(), RECONCILED_FALLBACK_NAME.to_string(), UNKNOWN_SIGNAL_STRENGTH, ConnectionState::Connected)
            })
        });
        // a fresh link has no notification subscriptions yet
        device.pending_services.clear();
        device.subscriptions.clear();
        device.pending_subscriptions.clear();
        self.set_state(&id, ConnectionState::Connected);

        self.begin_discovery(&id);
        self.request_reconcile();
    }

    fn connect_failed(&mut self, id: DeviceId) {
        self.disarm(&id, PendingOperation::Connect);
        self.set_state(&id, ConnectionState::Failed);
        self.record(Diagnostic::ConnectFailed(id));
    }

    fn disconnected(&mut self, id: DeviceId) {
        // stays in the connected list until the next reconciliation
        self.pending.shift_remove(&id);
        if let Some(device) = self.connected.get_mut(&id) {
            device.subscriptions.clear();
            device.pending_subscriptions.clear();
            device.pending_services.clear();
        }
        self.set_state(&id, ConnectionState::Disconnected);
        self.record(Diagnostic::Disconnected(id));
    }

    fn services_discovered(&mut self, id: DeviceId, services: Vec<Uuid>) {
        let device = match self.connected.get_mut(&id) {
            Some(device) => device,
            None => return self.record(Diagnostic::UnknownDevice(id)),
        };

        debug!("{} has services {:?}", id, services);
        for service in &services {
            device.services.entry(*service).or_default();
            if let Some(kind) = self.router.service_capability(service) {
                device.capabilities.insert(kind);
            }
        }

        device.pending_services = services.iter().copied().collect::<IndexSet<Uuid>>();
        if services.is_empty() {
            // nothing left to wait for
            return self.resolve_if_complete(&id);
        }
        for service in services {
            self.platform.discover_characteristics(&id, service);
        }
    }

    fn resolve_if_complete(&mut self, id: &DeviceId) {
        let complete = self.connected.get(id)
            .map(|device| device.pending_services.is_empty() && device.state == ConnectionState::ServicesResolving)
            .unwrap_or(false);

        if complete {
            info!("{} is ready", id);
            self.disarm(id, PendingOperation::Discovery);
            self.set_state(id, ConnectionState::Ready);
        }
    }

    fn characteristics_discovered(&mut self, id: DeviceId, service: Uuid, characteristics: Vec<Uuid>) {
        let device = match self.connected.get_mut(&id) {
            Some(device) => device,
            None => return self.record(Diagnostic::UnknownDevice(id)),
        };

        if characteristics.is_empty() {
            // not counted as an answer: the device keeps waiting on this service
            warn!("Service {} of {} reported no characteristics", service, id);
            return;
        }

        for characteristic in &characteristics {
            match self.router.route(characteristic, Some(&service)) {
                Action::Subscribe(format) => {
                    debug!("Subscribing to {} {} ({})", service, characteristic, format);
                    if let Some(kind) = format.kind() {
                        device.capabilities.insert(kind);
                        device.pending_subscriptions.insert(*characteristic, kind);
                    }
                    self.platform.set_notify(&id, *characteristic, true);
                },
                Action::ReadOnce(format) => {
                    debug!("Reading {} {} ({})", service, characteristic, format);
                    if let Some(kind) = format.kind() {
                        device.capabilities.insert(kind);
                    }
                    self.platform.read_value(&id, *characteristic);
                },
                Action::Ignore => {},
            }
        }
        device.services.insert(service, characteristics);

        device.pending_services.shift_remove(&service);
        self.resolve_if_complete(&id);
    }

    fn notify_state_changed(&mut self, id: DeviceId, characteristic: Uuid, ok: bool) {
        let device = match self.connected.get_mut(&id) {
            Some(device) => device,
            None => return self.record(Diagnostic::UnknownDevice(id)),
        };

        let kind = device.pending_subscriptions.shift_remove(&characteristic);
        if !ok {
            return self.record(Diagnostic::SubscribeFailed(id, characteristic));
        }

        if let Some(kind) = kind {
            debug!("{} delivers {} through {}", id, kind, characteristic);
            device.subscriptions.insert(kind, characteristic);
        }
    }

    fn value_updated(&mut self, id: DeviceId, characteristic: Uuid, value: &[u8]) {
        let device = match self.connected.get_mut(&id) {
            Some(device) => device,
            None => return self.record(Diagnostic::UnknownDevice(id)),
        };

        let service = device.service_of(&characteristic).copied();
        let decoded = self.router.format_for(&characteristic, service.as_ref())
            .and_then(|format| decode(format, value));

        match decoded {
            Ok(reading) => device.measurements = device.measurements.with_reading(reading),
            Err(err) => self.record(Diagnostic::Decode(id, characteristic, err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::constants::{
        BATTERY_LEVEL_CHARACTERISTIC, BATTERY_SERVICE, BLOOD_PRESSURE_MEASUREMENT_CHARACTERISTIC,
        BLOOD_PRESSURE_SERVICE, HEART_RATE_SERVICE,
    };
    use crate::device::decoder::PressureUnit;
    use crate::device::platform::testing::{RecordingPlatform, Request};
    use crate::device::types::MeasurementKind;
    use crate::error::DecodeError;

    fn engine() -> (Engine<RecordingPlatform>, RecordingPlatform) {
        let platform = RecordingPlatform::default();
        let engine = Engine::new(platform.clone(), Router::default(), &Config::default());
        (engine, platform)
    }

    fn id(value: &str) -> DeviceId {
        DeviceId::from(value)
    }

    fn discover(engine: &mut Engine<RecordingPlatform>, device: &str) {
        engine.handle(PlatformEvent::DeviceDiscovered { id: id(device), name: Some(device.to_string()), signal_strength: -50 });
    }

    fn summary(device: &str) -> PeripheralSummary {
        PeripheralSummary { id: id(device), name: Some(device.to_string()) }
    }

    /// Discovers, connects and resolves a blood pressure cuff with a battery service.
    fn ready_cuff(engine: &mut Engine<RecordingPlatform>, device: &str) {
        discover(engine, device);
        engine.connect(&id(device)).unwrap();
        engine.handle(PlatformEvent::Connected(id(device)));
        engine.handle(PlatformEvent::ServicesDiscovered {
            id: id(device),
            services: vec![BLOOD_PRESSURE_SERVICE, BATTERY_SERVICE],
        });
        engine.handle(PlatformEvent::CharacteristicsDiscovered {
            id: id(device),
            service: BLOOD_PRESSURE_SERVICE,
            characteristics: vec![BLOOD_PRESSURE_MEASUREMENT_CHARACTERISTIC],
        });
        engine.handle(PlatformEvent::CharacteristicsDiscovered {
            id: id(device),
            service: BATTERY_SERVICE,
            characteristics: vec![BATTERY_LEVEL_CHARACTERISTIC],
        });
    }

    #[test]
    fn discovering_twice_keeps_one_entry_with_latest_sighting() {
        let (mut engine, _) = engine();

        discover(&mut engine, "cuff");
        engine.handle(PlatformEvent::DeviceDiscovered { id: id("cuff"), name: Some("Cuff 2".to_string()), signal_strength: -80 });

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.discovered.len(), 1);
        assert_eq!(snapshot.discovered[0].name, "Cuff 2");
        assert_eq!(snapshot.discovered[0].signal_strength, -80);
    }

    #[test]
    fn unnamed_device_gets_fallback_name() {
        let (mut engine, _) = engine();

        engine.handle(PlatformEvent::DeviceDiscovered { id: id("anon"), name: None, signal_strength: -60 });

        assert_eq!(engine.snapshot().discovered[0].name, DISCOVERED_FALLBACK_NAME);
    }

    #[test]
    fn begin_scan_clears_discovered_list() {
        let (mut engine, platform) = engine();
        discover(&mut engine, "old");

        engine.begin_scan();

        let snapshot = engine.snapshot();
        assert!(snapshot.discovered.is_empty());
        assert!(snapshot.scanning);
        assert_eq!(platform.requests(), vec![Request::StartScan(Config::default().scan_services)]);
    }

    #[test]
    fn full_connection_lifecycle() {
        let (mut engine, platform) = engine();
        discover(&mut engine, "cuff");

        engine.connect(&id("cuff")).unwrap();
        assert_eq!(engine.snapshot().discovered[0].state, ConnectionState::Connecting);
        assert_eq!(platform.take(), vec![Request::Connect(id("cuff"))]);

        engine.handle(PlatformEvent::Connected(id("cuff")));
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.connected.len(), 1);
        assert_eq!(snapshot.connected[0].state, ConnectionState::ServicesResolving);
        assert_eq!(
            platform.take(),
            vec![Request::DiscoverServices(id("cuff")), Request::QueryConnected(Config::default().scan_services)]
        );

        engine.handle(PlatformEvent::ServicesDiscovered {
            id: id("cuff"),
            services: vec![BLOOD_PRESSURE_SERVICE, BATTERY_SERVICE],
        });
        assert_eq!(
            platform.take(),
            vec![
                Request::DiscoverCharacteristics(id("cuff"), BLOOD_PRESSURE_SERVICE),
                Request::DiscoverCharacteristics(id("cuff"), BATTERY_SERVICE),
            ]
        );

        engine.handle(PlatformEvent::CharacteristicsDiscovered {
            id: id("cuff"),
            service: BLOOD_PRESSURE_SERVICE,
            characteristics: vec![BLOOD_PRESSURE_MEASUREMENT_CHARACTERISTIC],
        });
        let device = engine.snapshot().connected[0].clone();
        assert_eq!(device.state, ConnectionState::ServicesResolving);
        assert!(device.capabilities.contains(&MeasurementKind::BloodPressure));
        assert!(device.subscriptions.is_empty());

        engine.handle(PlatformEvent::CharacteristicsDiscovered {
            id: id("cuff"),
            service: BATTERY_SERVICE,
            characteristics: vec![BATTERY_LEVEL_CHARACTERISTIC],
        });
        assert_eq!(engine.snapshot().connected[0].state, ConnectionState::Ready);
        assert_eq!(
            platform.take(),
            vec![
                Request::SetNotify(id("cuff"), BLOOD_PRESSURE_MEASUREMENT_CHARACTERISTIC, true),
                Request::ReadValue(id("cuff"), BATTERY_LEVEL_CHARACTERISTIC),
            ]
        );

        engine.handle(PlatformEvent::NotifyStateChanged {
            id: id("cuff"),
            characteristic: BLOOD_PRESSURE_MEASUREMENT_CHARACTERISTIC,
            ok: true,
        });
        engine.handle(PlatformEvent::ValueUpdated {
            id: id("cuff"),
            characteristic: BLOOD_PRESSURE_MEASUREMENT_CHARACTERISTIC,
            value: vec![0x00, 120, 0x00, 80],
        });
        engine.handle(PlatformEvent::ValueUpdated {
            id: id("cuff"),
            characteristic: BATTERY_LEVEL_CHARACTERISTIC,
            value: vec![91],
        });

        let device = engine.snapshot().connected[0].clone();
        assert_eq!(
            device.subscriptions.get(&MeasurementKind::BloodPressure),
            Some(&BLOOD_PRESSURE_MEASUREMENT_CHARACTERISTIC)
        );
        let blood_pressure = device.measurements.blood_pressure.unwrap();
        assert_eq!((blood_pressure.systolic, blood_pressure.diastolic), (120, 80));
        assert_eq!(blood_pressure.unit, PressureUnit::MmHg);
        assert_eq!(device.measurements.battery_level, Some(91));
    }

    #[test]
    fn failed_subscription_is_not_recorded() {
        let (mut engine, _) = engine();
        ready_cuff(&mut engine, "cuff");

        engine.handle(PlatformEvent::NotifyStateChanged {
            id: id("cuff"),
            characteristic: BLOOD_PRESSURE_MEASUREMENT_CHARACTERISTIC,
            ok: false,
        });

        let snapshot = engine.snapshot();
        assert!(snapshot.connected[0].subscriptions.is_empty());
        assert_eq!(
            snapshot.diagnostics.last(),
            Some(&Diagnostic::SubscribeFailed(id("cuff"), BLOOD_PRESSURE_MEASUREMENT_CHARACTERISTIC))
        );
    }

    #[test]
    fn empty_characteristic_list_keeps_device_resolving() {
        let (mut engine, _) = engine();
        discover(&mut engine, "hr");
        engine.connect(&id("hr")).unwrap();
        engine.handle(PlatformEvent::Connected(id("hr")));
        engine.handle(PlatformEvent::ServicesDiscovered { id: id("hr"), services: vec![HEART_RATE_SERVICE] });

        engine.handle(PlatformEvent::CharacteristicsDiscovered {
            id: id("hr"),
            service: HEART_RATE_SERVICE,
            characteristics: vec![],
        });

        let device = engine.snapshot().connected[0].clone();
        assert_eq!(device.state, ConnectionState::ServicesResolving);
        assert!(device.capabilities.contains(&MeasurementKind::HeartRate));
    }

    #[test]
    fn connect_failure_keeps_device_discoverable_for_retry() {
        let (mut engine, platform) = engine();
        discover(&mut engine, "cuff");
        engine.connect(&id("cuff")).unwrap();

        engine.handle(PlatformEvent::ConnectFailed(id("cuff")));

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.discovered[0].state, ConnectionState::Failed);
        assert!(snapshot.connected.is_empty());
        assert_eq!(snapshot.diagnostics, vec![Diagnostic::ConnectFailed(id("cuff"))]);

        platform.take();
        engine.connect(&id("cuff")).unwrap();
        assert_eq!(platform.take(), vec![Request::Connect(id("cuff"))]);
    }

    #[test]
    fn connect_rejects_unknown_and_busy_devices() {
        let (mut engine, _) = engine();

        assert!(matches!(engine.connect(&id("ghost")), Err(DeviceError::UnknownDevice(_))));

        discover(&mut engine, "cuff");
        engine.connect(&id("cuff")).unwrap();
        assert!(matches!(
            engine.connect(&id("cuff")),
            Err(DeviceError::InvalidState { state: ConnectionState::Connecting, .. })
        ));
    }

    #[test]
    fn disconnect_waits_for_reconciliation_to_remove() {
        let (mut engine, _) = engine();
        ready_cuff(&mut engine, "cuff");

        engine.handle(PlatformEvent::Disconnected(id("cuff")));
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.connected.len(), 1);
        assert_eq!(snapshot.connected[0].state, ConnectionState::Disconnected);

        engine.reconcile(vec![]);
        assert!(engine.snapshot().connected.is_empty());
        assert_eq!(engine.snapshot().discovered.len(), 1);
    }

    #[test]
    fn reconnect_after_reconciliation_miss() {
        let (mut engine, platform) = engine();
        ready_cuff(&mut engine, "cuff");
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.discovered[0].state, ConnectionState::Ready);
        assert_eq!(snapshot.connected[0].state, ConnectionState::Ready);

        engine.reconcile(vec![]);

        let snapshot = engine.snapshot();
        assert!(snapshot.connected.is_empty());
        assert_eq!(snapshot.discovered[0].state, ConnectionState::Disconnected);

        platform.take();
        engine.connect(&id("cuff")).unwrap();
        assert_eq!(platform.take(), vec![Request::Connect(id("cuff"))]);
    }

    #[test]
    fn reconnect_does_not_inherit_subscriptions() {
        let (mut engine, _) = engine();
        ready_cuff(&mut engine, "cuff");
        engine.handle(PlatformEvent::NotifyStateChanged {
            id: id("cuff"),
            characteristic: BLOOD_PRESSURE_MEASUREMENT_CHARACTERISTIC,
            ok: true,
        });
        assert_eq!(engine.snapshot().connected[0].subscriptions.len(), 1);

        engine.handle(PlatformEvent::Disconnected(id("cuff")));
        assert!(engine.snapshot().connected[0].subscriptions.is_empty());

        engine.connect(&id("cuff")).unwrap();
        engine.handle(PlatformEvent::Connected(id("cuff")));
        engine.handle(PlatformEvent::ServicesDiscovered { id: id("cuff"), services: vec![BLOOD_PRESSURE_SERVICE] });
        engine.handle(PlatformEvent::CharacteristicsDiscovered {
            id: id("cuff"),
            service: BLOOD_PRESSURE_SERVICE,
            characteristics: vec![BLOOD_PRESSURE_MEASUREMENT_CHARACTERISTIC],
        });
        engine.handle(PlatformEvent::NotifyStateChanged {
            id: id("cuff"),
            characteristic: BLOOD_PRESSURE_MEASUREMENT_CHARACTERISTIC,
            ok: false,
        });

        let device = engine.snapshot().connected[0].clone();
        assert_eq!(device.state, ConnectionState::Ready);
        assert!(device.subscriptions.is_empty());
    }

    #[test]
    fn device_without_services_becomes_ready() {
        let (mut engine, platform) = engine();
        discover(&mut engine, "bare");
        engine.connect(&id("bare")).unwrap();
        engine.handle(PlatformEvent::Connected(id("bare")));
        platform.take();

        engine.handle(PlatformEvent::ServicesDiscovered { id: id("bare"), services: vec![] });

        assert!(platform.requests().is_empty());
        engine.expire_pending(Instant::now() + Duration::from_secs(3600));
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.connected[0].state, ConnectionState::Ready);
        assert_eq!(snapshot.discovered[0].state, ConnectionState::Ready);
        assert!(snapshot.diagnostics.is_empty());
    }

    #[test]
    fn reconcile_is_idempotent() {
        let (mut engine, _) = engine();
        ready_cuff(&mut engine, "cuff");
        let fresh = vec![summary("scale"), summary("cuff")];

        engine.reconcile(fresh.clone());
        let first = engine.snapshot().connected;
        engine.reconcile(fresh);
        let second = engine.snapshot().connected;

        assert_eq!(first, second);
        let ids: Vec<&str> = second.iter().map(|device| device.id.as_str()).collect();
        assert_eq!(ids, vec!["cuff", "scale"]);
    }

    #[test]
    fn reconcile_preserves_state_and_drops_missing() {
        let (mut engine, _) = engine();
        discover(&mut engine, "hr");
        engine.connect(&id("hr")).unwrap();
        engine.handle(PlatformEvent::Connected(id("hr")));
        engine.handle(PlatformEvent::ServicesDiscovered { id: id("hr"), services: vec![HEART_RATE_SERVICE] });
        engine.reconcile(vec![summary("hr"), summary("gone")]);
        assert_eq!(engine.snapshot().connected.len(), 2);

        engine.reconcile(vec![summary("hr")]);

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.connected.len(), 1);
        let capabilities: Vec<MeasurementKind> = snapshot.connected[0].capabilities.iter().copied().collect();
        assert_eq!(capabilities, vec![MeasurementKind::HeartRate]);
    }

    #[test]
    fn reconcile_adds_bare_devices() {
        let (mut engine, _) = engine();

        engine.reconcile(vec![PeripheralSummary { id: id("known-to-os"), name: None }]);

        let device = engine.snapshot().connected[0].clone();
        assert_eq!(device.name, RECONCILED_FALLBACK_NAME);
        assert_eq!(device.signal_strength, -1);
        assert!(device.capabilities.is_empty());
        assert_eq!(device.state, ConnectionState::Connected);
    }

    #[test]
    fn bare_device_can_resolve_services_on_request() {
        let (mut engine, platform) = engine();
        engine.reconcile(vec![summary("scale")]);

        engine.request_services(&id("scale")).unwrap();

        assert_eq!(engine.snapshot().connected[0].state, ConnectionState::ServicesResolving);
        assert_eq!(platform.requests(), vec![Request::DiscoverServices(id("scale"))]);
    }

    #[test]
    fn unknown_characteristic_leaves_device_unchanged() {
        let (mut engine, _) = engine();
        ready_cuff(&mut engine, "cuff");
        let before = engine.snapshot().connected[0].clone();
        let unknown = Uuid::from_u128(0xdead);

        engine.handle(PlatformEvent::ValueUpdated { id: id("cuff"), characteristic: unknown, value: vec![1, 2, 3] });

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.connected[0], before);
        assert_eq!(
            snapshot.diagnostics.last(),
            Some(&Diagnostic::Decode(id("cuff"), unknown, DecodeError::UnknownCharacteristic(unknown)))
        );
    }

    #[test]
    fn truncated_value_does_not_touch_measurements() {
        let (mut engine, _) = engine();
        ready_cuff(&mut engine, "cuff");

        engine.handle(PlatformEvent::ValueUpdated {
            id: id("cuff"),
            characteristic: BLOOD_PRESSURE_MEASUREMENT_CHARACTERISTIC,
            value: vec![0x04, 120, 0x00, 80],
        });

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.connected[0].measurements.blood_pressure, None);
        assert!(matches!(
            snapshot.diagnostics.last(),
            Some(Diagnostic::Decode(_, _, DecodeError::TooShort { required: 6, actual: 4, .. }))
        ));
    }

    #[test]
    fn pending_connect_times_out() {
        let (mut engine, _) = engine();
        discover(&mut engine, "cuff");
        engine.connect(&id("cuff")).unwrap();

        engine.expire_pending(Instant::now());
        assert_eq!(engine.snapshot().discovered[0].state, ConnectionState::Connecting);

        engine.expire_pending(Instant::now() + Config::default().connect_timeout() + Duration::from_millis(1));

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.discovered[0].state, ConnectionState::TimedOut);
        assert_eq!(snapshot.diagnostics, vec![Diagnostic::TimedOut(id("cuff"), PendingOperation::Connect)]);
        assert!(engine.connect(&id("cuff")).is_ok());
    }

    #[test]
    fn ready_device_has_no_pending_deadline() {
        let (mut engine, _) = engine();
        ready_cuff(&mut engine, "cuff");

        engine.expire_pending(Instant::now() + Duration::from_secs(3600));

        assert_eq!(engine.snapshot().connected[0].state, ConnectionState::Ready);
    }

    #[test]
    fn diagnostics_are_bounded() {
        let config = Config { diagnostics_capacity: 2, ..Config::default() };
        let mut engine = Engine::new(RecordingPlatform::default(), Router::default(), &config);

        for device in ["a", "b", "c"] {
            engine.handle(PlatformEvent::ConnectFailed(id(device)));
        }

        assert_eq!(
            engine.snapshot().diagnostics,
            vec![Diagnostic::ConnectFailed(id("b")), Diagnostic::ConnectFailed(id("c"))]
        );
    }

    #[test]
    fn observers_receive_published_snapshots() {
        let (mut engine, _) = engine();
        let mut receiver = engine.subscribe();

        discover(&mut engine, "cuff");

        assert!(receiver.has_changed().unwrap());
        let snapshot = receiver.borrow_and_update().clone();
        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.discovered[0].id, id("cuff"));
    }
}
