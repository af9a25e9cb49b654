//! [`Platform`] implementation on top of btleplug.
//!
//! Every request spawns a task that performs the btleplug call and reports the outcome
//! as a [`PlatformEvent`] on the session's event channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use btleplug::api::{Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::channel::mpsc::Sender;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::spawn;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::device::constants::UNKNOWN_SIGNAL_STRENGTH;
use crate::device::platform::{PeripheralSummary, Platform, PlatformEvent};
use crate::device::types::{AdapterState, DeviceId};
use crate::error::DeviceError;

type PeripheralMap = Arc<Mutex<HashMap<DeviceId, Peripheral>>>;

fn device_id(id: &PeripheralId) -> DeviceId {
    DeviceId::new(format!("{:?}", id))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // the guarded maps stay consistent even if a holder panicked
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn emit(mut events: Sender<PlatformEvent>, event: PlatformEvent) {
    if let Err(err) = events.send(event).await {
        debug!("Dropping platform event, session is gone: {}", err);
    }
}

fn adapter_state_for(err: &btleplug::Error) -> Option<AdapterState> {
    match err {
        btleplug::Error::PermissionDenied => Some(AdapterState::Unauthorized),
        btleplug::Error::NotSupported(_) => Some(AdapterState::Unsupported),
        _ => None,
    }
}

fn offers_any(services: &[Uuid], filter: &[Uuid]) -> bool {
    filter.is_empty() || services.iter().any(|service| filter.contains(service))
}

fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Option<Characteristic> {
    peripheral.characteristics().into_iter().find(|characteristic| characteristic.uuid == uuid)
}

/// At most one notification stream task per device.
#[derive(Clone)]
struct NotificationStreams {
    parent: CancellationToken,
    tokens: Arc<Mutex<HashMap<DeviceId, CancellationToken>>>,
}

impl NotificationStreams {
    fn new(parent: CancellationToken) -> Self {
        NotificationStreams { parent, tokens: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Token for a new stream of `id`. A previous stream of the same device is stopped.
    fn replace(&self, id: &DeviceId) -> CancellationToken {
        let token = self.parent.child_token();
        if let Some(previous) = lock(&self.tokens).insert(id.clone(), token.clone()) {
            previous.cancel();
        }
        token
    }

    fn is_running(&self, id: &DeviceId) -> bool {
        lock(&self.tokens).get(id).map(|token| !token.is_cancelled()).unwrap_or(false)
    }

    fn stop(&self, id: &DeviceId) {
        if let Some(token) = lock(&self.tokens).remove(id) {
            token.cancel();
        }
    }
}

pub struct BtlePlatform {
    adapter: Adapter,
    peripherals: PeripheralMap,
    // Some while scanning
    scan_filter: Arc<Mutex<Option<Vec<Uuid>>>>,
    streams: NotificationStreams,
    events: Sender<PlatformEvent>,
    cancel: CancellationToken,
}

impl BtlePlatform {
    /// Takes the first adapter and starts listening for its central events.
    pub async fn new(cancel: CancellationToken, events: Sender<PlatformEvent>) -> Result<Self, DeviceError> {
        let manager = Manager::new().await?;
        let adapters = match manager.adapters().await {
            Ok(adapters) => adapters,
            Err(err) => {
                if let Some(state) = adapter_state_for(&err) {
                    emit(events.clone(), PlatformEvent::AdapterStateChanged(state)).await;
                }
                return Err(err.into());
            },
        };

        let adapter = match adapters.into_iter().next() {
            Some(adapter) => adapter,
            None => {
                emit(events.clone(), PlatformEvent::AdapterStateChanged(AdapterState::Unsupported)).await;
                return Err(DeviceError::NoAdapter);
            },
        };
        info!("Using adapter {}", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));

        let platform = BtlePlatform {
            adapter,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            scan_filter: Arc::new(Mutex::new(None)),
            streams: NotificationStreams::new(cancel.clone()),
            events,
            cancel,
        };
        platform.listen_central_events().await?;
        emit(platform.events.clone(), PlatformEvent::AdapterStateChanged(AdapterState::PoweredOn)).await;

        Ok(platform)
    }

    async fn listen_central_events(&self) -> Result<(), DeviceError> {
        let mut central_events = self.adapter.events().await?;
        let adapter = self.adapter.clone();
        let peripherals = self.peripherals.clone();
        let scan_filter = self.scan_filter.clone();
        let streams = self.streams.clone();
        let events = self.events.clone();
        let cancel = self.cancel.clone();

        spawn(async move {
            'mainloop: loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        break 'mainloop;
                    },
                    Some(event) = central_events.next() => match event {
                        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                            let filter = lock(&scan_filter).clone();
                            if let Some(filter) = filter {
                                sighting(&adapter, &peripherals, &filter, &id, events.clone()).await;
                            }
                        },
                        CentralEvent::DeviceDisconnected(id) => {
                            let id = device_id(&id);
                            streams.stop(&id);
                            if lock(&peripherals).contains_key(&id) {
                                emit(events.clone(), PlatformEvent::Disconnected(id)).await;
                            }
                        },
                        _ => {},
                    },
                    else => break 'mainloop,
                }
            }
            debug!("Central event listener stopped");
        });

        Ok(())
    }

    fn peripheral(&self, id: &DeviceId) -> Option<Peripheral> {
        lock(&self.peripherals).get(id).cloned()
    }
}

async fn sighting(adapter: &Adapter, peripherals: &PeripheralMap, filter: &[Uuid], id: &PeripheralId, events: Sender<PlatformEvent>) {
    let peripheral = match adapter.peripheral(id).await {
        Ok(peripheral) => peripheral,
        Err(err) => {
            warn!("Could not look up peripheral {:?}: {}", id, err);
            return;
        },
    };

    match peripheral.properties().await {
        Err(err) => warn!("Could not query peripheral for properties: {:?}", err),
        Ok(None) => debug!("Peripheral {:?} has no properties", id),
        Ok(Some(properties)) => {
            // Some environments ignore the scan filter, so check the services again
            if !offers_any(&properties.services, filter) {
                return;
            }

            let id = device_id(id);
            lock(peripherals).insert(id.clone(), peripheral);
            emit(events, PlatformEvent::DeviceDiscovered {
                id,
                name: properties.local_name,
                signal_strength: properties.rssi.unwrap_or(UNKNOWN_SIGNAL_STRENGTH),
            }).await;
        },
    }
}

async fn forward_notifications(cancel: CancellationToken, id: DeviceId, peripheral: Peripheral, events: Sender<PlatformEvent>) {
    let mut notifications = match peripheral.notifications().await {
        Ok(stream) => stream,
        Err(err) => {
            warn!("Could not open notification stream for {}: {}", id, err);
            return;
        },
    };

    'mainloop: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            notification = notifications.next() => match notification {
                Some(notification) => {
                    emit(events.clone(), PlatformEvent::ValueUpdated {
                        id: id.clone(),
                        characteristic: notification.uuid,
                        value: notification.value,
                    }).await;
                },
                None => break 'mainloop,
            },
        }
    }
    debug!("Notification stream for {} ended", id);
}

impl Platform for BtlePlatform {
    fn start_scan(&mut self, services: &[Uuid]) {
        *lock(&self.scan_filter) = Some(services.to_vec());
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let filter = ScanFilter { services: services.to_vec() };

        spawn(async move {
            if let Err(err) = adapter.start_scan(filter).await {
                warn!("Scanning failed {:?}", err);
                if let Some(state) = adapter_state_for(&err) {
                    emit(events, PlatformEvent::AdapterStateChanged(state)).await;
                }
            }
        });
    }

    fn stop_scan(&mut self) {
        *lock(&self.scan_filter) = None;
        let adapter = self.adapter.clone();

        spawn(async move {
            if let Err(err) = adapter.stop_scan().await {
                warn!("Stopping scan failed {:?}", err);
            }
        });
    }

    fn connect(&mut self, id: &DeviceId) {
        let id = id.clone();
        let peripheral = self.peripheral(&id);
        let events = self.events.clone();
        let streams = self.streams.clone();

        spawn(async move {
            let peripheral = match peripheral {
                Some(peripheral) => peripheral,
                None => {
                    warn!("No peripheral known for {}", id);
                    return emit(events, PlatformEvent::ConnectFailed(id)).await;
                },
            };

            info!("Connecting to peripheral {}...", id);
            if let Err(err) = peripheral.connect().await {
                warn!("Connecting to peripheral failed: {:?}", err);
                return emit(events, PlatformEvent::ConnectFailed(id)).await;
            }

            let stream = streams.replace(&id);
            spawn(forward_notifications(stream, id.clone(), peripheral, events.clone()));
            emit(events, PlatformEvent::Connected(id)).await;
        });
    }

    fn query_connected(&mut self, services: &[Uuid]) {
        let adapter = self.adapter.clone();
        let peripherals = self.peripherals.clone();
        let events = self.events.clone();
        let streams = self.streams.clone();
        let filter = services.to_vec();

        spawn(async move {
            let candidates = match adapter.peripherals().await {
                Ok(candidates) => candidates,
                Err(err) => {
                    // an unanswered query leaves the connected list untouched
                    warn!("Failed to query BLE adapter for peripherals: {}", err);
                    return;
                },
            };

            let mut connected = Vec::new();
            for peripheral in candidates {
                if !peripheral.is_connected().await.unwrap_or(false) {
                    continue;
                }

                let properties = peripheral.properties().await.ok().flatten();
                let mut offered: Vec<Uuid> = peripheral.services().iter().map(|service| service.uuid).collect();
                if let Some(properties) = &properties {
                    offered.extend(properties.services.iter().copied());
                }
                if !offers_any(&offered, &filter) {
                    continue;
                }

                let id = device_id(&peripheral.id());
                lock(&peripherals).insert(id.clone(), peripheral.clone());
                if !streams.is_running(&id) {
                    // devices recovered here never went through connect(), so attach their value stream now
                    let stream = streams.replace(&id);
                    spawn(forward_notifications(stream, id.clone(), peripheral, events.clone()));
                }

                connected.push(PeripheralSummary {
                    id,
                    name: properties.and_then(|properties| properties.local_name),
                });
            }

            emit(events, PlatformEvent::ConnectedQueried(connected)).await;
        });
    }

    fn discover_services(&mut self, id: &DeviceId) {
        let id = id.clone();
        let peripheral = self.peripheral(&id);
        let events = self.events.clone();

        spawn(async move {
            let Some(peripheral) = peripheral else {
                return warn!("No peripheral known for {}", id);
            };

            info!("Discovering services of {}...", id);
            if let Err(err) = peripheral.discover_services().await {
                return warn!("Service discovery for {} failed: {:?}", id, err);
            }

            let services = peripheral.services().iter().map(|service| service.uuid).collect();
            emit(events, PlatformEvent::ServicesDiscovered { id, services }).await;
        });
    }

    fn discover_characteristics(&mut self, id: &DeviceId, service: Uuid) {
        let id = id.clone();
        let peripheral = self.peripheral(&id);
        let events = self.events.clone();

        // btleplug resolves characteristics together with services
        spawn(async move {
            let Some(peripheral) = peripheral else {
                return warn!("No peripheral known for {}", id);
            };

            let characteristics = peripheral.services()
                .into_iter()
                .find(|candidate| candidate.uuid == service)
                .map(|found| found.characteristics.iter().map(|characteristic| characteristic.uuid).collect())
                .unwrap_or_default();

            emit(events, PlatformEvent::CharacteristicsDiscovered { id, service, characteristics }).await;
        });
    }

    fn set_notify(&mut self, id: &DeviceId, characteristic: Uuid, enabled: bool) {
        let id = id.clone();
        let peripheral = self.peripheral(&id);
        let events = self.events.clone();

        spawn(async move {
            let found = peripheral.as_ref().and_then(|peripheral| {
                find_characteristic(peripheral, characteristic).map(|found| (peripheral, found))
            });

            let ok = match found {
                None => {
                    warn!("Characteristic {} of {} is not available", characteristic, id);
                    false
                },
                Some((peripheral, found)) => {
                    let result = if enabled {
                        peripheral.subscribe(&found).await
                    } else {
                        peripheral.unsubscribe(&found).await
                    };
                    if let Err(err) = &result {
                        warn!("Changing notification state of {} failed: {:?}", characteristic, err);
                    }
                    result.is_ok()
                },
            };

            emit(events, PlatformEvent::NotifyStateChanged { id, characteristic, ok }).await;
        });
    }

    fn read_value(&mut self, id: &DeviceId, characteristic: Uuid) {
        let id = id.clone();
        let peripheral = self.peripheral(&id);
        let events = self.events.clone();

        spawn(async move {
            let Some(peripheral) = peripheral else {
                return warn!("No peripheral known for {}", id);
            };
            let Some(found) = find_characteristic(&peripheral, characteristic) else {
                return warn!("Characteristic {} of {} is not available", characteristic, id);
            };

            match peripheral.read(&found).await {
                Ok(value) => emit(events, PlatformEvent::ValueUpdated { id, characteristic, value }).await,
                Err(err) => warn!("Reading {} from {} failed: {:?}", characteristic, id, err),
            }
        });
    }
}
