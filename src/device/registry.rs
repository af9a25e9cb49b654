use indexmap::IndexMap;

use crate::device::types::{Device, DeviceId};

/// Ordered set of devices, unique by identifier. Insertion order is list order.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    devices: IndexMap<DeviceId, Device>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Returns the device for `id`, constructing and appending it first if absent.
    pub fn upsert<F>(&mut self, id: &DeviceId, constructor: F) -> &mut Device
    where
        F: FnOnce() -> Device,
    {
        self.devices.entry(id.clone()).or_insert_with(constructor)
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.devices.contains_key(id)
    }

    pub fn get(&self, id: &DeviceId) -> Option<&Device> {
        self.devices.get(id)
    }

    pub fn get_mut(&mut self, id: &DeviceId) -> Option<&mut Device> {
        self.devices.get_mut(id)
    }

    /// Keeps devices for which `keep` returns true, preserving their relative order.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&Device) -> bool,
    {
        self.devices.retain(|_, device| keep(device));
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn to_vec(&self) -> Vec<Device> {
        self.devices.values().cloned().collect()
    }
}
