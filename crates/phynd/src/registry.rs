use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use phyn_client::Device;

/// Devices added and removed by a rediscovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryChange {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl RegistryChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// The devices known to the current session, keyed by id.
pub struct DeviceRegistry {
    devices: ArcSwap<BTreeMap<String, Arc<Device>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: ArcSwap::new(Arc::default()),
        }
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<Device>> {
        self.devices.load().get(device_id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<Device>> {
        self.devices.load().values().cloned().collect()
    }

    pub fn ids(&self) -> BTreeSet<String> {
        self.devices.load().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.load().is_empty()
    }

    /// Install a freshly discovered device set.
    ///
    /// Devices already known keep their existing value.
    pub fn replace(&self, discovered: Vec<Device>) -> RegistryChange {
        let current = self.devices.load_full();
        let mut next = BTreeMap::new();
        let mut change = RegistryChange::default();

        for device in discovered {
            let entry = match current.get(&device.id) {
                Some(known) => known.clone(),
                None => {
                    change.added.push(device.id.clone());
                    Arc::new(device)
                }
            };
            next.insert(entry.id.clone(), entry);
        }
        change.removed = current
            .keys()
            .filter(|id| !next.contains_key(*id))
            .cloned()
            .collect();

        self.devices.store(Arc::new(next));
        change
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use phyn_client::ProductCode;

    use super::*;

    #[test]
    fn test_replace_reports_changes() {
        let registry = DeviceRegistry::new();
        let change = registry.replace(vec![
            Device::new("a", "h", ProductCode::PhynPlus2),
            Device::new("b", "h", ProductCode::WaterSensor),
        ]);
        assert_eq!(change.added, vec!["a", "b"]);
        assert!(change.removed.is_empty());

        let before = registry.get("a").unwrap();
        let change = registry.replace(vec![
            Device::new("a", "h", ProductCode::PhynPlus2).with_name("renamed"),
            Device::new("c", "h", ProductCode::Classic),
        ]);
        assert_eq!(change.added, vec!["c"]);
        assert_eq!(change.removed, vec!["b"]);

        // Known devices are not replaced mid-session.
        let after = registry.get("a").unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.name, "Phyn Plus");
        assert_eq!(registry.len(), 2);
    }
}
