//! Device and pool inventory types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type DeviceId = u32;
pub type PoolId = u32;

/// A network device. Immutable for the duration of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Device {
    #[serde(default)]
    pub id: DeviceId,

    /// Unique across the inventory.
    pub name: String,

    #[serde(default)]
    pub vendor: String,

    #[serde(default)]
    pub operating_system: String,

    #[serde(default)]
    pub ip_address: String,

    /// Free-form inventory attributes.
    #[serde(default)]
    pub custom: HashMap<String, Value>,
}

impl Device {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Look up an inventory attribute by name, standard fields first.
    pub fn property(&self, key: &str) -> Option<Value> {
        match key {
            "id" => Some(Value::from(self.id)),
            "name" => Some(Value::from(self.name.clone())),
            "vendor" => Some(Value::from(self.vendor.clone())),
            "operating_system" => Some(Value::from(self.operating_system.clone())),
            "ip_address" => Some(Value::from(self.ip_address.clone())),
            _ => self.custom.get(key).cloned(),
        }
    }
}

/// A named group of devices usable as a job target.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pool {
    #[serde(default)]
    pub id: PoolId,
    pub name: String,
    #[serde(default)]
    pub devices: Vec<DeviceId>,
}
