use std::collections::BTreeMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use mdns_core::ServiceInstance;
use serde::{Deserialize, Serialize};

/// A resolved service instance as the binaries report it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub service_type: String,
    pub instance_name: String,
    pub hostname: String,
    pub addresses: Vec<IpAddr>,
    pub port: u16,
    /// Boolean attributes map to an empty string.
    pub txt: BTreeMap<String, String>,
    pub interface: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub alive: bool,
}

impl ServiceEntry {
    pub fn from_instance(instance: &ServiceInstance, now: DateTime<Utc>) -> Self {
        let txt = instance
            .txt
            .iter()
            .map(|p| {
                let value = p
                    .value
                    .as_deref()
                    .map(|v| String::from_utf8_lossy(v).into_owned())
                    .unwrap_or_default();
                (p.key.clone(), value)
            })
            .collect();

        Self {
            service_type: instance.service_type().to_string(),
            instance_name: instance.name.to_string(),
            hostname: instance.host.to_string(),
            addresses: instance.addresses.clone(),
            port: instance.port,
            txt,
            interface: instance.interface,
            first_seen: now,
            last_seen: now,
            alive: true,
        }
    }

    /// Fold a fresh resolution of the same instance into this entry.
    pub fn refresh(&mut self, newer: ServiceEntry) {
        let first_seen = self.first_seen;
        *self = newer;
        self.first_seen = first_seen;
    }
}
