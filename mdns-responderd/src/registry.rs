use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use shared::types::ServiceEntry;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use crate::mdns::browser::BrowserEvent;

const REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Every instance the browser has resolved, keyed by full instance name.
#[derive(Debug, Default)]
pub struct Registry {
    entries: BTreeMap<String, ServiceEntry>,
}

impl Registry {
    /// Returns true if the registry changed.
    pub fn apply(&mut self, event: BrowserEvent) -> bool {
        match event {
            BrowserEvent::Resolved(entry) => match self.entries.get_mut(&entry.instance_name) {
                Some(existing) => {
                    let changed = existing.addresses != entry.addresses
                        || existing.port != entry.port
                        || existing.txt != entry.txt
                        || existing.hostname != entry.hostname
                        || !existing.alive;
                    existing.refresh(entry);
                    changed
                }
                None => {
                    self.entries.insert(entry.instance_name.clone(), entry);
                    true
                }
            },
            BrowserEvent::Removed(instance_name) => match self.entries.get_mut(&instance_name) {
                Some(entry) if entry.alive => {
                    entry.alive = false;
                    true
                }
                _ => false,
            },
        }
    }

    pub fn get(&self, instance_name: &str) -> Option<&ServiceEntry> {
        self.entries.get(instance_name)
    }

    pub fn alive(&self) -> impl Iterator<Item = &ServiceEntry> {
        self.entries.values().filter(|e| e.alive)
    }
}

/// Registry event loop - records browser events and reports changes
pub async fn run(mut rx: mpsc::Receiver<BrowserEvent>, cancel: CancellationToken) -> Result<()> {
    let mut registry = Registry::default();
    let mut report_interval = tokio::time::interval(REPORT_INTERVAL);

    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                let name = match &event {
                    BrowserEvent::Resolved(entry) => entry.instance_name.clone(),
                    BrowserEvent::Removed(name) => name.clone(),
                };
                if !registry.apply(event) {
                    continue;
                }
                match registry.get(&name) {
                    Some(entry) if entry.alive => {
                        tracing::info!("{}", serde_json::to_string(entry)?);
                    }
                    _ => tracing::info!("Service gone: {}", name),
                }
            }
            _ = report_interval.tick() => {
                tracing::info!("{} services alive", registry.alive().count());
            }
            _ = cancel.cancelled() => {
                tracing::info!("Registry shutting down");
                break;
            }
        }
    }

    Ok(())
}
