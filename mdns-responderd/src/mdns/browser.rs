use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use chrono::Utc;
use futures::StreamExt;
use mdns_core::{BrowseHandle, Event, Name, ResolveHandle, ServiceEvent};
use shared::protocol::META_SERVICE_TYPE;
use shared::types::ServiceEntry;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::engine_thread::EngineHandle;

#[derive(Debug, Clone, PartialEq)]
pub enum BrowserEvent {
    Resolved(ServiceEntry),
    Removed(String),
}

/// Browse handles the browser has opened and what it is waiting on.
#[derive(Default)]
struct BrowseState {
    meta: Option<BrowseHandle>,
    browsed_types: HashSet<Name>,
    browses: HashSet<BrowseHandle>,
    resolving: HashMap<ResolveHandle, Name>,
}

/// Browse `service_types`, or every type on the link when the list is empty,
/// and resolve each instance that appears.
pub async fn run_browser(
    engine: EngineHandle,
    events: flume::Receiver<Event>,
    service_types: Vec<String>,
    tx: mpsc::Sender<BrowserEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    tracing::info!("Starting mDNS browser");

    let mut state = BrowseState::default();
    let mut events = events.into_stream();

    if service_types.is_empty() {
        let handle = engine
            .browse_service_types()
            .await
            .with_context(|| format!("Failed to browse {}", META_SERVICE_TYPE))?;
        state.meta = Some(handle);
    }
    for service_type in service_types {
        let handle = engine
            .browse(service_type.clone())
            .await
            .with_context(|| format!("Failed to browse {}", service_type))?;
        state.browses.insert(handle);
    }

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else {
                    tracing::warn!("Engine event stream closed");
                    break;
                };
                if let Err(e) = handle_event(&engine, &mut state, &tx, event).await {
                    tracing::error!("{:#}", e);
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("mDNS browser shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn handle_event(
    engine: &EngineHandle,
    state: &mut BrowseState,
    tx: &mpsc::Sender<BrowserEvent>,
    event: Event,
) -> Result<()> {
    match event {
        Event::Browse {
            handle,
            event: ServiceEvent::Added(service_type),
        } if state.meta == Some(handle) => {
            if state.browsed_types.insert(service_type.clone()) {
                tracing::info!("Discovered new service type: {}", service_type);
                let browse = engine
                    .browse(service_type.to_string())
                    .await
                    .with_context(|| format!("Failed to browse {}", service_type))?;
                state.browses.insert(browse);
            }
        }
        Event::Browse {
            handle,
            event: ServiceEvent::Added(instance),
        } if state.browses.contains(&handle) => {
            tracing::debug!("Service added: {}", instance);
            let resolve = engine
                .resolve(instance.to_string())
                .await
                .with_context(|| format!("Failed to resolve {}", instance))?;
            state.resolving.insert(resolve, instance);
        }
        Event::Browse {
            handle,
            event: ServiceEvent::Removed(instance),
        } if state.browses.contains(&handle) => {
            tracing::debug!("Service removed: {}", instance);
            let pending = state
                .resolving
                .iter()
                .find(|(_, n)| **n == instance)
                .map(|(h, _)| *h);
            if let Some(pending) = pending {
                state.resolving.remove(&pending);
                engine.cancel_resolve(pending).await?;
            }
            tx.send(BrowserEvent::Removed(instance.to_string()))
                .await
                .context("Failed to send removed event")?;
        }
        Event::Resolved { handle, result } => {
            let Some(instance) = state.resolving.remove(&handle) else {
                return Ok(());
            };
            match result {
                Ok(resolved) => {
                    let entry = ServiceEntry::from_instance(&resolved, Utc::now());
                    tracing::debug!("Resolved service: {}", entry.instance_name);
                    tx.send(BrowserEvent::Resolved(entry))
                        .await
                        .context("Failed to send resolved event")?;
                }
                Err(e) => tracing::debug!("Could not resolve {}: {}", instance, e),
            }
        }
        _ => {}
    }
    Ok(())
}
