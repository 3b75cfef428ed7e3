use anyhow::{Context, Result};
use mdns_core::{Event, RegistrationHandle};
use tokio_util::sync::CancellationToken;

use crate::config::ServiceConfig;
use crate::engine_thread::EngineHandle;

/// A service handed to the engine.
#[derive(Debug, Clone)]
pub struct Advertised {
    pub handle: RegistrationHandle,
    pub name: String,
}

pub async fn register_services(
    engine: &EngineHandle,
    services: &[ServiceConfig],
) -> Result<Vec<Advertised>> {
    let mut advertised = Vec::with_capacity(services.len());
    for service in services {
        let name = service.full_name();
        let handle = engine
            .register(service.to_spec())
            .await
            .with_context(|| format!("Failed to register {}", name))?;
        tracing::info!("Probing for {} on port {}", name, service.port);
        advertised.push(Advertised { handle, name });
    }
    Ok(advertised)
}

pub async fn unregister_services(engine: &EngineHandle, advertised: &[Advertised]) -> Result<()> {
    for service in advertised {
        engine
            .unregister(service.handle)
            .await
            .with_context(|| format!("Failed to unregister {}", service.name))?;
        tracing::info!("Unregistered {}", service.name);
    }
    Ok(())
}

/// Report how each registration turns out.
pub async fn run_advertiser(
    events: flume::Receiver<Event>,
    advertised: Vec<Advertised>,
    cancel: CancellationToken,
) -> Result<()> {
    let name_of = |handle: RegistrationHandle| {
        advertised
            .iter()
            .find(|a| a.handle == handle)
            .map(|a| a.name.as_str())
    };

    loop {
        tokio::select! {
            event = events.recv_async() => {
                match event {
                    Ok(Event::Registered(handle)) => {
                        if let Some(name) = name_of(handle) {
                            tracing::info!("Announced {}", name);
                        }
                    }
                    Ok(Event::Conflict { handle, name }) => {
                        if let Some(service) = name_of(handle) {
                            tracing::error!("{} withdrawn: {} is already in use on the link", service, name);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("Engine event stream closed: {}", e);
                        break;
                    }
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Advertiser shutting down");
                break;
            }
        }
    }

    Ok(())
}
