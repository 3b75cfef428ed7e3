use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use mdns_core::{BrowseHandle, Engine, Event, RegistrationHandle, ResolveHandle, ServiceSpec};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};

/// Longest sleep between polls. Sockets are non-blocking, so this bounds
/// receive latency.
const MAX_WAIT: Duration = Duration::from_millis(20);

type Reply<T> = oneshot::Sender<mdns_core::Result<T>>;

/// Commands sent to the engine thread
pub enum EngineCommand {
    Register(ServiceSpec, Reply<RegistrationHandle>),
    Unregister(RegistrationHandle, Reply<()>),
    Browse(String, Reply<BrowseHandle>),
    BrowseServiceTypes(Reply<BrowseHandle>),
    Resolve(String, Reply<ResolveHandle>),
    CancelResolve(ResolveHandle),
    Subscribe(flume::Sender<Event>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the thread that owns the engine
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    /// Move a bound `engine` onto its own thread and start polling it.
    pub fn spawn(engine: Engine) -> Self {
        Self::spawn_with(engine, poll)
    }

    /// Like `spawn`, with `drive` doing the receive/tick/send step.
    fn spawn_with(mut engine: Engine, drive: fn(&mut Engine, Instant)) -> Self {
        let (tx, mut rx) = mpsc::channel::<EngineCommand>(256);

        thread::spawn(move || {
            let mut subscribers: Vec<flume::Sender<Event>> = Vec::new();
            loop {
                let mut shutdown = None;
                loop {
                    match rx.try_recv() {
                        Ok(EngineCommand::Shutdown(reply)) => {
                            shutdown = Some(reply);
                            break;
                        }
                        Ok(cmd) => execute(&mut engine, &mut subscribers, cmd),
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => return,
                    }
                }

                drive(&mut engine, Instant::now());
                while let Some(event) = engine.next_event() {
                    subscribers.retain(|s| s.send(event.clone()).is_ok());
                }

                if let Some(reply) = shutdown {
                    tracing::info!("Engine thread shutting down");
                    let _ = reply.send(());
                    return;
                }

                let wait = engine
                    .next_timeout()
                    .map(|at| at.saturating_duration_since(Instant::now()))
                    .unwrap_or(MAX_WAIT)
                    .min(MAX_WAIT);
                thread::sleep(wait);
            }
        });

        Self { tx }
    }

    /// Receive every event the engine reports from now on.
    pub async fn subscribe(&self) -> Result<flume::Receiver<Event>> {
        let (events_tx, events_rx) = flume::unbounded();
        self.tx.send(EngineCommand::Subscribe(events_tx)).await?;
        Ok(events_rx)
    }

    pub async fn register(&self, spec: ServiceSpec) -> Result<RegistrationHandle> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(EngineCommand::Register(spec, reply)).await?;
        Ok(rx.await??)
    }

    pub async fn unregister(&self, handle: RegistrationHandle) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(EngineCommand::Unregister(handle, reply)).await?;
        Ok(rx.await??)
    }

    pub async fn browse(&self, service_type: String) -> Result<BrowseHandle> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(EngineCommand::Browse(service_type, reply)).await?;
        Ok(rx.await??)
    }

    pub async fn browse_service_types(&self) -> Result<BrowseHandle> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(EngineCommand::BrowseServiceTypes(reply)).await?;
        Ok(rx.await??)
    }

    pub async fn resolve(&self, instance: String) -> Result<ResolveHandle> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(EngineCommand::Resolve(instance, reply)).await?;
        Ok(rx.await??)
    }

    pub async fn cancel_resolve(&self, handle: ResolveHandle) -> Result<()> {
        self.tx.send(EngineCommand::CancelResolve(handle)).await?;
        Ok(())
    }

    /// Stop the engine thread after it has flushed pending goodbyes.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(EngineCommand::Shutdown(reply)).await?;
        rx.await?;
        Ok(())
    }
}

fn execute(engine: &mut Engine, subscribers: &mut Vec<flume::Sender<Event>>, cmd: EngineCommand) {
    match cmd {
        EngineCommand::Register(spec, reply) => {
            let _ = reply.send(engine.register_service(spec));
        }
        EngineCommand::Unregister(handle, reply) => {
            let _ = reply.send(engine.unregister(handle));
        }
        EngineCommand::Browse(service_type, reply) => {
            let _ = reply.send(engine.browse(&service_type));
        }
        EngineCommand::BrowseServiceTypes(reply) => {
            let _ = reply.send(engine.browse_service_types());
        }
        EngineCommand::Resolve(instance, reply) => {
            let _ = reply.send(engine.resolve(&instance));
        }
        EngineCommand::CancelResolve(handle) => {
            engine.cancel_resolve(handle);
        }
        EngineCommand::Subscribe(events) => subscribers.push(events),
        EngineCommand::Shutdown(_) => {}
    }
}

fn poll(engine: &mut Engine, now: Instant) {
    if let Err(e) = engine.poll(now) {
        tracing::warn!("Engine poll failed: {}", e);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use mdns_core::wire::MDNS_PORT;
    use mdns_core::{Destination, EngineConfig, Interface, InterfaceAddr, Name, ServiceEvent};
    use std::net::SocketAddr;

    fn detached_engine() -> Engine {
        let interface = Interface::new(
            "eth0",
            1,
            vec![InterfaceAddr {
                ip: "192.168.1.10".parse().unwrap(),
                netmask: Some("255.255.255.0".parse().unwrap()),
            }],
        );
        Engine::new(EngineConfig::default(), vec![interface], "alpha").unwrap()
    }

    /// Feed the engine's own multicast back to it, as a looped-back socket would.
    fn loop_back(engine: &mut Engine, now: Instant) {
        for outgoing in engine.tick(now) {
            if outgoing.destination != Destination::Multicast {
                continue;
            }
            let Some(ip) = engine
                .interfaces()
                .iter()
                .find(|i| i.index == outgoing.interface)
                .and_then(|i| i.addrs.first())
                .map(|a| a.ip)
            else {
                continue;
            };
            let source = SocketAddr::new(ip, MDNS_PORT);
            engine.handle_datagram(&outgoing.payload, source, outgoing.interface, now);
        }
    }

    /// An engine thread without sockets that hears only itself.
    pub(crate) fn spawn_detached() -> EngineHandle {
        EngineHandle::spawn_with(detached_engine(), loop_back)
    }

    async fn next_matching(
        events: &flume::Receiver<Event>,
        pred: impl Fn(&Event) -> bool,
    ) -> Event {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let event = events.recv_async().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event within timeout")
    }

    #[tokio::test]
    async fn test_register_and_browse_self() {
        let handle = spawn_detached();
        let events = handle.subscribe().await.unwrap();

        let registration = handle
            .register(ServiceSpec::new("printer", "_ipp._tcp", 631))
            .await
            .unwrap();
        let browse = handle.browse("_ipp._tcp".to_string()).await.unwrap();

        let registered =
            next_matching(&events, |e| matches!(e, Event::Registered(_))).await;
        assert_eq!(registered, Event::Registered(registration));

        let added = next_matching(&events, |e| matches!(e, Event::Browse { .. })).await;
        assert_eq!(
            added,
            Event::Browse {
                handle: browse,
                event: ServiceEvent::Added(Name::new("printer._ipp._tcp.local").unwrap()),
            }
        );

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unregister_twice() {
        let handle = spawn_detached();
        let registration = handle
            .register(ServiceSpec::new("printer", "_ipp._tcp", 631))
            .await
            .unwrap();
        handle.unregister(registration).await.unwrap();
        handle.unregister(registration).await.unwrap();
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_commands_fail_after_shutdown() {
        let handle = spawn_detached();
        handle.shutdown().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.browse("_ipp._tcp".to_string()).await.is_err());
    }
}
