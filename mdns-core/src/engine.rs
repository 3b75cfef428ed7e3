//! The caller-facing engine: one instance owns its transport, query engine,
//! responder and discovery state, and is driven by `tick`/`poll`.

use std::collections::{HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use tracing::{debug, info, trace, warn};

use crate::config::EngineConfig;
use crate::discovery::{
    qualify, BrowseHandle, Discovery, DiscoveryEvent, ResolveHandle, ServiceEvent,
    ServiceInstance, SERVICE_TYPE_ENUMERATION,
};
use crate::error::{Error, ResolveError, Result, TransportError};
use crate::query::{AnswerChange, QueryEngine, QueryEvent, QueryHandle, QueryMode};
use crate::responder::{
    LocalRecord, RegistrationHandle, RegistrationState, Responder, ResponderEvent,
};
use crate::transport::{list_interfaces, Destination, Interface, Outgoing, Transport};
use crate::wire::{
    Message, Name, Question, RecordData, RecordType, ResourceRecord, TxtProperty, MDNS_PORT,
};

/// A service to advertise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    /// Instance label, e.g. `printer`.
    pub instance: String,
    /// e.g. `_ipp._tcp`; `.local` is implied.
    pub service_type: String,
    pub port: u16,
    pub txt: Vec<TxtProperty>,
    /// Target host; defaults to the engine's hostname.
    pub host: Option<String>,
    /// Explicit addresses; defaults to each interface's own addresses.
    pub addresses: Vec<IpAddr>,
}

impl ServiceSpec {
    pub fn new(instance: impl Into<String>, service_type: impl Into<String>, port: u16) -> Self {
        Self {
            instance: instance.into(),
            service_type: service_type.into(),
            port,
            txt: Vec::new(),
            host: None,
            addresses: Vec::new(),
        }
    }

    pub fn with_txt(mut self, key: impl Into<String>, value: impl AsRef<[u8]>) -> Self {
        self.txt.push(TxtProperty {
            key: key.into(),
            value: Some(value.as_ref().to_vec()),
        });
        self
    }

    /// A boolean attribute, present without a value.
    pub fn with_flag(mut self, key: impl Into<String>) -> Self {
        self.txt.push(TxtProperty {
            key: key.into(),
            value: None,
        });
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.addresses.push(address);
        self
    }

    fn txt_strings(&self) -> Vec<Vec<u8>> {
        crate::wire::txt_strings(
            self.txt
                .iter()
                .map(|p| (p.key.as_str(), p.value.as_deref())),
        )
    }
}

/// Everything the engine reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Registered(RegistrationHandle),
    Conflict {
        handle: RegistrationHandle,
        name: Name,
    },
    Browse {
        handle: BrowseHandle,
        event: ServiceEvent,
    },
    Resolved {
        handle: ResolveHandle,
        result: std::result::Result<ServiceInstance, ResolveError>,
    },
    /// An answer to a raw query.
    Answer {
        handle: QueryHandle,
        record: ResourceRecord,
        interface: u32,
        change: AnswerChange,
    },
    QueryFinished {
        handle: QueryHandle,
        answered: bool,
    },
}

pub struct Engine {
    config: EngineConfig,
    hostname: Name,
    interfaces: Vec<Interface>,
    transport: Option<Transport>,
    queries: QueryEngine,
    responder: Responder,
    discovery: Discovery,
    raw_queries: HashSet<QueryHandle>,
    outbox: Vec<Outgoing>,
    events: VecDeque<Event>,
    clock: Instant,
}

impl Engine {
    /// An engine without sockets. Datagrams go in through `handle_datagram`
    /// and come out of `tick`.
    pub fn new(config: EngineConfig, interfaces: Vec<Interface>, hostname: &str) -> Result<Self> {
        let hostname = qualify(hostname)?;
        let unicast_response = config.transport.port != MDNS_PORT;
        Ok(Self {
            queries: QueryEngine::new(config.query.clone(), unicast_response),
            responder: Responder::new(config.probe.clone(), config.ttl.clone()),
            discovery: Discovery::new(config.transport.ipv4, config.transport.ipv6),
            config,
            hostname,
            interfaces,
            transport: None,
            raw_queries: HashSet::new(),
            outbox: Vec::new(),
            events: VecDeque::new(),
            clock: Instant::now(),
        })
    }

    /// Enumerate interfaces and bind sockets on them.
    pub fn bind(config: EngineConfig, hostname: &str) -> Result<Self> {
        let interfaces = list_interfaces(&config.transport.interfaces)?;
        if interfaces.is_empty() {
            return Err(TransportError::NoInterfaces.into());
        }
        let transport = Transport::bind(&interfaces, &config.transport)?;
        let mut engine = Self::new(config, interfaces, hostname)?;
        engine.transport = Some(transport);
        info!("mDNS engine bound as {}", engine.hostname);
        Ok(engine)
    }

    pub fn hostname(&self) -> &Name {
        &self.hostname
    }

    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    fn interface_ids(&self) -> Vec<u32> {
        self.interfaces.iter().map(|i| i.index).collect()
    }

    fn advance(&mut self, now: Instant) -> Instant {
        self.clock = self.clock.max(now);
        self.clock
    }

    /// Probe for and then announce a service.
    pub fn register_service(&mut self, spec: ServiceSpec) -> Result<RegistrationHandle> {
        let service_type = qualify(&spec.service_type)?;
        let instance = service_type.prepend(&spec.instance)?;
        let host = match &spec.host {
            Some(host) => qualify(host)?,
            None => self.hostname.clone(),
        };
        let ttl = &self.config.ttl;

        let mut records = vec![
            LocalRecord::shared(ResourceRecord::new(
                service_type.clone(),
                ttl.service_secs,
                RecordData::Ptr(instance.clone()),
            )),
            LocalRecord::shared(ResourceRecord::new(
                Name::new(SERVICE_TYPE_ENUMERATION)?,
                ttl.service_secs,
                RecordData::Ptr(service_type),
            )),
            LocalRecord::unique(ResourceRecord::new(
                instance.clone(),
                ttl.host_secs,
                RecordData::Srv {
                    priority: 0,
                    weight: 0,
                    port: spec.port,
                    target: host.clone(),
                },
            )),
            LocalRecord::unique(ResourceRecord::new(
                instance.clone(),
                ttl.service_secs,
                RecordData::Txt(spec.txt_strings()),
            )),
        ];

        if spec.addresses.is_empty() {
            for interface in &self.interfaces {
                for ip in interface.addrs.iter().map(|a| a.ip) {
                    if let Some(record) = self.address_record(&host, ip) {
                        records.push(LocalRecord::unique(record).scoped(interface.index));
                    }
                }
            }
        } else {
            for ip in &spec.addresses {
                if let Some(record) = self.address_record(&host, *ip) {
                    records.push(LocalRecord::unique(record));
                }
            }
        }

        let handle = self.responder.register(records, self.clock);
        info!("Registering {} on port {} ({})", instance, spec.port, handle);
        Ok(handle)
    }

    fn address_record(&self, host: &Name, ip: IpAddr) -> Option<ResourceRecord> {
        let data = match ip {
            IpAddr::V4(ip) if self.config.transport.ipv4 => RecordData::A(ip),
            IpAddr::V6(ip) if self.config.transport.ipv6 => RecordData::Aaaa(ip),
            _ => return None,
        };
        if ip.is_loopback() || ip.is_unspecified() {
            return None;
        }
        Some(ResourceRecord::new(host.clone(), self.config.ttl.host_secs, data))
    }

    /// Withdraw a service. Goodbyes go out with the next tick.
    pub fn unregister(&mut self, handle: RegistrationHandle) -> Result<()> {
        match self.responder.state(handle) {
            None => return Err(Error::UnknownHandle),
            Some(RegistrationState::Withdrawn) => return Ok(()),
            Some(_) => {}
        }
        let goodbyes = self.responder.unregister(handle, &self.interface_ids());
        for (interface, message) in goodbyes {
            self.queue(interface, Destination::Multicast, &message);
        }
        Ok(())
    }

    pub fn registration_state(&self, handle: RegistrationHandle) -> Option<RegistrationState> {
        self.responder.state(handle)
    }

    pub fn browse(&mut self, service_type: &str) -> Result<BrowseHandle> {
        let name = qualify(service_type)?;
        Ok(self.discovery.browse(&mut self.queries, name, self.clock))
    }

    /// Browse the meta type; events name service types instead of instances.
    pub fn browse_service_types(&mut self) -> Result<BrowseHandle> {
        self.browse(SERVICE_TYPE_ENUMERATION)
    }

    pub fn stop_browse(&mut self, handle: BrowseHandle) -> bool {
        self.discovery.stop_browse(&mut self.queries, handle)
    }

    pub fn browse_instances(&self, handle: BrowseHandle) -> Vec<Name> {
        self.discovery.browse_instances(handle)
    }

    /// Resolve a full instance name such as `printer._ipp._tcp.local`.
    pub fn resolve(&mut self, instance: &str) -> Result<ResolveHandle> {
        let name = Name::new(instance)?;
        Ok(self.discovery.resolve(&mut self.queries, name, self.clock))
    }

    pub fn cancel_resolve(&mut self, handle: ResolveHandle) -> bool {
        self.discovery.cancel_resolve(&mut self.queries, handle)
    }

    /// Ask an arbitrary question; answers surface as `Event::Answer`.
    pub fn query(&mut self, name: &str, rtype: RecordType, mode: QueryMode) -> Result<QueryHandle> {
        let name = Name::new(name)?;
        let handle = self
            .queries
            .start_query(Question::new(name, rtype), mode, self.clock);
        self.raw_queries.insert(handle);
        Ok(handle)
    }

    pub fn stop_query(&mut self, handle: QueryHandle) -> bool {
        self.raw_queries.remove(&handle);
        self.queries.stop(handle)
    }

    /// Process one received datagram. Malformed input is logged and dropped.
    pub fn handle_datagram(&mut self, bytes: &[u8], source: SocketAddr, interface: u32, now: Instant) {
        let now = self.advance(now);
        let message = match Message::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                debug!("Dropping datagram from {}: {}", source, e);
                return;
            }
        };
        if message.header.opcode() != 0 || message.header.rcode() != 0 {
            debug!(
                "Dropping message from {} with opcode {} rcode {}",
                source,
                message.header.opcode(),
                message.header.rcode()
            );
            return;
        }
        trace!(
            "{} from {} on {}: {} questions, {} records",
            if message.header.is_response() { "Response" } else { "Query" },
            source,
            interface,
            message.questions.len(),
            message.records().count()
        );

        if message.header.is_response() {
            if source.port() != MDNS_PORT {
                debug!("Ignoring response from non-mDNS port {}", source);
                return;
            }
            let events = self.queries.feed(&message, interface, now);
            self.dispatch_query_events(events);
            let records: Vec<ResourceRecord> = message.records().cloned().collect();
            let found = self
                .discovery
                .observe(&mut self.queries, &records, interface, now);
            self.dispatch_discovery_events(found);
        }

        let (replies, events) = self.responder.handle_message(&message, source, interface);
        self.dispatch_responder_events(events);
        for reply in replies {
            self.queue(interface, reply.destination, &reply.message);
        }
    }

    /// Advance timers and collect every datagram due now.
    pub fn tick(&mut self, now: Instant) -> Vec<Outgoing> {
        let now = self.advance(now);
        let interfaces = self.interface_ids();

        let tick = self.queries.tick(now, &interfaces);
        self.dispatch_query_events(tick.events);
        for (interface, message) in tick.outgoing {
            self.queue(interface, Destination::Multicast, &message);
        }

        let tick = self.responder.tick(now, &interfaces);
        self.dispatch_responder_events(tick.events);
        for (interface, message) in tick.outgoing {
            self.queue(interface, Destination::Multicast, &message);
        }

        std::mem::take(&mut self.outbox)
    }

    /// Read every pending datagram, then tick and send. Requires `bind`.
    pub fn poll(&mut self, now: Instant) -> Result<()> {
        let datagrams = match self.transport.as_mut() {
            Some(transport) => transport.drain(),
            None => return Err(TransportError::NoInterfaces.into()),
        };
        for datagram in datagrams {
            self.handle_datagram(&datagram.payload, datagram.source, datagram.interface, now);
        }
        let outgoing = self.tick(now);
        if let Some(transport) = &self.transport {
            for datagram in &outgoing {
                if let Err(e) = transport.send(datagram) {
                    warn!("{}", e);
                }
            }
        }
        Ok(())
    }

    pub fn next_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Earliest instant at which `tick` has work to do.
    pub fn next_timeout(&self) -> Option<Instant> {
        if !self.outbox.is_empty() {
            return Some(self.clock);
        }
        match (self.queries.next_deadline(), self.responder.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn dispatch_query_events(&mut self, events: Vec<QueryEvent>) {
        let found = self
            .discovery
            .handle_query_events(&mut self.queries, &events);
        for event in events {
            match event {
                QueryEvent::Answer {
                    handle,
                    record,
                    interface,
                    change,
                } if self.raw_queries.contains(&handle) => {
                    self.events.push_back(Event::Answer {
                        handle,
                        record,
                        interface,
                        change,
                    });
                }
                QueryEvent::Finished { handle, answered } if self.raw_queries.remove(&handle) => {
                    self.events
                        .push_back(Event::QueryFinished { handle, answered });
                }
                _ => {}
            }
        }
        self.dispatch_discovery_events(found);
    }

    fn dispatch_discovery_events(&mut self, events: Vec<DiscoveryEvent>) {
        for event in events {
            self.events.push_back(match event {
                DiscoveryEvent::Browse { handle, event } => Event::Browse { handle, event },
                DiscoveryEvent::Resolved { handle, result } => Event::Resolved { handle, result },
            });
        }
    }

    fn dispatch_responder_events(&mut self, events: Vec<ResponderEvent>) {
        for event in events {
            self.events.push_back(match event {
                ResponderEvent::Registered(handle) => Event::Registered(handle),
                ResponderEvent::Conflict { handle, name } => Event::Conflict { handle, name },
            });
        }
    }

    /// Encode and queue a message. A query too large for one datagram is
    /// retried without its known answers.
    fn queue(&mut self, interface: u32, destination: Destination, message: &Message) {
        let capacity = self.config.transport.max_packet_size;
        let payload = match message.encode(capacity) {
            Ok(payload) => payload,
            Err(e) if !message.header.is_response() && !message.answers.is_empty() => {
                debug!("{}; sending query without known answers", e);
                let mut trimmed = message.clone();
                trimmed.answers.clear();
                match trimmed.encode(capacity) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Dropping outgoing query: {}", e);
                        return;
                    }
                }
            }
            Err(e) => {
                warn!("Dropping outgoing message: {}", e);
                return;
            }
        };
        self.outbox.push(Outgoing {
            interface,
            destination,
            payload,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::transport::InterfaceAddr;

    fn engine(address: &str, hostname: &str) -> Engine {
        let interface = Interface::new(
            "eth0",
            1,
            vec![InterfaceAddr {
                ip: address.parse().unwrap(),
                netmask: Some("255.255.255.0".parse().unwrap()),
            }],
        );
        Engine::new(EngineConfig::default(), vec![interface], hostname).unwrap()
    }

    #[test]
    fn test_hostname_is_qualified() {
        assert_eq!(engine("10.0.0.1", "alpha").hostname().to_string(), "alpha.local.");
        assert_eq!(engine("10.0.0.1", "alpha.local").hostname().to_string(), "alpha.local.");
    }

    #[test]
    fn test_malformed_datagram_is_absorbed() {
        let mut engine = engine("10.0.0.1", "alpha");
        let now = Instant::now();
        engine.handle_datagram(&[0, 1, 2], "10.0.0.2:5353".parse().unwrap(), 1, now);
        assert!(engine.next_event().is_none());
        assert!(engine.tick(now).is_empty());
    }

    #[test]
    fn test_unknown_handle() {
        let mut engine = engine("10.0.0.1", "alpha");
        assert!(matches!(
            engine.unregister(RegistrationHandle(42)),
            Err(Error::UnknownHandle)
        ));
    }

    #[test]
    fn test_bad_service_type() {
        let mut engine = engine("10.0.0.1", "alpha");
        assert!(matches!(
            engine.register_service(ServiceSpec::new("x", "_a.._tcp", 1)),
            Err(Error::Name(_))
        ));
    }

    #[test]
    fn test_register_queues_probe() {
        let mut engine = engine("10.0.0.1", "alpha");
        let handle = engine
            .register_service(ServiceSpec::new("printer", "_ipp._tcp", 631).with_txt("path", "/"))
            .unwrap();
        let out = engine.tick(Instant::now());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].destination, Destination::Multicast);
        let probe = Message::decode(&out[0].payload).unwrap();
        assert!(!probe.header.is_response());
        assert!(probe
            .authorities
            .iter()
            .any(|r| r.data == RecordData::A("10.0.0.1".parse().unwrap())));
        assert_eq!(engine.registration_state(handle), Some(RegistrationState::Probing));
        assert!(engine.next_timeout().is_some());
    }

    #[test]
    fn test_raw_query_finishes_unanswered() {
        let mut engine = engine("10.0.0.1", "alpha");
        let handle = engine
            .query("nobody.local", RecordType::A, QueryMode::OneShot)
            .unwrap();
        let start = Instant::now();
        let mut sent = 0;
        for secs in 0..30 {
            sent += engine.tick(start + Duration::from_secs(secs)).len();
        }
        assert_eq!(sent, 4);
        assert_eq!(
            engine.next_event(),
            Some(Event::QueryFinished {
                handle,
                answered: false
            })
        );
    }

    #[test]
    fn test_response_from_other_port_ignored() {
        let mut engine = engine("10.0.0.1", "alpha");
        let handle = engine
            .query("beta.local", RecordType::A, QueryMode::Continuous)
            .unwrap();
        let mut response = Message::response();
        response.answers.push(ResourceRecord::new(
            Name::new("beta.local").unwrap(),
            120,
            RecordData::A("10.0.0.2".parse().unwrap()),
        ));
        let bytes = response.encode(512).unwrap();
        let now = Instant::now();
        engine.handle_datagram(&bytes, "10.0.0.2:4000".parse().unwrap(), 1, now);
        assert!(engine.next_event().is_none());
        engine.handle_datagram(&bytes, "10.0.0.2:5353".parse().unwrap(), 1, now);
        assert!(matches!(
            engine.next_event(),
            Some(Event::Answer { handle: h, change: AnswerChange::Added, .. }) if h == handle
        ));
    }

    #[test]
    fn test_poll_without_transport() {
        let mut engine = engine("10.0.0.1", "alpha");
        assert!(matches!(
            engine.poll(Instant::now()),
            Err(Error::Transport(TransportError::NoInterfaces))
        ));
    }
}
