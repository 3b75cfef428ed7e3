//! DNS-SD browse and resolve on top of the query engine.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::time::Instant;

use tracing::{debug, info};

use crate::error::{NameError, ResolveError};
use crate::query::{AnswerChange, QueryEngine, QueryEvent, QueryHandle, QueryMode};
use crate::wire::{parse_txt, Name, Question, RecordData, RecordType, ResourceRecord, TxtProperty};

/// Meta query enumerating every advertised service type (RFC 6763 §9).
pub const SERVICE_TYPE_ENUMERATION: &str = "_services._dns-sd._udp.local";

const LOCAL_DOMAIN: &str = "local";

/// Normalize `_ipp._tcp`, `_ipp._tcp.local` or `_ipp._tcp.local.` to the
/// fully qualified service type.
pub fn service_type_name(service_type: &str) -> Result<Name, NameError> {
    qualify(service_type)
}

/// Append `.local` unless the name already ends in it.
pub(crate) fn qualify(text: &str) -> Result<Name, NameError> {
    let name = Name::new(text)?;
    let in_local = name
        .labels()
        .last()
        .is_some_and(|l| l.eq_ignore_ascii_case(LOCAL_DOMAIN.as_bytes()));
    if in_local {
        return Ok(name);
    }
    let mut labels = name.labels().to_vec();
    labels.push(LOCAL_DOMAIN.as_bytes().to_vec());
    Name::from_labels(labels)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BrowseHandle(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResolveHandle(pub(crate) u64);

impl fmt::Display for BrowseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "browse#{}", self.0)
    }
}

impl fmt::Display for ResolveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "resolve#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    Added(Name),
    Removed(Name),
}

/// A resolved service instance. Assembled per resolve and never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    pub name: Name,
    pub host: Name,
    pub port: u16,
    pub priority: u16,
    pub weight: u16,
    pub txt: Vec<TxtProperty>,
    pub addresses: Vec<IpAddr>,
    /// Interface the SRV record arrived on.
    pub interface: u32,
}

impl ServiceInstance {
    /// The user-visible instance label, e.g. `printer`.
    pub fn instance_label(&self) -> String {
        self.name
            .first_label()
            .map(|l| String::from_utf8_lossy(l).into_owned())
            .unwrap_or_default()
    }

    pub fn service_type(&self) -> Name {
        self.name.parent()
    }

    pub fn txt_value(&self, key: &str) -> Option<&str> {
        self.txt
            .iter()
            .find(|p| p.key.eq_ignore_ascii_case(key))
            .and_then(|p| p.value_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Browse {
        handle: BrowseHandle,
        event: ServiceEvent,
    },
    Resolved {
        handle: ResolveHandle,
        result: Result<ServiceInstance, ResolveError>,
    },
}

struct Browse {
    query: QueryHandle,
    /// Instance -> interfaces currently advertising it.
    instances: Vec<(Name, Vec<u32>)>,
}

struct Resolve {
    instance: Name,
    srv: Option<(Name, u16, u16, u16, u32)>,
    txt: Option<Vec<Vec<u8>>>,
    addresses: Vec<IpAddr>,
    queries: Vec<QueryHandle>,
    addresses_requested: bool,
}

impl Resolve {
    fn complete(&self) -> Option<ServiceInstance> {
        let (host, port, priority, weight, interface) = self.srv.clone()?;
        let txt = self.txt.as_ref()?;
        if self.addresses.is_empty() {
            return None;
        }
        Some(ServiceInstance {
            name: self.instance.clone(),
            host,
            port,
            priority,
            weight,
            txt: parse_txt(txt),
            addresses: self.addresses.clone(),
            interface,
        })
    }
}

#[derive(Default)]
pub struct Discovery {
    next_handle: u64,
    browses: BTreeMap<BrowseHandle, Browse>,
    resolves: BTreeMap<ResolveHandle, Resolve>,
    ipv4: bool,
    ipv6: bool,
}

impl Discovery {
    /// `ipv4`/`ipv6` select which address records a resolve asks for.
    pub fn new(ipv4: bool, ipv6: bool) -> Self {
        Self {
            ipv4,
            ipv6,
            ..Self::default()
        }
    }

    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    /// Start a continuous PTR query for `service_type`.
    pub fn browse(
        &mut self,
        queries: &mut QueryEngine,
        service_type: Name,
        now: Instant,
    ) -> BrowseHandle {
        let handle = BrowseHandle(self.handle());
        info!("Browsing {} ({})", service_type, handle);
        let query = queries.start_query(
            Question::new(service_type, RecordType::Ptr),
            QueryMode::Continuous,
            now,
        );
        self.browses.insert(
            handle,
            Browse {
                query,
                instances: Vec::new(),
            },
        );
        handle
    }

    pub fn stop_browse(&mut self, queries: &mut QueryEngine, handle: BrowseHandle) -> bool {
        match self.browses.remove(&handle) {
            Some(browse) => {
                queries.stop(browse.query);
                true
            }
            None => false,
        }
    }

    /// Instances a browse currently sees.
    pub fn browse_instances(&self, handle: BrowseHandle) -> Vec<Name> {
        self.browses
            .get(&handle)
            .map(|b| b.instances.iter().map(|(name, _)| name.clone()).collect())
            .unwrap_or_default()
    }

    /// Start one-shot SRV and TXT queries for `instance`; address queries
    /// follow once the target host is known.
    pub fn resolve(&mut self, queries: &mut QueryEngine, instance: Name, now: Instant) -> ResolveHandle {
        let handle = ResolveHandle(self.handle());
        debug!("Resolving {} ({})", instance, handle);
        let srv = queries.start_query(
            Question::new(instance.clone(), RecordType::Srv),
            QueryMode::OneShot,
            now,
        );
        let txt = queries.start_query(
            Question::new(instance.clone(), RecordType::Txt),
            QueryMode::OneShot,
            now,
        );
        self.resolves.insert(
            handle,
            Resolve {
                instance,
                srv: None,
                txt: None,
                addresses: Vec::new(),
                queries: vec![srv, txt],
                addresses_requested: false,
            },
        );
        handle
    }

    pub fn cancel_resolve(&mut self, queries: &mut QueryEngine, handle: ResolveHandle) -> bool {
        match self.resolves.remove(&handle) {
            Some(resolve) => {
                for query in resolve.queries {
                    queries.stop(query);
                }
                true
            }
            None => false,
        }
    }

    /// Translate query-engine events into browse events and resolve timeouts.
    pub fn handle_query_events(&mut self, queries: &mut QueryEngine, events: &[QueryEvent]) -> Vec<DiscoveryEvent> {
        let mut out = Vec::new();
        for event in events {
            match event {
                QueryEvent::Answer {
                    handle: query,
                    record,
                    interface,
                    change,
                } => {
                    let RecordData::Ptr(instance) = &record.data else {
                        continue;
                    };
                    for (handle, browse) in self.browses.iter_mut() {
                        if browse.query != *query {
                            continue;
                        }
                        if let Some(event) = browse.update(instance, *interface, *change) {
                            out.push(DiscoveryEvent::Browse {
                                handle: *handle,
                                event,
                            });
                        }
                    }
                }
                QueryEvent::Finished { handle: query, .. } => {
                    let mut timed_out = Vec::new();
                    for (handle, resolve) in self.resolves.iter_mut() {
                        resolve.queries.retain(|q| q != query);
                        if resolve.queries.is_empty() {
                            timed_out.push(*handle);
                        }
                    }
                    for handle in timed_out {
                        self.finish(queries, handle, Err(ResolveError::Timeout), &mut out);
                    }
                }
            }
        }
        out
    }

    /// Absorb every record of a received response into pending resolves,
    /// including records no query asked for (additional sections).
    pub fn observe(
        &mut self,
        queries: &mut QueryEngine,
        records: &[ResourceRecord],
        interface: u32,
        now: Instant,
    ) -> Vec<DiscoveryEvent> {
        let mut out = Vec::new();
        let mut done = Vec::new();
        for (handle, resolve) in self.resolves.iter_mut() {
            for record in records.iter().filter(|r| r.name == resolve.instance) {
                match &record.data {
                    RecordData::Srv { .. } if record.is_goodbye() => {
                        done.push((*handle, Err(ResolveError::NotFound)));
                    }
                    RecordData::Srv {
                        priority,
                        weight,
                        port,
                        target,
                    } => {
                        resolve.srv = Some((target.clone(), *port, *priority, *weight, interface));
                    }
                    RecordData::Txt(strings) if !record.is_goodbye() => {
                        resolve.txt = Some(strings.clone());
                    }
                    _ => {}
                }
            }

            if let Some((host, _, _, _, srv_interface)) = &resolve.srv {
                if *srv_interface == interface {
                    for record in records.iter().filter(|r| r.name == *host && !r.is_goodbye()) {
                        let ip = match record.data {
                            RecordData::A(ip) => IpAddr::V4(ip),
                            RecordData::Aaaa(ip) => IpAddr::V6(ip),
                            _ => continue,
                        };
                        if !resolve.addresses.contains(&ip) {
                            resolve.addresses.push(ip);
                        }
                    }
                }

                if resolve.addresses.is_empty() && !resolve.addresses_requested {
                    resolve.addresses_requested = true;
                    if self.ipv4 {
                        resolve.queries.push(queries.start_query(
                            Question::new(host.clone(), RecordType::A),
                            QueryMode::OneShot,
                            now,
                        ));
                    }
                    if self.ipv6 {
                        resolve.queries.push(queries.start_query(
                            Question::new(host.clone(), RecordType::Aaaa),
                            QueryMode::OneShot,
                            now,
                        ));
                    }
                }
            }

            if let Some(instance) = resolve.complete() {
                done.push((*handle, Ok(instance)));
            }
        }

        for (handle, result) in done {
            self.finish(queries, handle, result, &mut out);
        }
        out
    }

    fn finish(
        &mut self,
        queries: &mut QueryEngine,
        handle: ResolveHandle,
        result: Result<ServiceInstance, ResolveError>,
        out: &mut Vec<DiscoveryEvent>,
    ) {
        let Some(resolve) = self.resolves.remove(&handle) else {
            return;
        };
        for query in resolve.queries {
            queries.stop(query);
        }
        match &result {
            Ok(instance) => info!(
                "Resolved {} -> {}:{} {:?}",
                instance.name, instance.host, instance.port, instance.addresses
            ),
            Err(e) => debug!("Resolve of {} failed: {}", resolve.instance, e),
        }
        out.push(DiscoveryEvent::Resolved { handle, result });
    }
}

impl Browse {
    fn update(&mut self, instance: &Name, interface: u32, change: AnswerChange) -> Option<ServiceEvent> {
        let position = self.instances.iter().position(|(name, _)| name == instance);
        match (change, position) {
            (AnswerChange::Added | AnswerChange::Refreshed, Some(at)) => {
                let interfaces = &mut self.instances[at].1;
                if !interfaces.contains(&interface) {
                    interfaces.push(interface);
                }
                None
            }
            (AnswerChange::Added | AnswerChange::Refreshed, None) => {
                self.instances.push((instance.clone(), vec![interface]));
                Some(ServiceEvent::Added(instance.clone()))
            }
            (AnswerChange::Removed, Some(at)) => {
                let interfaces = &mut self.instances[at].1;
                interfaces.retain(|i| *i != interface);
                if interfaces.is_empty() {
                    let (name, _) = self.instances.remove(at);
                    Some(ServiceEvent::Removed(name))
                } else {
                    None
                }
            }
            (AnswerChange::Removed, None) => None,
        }
    }
}
