//! Authoritative side: probing, announcing, answering questions from the
//! local record set, and detecting name conflicts.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::{ProbeConfig, TtlConfig};
use crate::transport::Destination;
use crate::wire::{
    Message, Name, Question, RecordData, RecordType, ResourceRecord, CLASS_ANY, CLASS_IN,
    MDNS_PORT,
};

/// How many dropped registrations still answer `state`.
const RETIRED_HISTORY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationHandle(pub(crate) u64);

impl fmt::Display for RegistrationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "registration#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Probing,
    /// Probing succeeded; unsolicited announcements are going out.
    Announcing,
    Announced,
    Conflicting,
    Withdrawn,
}

impl RegistrationState {
    fn is_published(self) -> bool {
        matches!(self, RegistrationState::Announcing | RegistrationState::Announced)
    }

}

/// A record this process is authoritative for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalRecord {
    pub record: ResourceRecord,
    /// Unique records are probed and carry the cache-flush bit.
    pub unique: bool,
    /// Restrict the record to one interface (address records).
    pub interface: Option<u32>,
}

impl LocalRecord {
    pub fn shared(record: ResourceRecord) -> Self {
        Self {
            record,
            unique: false,
            interface: None,
        }
    }

    pub fn unique(record: ResourceRecord) -> Self {
        Self {
            record,
            unique: true,
            interface: None,
        }
    }

    pub fn scoped(mut self, interface: u32) -> Self {
        self.interface = Some(interface);
        self
    }

    fn visible_on(&self, interface: u32) -> bool {
        self.interface.map_or(true, |i| i == interface)
    }

    fn wire(&self) -> ResourceRecord {
        self.record.clone().with_cache_flush(self.unique)
    }
}

/// Published records keyed by (name, type).
#[derive(Debug, Default)]
pub struct LocalRecordSet {
    records: HashMap<(Name, RecordType), Vec<(RegistrationHandle, LocalRecord)>>,
}

impl LocalRecordSet {
    fn insert(&mut self, handle: RegistrationHandle, records: &[LocalRecord]) {
        for local in records {
            let key = (local.record.name.clone(), local.record.rtype());
            self.records
                .entry(key)
                .or_default()
                .push((handle, local.clone()));
        }
    }

    fn remove(&mut self, handle: RegistrationHandle) {
        for entries in self.records.values_mut() {
            entries.retain(|(owner, _)| *owner != handle);
        }
        self.records.retain(|_, entries| !entries.is_empty());
    }

    /// Whether a registration other than `except` still publishes `record`.
    fn owned_elsewhere(&self, record: &LocalRecord, except: RegistrationHandle) -> bool {
        self.records
            .get(&(record.record.name.clone(), record.record.rtype()))
            .is_some_and(|entries| {
                entries.iter().any(|(owner, other)| {
                    *owner != except
                        && other.interface == record.interface
                        && other.record.same_identity(&record.record)
                })
            })
    }

    /// Records matching the question that are visible on `interface`, one
    /// copy per identity.
    pub fn answer(&self, question: &Question, interface: u32) -> Vec<LocalRecord> {
        if question.qclass != CLASS_IN && question.qclass != CLASS_ANY {
            return Vec::new();
        }
        let mut found: Vec<LocalRecord> = Vec::new();
        let mut add = |entries: &Vec<(RegistrationHandle, LocalRecord)>| {
            for (_, local) in entries {
                if local.visible_on(interface)
                    && question.matches(&local.record)
                    && !found.iter().any(|f| f.record.same_identity(&local.record))
                {
                    found.push(local.clone());
                }
            }
        };
        if question.qtype == RecordType::Any {
            for ((name, _), entries) in &self.records {
                if *name == question.name {
                    add(entries);
                }
            }
        } else if let Some(entries) = self.records.get(&(question.name.clone(), question.qtype)) {
            add(entries);
        }
        found
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug)]
struct Registration {
    records: Vec<LocalRecord>,
    state: RegistrationState,
    next_action: Option<Instant>,
    sent: u32,
}

impl Registration {
    /// Names that must be unique on the link.
    fn unique_names(&self) -> Vec<Name> {
        let mut names: Vec<Name> = Vec::new();
        for local in self.records.iter().filter(|r| r.unique) {
            if !names.contains(&local.record.name) {
                names.push(local.record.name.clone());
            }
        }
        names
    }

    /// Our records for `name` as comparable (class, type, rdata) tuples.
    fn tiebreak_data(&self, name: &Name) -> Vec<(u16, u16, Vec<u8>)> {
        let mut data: Vec<_> = self
            .records
            .iter()
            .filter(|r| r.unique && r.record.name == *name)
            .map(|r| tiebreak_entry(&r.record))
            .collect();
        data.sort();
        data.dedup();
        data
    }
}

fn tiebreak_entry(record: &ResourceRecord) -> (u16, u16, Vec<u8>) {
    (record.rclass, record.rtype().to_u16(), record.data.to_bytes())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponderEvent {
    /// Probing finished uncontested.
    Registered(RegistrationHandle),
    Conflict {
        handle: RegistrationHandle,
        name: Name,
    },
}

/// A response to one received query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub destination: Destination,
    pub message: Message,
}

#[derive(Debug, Default)]
pub struct ResponderTick {
    pub outgoing: Vec<(u32, Message)>,
    pub events: Vec<ResponderEvent>,
}

pub struct Responder {
    probe: ProbeConfig,
    ttl: TtlConfig,
    next_handle: u64,
    registrations: BTreeMap<RegistrationHandle, Registration>,
    /// Final states of recently dropped registrations, oldest first.
    retired: VecDeque<(RegistrationHandle, RegistrationState)>,
    published: LocalRecordSet,
}

impl Responder {
    pub fn new(probe: ProbeConfig, ttl: TtlConfig) -> Self {
        Self {
            probe,
            ttl,
            next_handle: 1,
            registrations: BTreeMap::new(),
            retired: VecDeque::new(),
            published: LocalRecordSet::default(),
        }
    }

    /// Start probing for `records`. A set without unique records skips
    /// straight to announcing.
    pub fn register(&mut self, records: Vec<LocalRecord>, now: Instant) -> RegistrationHandle {
        let handle = RegistrationHandle(self.next_handle);
        self.next_handle += 1;
        let state = if records.iter().any(|r| r.unique) {
            RegistrationState::Probing
        } else {
            RegistrationState::Announcing
        };
        if state == RegistrationState::Announcing {
            self.published.insert(handle, &records);
        }
        debug!("{} created with {} records ({:?})", handle, records.len(), state);
        self.registrations.insert(
            handle,
            Registration {
                records,
                state,
                next_action: Some(now),
                sent: 0,
            },
        );
        handle
    }

    pub fn state(&self, handle: RegistrationHandle) -> Option<RegistrationState> {
        self.registrations.get(&handle).map(|r| r.state).or_else(|| {
            self.retired
                .iter()
                .rev()
                .find(|(h, _)| *h == handle)
                .map(|(_, state)| *state)
        })
    }

    fn retire(&mut self, handle: RegistrationHandle, state: RegistrationState) {
        self.registrations.remove(&handle);
        self.published.remove(handle);
        if self.retired.len() == RETIRED_HISTORY {
            self.retired.pop_front();
        }
        self.retired.push_back((handle, state));
    }

    /// Withdraw a registration. Its records leave the record set now; the
    /// returned goodbyes (one per interface) cover every record that was
    /// published and is not still published by another registration.
    pub fn unregister(&mut self, handle: RegistrationHandle, interfaces: &[u32]) -> Vec<(u32, Message)> {
        let Some(registration) = self.registrations.get(&handle) else {
            if let Some(entry) = self.retired.iter_mut().find(|(h, _)| *h == handle) {
                entry.1 = RegistrationState::Withdrawn;
            }
            return Vec::new();
        };
        let was_published = registration.state.is_published();
        let records = registration.records.clone();
        self.retire(handle, RegistrationState::Withdrawn);
        info!("{} withdrawn", handle);

        if !was_published {
            return Vec::new();
        }
        let goodbyes: Vec<LocalRecord> = records
            .into_iter()
            .filter(|r| !self.published.owned_elsewhere(r, handle))
            .map(|mut r| {
                r.record.ttl = 0;
                r.unique = false;
                r
            })
            .collect();
        per_interface(&goodbyes, interfaces)
    }

    /// Published records answering `question` on `interface`.
    pub fn answer(&self, question: &Question, interface: u32) -> Vec<ResourceRecord> {
        self.published
            .answer(question, interface)
            .iter()
            .map(LocalRecord::wire)
            .collect()
    }

    pub fn records(&self) -> &LocalRecordSet {
        &self.published
    }

    /// Process a received message: check it for conflicts and build replies
    /// to the questions it asks.
    pub fn handle_message(
        &mut self,
        message: &Message,
        source: SocketAddr,
        interface: u32,
    ) -> (Vec<Reply>, Vec<ResponderEvent>) {
        let events = if message.header.is_response() {
            self.check_conflicts(message.records())
        } else {
            self.check_probe_tiebreak(message)
        };
        if message.header.is_response() || message.questions.is_empty() {
            return (Vec::new(), events);
        }

        let legacy = source.port() != MDNS_PORT;
        let mut multicast = Vec::new();
        let mut unicast = Vec::new();
        for question in &message.questions {
            for local in self.published.answer(question, interface) {
                if known_to_querier(&local.record, message) {
                    continue;
                }
                let target = if legacy || question.unicast_response {
                    &mut unicast
                } else {
                    &mut multicast
                };
                if !target.iter().any(|r: &LocalRecord| r.record.same_identity(&local.record)) {
                    target.push(local);
                }
            }
        }

        let mut replies = Vec::new();
        if !unicast.is_empty() {
            let mut reply = self.response(&unicast, interface);
            if legacy {
                self.make_legacy(&mut reply, message);
            }
            replies.push(Reply {
                destination: Destination::Unicast(source),
                message: reply,
            });
        }
        if !multicast.is_empty() {
            replies.push(Reply {
                destination: Destination::Multicast,
                message: self.response(&multicast, interface),
            });
        }
        (replies, events)
    }

    /// Response with `answers` plus the additional records DNS-SD clients
    /// need to avoid a second round trip.
    fn response(&self, answers: &[LocalRecord], interface: u32) -> Message {
        let mut message = Message::response();
        message.answers = answers.iter().map(LocalRecord::wire).collect();

        let mut additional: Vec<LocalRecord> = Vec::new();
        let add = |question: Question, additional: &mut Vec<LocalRecord>| {
            for local in self.published.answer(&question, interface) {
                let present = answers
                    .iter()
                    .chain(additional.iter())
                    .any(|r| r.record.same_identity(&local.record));
                if !present {
                    additional.push(local);
                }
            }
        };
        for local in answers {
            if let RecordData::Ptr(instance) = &local.record.data {
                add(Question::new(instance.clone(), RecordType::Srv), &mut additional);
                add(Question::new(instance.clone(), RecordType::Txt), &mut additional);
            }
        }
        let targets: Vec<Name> = answers
            .iter()
            .chain(additional.iter())
            .filter_map(|r| match &r.record.data {
                RecordData::Srv { target, .. } => Some(target.clone()),
                _ => None,
            })
            .collect();
        for target in targets {
            add(Question::new(target.clone(), RecordType::A), &mut additional);
            add(Question::new(target, RecordType::Aaaa), &mut additional);
        }

        message.additionals = additional.iter().map(LocalRecord::wire).collect();
        message
    }

    /// Legacy unicast (RFC 6762 §6.7): echo id and questions, short TTLs, no
    /// cache-flush bits.
    fn make_legacy(&self, reply: &mut Message, query: &Message) {
        reply.header.id = query.header.id;
        reply.questions = query
            .questions
            .iter()
            .map(|q| Question {
                unicast_response: false,
                ..q.clone()
            })
            .collect();
        let cap = self.ttl.legacy_unicast_secs;
        for record in reply.answers.iter_mut().chain(reply.additionals.iter_mut()) {
            record.ttl = record.ttl.min(cap);
            record.cache_flush = false;
        }
    }

    fn check_conflicts<'a>(
        &mut self,
        records: impl Iterator<Item = &'a ResourceRecord>,
    ) -> Vec<ResponderEvent> {
        let records: Vec<&ResourceRecord> = records.filter(|r| !r.is_goodbye()).collect();
        let mut losers = Vec::new();
        for (handle, registration) in &self.registrations {
            for name in registration.unique_names() {
                let ours: Vec<&LocalRecord> = registration
                    .records
                    .iter()
                    .filter(|r| r.unique && r.record.name == name)
                    .collect();
                let conflicting = records.iter().any(|theirs| {
                    theirs.name == name
                        && ours.iter().any(|o| o.record.rtype() == theirs.rtype())
                        && !ours.iter().any(|o| o.record.same_identity(theirs))
                });
                if conflicting {
                    losers.push((*handle, name));
                    break;
                }
            }
        }
        self.fail(losers)
    }

    /// Simultaneous probes (RFC 6762 §8.2): the lexicographically later set
    /// of authority records wins.
    fn check_probe_tiebreak(&mut self, message: &Message) -> Vec<ResponderEvent> {
        if message.authorities.is_empty() {
            return Vec::new();
        }
        let mut losers = Vec::new();
        for (handle, registration) in &self.registrations {
            if registration.state != RegistrationState::Probing {
                continue;
            }
            for name in registration.unique_names() {
                if !message.questions.iter().any(|q| q.name == name) {
                    continue;
                }
                let claimed: Vec<&ResourceRecord> =
                    message.authorities.iter().filter(|r| r.name == name).collect();
                // Our own probe, looped back on one of our interfaces
                let own = claimed.iter().all(|theirs| {
                    registration
                        .records
                        .iter()
                        .any(|o| o.record.same_identity(theirs))
                });
                if own {
                    continue;
                }
                let mut theirs: Vec<_> = claimed.into_iter().map(tiebreak_entry).collect();
                theirs.sort();
                theirs.dedup();
                if theirs > registration.tiebreak_data(&name) {
                    losers.push((*handle, name));
                    break;
                }
            }
        }
        self.fail(losers)
    }

    fn fail(&mut self, losers: Vec<(RegistrationHandle, Name)>) -> Vec<ResponderEvent> {
        let mut events = Vec::new();
        for (handle, name) in losers {
            if self.registrations.contains_key(&handle) {
                warn!("{} conflicts on {}", handle, name);
                self.retire(handle, RegistrationState::Conflicting);
                events.push(ResponderEvent::Conflict { handle, name });
            }
        }
        events
    }

    /// Send due probes and announcements.
    pub fn tick(&mut self, now: Instant, interfaces: &[u32]) -> ResponderTick {
        let mut tick = ResponderTick::default();
        for (handle, registration) in self.registrations.iter_mut() {
            if !registration.next_action.is_some_and(|at| at <= now) {
                continue;
            }

            if registration.state == RegistrationState::Probing {
                if registration.sent < self.probe.probe_count {
                    let probe = probe_message(registration, registration.sent == 0);
                    for interface in interfaces {
                        let mut message = probe.clone();
                        message
                            .authorities
                            .retain(|r| scoped_to(&registration.records, r, *interface));
                        tick.outgoing.push((*interface, message));
                    }
                    registration.sent += 1;
                    registration.next_action = Some(now + self.probe.probe_interval());
                    continue;
                }
                info!("{} probed uncontested", handle);
                registration.state = RegistrationState::Announcing;
                registration.sent = 0;
                self.published.insert(*handle, &registration.records);
                tick.events.push(ResponderEvent::Registered(*handle));
            }

            if registration.state == RegistrationState::Announcing {
                tick.outgoing
                    .extend(per_interface(&registration.records, interfaces));
                registration.sent += 1;
                if registration.sent >= self.probe.announce_count {
                    registration.state = RegistrationState::Announced;
                    registration.next_action = None;
                } else {
                    registration.next_action = Some(now + self.probe.announce_interval());
                }
            }
        }
        tick
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.registrations
            .values()
            .filter_map(|r| r.next_action)
            .min()
    }
}

fn scoped_to(records: &[LocalRecord], record: &ResourceRecord, interface: u32) -> bool {
    records
        .iter()
        .find(|r| r.record.same_identity(record))
        .map_or(true, |r| r.visible_on(interface))
}

fn probe_message(registration: &Registration, first: bool) -> Message {
    let mut message = Message::query();
    for name in registration.unique_names() {
        let mut question = Question::new(name, RecordType::Any);
        question.unicast_response = first;
        message.questions.push(question);
    }
    message.authorities = registration
        .records
        .iter()
        .filter(|r| r.unique)
        .map(|r| r.record.clone())
        .collect();
    message
}

/// One response per interface holding the records visible there.
fn per_interface(records: &[LocalRecord], interfaces: &[u32]) -> Vec<(u32, Message)> {
    interfaces
        .iter()
        .filter_map(|interface| {
            let mut message = Message::response();
            message.answers = records
                .iter()
                .filter(|r| r.visible_on(*interface))
                .map(LocalRecord::wire)
                .collect();
            (!message.answers.is_empty()).then_some((*interface, message))
        })
        .collect()
}

/// The querier already holds this record with at least half its TTL.
fn known_to_querier(record: &ResourceRecord, query: &Message) -> bool {
    query
        .answers
        .iter()
        .any(|known| known.same_identity(record) && known.ttl >= record.ttl / 2)
}
