//! Outstanding questions, their answer caches, and the retry schedule.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, trace};

use crate::config::QueryConfig;
use crate::wire::{Message, Name, Question, RecordData, ResourceRecord};

/// Cached records older than this are flushed by a cache-flush answer.
const CACHE_FLUSH_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryHandle(pub(crate) u64);

impl fmt::Display for QueryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "query#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    /// Retry with backoff until answered or out of retries.
    OneShot,
    /// Keep asking and refreshing until stopped.
    Continuous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerChange {
    Added,
    Refreshed,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryEvent {
    Answer {
        handle: QueryHandle,
        record: ResourceRecord,
        interface: u32,
        change: AnswerChange,
    },
    /// A one-shot query is done; `answered` is false when retries ran out.
    Finished { handle: QueryHandle, answered: bool },
}

/// Output of one `tick`.
#[derive(Debug, Default)]
pub struct Tick {
    /// Queries to multicast, per interface.
    pub outgoing: Vec<(u32, Message)>,
    pub events: Vec<QueryEvent>,
}

#[derive(Debug, Clone)]
struct CachedAnswer {
    record: ResourceRecord,
    interface: u32,
    received: Instant,
    /// Index into the refresh schedule of the next refresh point.
    refresh_step: usize,
    /// Set when a cache-flush answer superseded this record.
    flush_at: Option<Instant>,
}

impl CachedAnswer {
    fn lifetime(&self) -> Duration {
        Duration::from_secs(u64::from(self.record.ttl))
    }

    fn expires(&self) -> Instant {
        let natural = self.received + self.lifetime();
        match self.flush_at {
            Some(flush) => flush.min(natural),
            None => natural,
        }
    }

    fn remaining(&self, now: Instant) -> Duration {
        self.expires().saturating_duration_since(now)
    }

    fn next_refresh(&self, schedule: &[u8]) -> Option<Instant> {
        let percent = *schedule.get(self.refresh_step)?;
        Some(self.received + self.lifetime() * u32::from(percent) / 100)
    }

    fn same(&self, record: &ResourceRecord, interface: u32) -> bool {
        self.interface == interface && self.record.same_identity(record)
    }
}

#[derive(Debug)]
struct PendingQuery {
    question: Question,
    mode: QueryMode,
    answers: Vec<CachedAnswer>,
    next_send: Instant,
    interval: Duration,
    /// Transmissions so far.
    sent: u32,
    answered: bool,
}

/// Tombstone key: a goodbye seen in the current feed cycle.
type Goodbye = (Name, u16, RecordData, u32);

fn goodbye_key(record: &ResourceRecord, interface: u32) -> Goodbye {
    (record.name.clone(), record.rclass, record.data.clone(), interface)
}

pub struct QueryEngine {
    config: QueryConfig,
    unicast_response: bool,
    next_handle: u64,
    queries: BTreeMap<QueryHandle, PendingQuery>,
    goodbyes: HashSet<Goodbye>,
}

impl QueryEngine {
    /// `unicast_response` sets the QU bit on every question, for engines not
    /// listening on the mDNS port.
    pub fn new(config: QueryConfig, unicast_response: bool) -> Self {
        Self {
            config,
            unicast_response,
            next_handle: 1,
            queries: BTreeMap::new(),
            goodbyes: HashSet::new(),
        }
    }

    /// Register a question. The first transmission happens at the next tick.
    pub fn start_query(&mut self, question: Question, mode: QueryMode, now: Instant) -> QueryHandle {
        let handle = QueryHandle(self.next_handle);
        self.next_handle += 1;
        debug!("Starting {:?} {} for {} {}", mode, handle, question.name, question.qtype);
        self.queries.insert(
            handle,
            PendingQuery {
                question,
                mode,
                answers: Vec::new(),
                next_send: now,
                interval: self.config.initial_interval(),
                sent: 0,
                answered: false,
            },
        );
        handle
    }

    /// Forget a query. Later answers for it are dropped.
    pub fn stop(&mut self, handle: QueryHandle) -> bool {
        let removed = self.queries.remove(&handle).is_some();
        if removed {
            debug!("Stopped {}", handle);
        }
        removed
    }

    pub fn is_active(&self, handle: QueryHandle) -> bool {
        self.queries.contains_key(&handle)
    }

    pub fn question(&self, handle: QueryHandle) -> Option<&Question> {
        self.queries.get(&handle).map(|q| &q.question)
    }

    /// Records currently cached for a query.
    pub fn answers(&self, handle: QueryHandle) -> Vec<(&ResourceRecord, u32)> {
        self.queries
            .get(&handle)
            .map(|q| q.answers.iter().map(|a| (&a.record, a.interface)).collect())
            .unwrap_or_default()
    }

    /// Match every record of a received response against pending questions.
    ///
    /// A goodbye evicts the matching cached record and blocks positive copies
    /// of it until the next tick, whatever order they arrive in.
    pub fn feed(&mut self, message: &Message, interface: u32, now: Instant) -> Vec<QueryEvent> {
        let mut events = Vec::new();
        for record in message.records() {
            if record.is_goodbye() {
                self.goodbyes.insert(goodbye_key(record, interface));
            }
        }

        for record in message.records() {
            let blocked = self.goodbyes.contains(&goodbye_key(record, interface));
            for (handle, query) in self.queries.iter_mut() {
                if !query.question.matches(record) {
                    continue;
                }
                if blocked {
                    if let Some(at) = query.answers.iter().position(|a| a.same(record, interface)) {
                        let evicted = query.answers.remove(at);
                        trace!("{} goodbye for {}", handle, evicted.record);
                        events.push(QueryEvent::Answer {
                            handle: *handle,
                            record: evicted.record,
                            interface,
                            change: AnswerChange::Removed,
                        });
                    }
                    continue;
                }

                if record.cache_flush {
                    for other in query.answers.iter_mut() {
                        if other.interface == interface
                            && other.record.rtype() == record.rtype()
                            && other.record.name == record.name
                            && !other.record.same_identity(record)
                            && now.saturating_duration_since(other.received) > CACHE_FLUSH_GRACE
                        {
                            other.flush_at = Some(now + CACHE_FLUSH_GRACE);
                        }
                    }
                }

                query.answered = true;
                let change = match query.answers.iter_mut().find(|a| a.same(record, interface)) {
                    Some(existing) => {
                        existing.record = record.clone();
                        existing.received = now;
                        existing.refresh_step = 0;
                        existing.flush_at = None;
                        AnswerChange::Refreshed
                    }
                    None => {
                        query.answers.push(CachedAnswer {
                            record: record.clone(),
                            interface,
                            received: now,
                            refresh_step: 0,
                            flush_at: None,
                        });
                        AnswerChange::Added
                    }
                };
                trace!("{} {:?} {}", handle, change, record);
                events.push(QueryEvent::Answer {
                    handle: *handle,
                    record: record.clone(),
                    interface,
                    change,
                });
            }
        }
        events
    }

    /// Expire stale answers and emit due questions on every interface.
    pub fn tick(&mut self, now: Instant, interfaces: &[u32]) -> Tick {
        self.goodbyes.clear();
        let mut tick = Tick::default();
        let mut finished = Vec::new();

        for (handle, query) in self.queries.iter_mut() {
            let mut expired = Vec::new();
            query.answers.retain(|a| {
                if a.expires() <= now {
                    expired.push(a.clone());
                    false
                } else {
                    true
                }
            });
            for answer in expired {
                trace!("{} expired {}", handle, answer.record);
                tick.events.push(QueryEvent::Answer {
                    handle: *handle,
                    record: answer.record,
                    interface: answer.interface,
                    change: AnswerChange::Removed,
                });
            }

            let mut due = now >= query.next_send;
            if query.mode == QueryMode::Continuous {
                for answer in query.answers.iter_mut() {
                    let mut refresh = false;
                    while answer
                        .next_refresh(&self.config.refresh_percent)
                        .is_some_and(|at| at <= now)
                    {
                        answer.refresh_step += 1;
                        refresh = true;
                    }
                    due |= refresh;
                }
            }
            if !due {
                continue;
            }

            if query.mode == QueryMode::OneShot && now >= query.next_send {
                if query.answered || query.sent > self.config.max_retries {
                    finished.push((*handle, query.answered));
                    continue;
                }
            }

            for interface in interfaces {
                tick.outgoing.push((
                    *interface,
                    build_query(query, *interface, now, self.unicast_response, &self.config),
                ));
            }

            if now >= query.next_send {
                query.sent += 1;
                let delay = query.interval + jitter(self.config.jitter());
                query.next_send = now + delay;
                query.interval = (query.interval * 2).min(self.config.max_interval());
            }
        }

        for (handle, answered) in finished {
            debug!("{} finished (answered: {})", handle, answered);
            self.queries.remove(&handle);
            tick.events.push(QueryEvent::Finished { handle, answered });
        }
        tick
    }

    /// Earliest instant at which `tick` has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut deadline: Option<Instant> = None;
        let mut consider = |at: Instant| {
            deadline = Some(deadline.map_or(at, |d| d.min(at)));
        };
        for query in self.queries.values() {
            consider(query.next_send);
            for answer in &query.answers {
                consider(answer.expires());
                if query.mode == QueryMode::Continuous {
                    if let Some(at) = answer.next_refresh(&self.config.refresh_percent) {
                        consider(at);
                    }
                }
            }
        }
        deadline
    }
}

/// A query message for one interface, listing the answers that still have
/// more than half their lifetime and more than the round-trip window left.
fn build_query(
    query: &PendingQuery,
    interface: u32,
    now: Instant,
    unicast_response: bool,
    config: &QueryConfig,
) -> Message {
    let mut question = query.question.clone();
    question.unicast_response = unicast_response;
    let mut message = Message::query();
    message.questions.push(question);

    for answer in query.answers.iter().filter(|a| a.interface == interface) {
        let remaining = answer.remaining(now);
        if remaining > answer.lifetime() / 2 && remaining > config.known_answer_window() {
            let ttl = remaining.as_secs() as u32;
            message
                .answers
                .push(answer.record.clone().with_ttl(ttl).with_cache_flush(false));
        }
    }
    message
}

fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=max_ms))
}
