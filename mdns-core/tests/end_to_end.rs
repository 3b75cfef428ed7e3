use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mdns_core::wire::Message;
use mdns_core::{
    Destination, Engine, EngineConfig, Event, Interface, InterfaceAddr, Name, RecordData,
    RegistrationState, ResourceRecord, ServiceEvent, ServiceSpec,
};

const STEP: Duration = Duration::from_millis(50);

/// One engine attached to a simulated link.
struct Node {
    engine: Engine,
    addr: SocketAddr,
    events: Vec<Event>,
}

impl Node {
    fn new(ip: &str, hostname: &str) -> Self {
        let interface = Interface::new(
            "eth0",
            1,
            vec![InterfaceAddr {
                ip: ip.parse().unwrap(),
                netmask: Some("255.255.255.0".parse().unwrap()),
            }],
        );
        Self {
            engine: Engine::new(EngineConfig::default(), vec![interface], hostname).unwrap(),
            addr: SocketAddr::new(ip.parse().unwrap(), 5353),
            events: Vec::new(),
        }
    }

    fn collect(&mut self) {
        while let Some(event) = self.engine.next_event() {
            self.events.push(event);
        }
    }
}

/// Tick every node and deliver what it sent, multicast looping back to the
/// sender as it does on a real socket.
fn step(nodes: &mut [&mut Node], now: Instant) {
    let mut in_flight = Vec::new();
    for (from, node) in nodes.iter_mut().enumerate() {
        for outgoing in node.engine.tick(now) {
            in_flight.push((from, outgoing));
        }
    }
    for (from, outgoing) in in_flight {
        let source = nodes[from].addr;
        for node in nodes.iter_mut() {
            let deliver = match outgoing.destination {
                Destination::Multicast => true,
                Destination::Unicast(addr) => addr == node.addr,
            };
            if deliver {
                node.engine
                    .handle_datagram(&outgoing.payload, source, outgoing.interface, now);
            }
        }
    }
    for node in nodes.iter_mut() {
        node.collect();
    }
}

fn run(nodes: &mut [&mut Node], start: Instant, from: Duration, to: Duration) {
    let mut at = from;
    while at <= to {
        step(nodes, start + at);
        at += STEP;
    }
}

fn name(s: &str) -> Name {
    Name::new(s).unwrap()
}

fn printer() -> ServiceSpec {
    ServiceSpec::new("printer", "_ipp._tcp", 631).with_txt("path", "/")
}

#[test]
fn test_register_browse_resolve() {
    let mut alpha = Node::new("192.168.1.10", "alpha");
    let mut beta = Node::new("192.168.1.20", "beta");
    let start = Instant::now();

    let registration = alpha.engine.register_service(printer()).unwrap();
    let browse = beta.engine.browse("_ipp._tcp").unwrap();
    run(&mut [&mut alpha, &mut beta], start, Duration::ZERO, Duration::from_secs(3));

    assert!(alpha.events.contains(&Event::Registered(registration)));
    assert_eq!(
        alpha.engine.registration_state(registration),
        Some(RegistrationState::Announced)
    );
    let added = Event::Browse {
        handle: browse,
        event: ServiceEvent::Added(name("printer._ipp._tcp.local")),
    };
    assert_eq!(beta.events.iter().filter(|e| **e == added).count(), 1);
    assert_eq!(
        beta.engine.browse_instances(browse),
        vec![name("printer._ipp._tcp.local")]
    );

    let resolve = beta.engine.resolve("printer._ipp._tcp.local").unwrap();
    run(
        &mut [&mut alpha, &mut beta],
        start,
        Duration::from_secs(3),
        Duration::from_secs(6),
    );
    let instance = beta
        .events
        .iter()
        .find_map(|e| match e {
            Event::Resolved {
                handle,
                result: Ok(instance),
            } if *handle == resolve => Some(instance.clone()),
            _ => None,
        })
        .expect("printer resolved");
    assert_eq!(instance.port, 631);
    assert_eq!(instance.txt_value("path"), Some("/"));
    assert_eq!(instance.host, name("alpha.local"));
    assert_eq!(
        instance.addresses,
        vec!["192.168.1.10".parse::<std::net::IpAddr>().unwrap()]
    );
}

#[test]
fn test_unregister_removes_instance() {
    let mut alpha = Node::new("192.168.1.10", "alpha");
    let mut beta = Node::new("192.168.1.20", "beta");
    let start = Instant::now();

    let registration = alpha.engine.register_service(printer()).unwrap();
    let browse = beta.engine.browse("_ipp._tcp").unwrap();
    run(&mut [&mut alpha, &mut beta], start, Duration::ZERO, Duration::from_secs(3));
    assert_eq!(beta.engine.browse_instances(browse).len(), 1);

    alpha.engine.unregister(registration).unwrap();
    run(
        &mut [&mut alpha, &mut beta],
        start,
        Duration::from_secs(3),
        Duration::from_secs(4),
    );
    assert!(beta.events.contains(&Event::Browse {
        handle: browse,
        event: ServiceEvent::Removed(name("printer._ipp._tcp.local")),
    }));
    assert!(beta.engine.browse_instances(browse).is_empty());
    assert_eq!(
        alpha.engine.registration_state(registration),
        Some(RegistrationState::Withdrawn)
    );
}

#[test]
fn test_service_type_enumeration() {
    let mut alpha = Node::new("192.168.1.10", "alpha");
    let mut beta = Node::new("192.168.1.20", "beta");
    let start = Instant::now();

    alpha.engine.register_service(printer()).unwrap();
    alpha
        .engine
        .register_service(ServiceSpec::new("web", "_http._tcp", 80))
        .unwrap();
    let browse = beta.engine.browse_service_types().unwrap();
    run(&mut [&mut alpha, &mut beta], start, Duration::ZERO, Duration::from_secs(3));

    let mut types = beta.engine.browse_instances(browse);
    types.sort_by_key(|n| n.to_string());
    assert_eq!(types, vec![name("_http._tcp.local"), name("_ipp._tcp.local")]);
}

fn ptr_datagram(ttl: u32) -> Vec<u8> {
    let mut message = Message::response();
    message.answers.push(ResourceRecord::new(
        name("_ipp._tcp.local"),
        ttl,
        RecordData::Ptr(name("printer._ipp._tcp.local")),
    ));
    message.encode(512).unwrap()
}

#[test]
fn test_goodbye_after_answer_leaves_instance_absent() {
    let mut beta = Node::new("192.168.1.20", "beta");
    let browse = beta.engine.browse("_ipp._tcp").unwrap();
    let now = Instant::now();
    beta.engine.tick(now);
    let source: SocketAddr = "192.168.1.10:5353".parse().unwrap();

    beta.engine.handle_datagram(&ptr_datagram(4500), source, 1, now);
    beta.engine.handle_datagram(&ptr_datagram(0), source, 1, now);
    assert!(beta.engine.browse_instances(browse).is_empty());
}

#[test]
fn test_goodbye_before_answer_leaves_instance_absent() {
    let mut beta = Node::new("192.168.1.20", "beta");
    let browse = beta.engine.browse("_ipp._tcp").unwrap();
    let now = Instant::now();
    beta.engine.tick(now);
    let source: SocketAddr = "192.168.1.10:5353".parse().unwrap();

    beta.engine.handle_datagram(&ptr_datagram(0), source, 1, now);
    beta.engine.handle_datagram(&ptr_datagram(4500), source, 1, now);
    assert!(beta.engine.browse_instances(browse).is_empty());
    beta.collect();
    assert!(beta.events.is_empty());
}

#[test]
fn test_conflict_during_probing() {
    let mut alpha = Node::new("192.168.1.10", "alpha");
    let start = Instant::now();
    let registration = alpha.engine.register_service(printer()).unwrap();
    alpha.engine.tick(start);

    let mut claim = Message::response();
    claim.answers.push(
        ResourceRecord::new(
            name("printer._ipp._tcp.local"),
            120,
            RecordData::Srv {
                priority: 0,
                weight: 0,
                port: 9100,
                target: name("gamma.local"),
            },
        )
        .with_cache_flush(true),
    );
    let bytes = claim.encode(512).unwrap();
    alpha.engine.handle_datagram(
        &bytes,
        "192.168.1.30:5353".parse().unwrap(),
        1,
        start + Duration::from_millis(100),
    );
    alpha.collect();
    assert!(alpha.events.iter().any(|e| matches!(
        e,
        Event::Conflict { handle, name: n } if *handle == registration && *n == name("printer._ipp._tcp.local")
    )));

    for ms in (150..3000).step_by(50) {
        assert!(alpha.engine.tick(start + Duration::from_millis(ms)).is_empty());
    }
    alpha.collect();
    assert!(!alpha.events.contains(&Event::Registered(registration)));
    assert_eq!(
        alpha.engine.registration_state(registration),
        Some(RegistrationState::Conflicting)
    );
}

#[test]
fn test_second_registration_of_same_name_conflicts() {
    let mut alpha = Node::new("192.168.1.10", "alpha");
    let mut gamma = Node::new("192.168.1.30", "gamma");
    let start = Instant::now();

    let first = alpha.engine.register_service(printer()).unwrap();
    run(&mut [&mut alpha, &mut gamma], start, Duration::ZERO, Duration::from_secs(2));
    assert_eq!(
        alpha.engine.registration_state(first),
        Some(RegistrationState::Announced)
    );

    let second = gamma
        .engine
        .register_service(ServiceSpec::new("printer", "_ipp._tcp", 9100))
        .unwrap();
    run(
        &mut [&mut alpha, &mut gamma],
        start,
        Duration::from_secs(2),
        Duration::from_secs(4),
    );
    assert_eq!(
        gamma.engine.registration_state(second),
        Some(RegistrationState::Conflicting)
    );
    assert_eq!(
        alpha.engine.registration_state(first),
        Some(RegistrationState::Announced)
    );
}

#[test]
fn test_legacy_unicast_query() {
    let mut alpha = Node::new("192.168.1.10", "alpha");
    let start = Instant::now();
    alpha.engine.register_service(printer()).unwrap();
    run(&mut [&mut alpha], start, Duration::ZERO, Duration::from_secs(2));

    let mut query = Message::query();
    query.header.id = 0xbeef;
    query.questions.push(mdns_core::wire::Question::new(
        name("printer._ipp._tcp.local"),
        mdns_core::RecordType::Srv,
    ));
    let client: SocketAddr = "192.168.1.40:53535".parse().unwrap();
    let at = start + Duration::from_secs(2) + STEP;
    alpha
        .engine
        .handle_datagram(&query.encode(512).unwrap(), client, 1, at);
    let out = alpha.engine.tick(at);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].destination, Destination::Unicast(client));
    let reply = Message::decode(&out[0].payload).unwrap();
    assert_eq!(reply.header.id, 0xbeef);
    assert_eq!(reply.questions.len(), 1);
    assert!(reply.records().all(|r| r.ttl <= 10 && !r.cache_flush));
}
