//! UDP socket layer: one non-blocking socket per address family per
//! interface, joined to the mDNS group. All sockets share one port.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, UdpSocket};

use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, info, trace, warn};

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::wire::{MDNS_GROUP_V4, MDNS_GROUP_V6};

/// Multicast TTL / hop limit required by RFC 6762 §11.
const MULTICAST_TTL: u32 = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddr {
    pub ip: IpAddr,
    pub netmask: Option<IpAddr>,
}

impl InterfaceAddr {
    fn contains(&self, other: &IpAddr) -> bool {
        match (self.ip, self.netmask, other) {
            (IpAddr::V4(ip), Some(IpAddr::V4(mask)), IpAddr::V4(other)) => {
                u32::from(ip) & u32::from(mask) == u32::from(*other) & u32::from(mask)
            }
            (IpAddr::V6(ip), Some(IpAddr::V6(mask)), IpAddr::V6(other)) => {
                u128::from(ip) & u128::from(mask) == u128::from(*other) & u128::from(mask)
            }
            (ip, None, other) => ip.is_ipv4() == other.is_ipv4(),
            _ => false,
        }
    }
}

/// A local network interface as the engine sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub index: u32,
    pub addrs: Vec<InterfaceAddr>,
}

impl Interface {
    pub fn new(name: impl Into<String>, index: u32, addrs: Vec<InterfaceAddr>) -> Self {
        Self {
            name: name.into(),
            index,
            addrs,
        }
    }

    pub fn ipv4(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.addrs.iter().filter_map(|a| match a.ip {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
    }

    pub fn ipv6(&self) -> impl Iterator<Item = Ipv6Addr> + '_ {
        self.addrs.iter().filter_map(|a| match a.ip {
            IpAddr::V6(ip) => Some(ip),
            IpAddr::V4(_) => None,
        })
    }

    pub fn has_family(&self, family: Family) -> bool {
        match family {
            Family::V4 => self.ipv4().next().is_some(),
            Family::V6 => self.ipv6().next().is_some(),
        }
    }

    /// Whether a datagram from `source` plausibly arrived over this link.
    pub fn is_on_link(&self, source: &SocketAddr) -> bool {
        if let SocketAddr::V6(v6) = source {
            if v6.scope_id() != 0 {
                return v6.scope_id() == self.index;
            }
        }
        let ip = source.ip();
        self.addrs.iter().any(|a| a.contains(&ip))
    }
}

/// Enumerate usable interfaces, optionally restricted to `names`.
///
/// Loopback-only interfaces are skipped unless named explicitly. Entries the
/// platform reports once per address are merged by name.
pub fn list_interfaces(names: &[String]) -> Result<Vec<Interface>, TransportError> {
    let found =
        NetworkInterface::show().map_err(|e| TransportError::Interfaces(e.to_string()))?;

    let mut interfaces: Vec<Interface> = Vec::new();
    for iface in found {
        let explicit = names.iter().any(|n| *n == iface.name);
        if !names.is_empty() && !explicit {
            continue;
        }
        let addrs: Vec<InterfaceAddr> = iface
            .addr
            .iter()
            .map(|addr| match addr {
                Addr::V4(v4) => InterfaceAddr {
                    ip: IpAddr::V4(v4.ip),
                    netmask: v4.netmask.map(IpAddr::V4),
                },
                Addr::V6(v6) => InterfaceAddr {
                    ip: IpAddr::V6(v6.ip),
                    netmask: v6.netmask.map(IpAddr::V6),
                },
            })
            .filter(|a| explicit || !a.ip.is_loopback())
            .collect();
        if addrs.is_empty() {
            continue;
        }

        match interfaces.iter_mut().find(|i| i.name == iface.name) {
            Some(existing) => {
                for addr in addrs {
                    if !existing.addrs.contains(&addr) {
                        existing.addrs.push(addr);
                    }
                }
            }
            None => interfaces.push(Interface::new(iface.name, iface.index, addrs)),
        }
    }

    debug!(
        "Found {} usable interfaces: {:?}",
        interfaces.len(),
        interfaces.iter().map(|i| i.name.as_str()).collect::<Vec<_>>()
    );
    Ok(interfaces)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn group(self, port: u16) -> SocketAddr {
        match self {
            Family::V4 => SocketAddr::V4(SocketAddrV4::new(MDNS_GROUP_V4, port)),
            Family::V6 => SocketAddr::V6(SocketAddrV6::new(MDNS_GROUP_V6, port, 0, 0)),
        }
    }

    fn of(addr: &SocketAddr) -> Family {
        match addr {
            SocketAddr::V4(_) => Family::V4,
            SocketAddr::V6(_) => Family::V6,
        }
    }
}

/// A received datagram with the interface it was attributed to.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub payload: Vec<u8>,
    pub source: SocketAddr,
    pub interface: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// The mDNS group of every family bound on the interface.
    Multicast,
    Unicast(SocketAddr),
}

/// A datagram the engine wants sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub interface: u32,
    pub destination: Destination,
    pub payload: Vec<u8>,
}

/// One bound socket for one family on one interface.
pub struct SocketHandle {
    socket: UdpSocket,
    interface: Interface,
    family: Family,
    port: u16,
}

impl SocketHandle {
    /// Bind a reusable, non-blocking socket on the wildcard address and set
    /// the multicast options for `interface`.
    pub fn open(interface: &Interface, family: Family, port: u16) -> Result<Self, TransportError> {
        let bind_err = |source: io::Error| TransportError::Bind {
            interface: interface.name.clone(),
            source,
        };

        let domain = match family {
            Family::V4 => Domain::IPV4,
            Family::V6 => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(bind_err)?;
        socket.set_reuse_address(true).map_err(bind_err)?;
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        socket.set_reuse_port(true).map_err(bind_err)?;

        let local: SocketAddr = match family {
            Family::V4 => {
                let iface_ip = interface.ipv4().next().unwrap_or(Ipv4Addr::UNSPECIFIED);
                socket.set_multicast_ttl_v4(MULTICAST_TTL).map_err(bind_err)?;
                socket.set_multicast_loop_v4(true).map_err(bind_err)?;
                socket.set_multicast_if_v4(&iface_ip).map_err(bind_err)?;
                SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
            }
            Family::V6 => {
                socket.set_only_v6(true).map_err(bind_err)?;
                socket.set_multicast_hops_v6(MULTICAST_TTL).map_err(bind_err)?;
                socket.set_multicast_loop_v6(true).map_err(bind_err)?;
                socket.set_multicast_if_v6(interface.index).map_err(bind_err)?;
                SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0))
            }
        };
        socket.set_nonblocking(true).map_err(bind_err)?;
        socket.bind(&SockAddr::from(local)).map_err(bind_err)?;

        debug!("Bound {:?} socket on {} port {}", family, interface.name, port);
        Ok(Self {
            socket: socket.into(),
            interface: interface.clone(),
            family,
            port,
        })
    }

    pub fn interface(&self) -> &Interface {
        &self.interface
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn join_multicast(&self) -> Result<(), TransportError> {
        let group = self.family.group(self.port).ip();
        let result = match self.family {
            Family::V4 => {
                let iface_ip = self.interface.ipv4().next().unwrap_or(Ipv4Addr::UNSPECIFIED);
                self.socket.join_multicast_v4(&MDNS_GROUP_V4, &iface_ip)
            }
            Family::V6 => self.socket.join_multicast_v6(&MDNS_GROUP_V6, self.interface.index),
        };
        result.map_err(|source| TransportError::Join {
            interface: self.interface.name.clone(),
            group,
            source,
        })
    }

    pub fn send(&self, bytes: &[u8], destination: SocketAddr) -> Result<(), TransportError> {
        let destination = match destination {
            SocketAddr::V6(v6) if v6.scope_id() == 0 && is_link_local_v6(v6.ip()) => {
                SocketAddr::V6(SocketAddrV6::new(*v6.ip(), v6.port(), 0, self.interface.index))
            }
            other => other,
        };
        trace!("Sending {} bytes to {} on {}", bytes.len(), destination, self.interface.name);
        self.socket
            .send_to(bytes, destination)
            .map(|_| ())
            .map_err(|source| TransportError::Send {
                destination,
                source,
            })
    }

    pub fn send_multicast(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.send(bytes, self.family.group(self.port))
    }

    /// Next datagram read on this socket, or `None` once it would block.
    ///
    /// The datagram is tagged with this socket's interface. Sockets share the
    /// port, so it may have arrived over another link.
    pub fn receive(&self, buf: &mut [u8]) -> Result<Option<Datagram>, TransportError> {
        loop {
            match self.socket.recv_from(buf) {
                Ok((len, source)) => {
                    return Ok(Some(Datagram {
                        payload: buf[..len].to_vec(),
                        source,
                        interface: self.interface.index,
                    }));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(TransportError::Receive {
                        interface: self.interface.name.clone(),
                        source,
                    })
                }
            }
        }
    }
}

/// Tag each datagram with the interface whose link its source is on.
///
/// `received` pairs a datagram with the index into `owners` of the socket
/// that read it. Unicast to the shared port reaches a single socket, possibly
/// the wrong one, so such datagrams move to their source's interface.
/// Multicast reaches every socket; a copy read on a foreign socket is dropped
/// when the home socket read it too. Sources on no known link are dropped.
pub(crate) fn attribute(owners: &[&Interface], received: Vec<(usize, Datagram)>) -> Vec<Datagram> {
    let homes: Vec<Option<u32>> = received
        .iter()
        .map(|(owner, datagram)| {
            let owner = owners[*owner];
            if owner.is_on_link(&datagram.source) {
                return Some(owner.index);
            }
            let Some(home) = owners.iter().find(|i| i.is_on_link(&datagram.source)) else {
                trace!("Ignoring datagram from {} on {}", datagram.source, owner.name);
                return None;
            };
            let home_copy = received.iter().any(|(other, d)| {
                owners[*other].index == home.index
                    && d.source == datagram.source
                    && d.payload == datagram.payload
            });
            if home_copy {
                return None;
            }
            trace!(
                "Datagram from {} read on {} belongs to {}",
                datagram.source,
                owner.name,
                home.name
            );
            Some(home.index)
        })
        .collect();

    received
        .into_iter()
        .zip(homes)
        .filter_map(|((_, mut datagram), home)| {
            datagram.interface = home?;
            Some(datagram)
        })
        .collect()
}

fn is_link_local_v6(ip: &Ipv6Addr) -> bool {
    ip.segments()[0] & 0xffc0 == 0xfe80
}

/// All sockets of one engine instance.
pub struct Transport {
    sockets: Vec<SocketHandle>,
    buf: Vec<u8>,
    port: u16,
}

impl Transport {
    /// Open and join a socket per enabled family on every interface.
    ///
    /// Bind failures are fatal. An interface that cannot join the group is
    /// logged and skipped; ending up with no socket at all is an error.
    pub fn bind(interfaces: &[Interface], config: &TransportConfig) -> Result<Self, TransportError> {
        let mut families = Vec::new();
        if config.ipv4 {
            families.push(Family::V4);
        }
        if config.ipv6 {
            families.push(Family::V6);
        }

        let mut sockets = Vec::new();
        for interface in interfaces {
            for family in &families {
                if !interface.has_family(*family) {
                    continue;
                }
                let handle = SocketHandle::open(interface, *family, config.port)?;
                if let Err(e) = handle.join_multicast() {
                    warn!("{}", e);
                    continue;
                }
                info!("Joined mDNS group on {} ({:?})", interface.name, family);
                sockets.push(handle);
            }
        }

        if sockets.is_empty() {
            return Err(TransportError::NoInterfaces);
        }

        Ok(Self {
            sockets,
            buf: vec![0u8; config.max_packet_size.max(512)],
            port: config.port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Read every datagram currently queued on every socket.
    ///
    /// A receive failure on one socket is logged and does not stop the others.
    pub fn drain(&mut self) -> Vec<Datagram> {
        let mut received = Vec::new();
        for (owner, socket) in self.sockets.iter().enumerate() {
            loop {
                match socket.receive(&mut self.buf) {
                    Ok(Some(datagram)) => received.push((owner, datagram)),
                    Ok(None) => break,
                    Err(e) => {
                        warn!("{}", e);
                        break;
                    }
                }
            }
        }
        let owners: Vec<&Interface> = self.sockets.iter().map(|s| &s.interface).collect();
        attribute(&owners, received)
    }

    pub fn send(&self, outgoing: &Outgoing) -> Result<(), TransportError> {
        let mut sent = false;
        for socket in self
            .sockets
            .iter()
            .filter(|s| s.interface.index == outgoing.interface)
        {
            match outgoing.destination {
                Destination::Multicast => {
                    socket.send_multicast(&outgoing.payload)?;
                    sent = true;
                }
                Destination::Unicast(addr) if Family::of(&addr) == socket.family => {
                    socket.send(&outgoing.payload, addr)?;
                    sent = true;
                }
                Destination::Unicast(_) => {}
            }
        }
        if !sent {
            debug!(
                "No socket on interface {} for {:?}",
                outgoing.interface, outgoing.destination
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eth0() -> Interface {
        Interface::new(
            "eth0",
            2,
            vec![
                InterfaceAddr {
                    ip: "192.168.1.10".parse().unwrap(),
                    netmask: Some("255.255.255.0".parse().unwrap()),
                },
                InterfaceAddr {
                    ip: "fe80::1".parse().unwrap(),
                    netmask: Some("ffff:ffff:ffff:ffff::".parse().unwrap()),
                },
            ],
        )
    }

    #[test]
    fn test_is_on_link_v4() {
        let iface = eth0();
        assert!(iface.is_on_link(&"192.168.1.77:5353".parse().unwrap()));
        assert!(!iface.is_on_link(&"10.0.0.5:5353".parse().unwrap()));
    }

    #[test]
    fn test_is_on_link_v6_scope() {
        let iface = eth0();
        let same = SocketAddr::V6(SocketAddrV6::new("fe80::9".parse().unwrap(), 5353, 0, 2));
        let other = SocketAddr::V6(SocketAddrV6::new("fe80::9".parse().unwrap(), 5353, 0, 3));
        assert!(iface.is_on_link(&same));
        assert!(!iface.is_on_link(&other));
    }

    #[test]
    fn test_missing_netmask_matches_family() {
        let iface = Interface::new(
            "wlan0",
            3,
            vec![InterfaceAddr {
                ip: "10.1.1.1".parse().unwrap(),
                netmask: None,
            }],
        );
        assert!(iface.is_on_link(&"10.200.0.1:5353".parse().unwrap()));
        assert!(!iface.is_on_link(&"[2001:db8::1]:5353".parse().unwrap()));
        assert!(iface.has_family(Family::V4));
        assert!(!iface.has_family(Family::V6));
    }

    fn eth1() -> Interface {
        Interface::new(
            "eth1",
            3,
            vec![InterfaceAddr {
                ip: "10.1.0.1".parse().unwrap(),
                netmask: Some("255.255.0.0".parse().unwrap()),
            }],
        )
    }

    fn datagram(source: &str, payload: &[u8], interface: u32) -> Datagram {
        Datagram {
            payload: payload.to_vec(),
            source: source.parse().unwrap(),
            interface,
        }
    }

    #[test]
    fn test_unicast_read_on_other_socket_is_reattributed() {
        let (eth0, eth1) = (eth0(), eth1());
        let owners = [&eth0, &eth1];
        let received = vec![(0, datagram("10.1.0.5:5353", b"reply", 2))];
        let attributed = attribute(&owners, received);
        assert_eq!(attributed.len(), 1);
        assert_eq!(attributed[0].interface, 3);
        assert_eq!(attributed[0].payload, b"reply");
    }

    #[test]
    fn test_multicast_copy_on_other_socket_is_dropped() {
        let (eth0, eth1) = (eth0(), eth1());
        let owners = [&eth0, &eth1];
        let received = vec![
            (0, datagram("10.1.0.5:5353", b"query", 2)),
            (1, datagram("10.1.0.5:5353", b"query", 3)),
            (0, datagram("192.168.1.77:5353", b"query", 2)),
        ];
        let attributed = attribute(&owners, received);
        let tagged: Vec<_> = attributed
            .iter()
            .map(|d| (d.source.to_string(), d.interface))
            .collect();
        assert_eq!(
            tagged,
            vec![
                ("10.1.0.5:5353".to_string(), 3),
                ("192.168.1.77:5353".to_string(), 2)
            ]
        );
    }

    #[test]
    fn test_off_link_source_is_dropped() {
        let (eth0, eth1) = (eth0(), eth1());
        let owners = [&eth0, &eth1];
        let received = vec![(1, datagram("172.16.0.9:5353", b"noise", 3))];
        assert!(attribute(&owners, received).is_empty());
    }

    #[test]
    fn test_group_addresses() {
        assert_eq!(Family::V4.group(5353).to_string(), "224.0.0.251:5353");
        assert_eq!(Family::V6.group(5353).to_string(), "[ff02::fb]:5353");
    }
}
