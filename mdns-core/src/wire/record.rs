use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{Ipv4Addr, Ipv6Addr};

use super::buffer::{Reader, Writer};
use super::name::Name;
use super::{CACHE_FLUSH, CLASS_ANY, CLASS_IN, UNICAST_RESPONSE};
use crate::error::{DecodeError, EncodeError};

const TYPE_A: u16 = 1;
const TYPE_CNAME: u16 = 5;
const TYPE_PTR: u16 = 12;
const TYPE_TXT: u16 = 16;
const TYPE_AAAA: u16 = 28;
const TYPE_SRV: u16 = 33;
const TYPE_NSEC: u16 = 47;
const TYPE_ANY: u16 = 255;

/// Record types the codec interprets; everything else is `Other`.
///
/// Equality and ordering follow the numeric type code, so `Other(1)` is `A`.
#[derive(Debug, Clone, Copy)]
pub enum RecordType {
    A,
    Cname,
    Ptr,
    Txt,
    Aaaa,
    Srv,
    Nsec,
    Any,
    Other(u16),
}

impl RecordType {
    pub fn from_u16(value: u16) -> Self {
        match value {
            TYPE_A => RecordType::A,
            TYPE_CNAME => RecordType::Cname,
            TYPE_PTR => RecordType::Ptr,
            TYPE_TXT => RecordType::Txt,
            TYPE_AAAA => RecordType::Aaaa,
            TYPE_SRV => RecordType::Srv,
            TYPE_NSEC => RecordType::Nsec,
            TYPE_ANY => RecordType::Any,
            other => RecordType::Other(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            RecordType::A => TYPE_A,
            RecordType::Cname => TYPE_CNAME,
            RecordType::Ptr => TYPE_PTR,
            RecordType::Txt => TYPE_TXT,
            RecordType::Aaaa => TYPE_AAAA,
            RecordType::Srv => TYPE_SRV,
            RecordType::Nsec => TYPE_NSEC,
            RecordType::Any => TYPE_ANY,
            RecordType::Other(v) => v,
        }
    }

    /// Types whose rdata is parsed into a dedicated `RecordData` variant.
    pub fn is_structured(self) -> bool {
        !matches!(RecordType::from_u16(self.to_u16()), RecordType::Any | RecordType::Other(_))
    }
}

impl PartialEq for RecordType {
    fn eq(&self, other: &Self) -> bool {
        self.to_u16() == other.to_u16()
    }
}

impl Eq for RecordType {}

impl Hash for RecordType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_u16().hash(state);
    }
}

impl PartialOrd for RecordType {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RecordType {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_u16().cmp(&other.to_u16())
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordType::A => write!(f, "A"),
            RecordType::Cname => write!(f, "CNAME"),
            RecordType::Ptr => write!(f, "PTR"),
            RecordType::Txt => write!(f, "TXT"),
            RecordType::Aaaa => write!(f, "AAAA"),
            RecordType::Srv => write!(f, "SRV"),
            RecordType::Nsec => write!(f, "NSEC"),
            RecordType::Any => write!(f, "ANY"),
            RecordType::Other(v) => write!(f, "TYPE{}", v),
        }
    }
}

impl std::str::FromStr for RecordType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "A" => Ok(RecordType::A),
            "CNAME" => Ok(RecordType::Cname),
            "PTR" => Ok(RecordType::Ptr),
            "TXT" => Ok(RecordType::Txt),
            "AAAA" => Ok(RecordType::Aaaa),
            "SRV" => Ok(RecordType::Srv),
            "NSEC" => Ok(RecordType::Nsec),
            "ANY" => Ok(RecordType::Any),
            other => other
                .strip_prefix("TYPE")
                .and_then(|n| n.parse().ok())
                .map(RecordType::from_u16)
                .ok_or_else(|| format!("unknown record type {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Question {
    pub name: Name,
    pub qtype: RecordType,
    /// Class with the unicast-response bit masked off.
    pub qclass: u16,
    pub unicast_response: bool,
}

impl Question {
    pub fn new(name: Name, qtype: RecordType) -> Self {
        Self {
            name,
            qtype,
            qclass: CLASS_IN,
            unicast_response: false,
        }
    }

    /// Exact (name, type-or-ANY, class-or-ANY) match.
    pub fn matches(&self, record: &ResourceRecord) -> bool {
        (self.qtype == RecordType::Any || self.qtype == record.rtype())
            && (self.qclass == CLASS_ANY || self.qclass == record.rclass)
            && self.name == record.name
    }

    pub(crate) fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let name = Name::decode(reader)?;
        let qtype = RecordType::from_u16(reader.u16()?);
        let class = reader.u16()?;
        Ok(Self {
            name,
            qtype,
            qclass: class & !UNICAST_RESPONSE,
            unicast_response: class & UNICAST_RESPONSE != 0,
        })
    }

    pub(crate) fn encode(&self, writer: &mut Writer<'_>) -> Result<(), EncodeError> {
        self.name.encode(writer)?;
        writer.u16(self.qtype.to_u16())?;
        let flag = if self.unicast_response {
            UNICAST_RESPONSE
        } else {
            0
        };
        writer.u16(self.qclass | flag)
    }
}

/// Type-specific record payload. Unknown types are carried opaquely so they
/// can be relayed and re-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Ptr(Name),
    Cname(Name),
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: Name,
    },
    /// Ordered character strings, each at most 255 bytes. An empty list
    /// goes out as one empty string and so decodes as `[[]]`.
    Txt(Vec<Vec<u8>>),
    Nsec {
        next: Name,
        types: BTreeSet<RecordType>,
    },
    /// Opaque rdata. Encoding refuses type codes that have their own variant.
    Unknown {
        rtype: u16,
        data: Vec<u8>,
    },
}

impl RecordData {
    pub fn rtype(&self) -> RecordType {
        match self {
            RecordData::A(_) => RecordType::A,
            RecordData::Aaaa(_) => RecordType::Aaaa,
            RecordData::Ptr(_) => RecordType::Ptr,
            RecordData::Cname(_) => RecordType::Cname,
            RecordData::Srv { .. } => RecordType::Srv,
            RecordData::Txt(_) => RecordType::Txt,
            RecordData::Nsec { .. } => RecordType::Nsec,
            RecordData::Unknown { rtype, .. } => RecordType::from_u16(*rtype),
        }
    }

    /// Payload as written on the wire without compression.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.max_encoded_len()];
        let len = {
            let mut writer = Writer::new(&mut buf);
            if self.encode(&mut writer).is_err() {
                return Vec::new();
            }
            writer.pos()
        };
        buf.truncate(len);
        buf
    }

    /// Upper bound on the uncompressed payload size.
    fn max_encoded_len(&self) -> usize {
        match self {
            RecordData::A(_) => 4,
            RecordData::Aaaa(_) => 16,
            RecordData::Ptr(name) | RecordData::Cname(name) => name.encoded_len(),
            RecordData::Srv { target, .. } => 6 + target.encoded_len(),
            RecordData::Txt(strings) => strings.iter().map(|s| 1 + s.len()).sum::<usize>().max(1),
            RecordData::Nsec { next, types } => {
                let mut windows: Vec<u16> = types.iter().map(|t| t.to_u16() >> 8).collect();
                windows.dedup();
                next.encoded_len() + windows.len() * 34
            }
            RecordData::Unknown { data, .. } => data.len(),
        }
    }

    fn decode(reader: &mut Reader<'_>, rtype: u16, len: usize) -> Result<Self, DecodeError> {
        let start = reader.pos();
        let end = start + len;
        if len > reader.remaining() {
            return Err(DecodeError::BufferTruncated { offset: start });
        }

        let wrong_length = |parsed| DecodeError::RdataLength {
            rtype: RecordType::from_u16(rtype),
            declared: len,
            parsed,
        };

        let data = match RecordType::from_u16(rtype) {
            RecordType::A => {
                let octets: [u8; 4] = reader
                    .bytes(len)?
                    .try_into()
                    .map_err(|_| wrong_length(len.min(4)))?;
                RecordData::A(Ipv4Addr::from(octets))
            }
            RecordType::Aaaa => {
                let octets: [u8; 16] = reader
                    .bytes(len)?
                    .try_into()
                    .map_err(|_| wrong_length(len.min(16)))?;
                RecordData::Aaaa(Ipv6Addr::from(octets))
            }
            RecordType::Ptr => RecordData::Ptr(Name::decode(reader)?),
            RecordType::Cname => RecordData::Cname(Name::decode(reader)?),
            RecordType::Srv => RecordData::Srv {
                priority: reader.u16()?,
                weight: reader.u16()?,
                port: reader.u16()?,
                target: Name::decode(reader)?,
            },
            RecordType::Txt => {
                let mut strings = Vec::new();
                while reader.pos() < end {
                    let n = usize::from(reader.u8()?);
                    strings.push(reader.bytes(n)?.to_vec());
                }
                RecordData::Txt(strings)
            }
            RecordType::Nsec => {
                let next = Name::decode(reader)?;
                let mut types = BTreeSet::new();
                while reader.pos() < end {
                    let window = u16::from(reader.u8()?);
                    let n = usize::from(reader.u8()?);
                    if n == 0 || n > 32 {
                        return Err(wrong_length(reader.pos() - start));
                    }
                    for (i, byte) in reader.bytes(n)?.iter().enumerate() {
                        for bit in 0..8u16 {
                            if byte & (0x80 >> bit) != 0 {
                                let value = (window << 8) | ((i as u16) << 3) | bit;
                                types.insert(RecordType::from_u16(value));
                            }
                        }
                    }
                }
                RecordData::Nsec { next, types }
            }
            _ => RecordData::Unknown {
                rtype,
                data: reader.bytes(len)?.to_vec(),
            },
        };

        let parsed = reader.pos() - start;
        if parsed != len {
            return Err(wrong_length(parsed));
        }
        Ok(data)
    }

    fn encode(&self, writer: &mut Writer<'_>) -> Result<(), EncodeError> {
        match self {
            RecordData::A(ip) => writer.bytes(&ip.octets()),
            RecordData::Aaaa(ip) => writer.bytes(&ip.octets()),
            RecordData::Ptr(name) | RecordData::Cname(name) => name.encode(writer),
            RecordData::Srv {
                priority,
                weight,
                port,
                target,
            } => {
                writer.u16(*priority)?;
                writer.u16(*weight)?;
                writer.u16(*port)?;
                target.encode(writer)
            }
            RecordData::Txt(strings) => {
                if strings.is_empty() {
                    return writer.u8(0);
                }
                for s in strings {
                    if s.len() > 255 {
                        return Err(EncodeError::TxtStringTooLong(s.len()));
                    }
                    writer.u8(s.len() as u8)?;
                    writer.bytes(s)?;
                }
                Ok(())
            }
            RecordData::Nsec { next, types } => {
                next.encode_uncompressed(writer)?;
                let values: Vec<u16> = types.iter().map(|t| t.to_u16()).collect();
                let mut i = 0;
                while i < values.len() {
                    let window = values[i] >> 8;
                    let mut bitmap = [0u8; 32];
                    let mut used = 0;
                    while i < values.len() && values[i] >> 8 == window {
                        let low = usize::from(values[i] & 0xFF);
                        bitmap[low / 8] |= 0x80 >> (low % 8);
                        used = low / 8 + 1;
                        i += 1;
                    }
                    writer.u8(window as u8)?;
                    writer.u8(used as u8)?;
                    writer.bytes(&bitmap[..used])?;
                }
                Ok(())
            }
            RecordData::Unknown { rtype, data } => {
                let rtype = RecordType::from_u16(*rtype);
                if rtype.is_structured() {
                    return Err(EncodeError::OpaqueStructuredType(rtype));
                }
                writer.bytes(data)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRecord {
    pub name: Name,
    /// Class with the cache-flush bit masked off.
    pub rclass: u16,
    pub cache_flush: bool,
    /// Seconds; 0 is a goodbye.
    pub ttl: u32,
    pub data: RecordData,
}

impl ResourceRecord {
    pub fn new(name: Name, ttl: u32, data: RecordData) -> Self {
        Self {
            name,
            rclass: CLASS_IN,
            cache_flush: false,
            ttl,
            data,
        }
    }

    pub fn rtype(&self) -> RecordType {
        self.data.rtype()
    }

    pub fn is_goodbye(&self) -> bool {
        self.ttl == 0
    }

    /// Same record regardless of TTL and cache-flush bit.
    pub fn same_identity(&self, other: &ResourceRecord) -> bool {
        self.rclass == other.rclass && self.name == other.name && self.data == other.data
    }

    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_cache_flush(mut self, cache_flush: bool) -> Self {
        self.cache_flush = cache_flush;
        self
    }

    pub(crate) fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let name = Name::decode(reader)?;
        let rtype = reader.u16()?;
        let class = reader.u16()?;
        let ttl = reader.u32()?;
        let len = usize::from(reader.u16()?);
        let data = RecordData::decode(reader, rtype, len)?;
        Ok(Self {
            name,
            rclass: class & !CACHE_FLUSH,
            cache_flush: class & CACHE_FLUSH != 0,
            ttl,
            data,
        })
    }

    pub(crate) fn encode(&self, writer: &mut Writer<'_>) -> Result<(), EncodeError> {
        self.name.encode(writer)?;
        writer.u16(self.rtype().to_u16())?;
        let flag = if self.cache_flush { CACHE_FLUSH } else { 0 };
        writer.u16(self.rclass | flag)?;
        writer.u32(self.ttl)?;

        let len_at = writer.pos();
        writer.u16(0)?;
        self.data.encode(writer)?;
        let len = writer.pos() - len_at - 2;
        if len > usize::from(u16::MAX) {
            return Err(EncodeError::RdataTooLong(len));
        }
        writer.patch_u16(len_at, len as u16);
        Ok(())
    }
}

impl fmt::Display for ResourceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ttl={} ", self.name, self.rtype(), self.ttl)?;
        match &self.data {
            RecordData::A(ip) => write!(f, "{}", ip),
            RecordData::Aaaa(ip) => write!(f, "{}", ip),
            RecordData::Ptr(name) | RecordData::Cname(name) => write!(f, "{}", name),
            RecordData::Srv {
                priority,
                weight,
                port,
                target,
            } => write!(f, "{} {} {} {}", priority, weight, port, target),
            RecordData::Txt(strings) => {
                let parts: Vec<_> = strings
                    .iter()
                    .map(|s| format!("{:?}", String::from_utf8_lossy(s)))
                    .collect();
                write!(f, "{}", parts.join(" "))
            }
            RecordData::Nsec { next, types } => {
                let types: Vec<_> = types.iter().map(ToString::to_string).collect();
                write!(f, "{} {}", next, types.join(" "))
            }
            RecordData::Unknown { data, .. } => write!(f, "<{} bytes>", data.len()),
        }
    }
}

/// One DNS-SD TXT attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxtProperty {
    pub key: String,
    /// `None` for a boolean attribute written without `=`.
    pub value: Option<Vec<u8>>,
}

impl TxtProperty {
    pub fn value_str(&self) -> Option<&str> {
        self.value
            .as_deref()
            .and_then(|v| std::str::from_utf8(v).ok())
    }
}

/// Split TXT strings into attributes (RFC 6763 §6).
///
/// The key runs up to the first `=` and must be non-empty printable US-ASCII;
/// strings that violate this are skipped.
pub fn parse_txt(strings: &[Vec<u8>]) -> Vec<TxtProperty> {
    let mut properties = Vec::new();
    for s in strings {
        let split = s.iter().position(|b| *b == b'=');
        let key = &s[..split.unwrap_or(s.len())];
        if key.is_empty() || key.iter().any(|b| !(0x20..=0x7E).contains(b)) {
            continue;
        }
        let key = String::from_utf8_lossy(key).into_owned();
        if properties.iter().any(|p: &TxtProperty| p.key.eq_ignore_ascii_case(&key)) {
            // Only the first occurrence of a key counts.
            continue;
        }
        properties.push(TxtProperty {
            key,
            value: split.map(|at| s[at + 1..].to_vec()),
        });
    }
    properties
}

/// Build TXT strings from key/value pairs.
pub fn txt_strings<'a, I>(pairs: I) -> Vec<Vec<u8>>
where
    I: IntoIterator<Item = (&'a str, Option<&'a [u8]>)>,
{
    let strings: Vec<Vec<u8>> = pairs
        .into_iter()
        .map(|(key, value)| {
            let mut s = key.as_bytes().to_vec();
            if let Some(value) = value {
                s.push(b'=');
                s.extend_from_slice(value);
            }
            s
        })
        .collect();
    if strings.is_empty() {
        // RFC 6763 §6.1: an empty TXT record holds a single empty string
        return vec![Vec::new()];
    }
    strings
}
