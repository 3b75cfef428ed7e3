use super::buffer::{Reader, Writer};
use super::record::{Question, ResourceRecord};
use super::{FLAGS_AA, FLAGS_OPCODE_MASK, FLAGS_QR_RESPONSE, FLAGS_RCODE_MASK, FLAGS_TC};
use crate::error::{DecodeError, EncodeError};

const HEADER_LEN: usize = 12;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    pub id: u16,
    pub flags: u16,
}

impl Header {
    pub fn is_response(&self) -> bool {
        self.flags & FLAGS_QR_RESPONSE != 0
    }

    pub fn opcode(&self) -> u8 {
        ((self.flags & FLAGS_OPCODE_MASK) >> 11) as u8
    }

    pub fn rcode(&self) -> u8 {
        (self.flags & FLAGS_RCODE_MASK) as u8
    }

    pub fn authoritative(&self) -> bool {
        self.flags & FLAGS_AA != 0
    }

    pub fn truncated(&self) -> bool {
        self.flags & FLAGS_TC != 0
    }
}

/// A complete DNS message with its four sections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<ResourceRecord>,
    pub authorities: Vec<ResourceRecord>,
    pub additionals: Vec<ResourceRecord>,
}

impl Message {
    /// An mDNS query: id 0, no flags.
    pub fn query() -> Self {
        Self::default()
    }

    /// An authoritative mDNS response.
    pub fn response() -> Self {
        Self {
            header: Header {
                id: 0,
                flags: FLAGS_QR_RESPONSE | FLAGS_AA,
            },
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
            && self.answers.is_empty()
            && self.authorities.is_empty()
            && self.additionals.is_empty()
    }

    /// All resource records in section order.
    pub fn records(&self) -> impl Iterator<Item = &ResourceRecord> {
        self.answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.additionals.iter())
    }

    /// Parse a full datagram. Section counts must be honored exactly and no
    /// bytes may follow the last record.
    pub fn decode(buf: &[u8]) -> Result<Message, DecodeError> {
        let mut reader = Reader::new(buf);
        let header = Header {
            id: reader.u16()?,
            flags: reader.u16()?,
        };
        let qdcount = reader.u16()?;
        let ancount = reader.u16()?;
        let nscount = reader.u16()?;
        let arcount = reader.u16()?;

        let mut questions = Vec::new();
        for _ in 0..qdcount {
            questions.push(Question::decode(&mut reader)?);
        }
        let answers = decode_records(&mut reader, ancount)?;
        let authorities = decode_records(&mut reader, nscount)?;
        let additionals = decode_records(&mut reader, arcount)?;

        if reader.remaining() > 0 {
            return Err(DecodeError::TrailingData {
                remaining: reader.remaining(),
            });
        }

        Ok(Message {
            header,
            questions,
            answers,
            authorities,
            additionals,
        })
    }

    /// Serialize into `buf`, returning the number of bytes written.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<usize, EncodeError> {
        let mut writer = Writer::new(buf);
        writer.u16(self.header.id)?;
        writer.u16(self.header.flags)?;
        writer.u16(count(self.questions.len())?)?;
        writer.u16(count(self.answers.len())?)?;
        writer.u16(count(self.authorities.len())?)?;
        writer.u16(count(self.additionals.len())?)?;

        for question in &self.questions {
            question.encode(&mut writer)?;
        }
        for record in self.records() {
            record.encode(&mut writer)?;
        }
        Ok(writer.pos())
    }

    /// Serialize into a fresh buffer of at most `capacity` bytes.
    pub fn encode(&self, capacity: usize) -> Result<Vec<u8>, EncodeError> {
        let mut buf = vec![0u8; capacity.max(HEADER_LEN)];
        let len = self.encode_into(&mut buf)?;
        if len > capacity {
            return Err(EncodeError::BufferFull { capacity });
        }
        buf.truncate(len);
        Ok(buf)
    }
}

fn count(len: usize) -> Result<u16, EncodeError> {
    u16::try_from(len).map_err(|_| EncodeError::TooManyRecords(len))
}

fn decode_records(reader: &mut Reader<'_>, n: u16) -> Result<Vec<ResourceRecord>, DecodeError> {
    let mut records = Vec::new();
    for _ in 0..n {
        records.push(ResourceRecord::decode(reader)?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::wire::{Name, RecordData, RecordType, MAX_MESSAGE_SIZE};

    fn printer_response() -> Message {
        let service = Name::new("_ipp._tcp.local").unwrap();
        let instance = Name::new("printer._ipp._tcp.local").unwrap();
        let host = Name::new("host.local").unwrap();
        let mut msg = Message::response();
        msg.answers.push(ResourceRecord::new(
            service,
            4500,
            RecordData::Ptr(instance.clone()),
        ));
        msg.additionals.push(
            ResourceRecord::new(
                instance.clone(),
                120,
                RecordData::Srv {
                    priority: 0,
                    weight: 0,
                    port: 631,
                    target: host.clone(),
                },
            )
            .with_cache_flush(true),
        );
        msg.additionals.push(ResourceRecord::new(
            instance,
            4500,
            RecordData::Txt(vec![b"path=/".to_vec()]),
        ));
        msg.additionals.push(
            ResourceRecord::new(host, 120, RecordData::A(Ipv4Addr::new(192, 168, 1, 10)))
                .with_cache_flush(true),
        );
        msg
    }

    #[test]
    fn test_message_roundtrip() {
        let msg = printer_response();
        let bytes = msg.encode(MAX_MESSAGE_SIZE).unwrap();
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
        assert!(decoded.header.is_response());
        assert!(decoded.header.authoritative());
        assert_eq!(decoded.records().count(), 4);
    }

    #[test]
    fn test_compression_shrinks_output() {
        let bytes = printer_response().encode(MAX_MESSAGE_SIZE).unwrap();
        let occurrences = bytes.windows(6).filter(|w| *w == &b"\x05local"[..]).count();
        assert_eq!(occurrences, 1);
    }

    #[test]
    fn test_query_with_question() {
        let mut msg = Message::query();
        msg.questions
            .push(Question::new(Name::new("_services._dns-sd._udp.local").unwrap(), RecordType::Ptr));
        let bytes = msg.encode(512).unwrap();
        assert_eq!(&bytes[..4], &[0, 0, 0, 0]);
        let decoded = Message::decode(&bytes).unwrap();
        assert!(!decoded.header.is_response());
        assert_eq!(decoded.questions.len(), 1);
    }

    #[test]
    fn test_buffer_full() {
        let msg = printer_response();
        assert_eq!(msg.encode(40), Err(EncodeError::BufferFull { capacity: 40 }));
    }

    #[test]
    fn test_trailing_data_rejected() {
        let mut bytes = Message::query().encode(512).unwrap();
        bytes.push(0);
        assert_eq!(
            Message::decode(&bytes),
            Err(DecodeError::TrailingData { remaining: 1 })
        );
    }

    #[test]
    fn test_count_exceeds_records() {
        let mut bytes = Message::query().encode(512).unwrap();
        bytes[7] = 1;
        assert!(matches!(
            Message::decode(&bytes),
            Err(DecodeError::BufferTruncated { offset: 12 })
        ));
    }

    #[test]
    fn test_pointer_cycle_in_question() {
        let mut bytes = vec![0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        // Name at offset 12 pointing to itself
        bytes.extend_from_slice(&[0xC0, 12, 0, 12, 0, 1]);
        assert_eq!(
            Message::decode(&bytes),
            Err(DecodeError::PointerCycle { offset: 12 })
        );
    }

    #[test]
    fn test_header_fields() {
        let header = Header {
            id: 7,
            flags: 0x8000 | (2 << 11) | 3,
        };
        assert!(header.is_response());
        assert_eq!(header.opcode(), 2);
        assert_eq!(header.rcode(), 3);
        assert!(!header.truncated());
    }

    mod generated {
        use std::collections::BTreeSet;
        use std::net::{Ipv4Addr, Ipv6Addr};

        use quickcheck::{Arbitrary, Gen};
        use quickcheck_macros::quickcheck;

        use super::*;

        const LABELS: &[&[u8]] = &[
            b"local", b"_tcp", b"_udp", b"_ipp", b"_http", b"printer", b"Host", b"my.printer",
        ];
        const NSEC_TYPES: &[u16] = &[1, 5, 12, 16, 28, 33, 47, 99, 255, 256, 1234, 65535];
        const OPAQUE_TYPES: &[u16] = &[13, 99, 260, 65280];

        #[derive(Debug, Clone)]
        struct WireMessage(Message);

        fn upto(g: &mut Gen, max: usize) -> usize {
            usize::arbitrary(g) % (max + 1)
        }

        fn pick<T: Copy>(g: &mut Gen, items: &[T]) -> T {
            *g.choose(items).unwrap()
        }

        fn bytes(g: &mut Gen, max: usize) -> Vec<u8> {
            (0..upto(g, max)).map(|_| u8::arbitrary(g)).collect()
        }

        fn name(g: &mut Gen) -> Name {
            let labels = (0..1 + upto(g, 3)).map(|_| pick(g, LABELS).to_vec()).collect();
            Name::from_labels(labels).unwrap()
        }

        fn data(g: &mut Gen) -> RecordData {
            match upto(g, 7) {
                0 => RecordData::A(Ipv4Addr::from(u32::arbitrary(g))),
                1 => RecordData::Aaaa(Ipv6Addr::from(u128::arbitrary(g))),
                2 => RecordData::Ptr(name(g)),
                3 => RecordData::Cname(name(g)),
                4 => RecordData::Srv {
                    priority: u16::arbitrary(g),
                    weight: u16::arbitrary(g),
                    port: u16::arbitrary(g),
                    target: name(g),
                },
                5 => RecordData::Txt((0..1 + upto(g, 3)).map(|_| bytes(g, 20)).collect()),
                6 => RecordData::Nsec {
                    next: name(g),
                    types: (0..upto(g, 6))
                        .map(|_| RecordType::from_u16(pick(g, NSEC_TYPES)))
                        .collect::<BTreeSet<_>>(),
                },
                _ => RecordData::Unknown {
                    rtype: pick(g, OPAQUE_TYPES),
                    data: bytes(g, 30),
                },
            }
        }

        fn record(g: &mut Gen) -> ResourceRecord {
            ResourceRecord {
                name: name(g),
                rclass: u16::arbitrary(g) & 0x7FFF,
                cache_flush: bool::arbitrary(g),
                ttl: u32::arbitrary(g),
                data: data(g),
            }
        }

        fn records(g: &mut Gen) -> Vec<ResourceRecord> {
            (0..upto(g, 4)).map(|_| record(g)).collect()
        }

        impl Arbitrary for WireMessage {
            fn arbitrary(g: &mut Gen) -> Self {
                let questions = (0..upto(g, 3))
                    .map(|_| Question {
                        name: name(g),
                        qtype: RecordType::from_u16(u16::arbitrary(g)),
                        qclass: u16::arbitrary(g) & 0x7FFF,
                        unicast_response: bool::arbitrary(g),
                    })
                    .collect();
                Self(Message {
                    header: Header {
                        id: u16::arbitrary(g),
                        flags: u16::arbitrary(g),
                    },
                    questions,
                    answers: records(g),
                    authorities: records(g),
                    additionals: records(g),
                })
            }
        }

        #[quickcheck]
        fn test_decode_inverts_encode(message: WireMessage) {
            let bytes = message.0.encode(MAX_MESSAGE_SIZE).unwrap();
            assert_eq!(Message::decode(&bytes), Ok(message.0));
        }
    }
}
