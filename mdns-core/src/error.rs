use std::io;
use std::net::{IpAddr, SocketAddr};

use thiserror::Error;

use crate::wire::{Name, RecordType};

/// Malformed or truncated wire data. The whole message is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("buffer truncated at offset {offset}")]
    BufferTruncated { offset: usize },
    #[error("name exceeds 255 bytes")]
    NameTooLong,
    #[error("compression pointer at offset {offset} does not point backward")]
    PointerCycle { offset: usize },
    #[error("unsupported label type 0x{byte:02x} at offset {offset}")]
    InvalidLabelType { offset: usize, byte: u8 },
    #[error("{rtype} record data is {declared} bytes but {parsed} were parsed")]
    RdataLength {
        rtype: RecordType,
        declared: usize,
        parsed: usize,
    },
    #[error("{remaining} unexpected bytes after the last section")]
    TrailingData { remaining: usize },
}

/// A message that cannot be serialized into the given buffer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("message does not fit in {capacity} bytes")]
    BufferFull { capacity: usize },
    #[error("record data of {0} bytes exceeds 65535")]
    RdataTooLong(usize),
    #[error("TXT string of {0} bytes exceeds 255")]
    TxtStringTooLong(usize),
    #[error("section holds {0} entries, more than a header can count")]
    TooManyRecords(usize),
    #[error("{0} record data must use its own variant, not opaque bytes")]
    OpaqueStructuredType(RecordType),
}

/// Invalid textual domain name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("empty label in {0:?}")]
    EmptyLabel(String),
    #[error("label of {0} bytes exceeds 63")]
    LabelTooLong(usize),
    #[error("name of {0} encoded bytes exceeds 255")]
    NameTooLong(usize),
    #[error("dangling escape in {0:?}")]
    DanglingEscape(String),
}

/// Socket bind/join/send failures. Surfaced at the call that triggered them.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind socket on {interface}: {source}")]
    Bind {
        interface: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to join {group} on {interface}: {source}")]
    Join {
        interface: String,
        group: IpAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to send to {destination}: {source}")]
    Send {
        destination: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to receive on {interface}: {source}")]
    Receive {
        interface: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to enumerate network interfaces: {0}")]
    Interfaces(String),
    #[error("no usable network interface")]
    NoInterfaces,
}

/// Terminal outcome of a resolve that did not produce an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("no complete answer within the retry budget")]
    Timeout,
    #[error("the instance said goodbye")]
    NotFound,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Name(#[from] NameError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("name conflict for {0}")]
    NameConflict(Name),
    #[error("unknown handle")]
    UnknownHandle,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
