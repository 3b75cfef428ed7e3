//! Multicast DNS (RFC 6762) and DNS service discovery (RFC 6763).
//!
//! The [`Engine`] is single-threaded and non-blocking. Drive it either with
//! [`Engine::poll`] after [`Engine::bind`], or without sockets by feeding
//! received datagrams to [`Engine::handle_datagram`] and sending what
//! [`Engine::tick`] returns.

pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod query;
pub mod responder;
pub mod transport;
pub mod wire;

pub use config::EngineConfig;
pub use discovery::{
    service_type_name, BrowseHandle, ResolveHandle, ServiceEvent, ServiceInstance,
    SERVICE_TYPE_ENUMERATION,
};
pub use engine::{Engine, Event, ServiceSpec};
pub use error::{Error, ResolveError, Result};
pub use query::{AnswerChange, QueryHandle, QueryMode};
pub use responder::{RegistrationHandle, RegistrationState};
pub use transport::{list_interfaces, Destination, Interface, InterfaceAddr, Outgoing};
pub use wire::{Name, RecordData, RecordType, ResourceRecord, TxtProperty};
