//! Update server wire protocol.
//!
//! The client speaks an XML request/response protocol: one POST per update
//! check or event, one XML document each way. This module is split along
//! the data flow:
//!
//! - [`request`] - parameters and XML assembly for outgoing requests
//! - [`parser`] - hardened parsing of incoming response documents
//! - [`response`] - the parsed, typed result handed to the decision logic
//!
//! Parsing is strict: external entity declarations are rejected outright,
//! and malformed or empty documents map to distinct error codes so the
//! server can tell transport flakiness from protocol breakage.

pub mod parser;
pub mod request;
pub mod response;

pub use parser::{parse_response, ParseError};
pub use request::{EventResult, EventType, RequestParams};
pub use response::{Package, Response, RollbackKeyVersions};
