//! APDU types and the card transport seam for the citizencard engine
//!
//! This crate provides the foundational pieces for talking to a smart card
//! according to ISO/IEC 7816-4:
//!
//! - Building and parsing APDU commands and responses
//! - Status word interpretation
//! - The [`CardTransport`] trait that reader backends implement (transmit,
//!   vendor control commands, exclusive access)
//! - The [`ReaderConnector`] trait for enumerating readers and connecting
//!
//! No concrete reader backend lives here; a PC/SC (or test) implementation of
//! [`CardTransport`] is supplied by the caller. A scripted [`MockTransport`]
//! is included for driving the engine in tests.

#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

// Re-export bytes for convenience
pub use bytes::{Bytes, BytesMut};

pub mod command;
pub mod response;
pub mod transport;

pub use command::Command;
pub use response::status;
pub use response::{Response, StatusWord};
pub use transport::{CardTransport, MockTransport, ReaderConnector, ReaderStatus, TransportError};

/// Prelude module containing commonly used traits and types
pub mod prelude {
    pub use crate::command::Command;
    pub use crate::response::status;
    pub use crate::response::{Response, StatusWord};
    pub use crate::transport::{CardTransport, ReaderConnector, ReaderStatus, TransportError};
    pub use crate::{Bytes, BytesMut};
}
