//! The card transport seam
//!
//! A [`CardTransport`] is one live connection to a card: it can exchange raw
//! APDUs, send vendor control commands to the reader, and take exclusive use
//! of the channel around multi-step operations. A [`ReaderConnector`]
//! enumerates readers and opens transports. Both are implemented by a real
//! backend (PC/SC) outside this workspace; [`MockTransport`] implements the
//! trait over scripted responses for tests.

use std::collections::VecDeque;
use std::fmt;

use bytes::Bytes;
use tracing::trace;

use crate::command::Command;
use crate::response::Response;

/// Transport-level errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to connect to a reader
    #[error("connection failed: {0}")]
    Connection(String),

    /// Failed to transmit an APDU
    #[error("transmission failed: {0}")]
    Transmission(String),

    /// A vendor control command failed
    #[error("control command failed: {0}")]
    Control(String),

    /// Exclusive access could not be acquired or released
    #[error("exclusive access failed: {0}")]
    Exclusivity(String),

    /// The card was reset or removed mid-operation
    #[error("card disconnected")]
    Disconnected,

    /// A command buffer was structurally invalid
    #[error("invalid command length: {0}")]
    InvalidCommandLength(usize),

    /// A response was too short to carry a status word
    #[error("invalid response length: {0}")]
    InvalidResponseLength(usize),
}

/// One live connection to a smart card
pub trait CardTransport: Send + fmt::Debug {
    /// Transmit raw APDU bytes and return the raw response (payload + status word)
    fn transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError>;

    /// Send a vendor control command to the reader itself
    fn send_control(&mut self, control_code: u32, payload: &[u8]) -> Result<Bytes, TransportError>;

    /// Take exclusive use of the channel
    fn begin_exclusive(&mut self) -> Result<(), TransportError>;

    /// Release exclusive use of the channel
    fn end_exclusive(&mut self) -> Result<(), TransportError>;

    /// The card's answer-to-reset
    fn atr(&self) -> &[u8];

    /// The OS-level display name of the reader holding the card
    fn reader_name(&self) -> &str;

    /// Transmit a [`Command`] and parse the result into a [`Response`]
    fn transmit(&mut self, command: &Command) -> Result<Response, TransportError> {
        let bytes = command.to_bytes();
        trace!(command = %hex::encode(&bytes), "transmitting command");
        let raw = self.transmit_raw(&bytes)?;
        trace!(response = %hex::encode(&raw), "received response");
        Response::from_bytes(&raw)
    }
}

/// Snapshot of one reader's state at enumeration time
#[derive(Debug, Clone)]
pub struct ReaderStatus {
    name: String,
    has_card: bool,
    atr: Option<Vec<u8>>,
}

impl ReaderStatus {
    /// Create a new reader status snapshot
    pub const fn new(name: String, has_card: bool, atr: Option<Vec<u8>>) -> Self {
        Self {
            name,
            has_card,
            atr,
        }
    }

    /// Get the reader name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if a card is present in the reader
    pub const fn has_card(&self) -> bool {
        self.has_card
    }

    /// Get the ATR of the card if present
    pub fn atr(&self) -> Option<&[u8]> {
        self.atr.as_deref()
    }
}

/// Reader enumeration and connection
pub trait ReaderConnector {
    /// The transport type produced by [`connect`](Self::connect)
    type Transport: CardTransport;

    /// List all readers known to the backend
    fn list_readers(&self) -> Result<Vec<ReaderStatus>, TransportError>;

    /// Connect to the named reader
    fn connect(&self, reader_name: &str) -> Result<Self::Transport, TransportError>;
}

/// Scripted transport for tests
///
/// Responses are served from a queue; when the queue is empty the default
/// response (if set) is returned. Every transmitted command and control
/// payload is recorded for assertion.
#[derive(Debug, Default)]
pub struct MockTransport {
    name: String,
    atr: Vec<u8>,
    responses: VecDeque<Bytes>,
    default_response: Option<Bytes>,
    control_responses: VecDeque<Bytes>,
    /// Commands transmitted so far, in order
    pub commands: Vec<Vec<u8>>,
    /// Control payloads sent so far, as (code, payload) pairs
    pub control_commands: Vec<(u32, Vec<u8>)>,
    /// Number of `begin_exclusive` calls
    pub begin_exclusive_calls: usize,
    /// Number of `end_exclusive` calls
    pub end_exclusive_calls: usize,
}

impl MockTransport {
    /// Create a mock with a reader name and ATR
    pub fn new(name: impl Into<String>, atr: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            atr,
            ..Self::default()
        }
    }

    /// Create a mock that always answers with the given bytes
    pub fn with_response(response: Bytes) -> Self {
        Self {
            default_response: Some(response),
            ..Self::default()
        }
    }

    /// Set the default response returned once the queue is exhausted
    pub fn set_default_response(&mut self, response: Bytes) {
        self.default_response = Some(response);
    }

    /// Queue the next transmit response
    pub fn push_response(&mut self, response: impl Into<Bytes>) {
        self.responses.push_back(response.into());
    }

    /// Queue the next control response
    pub fn push_control_response(&mut self, response: impl Into<Bytes>) {
        self.control_responses.push_back(response.into());
    }
}

impl CardTransport for MockTransport {
    fn transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
        self.commands.push(command.to_vec());
        match self.responses.pop_front() {
            Some(response) => Ok(response),
            None => self
                .default_response
                .clone()
                .ok_or_else(|| TransportError::Transmission("unscripted command".to_string())),
        }
    }

    fn send_control(&mut self, control_code: u32, payload: &[u8]) -> Result<Bytes, TransportError> {
        self.control_commands.push((control_code, payload.to_vec()));
        Ok(self.control_responses.pop_front().unwrap_or_default())
    }

    fn begin_exclusive(&mut self) -> Result<(), TransportError> {
        self.begin_exclusive_calls += 1;
        Ok(())
    }

    fn end_exclusive(&mut self) -> Result<(), TransportError> {
        self.end_exclusive_calls += 1;
        Ok(())
    }

    fn atr(&self) -> &[u8] {
        &self.atr
    }

    fn reader_name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_transport_scripting() {
        let mut transport = MockTransport::new("Mock Reader", vec![0x3B, 0x00]);
        transport.push_response(Bytes::from_static(&[0x90, 0x00]));
        transport.set_default_response(Bytes::from_static(&[0x6A, 0x82]));

        let first = transport.transmit_raw(&[0x00, 0xA4, 0x04, 0x00]).unwrap();
        assert_eq!(first.as_ref(), &[0x90, 0x00]);

        let second = transport.transmit_raw(&[0x00, 0xB0, 0x00, 0x00]).unwrap();
        assert_eq!(second.as_ref(), &[0x6A, 0x82]);

        assert_eq!(transport.commands.len(), 2);
        assert_eq!(transport.reader_name(), "Mock Reader");
        assert_eq!(transport.atr(), &[0x3B, 0x00]);
    }

    #[test]
    fn test_mock_transport_control() {
        let mut transport = MockTransport::new("Mock Reader", vec![]);
        // Unscripted control commands answer with an empty payload
        let empty = transport.send_control(0x42000D48, &[]).unwrap();
        assert!(empty.is_empty());

        transport.push_control_response(Bytes::from_static(&[0x06, 0x04, 0x00, 0x31, 0x35, 0x01]));
        let features = transport.send_control(0x42000D48, &[]).unwrap();
        assert_eq!(features.len(), 6);
        assert_eq!(transport.control_commands.len(), 2);
    }
}
