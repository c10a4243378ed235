use alloc::string::String;
use core::fmt;

use crate::endpoint::EndpointRecord;

pub type TransportResult<T> = core::result::Result<T, TransportError>;

/// Failure category reported by a [`UsbTransport`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// NAK retries exhausted or the transfer timed out.
    Timeout,
    /// Endpoint returned STALL.
    Stall,
    Disconnected,
    Protocol,
    Unsupported,
    NotReady,
    Other,
}

/// Error surfaced by [`UsbTransport`] implementations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportError {
    kind: TransportErrorKind,
    message: Option<String>,
}

impl TransportError {
    pub const fn new(kind: TransportErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    pub fn with_message(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{:?}: {}", self.kind, msg),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for TransportError {}

/// Host-side USB primitives the MIDI class driver is built on.
///
/// Every call blocks until the transfer completes or the implementation gives up. Timeout and
/// NAK policy belong to the implementation; the driver never retries on its own.
pub trait UsbTransport {
    /// Whether the address-0 pseudo device and its endpoint record are available for probing.
    fn default_device_ready(&mut self, low_speed: bool) -> bool;

    /// Read the standard device descriptor of the device at `address` into `buf`.
    fn fetch_device_descriptor(&mut self, address: u8, buf: &mut [u8]) -> TransportResult<usize>;

    /// Read `buf.len()` bytes of configuration descriptor `config_index`.
    fn fetch_config_descriptor(
        &mut self,
        address: u8,
        config_index: u8,
        buf: &mut [u8],
    ) -> TransportResult<usize>;

    /// Take an address from the pool for a device hanging off `parent`/`port`.
    fn allocate_address(&mut self, parent: u8, low_speed: bool, port: u8) -> TransportResult<u8>;

    fn free_address(&mut self, address: u8);

    /// Move the device currently at address 0 to `address`.
    fn set_address(&mut self, address: u8) -> TransportResult<()>;

    /// Register the endpoint records the host should use for `address`.
    ///
    /// `records[0]` is always the control endpoint.
    fn bind_endpoints(&mut self, address: u8, records: &[EndpointRecord]) -> TransportResult<()>;

    fn set_configuration(&mut self, address: u8, configuration: u8) -> TransportResult<()>;

    /// Bulk IN transfer of at most `buf.len()` bytes from `endpoint` (number only, no direction bit).
    fn transfer_in(&mut self, address: u8, endpoint: u8, buf: &mut [u8]) -> TransportResult<usize>;

    /// Bulk OUT transfer of `data` to `endpoint` (number only, no direction bit).
    fn transfer_out(&mut self, address: u8, endpoint: u8, data: &[u8]) -> TransportResult<()>;
}
