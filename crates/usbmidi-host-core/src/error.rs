use alloc::string::{String, ToString};
use core::fmt;

use crate::transport::{TransportError, TransportErrorKind};

/// Failure categories of the MIDI class driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MidiErrorKind {
    AddressPoolExhausted,
    AddressAlreadyBound,
    EndpointInfoMissing,
    /// A transport call failed; carries the transport's failure code.
    Transport(TransportErrorKind),
    /// No configuration with usable bulk endpoints was found.
    DeviceNotFound,
    /// Zero-length, non-advancing or truncated descriptor header.
    MalformedDescriptor,
    /// Send/receive issued before the session reached Ready.
    NotReady,
    InvalidMessage,
}

/// Errors surfaced by the MIDI class driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MidiError {
    kind: MidiErrorKind,
    message: Option<String>,
}

impl MidiError {
    pub const fn new(kind: MidiErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    pub fn with_message(kind: MidiErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn kind(&self) -> MidiErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Self::with_message(MidiErrorKind::MalformedDescriptor, message)
    }

    pub(crate) fn invalid_message(message: impl Into<String>) -> Self {
        Self::with_message(MidiErrorKind::InvalidMessage, message)
    }
}

impl fmt::Display for MidiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{:?}: {}", self.kind, msg),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for MidiError {}

impl From<TransportError> for MidiError {
    fn from(err: TransportError) -> Self {
        MidiError::with_message(MidiErrorKind::Transport(err.kind()), err.to_string())
    }
}

pub type MidiResult<T> = core::result::Result<T, MidiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_keep_their_kind() {
        let err: MidiError =
            TransportError::with_message(TransportErrorKind::Stall, "bulk-out").into();
        assert_eq!(err.kind(), MidiErrorKind::Transport(TransportErrorKind::Stall));
        assert_eq!(err.message(), Some("Stall: bulk-out"));
    }
}
