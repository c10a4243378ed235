#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod descriptor;
pub mod endpoint;
pub mod error;
pub mod packet;
pub mod session;
pub mod transport;

pub use descriptor::{DeviceDescriptor, DiscoveryState, ScanReport, scan_configuration};
pub use endpoint::{EndpointRecord, EndpointRole, EndpointTable};
pub use error::{MidiError, MidiErrorKind, MidiResult};
pub use packet::{
    Cin, SysexPackets, USB_MIDI_PACKET_LEN, UsbMidiPacket, decode, encode_short, encode_sysex,
};
pub use session::{MidiSession, SessionConfig, SessionState};
pub use transport::{TransportError, TransportErrorKind, TransportResult, UsbTransport};
