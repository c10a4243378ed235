/// Max packet size assumed for the control endpoint until the device descriptor is read.
pub const DEFAULT_CONTROL_PACKET_SIZE: u16 = 8;

/// Logical data endpoint roles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EndpointRole {
    MidiIn,
    MidiOut,
    FallbackIn,
    FallbackOut,
}

impl EndpointRole {
    pub const ALL: [EndpointRole; 4] = [
        EndpointRole::MidiIn,
        EndpointRole::MidiOut,
        EndpointRole::FallbackIn,
        EndpointRole::FallbackOut,
    ];

    pub fn is_in(self) -> bool {
        matches!(self, EndpointRole::MidiIn | EndpointRole::FallbackIn)
    }

    fn slot(self) -> usize {
        match self {
            EndpointRole::MidiIn => 0,
            EndpointRole::MidiOut => 1,
            EndpointRole::FallbackIn => 2,
            EndpointRole::FallbackOut => 3,
        }
    }
}

/// Physical endpoint behind a role. Address 0 means not discovered yet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EndpointRecord {
    /// Endpoint number, low 4 bits only.
    pub address: u8,
    pub max_packet_size: u16,
}

impl EndpointRecord {
    pub const fn new(address: u8, max_packet_size: u16) -> Self {
        Self {
            address: address & 0x0F,
            max_packet_size,
        }
    }

    pub fn is_discovered(&self) -> bool {
        self.address != 0
    }
}

/// Per-session registry of the control endpoint and the four data roles.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointTable {
    control: EndpointRecord,
    roles: [EndpointRecord; 4],
}

impl Default for EndpointTable {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointTable {
    pub const fn new() -> Self {
        Self {
            control: EndpointRecord::new(0, DEFAULT_CONTROL_PACKET_SIZE),
            roles: [EndpointRecord::new(0, 0); 4],
        }
    }

    pub fn get(&self, role: EndpointRole) -> EndpointRecord {
        self.roles[role.slot()]
    }

    pub fn set(&mut self, role: EndpointRole, address: u8, max_packet_size: u16) {
        self.roles[role.slot()] = EndpointRecord::new(address, max_packet_size);
    }

    pub fn control(&self) -> EndpointRecord {
        self.control
    }

    pub fn set_control_packet_size(&mut self, max_packet_size: u16) {
        self.control.max_packet_size = max_packet_size;
    }

    /// Copy the fallback bulk pair into the MIDI roles the codec addresses.
    pub fn promote_fallback(&mut self) {
        self.roles[EndpointRole::MidiIn.slot()] = self.get(EndpointRole::FallbackIn);
        self.roles[EndpointRole::MidiOut.slot()] = self.get(EndpointRole::FallbackOut);
    }

    /// Control record followed by the data records in role order, truncated to `count` entries.
    pub fn records(&self, count: usize) -> ([EndpointRecord; 5], usize) {
        let mut out = [self.control; 5];
        out[1..].copy_from_slice(&self.roles);
        (out, count.min(out.len()))
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}
