#![no_std]

//! Types and packet-processing logic shared between the kernel programs and
//! the userspace agent.
//!
//! Everything in this crate is allocation-free and bounded: it is linked into
//! the eBPF object as well as into the userspace datapath and its tests.

#[cfg(any(test, feature = "user"))]
extern crate std;

pub mod checksum;
pub mod hooks;
pub mod wire;

pub use hooks::{
    CapacityExceeded, ConnTrack, EmitError, EventSink, Observation, Observer, RedirectConfig,
    Redirector, Restorer, Verdict,
};

/// Maximum number of concurrent connection-track entries.
pub const CONN_TRACK_CAPACITY: u32 = 1024;

/// Differentiated-services byte stamped on every rewritten datagram
/// (class selector 7 shifted into the DSCP field).
pub const DSCP_MARKER: u8 = 7 << 2;

/// Default redirect target, 10.0.1.1, in host byte order.
pub const DEFAULT_SENTINEL: u32 = u32::from_be_bytes([10, 0, 1, 1]);

/// Size of the shared ring buffer carrying [`ObservedPacket`] records.
pub const RING_BYTE_SIZE: u32 = 1 << 24;

/// One side of a connection: an IPv4 address and a TCP port.
///
/// Used both as key and value of the connection-track table. The address is
/// kept in host byte order; the port is kept exactly as it appears on the
/// wire (network byte order) so it can be written back without conversion.
/// Equality is bitwise over both fields.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct TwoTuple {
    pub addr: u32,
    pub port: u16,
    pub _pad: u16,
}

impl TwoTuple {
    /// Builds a tuple from raw header bytes.
    #[inline(always)]
    pub const fn from_wire(addr: [u8; 4], port: [u8; 2]) -> Self {
        Self {
            addr: u32::from_be_bytes(addr),
            port: u16::from_ne_bytes(port),
            _pad: 0,
        }
    }

    /// Builds a tuple from a host-order address and a host-order port.
    #[inline(always)]
    pub const fn new(addr: u32, port: u16) -> Self {
        Self {
            addr,
            port: port.to_be(),
            _pad: 0,
        }
    }

    /// Port in host byte order.
    #[inline(always)]
    pub const fn host_port(&self) -> u16 {
        u16::from_be(self.port)
    }

    /// Address bytes as they appear on the wire.
    #[inline(always)]
    pub const fn addr_bytes(&self) -> [u8; 4] {
        self.addr.to_be_bytes()
    }

    /// Port bytes as they appear on the wire.
    #[inline(always)]
    pub const fn port_bytes(&self) -> [u8; 2] {
        self.port.to_ne_bytes()
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for TwoTuple {}

/// Transport protocol tag carried by [`ObservedPacket`].
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub enum TransportProto {
    Tcp = 0,
    Udp = 1,
}

impl TransportProto {
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Tcp),
            1 => Some(Self::Udp),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
        }
    }
}

/// Packet metadata emitted by the observation hook.
///
/// Addresses and ports are in host byte order. Written field-by-field in the
/// kernel, so keep it `repr(C)` with explicit padding.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct ObservedPacket {
    pub src_addr: u32,
    pub dst_addr: u32,
    pub src_port: u16,
    pub dst_port: u16,
    /// A [`TransportProto`] discriminant.
    pub transport: u8,
    pub _pad: [u8; 3],
}

impl ObservedPacket {
    pub const fn new(
        src_addr: u32,
        dst_addr: u32,
        src_port: u16,
        dst_port: u16,
        transport: TransportProto,
    ) -> Self {
        Self {
            src_addr,
            dst_addr,
            src_port,
            dst_port,
            transport: transport as u8,
            _pad: [0; 3],
        }
    }

    pub const fn transport(&self) -> Option<TransportProto> {
        TransportProto::from_u8(self.transport)
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for ObservedPacket {}

/// Slots of the kernel `STATS` per-CPU counter array.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatIndex {
    Redirected = 0,
    Restored = 1,
    ConnTrackFull = 2,
    Observed = 3,
    ObservedLost = 4,
}

pub const STAT_COUNT: u32 = 5;

impl StatIndex {
    pub const ALL: [StatIndex; STAT_COUNT as usize] = [
        StatIndex::Redirected,
        StatIndex::Restored,
        StatIndex::ConnTrackFull,
        StatIndex::Observed,
        StatIndex::ObservedLost,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn shared_layouts() {
        assert_eq!(size_of::<TwoTuple>(), 8);
        assert_eq!(size_of::<ObservedPacket>(), 16);
    }

    #[test]
    fn two_tuple_keeps_wire_port() {
        let t = TwoTuple::from_wire([10, 0, 0, 5], [0x0f, 0xa0]);
        assert_eq!(t.addr, 0x0a00_0005);
        assert_eq!(t.host_port(), 4000);
        assert_eq!(t.port_bytes(), [0x0f, 0xa0]);
        assert_eq!(t, TwoTuple::new(0x0a00_0005, 4000));
    }

    #[test]
    fn default_sentinel_is_10_0_1_1() {
        assert_eq!(DEFAULT_SENTINEL.to_be_bytes(), [10, 0, 1, 1]);
        assert_eq!(DSCP_MARKER, 0x1c);
    }
}
