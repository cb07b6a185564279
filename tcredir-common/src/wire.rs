//! Bounds-checked, zero-copy views over Ethernet/IPv4/TCP/UDP headers.
//!
//! Every view is obtained through a length check against the end of the
//! frame, so reading a field can never go past the buffer. Mutable views
//! write straight through to the caller's buffer.

use core::fmt;

use crate::checksum;

pub const ETH_HDR_LEN: usize = 14;
pub const IPV4_MIN_HDR_LEN: usize = 20;
pub const IPV4_MAX_HDR_LEN: usize = 60;
pub const TCP_HDR_LEN: usize = 20;
pub const UDP_HDR_LEN: usize = 8;

pub const ETH_P_IP: u16 = 0x0800;
pub const ETH_P_IPV6: u16 = 0x86dd;

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// "More fragments" flag plus the 13-bit fragment offset.
pub const IP_FRAGMENT_MASK: u16 = 0x3fff;

pub const TCP_FLAG_SYN: u8 = 0x02;
pub const TCP_FLAG_ACK: u8 = 0x10;

const IPV4_CHECKSUM_OFFSET: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseError {
    /// The frame ends before the header being read.
    Truncated,
    /// The header is readable but describes something this code does not
    /// handle (wrong IP version, fragment, ...).
    Unsupported,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Truncated => f.write_str("truncated header"),
            ParseError::Unsupported => f.write_str("unsupported header"),
        }
    }
}

#[inline(always)]
fn bytes_at<const N: usize>(data: &[u8], offset: usize) -> Result<&[u8; N], ParseError> {
    let end = offset.checked_add(N).ok_or(ParseError::Truncated)?;
    data.get(offset..end)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(ParseError::Truncated)
}

#[inline(always)]
fn bytes_at_mut<const N: usize>(
    data: &mut [u8],
    offset: usize,
) -> Result<&mut [u8; N], ParseError> {
    let end = offset.checked_add(N).ok_or(ParseError::Truncated)?;
    data.get_mut(offset..end)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(ParseError::Truncated)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EtherType {
    Ipv4,
    Ipv6,
    Other(u16),
}

impl From<u16> for EtherType {
    fn from(value: u16) -> Self {
        match value {
            ETH_P_IP => EtherType::Ipv4,
            ETH_P_IPV6 => EtherType::Ipv6,
            other => EtherType::Other(other),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct EthernetHeader<'a> {
    bytes: &'a [u8; ETH_HDR_LEN],
}

impl<'a> EthernetHeader<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
        Ok(Self {
            bytes: bytes_at(data, 0)?,
        })
    }

    pub fn raw_ether_type(&self) -> u16 {
        u16::from_be_bytes([self.bytes[12], self.bytes[13]])
    }

    pub fn ether_type(&self) -> EtherType {
        EtherType::from(self.raw_ether_type())
    }
}

/// IPv4 header, options included. `bytes.len()` equals the IHL-declared
/// header length.
#[derive(Clone, Copy, Debug)]
pub struct Ipv4Header<'a> {
    bytes: &'a [u8],
}

/// Validates the fixed part of an IPv4 header at `offset` and returns the
/// IHL-declared header length.
#[inline(always)]
fn ipv4_header_len(data: &[u8], offset: usize) -> Result<usize, ParseError> {
    let fixed: &[u8; IPV4_MIN_HDR_LEN] = bytes_at(data, offset)?;
    if fixed[0] >> 4 != 4 {
        return Err(ParseError::Unsupported);
    }
    let header_len = ((fixed[0] & 0x0f) as usize) * 4;
    if header_len < IPV4_MIN_HDR_LEN {
        return Err(ParseError::Truncated);
    }
    if offset + header_len > data.len() {
        return Err(ParseError::Truncated);
    }
    Ok(header_len)
}

impl<'a> Ipv4Header<'a> {
    pub fn parse(data: &'a [u8], offset: usize) -> Result<Self, ParseError> {
        let header_len = ipv4_header_len(data, offset)?;
        Ok(Self {
            bytes: &data[offset..offset + header_len],
        })
    }

    pub fn header_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn tos(&self) -> u8 {
        self.bytes[1]
    }

    pub fn frag_off(&self) -> u16 {
        u16::from_be_bytes([self.bytes[6], self.bytes[7]])
    }

    /// True for any fragment: "more fragments" set or a non-zero offset.
    pub fn is_fragmented(&self) -> bool {
        self.frag_off() & IP_FRAGMENT_MASK != 0
    }

    pub fn protocol(&self) -> u8 {
        self.bytes[9]
    }

    pub fn src_bytes(&self) -> [u8; 4] {
        [self.bytes[12], self.bytes[13], self.bytes[14], self.bytes[15]]
    }

    pub fn dst_bytes(&self) -> [u8; 4] {
        [self.bytes[16], self.bytes[17], self.bytes[18], self.bytes[19]]
    }

    /// Source address in host byte order.
    pub fn src_addr(&self) -> u32 {
        u32::from_be_bytes(self.src_bytes())
    }

    /// Destination address in host byte order.
    pub fn dst_addr(&self) -> u32 {
        u32::from_be_bytes(self.dst_bytes())
    }

    pub fn checksum_valid(&self) -> bool {
        checksum::is_valid(self.bytes)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct TcpHeader<'a> {
    bytes: &'a [u8; TCP_HDR_LEN],
}

impl<'a> TcpHeader<'a> {
    pub fn parse(data: &'a [u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            bytes: bytes_at(data, offset)?,
        })
    }

    pub fn src_port_bytes(&self) -> [u8; 2] {
        [self.bytes[0], self.bytes[1]]
    }

    pub fn dst_port_bytes(&self) -> [u8; 2] {
        [self.bytes[2], self.bytes[3]]
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes(self.src_port_bytes())
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes(self.dst_port_bytes())
    }

    pub fn flags(&self) -> u8 {
        self.bytes[13]
    }

    pub fn is_ack(&self) -> bool {
        self.flags() & TCP_FLAG_ACK != 0
    }

    pub fn is_syn(&self) -> bool {
        self.flags() & TCP_FLAG_SYN != 0
    }
}

#[derive(Clone, Copy, Debug)]
pub struct UdpHeader<'a> {
    bytes: &'a [u8; UDP_HDR_LEN],
}

impl<'a> UdpHeader<'a> {
    pub fn parse(data: &'a [u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            bytes: bytes_at(data, offset)?,
        })
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.bytes[0], self.bytes[1]])
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.bytes[2], self.bytes[3]])
    }
}

/// Read-only view over one frame.
#[derive(Clone, Copy, Debug)]
pub struct PacketView<'a> {
    data: &'a [u8],
}

impl<'a> PacketView<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn ethernet(&self) -> Result<EthernetHeader<'a>, ParseError> {
        EthernetHeader::parse(self.data)
    }

    /// IPv4 header following the Ethernet header. The EtherType is not
    /// consulted; callers classify the frame first.
    pub fn ipv4(&self) -> Result<Ipv4Header<'a>, ParseError> {
        Ipv4Header::parse(self.data, ETH_HDR_LEN)
    }

    pub fn tcp(&self, ip: &Ipv4Header<'_>) -> Result<TcpHeader<'a>, ParseError> {
        TcpHeader::parse(self.data, ETH_HDR_LEN + ip.header_len())
    }

    pub fn udp(&self, ip: &Ipv4Header<'_>) -> Result<UdpHeader<'a>, ParseError> {
        UdpHeader::parse(self.data, ETH_HDR_LEN + ip.header_len())
    }
}

/// Mutable IPv4 header. Setters leave the checksum stale until
/// [`Ipv4HeaderMut::update_checksum`] is called.
#[derive(Debug)]
pub struct Ipv4HeaderMut<'a> {
    bytes: &'a mut [u8],
}

impl<'a> Ipv4HeaderMut<'a> {
    pub fn set_tos(&mut self, tos: u8) {
        self.bytes[1] = tos;
    }

    pub fn set_src_addr(&mut self, addr: u32) {
        self.bytes[12..16].copy_from_slice(&addr.to_be_bytes());
    }

    pub fn set_dst_addr(&mut self, addr: u32) {
        self.bytes[16..20].copy_from_slice(&addr.to_be_bytes());
    }

    /// Zeroes the checksum field, then recomputes it over the whole header.
    pub fn update_checksum(&mut self) {
        self.bytes[IPV4_CHECKSUM_OFFSET] = 0;
        self.bytes[IPV4_CHECKSUM_OFFSET + 1] = 0;
        let sum = checksum::checksum(self.bytes);
        self.bytes[IPV4_CHECKSUM_OFFSET..IPV4_CHECKSUM_OFFSET + 2]
            .copy_from_slice(&sum.to_be_bytes());
    }
}

#[derive(Debug)]
pub struct TcpHeaderMut<'a> {
    bytes: &'a mut [u8; TCP_HDR_LEN],
}

impl<'a> TcpHeaderMut<'a> {
    pub fn set_src_port_bytes(&mut self, port: [u8; 2]) {
        self.bytes[0..2].copy_from_slice(&port);
    }
}

/// Mutable view over one caller-owned frame.
#[derive(Debug)]
pub struct PacketViewMut<'a> {
    data: &'a mut [u8],
}

impl<'a> PacketViewMut<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data }
    }

    /// Splits the frame into its IPv4 and TCP headers. Performs the same
    /// bounds checks as the read path.
    pub fn ipv4_tcp(&mut self) -> Result<(Ipv4HeaderMut<'_>, TcpHeaderMut<'_>), ParseError> {
        let header_len = ipv4_header_len(&*self.data, ETH_HDR_LEN)?;
        let l3 = self
            .data
            .get_mut(ETH_HDR_LEN..)
            .ok_or(ParseError::Truncated)?;
        let (ip, rest) = l3.split_at_mut(header_len);
        let tcp = bytes_at_mut::<TCP_HDR_LEN>(rest, 0)?;
        Ok((Ipv4HeaderMut { bytes: ip }, TcpHeaderMut { bytes: tcp }))
    }
}

/// Writes test frames: Ethernet + option-less IPv4 + TCP or UDP.
#[cfg(any(test, feature = "user"))]
#[derive(Clone, Copy, Debug)]
pub struct FrameBuilder {
    pub ether_type: u16,
    pub src_addr: u32,
    pub dst_addr: u32,
    pub protocol: u8,
    pub src_port: u16,
    pub dst_port: u16,
    pub tcp_flags: u8,
    pub frag_off: u16,
    pub tos: u8,
}

#[cfg(any(test, feature = "user"))]
impl FrameBuilder {
    pub const fn tcp(src_addr: u32, src_port: u16, dst_addr: u32, dst_port: u16) -> Self {
        Self {
            ether_type: ETH_P_IP,
            src_addr,
            dst_addr,
            protocol: IPPROTO_TCP,
            src_port,
            dst_port,
            tcp_flags: TCP_FLAG_SYN,
            frag_off: 0,
            tos: 0,
        }
    }

    pub const fn udp(src_addr: u32, src_port: u16, dst_addr: u32, dst_port: u16) -> Self {
        Self {
            protocol: IPPROTO_UDP,
            tcp_flags: 0,
            ..Self::tcp(src_addr, src_port, dst_addr, dst_port)
        }
    }

    pub const fn flags(self, tcp_flags: u8) -> Self {
        Self { tcp_flags, ..self }
    }

    pub const fn fragment(self, frag_off: u16) -> Self {
        Self { frag_off, ..self }
    }

    pub const fn ether_type(self, ether_type: u16) -> Self {
        Self { ether_type, ..self }
    }

    pub const fn protocol(self, protocol: u8) -> Self {
        Self { protocol, ..self }
    }

    /// Length of the frame produced by [`FrameBuilder::write`].
    pub const fn frame_len(&self) -> usize {
        ETH_HDR_LEN
            + IPV4_MIN_HDR_LEN
            + match self.protocol {
                IPPROTO_UDP => UDP_HDR_LEN,
                _ => TCP_HDR_LEN,
            }
    }

    /// Writes the frame into `out` and returns its length. The IPv4
    /// checksum is valid; transport checksums are left zero.
    pub fn write(&self, out: &mut [u8]) -> Result<usize, ParseError> {
        let len = self.frame_len();
        let frame = out.get_mut(..len).ok_or(ParseError::Truncated)?;
        frame.fill(0);

        frame[0..6].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x02]);
        frame[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x01]);
        frame[12..14].copy_from_slice(&self.ether_type.to_be_bytes());

        let ip_len = (len - ETH_HDR_LEN) as u16;
        let ip = &mut frame[ETH_HDR_LEN..ETH_HDR_LEN + IPV4_MIN_HDR_LEN];
        ip[0] = 0x45;
        ip[1] = self.tos;
        ip[2..4].copy_from_slice(&ip_len.to_be_bytes());
        ip[6..8].copy_from_slice(&self.frag_off.to_be_bytes());
        ip[8] = 64;
        ip[9] = self.protocol;
        ip[12..16].copy_from_slice(&self.src_addr.to_be_bytes());
        ip[16..20].copy_from_slice(&self.dst_addr.to_be_bytes());
        let sum = checksum::checksum(ip);
        ip[10..12].copy_from_slice(&sum.to_be_bytes());

        let l4 = &mut frame[ETH_HDR_LEN + IPV4_MIN_HDR_LEN..];
        l4[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        l4[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        if self.protocol == IPPROTO_UDP {
            l4[4..6].copy_from_slice(&(UDP_HDR_LEN as u16).to_be_bytes());
        } else {
            l4[12] = 5 << 4;
            l4[13] = self.tcp_flags;
            l4[14..16].copy_from_slice(&64240u16.to_be_bytes());
        }
        Ok(len)
    }
}
