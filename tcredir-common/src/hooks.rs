//! The three per-packet hooks: observation, inbound redirect and outbound
//! restore.
//!
//! Each hook runs to completion over one caller-owned frame and resolves to
//! a [`Verdict`]. None of them allocates, blocks or loops over the payload.

use core::fmt;

use crate::wire::{
    EtherType, Ipv4Header, PacketView, PacketViewMut, TcpHeader, IPPROTO_TCP, IPPROTO_UDP,
};
use crate::{ObservedPacket, TransportProto, TwoTuple, DEFAULT_SENTINEL, DSCP_MARKER};

/// Final disposition of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Drop,
}

/// Returned by [`ConnTrack::insert`] when a new key does not fit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CapacityExceeded;

impl fmt::Display for CapacityExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("connection-track table is full")
    }
}

/// Shared client-tuple -> original-server-tuple table.
///
/// Implementations must be safe to call from many execution contexts at
/// once: a lookup never observes a half-written value, and an insert of an
/// existing key replaces its value.
pub trait ConnTrack {
    fn lookup(&self, key: &TwoTuple) -> Option<TwoTuple>;

    fn insert(&self, key: TwoTuple, value: TwoTuple) -> Result<(), CapacityExceeded>;
}

impl<T: ConnTrack + ?Sized> ConnTrack for &T {
    fn lookup(&self, key: &TwoTuple) -> Option<TwoTuple> {
        (**self).lookup(key)
    }

    fn insert(&self, key: TwoTuple, value: TwoTuple) -> Result<(), CapacityExceeded> {
        (**self).insert(key, value)
    }
}

#[cfg(feature = "user")]
impl<T: ConnTrack + ?Sized> ConnTrack for std::sync::Arc<T> {
    fn lookup(&self, key: &TwoTuple) -> Option<TwoTuple> {
        (**self).lookup(key)
    }

    fn insert(&self, key: TwoTuple, value: TwoTuple) -> Result<(), CapacityExceeded> {
        (**self).insert(key, value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmitError {
    /// The channel has no room; the record is lost.
    Full,
    /// Nobody drains the channel any more.
    Closed,
}

impl fmt::Display for EmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmitError::Full => f.write_str("event channel is full"),
            EmitError::Closed => f.write_str("event channel is closed"),
        }
    }
}

/// Destination for [`ObservedPacket`] records. Must not block.
pub trait EventSink {
    fn emit(&self, event: ObservedPacket) -> Result<(), EmitError>;
}

impl<S: EventSink + ?Sized> EventSink for &S {
    fn emit(&self, event: ObservedPacket) -> Result<(), EmitError> {
        (**self).emit(event)
    }
}

/// Outcome of inspecting a frame at the observation point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Observation {
    /// Malformed or fragmented: deny passage.
    Drop,
    /// Pass without emitting anything.
    Suppress,
    /// Pass and emit this record.
    Emit(ObservedPacket),
}

impl Observation {
    pub fn verdict(&self) -> Verdict {
        match self {
            Observation::Drop => Verdict::Drop,
            Observation::Suppress | Observation::Emit(_) => Verdict::Pass,
        }
    }
}

/// Classifies a frame for telemetry. Never mutates it.
pub fn inspect(frame: &[u8]) -> Observation {
    let view = PacketView::new(frame);
    let eth = match view.ethernet() {
        Ok(eth) => eth,
        Err(_) => return Observation::Drop,
    };
    match eth.ether_type() {
        EtherType::Ipv4 => {}
        // IPv6 headers are never parsed here.
        EtherType::Ipv6 | EtherType::Other(_) => return Observation::Suppress,
    }

    let ip = match view.ipv4() {
        Ok(ip) => ip,
        Err(_) => return Observation::Drop,
    };
    if ip.is_fragmented() {
        return Observation::Drop;
    }

    let (src_port, dst_port, transport) = match ip.protocol() {
        IPPROTO_TCP => match view.tcp(&ip) {
            // ACKs belong to established connections.
            Ok(tcp) if tcp.is_ack() => return Observation::Suppress,
            Ok(tcp) => (tcp.src_port(), tcp.dst_port(), TransportProto::Tcp),
            Err(_) => return Observation::Suppress,
        },
        IPPROTO_UDP => match view.udp(&ip) {
            Ok(udp) => (udp.src_port(), udp.dst_port(), TransportProto::Udp),
            Err(_) => return Observation::Suppress,
        },
        _ => return Observation::Suppress,
    };

    let (src_addr, dst_addr) = (ip.src_addr(), ip.dst_addr());
    if src_addr == 0 && dst_addr == 0 {
        return Observation::Suppress;
    }
    Observation::Emit(ObservedPacket::new(
        src_addr, dst_addr, src_port, dst_port, transport,
    ))
}

/// Observation hook: emits metadata for connection-initiating traffic.
#[derive(Clone, Debug)]
pub struct Observer<S> {
    sink: S,
}

impl<S: EventSink> Observer<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn observe(&self, frame: &[u8]) -> Verdict {
        match inspect(frame) {
            Observation::Emit(event) => {
                // A lost record never changes the packet's fate.
                let _ = self.sink.emit(event);
                Verdict::Pass
            }
            other => other.verdict(),
        }
    }
}

/// Settings shared by the redirect and restore hooks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RedirectConfig {
    /// Local address inbound traffic is redirected to, host byte order.
    pub sentinel: u32,
    /// TOS byte written on every rewritten datagram.
    pub dscp_marker: u8,
}

impl RedirectConfig {
    pub const fn new(sentinel: u32) -> Self {
        Self {
            sentinel,
            dscp_marker: DSCP_MARKER,
        }
    }
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self::new(DEFAULT_SENTINEL)
    }
}

/// Parsing policy shared by both rewrite paths. `Err` carries the verdict
/// to return immediately.
#[inline(always)]
fn tcp_segment<'a>(view: &PacketView<'a>) -> Result<(Ipv4Header<'a>, TcpHeader<'a>), Verdict> {
    let eth = view.ethernet().map_err(|_| Verdict::Pass)?;
    if eth.ether_type() != EtherType::Ipv4 {
        return Err(Verdict::Pass);
    }
    let ip = view.ipv4().map_err(|_| Verdict::Pass)?;
    if ip.is_fragmented() {
        return Err(Verdict::Drop);
    }
    if ip.protocol() != IPPROTO_TCP {
        return Err(Verdict::Pass);
    }
    // A TCP datagram without a readable TCP header is malformed.
    let tcp = view.tcp(&ip).map_err(|_| Verdict::Drop)?;
    Ok((ip, tcp))
}

/// Inbound redirect hook (ingress).
#[derive(Clone, Debug)]
pub struct Redirector<T> {
    config: RedirectConfig,
    table: T,
}

impl<T: ConnTrack> Redirector<T> {
    pub fn new(config: RedirectConfig, table: T) -> Self {
        Self { config, table }
    }

    pub fn config(&self) -> &RedirectConfig {
        &self.config
    }

    pub fn table(&self) -> &T {
        &self.table
    }

    /// Records `client -> original server` and rewrites the destination to
    /// the sentinel address. Frames already addressed to the sentinel are
    /// left byte-for-byte untouched.
    pub fn ingress(&self, frame: &mut [u8]) -> Verdict {
        let (client, server) = {
            let view = PacketView::new(frame);
            let (ip, tcp) = match tcp_segment(&view) {
                Ok(headers) => headers,
                Err(verdict) => return verdict,
            };
            if ip.dst_addr() == self.config.sentinel {
                return Verdict::Pass;
            }
            (
                TwoTuple::from_wire(ip.src_bytes(), tcp.src_port_bytes()),
                TwoTuple::from_wire(ip.dst_bytes(), tcp.dst_port_bytes()),
            )
        };

        // On a full table the packet is still redirected, just untracked.
        let _ = self.table.insert(client, server);

        let mut view = PacketViewMut::new(frame);
        let Ok((mut ip, _)) = view.ipv4_tcp() else {
            return Verdict::Pass;
        };
        ip.set_dst_addr(self.config.sentinel);
        ip.set_tos(self.config.dscp_marker);
        ip.update_checksum();
        Verdict::Pass
    }
}

/// Outbound restore hook (egress).
///
/// Unlike [`Redirector::ingress`] there is no sentinel short-circuit here:
/// every TCP frame is looked up.
#[derive(Clone, Debug)]
pub struct Restorer<T> {
    config: RedirectConfig,
    table: T,
}

impl<T: ConnTrack> Restorer<T> {
    pub fn new(config: RedirectConfig, table: T) -> Self {
        Self { config, table }
    }

    pub fn config(&self) -> &RedirectConfig {
        &self.config
    }

    pub fn table(&self) -> &T {
        &self.table
    }

    /// Rewrites the source of a reply back to the address/port the remote
    /// client originally dialled. Unknown destinations pass untouched.
    pub fn egress(&self, frame: &mut [u8]) -> Verdict {
        let key = {
            let view = PacketView::new(frame);
            let (ip, tcp) = match tcp_segment(&view) {
                Ok(headers) => headers,
                Err(verdict) => return verdict,
            };
            TwoTuple::from_wire(ip.dst_bytes(), tcp.dst_port_bytes())
        };

        let Some(original) = self.table.lookup(&key) else {
            return Verdict::Pass;
        };

        let mut view = PacketViewMut::new(frame);
        let Ok((mut ip, mut tcp)) = view.ipv4_tcp() else {
            return Verdict::Pass;
        };
        ip.set_src_addr(original.addr);
        tcp.set_src_port_bytes(original.port_bytes());
        ip.set_tos(self.config.dscp_marker);
        ip.update_checksum();
        Verdict::Pass
    }
}

#[cfg(test)]
mod tests {
    use core::cell::{Cell, RefCell};
    use std::vec::Vec;

    use super::*;
    use crate::wire::{
        FrameBuilder, ETH_HDR_LEN, ETH_P_IPV6, IPV4_MIN_HDR_LEN, TCP_FLAG_ACK, TCP_FLAG_SYN,
    };

    const CLIENT: u32 = u32::from_be_bytes([10, 0, 0, 5]);
    const SERVER: u32 = u32::from_be_bytes([203, 0, 113, 9]);
    const SENTINEL: u32 = u32::from_be_bytes([10, 0, 1, 1]);

    /// Single-threaded table used to exercise the hooks in isolation.
    struct VecTable {
        entries: RefCell<Vec<(TwoTuple, TwoTuple)>>,
        capacity: usize,
    }

    impl VecTable {
        fn new(capacity: usize) -> Self {
            Self {
                entries: RefCell::new(Vec::new()),
                capacity,
            }
        }
    }

    impl ConnTrack for VecTable {
        fn lookup(&self, key: &TwoTuple) -> Option<TwoTuple> {
            self.entries
                .borrow()
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| *v)
        }

        fn insert(&self, key: TwoTuple, value: TwoTuple) -> Result<(), CapacityExceeded> {
            let mut entries = self.entries.borrow_mut();
            if let Some(slot) = entries.iter_mut().find(|(k, _)| *k == key) {
                slot.1 = value;
                return Ok(());
            }
            if entries.len() >= self.capacity {
                return Err(CapacityExceeded);
            }
            entries.push((key, value));
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: RefCell<Vec<ObservedPacket>>,
        full: Cell<bool>,
    }

    impl EventSink for Recorder {
        fn emit(&self, event: ObservedPacket) -> Result<(), EmitError> {
            if self.full.get() {
                return Err(EmitError::Full);
            }
            self.events.borrow_mut().push(event);
            Ok(())
        }
    }

    fn frame(builder: FrameBuilder) -> Vec<u8> {
        let mut buf = std::vec![0u8; builder.frame_len()];
        builder.write(&mut buf).unwrap();
        buf
    }

    fn syn() -> Vec<u8> {
        frame(FrameBuilder::tcp(CLIENT, 4000, SERVER, 443))
    }

    #[test]
    fn inbound_syn_is_redirected_and_tracked() {
        let table = VecTable::new(8);
        let redirector = Redirector::new(RedirectConfig::new(SENTINEL), &table);
        let mut pkt = syn();

        assert_eq!(redirector.ingress(&mut pkt), Verdict::Pass);

        let view = PacketView::new(&pkt);
        let ip = view.ipv4().unwrap();
        assert_eq!(ip.dst_addr(), SENTINEL);
        assert_eq!(ip.src_addr(), CLIENT);
        assert_eq!(ip.tos(), DSCP_MARKER);
        assert!(ip.checksum_valid());
        assert_eq!(view.tcp(&ip).unwrap().dst_port(), 443);
        assert_eq!(
            table.lookup(&TwoTuple::new(CLIENT, 4000)),
            Some(TwoTuple::new(SERVER, 443))
        );
    }

    #[test]
    fn reply_is_restored() {
        let table = VecTable::new(8);
        let config = RedirectConfig::new(SENTINEL);
        Redirector::new(config, &table).ingress(&mut syn());

        let mut reply = frame(FrameBuilder::tcp(SENTINEL, 443, CLIENT, 4000).flags(TCP_FLAG_SYN | TCP_FLAG_ACK));
        assert_eq!(Restorer::new(config, &table).egress(&mut reply), Verdict::Pass);

        let view = PacketView::new(&reply);
        let ip = view.ipv4().unwrap();
        assert_eq!(ip.src_addr(), SERVER);
        assert_eq!(ip.dst_addr(), CLIENT);
        assert_eq!(ip.tos(), DSCP_MARKER);
        assert!(ip.checksum_valid());
        let tcp = view.tcp(&ip).unwrap();
        assert_eq!(tcp.src_port(), 443);
        assert_eq!(tcp.dst_port(), 4000);
    }

    #[test]
    fn sentinel_destination_is_untouched() {
        let table = VecTable::new(8);
        let redirector = Redirector::new(RedirectConfig::new(SENTINEL), &table);
        let mut pkt = frame(FrameBuilder::tcp(CLIENT, 4000, SENTINEL, 443));
        let before = pkt.clone();

        assert_eq!(redirector.ingress(&mut pkt), Verdict::Pass);
        assert_eq!(pkt, before);
        assert!(table.entries.borrow().is_empty());
    }

    #[test]
    fn second_ingress_pass_is_a_no_op() {
        let table = VecTable::new(8);
        let redirector = Redirector::new(RedirectConfig::new(SENTINEL), &table);
        let mut pkt = syn();
        redirector.ingress(&mut pkt);
        let once = pkt.clone();
        redirector.ingress(&mut pkt);
        assert_eq!(pkt, once);
    }

    #[test]
    fn udp_passes_redirect_unmodified() {
        let table = VecTable::new(8);
        let redirector = Redirector::new(RedirectConfig::new(SENTINEL), &table);
        let mut pkt = frame(FrameBuilder::udp(CLIENT, 5353, SERVER, 53));
        let before = pkt.clone();
        assert_eq!(redirector.ingress(&mut pkt), Verdict::Pass);
        assert_eq!(pkt, before);
        assert!(table.entries.borrow().is_empty());
    }

    #[test]
    fn non_ipv4_passes_rewrite_paths() {
        let table = VecTable::new(8);
        let config = RedirectConfig::new(SENTINEL);
        let mut pkt = frame(FrameBuilder::tcp(CLIENT, 4000, SERVER, 443).ether_type(ETH_P_IPV6));
        let before = pkt.clone();
        assert_eq!(Redirector::new(config, &table).ingress(&mut pkt), Verdict::Pass);
        assert_eq!(Restorer::new(config, &table).egress(&mut pkt), Verdict::Pass);
        assert_eq!(pkt, before);
    }

    #[test]
    fn unmapped_reply_passes_unmodified() {
        let table = VecTable::new(8);
        let restorer = Restorer::new(RedirectConfig::new(SENTINEL), &table);
        let mut reply = frame(FrameBuilder::tcp(SENTINEL, 443, CLIENT, 4000));
        let before = reply.clone();
        assert_eq!(restorer.egress(&mut reply), Verdict::Pass);
        assert_eq!(reply, before);
    }

    #[test]
    fn fragments_are_dropped_everywhere() {
        let table = VecTable::new(8);
        let recorder = Recorder::default();
        let config = RedirectConfig::new(SENTINEL);
        for builder in [
            FrameBuilder::tcp(CLIENT, 4000, SERVER, 443).fragment(0x2000),
            FrameBuilder::udp(CLIENT, 4000, SERVER, 53).fragment(0x0010),
        ] {
            let mut pkt = frame(builder);
            let before = pkt.clone();
            assert_eq!(Observer::new(&recorder).observe(&pkt), Verdict::Drop);
            assert_eq!(Redirector::new(config, &table).ingress(&mut pkt), Verdict::Drop);
            assert_eq!(Restorer::new(config, &table).egress(&mut pkt), Verdict::Drop);
            assert_eq!(pkt, before);
        }
        assert!(recorder.events.borrow().is_empty());
    }

    #[test]
    fn truncation_policy_per_hook() {
        let table = VecTable::new(8);
        let config = RedirectConfig::new(SENTINEL);
        let full = syn();
        for cut in 0..full.len() {
            let mut pkt = full[..cut].to_vec();
            let expected = if cut < ETH_HDR_LEN + 20 {
                Verdict::Pass
            } else {
                Verdict::Drop
            };
            assert_eq!(Redirector::new(config, &table).ingress(&mut pkt), expected, "cut {cut}");
            assert_eq!(Restorer::new(config, &table).egress(&mut pkt), expected, "cut {cut}");
            assert_eq!(pkt, full[..cut]);
        }
        assert!(table.entries.borrow().is_empty());
    }

    #[test]
    fn full_table_still_redirects() {
        let table = VecTable::new(0);
        let redirector = Redirector::new(RedirectConfig::new(SENTINEL), &table);
        let mut pkt = syn();
        assert_eq!(redirector.ingress(&mut pkt), Verdict::Pass);
        assert_eq!(PacketView::new(&pkt).ipv4().unwrap().dst_addr(), SENTINEL);
        assert!(table.lookup(&TwoTuple::new(CLIENT, 4000)).is_none());
    }

    #[test]
    fn restore_ignores_unrelated_entries() {
        let table = VecTable::new(8);
        let config = RedirectConfig::new(SENTINEL);
        let redirector = Redirector::new(config, &table);
        redirector.ingress(&mut syn());
        for port in 5000..5004 {
            let other = u32::from_be_bytes([192, 0, 2, 1]);
            redirector.ingress(&mut frame(FrameBuilder::tcp(other, port, SERVER, 80)));
        }
        let mut reply = frame(FrameBuilder::tcp(SENTINEL, 443, CLIENT, 4000));
        Restorer::new(config, &table).egress(&mut reply);
        let ip = PacketView::new(&reply).ipv4().unwrap();
        assert_eq!(ip.src_addr(), SERVER);
    }

    #[test]
    fn observer_emits_syn() {
        let recorder = Recorder::default();
        let observer = Observer::new(&recorder);
        assert_eq!(observer.observe(&syn()), Verdict::Pass);
        assert_eq!(
            recorder.events.borrow().as_slice(),
            &[ObservedPacket::new(CLIENT, SERVER, 4000, 443, TransportProto::Tcp)]
        );
    }

    #[test]
    fn observer_emits_udp() {
        let recorder = Recorder::default();
        let pkt = frame(FrameBuilder::udp(CLIENT, 5353, SERVER, 53));
        assert_eq!(Observer::new(&recorder).observe(&pkt), Verdict::Pass);
        let events = recorder.events.borrow();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].transport(), Some(TransportProto::Udp));
        assert_eq!(events[0].dst_port, 53);
    }

    #[test]
    fn observer_suppresses_ack() {
        let recorder = Recorder::default();
        let pkt = frame(FrameBuilder::tcp(CLIENT, 4000, SERVER, 443).flags(TCP_FLAG_ACK));
        assert_eq!(Observer::new(&recorder).observe(&pkt), Verdict::Pass);
        assert!(recorder.events.borrow().is_empty());
    }

    #[test]
    fn observer_drops_malformed() {
        let pkt = syn();
        assert_eq!(inspect(&pkt[..ETH_HDR_LEN - 1]), Observation::Drop);
        assert_eq!(inspect(&pkt[..ETH_HDR_LEN + 19]), Observation::Drop);
        // Truncated transport only suppresses.
        assert_eq!(inspect(&pkt[..ETH_HDR_LEN + 20 + 4]), Observation::Suppress);
    }

    #[test]
    fn observer_passes_other_ethertypes() {
        let pkt = frame(FrameBuilder::tcp(CLIENT, 4000, SERVER, 443).ether_type(0x0806));
        assert_eq!(inspect(&pkt), Observation::Suppress);
        let pkt = frame(FrameBuilder::tcp(CLIENT, 4000, SERVER, 443).ether_type(ETH_P_IPV6));
        assert_eq!(inspect(&pkt), Observation::Suppress);
    }

    #[test]
    fn observer_suppresses_other_protocols_and_zero_addresses() {
        let icmp = frame(FrameBuilder::tcp(CLIENT, 0, SERVER, 0).protocol(1));
        assert_eq!(inspect(&icmp), Observation::Suppress);

        let zero = frame(FrameBuilder::udp(0, 68, 0, 67));
        assert_eq!(inspect(&zero), Observation::Suppress);

        let bootp = frame(FrameBuilder::udp(0, 68, u32::MAX, 67));
        assert!(matches!(inspect(&bootp), Observation::Emit(_)));
    }

    /// Moves the transport header back by four NOP option bytes.
    fn with_ip_options(builder: FrameBuilder) -> Vec<u8> {
        let mut buf = frame(builder);
        let l4 = ETH_HDR_LEN + IPV4_MIN_HDR_LEN;
        let tail = buf.split_off(l4);
        buf.extend_from_slice(&[0x01; 4]);
        buf.extend_from_slice(&tail);
        buf[ETH_HDR_LEN] = 0x46;
        buf
    }

    #[test]
    fn options_frame_is_redirected_and_restored() {
        let table = VecTable::new(8);
        let config = RedirectConfig::new(SENTINEL);

        let mut syn = with_ip_options(FrameBuilder::tcp(CLIENT, 4000, SERVER, 443));
        assert_eq!(Redirector::new(config, &table).ingress(&mut syn), Verdict::Pass);
        let view = PacketView::new(&syn);
        let ip = view.ipv4().unwrap();
        assert_eq!(ip.header_len(), 24);
        assert_eq!(ip.dst_addr(), SENTINEL);
        assert!(ip.checksum_valid());
        assert_eq!(view.tcp(&ip).unwrap().dst_port(), 443);
        assert_eq!(
            table.lookup(&TwoTuple::new(CLIENT, 4000)),
            Some(TwoTuple::new(SERVER, 443))
        );

        let mut reply = with_ip_options(
            FrameBuilder::tcp(SENTINEL, 443, CLIENT, 4000).flags(TCP_FLAG_SYN | TCP_FLAG_ACK),
        );
        assert_eq!(Restorer::new(config, &table).egress(&mut reply), Verdict::Pass);
        let view = PacketView::new(&reply);
        let ip = view.ipv4().unwrap();
        assert_eq!(ip.header_len(), 24);
        assert_eq!(ip.src_addr(), SERVER);
        assert!(ip.checksum_valid());
        assert_eq!(view.tcp(&ip).unwrap().src_port(), 443);
    }

    #[test]
    fn short_udp_header_is_suppressed() {
        let recorder = Recorder::default();
        let full = frame(FrameBuilder::udp(CLIENT, 5353, SERVER, 53));
        let cut = &full[..full.len() - 4];
        assert_eq!(inspect(cut), Observation::Suppress);
        assert_eq!(Observer::new(&recorder).observe(cut), Verdict::Pass);
        assert!(recorder.events.borrow().is_empty());
    }

    #[test]
    fn ihl_past_frame_end_is_malformed() {
        let table = VecTable::new(8);
        let config = RedirectConfig::new(SENTINEL);
        // IHL 15 claims 60 header bytes; only 40 follow the Ethernet header.
        let mut pkt = syn();
        pkt[ETH_HDR_LEN] = 0x4f;
        pkt.truncate(ETH_HDR_LEN + 40);
        let before = pkt.clone();

        assert_eq!(inspect(&pkt), Observation::Drop);
        assert_eq!(Redirector::new(config, &table).ingress(&mut pkt), Verdict::Pass);
        assert_eq!(Restorer::new(config, &table).egress(&mut pkt), Verdict::Pass);
        assert_eq!(pkt, before);
        assert!(table.entries.borrow().is_empty());
    }

    #[test]
    fn wrong_ip_version_is_malformed() {
        let table = VecTable::new(8);
        let config = RedirectConfig::new(SENTINEL);
        let mut pkt = syn();
        pkt[ETH_HDR_LEN] = 0x65;
        let before = pkt.clone();

        assert_eq!(inspect(&pkt), Observation::Drop);
        assert_eq!(Redirector::new(config, &table).ingress(&mut pkt), Verdict::Pass);
        assert_eq!(Restorer::new(config, &table).egress(&mut pkt), Verdict::Pass);
        assert_eq!(pkt, before);
        assert!(table.entries.borrow().is_empty());
    }

    #[test]
    fn lost_record_still_passes() {
        let recorder = Recorder::default();
        recorder.full.set(true);
        assert_eq!(Observer::new(&recorder).observe(&syn()), Verdict::Pass);
    }
}
