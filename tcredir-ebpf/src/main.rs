#![no_std]
#![no_main]

use aya_ebpf::{
    bindings::{xdp_action, TC_ACT_OK, TC_ACT_SHOT},
    macros::{classifier, map, xdp},
    maps::{HashMap, PerCpuArray, PerfEventArray, RingBuf},
    programs::{TcContext, XdpContext},
};
use aya_log_ebpf::{debug, info};
use core::{mem, ptr};
use network_types::{
    eth::{EthHdr, EtherType},
    ip::{IpProto, Ipv4Hdr},
    tcp::TcpHdr,
    udp::UdpHdr,
};
use tcredir_common::{
    checksum,
    wire::{IPV4_MAX_HDR_LEN, IPV4_MIN_HDR_LEN, IP_FRAGMENT_MASK, TCP_FLAG_ACK},
    ObservedPacket, StatIndex, TransportProto, TwoTuple, Verdict, CONN_TRACK_CAPACITY,
    DEFAULT_SENTINEL, DSCP_MARKER, RING_BYTE_SIZE, STAT_COUNT,
};

#[no_mangle]
#[link_section = "license"]
pub static _license: [u8; 13] = *b"Dual MIT/GPL\0";

/// Redirect target in host byte order. Overwritten by the loader.
#[no_mangle]
static SENTINEL_ADDR: u32 = DEFAULT_SENTINEL;

#[map]
static CONN_TRACK: HashMap<TwoTuple, TwoTuple> =
    HashMap::with_max_entries(CONN_TRACK_CAPACITY, 0);

#[map]
static RING_OBSERVED: RingBuf = RingBuf::with_byte_size(RING_BYTE_SIZE, 0);

#[map]
static PERF_OBSERVED: PerfEventArray<ObservedPacket> = PerfEventArray::new(0);

#[map]
static STATS: PerCpuArray<u64> = PerCpuArray::with_max_entries(STAT_COUNT, 0);

#[inline(always)]
fn sentinel() -> u32 {
    unsafe { ptr::read_volatile(&SENTINEL_ADDR) }
}

#[inline(always)]
fn bump(index: StatIndex) {
    if let Some(counter) = STATS.get_ptr_mut(index as u32) {
        unsafe { *counter += 1 };
    }
}

/// Bounds-checked pointer into the packet. Every header access goes
/// through here so the verifier sees the `data_end` comparison.
#[inline(always)]
fn ptr_at<T>(data: usize, data_end: usize, offset: usize) -> Option<*mut T> {
    let start = data + offset;
    if start + mem::size_of::<T>() > data_end {
        return None;
    }
    Some(start as *mut T)
}

#[inline(always)]
fn tc_verdict(verdict: Verdict) -> i32 {
    match verdict {
        Verdict::Pass => TC_ACT_OK,
        Verdict::Drop => TC_ACT_SHOT,
    }
}

#[inline(always)]
fn xdp_verdict(verdict: Verdict) -> u32 {
    match verdict {
        Verdict::Pass => xdp_action::XDP_PASS,
        Verdict::Drop => xdp_action::XDP_DROP,
    }
}

/// Locates the IPv4 header after Ethernet and returns it with its
/// IHL-declared length. `None` for a short frame, a version other than 4,
/// an IHL below five or a header running past `data_end`.
#[inline(always)]
fn ipv4_header(data: usize, data_end: usize) -> Option<(*mut Ipv4Hdr, usize)> {
    let ip: *mut Ipv4Hdr = ptr_at(data, data_end, EthHdr::LEN)?;
    let first = unsafe { *((data + EthHdr::LEN) as *const u8) };
    if first >> 4 != 4 {
        return None;
    }
    let ip_len = ((first & 0x0f) as usize) * 4;
    if ip_len < IPV4_MIN_HDR_LEN || ip_len > IPV4_MAX_HDR_LEN {
        return None;
    }
    if data + EthHdr::LEN + ip_len > data_end {
        return None;
    }
    Some((ip, ip_len))
}

/// Located IPv4 + TCP headers of a frame on a rewrite path.
struct Segment {
    ip: *mut Ipv4Hdr,
    tcp: *mut TcpHdr,
    ip_start: usize,
    ip_len: usize,
}

/// Shared parsing policy of the ingress and egress classifiers.
#[inline(always)]
fn tcp_segment(data: usize, data_end: usize) -> Result<Segment, Verdict> {
    let eth: *mut EthHdr = ptr_at(data, data_end, 0).ok_or(Verdict::Pass)?;
    let ether_type = unsafe { ptr::read_unaligned(ptr::addr_of!((*eth).ether_type)) };
    if ether_type != EtherType::Ipv4 {
        return Err(Verdict::Pass);
    }

    let (ip, ip_len) = ipv4_header(data, data_end).ok_or(Verdict::Pass)?;
    let ip_start = data + EthHdr::LEN;

    let frag_off = u16::from_be(unsafe { ptr::read_unaligned(ptr::addr_of!((*ip).frag_off)) });
    if frag_off & IP_FRAGMENT_MASK != 0 {
        return Err(Verdict::Drop);
    }
    let proto = unsafe { ptr::read_unaligned(ptr::addr_of!((*ip).proto)) };
    if proto != IpProto::Tcp {
        return Err(Verdict::Pass);
    }

    let tcp: *mut TcpHdr =
        ptr_at(data, data_end, EthHdr::LEN + ip_len).ok_or(Verdict::Drop)?;
    Ok(Segment {
        ip,
        tcp,
        ip_start,
        ip_len,
    })
}

/// Zeroes the IPv4 checksum and recomputes it over the IHL-declared header.
#[inline(always)]
fn update_ipv4_checksum(seg: &Segment, data_end: usize) {
    unsafe { ptr::write_unaligned(ptr::addr_of_mut!((*seg.ip).check), 0) };
    let mut sum: u32 = 0;
    let mut off = 0;
    while off < IPV4_MAX_HDR_LEN {
        if off >= seg.ip_len {
            break;
        }
        match ptr_at::<[u8; 2]>(seg.ip_start, data_end, off) {
            Some(word) => sum += u16::from_be_bytes(unsafe { *word }) as u32,
            None => break,
        }
        off += 2;
    }
    let check = checksum::fold(sum).to_be();
    unsafe { ptr::write_unaligned(ptr::addr_of_mut!((*seg.ip).check), check) };
}

/// Inbound redirect: remember the destination the client dialled and send
/// the packet to the sentinel address instead.
#[classifier]
pub fn ingress(ctx: TcContext) -> i32 {
    let (data, data_end) = (ctx.data(), ctx.data_end());
    let seg = match tcp_segment(data, data_end) {
        Ok(seg) => seg,
        Err(verdict) => return tc_verdict(verdict),
    };

    let sentinel = sentinel();
    let ip = seg.ip;
    let daddr = u32::from_be(unsafe { ptr::read_unaligned(ptr::addr_of!((*ip).dst_addr)) });
    if daddr == sentinel {
        debug!(&ctx, "already addressed to sentinel, leaving untouched");
        return TC_ACT_OK;
    }
    let saddr = u32::from_be(unsafe { ptr::read_unaligned(ptr::addr_of!((*ip).src_addr)) });
    let tcp = seg.tcp;

    let mut client = TwoTuple::default();
    client.addr = saddr;
    client.port = unsafe { ptr::read_unaligned(ptr::addr_of!((*tcp).source)) };
    let mut server = TwoTuple::default();
    server.addr = daddr;
    server.port = unsafe { ptr::read_unaligned(ptr::addr_of!((*tcp).dest)) };

    if CONN_TRACK.insert(&client, &server, 0).is_err() {
        bump(StatIndex::ConnTrackFull);
        info!(&ctx, "conn_track full, redirecting untracked");
    }

    unsafe {
        ptr::write_unaligned(ptr::addr_of_mut!((*ip).dst_addr), sentinel.to_be());
        ptr::write_unaligned(ptr::addr_of_mut!((*ip).tos), DSCP_MARKER);
    }
    update_ipv4_checksum(&seg, data_end);
    bump(StatIndex::Redirected);
    TC_ACT_OK
}

/// Outbound restore: make replies look like they come from the address the
/// client originally dialled.
#[classifier]
pub fn egress(ctx: TcContext) -> i32 {
    let (data, data_end) = (ctx.data(), ctx.data_end());
    let seg = match tcp_segment(data, data_end) {
        Ok(seg) => seg,
        Err(verdict) => return tc_verdict(verdict),
    };

    let ip = seg.ip;
    let tcp = seg.tcp;
    let mut key = TwoTuple::default();
    key.addr = u32::from_be(unsafe { ptr::read_unaligned(ptr::addr_of!((*ip).dst_addr)) });
    key.port = unsafe { ptr::read_unaligned(ptr::addr_of!((*tcp).dest)) };

    let original = match unsafe { CONN_TRACK.get(&key) } {
        Some(original) => *original,
        None => return TC_ACT_OK,
    };

    unsafe {
        ptr::write_unaligned(ptr::addr_of_mut!((*ip).src_addr), original.addr.to_be());
        ptr::write_unaligned(ptr::addr_of_mut!((*tcp).source), original.port);
        ptr::write_unaligned(ptr::addr_of_mut!((*ip).tos), DSCP_MARKER);
    }
    update_ipv4_checksum(&seg, data_end);
    bump(StatIndex::Restored);
    TC_ACT_OK
}

/// Classifies a frame at the XDP hook. `Ok(true)` means `event` was filled
/// and should be emitted; `Err` carries a drop.
///
/// Fields are written one by one to keep `memcpy`/`memset` out of `.text`.
#[inline(always)]
fn inspect(ctx: &XdpContext, event: &mut ObservedPacket) -> Result<bool, Verdict> {
    let (data, data_end) = (ctx.data(), ctx.data_end());

    let eth: *const EthHdr = ptr_at(data, data_end, 0).ok_or(Verdict::Drop)?;
    let ether_type = unsafe { ptr::read_unaligned(ptr::addr_of!((*eth).ether_type)) };
    if ether_type != EtherType::Ipv4 {
        if ether_type == EtherType::Ipv6 {
            debug!(ctx, "ipv6 frame, not telemetered");
        }
        return Ok(false);
    }

    let (ip, ip_len) = ipv4_header(data, data_end).ok_or(Verdict::Drop)?;
    let frag_off = u16::from_be(unsafe { ptr::read_unaligned(ptr::addr_of!((*ip).frag_off)) });
    if frag_off & IP_FRAGMENT_MASK != 0 {
        return Err(Verdict::Drop);
    }

    event.src_addr = u32::from_be(unsafe { ptr::read_unaligned(ptr::addr_of!((*ip).src_addr)) });
    event.dst_addr = u32::from_be(unsafe { ptr::read_unaligned(ptr::addr_of!((*ip).dst_addr)) });

    let l4 = EthHdr::LEN + ip_len;
    match unsafe { ptr::read_unaligned(ptr::addr_of!((*ip).proto)) } {
        IpProto::Tcp => {
            let Some(tcp) = ptr_at::<TcpHdr>(data, data_end, l4) else {
                return Ok(false);
            };
            let flags = unsafe { *((tcp as usize + 13) as *const u8) };
            if flags & TCP_FLAG_ACK != 0 {
                return Ok(false);
            }
            event.src_port = u16::from_be(unsafe { ptr::read_unaligned(ptr::addr_of!((*tcp).source)) });
            event.dst_port = u16::from_be(unsafe { ptr::read_unaligned(ptr::addr_of!((*tcp).dest)) });
            event.transport = TransportProto::Tcp as u8;
        }
        IpProto::Udp => {
            let Some(udp) = ptr_at::<UdpHdr>(data, data_end, l4) else {
                return Ok(false);
            };
            event.src_port = u16::from_be(unsafe { ptr::read_unaligned(ptr::addr_of!((*udp).source)) });
            event.dst_port = u16::from_be(unsafe { ptr::read_unaligned(ptr::addr_of!((*udp).dest)) });
            event.transport = TransportProto::Udp as u8;
        }
        _ => return Ok(false),
    }

    Ok(event.src_addr != 0 || event.dst_addr != 0)
}

/// Observation over the shared ring buffer.
#[xdp]
pub fn observe_ring(ctx: XdpContext) -> u32 {
    let mut event = ObservedPacket::new(0, 0, 0, 0, TransportProto::Tcp);
    match inspect(&ctx, &mut event) {
        Ok(true) => {
            if RING_OBSERVED.output(&event, 0).is_err() {
                bump(StatIndex::ObservedLost);
            } else {
                bump(StatIndex::Observed);
            }
            xdp_action::XDP_PASS
        }
        Ok(false) => xdp_action::XDP_PASS,
        Err(verdict) => xdp_verdict(verdict),
    }
}

/// Observation over the per-CPU perf event array, for kernels without
/// ring buffer support.
#[xdp]
pub fn observe_perf(ctx: XdpContext) -> u32 {
    let mut event = ObservedPacket::new(0, 0, 0, 0, TransportProto::Tcp);
    match inspect(&ctx, &mut event) {
        Ok(true) => {
            PERF_OBSERVED.output(&ctx, &event, 0);
            bump(StatIndex::Observed);
            xdp_action::XDP_PASS
        }
        Ok(false) => xdp_action::XDP_PASS,
        Err(verdict) => xdp_verdict(verdict),
    }
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
