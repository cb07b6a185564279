use std::mem::size_of;
use std::sync::Arc;

use anyhow::Context as _;
use aya::maps::perf::AsyncPerfEventArray;
use aya::maps::{MapData, RingBuf};
use aya::util::online_cpus;
use bytes::BytesMut;
use tokio::time::Duration;

use tcredir::state::{PacketMetadata, TrafficState};
use tcredir_common::ObservedPacket;

/// Reads one record as written by the kernel. Short records are ignored.
fn decode(record: &[u8]) -> Option<ObservedPacket> {
    if record.len() < size_of::<ObservedPacket>() {
        return None;
    }
    // SAFETY: length checked above; ObservedPacket is plain old data.
    Some(unsafe { core::ptr::read_unaligned(record.as_ptr() as *const ObservedPacket) })
}

fn record(traffic: &TrafficState, event: &ObservedPacket) {
    let meta = PacketMetadata::from_ebpf(event);
    tracing::info!(
        "{} {}:{} -> {}:{}",
        meta.protocol,
        meta.src_ip,
        meta.src_port,
        meta.dst_ip,
        meta.dst_port
    );
    traffic.update(&meta);
}

/// Continuously poll the shared ring buffer for ObservedPacket entries and
/// fold them into the live TrafficState.
pub async fn drain_ring(mut ring_buf: RingBuf<MapData>, traffic: Arc<TrafficState>) {
    loop {
        while let Some(item) = ring_buf.next() {
            match decode(&item) {
                Some(event) => record(&traffic, &event),
                None => tracing::debug!(len = item.len(), "short ring buffer record"),
            }
        }

        // Yield briefly to avoid busy-spinning when the ring buffer is empty.
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

/// Spawns one reader per online CPU on the perf event array.
pub fn spawn_perf_readers(
    mut perf_array: AsyncPerfEventArray<MapData>,
    traffic: Arc<TrafficState>,
) -> anyhow::Result<()> {
    let cpus = online_cpus().map_err(|(msg, e)| anyhow::anyhow!("{msg}: {e}"))?;
    for cpu in cpus {
        let mut buf = perf_array
            .open(cpu, None)
            .with_context(|| format!("failed to open perf buffer for cpu {cpu}"))?;
        let traffic = traffic.clone();

        tokio::spawn(async move {
            let mut buffers = (0..10)
                .map(|_| BytesMut::with_capacity(size_of::<ObservedPacket>()))
                .collect::<Vec<_>>();

            loop {
                let events = match buf.read_events(&mut buffers).await {
                    Ok(events) => events,
                    Err(e) => {
                        tracing::error!(cpu, "perf buffer read failed: {}", e);
                        return;
                    }
                };
                traffic.record_lost(events.lost as u64);
                for raw in buffers.iter().take(events.read) {
                    if let Some(event) = decode(raw) {
                        record(&traffic, &event);
                    }
                }
            }
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use tcredir_common::TransportProto;

    fn raw(event: &ObservedPacket) -> Vec<u8> {
        let ptr = event as *const ObservedPacket as *const u8;
        unsafe { std::slice::from_raw_parts(ptr, size_of::<ObservedPacket>()) }.to_vec()
    }

    #[test]
    fn decodes_kernel_record() {
        let event = ObservedPacket::new(
            u32::from_be_bytes([10, 0, 0, 5]),
            u32::from_be_bytes([10, 0, 1, 1]),
            4000,
            80,
            TransportProto::Tcp,
        );
        assert_eq!(decode(&raw(&event)), Some(event));
    }

    #[test]
    fn short_record_is_ignored() {
        let event = ObservedPacket::new(1, 2, 3, 4, TransportProto::Udp);
        let bytes = raw(&event);
        assert_eq!(decode(&bytes[..15]), None);
        assert_eq!(decode(&[]), None);
    }

    #[test]
    fn records_feed_traffic_state() {
        let traffic = TrafficState::new();
        let event = ObservedPacket::new(1, 2, 3, 4, TransportProto::Udp);
        record(&traffic, &event);
        record(&traffic, &event);
        assert_eq!(traffic.udp_packets.load(Ordering::Relaxed), 2);
        assert_eq!(traffic.active_flows.load(Ordering::Relaxed), 1);
    }
}
