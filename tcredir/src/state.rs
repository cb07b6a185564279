use dashmap::DashMap;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use tcredir_common::ObservedPacket;

#[derive(Debug, Clone, Serialize)]
pub struct PacketMetadata {
    pub timestamp: i64,
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: String,
}

impl PacketMetadata {
    /// Convert a kernel-side ObservedPacket into a userspace PacketMetadata.
    ///
    /// Addresses arrive in host byte order. The timestamp is assigned here
    /// in userspace.
    pub fn from_ebpf(event: &ObservedPacket) -> Self {
        let protocol = match event.transport() {
            Some(proto) => proto.as_str().to_string(),
            None => format!("UNKNOWN({})", event.transport),
        };
        Self {
            timestamp: chrono::Utc::now().timestamp_millis(),
            src_ip: Ipv4Addr::from(event.src_addr).to_string(),
            dst_ip: Ipv4Addr::from(event.dst_addr).to_string(),
            src_port: event.src_port,
            dst_port: event.dst_port,
            protocol,
        }
    }

    pub fn flow_key(&self) -> String {
        format!(
            "{} {}:{} -> {}:{}",
            self.protocol, self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

#[derive(Debug, Serialize, Clone)]
pub struct FlowStats {
    pub packets_count: u64,
    pub first_seen: i64,
    #[serde(skip)]
    pub last_seen: Instant,
}

/// Live view of observed connection attempts.
pub struct TrafficState {
    pub flows: DashMap<String, FlowStats>,
    pub total_packets: AtomicU64,
    pub tcp_packets: AtomicU64,
    pub udp_packets: AtomicU64,
    /// Records the kernel reported as lost before userspace read them.
    pub lost_events: AtomicU64,
    pub active_flows: AtomicUsize,
}

impl Default for TrafficState {
    fn default() -> Self {
        Self::new()
    }
}

impl TrafficState {
    pub fn new() -> Self {
        Self {
            flows: DashMap::new(),
            total_packets: AtomicU64::new(0),
            tcp_packets: AtomicU64::new(0),
            udp_packets: AtomicU64::new(0),
            lost_events: AtomicU64::new(0),
            active_flows: AtomicUsize::new(0),
        }
    }

    pub fn update(&self, packet: &PacketMetadata) {
        self.flows
            .entry(packet.flow_key())
            .and_modify(|stats| {
                stats.packets_count += 1;
                stats.last_seen = Instant::now();
            })
            .or_insert_with(|| {
                self.active_flows.fetch_add(1, Ordering::Relaxed);
                FlowStats {
                    packets_count: 1,
                    first_seen: packet.timestamp,
                    last_seen: Instant::now(),
                }
            });

        self.total_packets.fetch_add(1, Ordering::Relaxed);
        match packet.protocol.as_str() {
            "TCP" => self.tcp_packets.fetch_add(1, Ordering::Relaxed),
            "UDP" => self.udp_packets.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
    }

    pub fn record_lost(&self, count: u64) {
        if count > 0 {
            self.lost_events.fetch_add(count, Ordering::Relaxed);
            tracing::warn!(count, "telemetry records lost");
        }
    }

    pub fn cleanup_stale_flows(&self, timeout: Duration) {
        let now = Instant::now();
        // Counted per entry: flows inserted mid-sweep must not offset removals.
        let mut removed = 0usize;
        self.flows.retain(|_, stats| {
            let keep = now.duration_since(stats.last_seen) <= timeout;
            if !keep {
                removed += 1;
            }
            keep
        });

        if removed > 0 {
            self.active_flows.fetch_sub(removed, Ordering::Relaxed);
            tracing::debug!(removed, "pruned idle flows");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tcredir_common::TransportProto;

    #[test]
    fn test_from_ebpf_tcp() {
        let event = ObservedPacket::new(
            u32::from_be_bytes([10, 0, 0, 5]),
            u32::from_be_bytes([203, 0, 113, 9]),
            4000,
            443,
            TransportProto::Tcp,
        );
        let meta = PacketMetadata::from_ebpf(&event);

        assert_eq!(meta.src_ip, "10.0.0.5");
        assert_eq!(meta.dst_ip, "203.0.113.9");
        assert_eq!(meta.src_port, 4000);
        assert_eq!(meta.dst_port, 443);
        assert_eq!(meta.protocol, "TCP");
        assert_eq!(meta.flow_key(), "TCP 10.0.0.5:4000 -> 203.0.113.9:443");
    }

    #[test]
    fn test_from_ebpf_udp() {
        let event = ObservedPacket::new(
            u32::from_be_bytes([172, 16, 0, 1]),
            u32::from_be_bytes([8, 8, 8, 8]),
            53000,
            53,
            TransportProto::Udp,
        );
        let meta = PacketMetadata::from_ebpf(&event);

        assert_eq!(meta.src_ip, "172.16.0.1");
        assert_eq!(meta.dst_ip, "8.8.8.8");
        assert_eq!(meta.protocol, "UDP");
    }

    #[test]
    fn test_unknown_transport_tag() {
        let mut event = ObservedPacket::new(1, 2, 3, 4, TransportProto::Tcp);
        event.transport = 9;
        assert_eq!(PacketMetadata::from_ebpf(&event).protocol, "UNKNOWN(9)");
    }

    fn packet() -> PacketMetadata {
        PacketMetadata {
            timestamp: 0,
            src_ip: "127.0.0.1".into(),
            dst_ip: "127.0.0.1".into(),
            src_port: 80,
            dst_port: 1234,
            protocol: "TCP".into(),
        }
    }

    #[test]
    fn test_traffic_state_update() {
        let state = TrafficState::new();
        let packet = packet();

        state.update(&packet);
        assert_eq!(state.total_packets.load(Ordering::Relaxed), 1);
        assert_eq!(state.tcp_packets.load(Ordering::Relaxed), 1);
        assert_eq!(state.active_flows.load(Ordering::Relaxed), 1);

        state.update(&packet);
        assert_eq!(state.total_packets.load(Ordering::Relaxed), 2);
        assert_eq!(state.active_flows.load(Ordering::Relaxed), 1);
        assert_eq!(state.flows.get(&packet.flow_key()).unwrap().packets_count, 2);
    }

    #[test]
    fn test_record_lost_accumulates() {
        let state = TrafficState::new();
        state.record_lost(0);
        state.record_lost(3);
        state.record_lost(2);
        assert_eq!(state.lost_events.load(Ordering::Relaxed), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_stale_flows() {
        let state = TrafficState::new();
        state.update(&packet());

        tokio::time::advance(Duration::from_secs(30)).await;
        state.cleanup_stale_flows(Duration::from_secs(60));
        assert_eq!(state.active_flows.load(Ordering::Relaxed), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        state.cleanup_stale_flows(Duration::from_secs(60));
        assert_eq!(state.active_flows.load(Ordering::Relaxed), 0);
        assert!(state.flows.is_empty());
    }

    #[test]
    fn test_gauge_matches_flows_under_concurrent_inserts() {
        let state = std::sync::Arc::new(TrafficState::new());
        for port in 0..200 {
            state.update(&PacketMetadata {
                src_port: port,
                ..packet()
            });
        }

        let writers: Vec<_> = (0..4u16)
            .map(|worker| {
                let state = state.clone();
                std::thread::spawn(move || {
                    for port in 0..500 {
                        state.update(&PacketMetadata {
                            src_port: 10_000 + worker * 1000 + port,
                            ..packet()
                        });
                    }
                })
            })
            .collect();
        for _ in 0..50 {
            state.cleanup_stale_flows(Duration::ZERO);
        }
        for writer in writers {
            writer.join().unwrap();
        }

        assert_eq!(
            state.active_flows.load(Ordering::Relaxed),
            state.flows.len()
        );
    }
}
