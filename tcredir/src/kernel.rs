use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Context as _;
use aya::maps::{HashMap as BpfHashMap, MapData, PerCpuArray};
use aya::programs::{tc, SchedClassifier, TcAttachType, Xdp, XdpFlags};
use aya::util::KernelVersion;
use aya::{Ebpf, EbpfLoader};
use serde::Serialize;

use tcredir::config::TelemetryBackend;
use tcredir_common::{StatIndex, TwoTuple};

pub const CONN_TRACK_MAP: &str = "CONN_TRACK";
pub const STATS_MAP: &str = "STATS";
pub const RING_MAP: &str = "RING_OBSERVED";
pub const PERF_MAP: &str = "PERF_OBSERVED";

/// The telemetry channel actually in use once `auto` is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Ring,
    Perf,
}

impl Channel {
    pub fn resolve(requested: TelemetryBackend) -> Self {
        match requested {
            TelemetryBackend::Ring => Channel::Ring,
            TelemetryBackend::Perf => Channel::Perf,
            TelemetryBackend::Auto => match KernelVersion::current() {
                Ok(version) if version >= KernelVersion::new(5, 8, 0) => Channel::Ring,
                Ok(version) => {
                    tracing::info!(?version, "kernel predates BPF ring buffers, using perf");
                    Channel::Perf
                }
                Err(e) => {
                    tracing::warn!("could not detect kernel version ({}), using perf", e);
                    Channel::Perf
                }
            },
        }
    }

    fn program(self) -> &'static str {
        match self {
            Channel::Ring => "observe_ring",
            Channel::Perf => "observe_perf",
        }
    }
}

#[cfg(debug_assertions)]
fn object() -> &'static [u8] {
    aya::include_bytes_aligned!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../tcredir-ebpf/target/bpfel-unknown-none/debug/tcredir"
    ))
}

#[cfg(not(debug_assertions))]
fn object() -> &'static [u8] {
    aya::include_bytes_aligned!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../tcredir-ebpf/target/bpfel-unknown-none/release/tcredir"
    ))
}

/// Loads the eBPF object with the redirect target baked in.
pub fn load(sentinel: u32) -> anyhow::Result<Ebpf> {
    let bpf = EbpfLoader::new()
        .set_global("SENTINEL_ADDR", &sentinel, true)
        .load(object())
        .context("failed to load eBPF object")?;
    Ok(bpf)
}

/// Attaches both TC classifiers and the XDP program feeding `channel`.
pub fn attach(bpf: &mut Ebpf, iface: &str, channel: Channel) -> anyhow::Result<()> {
    // If the clsact qdisc already exists (EEXIST), that is fine.
    if let Err(e) = tc::qdisc_add_clsact(iface) {
        if e.raw_os_error() != Some(17) {
            return Err(e).with_context(|| format!("failed to add clsact qdisc to {iface}"));
        }
        tracing::debug!("clsact qdisc already exists on {}, reusing", iface);
    }

    for (name, attach_type) in [
        ("ingress", TcAttachType::Ingress),
        ("egress", TcAttachType::Egress),
    ] {
        let program: &mut SchedClassifier = bpf
            .program_mut(name)
            .with_context(|| format!("program {name} not found"))?
            .try_into()?;
        program.load()?;
        program
            .attach(iface, attach_type)
            .with_context(|| format!("failed to attach {name} classifier to {iface}"))?;
        tracing::info!("TC classifier {} attached to {}", name, iface);
    }

    let name = channel.program();
    let program: &mut Xdp = bpf
        .program_mut(name)
        .with_context(|| format!("program {name} not found"))?
        .try_into()?;
    program.load()?;
    program
        .attach(iface, XdpFlags::default())
        .context("failed to attach the XDP program - try changing XdpFlags::default() to XdpFlags::SKB_MODE")?;
    tracing::info!("XDP program {} attached to {}", name, iface);

    Ok(())
}

/// Totals of the kernel `STATS` counters, summed over every CPU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KernelStats {
    pub redirected: u64,
    pub restored: u64,
    pub conn_track_full: u64,
    pub observed: u64,
    pub observed_lost: u64,
}

impl KernelStats {
    fn set(&mut self, index: StatIndex, value: u64) {
        match index {
            StatIndex::Redirected => self.redirected = value,
            StatIndex::Restored => self.restored = value,
            StatIndex::ConnTrackFull => self.conn_track_full = value,
            StatIndex::Observed => self.observed = value,
            StatIndex::ObservedLost => self.observed_lost = value,
        }
    }
}

/// Userspace handles on the maps the admin API reads.
pub struct KernelTables {
    conn_track: Mutex<BpfHashMap<MapData, TwoTuple, TwoTuple>>,
    stats: Mutex<PerCpuArray<MapData, u64>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl KernelTables {
    pub fn take(bpf: &mut Ebpf) -> anyhow::Result<Self> {
        let conn_track = bpf
            .take_map(CONN_TRACK_MAP)
            .with_context(|| format!("map {CONN_TRACK_MAP} not found"))?;
        let stats = bpf
            .take_map(STATS_MAP)
            .with_context(|| format!("map {STATS_MAP} not found"))?;
        Ok(Self {
            conn_track: Mutex::new(BpfHashMap::try_from(conn_track)?),
            stats: Mutex::new(PerCpuArray::try_from(stats)?),
        })
    }

    /// Every entry currently in the kernel table. Entries that vanish while
    /// iterating are skipped.
    pub fn conn_track(&self) -> Vec<(TwoTuple, TwoTuple)> {
        let map = locked(&self.conn_track);
        map.iter().filter_map(Result::ok).collect()
    }

    pub fn lookup(&self, client: &TwoTuple) -> Option<TwoTuple> {
        locked(&self.conn_track).get(client, 0).ok()
    }

    pub fn stats(&self) -> KernelStats {
        let array = locked(&self.stats);
        let mut stats = KernelStats::default();
        for index in StatIndex::ALL {
            match array.get(&(index as u32), 0) {
                Ok(values) => stats.set(index, values.iter().sum()),
                Err(e) => tracing::debug!(?index, "failed to read stats slot: {}", e),
            }
        }
        stats
    }
}
