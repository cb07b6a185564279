//! Userspace event-sink backends.
//!
//! Both carry the same [`ObservedPacket`] payload and never block the
//! caller: a full buffer loses the record and bumps a counter, like the
//! kernel perf and ring buffers do.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tcredir_common::{EmitError, EventSink, ObservedPacket};
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};

fn try_emit(
    sender: &Sender<ObservedPacket>,
    lost: &AtomicU64,
    event: ObservedPacket,
) -> Result<(), EmitError> {
    match sender.try_send(event) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(_)) => {
            lost.fetch_add(1, Ordering::Relaxed);
            Err(EmitError::Full)
        }
        Err(TrySendError::Closed(_)) => {
            lost.fetch_add(1, Ordering::Relaxed);
            Err(EmitError::Closed)
        }
    }
}

/// One bounded buffer per execution context.
#[derive(Clone)]
pub struct PerCpuChannel {
    senders: Arc<[Sender<ObservedPacket>]>,
    lost: Arc<AtomicU64>,
}

impl PerCpuChannel {
    /// Creates `cpus` buffers of `capacity` records each and returns the
    /// drain side, one receiver per CPU.
    pub fn new(cpus: usize, capacity: usize) -> (Self, Vec<Receiver<ObservedPacket>>) {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..cpus.max(1))
            .map(|_| mpsc::channel(capacity.max(1)))
            .unzip();
        let channel = Self {
            senders: senders.into(),
            lost: Arc::new(AtomicU64::new(0)),
        };
        (channel, receivers)
    }

    pub fn cpus(&self) -> usize {
        self.senders.len()
    }

    /// Handle bound to `cpu`'s buffer. Out-of-range indices wrap.
    pub fn sink(&self, cpu: usize) -> PerCpuSink {
        PerCpuSink {
            cpu: cpu % self.senders.len(),
            sender: self.senders[cpu % self.senders.len()].clone(),
            lost: self.lost.clone(),
        }
    }

    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
pub struct PerCpuSink {
    cpu: usize,
    sender: Sender<ObservedPacket>,
    lost: Arc<AtomicU64>,
}

impl PerCpuSink {
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }
}

impl EventSink for PerCpuSink {
    fn emit(&self, event: ObservedPacket) -> Result<(), EmitError> {
        try_emit(&self.sender, &self.lost, event)
    }
}

/// A single buffer shared by every execution context.
#[derive(Clone)]
pub struct RingSink {
    sender: Sender<ObservedPacket>,
    lost: Arc<AtomicU64>,
}

impl RingSink {
    pub fn new(capacity: usize) -> (Self, Receiver<ObservedPacket>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let sink = Self {
            sender,
            lost: Arc::new(AtomicU64::new(0)),
        };
        (sink, receiver)
    }

    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }
}

impl EventSink for RingSink {
    fn emit(&self, event: ObservedPacket) -> Result<(), EmitError> {
        try_emit(&self.sender, &self.lost, event)
    }
}

/// Backend picked when a datapath is composed.
#[derive(Clone)]
pub enum SinkBackend {
    PerCpu(PerCpuSink),
    Ring(RingSink),
}

impl SinkBackend {
    pub fn lost(&self) -> u64 {
        match self {
            SinkBackend::PerCpu(sink) => sink.lost(),
            SinkBackend::Ring(sink) => sink.lost(),
        }
    }
}

impl EventSink for SinkBackend {
    fn emit(&self, event: ObservedPacket) -> Result<(), EmitError> {
        match self {
            SinkBackend::PerCpu(sink) => sink.emit(event),
            SinkBackend::Ring(sink) => sink.emit(event),
        }
    }
}
