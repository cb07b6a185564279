use std::sync::Arc;

use tcredir_common::{
    EventSink, Observer, RedirectConfig, Redirector, Restorer, Verdict,
};

use crate::conntrack::ConnTrackTable;

/// The three hooks wired to one shared table and one event sink.
///
/// Cheap to clone: give every worker its own copy (and, for per-CPU
/// telemetry, its own sink handle).
#[derive(Clone)]
pub struct Datapath<S> {
    observer: Observer<S>,
    redirector: Redirector<Arc<ConnTrackTable>>,
    restorer: Restorer<Arc<ConnTrackTable>>,
}

impl<S: EventSink> Datapath<S> {
    pub fn new(config: RedirectConfig, table: Arc<ConnTrackTable>, sink: S) -> Self {
        Self {
            observer: Observer::new(sink),
            redirector: Redirector::new(config, table.clone()),
            restorer: Restorer::new(config, table),
        }
    }

    /// Same table and config, different sink.
    pub fn with_sink<T: EventSink>(&self, sink: T) -> Datapath<T> {
        Datapath {
            observer: Observer::new(sink),
            redirector: self.redirector.clone(),
            restorer: self.restorer.clone(),
        }
    }

    pub fn config(&self) -> &RedirectConfig {
        self.redirector.config()
    }

    pub fn table(&self) -> &Arc<ConnTrackTable> {
        self.redirector.table()
    }

    pub fn sink(&self) -> &S {
        self.observer.sink()
    }

    /// Early observation point.
    pub fn observe(&self, frame: &[u8]) -> Verdict {
        self.observer.observe(frame)
    }

    /// Traffic headed for the host.
    pub fn ingress(&self, frame: &mut [u8]) -> Verdict {
        let verdict = self.redirector.ingress(frame);
        if verdict == Verdict::Drop {
            tracing::trace!(len = frame.len(), "ingress dropped malformed frame");
        }
        verdict
    }

    /// Traffic leaving the host.
    pub fn egress(&self, frame: &mut [u8]) -> Verdict {
        let verdict = self.restorer.egress(frame);
        if verdict == Verdict::Drop {
            tracing::trace!(len = frame.len(), "egress dropped malformed frame");
        }
        verdict
    }
}
