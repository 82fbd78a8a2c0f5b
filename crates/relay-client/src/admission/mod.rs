//! Inbound admission control.
//!
//! A registered service gets one [`AdmissionController`] holding two
//! independent gates, one per [`TrafficClass`]. Broadcast pressure never
//! blocks requests and vice versa.

pub mod gate;

pub use gate::{Admission, AdmissionPermit, Gate, GateSnapshot, Job, TrafficClass};

use crate::domain::limits::AdmissionLimits;
use std::sync::Arc;
use tokio::runtime::Handle;

/// Per-service admission controller.
pub struct AdmissionController {
    broadcast: Arc<Gate>,
    request: Arc<Gate>,
    limits: AdmissionLimits,
}

impl AdmissionController {
    /// Build both gates. Admitted units are spawned on `runtime`.
    pub fn new(limits: AdmissionLimits, runtime: Handle) -> Self {
        Self {
            broadcast: Gate::new(TrafficClass::Broadcast, limits.broadcast, runtime.clone()),
            request: Gate::new(TrafficClass::Request, limits.request, runtime),
            limits,
        }
    }

    pub fn gate(&self, class: TrafficClass) -> &Arc<Gate> {
        match class {
            TrafficClass::Broadcast => &self.broadcast,
            TrafficClass::Request => &self.request,
        }
    }

    /// Submit an inbound unit of `size` payload bytes.
    pub fn submit(&self, class: TrafficClass, size: usize, job: Job) -> Admission {
        self.gate(class).submit(size, job)
    }

    /// Stop both gates. Returns the number of running units aborted.
    pub fn shutdown(&self) -> usize {
        self.broadcast.shutdown() + self.request.shutdown()
    }

    /// Wait until no unit of either class is running.
    pub async fn wait_idle(&self) {
        self.broadcast.wait_idle().await;
        self.request.wait_idle().await;
    }

    pub fn snapshot(&self, class: TrafficClass) -> GateSnapshot {
        self.gate(class).snapshot()
    }

    pub fn limits(&self) -> AdmissionLimits {
        self.limits
    }
}
