//! Backend registry.
//!
//! # Responsibilities
//! - Own every registered backend record
//! - Publish immutable, versioned snapshots for selection
//! - Provide the narrow write path (register, deregister, health, weight)
//! - Hand out in-flight leases that release exactly once
//!
//! # Design Decisions
//! - Membership is copy-on-write behind `ArcSwap`; readers never take a lock
//! - Writers serialize on a small mutex so concurrent edits cannot lose updates
//! - Health and in-flight counts live in atomics and are sampled into the snapshot

use arc_swap::ArcSwap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::BackendConfig;
use crate::load_balancer::backend::{Backend, BackendId, BackendView, HealthState};

/// Errors raised by registry writes (administrative misuse).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("backend {0} is already registered")]
    Duplicate(BackendId),

    #[error("backend {0} is not registered")]
    Unknown(BackendId),
}

#[derive(Debug, Default)]
struct Membership {
    epoch: u64,
    backends: Vec<Arc<Backend>>,
}

impl Membership {
    fn find(&self, id: &BackendId) -> Option<&Arc<Backend>> {
        self.backends.iter().find(|b| b.id() == id)
    }
}

/// Immutable point-in-time view of the registry.
#[derive(Debug, Clone)]
pub struct Snapshot {
    version: u64,
    epoch: u64,
    backends: Arc<[BackendView]>,
}

impl Snapshot {
    /// Build a snapshot directly. Used by tests and by policies' callers that
    /// already hold a backend list.
    pub fn new(version: u64, epoch: u64, backends: Vec<BackendView>) -> Self {
        Self {
            version,
            epoch,
            backends: backends.into(),
        }
    }

    /// Bumped on every registry write.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Bumped only when the set of backends (or their weights) changes.
    pub fn membership_epoch(&self) -> u64 {
        self.epoch
    }

    /// Backends in registration order.
    pub fn backends(&self) -> &[BackendView] {
        &self.backends
    }

    pub fn get(&self, id: &BackendId) -> Option<&BackendView> {
        self.backends.iter().find(|b| &b.id == id)
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn total_in_flight(&self) -> usize {
        self.backends.iter().map(|b| b.in_flight).sum()
    }
}

/// Owner of all backend records.
#[derive(Debug, Default)]
pub struct Registry {
    members: ArcSwap<Membership>,
    write_lock: Mutex<()>,
    version: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry pre-populated from configuration.
    pub fn from_configs(configs: &[BackendConfig]) -> Result<Self, RegistryError> {
        let registry = Self::new();
        for config in configs {
            registry.register(config)?;
        }
        Ok(registry)
    }

    /// Register a new backend.
    pub fn register(&self, config: &BackendConfig) -> Result<BackendView, RegistryError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.members.load_full();
        let id = config.id();
        if current.find(&id).is_some() {
            return Err(RegistryError::Duplicate(id));
        }

        let backend = Arc::new(Backend::new(config));
        backend.report_health();
        let view = backend.view();
        let mut backends = current.backends.clone();
        backends.push(backend);
        self.publish(current.epoch + 1, backends);

        tracing::info!(backend = %id, weight = view.weight, "Backend registered");
        Ok(view)
    }

    /// Remove a backend. Outstanding leases stay valid and release into the
    /// detached record.
    pub fn deregister(&self, id: &BackendId) -> Result<BackendView, RegistryError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.members.load_full();
        let removed = current
            .find(id)
            .cloned()
            .ok_or_else(|| RegistryError::Unknown(id.clone()))?;

        let backends = current
            .backends
            .iter()
            .filter(|b| b.id() != id)
            .cloned()
            .collect();
        self.publish(current.epoch + 1, backends);

        tracing::info!(backend = %id, in_flight = removed.in_flight(), "Backend deregistered");
        Ok(removed.view())
    }

    /// Set the probe-driven health of a backend.
    ///
    /// A `Draining` backend keeps its state: only [`Registry::drain`] and
    /// [`Registry::undrain`] move a backend in or out of draining.
    pub fn update_health(&self, id: &BackendId, state: HealthState) -> Result<(), RegistryError> {
        let members = self.members.load();
        let backend = members
            .find(id)
            .ok_or_else(|| RegistryError::Unknown(id.clone()))?;

        if state == HealthState::Draining {
            return self.drain(id);
        }
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = backend.health();
        if previous == HealthState::Draining || previous == state {
            return Ok(());
        }
        backend.set_health(state);
        self.version.fetch_add(1, Ordering::AcqRel);

        tracing::info!(backend = %id, from = %previous, to = %state, "Backend health changed");
        Ok(())
    }

    /// Stop routing new requests to a backend.
    pub fn drain(&self, id: &BackendId) -> Result<(), RegistryError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let members = self.members.load();
        let backend = members
            .find(id)
            .ok_or_else(|| RegistryError::Unknown(id.clone()))?;
        let previous = backend.set_health(HealthState::Draining);
        if previous != HealthState::Draining {
            self.version.fetch_add(1, Ordering::AcqRel);
            tracing::info!(backend = %id, in_flight = backend.in_flight(), "Backend draining");
        }
        Ok(())
    }

    /// Return a draining backend to rotation. It re-enters as `Healthy` and the
    /// prober takes over from there.
    pub fn undrain(&self, id: &BackendId) -> Result<(), RegistryError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let members = self.members.load();
        let backend = members
            .find(id)
            .ok_or_else(|| RegistryError::Unknown(id.clone()))?;
        if backend.health() == HealthState::Draining {
            backend.set_health(HealthState::Healthy);
            self.version.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    pub fn set_weight(&self, id: &BackendId, weight: u32) -> Result<(), RegistryError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.members.load_full();
        let backend = current
            .find(id)
            .ok_or_else(|| RegistryError::Unknown(id.clone()))?;
        if backend.weight() != weight.max(1) {
            backend.set_weight(weight);
            // Weighted rings and cursors depend on weights, so treat it as a
            // membership change.
            self.publish(current.epoch + 1, current.backends.clone());
        }
        Ok(())
    }

    /// Bring membership in line with a freshly loaded configuration.
    pub fn reconcile(&self, configs: &[BackendConfig]) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        let wanted: HashSet<BackendId> = configs.iter().map(BackendConfig::id).collect();

        for view in self.snapshot().backends() {
            if !wanted.contains(&view.id) && self.deregister(&view.id).is_ok() {
                summary.removed.push(view.id.clone());
            }
        }

        for config in configs {
            let id = config.id();
            match self.register(config) {
                Ok(_) => summary.added.push(id),
                Err(RegistryError::Duplicate(_)) => {
                    let before = self.get(&id).map(|b| b.weight);
                    if before != Some(config.weight.max(1)) && self.set_weight(&id, config.weight).is_ok() {
                        summary.reweighted.push(id);
                    }
                }
                Err(RegistryError::Unknown(_)) => {}
            }
        }
        summary
    }

    pub fn get(&self, id: &BackendId) -> Option<BackendView> {
        self.members.load().find(id).map(|b| b.view())
    }

    pub fn contains(&self, id: &BackendId) -> bool {
        self.members.load().find(id).is_some()
    }

    /// Capture the current state. Never blocks writers.
    pub fn snapshot(&self) -> Snapshot {
        let members = self.members.load();
        let version = self.version.load(Ordering::Acquire);
        Snapshot::new(
            version,
            members.epoch,
            members.backends.iter().map(|b| b.view()).collect(),
        )
    }

    /// Count a new in-flight request against a backend.
    pub fn acquire(&self, id: &BackendId) -> Result<InFlightLease, RegistryError> {
        let members = self.members.load();
        let backend = members
            .find(id)
            .cloned()
            .ok_or_else(|| RegistryError::Unknown(id.clone()))?;
        backend.inc_in_flight();
        Ok(InFlightLease {
            backend,
            released: AtomicBool::new(false),
        })
    }

    fn publish(&self, epoch: u64, backends: Vec<Arc<Backend>>) {
        self.members.store(Arc::new(Membership { epoch, backends }));
        self.version.fetch_add(1, Ordering::AcqRel);
    }
}

/// What a [`Registry::reconcile`] call changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub added: Vec<BackendId>,
    pub removed: Vec<BackendId>,
    pub reweighted: Vec<BackendId>,
}

impl ReconcileSummary {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.reweighted.is_empty()
    }
}

/// A RAII guard for one in-flight attempt against a backend.
///
/// The count is decremented exactly once: by [`InFlightLease::release`] or on drop,
/// whichever comes first.
#[derive(Debug)]
pub struct InFlightLease {
    backend: Arc<Backend>,
    released: AtomicBool,
}

impl InFlightLease {
    pub fn backend_id(&self) -> &BackendId {
        self.backend.id()
    }

    /// Release the slot. Returns `false` if it had already been released.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.backend.dec_in_flight();
        true
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for InFlightLease {
    fn drop(&mut self) {
        self.release();
    }
}
