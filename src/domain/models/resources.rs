//! Multi-dimensional resource accounting.
//!
//! A [`ResourceSet`] describes what a task requests, what an offer
//! advertises, and what a capacity group is entitled to. All placement
//! arithmetic (fit checks, working-copy deduction, SLA gating) goes
//! through this type.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A bundle of schedulable resources.
///
/// Named consumables cover agent-local countable resources that do not fit
/// the fixed dimensions (e.g. GPU slots exposed under a pool name).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSet {
    pub cpu: f64,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub network_mbps: u64,
    pub gpus: u32,
    pub ports: u32,
    /// Named consumable pools, e.g. `"gpus" -> 4`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub consumables: BTreeMap<String, u32>,
}

impl ResourceSet {
    /// The empty resource set.
    pub fn none() -> Self {
        Self::default()
    }

    /// Convenience constructor for the two dimensions nearly every task sets.
    pub fn cpu_mem(cpu: f64, memory_mb: u64) -> Self {
        Self {
            cpu,
            memory_mb,
            ..Self::default()
        }
    }

    pub fn with_disk(mut self, disk_mb: u64) -> Self {
        self.disk_mb = disk_mb;
        self
    }

    pub fn with_network(mut self, network_mbps: u64) -> Self {
        self.network_mbps = network_mbps;
        self
    }

    pub fn with_gpus(mut self, gpus: u32) -> Self {
        self.gpus = gpus;
        self
    }

    pub fn with_ports(mut self, ports: u32) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_consumable(mut self, name: impl Into<String>, count: u32) -> Self {
        self.consumables.insert(name.into(), count);
        self
    }

    /// True when every dimension of `self` fits inside `available`.
    ///
    /// A requested consumable must exist in `available` with at least the
    /// requested count; consumables the request does not name are ignored.
    pub fn fits_within(&self, available: &Self) -> bool {
        if self.cpu > available.cpu
            || self.memory_mb > available.memory_mb
            || self.disk_mb > available.disk_mb
            || self.network_mbps > available.network_mbps
            || self.gpus > available.gpus
            || self.ports > available.ports
        {
            return false;
        }
        self.consumables
            .iter()
            .all(|(name, count)| available.consumables.get(name).copied().unwrap_or(0) >= *count)
    }

    /// Subtract `other` from `self`, returning `None` if any dimension
    /// would go negative.
    pub fn checked_sub(&self, other: &Self) -> Option<Self> {
        if !other.fits_within(self) {
            return None;
        }
        let mut consumables = self.consumables.clone();
        for (name, count) in &other.consumables {
            if let Some(pool) = consumables.get_mut(name) {
                *pool -= count;
            }
        }
        Some(Self {
            cpu: self.cpu - other.cpu,
            memory_mb: self.memory_mb - other.memory_mb,
            disk_mb: self.disk_mb - other.disk_mb,
            network_mbps: self.network_mbps - other.network_mbps,
            gpus: self.gpus - other.gpus,
            ports: self.ports - other.ports,
            consumables,
        })
    }

    /// Component-wise sum, used to aggregate offers on one agent and to
    /// accumulate per-group consumption.
    pub fn add(&self, other: &Self) -> Self {
        let mut consumables = self.consumables.clone();
        for (name, count) in &other.consumables {
            *consumables.entry(name.clone()).or_insert(0) += count;
        }
        Self {
            cpu: self.cpu + other.cpu,
            memory_mb: self.memory_mb + other.memory_mb,
            disk_mb: self.disk_mb + other.disk_mb,
            network_mbps: self.network_mbps + other.network_mbps,
            gpus: self.gpus + other.gpus,
            ports: self.ports + other.ports,
            consumables,
        }
    }

    /// True when usage has reached `cap` in at least one dimension that the
    /// cap actually bounds (zero cap dimensions are unbounded).
    ///
    /// This is the comparison capacity-group gating uses: a group is still
    /// below its share while `at_capacity` is false.
    pub fn at_capacity(&self, cap: &Self) -> bool {
        (cap.cpu > 0.0 && self.cpu >= cap.cpu)
            || (cap.memory_mb > 0 && self.memory_mb >= cap.memory_mb)
            || (cap.disk_mb > 0 && self.disk_mb >= cap.disk_mb)
            || (cap.network_mbps > 0 && self.network_mbps >= cap.network_mbps)
            || (cap.gpus > 0 && self.gpus >= cap.gpus)
            || (cap.ports > 0 && self.ports >= cap.ports)
            || cap.consumables.iter().any(|(name, cap_count)| {
                *cap_count > 0 && self.consumables.get(name).copied().unwrap_or(0) >= *cap_count
            })
    }

    /// Scale every dimension by `factor`, rounding integral dimensions up.
    ///
    /// Used to apply the capacity-group buffer (`max * (1 + buffer)`).
    pub fn scaled(&self, factor: f64) -> Self {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        fn scale_u64(v: u64, factor: f64) -> u64 {
            (v as f64 * factor).ceil() as u64
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        fn scale_u32(v: u32, factor: f64) -> u32 {
            (f64::from(v) * factor).ceil() as u32
        }
        Self {
            cpu: self.cpu * factor,
            memory_mb: scale_u64(self.memory_mb, factor),
            disk_mb: scale_u64(self.disk_mb, factor),
            network_mbps: scale_u64(self.network_mbps, factor),
            gpus: scale_u32(self.gpus, factor),
            ports: scale_u32(self.ports, factor),
            consumables: self
                .consumables
                .iter()
                .map(|(name, count)| (name.clone(), scale_u32(*count, factor)))
                .collect(),
        }
    }

    /// True when no dimension carries any capacity.
    pub fn is_empty(&self) -> bool {
        self.cpu <= 0.0
            && self.memory_mb == 0
            && self.disk_mb == 0
            && self.network_mbps == 0
            && self.gpus == 0
            && self.ports == 0
            && self.consumables.values().all(|c| *c == 0)
    }
}
