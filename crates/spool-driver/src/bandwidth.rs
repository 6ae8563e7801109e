//! Bandwidth ledger — per-interface kbps admission accounting.
//!
//! Pure bookkeeping: the driver asks `available` before dispatching and
//! records the grant with `allocate`. An idle interface is treated as
//! unconstrained so the first dump onto a freshly freed interface is
//! never starved; the grant is capped at the interface maximum in that
//! case, which keeps recorded usage within the configured budget.

use std::collections::HashMap;

use spool_core::config::InterfaceConfig;

#[derive(Debug)]
struct Interface {
    max_kbps: u64,
    used_kbps: u64,
}

/// Per-interface kbps budgets. Not a rate limiter — an admission
/// predicate only.
#[derive(Debug, Default)]
pub struct BandwidthLedger {
    interfaces: HashMap<String, Interface>,
}

impl BandwidthLedger {
    pub fn new(configs: &[InterfaceConfig]) -> Self {
        let interfaces = configs
            .iter()
            .map(|c| {
                (
                    c.name.clone(),
                    Interface {
                        max_kbps: c.max_kbps,
                        used_kbps: 0,
                    },
                )
            })
            .collect();
        Self { interfaces }
    }

    /// Headroom on `name`. An idle interface reports unconstrained; an
    /// interface absent from the config is never a gate.
    pub fn available(&self, name: &str) -> u64 {
        match self.interfaces.get(name) {
            None => u64::MAX,
            Some(iface) if iface.used_kbps == 0 => u64::MAX,
            Some(iface) => iface.max_kbps.saturating_sub(iface.used_kbps),
        }
    }

    /// Record a grant of up to `kbps` and return the amount actually
    /// booked, which the caller must pass back to `release`.
    ///
    /// The grant is capped at the interface maximum when the interface
    /// was idle (the unconstrained-admission case), so `used <= max`
    /// holds whenever callers gate on `available` first.
    pub fn allocate(&mut self, name: &str, kbps: u64) -> u64 {
        let Some(iface) = self.interfaces.get_mut(name) else {
            return 0;
        };
        let granted = if iface.used_kbps == 0 {
            kbps.min(iface.max_kbps)
        } else {
            kbps
        };
        iface.used_kbps += granted;
        granted
    }

    /// Return a grant.
    pub fn release(&mut self, name: &str, granted: u64) {
        if let Some(iface) = self.interfaces.get_mut(name) {
            iface.used_kbps = iface.used_kbps.saturating_sub(granted);
        }
    }

    /// Current usage, for diagnostics.
    pub fn usage(&self, name: &str) -> u64 {
        self.interfaces.get(name).map_or(0, |i| i.used_kbps)
    }
}
