//! Tape-capacity fitting.
//!
//! The schedule queue is ordered (priority descending, size descending,
//! insertion order). When the aggregate — each entry costed with the
//! per-file tape overhead — exceeds the tape length, a four-pass fit
//! trims it, recording every change in a LIFO undo log:
//!
//! 1. Entries that alone exceed the tape: demote to the precomputed
//!    degraded alternative, or drop when none exists.
//! 2. Demote full dumps to incrementals from the low-priority end,
//!    never touching the single highest-priority full.
//! 3. Drop incrementals from the low-priority end; if fulls without a
//!    degraded alternative still push the total over, drop those too
//!    (same direction, same highest-priority-full exemption).
//! 4. Replay the undo log most-recent-first, reinstating every change
//!    that still fits.
//!
//! Replaying the whole undo log in reverse without the fit test
//! reconstructs the pre-fit schedule exactly.

use tracing::{debug, info};

use spool_core::{Kb, ScheduleEntry};

/// Why a filesystem fell out of tonight's schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedEntry {
    pub host: String,
    pub device: String,
    pub level: u32,
    pub reason: String,
}

/// Outcome of a fitting run.
#[derive(Debug, Clone, Default)]
pub struct FitReport {
    /// Final scheduled bytes including per-entry tape overhead.
    pub total_kb: Kb,
    pub dropped: Vec<DroppedEntry>,
    pub demoted: usize,
    pub reinstated: usize,
}

#[derive(Debug)]
enum UndoRecord {
    /// Entry at `slot` was dropped from the schedule.
    Dropped { slot: usize },
    /// Entry at `slot` was demoted; `prev` is its pre-demotion image.
    Demoted { slot: usize, prev: ScheduleEntry },
}

struct Fitter {
    entries: Vec<ScheduleEntry>,
    active: Vec<bool>,
    undo: Vec<UndoRecord>,
    tape_len: Kb,
    /// Tape overhead per dump image: header filemark + EOF filemark.
    overhead: Kb,
    total: Kb,
}

impl Fitter {
    fn cost(&self, slot: usize) -> Kb {
        self.entries[slot].size + self.overhead
    }

    fn drop_slot(&mut self, slot: usize) {
        self.total -= self.cost(slot);
        self.active[slot] = false;
        self.undo.push(UndoRecord::Dropped { slot });
    }

    fn demote_slot(&mut self, slot: usize) -> bool {
        let prev = self.entries[slot].clone();
        if !self.entries[slot].demote() {
            return false;
        }
        self.total = self.total - prev.size + self.entries[slot].size;
        self.undo.push(UndoRecord::Demoted { slot, prev });
        true
    }

    /// Index of the highest-priority active full, which passes 2 and 3
    /// must never touch.
    fn protected_full(&self) -> Option<usize> {
        (0..self.entries.len()).find(|&i| self.active[i] && self.entries[i].level == 0)
    }
}

/// Order the schedule queue: priority descending, then estimated size
/// descending. The sort is stable so equal entries keep insertion order.
pub fn build_schedule(mut entries: Vec<ScheduleEntry>) -> Vec<ScheduleEntry> {
    entries.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(b.size.cmp(&a.size))
    });
    entries
}

/// Fit `entries` (already in schedule order) to `tape_len`, mutating the
/// list in place. Dropped entries are removed; demoted entries keep
/// their position with degraded fields swapped in.
pub fn fit_schedule(
    entries: &mut Vec<ScheduleEntry>,
    tape_len: Kb,
    filemark_kb: Kb,
) -> FitReport {
    let overhead = filemark_kb * 2;
    let total: Kb = entries.iter().map(|e| e.size + overhead).sum();

    if total <= tape_len {
        return FitReport {
            total_kb: total,
            ..FitReport::default()
        };
    }
    info!(total, tape_len, "schedule exceeds tape length, fitting");

    let mut fitter = Fitter {
        active: vec![true; entries.len()],
        entries: std::mem::take(entries),
        undo: Vec::new(),
        tape_len,
        overhead,
        total,
    };

    pass_oversize(&mut fitter);
    pass_demote_fulls(&mut fitter);
    pass_drop(&mut fitter);
    let reinstated = pass_reinstate(&mut fitter);

    let mut dropped = Vec::new();
    let mut demoted = 0;
    let mut kept = Vec::new();
    for (slot, entry) in fitter.entries.into_iter().enumerate() {
        if fitter.active[slot] {
            if fitter
                .undo
                .iter()
                .any(|u| matches!(u, UndoRecord::Demoted { slot: s, .. } if *s == slot))
            {
                demoted += 1;
            }
            kept.push(entry);
        } else {
            dropped.push(DroppedEntry {
                host: entry.host,
                device: entry.device,
                level: entry.level,
                reason: "does not fit on tape".to_string(),
            });
        }
    }
    *entries = kept;

    FitReport {
        total_kb: fitter.total,
        dropped,
        demoted,
        reinstated,
    }
}

/// Pass 1: entries that alone exceed the tape.
fn pass_oversize(fitter: &mut Fitter) {
    for slot in 0..fitter.entries.len() {
        if !fitter.active[slot] || fitter.cost(slot) <= fitter.tape_len {
            continue;
        }
        let key = fitter.entries[slot].disk_key();
        if fitter.demote_slot(slot) {
            debug!(%key, "oversize entry demoted to degraded level");
            // A degraded image can still be oversize on a short tape.
            if fitter.cost(slot) > fitter.tape_len {
                fitter.drop_slot(slot);
                debug!(%key, "degraded image still oversize, dropped");
            }
        } else {
            fitter.drop_slot(slot);
            debug!(%key, "oversize entry has no degraded alternative, dropped");
        }
    }
}

/// Pass 2: demote fulls, lowest priority first, sparing the
/// highest-priority full.
fn pass_demote_fulls(fitter: &mut Fitter) {
    while fitter.total > fitter.tape_len {
        let Some(protected) = fitter.protected_full() else {
            return;
        };
        let candidate = (protected + 1..fitter.entries.len())
            .rev()
            .find(|&slot| {
                fitter.active[slot]
                    && fitter.entries[slot].level == 0
                    && fitter.entries[slot].degraded.is_some()
            });
        let Some(slot) = candidate else {
            return;
        };
        fitter.demote_slot(slot);
        debug!(key = %fitter.entries[slot].disk_key(), "full demoted to fit tape");
    }
}

/// Pass 3: drop from the low-priority end — incrementals first, then
/// undemotable fulls, sparing the highest-priority full.
fn pass_drop(fitter: &mut Fitter) {
    while fitter.total > fitter.tape_len {
        let slot = (0..fitter.entries.len())
            .rev()
            .find(|&s| fitter.active[s] && fitter.entries[s].level > 0);
        let Some(slot) = slot else { break };
        fitter.drop_slot(slot);
        debug!(key = %fitter.entries[slot].disk_key(), "incremental dropped to fit tape");
    }

    while fitter.total > fitter.tape_len {
        let Some(protected) = fitter.protected_full() else {
            return;
        };
        let slot = (protected + 1..fitter.entries.len())
            .rev()
            .find(|&s| fitter.active[s] && fitter.entries[s].level == 0);
        let Some(slot) = slot else { return };
        fitter.drop_slot(slot);
        debug!(key = %fitter.entries[slot].disk_key(), "full dropped to fit tape");
    }
}

/// Pass 4: replay the undo log most-recent-first, reinstating whatever
/// still fits.
fn pass_reinstate(fitter: &mut Fitter) -> usize {
    let mut reinstated = 0;
    let undo = std::mem::take(&mut fitter.undo);
    let mut kept_undo = Vec::new();

    for record in undo.into_iter().rev() {
        match record {
            UndoRecord::Dropped { slot } => {
                let cost = fitter.cost(slot);
                if fitter.total + cost <= fitter.tape_len {
                    fitter.active[slot] = true;
                    fitter.total += cost;
                    reinstated += 1;
                    debug!(key = %fitter.entries[slot].disk_key(), "dropped entry reinstated");
                } else {
                    kept_undo.push(UndoRecord::Dropped { slot });
                }
            }
            UndoRecord::Demoted { slot, prev } => {
                let restored = fitter.total - fitter.entries[slot].size + prev.size;
                if fitter.active[slot] && restored <= fitter.tape_len {
                    fitter.entries[slot] = prev;
                    fitter.total = restored;
                    reinstated += 1;
                    debug!(key = %fitter.entries[slot].disk_key(), "demotion reversed");
                } else {
                    kept_undo.push(UndoRecord::Demoted { slot, prev });
                }
            }
        }
    }

    kept_undo.reverse();
    fitter.undo = kept_undo;
    reinstated
}

#[cfg(test)]
mod tests {
    use super::*;
    use spool_core::DegradedEntry;

    fn entry(host: &str, priority: u32, level: u32, size: Kb, degraded: Option<Kb>) -> ScheduleEntry {
        ScheduleEntry {
            host: host.to_string(),
            device: "/data".to_string(),
            priority,
            level,
            dumpdate: 0,
            size,
            time_secs: size / 100,
            degraded: degraded.map(|dsize| DegradedEntry {
                level: 1,
                dumpdate: 20_490,
                size: dsize,
                time_secs: dsize / 100,
            }),
        }
    }

    #[test]
    fn build_schedule_orders_by_priority_then_size() {
        let entries = build_schedule(vec![
            entry("small", 5, 0, 100, None),
            entry("big", 5, 0, 900, None),
            entry("urgent", 9, 0, 10, None),
        ]);
        let hosts: Vec<&str> = entries.iter().map(|e| e.host.as_str()).collect();
        assert_eq!(hosts, vec!["urgent", "big", "small"]);
    }

    #[test]
    fn within_capacity_is_untouched() {
        let mut entries = vec![entry("a", 5, 0, 400, None), entry("b", 4, 1, 100, None)];
        let report = fit_schedule(&mut entries, 1000, 10);
        assert_eq!(entries.len(), 2);
        assert!(report.dropped.is_empty());
        assert_eq!(report.total_kb, 540);
    }

    // Scenario A: one filesystem over tape length is demoted when it
    // can be, dropped when it cannot.
    #[test]
    fn single_oversize_entry_demotes_or_drops() {
        let mut entries = vec![entry("a", 5, 0, 2000, Some(100))];
        let report = fit_schedule(&mut entries, 1000, 0);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, 1);
        assert_eq!(entries[0].size, 100);
        assert!(report.dropped.is_empty());

        let mut entries = vec![entry("a", 5, 0, 2000, None)];
        let report = fit_schedule(&mut entries, 1000, 0);
        assert!(entries.is_empty());
        assert_eq!(report.dropped.len(), 1);
        assert_eq!(report.dropped[0].host, "a");
    }

    // Scenario B: equal-priority fulls demote from the insertion-order
    // tail; the head full survives untouched.
    #[test]
    fn equal_priority_fulls_demote_from_the_tail() {
        let names = ["f0", "f1", "f2", "f3", "f4", "f5", "f6", "f7", "f8", "f9"];
        let entries: Vec<ScheduleEntry> = names
            .iter()
            .map(|name| entry(name, 5, 0, 150, Some(10)))
            .collect();
        let mut entries = build_schedule(entries);

        // Total 1500, tape 1000: demote from the tail until it fits.
        let report = fit_schedule(&mut entries, 1000, 0);
        assert!(report.dropped.is_empty());
        assert!(report.total_kb <= 1000);

        assert_eq!(entries[0].host, "f0");
        assert_eq!(entries[0].level, 0, "highest-priority full must survive");
        let demoted: Vec<&str> = entries
            .iter()
            .filter(|e| e.level == 1)
            .map(|e| e.host.as_str())
            .collect();
        assert_eq!(demoted, vec!["f6", "f7", "f8", "f9"]);
    }

    #[test]
    fn incrementals_drop_lowest_priority_first() {
        let mut entries = build_schedule(vec![
            entry("full", 9, 0, 800, None),
            entry("inc-hi", 5, 1, 150, None),
            entry("inc-lo", 2, 1, 150, None),
        ]);
        let report = fit_schedule(&mut entries, 1000, 0);
        assert_eq!(report.dropped.len(), 1);
        assert_eq!(report.dropped[0].host, "inc-lo");
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn undemotable_fulls_drop_but_never_the_protected_one() {
        let mut entries = build_schedule(vec![
            entry("new-a", 5, 0, 600, None),
            entry("new-b", 4, 0, 600, None),
        ]);
        let report = fit_schedule(&mut entries, 1000, 0);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].host, "new-a");
        assert_eq!(report.dropped[0].host, "new-b");
        assert!(report.total_kb <= 1000);
    }

    // Pass 4: an over-aggressive cut is reinstated once later cuts free
    // enough room.
    #[test]
    fn reinstatement_recovers_over_aggressive_cuts() {
        // Pass 3 drops the small incremental first (lowest priority),
        // then the big one; dropping the big one makes room for the
        // small one again.
        let mut entries = build_schedule(vec![
            entry("full", 9, 0, 500, None),
            entry("inc-big", 5, 1, 600, None),
            entry("inc-small", 3, 1, 100, None),
        ]);
        let report = fit_schedule(&mut entries, 1000, 0);

        let hosts: Vec<&str> = entries.iter().map(|e| e.host.as_str()).collect();
        assert_eq!(hosts, vec!["full", "inc-small"]);
        assert_eq!(report.reinstated, 1);
        assert_eq!(report.dropped.len(), 1);
        assert_eq!(report.dropped[0].host, "inc-big");
        assert_eq!(report.total_kb, 600);
    }

    #[test]
    fn demotion_reversed_when_a_later_drop_frees_room() {
        // Pass 2 demotes "b" (saving only 100), pass 3 then drops the
        // big incremental; with 600 KB free, pass 4 restores "b" to a
        // full.
        let mut entries = build_schedule(vec![
            entry("a", 9, 0, 400, None),
            entry("b", 8, 0, 200, Some(100)),
            entry("inc", 7, 1, 600, None),
        ]);
        let report = fit_schedule(&mut entries, 1000, 0);

        let b = entries.iter().find(|e| e.host == "b").unwrap();
        assert_eq!(b.level, 0, "demotion should be reversed");
        assert_eq!(b.size, 200);
        assert_eq!(report.reinstated, 1);
        assert_eq!(report.dropped[0].host, "inc");
        assert_eq!(report.total_kb, 600);
    }

    #[test]
    fn capacity_invariant_holds_after_fitting() {
        // A spread of shapes; whatever the passes do, the post-fit
        // total must respect the tape.
        let mut entries = build_schedule(vec![
            entry("a", 9, 0, 900, Some(50)),
            entry("b", 8, 0, 850, Some(40)),
            entry("c", 7, 0, 800, None),
            entry("d", 6, 1, 300, None),
            entry("e", 5, 1, 250, None),
            entry("f", 4, 0, 1500, Some(60)),
            entry("g", 3, 0, 2500, None),
        ]);
        let report = fit_schedule(&mut entries, 2000, 10);
        assert!(report.total_kb <= 2000, "total {} > 2000", report.total_kb);
        let recomputed: Kb = entries.iter().map(|e| e.size + 20).sum();
        assert_eq!(recomputed, report.total_kb);
    }

    #[test]
    fn tape_overhead_counts_against_capacity() {
        // Two entries of 400 fit a 1000 tape only without overhead.
        let mut entries = build_schedule(vec![
            entry("a", 5, 1, 400, None),
            entry("b", 4, 1, 400, None),
        ]);
        let report = fit_schedule(&mut entries, 1000, 150);
        assert_eq!(entries.len(), 1);
        assert_eq!(report.total_kb, 700);
    }
}
