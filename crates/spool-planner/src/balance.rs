//! Full-dump load balancing across the dump cycle.
//!
//! After fitting, a run whose full-dump volume is under the per-run
//! fair share pulls future fulls forward:
//!
//! 1. **Promotion**: scan 1..dumpcycle−1 days ahead and promote the
//!    first due-soon full whose promotion keeps the schedule on tape
//!    and tonight's full volume within a tolerance band of fair share.
//! 2. **Hill flattening**: when no scan candidate qualifies, find the
//!    future day carrying the most full-dump bytes among days with more
//!    than one full scheduled, and pull one of its dumps forward while
//!    it still fits; repeat until no hill remains.

use tracing::{debug, info};

use spool_core::{Kb, ScheduleEntry};

/// A filesystem due for a full dump on a future day, eligible for
/// promotion into tonight's schedule.
#[derive(Debug, Clone)]
pub struct FullCandidate {
    pub host: String,
    pub device: String,
    pub priority: u32,
    /// Days from tonight until the full is due (≥ 1).
    pub due_in_days: u32,
    /// Estimated or last-known full size.
    pub size: Kb,
    pub time_secs: u64,
}

/// Inputs the balancer needs from config.
#[derive(Debug, Clone, Copy)]
pub struct BalanceParams {
    pub tape_length_kb: Kb,
    pub filemark_kb: Kb,
    pub dumpcycle_days: u32,
    pub runs_per_cycle: u32,
    /// Allowed overshoot of the fair share, as a fraction (0.2 = 20%).
    pub tolerance: f64,
}

/// What the balancer did, for logging and tests.
#[derive(Debug, Clone, Default)]
pub struct BalanceReport {
    /// (host, device) pairs promoted to a full tonight.
    pub promoted: Vec<(String, String)>,
    /// Promotions that came from hill flattening rather than the scan.
    pub flattened: usize,
}

/// Balance tonight's full-dump volume against the cycle's fair share.
///
/// `candidates` are consumed as they are promoted; `schedule` keeps its
/// (priority desc, size desc) order.
pub fn balance_schedule(
    schedule: &mut Vec<ScheduleEntry>,
    candidates: &mut Vec<FullCandidate>,
    params: &BalanceParams,
) -> BalanceReport {
    let overhead = params.filemark_kb * 2;
    let mut total: Kb = schedule.iter().map(|e| e.size + overhead).sum();
    let mut tonight_full: Kb = schedule
        .iter()
        .filter(|e| e.level == 0)
        .map(|e| e.size)
        .sum();

    // Fair share: all full volume in the cycle, spread over its runs.
    let cycle_full: Kb = tonight_full + candidates.iter().map(|c| c.size).sum::<Kb>();
    let fair_share = cycle_full / params.runs_per_cycle.max(1) as u64;
    let band = fair_share + (fair_share as f64 * params.tolerance) as Kb;

    let mut report = BalanceReport::default();
    if tonight_full >= fair_share {
        return report;
    }
    debug!(tonight_full, fair_share, "run is under fair share, balancing");

    while tonight_full < fair_share {
        // Net tape cost of promoting: the full replaces any incremental
        // already scheduled tonight for the same filesystem.
        let displaced_cost = |c: &FullCandidate| {
            schedule
                .iter()
                .find(|e| e.host == c.host && e.device == c.device)
                .map(|e| e.size + overhead)
                .unwrap_or(0)
        };
        let fits_tape = |c: &FullCandidate| {
            total + c.size + overhead - displaced_cost(c) <= params.tape_length_kb
        };

        // Promotion scan, nearest due day first.
        let mut pick = None;
        'days: for day in 1..params.dumpcycle_days {
            for (idx, c) in candidates.iter().enumerate() {
                if c.due_in_days != day {
                    continue;
                }
                if fits_tape(c) && tonight_full + c.size <= band {
                    pick = Some((idx, false));
                    break 'days;
                }
            }
        }

        // Hill flattening: heaviest future day with more than one full.
        if pick.is_none() {
            if let Some(hill_day) = heaviest_crowded_day(candidates) {
                pick = candidates
                    .iter()
                    .enumerate()
                    .find(|(_, c)| c.due_in_days == hill_day && fits_tape(c))
                    .map(|(idx, _)| (idx, true));
            }
        }

        let Some((idx, from_hill)) = pick else {
            break;
        };
        let c = candidates.remove(idx);
        info!(
            host = %c.host,
            device = %c.device,
            due_in_days = c.due_in_days,
            from_hill,
            "promoting full dump to tonight"
        );

        // Displace tonight's incremental for this filesystem, if any.
        if let Some(pos) = schedule
            .iter()
            .position(|e| e.host == c.host && e.device == c.device)
        {
            let displaced = schedule.remove(pos);
            total -= displaced.size + overhead;
        }

        total += c.size + overhead;
        tonight_full += c.size;
        insert_in_order(
            schedule,
            ScheduleEntry {
                host: c.host.clone(),
                device: c.device.clone(),
                priority: c.priority,
                level: 0,
                // A promoted full dumps everything since the epoch.
                dumpdate: 0,
                size: c.size,
                time_secs: c.time_secs,
                degraded: None,
            },
        );
        report.promoted.push((c.host, c.device));
        if from_hill {
            report.flattened += 1;
        }
    }

    report
}

/// The future day with the most aggregate full bytes among days with
/// more than one full due.
fn heaviest_crowded_day(candidates: &[FullCandidate]) -> Option<u32> {
    let mut best: Option<(u32, Kb, usize)> = None;
    let days: std::collections::BTreeSet<u32> =
        candidates.iter().map(|c| c.due_in_days).collect();
    for day in days {
        let (bytes, count) = candidates
            .iter()
            .filter(|c| c.due_in_days == day)
            .fold((0, 0), |(b, n), c| (b + c.size, n + 1));
        if count > 1 && best.is_none_or(|(_, b, _)| bytes > b) {
            best = Some((day, bytes, count));
        }
    }
    best.map(|(day, _, _)| day)
}

/// Insert keeping (priority desc, size desc) order, after equal keys.
fn insert_in_order(schedule: &mut Vec<ScheduleEntry>, entry: ScheduleEntry) {
    let pos = schedule
        .partition_point(|e| (e.priority, e.size) >= (entry.priority, entry.size));
    schedule.insert(pos, entry);
}
