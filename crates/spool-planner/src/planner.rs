//! The planning pipeline: disklist + history → estimates → schedule.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use spool_core::{
    DegradedEntry, Disk, DiskId, EpochDay, HistoricalStats, Kb, ScheduleEntry, SpoolConfig,
};
use spool_state::{LogKind, RunLog, StatsStore};

use crate::balance::{BalanceParams, BalanceReport, FullCandidate, balance_schedule};
use crate::error::PlanResult;
use crate::estimate::{
    CandidateLevels, DEFAULT_RATE_KPS, EstimateRequest, EstimateSource, LevelEstimate,
    candidate_levels, gather_estimates, next_level, pick_incremental_level, since_date,
};
use crate::fit::{FitReport, build_schedule, fit_schedule};

/// Fraction by which a promoted full may push tonight's volume past the
/// fair share.
const BALANCE_TOLERANCE: f64 = 0.2;

/// Everything the planning run produced, for the caller to emit and log.
#[derive(Debug)]
pub struct PlanOutcome {
    pub schedule: Vec<ScheduleEntry>,
    /// Filesystems failed for the night: (host, device, reason).
    pub failed: Vec<(String, String, String)>,
    pub fit: FitReport,
    pub balance: BalanceReport,
}

/// The estimate & fit engine.
pub struct Planner {
    config: SpoolConfig,
    source: Arc<dyn EstimateSource>,
    stats: StatsStore,
    runlog: RunLog,
}

impl Planner {
    pub fn new(
        config: SpoolConfig,
        source: Arc<dyn EstimateSource>,
        stats: StatsStore,
        runlog: RunLog,
    ) -> Self {
        Self {
            config,
            source,
            stats,
            runlog,
        }
    }

    /// Plan tonight's run.
    ///
    /// Per-filesystem failures (estimate timeouts, unreachable hosts,
    /// entries that cannot fit) are logged and reported in the outcome;
    /// only a broken collaborator store fails the whole call.
    pub async fn plan(&self, disks: &[Disk], today: EpochDay) -> PlanResult<PlanOutcome> {
        self.runlog
            .append(LogKind::Start, &["planner", &today.to_string()]);

        // Candidate levels per disk, and the estimate fan-out batches.
        let mut stats_by_disk: HashMap<DiskId, HistoricalStats> = HashMap::new();
        let mut cands_by_disk: HashMap<DiskId, CandidateLevels> = HashMap::new();
        let mut by_host: HashMap<String, Vec<EstimateRequest>> = HashMap::new();
        let mut balance_candidates: Vec<FullCandidate> = Vec::new();

        for (disk_id, disk) in disks.iter().enumerate() {
            let stats = self.stats.get(&disk.host, &disk.device)?.unwrap_or_default();
            let Some(cands) = candidate_levels(disk, &stats, self.config.cycle.dumpcycle_days, today)
            else {
                // An incremental-only disk with no full on record can't
                // build a chain; worth a report line, not a failure.
                if disk.strategy == spool_core::DumpStrategy::IncrOnly && stats.is_new() {
                    self.runlog.append(
                        LogKind::Warning,
                        &[&disk.host, &disk.device, "incremental-only disk has no full dump"],
                    );
                }
                debug!(host = %disk.host, device = %disk.device, "skipped tonight");
                continue;
            };

            // A disk whose full is due on a later day is a balancing
            // candidate, sized by its last known full.
            if let Some(due_in) = cands.full_due_in_days
                && let Some(full) = stats.at_level(0)
            {
                balance_candidates.push(FullCandidate {
                    host: disk.host.clone(),
                    device: disk.device.clone(),
                    priority: disk.priority,
                    due_in_days: due_in,
                    size: full.size,
                    time_secs: est_secs(full.size, &stats),
                });
            }

            by_host.entry(disk.host.clone()).or_default().push(EstimateRequest {
                disk: disk_id,
                device: disk.device.clone(),
                levels: cands.levels.clone(),
            });
            stats_by_disk.insert(disk_id, stats);
            cands_by_disk.insert(disk_id, cands);
        }

        let etimeout = Duration::from_secs(self.config.timeouts.etimeout_secs);
        let outcomes = gather_estimates(self.source.clone(), by_host, etimeout).await?;

        // Level selection per disk.
        let mut entries = Vec::new();
        let mut failed = Vec::new();
        for (disk_id, outcome) in outcomes {
            let disk = &disks[disk_id];
            let stats = &stats_by_disk[&disk_id];
            let cands = &cands_by_disk[&disk_id];

            let estimates = match outcome {
                Ok(estimates) => estimates,
                Err(reason) => {
                    self.fail_disk(&mut failed, disk, &reason);
                    continue;
                }
            };
            match self.select_level(disk, stats, cands, &estimates) {
                Some(entry) => entries.push(entry),
                None => self.fail_disk(&mut failed, disk, "no usable estimate"),
            }
        }

        // Fit to tape, then balance the cycle.
        let mut schedule = build_schedule(entries);
        let fit = fit_schedule(
            &mut schedule,
            self.config.tape.length_kb,
            self.config.tape.filemark_kb,
        );
        for dropped in &fit.dropped {
            self.runlog.append(
                LogKind::Fail,
                &[
                    &dropped.host,
                    &dropped.device,
                    &dropped.level.to_string(),
                    &dropped.reason,
                ],
            );
            failed.push((dropped.host.clone(), dropped.device.clone(), dropped.reason.clone()));
        }

        let balance = balance_schedule(
            &mut schedule,
            &mut balance_candidates,
            &BalanceParams {
                tape_length_kb: self.config.tape.length_kb,
                filemark_kb: self.config.tape.filemark_kb,
                dumpcycle_days: self.config.cycle.dumpcycle_days,
                runs_per_cycle: self.config.cycle.runs_per_cycle,
                tolerance: BALANCE_TOLERANCE,
            },
        );
        for (host, device) in &balance.promoted {
            self.runlog
                .append(LogKind::Info, &[host, device, "full promoted for balance"]);
        }

        info!(
            scheduled = schedule.len(),
            failed = failed.len(),
            total_kb = fit.total_kb,
            "planning complete"
        );
        Ok(PlanOutcome {
            schedule,
            failed,
            fit,
            balance,
        })
    }

    fn fail_disk(&self, failed: &mut Vec<(String, String, String)>, disk: &Disk, reason: &str) {
        warn!(host = %disk.host, device = %disk.device, reason, "filesystem failed for tonight");
        self.runlog
            .append(LogKind::Fail, &[&disk.host, &disk.device, reason]);
        failed.push((disk.host.clone(), disk.device.clone(), reason.to_string()));
    }

    /// Turn one disk's estimates into a schedule entry, or `None` when
    /// no candidate level produced a usable size.
    fn select_level(
        &self,
        disk: &Disk,
        stats: &HistoricalStats,
        cands: &CandidateLevels,
        estimates: &[LevelEstimate],
    ) -> Option<ScheduleEntry> {
        let size_at =
            |level: u32| estimates.iter().find(|e| e.level == level).and_then(|e| e.size);
        let priority = disk.priority.saturating_add(cands.days_overdue);

        // The incremental tonight would run at this level/size, whether
        // as the dump itself or as the degraded fallback for a full.
        let incremental = if stats.last_level >= 0 {
            let base = next_level(stats);
            size_at(base).map(|base_size| {
                let level =
                    pick_incremental_level(stats, base_size, size_at(base + 1), &self.config.bump);
                let size = size_at(level).unwrap_or(base_size);
                (level, size)
            })
        } else {
            None
        };

        if cands.full_due {
            if let Some(size) = size_at(0) {
                return Some(ScheduleEntry {
                    host: disk.host.clone(),
                    device: disk.device.clone(),
                    priority,
                    level: 0,
                    dumpdate: 0,
                    size,
                    time_secs: est_secs(size, stats),
                    degraded: incremental.map(|(level, dsize)| DegradedEntry {
                        level,
                        dumpdate: since_date(stats, level),
                        size: dsize,
                        time_secs: est_secs(dsize, stats),
                    }),
                });
            }
            // The full could not be sized; run the incremental tonight
            // rather than nothing, and try the full again tomorrow.
            warn!(host = %disk.host, device = %disk.device, "no full estimate, falling back to incremental");
        }

        let (level, size) = incremental?;
        Some(ScheduleEntry {
            host: disk.host.clone(),
            device: disk.device.clone(),
            priority,
            level,
            dumpdate: since_date(stats, level),
            size,
            time_secs: est_secs(size, stats),
            degraded: None,
        })
    }
}

/// Duration estimate from the disk's historical rate.
fn est_secs(size: Kb, stats: &HistoricalStats) -> u64 {
    let rate = if stats.dump_rate > 0.0 {
        stats.dump_rate
    } else {
        DEFAULT_RATE_KPS
    };
    (size as f64 / rate).ceil() as u64
}
