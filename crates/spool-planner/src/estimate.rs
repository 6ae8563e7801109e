//! Candidate dump levels and size estimates.
//!
//! The decision functions here are pure: given a disk, its history, and
//! the bump configuration they answer "which levels do we ask about"
//! and "which level do we run". The async half fans estimate requests
//! out to remote agents, one task per host, bounded by a timeout scaled
//! by the number of levels queried — a dead host times out on its own
//! without holding up anyone else.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use spool_core::{BumpConfig, Disk, DiskId, DumpStrategy, EpochDay, HistoricalStats, Kb, MAX_LEVEL};

use crate::error::{PlanError, PlanResult};

/// Dump rate assumed for a filesystem with no recorded history, KiB/s.
pub const DEFAULT_RATE_KPS: f64 = 1024.0;

/// One size estimate returned by a remote agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelEstimate {
    pub level: u32,
    /// `None` when the agent could not produce a number for this level.
    pub size: Option<Kb>,
}

/// Boxed future used by `EstimateSource` implementations.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A remote agent that can size prospective dumps.
///
/// The wire protocol used to reach the agent is not this crate's
/// concern; implementations range from a real network client to a fixed
/// table in tests.
pub trait EstimateSource: Send + Sync {
    fn estimate(
        &self,
        host: &str,
        device: &str,
        levels: &[u32],
    ) -> BoxFuture<anyhow::Result<Vec<LevelEstimate>>>;
}

/// Test/replay source backed by a fixed table keyed (host, device, level).
#[derive(Debug, Default, Clone)]
pub struct FixedEstimates {
    sizes: HashMap<(String, String, u32), Kb>,
}

impl FixedEstimates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, host: &str, device: &str, level: u32, size: Kb) {
        self.sizes
            .insert((host.to_string(), device.to_string(), level), size);
    }
}

impl EstimateSource for FixedEstimates {
    fn estimate(
        &self,
        host: &str,
        device: &str,
        levels: &[u32],
    ) -> BoxFuture<anyhow::Result<Vec<LevelEstimate>>> {
        let estimates: Vec<LevelEstimate> = levels
            .iter()
            .map(|&level| LevelEstimate {
                level,
                size: self
                    .sizes
                    .get(&(host.to_string(), device.to_string(), level))
                    .copied(),
            })
            .collect();
        Box::pin(async move { Ok(estimates) })
    }
}

// ── Candidate levels ───────────────────────────────────────────────

/// The levels worth asking a remote agent about for one filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateLevels {
    /// Levels to query, at most three.
    pub levels: Vec<u32>,
    /// A full dump is due (or forced) tonight.
    pub full_due: bool,
    /// Days past the full-dump due date; 0 when due exactly today.
    pub days_overdue: u32,
    /// Days until the next full is due, for balancing. `None` when the
    /// strategy never runs fulls or the full is due tonight.
    pub full_due_in_days: Option<u32>,
}

/// Baseline incremental level: stay at the last level, except a level 0
/// always moves to 1.
pub fn next_level(stats: &HistoricalStats) -> u32 {
    if stats.last_level <= 0 {
        1
    } else {
        stats.last_level as u32
    }
}

/// Day of the most recent dump at any level strictly below `level`;
/// the "changes since" date passed to the dump program. 0 = epoch, i.e.
/// dump everything.
pub fn since_date(stats: &HistoricalStats, level: u32) -> EpochDay {
    stats.levels[..level.min(10) as usize]
        .iter()
        .map(|l| l.date)
        .max()
        .unwrap_or(0)
}

/// Decide which levels to query for `disk`, honoring strategy and
/// pending operator commands. Returns `None` when the disk is skipped
/// entirely tonight.
pub fn candidate_levels(
    disk: &Disk,
    stats: &HistoricalStats,
    dumpcycle_days: u32,
    today: EpochDay,
) -> Option<CandidateLevels> {
    if disk.strategy == DumpStrategy::Skip {
        return None;
    }

    let runs_full = matches!(
        disk.strategy,
        DumpStrategy::Standard | DumpStrategy::NoInc
    );

    // Overdue arithmetic. A disk with no recorded full is maximally
    // overdue so it schedules ahead of everything at equal base priority.
    let (full_due, days_overdue, due_in) = if !runs_full {
        (false, 0, None)
    } else if stats.commands.force_full {
        (true, 0, None)
    } else {
        match stats.last_full_day() {
            None => (true, dumpcycle_days, None),
            Some(last) => {
                let due_day = last + dumpcycle_days as u64;
                if today >= due_day {
                    (true, (today - due_day) as u32, None)
                } else {
                    (false, 0, Some((due_day - today) as u32))
                }
            }
        }
    };

    let mut levels = Vec::with_capacity(3);
    if full_due {
        levels.push(0);
    }

    // Incremental candidates: the current level plus a possible bump.
    // NoInc disks never run incrementals; a disk with no history has
    // nothing to increment against.
    if disk.strategy != DumpStrategy::NoInc && stats.last_level >= 0 {
        let base = next_level(stats);
        levels.push(base);
        if base < MAX_LEVEL && !stats.commands.force_no_bump {
            levels.push(base + 1);
        }
    } else if disk.strategy == DumpStrategy::NoFull && stats.is_new() {
        // A no-full disk with no history starts its chain at level 1.
        levels.push(1);
    }

    if levels.is_empty() {
        // NoInc and not due: nothing to do tonight.
        return None;
    }

    Some(CandidateLevels {
        levels,
        full_due,
        days_overdue,
        full_due_in_days: due_in,
    })
}

// ── Bump decision ──────────────────────────────────────────────────

/// Bump threshold for `level`: `size_kb` multiplied by `mult` once per
/// level above 1. The multiplication is applied iteratively, matching
/// the per-level rounding of the threshold table this replaces.
pub fn bump_threshold(bump: &BumpConfig, level: u32) -> Kb {
    let mut threshold = bump.size_kb as f64;
    for _ in 1..level {
        threshold *= bump.mult;
    }
    threshold as Kb
}

/// Pick the incremental level to run tonight.
///
/// Stays at the baseline unless the disk has sat at that level for at
/// least `bump.days` runs, its estimate exceeds the level's threshold,
/// and bumping would save more than the threshold.
pub fn pick_incremental_level(
    stats: &HistoricalStats,
    base_size: Kb,
    bump_size: Option<Kb>,
    bump: &BumpConfig,
) -> u32 {
    let base = next_level(stats);
    if base >= MAX_LEVEL {
        return base;
    }
    if stats.commands.force_no_bump {
        return base;
    }
    if stats.commands.force_bump {
        return if bump_size.is_some() { base + 1 } else { base };
    }
    if stats.runs_at_level < bump.days {
        return base;
    }

    let threshold = bump_threshold(bump, base);
    if base_size <= threshold {
        return base;
    }
    match bump_size {
        Some(bumped) if base_size.saturating_sub(bumped) > threshold => base + 1,
        _ => base,
    }
}

// ── Estimate fan-out ───────────────────────────────────────────────

/// One disk's estimate request within a host batch.
#[derive(Debug, Clone)]
pub struct EstimateRequest {
    pub disk: DiskId,
    pub device: String,
    pub levels: Vec<u32>,
}

/// Per-disk outcome of the fan-out: the agent's estimates, or the
/// failure that took the whole host down.
pub type EstimateOutcome = Result<Vec<LevelEstimate>, String>;

/// Query every host's agent concurrently.
///
/// Requests for one host run sequentially on that host's task, bounded
/// by `etimeout × total levels requested` for the host; hosts proceed
/// independently, and a host failure or timeout fails only its own
/// disks.
pub async fn gather_estimates(
    source: Arc<dyn EstimateSource>,
    by_host: HashMap<String, Vec<EstimateRequest>>,
    etimeout: Duration,
) -> PlanResult<HashMap<DiskId, EstimateOutcome>> {
    let mut handles = Vec::with_capacity(by_host.len());

    for (host, requests) in by_host {
        let source = source.clone();
        let total_levels: u32 = requests.iter().map(|r| r.levels.len() as u32).sum();
        let deadline = etimeout * total_levels.max(1);

        handles.push(tokio::spawn(async move {
            let mut results: Vec<(DiskId, EstimateOutcome)> = Vec::with_capacity(requests.len());
            let batch = async {
                for req in &requests {
                    let outcome = source
                        .estimate(&host, &req.device, &req.levels)
                        .await
                        .map_err(|e| e.to_string());
                    results.push((req.disk, outcome));
                }
            };

            if tokio::time::timeout(deadline, batch).await.is_err() {
                warn!(%host, ?deadline, "estimate batch timed out");
                // Disks the batch never reached fail with a timeout.
                let done: Vec<DiskId> = results.iter().map(|(d, _)| *d).collect();
                for req in &requests {
                    if !done.contains(&req.disk) {
                        results.push((req.disk, Err("estimate timed out".to_string())));
                    }
                }
            }
            results
        }));
    }

    let mut outcomes = HashMap::new();
    for handle in handles {
        let results = handle
            .await
            .map_err(|e| PlanError::EstimateTask(e.to_string()))?;
        for (disk, outcome) in results {
            debug!(disk, ok = outcome.is_ok(), "estimate outcome");
            outcomes.insert(disk, outcome);
        }
    }
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use spool_core::{Compression, LevelStats};

    fn make_disk(strategy: DumpStrategy) -> Disk {
        Disk {
            host: "web1".to_string(),
            device: "/home".to_string(),
            strategy,
            priority: 10,
            compression: Compression::None,
            spindle: -1,
            max_dumps: 1,
            interface: "default".to_string(),
            no_hold: false,
            start_delay_secs: 0,
        }
    }

    fn stats_with_full(day: EpochDay, last_level: i32, runs: u32) -> HistoricalStats {
        let mut stats = HistoricalStats::default();
        stats.levels[0] = LevelStats {
            size: 1_000_000,
            csize: 600_000,
            secs: 500,
            date: day,
            label: None,
            filenum: 0,
        };
        if last_level > 0 {
            stats.levels[last_level as usize] = LevelStats {
                size: 50_000,
                csize: 30_000,
                secs: 30,
                date: day + 1,
                label: None,
                filenum: 0,
            };
        }
        stats.last_level = last_level;
        stats.runs_at_level = runs;
        stats
    }

    fn bump_cfg() -> BumpConfig {
        BumpConfig {
            size_kb: 10_000,
            mult: 2.0,
            days: 2,
        }
    }

    #[test]
    fn new_disk_is_maximally_overdue_full_only() {
        let disk = make_disk(DumpStrategy::Standard);
        let stats = HistoricalStats::default();
        let c = candidate_levels(&disk, &stats, 7, 20_500).unwrap();
        assert!(c.full_due);
        assert_eq!(c.days_overdue, 7);
        assert_eq!(c.levels, vec![0]);
    }

    #[test]
    fn due_full_also_queries_incrementals() {
        let disk = make_disk(DumpStrategy::Standard);
        let stats = stats_with_full(20_490, 1, 2);
        // Due day 20_497, so 3 days overdue.
        let c = candidate_levels(&disk, &stats, 7, 20_500).unwrap();
        assert!(c.full_due);
        assert_eq!(c.days_overdue, 3);
        assert_eq!(c.levels, vec![0, 1, 2]);
    }

    #[test]
    fn not_due_queries_current_and_bump_levels() {
        let disk = make_disk(DumpStrategy::Standard);
        let stats = stats_with_full(20_498, 0, 1);
        let c = candidate_levels(&disk, &stats, 7, 20_500).unwrap();
        assert!(!c.full_due);
        assert_eq!(c.full_due_in_days, Some(5));
        // Last level 0 moves to baseline 1, bump candidate 2.
        assert_eq!(c.levels, vec![1, 2]);
    }

    #[test]
    fn force_full_overrides_the_cycle() {
        let disk = make_disk(DumpStrategy::Standard);
        let mut stats = stats_with_full(20_499, 0, 1);
        stats.commands.force_full = true;
        let c = candidate_levels(&disk, &stats, 7, 20_500).unwrap();
        assert!(c.full_due);
        assert_eq!(c.levels[0], 0);
    }

    #[test]
    fn force_no_bump_drops_the_bump_candidate() {
        let disk = make_disk(DumpStrategy::Standard);
        let mut stats = stats_with_full(20_498, 1, 5);
        stats.commands.force_no_bump = true;
        let c = candidate_levels(&disk, &stats, 7, 20_500).unwrap();
        assert_eq!(c.levels, vec![1]);
    }

    #[test]
    fn skip_and_idle_no_inc_disks_are_skipped() {
        let skip = make_disk(DumpStrategy::Skip);
        assert!(candidate_levels(&skip, &HistoricalStats::default(), 7, 20_500).is_none());

        // NoInc not yet due: nothing to run tonight.
        let no_inc = make_disk(DumpStrategy::NoInc);
        let stats = stats_with_full(20_499, 0, 1);
        assert!(candidate_levels(&no_inc, &stats, 7, 20_500).is_none());
    }

    #[test]
    fn no_full_disk_never_queries_level_zero() {
        let disk = make_disk(DumpStrategy::NoFull);
        // Even a new no-full disk starts at level 1.
        let c = candidate_levels(&disk, &HistoricalStats::default(), 7, 20_500).unwrap();
        assert!(!c.full_due);
        assert_eq!(c.levels, vec![1]);

        let c = candidate_levels(&disk, &stats_with_full(1, 1, 3), 7, 20_500).unwrap();
        assert!(!c.full_due);
        assert_eq!(c.levels, vec![1, 2]);
    }

    #[test]
    fn threshold_multiplies_iteratively() {
        let bump = bump_cfg();
        assert_eq!(bump_threshold(&bump, 1), 10_000);
        assert_eq!(bump_threshold(&bump, 2), 20_000);
        assert_eq!(bump_threshold(&bump, 4), 80_000);
    }

    #[test]
    fn level_zero_always_moves_to_one() {
        let stats = stats_with_full(20_490, 0, 5);
        assert_eq!(pick_incremental_level(&stats, 5_000, Some(1_000), &bump_cfg()), 1);
    }

    #[test]
    fn bump_requires_days_size_and_savings() {
        let bump = bump_cfg();

        // Not enough runs at the level yet.
        let stats = stats_with_full(20_490, 1, 1);
        assert_eq!(pick_incremental_level(&stats, 50_000, Some(1_000), &bump), 1);

        // Size under threshold.
        let stats = stats_with_full(20_490, 1, 3);
        assert_eq!(pick_incremental_level(&stats, 9_000, Some(1_000), &bump), 1);

        // Savings too small: 50_000 - 45_000 < 10_000.
        assert_eq!(pick_incremental_level(&stats, 50_000, Some(45_000), &bump), 1);

        // All three conditions met.
        assert_eq!(pick_incremental_level(&stats, 50_000, Some(5_000), &bump), 2);

        // No estimate for the bumped level: stay.
        assert_eq!(pick_incremental_level(&stats, 50_000, None, &bump), 1);
    }

    #[test]
    fn force_bump_and_no_bump_override_thresholds() {
        let bump = bump_cfg();

        let mut stats = stats_with_full(20_490, 1, 0);
        stats.commands.force_bump = true;
        assert_eq!(pick_incremental_level(&stats, 100, Some(50), &bump), 2);

        let mut stats = stats_with_full(20_490, 1, 9);
        stats.commands.force_no_bump = true;
        assert_eq!(pick_incremental_level(&stats, 900_000, Some(10), &bump), 1);
    }

    #[test]
    fn since_date_takes_newest_lower_level() {
        let mut stats = stats_with_full(20_490, 2, 1);
        stats.levels[1].date = 20_495;
        assert_eq!(since_date(&stats, 0), 0);
        assert_eq!(since_date(&stats, 1), 20_490);
        assert_eq!(since_date(&stats, 2), 20_495);
    }

    #[tokio::test]
    async fn fan_out_covers_all_hosts() {
        let mut fixed = FixedEstimates::new();
        fixed.set("web1", "/home", 0, 1000);
        fixed.set("web1", "/home", 1, 100);
        fixed.set("db1", "/data", 0, 9000);
        let source: Arc<dyn EstimateSource> = Arc::new(fixed);

        let mut by_host = HashMap::new();
        by_host.insert(
            "web1".to_string(),
            vec![EstimateRequest {
                disk: 0,
                device: "/home".to_string(),
                levels: vec![0, 1],
            }],
        );
        by_host.insert(
            "db1".to_string(),
            vec![EstimateRequest {
                disk: 1,
                device: "/data".to_string(),
                levels: vec![0],
            }],
        );

        let outcomes = gather_estimates(source, by_host, Duration::from_secs(5))
            .await
            .unwrap();

        let web1 = outcomes[&0].as_ref().unwrap();
        assert_eq!(web1[0], LevelEstimate { level: 0, size: Some(1000) });
        assert_eq!(web1[1], LevelEstimate { level: 1, size: Some(100) });
        let db1 = outcomes[&1].as_ref().unwrap();
        assert_eq!(db1[0].size, Some(9000));
    }

    #[tokio::test]
    async fn one_host_failure_does_not_block_others() {
        struct FailingHost;
        impl EstimateSource for FailingHost {
            fn estimate(
                &self,
                host: &str,
                _device: &str,
                levels: &[u32],
            ) -> BoxFuture<anyhow::Result<Vec<LevelEstimate>>> {
                let fail = host == "dead1";
                let estimates = levels
                    .iter()
                    .map(|&level| LevelEstimate { level, size: Some(500) })
                    .collect();
                Box::pin(async move {
                    if fail {
                        anyhow::bail!("connection refused");
                    }
                    Ok(estimates)
                })
            }
        }

        let source: Arc<dyn EstimateSource> = Arc::new(FailingHost);
        let mut by_host = HashMap::new();
        for (disk, host) in [(0, "dead1"), (1, "web1")] {
            by_host.insert(
                host.to_string(),
                vec![EstimateRequest {
                    disk,
                    device: "/home".to_string(),
                    levels: vec![0],
                }],
            );
        }

        let outcomes = gather_estimates(source, by_host, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(outcomes[&0].is_err());
        assert!(outcomes[&1].is_ok());
    }
}
