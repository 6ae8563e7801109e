//! spoold — the spool daemon.
//!
//! Single binary that assembles the backup pipeline:
//! - Planner (estimate & fit engine) → schedule file
//! - Driver (runtime scheduler) → dumper/chunker/taper workers
//! - Collaborator stores: disklist, stats store (redb), tape list, run log
//!
//! # Usage
//!
//! ```text
//! spoold plan --config spool.toml --disklist disklist.toml --out schedule
//! spoold run --config spool.toml --schedule schedule
//! spoold standalone --config spool.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use spool_core::{Disk, EpochDay, SpoolConfig};
use spool_driver::worker::{self, WorkerKind};
use spool_driver::{Driver, WorkerSet};
use spool_planner::estimate::{BoxFuture, EstimateSource, LevelEstimate};
use spool_planner::Planner;
use spool_state::{RunLog, StatsStore, TapeList, load_disklist};

#[derive(Parser)]
#[command(name = "spoold", about = "Spool backup daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct CommonArgs {
    /// Path to spool.toml.
    #[arg(long, default_value = "spool.toml")]
    config: PathBuf,

    /// Path to the disklist.
    #[arg(long, default_value = "disklist.toml")]
    disklist: PathBuf,

    /// Historical stats database.
    #[arg(long, default_value = "stats.redb")]
    stats: PathBuf,

    /// Run log appended for the reporting tools.
    #[arg(long, default_value = "spool.log")]
    log: PathBuf,

    /// Tape inventory file; when present, tonight's label is checked
    /// against it (or chosen from it when the config names none).
    #[arg(long)]
    tapelist: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the planner and emit tonight's schedule.
    Plan {
        #[command(flatten)]
        common: CommonArgs,

        /// Where to write the schedule.
        #[arg(long, default_value = "schedule")]
        out: PathBuf,
    },
    /// Drive a previously emitted schedule.
    Run {
        #[command(flatten)]
        common: CommonArgs,

        /// Schedule file produced by `plan`.
        #[arg(long, default_value = "schedule")]
        schedule: PathBuf,
    },
    /// Plan and run in one process.
    Standalone {
        #[command(flatten)]
        common: CommonArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,spoold=debug,spool=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Plan { common, out } => {
            let ctx = Context::open(&common)?;
            let schedule = ctx.plan().await?;
            std::fs::write(&out, spool_core::emit_schedule(&schedule))?;
            info!(entries = schedule.len(), out = %out.display(), "schedule written");
            Ok(())
        }
        Command::Run { common, schedule } => {
            let ctx = Context::open(&common)?;
            let text = std::fs::read_to_string(&schedule)?;
            let entries = spool_core::parse_schedule(&text)?;
            ctx.drive(entries).await
        }
        Command::Standalone { common } => {
            let ctx = Context::open(&common)?;
            let schedule = ctx.plan().await?;
            ctx.drive(schedule).await
        }
    }
}

/// The assembled collaborators shared by every subcommand.
struct Context {
    config: SpoolConfig,
    disks: Vec<Disk>,
    stats: StatsStore,
    runlog: RunLog,
    today: EpochDay,
}

impl Context {
    fn open(common: &CommonArgs) -> anyhow::Result<Self> {
        let mut config = SpoolConfig::from_file(&common.config)?;
        let disks = load_disklist(&common.disklist)?;
        let stats = StatsStore::open(&common.stats)?;
        let runlog = RunLog::open(&common.log)?;

        if let Some(path) = &common.tapelist {
            let tapes = TapeList::load(path)?;
            config.tape.label = resolve_label(&config, &tapes)?;
        }

        info!(
            disks = disks.len(),
            config = %common.config.display(),
            label = config.tape.label.as_deref().unwrap_or("-"),
            "collaborators opened"
        );
        Ok(Self {
            config,
            disks,
            stats,
            runlog,
            today: epoch_day(),
        })
    }

    async fn plan(&self) -> anyhow::Result<Vec<spool_core::ScheduleEntry>> {
        let source = Arc::new(HistoryEstimates {
            stats: self.stats.clone(),
        });
        let planner = Planner::new(
            self.config.clone(),
            source,
            self.stats.clone(),
            self.runlog.clone(),
        );
        let outcome = planner.plan(&self.disks, self.today).await?;
        for (host, device, reason) in &outcome.failed {
            warn!(%host, %device, %reason, "filesystem failed in planning");
        }
        info!(
            scheduled = outcome.schedule.len(),
            total_kb = outcome.fit.total_kb,
            promoted = outcome.balance.promoted.len(),
            "plan complete"
        );
        Ok(outcome.schedule)
    }

    async fn drive(&self, schedule: Vec<spool_core::ScheduleEntry>) -> anyhow::Result<()> {
        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();

        let dumper_prog = self.config.workers.dumper.clone().ok_or_else(|| {
            anyhow::anyhow!("workers.dumper must be configured to run a schedule")
        })?;
        let chunker_prog = self.config.workers.chunker.clone().ok_or_else(|| {
            anyhow::anyhow!("workers.chunker must be configured to run a schedule")
        })?;

        let mut pairs = Vec::new();
        for idx in 0..self.config.workers.inparallel as usize {
            let dumper = worker::spawn_process(
                idx * 2,
                WorkerKind::Dumper,
                &dumper_prog,
                events_tx.clone(),
            )?;
            let chunker = worker::spawn_process(
                idx * 2 + 1,
                WorkerKind::Chunker,
                &chunker_prog,
                events_tx.clone(),
            )?;
            pairs.push((dumper, chunker));
        }

        let taper = match &self.config.workers.taper {
            Some(program) => Some(worker::spawn_process(
                usize::MAX,
                WorkerKind::Taper,
                program,
                events_tx.clone(),
            )?),
            None => None,
        };
        drop(events_tx);

        let mut driver = Driver::new(
            self.config.clone(),
            self.disks.clone(),
            schedule,
            self.today,
            self.stats.clone(),
            self.runlog.clone(),
            WorkerSet { pairs, taper },
            events_rx,
        );
        let summary = driver.run().await?;
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            taped = summary.taped,
            degraded = summary.degraded,
            "run finished"
        );
        if summary.degraded {
            warn!("run ended in degraded mode; staged dumps await a flush run");
        }
        Ok(())
    }
}

/// Estimate source backed by the historical stats store.
///
/// The remote sizing protocol is a separate agent concern; when no
/// agent transport is wired in, the last recorded size at each level is
/// the best available predictor and keeps the planner honest about
/// never-dumped filesystems (which report no estimate and are scheduled
/// from their configured defaults).
struct HistoryEstimates {
    stats: StatsStore,
}

impl EstimateSource for HistoryEstimates {
    fn estimate(
        &self,
        host: &str,
        device: &str,
        levels: &[u32],
    ) -> BoxFuture<anyhow::Result<Vec<LevelEstimate>>> {
        let stats = self.stats.clone();
        let host = host.to_string();
        let device = device.to_string();
        let levels = levels.to_vec();
        Box::pin(async move {
            let record = stats.get(&host, &device)?;
            let estimates = levels
                .iter()
                .map(|&level| LevelEstimate {
                    level,
                    size: record
                        .as_ref()
                        .and_then(|r| r.at_level(level))
                        .map(|l| l.size),
                })
                .collect();
            Ok(estimates)
        })
    }
}

/// Pick tonight's tape label: the configured label must exist in the
/// inventory; with none configured, the oldest reusable tape is taken.
fn resolve_label(config: &SpoolConfig, tapes: &TapeList) -> anyhow::Result<Option<String>> {
    match &config.tape.label {
        Some(label) => {
            if tapes.lookup(label).is_none() {
                anyhow::bail!("configured tape {label} is not in the inventory");
            }
            Ok(Some(label.clone()))
        }
        None => {
            let eligible = tapes.reusable(config.cycle.tapecycle);
            match eligible.first() {
                Some(tape) => Ok(Some(tape.label.clone())),
                None => {
                    warn!("no reusable tape in inventory; run will stage to holding disk");
                    Ok(None)
                }
            }
        }
    }
}

/// Days since the Unix epoch, local clock.
fn epoch_day() -> EpochDay {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        / 86_400
}
