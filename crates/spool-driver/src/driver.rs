//! The runtime scheduler.
//!
//! One `Driver` owns the whole run: the job table, the four queues, the
//! bandwidth and holding-space ledgers, the worker pairs and the taper.
//! Worker I/O arrives on a single serialized event stream; every event
//! is handled to completion — transition, then space-blocked recovery,
//! then the admission scan — before the next is looked at, so queue and
//! ledger state is always consistent between events.
//!
//! Worker slots move `idle → dispatching → busy → (idle | down)`;
//! `down` is terminal for the run. Jobs move through
//! `waiting → runnable → dumping → tape-ready → taping → done`, with
//! `failed` reachable from any in-flight state.

use std::collections::HashMap;
use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use spool_core::{Disk, EpochDay, Kb, LevelStats, ScheduleEntry, SpoolConfig};
use spool_state::{LogKind, RunLog, StatsStore};

use crate::bandwidth::BandwidthLedger;
use crate::error::DriverResult;
use crate::holding::{HoldingLedger, Reservation, SpaceRequest, holding_rel};
use crate::proto::{Command, DumpSpec, Reply, Serial, SerialAllocator};
use crate::queue::{JobId, OrderedQueue};
use crate::worker::{Event, EventPayload, WorkerHandle, WorkerId};

/// Throughput assumed for a job whose estimate carries no duration.
const DEFAULT_KBPS: u64 = 1024;

/// Divisor for the extra-space grant on RQ-MORE-DISK: 1/20 = 5%.
const MORE_DISK_DIVISOR: u64 = 20;

/// The worker pool handed to the driver: dumper/chunker pairs plus an
/// optional taper. Transports are already connected; the driver only
/// sees handles and the shared event stream.
pub struct WorkerSet {
    pub pairs: Vec<(WorkerHandle, WorkerHandle)>,
    pub taper: Option<WorkerHandle>,
}

/// End-of-run accounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub taped: usize,
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Idle,
    Dispatching,
    Busy,
    Down,
}

#[derive(Debug, Clone, Copy)]
enum Role {
    Dumper(usize),
    Chunker(usize),
    Taper,
}

struct Pair {
    dumper: WorkerHandle,
    chunker: WorkerHandle,
    dumper_state: SlotState,
    chunker_state: SlotState,
    job: Option<JobId>,
    /// Scan class: big-end or small-end of the runnable queue.
    scans_big: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Waiting,
    Runnable,
    Dumping,
    TapeReady,
    Taping,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
enum TeardownOutcome {
    Requeue,
    Fail(String),
}

struct Job {
    entry: ScheduleEntry,
    disk: Disk,
    state: JobState,
    serial: Serial,
    attempts: u32,
    reservations: Vec<Reservation>,
    cur_segment: usize,
    /// Run-relative holding file name for this job's segments.
    hold_rel: std::path::PathBuf,
    kbps_granted: u64,
    host_charged: bool,
    pair: Option<usize>,
    direct: bool,
    dumper_done: bool,
    sink_done: bool,
    origin_kb: Kb,
    dumped_kb: Kb,
    dump_secs: u64,
    chunker_written: Kb,
    space_blocked: bool,
    /// Size of the space grant that failed, for deadlock victim choice.
    pending_request: Kb,
    teardown: Option<TeardownOutcome>,
    /// Workers that still owe an ABORT-FINISHED for this job.
    pending_acks: Vec<WorkerId>,
    retry_at: Option<u64>,
}

impl Job {
    fn needed_kbps(&self) -> u64 {
        self.entry
            .est_kps()
            .map(|kps| kps.ceil() as u64)
            .unwrap_or(DEFAULT_KBPS)
            .max(1)
    }

    fn spec(&self) -> DumpSpec {
        DumpSpec {
            host: self.entry.host.clone(),
            features: "ffff".to_string(),
            device: self.entry.device.clone(),
            level: self.entry.level,
            dumpdate: self.entry.dumpdate,
            program: "GNUTAR".to_string(),
            options: options_for(&self.disk),
        }
    }

    fn terminal(&self) -> bool {
        matches!(self.state, JobState::Done | JobState::Failed)
    }
}

fn options_for(disk: &Disk) -> String {
    use spool_core::Compression;
    match disk.compression {
        Compression::None => "|;;".to_string(),
        Compression::Fast => "|;compress-fast;".to_string(),
        Compression::Best => "|;compress-best;".to_string(),
    }
}

#[derive(Default)]
struct HostState {
    active: u32,
    spindles: HashSet<i32>,
    last_start: Option<u64>,
}

/// What the admission scan decided for a candidate.
enum DispatchPlan {
    Hold(Vec<SpaceRequest>),
    Direct,
}

/// The runtime scheduler. All state lives here and is only mutated from
/// the event loop (or, in tests, from direct handler calls).
pub struct Driver {
    config: SpoolConfig,
    rundate: EpochDay,
    stats: StatsStore,
    runlog: RunLog,

    bandwidth: BandwidthLedger,
    holding: HoldingLedger,
    serials: SerialAllocator,

    jobs: Vec<Job>,
    inflight: HashMap<Serial, JobId>,
    hosts: HashMap<String, HostState>,

    pairs: Vec<Pair>,
    roles: HashMap<WorkerId, Role>,
    taper: Option<WorkerHandle>,
    taper_state: SlotState,
    taper_job: Option<JobId>,

    waiting: Vec<JobId>,
    runnable: OrderedQueue,
    tape_ready: OrderedQueue,
    space_blocked: Vec<JobId>,

    events: mpsc::UnboundedReceiver<Event>,
    degraded: bool,
    taped: usize,
    clock_secs: u64,
    pending_wake: Option<u64>,
}

impl Driver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SpoolConfig,
        disks: Vec<Disk>,
        schedule: Vec<ScheduleEntry>,
        rundate: EpochDay,
        stats: StatsStore,
        runlog: RunLog,
        workers: WorkerSet,
        events: mpsc::UnboundedReceiver<Event>,
    ) -> Self {
        let disk_table: HashMap<(String, String), Disk> = disks
            .into_iter()
            .map(|d| ((d.host.clone(), d.device.clone()), d))
            .collect();

        let mut roles = HashMap::new();
        let pairs: Vec<Pair> = workers
            .pairs
            .into_iter()
            .enumerate()
            .map(|(idx, (dumper, chunker))| {
                roles.insert(dumper.id, Role::Dumper(idx));
                roles.insert(chunker.id, Role::Chunker(idx));
                Pair {
                    dumper,
                    chunker,
                    dumper_state: SlotState::Idle,
                    chunker_state: SlotState::Idle,
                    job: None,
                    scans_big: config.slot_scans_big_end(idx),
                }
            })
            .collect();
        if let Some(taper) = &workers.taper {
            roles.insert(taper.id, Role::Taper);
        }

        let jobs: Vec<Job> = schedule
            .into_iter()
            .map(|entry| {
                let disk = disk_table
                    .get(&(entry.host.clone(), entry.device.clone()))
                    .cloned()
                    .unwrap_or_else(|| {
                        warn!(host = %entry.host, device = %entry.device,
                              "schedule entry has no disklist record, using defaults");
                        default_disk(&entry)
                    });
                Job {
                    entry,
                    disk,
                    state: JobState::Waiting,
                    serial: Serial {
                        generation: 0,
                        sequence: 0,
                    },
                    attempts: 0,
                    reservations: Vec::new(),
                    cur_segment: 0,
                    hold_rel: std::path::PathBuf::new(),
                    kbps_granted: 0,
                    host_charged: false,
                    pair: None,
                    direct: false,
                    dumper_done: false,
                    sink_done: false,
                    origin_kb: 0,
                    dumped_kb: 0,
                    dump_secs: 0,
                    chunker_written: 0,
                    space_blocked: false,
                    pending_request: 0,
                    teardown: None,
                    pending_acks: Vec::new(),
                    retry_at: None,
                }
            })
            .collect();

        let bandwidth = BandwidthLedger::new(&config.interfaces);
        let holding = HoldingLedger::new(config.holding_disks.clone());

        let mut driver = Self {
            config,
            rundate,
            stats,
            runlog,
            bandwidth,
            holding,
            serials: SerialAllocator::new(1),
            jobs,
            inflight: HashMap::new(),
            hosts: HashMap::new(),
            pairs,
            roles,
            taper: workers.taper,
            taper_state: SlotState::Idle,
            taper_job: None,
            waiting: Vec::new(),
            runnable: OrderedQueue::new(),
            tape_ready: OrderedQueue::new(),
            space_blocked: Vec::new(),
            events,
            degraded: false,
            taped: 0,
            clock_secs: 0,
            pending_wake: None,
        };
        for job_id in 0..driver.jobs.len() {
            driver.enqueue(job_id);
        }
        driver
    }

    /// Run the schedule to completion.
    pub async fn run(&mut self) -> DriverResult<RunSummary> {
        let started = tokio::time::Instant::now();
        self.begin_run();
        self.tick();

        loop {
            if self.finished() {
                break;
            }
            if !self.has_inflight() && self.pending_wake.is_none() {
                self.fail_stranded();
                self.tick();
                continue;
            }

            let sleep_for = self
                .pending_wake
                .map(|at| Duration::from_secs(at.saturating_sub(self.clock_secs).max(1)))
                .unwrap_or(Duration::from_secs(3600));
            tokio::select! {
                event = self.events.recv() => {
                    self.clock_secs = started.elapsed().as_secs();
                    match event {
                        Some(event) => self.handle_event(event),
                        None => break,
                    }
                }
                _ = tokio::time::sleep(sleep_for) => {
                    let woke = self.pending_wake.unwrap_or(0);
                    self.clock_secs = started.elapsed().as_secs().max(woke);
                }
            }
            self.tick();
        }

        Ok(self.finish_run())
    }

    /// Open the run: log it and bring up the taper.
    pub fn begin_run(&mut self) {
        self.runlog
            .append(LogKind::Start, &["driver", &self.rundate.to_string()]);
        match self.taper.clone() {
            Some(taper) => {
                let label = self.config.tape.label.clone().unwrap_or_default();
                if taper.send(Command::StartTaper { label }).is_err() {
                    self.enter_degraded("taper channel closed at startup");
                }
            }
            None => info!("no taper configured, staging to holding disk only"),
        }
    }

    /// Drain queued events, then recover space-blocked jobs, then run
    /// the admission scan. The run loop and tests both drive this.
    pub fn tick(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
        }
        self.continue_dumps();
        self.admit();
    }

    fn finished(&self) -> bool {
        self.jobs.iter().all(Job::terminal)
    }

    fn has_inflight(&self) -> bool {
        self.pairs.iter().any(|p| p.job.is_some())
            || self.taper_job.is_some()
            || (!self.tape_ready.is_empty() && self.taper_usable())
    }

    fn taper_usable(&self) -> bool {
        self.taper.is_some() && !self.degraded && self.taper_state != SlotState::Down
    }

    fn finish_run(&mut self) -> RunSummary {
        for pair in &self.pairs {
            if pair.dumper_state != SlotState::Down {
                let _ = pair.dumper.send(Command::Quit);
            }
            if pair.chunker_state != SlotState::Down {
                let _ = pair.chunker.send(Command::Quit);
            }
        }
        if let Some(taper) = &self.taper
            && self.taper_state != SlotState::Down
        {
            let _ = taper.send(Command::Quit);
        }

        let summary = RunSummary {
            succeeded: self.jobs.iter().filter(|j| j.state == JobState::Done).count(),
            failed: self.jobs.iter().filter(|j| j.state == JobState::Failed).count(),
            taped: self.taped,
            degraded: self.degraded,
        };
        self.runlog.append(
            LogKind::Done,
            &[
                "driver",
                &summary.succeeded.to_string(),
                &summary.failed.to_string(),
                &summary.taped.to_string(),
            ],
        );
        info!(?summary, "run complete");
        summary
    }

    // ── Queue plumbing ─────────────────────────────────────────────

    fn enqueue(&mut self, job_id: JobId) {
        let eligible_at = self.eligible_at(job_id);
        let job = &mut self.jobs[job_id];
        if self.clock_secs >= eligible_at {
            job.state = JobState::Runnable;
            self.runnable
                .insert(job_id, job.entry.priority, job.entry.size);
        } else {
            job.state = JobState::Waiting;
            self.waiting.push(job_id);
            self.note_delay(eligible_at);
        }
    }

    fn eligible_at(&self, job_id: JobId) -> u64 {
        let job = &self.jobs[job_id];
        job.disk.start_delay_secs.max(job.retry_at.unwrap_or(0))
    }

    fn note_delay(&mut self, at: u64) {
        self.pending_wake = Some(match self.pending_wake {
            Some(cur) => cur.min(at),
            None => at,
        });
    }

    fn promote_waiting(&mut self) {
        let mut idx = 0;
        while idx < self.waiting.len() {
            let job_id = self.waiting[idx];
            let eligible_at = self.eligible_at(job_id);
            if self.clock_secs >= eligible_at {
                self.waiting.swap_remove(idx);
                let job = &mut self.jobs[job_id];
                job.state = JobState::Runnable;
                self.runnable
                    .insert(job_id, job.entry.priority, job.entry.size);
            } else {
                self.note_delay(eligible_at);
                idx += 1;
            }
        }
    }

    // ── Admission ──────────────────────────────────────────────────

    fn admit(&mut self) {
        self.pending_wake = None;
        self.promote_waiting();
        self.dispatch_taper();
        self.start_some_dumps();
    }

    /// Scan the runnable queue for every idle pair until nothing more
    /// can be dispatched.
    fn start_some_dumps(&mut self) {
        let mut progress = true;
        while progress {
            progress = false;
            for pair_idx in 0..self.pairs.len() {
                if !self.pair_idle(pair_idx) {
                    continue;
                }
                if let Some((job_id, plan)) = self.pick_candidate(pair_idx) {
                    self.dispatch(job_id, pair_idx, plan);
                    progress = true;
                }
            }
        }
    }

    fn pair_idle(&self, pair_idx: usize) -> bool {
        let pair = &self.pairs[pair_idx];
        pair.job.is_none()
            && pair.dumper_state == SlotState::Idle
            && pair.chunker_state == SlotState::Idle
    }

    /// First runnable job clearing every gate, scanning in this pair's
    /// class direction. Time-based gates arm the wake timer as a side
    /// effect; a degraded run fails no-hold disks on sight.
    fn pick_candidate(&mut self, pair_idx: usize) -> Option<(JobId, DispatchPlan)> {
        let scans_big = self.pairs[pair_idx].scans_big;
        let candidates: Vec<JobId> = self.runnable.iter_for_class(scans_big).collect();

        for job_id in candidates {
            let job = &self.jobs[job_id];

            if job.disk.no_hold && self.degraded {
                self.fail_from_queue(job_id, "tape unavailable for no-hold disk");
                continue;
            }

            // Host spacing: repeated starts on one host are rate limited.
            let host = self.hosts.get(&job.entry.host);
            if let Some(host) = host {
                if host.active >= job.disk.max_dumps {
                    continue;
                }
                if job.disk.spindle >= 0 && host.spindles.contains(&job.disk.spindle) {
                    continue;
                }
                if let Some(last) = host.last_start {
                    let next_ok = last + self.config.timeouts.dtimeout_secs;
                    if self.clock_secs < next_ok {
                        self.note_delay(next_ok);
                        continue;
                    }
                }
            }

            let job = &self.jobs[job_id];
            if self.bandwidth.available(&job.disk.interface) < job.needed_kbps() {
                continue;
            }

            if job.disk.no_hold {
                if self.taper_free() {
                    return Some((job_id, DispatchPlan::Direct));
                }
                continue;
            }

            match self.holding.find_space(job.entry.size, None) {
                Some(requests) => return Some((job_id, DispatchPlan::Hold(requests))),
                None => {
                    // Holding capacity exhausted for this job: go direct
                    // to tape when the taper can take it.
                    if self.taper_free() {
                        return Some((job_id, DispatchPlan::Direct));
                    }
                }
            }
        }
        None
    }

    fn taper_free(&self) -> bool {
        self.taper_usable() && self.taper_state == SlotState::Idle && self.taper_job.is_none()
    }

    fn dispatch(&mut self, job_id: JobId, pair_idx: usize, plan: DispatchPlan) {
        let serial = self.serials.next();
        self.runnable.remove(job_id);
        self.inflight.insert(serial, job_id);

        let needed = self.jobs[job_id].needed_kbps();
        let interface = self.jobs[job_id].disk.interface.clone();
        let granted = self.bandwidth.allocate(&interface, needed);

        {
            let job = &mut self.jobs[job_id];
            job.serial = serial;
            job.state = JobState::Dumping;
            job.pair = Some(pair_idx);
            job.kbps_granted = granted;
            job.dumper_done = false;
            job.sink_done = false;
            job.host_charged = true;
        }

        let (host, spindle) = {
            let job = &self.jobs[job_id];
            (job.entry.host.clone(), job.disk.spindle)
        };
        let host_state = self.hosts.entry(host).or_default();
        host_state.active += 1;
        host_state.last_start = Some(self.clock_secs);
        if spindle >= 0 {
            host_state.spindles.insert(spindle);
        }

        match plan {
            DispatchPlan::Direct => {
                let job = &mut self.jobs[job_id];
                job.direct = true;
                let command = Command::PortWrite {
                    serial,
                    spec: job.spec(),
                };
                debug!(serial = %serial, host = %job.entry.host, "direct-to-tape dispatch");
                self.taper_job = Some(job_id);
                self.taper_state = SlotState::Busy;
                self.pairs[pair_idx].dumper_state = SlotState::Dispatching;
                self.pairs[pair_idx].job = Some(job_id);
                self.send_taper(command);
            }
            DispatchPlan::Hold(requests) => {
                let rel = {
                    let job = &self.jobs[job_id];
                    holding_rel(
                        self.rundate,
                        &job.entry.host,
                        &job.entry.device,
                        job.entry.level,
                    )
                };
                let (path, use_kb, chunk_kb) = {
                    let job = &mut self.jobs[job_id];
                    job.direct = false;
                    job.cur_segment = 0;
                    job.hold_rel = rel.clone();
                    self.holding.assign(&mut job.reservations, &requests, &rel);
                    let seg = &job.reservations[0];
                    (seg.path.clone(), seg.data_kb(&self.holding), self.holding.chunk_kb(seg.disk))
                };
                let spec = self.jobs[job_id].spec();
                debug!(serial = %serial, path = %path.display(), "staged dispatch");
                self.pairs[pair_idx].job = Some(job_id);
                self.pairs[pair_idx].chunker_state = SlotState::Dispatching;
                self.pairs[pair_idx].dumper_state = SlotState::Dispatching;
                self.send_chunker(
                    pair_idx,
                    Command::FileWrite {
                        serial,
                        path,
                        use_kb,
                        chunk_kb,
                        spec,
                    },
                );
            }
        }
    }

    fn dispatch_taper(&mut self) {
        if !self.taper_free() {
            return;
        }
        let Some(job_id) = self.tape_ready.peek_big() else {
            return;
        };
        self.tape_ready.remove(job_id);

        let (serial, path, written, spec) = {
            let job = &mut self.jobs[job_id];
            job.state = JobState::Taping;
            (
                job.serial,
                job.reservations[0].path.clone(),
                job.chunker_written,
                job.spec(),
            )
        };
        debug!(serial = %serial, path = %path.display(), "taper dispatch");
        self.taper_job = Some(job_id);
        self.taper_state = SlotState::Busy;
        self.send_taper(Command::FileWrite {
            serial,
            path,
            use_kb: written,
            chunk_kb: 0,
            spec,
        });
    }

    // ── Command transmission ───────────────────────────────────────

    fn send_chunker(&mut self, pair_idx: usize, command: Command) {
        let handle = self.pairs[pair_idx].chunker.clone();
        if handle.send(command).is_err() {
            self.worker_down(handle.id, "chunker channel closed");
        }
    }

    fn send_dumper(&mut self, pair_idx: usize, command: Command) {
        let handle = self.pairs[pair_idx].dumper.clone();
        if handle.send(command).is_err() {
            self.worker_down(handle.id, "dumper channel closed");
        }
    }

    fn send_taper(&mut self, command: Command) {
        let Some(handle) = self.taper.clone() else {
            return;
        };
        if handle.send(command).is_err() {
            self.worker_down(handle.id, "taper channel closed");
        }
    }

    // ── Event handling ─────────────────────────────────────────────

    fn handle_event(&mut self, event: Event) {
        match event.payload {
            EventPayload::Reply(reply) => self.handle_reply(event.worker, reply),
            EventPayload::Bogus { line, error } => {
                warn!(worker = event.worker, %line, %error, "bogus worker output");
                self.runlog
                    .append(LogKind::Strange, &["worker", &event.worker.to_string(), &line]);
                self.worker_down(event.worker, "bogus output");
            }
            EventPayload::Eof => {
                self.worker_down(event.worker, "channel EOF");
            }
        }
    }

    fn handle_reply(&mut self, worker: WorkerId, reply: Reply) {
        let Some(role) = self.roles.get(&worker).copied() else {
            warn!(worker, "reply from unknown worker");
            return;
        };

        // Correlate by serial before anything else: a result for a job
        // no longer in flight is a protocol bug, logged loudly.
        let expected_job = match role {
            Role::Dumper(p) | Role::Chunker(p) => self.pairs[p].job,
            Role::Taper => self.taper_job,
        };
        if let Some(serial) = reply.serial() {
            let matches = expected_job.is_some_and(|j| self.jobs[j].serial == serial);
            if !matches {
                warn!(worker, %serial, ?reply, "serial mismatch, result dropped");
                self.runlog.append(
                    LogKind::Strange,
                    &["serial-mismatch", &worker.to_string(), &serial.to_string()],
                );
                return;
            }
        }

        match role {
            Role::Dumper(pair_idx) => self.dumper_reply(pair_idx, reply),
            Role::Chunker(pair_idx) => self.chunker_reply(pair_idx, reply),
            Role::Taper => self.taper_reply(reply),
        }
    }

    fn dumper_reply(&mut self, pair_idx: usize, reply: Reply) {
        let Some(job_id) = self.pairs[pair_idx].job else {
            return;
        };
        match reply {
            Reply::Done {
                origin_kb,
                dumped_kb,
                secs,
                ..
            } => {
                self.pairs[pair_idx].dumper_state = SlotState::Idle;
                let job = &mut self.jobs[job_id];
                job.origin_kb = origin_kb;
                job.dumped_kb = dumped_kb;
                job.dump_secs = secs;
                job.dumper_done = true;
                self.maybe_finalize(job_id);
            }
            Reply::TryAgain { message, .. } => {
                self.pairs[pair_idx].dumper_state = SlotState::Idle;
                self.retry_or_fail(job_id, &message);
            }
            Reply::Failed { message, .. } => {
                self.pairs[pair_idx].dumper_state = SlotState::Idle;
                self.begin_teardown(job_id, TeardownOutcome::Fail(message));
            }
            Reply::AbortFinished { .. } => {
                self.pairs[pair_idx].dumper_state = SlotState::Idle;
                let worker = self.pairs[pair_idx].dumper.id;
                self.ack_abort(job_id, worker);
            }
            other => {
                warn!(pair = pair_idx, ?other, "unexpected dumper reply");
                self.runlog
                    .append(LogKind::Strange, &["dumper-reply", &format!("{other:?}")]);
            }
        }
    }

    fn chunker_reply(&mut self, pair_idx: usize, reply: Reply) {
        let Some(job_id) = self.pairs[pair_idx].job else {
            return;
        };
        match reply {
            Reply::Port { port } => {
                // Holding file is open; point the dumper at the chunker.
                self.pairs[pair_idx].chunker_state = SlotState::Busy;
                self.pairs[pair_idx].dumper_state = SlotState::Busy;
                let (serial, spec) = {
                    let job = &self.jobs[job_id];
                    (job.serial, job.spec())
                };
                self.send_dumper(pair_idx, Command::PortDump { serial, port, spec });
            }
            Reply::Done { dumped_kb, .. } => {
                self.pairs[pair_idx].chunker_state = SlotState::Idle;
                let job = &mut self.jobs[job_id];
                job.chunker_written = dumped_kb;
                job.sink_done = true;
                self.reconcile_usage(job_id);
                self.maybe_finalize(job_id);
            }
            Reply::NoRoom { shortfall_kb, .. } => {
                let job = &mut self.jobs[job_id];
                let seg = job.cur_segment;
                if let Some(reservation) = job.reservations.get_mut(seg) {
                    self.holding.shrink(reservation, shortfall_kb);
                }
            }
            Reply::RqMoreDisk { .. } => self.more_disk(pair_idx, job_id),
            Reply::TryAgain { message, .. } => {
                self.pairs[pair_idx].chunker_state = SlotState::Idle;
                self.retry_or_fail(job_id, &message);
            }
            Reply::Failed { message, .. } => {
                self.pairs[pair_idx].chunker_state = SlotState::Idle;
                self.begin_teardown(job_id, TeardownOutcome::Fail(message));
            }
            Reply::AbortFinished { .. } => {
                self.pairs[pair_idx].chunker_state = SlotState::Idle;
                let worker = self.pairs[pair_idx].chunker.id;
                self.ack_abort(job_id, worker);
            }
            other => {
                warn!(pair = pair_idx, ?other, "unexpected chunker reply");
                self.runlog
                    .append(LogKind::Strange, &["chunker-reply", &format!("{other:?}")]);
            }
        }
    }

    fn taper_reply(&mut self, reply: Reply) {
        match reply {
            Reply::Port { port } => {
                // Direct-to-tape: taper is listening, engage the dumper.
                let Some(job_id) = self.taper_job else {
                    return;
                };
                let Some(pair_idx) = self.jobs[job_id].pair else {
                    return;
                };
                self.pairs[pair_idx].dumper_state = SlotState::Busy;
                let (serial, spec) = {
                    let job = &self.jobs[job_id];
                    (job.serial, job.spec())
                };
                self.send_dumper(pair_idx, Command::PortDump { serial, port, spec });
            }
            Reply::TaperOk { .. } => {
                let Some(job_id) = self.taper_job else {
                    return;
                };
                if self.jobs[job_id].direct {
                    let job = &mut self.jobs[job_id];
                    job.sink_done = true;
                    self.maybe_finalize(job_id);
                } else {
                    self.tape_success(job_id);
                }
            }
            Reply::TapeError { message, .. } => {
                self.enter_degraded(&format!("tape error: {message}"));
            }
            Reply::AbortFinished { .. } => {
                let Some(job_id) = self.taper_job.take() else {
                    return;
                };
                self.taper_state = SlotState::Idle;
                if let Some(worker) = self.taper.as_ref().map(|t| t.id) {
                    self.ack_abort(job_id, worker);
                }
            }
            other => {
                warn!(?other, "unexpected taper reply");
                self.runlog
                    .append(LogKind::Strange, &["taper-reply", &format!("{other:?}")]);
            }
        }
    }

    // ── Transitions ────────────────────────────────────────────────

    /// Both halves reported: the dump is complete.
    fn maybe_finalize(&mut self, job_id: JobId) {
        let job = &self.jobs[job_id];
        if !job.dumper_done || !job.sink_done || job.teardown.is_some() {
            return;
        }

        self.update_stats(job_id);
        self.release_dispatch_resources(job_id);

        let job = &mut self.jobs[job_id];
        let pair_idx = job.pair.take();
        self.runlog.append(
            LogKind::Success,
            &[
                &job.entry.host.clone(),
                &job.entry.device.clone(),
                &job.entry.level.to_string(),
                &job.origin_kb.to_string(),
                &job.dumped_kb.to_string(),
                &job.dump_secs.to_string(),
            ],
        );
        if let Some(pair_idx) = pair_idx {
            self.pairs[pair_idx].job = None;
        }

        let job = &mut self.jobs[job_id];
        if job.direct {
            // Already on tape.
            self.inflight.remove(&job.serial);
            job.state = JobState::Done;
            self.taped += 1;
            self.taper_job = None;
            self.taper_state = SlotState::Idle;
            self.record_tape_position(job_id);
        } else {
            job.state = JobState::TapeReady;
            let size = job.chunker_written.max(job.dumped_kb);
            self.tape_ready.insert(job_id, 0, size);
        }
        info!(job = job_id, "dump complete");
    }

    /// The taper finished writing a staged dump.
    fn tape_success(&mut self, job_id: JobId) {
        self.taper_job = None;
        self.taper_state = SlotState::Idle;
        self.taped += 1;

        let job = &mut self.jobs[job_id];
        job.state = JobState::Done;
        let serial = job.serial;
        self.inflight.remove(&serial);

        let (host, device) = (job.entry.host.clone(), job.entry.device.clone());
        self.holding.release(&mut self.jobs[job_id].reservations);
        self.record_tape_position(job_id);

        let label = self.config.tape.label.clone().unwrap_or_default();
        self.runlog
            .append(LogKind::Info, &["taper", &host, &device, &label]);
    }

    /// Stamp tape label and file number into the stats record.
    fn record_tape_position(&mut self, job_id: JobId) {
        let job = &self.jobs[job_id];
        let level = job.entry.level as usize;
        let Ok(Some(mut stats)) = self.stats.get(&job.entry.host, &job.entry.device) else {
            return;
        };
        stats.levels[level].label = self.config.tape.label.clone();
        stats.levels[level].filenum = self.taped as u32;
        if let Err(e) = self.stats.put(&job.entry.host, &job.entry.device, &stats) {
            warn!(error = %e, "failed to record tape position");
        }
    }

    /// Advance the historical record after a successful dump. Failures
    /// deliberately never reach this, so a rerun is not bumped.
    fn update_stats(&mut self, job_id: JobId) {
        let job = &self.jobs[job_id];
        let host = &job.entry.host;
        let device = &job.entry.device;
        let mut stats = match self.stats.get(host, device) {
            Ok(stats) => stats.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "stats read failed, starting fresh record");
                Default::default()
            }
        };

        let level = job.entry.level as usize;
        stats.levels[level] = LevelStats {
            size: job.origin_kb,
            csize: job.dumped_kb,
            secs: job.dump_secs,
            date: self.rundate,
            label: None,
            filenum: 0,
        };
        if stats.last_level == job.entry.level as i32 {
            stats.runs_at_level += 1;
        } else {
            stats.last_level = job.entry.level as i32;
            stats.runs_at_level = 1;
        }
        if job.dump_secs > 0 {
            let rate = job.dumped_kb as f64 / job.dump_secs as f64;
            stats.dump_rate = if stats.dump_rate > 0.0 {
                (stats.dump_rate + rate) / 2.0
            } else {
                rate
            };
        }
        if job.origin_kb > 0 {
            let ratio = job.dumped_kb as f64 / job.origin_kb as f64;
            stats.compression_ratio = (stats.compression_ratio + ratio) / 2.0;
        }
        if job.entry.level == 0 {
            stats.commands.force_full = false;
        }
        stats.commands.force_bump = false;
        stats.commands.force_no_bump = false;

        if let Err(e) = self.stats.put(host, device, &stats) {
            warn!(error = %e, "stats write failed");
        }
    }

    /// Chunker out of granted space: advance to the next granted
    /// segment, grant a padded extension, or park on the blocked queue.
    fn more_disk(&mut self, pair_idx: usize, job_id: JobId) {
        // Next already-granted segment first.
        let has_next = {
            let job = &self.jobs[job_id];
            job.cur_segment + 1 < job.reservations.len()
        };
        if has_next {
            let (serial, path, use_kb, chunk_kb) = {
                let job = &mut self.jobs[job_id];
                job.cur_segment += 1;
                let seg = &job.reservations[job.cur_segment];
                (
                    job.serial,
                    seg.path.clone(),
                    seg.data_kb(&self.holding),
                    self.holding.chunk_kb(seg.disk),
                )
            };
            self.send_chunker(
                pair_idx,
                Command::Continue {
                    serial,
                    path,
                    use_kb,
                    chunk_kb,
                },
            );
            return;
        }

        if !self.grant_more(pair_idx, job_id) {
            let job = &mut self.jobs[job_id];
            job.space_blocked = true;
            debug!(job = job_id, "parked on space-blocked queue");
            self.space_blocked.push(job_id);
        }
    }

    /// Try to extend a job's space by 5% of its estimate. Returns false
    /// when no disk can cover it.
    fn grant_more(&mut self, pair_idx: usize, job_id: JobId) -> bool {
        let (pad, preferred) = {
            let job = &self.jobs[job_id];
            let pad = (job.entry.size / MORE_DISK_DIVISOR).max(1);
            (pad, job.reservations.last().map(|r| r.disk))
        };
        let Some(requests) = self.holding.find_space(pad, preferred) else {
            self.jobs[job_id].pending_request = pad;
            return false;
        };

        let (serial, path, use_kb, chunk_kb) = {
            let job = &mut self.jobs[job_id];
            let before = job.reservations.len();
            let rel = job.hold_rel.clone();
            self.holding.assign(&mut job.reservations, &requests, &rel);
            let merged = job.reservations.len() == before;
            if !merged {
                job.cur_segment = job.reservations.len() - 1;
            }
            let seg = &job.reservations[job.cur_segment];
            let use_kb = if merged {
                // Same file keeps growing; the extension is all data.
                requests.iter().map(|r| r.kb).sum()
            } else {
                seg.data_kb(&self.holding)
            };
            (
                job.serial,
                seg.path.clone(),
                use_kb,
                self.holding.chunk_kb(seg.disk),
            )
        };
        self.send_chunker(
            pair_idx,
            Command::Continue {
                serial,
                path,
                use_kb,
                chunk_kb,
            },
        );
        true
    }

    /// Reconcile reservations against the chunker's written total.
    fn reconcile_usage(&mut self, job_id: JobId) {
        let mut remaining = self.jobs[job_id].chunker_written;
        let mut reservations = std::mem::take(&mut self.jobs[job_id].reservations);
        for reservation in reservations.iter_mut() {
            let used = remaining.min(reservation.reserved_kb);
            self.holding.adjust(reservation, used);
            remaining -= used;
        }
        self.jobs[job_id].reservations = reservations;
    }

    // ── Failure paths ──────────────────────────────────────────────

    fn retry_or_fail(&mut self, job_id: JobId, message: &str) {
        let outcome = if self.jobs[job_id].attempts == 0 {
            TeardownOutcome::Requeue
        } else {
            TeardownOutcome::Fail(format!("retry limit: {message}"))
        };
        self.begin_teardown(job_id, outcome);
    }

    /// Cancel a job's in-flight halves. Resources are reclaimed only
    /// after every outstanding worker acknowledges the abort — never
    /// while a write may still be in progress.
    fn begin_teardown(&mut self, job_id: JobId, outcome: TeardownOutcome) {
        if self.jobs[job_id].teardown.is_some() {
            return;
        }
        self.jobs[job_id].teardown = Some(outcome);
        self.jobs[job_id].pending_acks.clear();
        let serial = self.jobs[job_id].serial;

        if let Some(pair_idx) = self.jobs[job_id].pair {
            let dumper_busy = matches!(
                self.pairs[pair_idx].dumper_state,
                SlotState::Busy | SlotState::Dispatching
            );
            let chunker_busy = matches!(
                self.pairs[pair_idx].chunker_state,
                SlotState::Busy | SlotState::Dispatching
            ) && !self.jobs[job_id].direct;
            if dumper_busy {
                let id = self.pairs[pair_idx].dumper.id;
                self.jobs[job_id].pending_acks.push(id);
                self.send_dumper(pair_idx, Command::Abort { serial });
            }
            if chunker_busy {
                let id = self.pairs[pair_idx].chunker.id;
                self.jobs[job_id].pending_acks.push(id);
                self.send_chunker(pair_idx, Command::Abort { serial });
            }
        }
        if self.jobs[job_id].direct
            && self.taper_job == Some(job_id)
            && self.taper_state == SlotState::Busy
            && let Some(taper) = &self.taper
        {
            let id = taper.id;
            self.jobs[job_id].pending_acks.push(id);
            self.send_taper(Command::Abort { serial });
        }

        if self.jobs[job_id].pending_acks.is_empty() {
            self.finish_teardown(job_id);
        }
    }

    fn ack_abort(&mut self, job_id: JobId, worker: WorkerId) {
        if self.jobs[job_id].teardown.is_none() {
            warn!(job = job_id, worker, "unexpected abort acknowledgment");
            return;
        }
        let acks = &mut self.jobs[job_id].pending_acks;
        match acks.iter().position(|&w| w == worker) {
            Some(pos) => {
                acks.swap_remove(pos);
            }
            None => {
                warn!(job = job_id, worker, "abort acknowledgment from a worker that owes none");
                return;
            }
        }
        if self.jobs[job_id].pending_acks.is_empty() {
            self.finish_teardown(job_id);
        }
    }

    fn finish_teardown(&mut self, job_id: JobId) {
        let outcome = self.jobs[job_id]
            .teardown
            .take()
            .unwrap_or(TeardownOutcome::Requeue);

        self.release_dispatch_resources(job_id);
        self.holding.release(&mut self.jobs[job_id].reservations);
        self.space_blocked.retain(|&j| j != job_id);

        let job = &mut self.jobs[job_id];
        self.inflight.remove(&job.serial);
        job.reservations.clear();
        job.cur_segment = 0;
        job.space_blocked = false;
        job.dumper_done = false;
        job.sink_done = false;
        job.chunker_written = 0;
        if let Some(pair_idx) = job.pair.take() {
            self.pairs[pair_idx].job = None;
        }
        if self.jobs[job_id].direct && self.taper_job == Some(job_id) {
            self.taper_job = None;
            if self.taper_state == SlotState::Busy {
                self.taper_state = SlotState::Idle;
            }
        }
        self.jobs[job_id].direct = false;

        match outcome {
            TeardownOutcome::Requeue => {
                let job = &mut self.jobs[job_id];
                job.attempts += 1;
                job.retry_at = Some(self.clock_secs + self.config.timeouts.retry_delay_secs);
                debug!(job = job_id, attempts = job.attempts, "job requeued");
                self.enqueue(job_id);
            }
            TeardownOutcome::Fail(reason) => {
                let job = &mut self.jobs[job_id];
                job.state = JobState::Failed;
                warn!(job = job_id, %reason, "job failed");
                self.runlog.append(
                    LogKind::Fail,
                    &[
                        &job.entry.host.clone(),
                        &job.entry.device.clone(),
                        &job.entry.level.to_string(),
                        &reason,
                    ],
                );
            }
        }
    }

    /// Give back bandwidth and host slots taken at dispatch.
    fn release_dispatch_resources(&mut self, job_id: JobId) {
        let job = &mut self.jobs[job_id];
        if job.kbps_granted > 0 {
            self.bandwidth.release(&job.disk.interface, job.kbps_granted);
            job.kbps_granted = 0;
        }
        if job.host_charged {
            job.host_charged = false;
            let spindle = job.disk.spindle;
            if let Some(host) = self.hosts.get_mut(&job.entry.host) {
                host.active = host.active.saturating_sub(1);
                if spindle >= 0 {
                    host.spindles.remove(&spindle);
                }
            }
        }
    }

    fn fail_from_queue(&mut self, job_id: JobId, reason: &str) {
        self.runnable.remove(job_id);
        self.waiting.retain(|&j| j != job_id);
        let job = &mut self.jobs[job_id];
        job.state = JobState::Failed;
        self.runlog.append(
            LogKind::Fail,
            &[
                &job.entry.host.clone(),
                &job.entry.device.clone(),
                &job.entry.level.to_string(),
                reason,
            ],
        );
    }

    // ── Degraded mode ──────────────────────────────────────────────

    /// Tape is gone for the rest of the run: stop all direct-to-tape
    /// dispatch, leave staged dumps on holding disk for a later flush,
    /// and fail disks that cannot be staged.
    fn enter_degraded(&mut self, reason: &str) {
        if self.degraded {
            return;
        }
        warn!(%reason, "entering degraded mode");
        self.runlog.append(LogKind::Degraded, &[reason]);
        self.degraded = true;
        self.taper_state = SlotState::Down;

        // The transfer that died: if it was staged, the image is intact
        // on holding disk; a direct stream is lost.
        if let Some(job_id) = self.taper_job.take() {
            if self.jobs[job_id].direct {
                self.begin_teardown(
                    job_id,
                    TeardownOutcome::Fail("tape failed mid-stream".to_string()),
                );
            } else {
                self.leave_staged(job_id);
            }
        }

        // Everything queued for tape stays staged for a later flush.
        while let Some(job_id) = self.tape_ready.peek_big() {
            self.tape_ready.remove(job_id);
            self.leave_staged(job_id);
        }

        // No-hold disks can no longer run at all.
        let no_hold: Vec<JobId> = self
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| {
                j.disk.no_hold && matches!(j.state, JobState::Waiting | JobState::Runnable)
            })
            .map(|(id, _)| id)
            .collect();
        for job_id in no_hold {
            self.fail_from_queue(job_id, "tape unavailable for no-hold disk");
        }

        // Pending fulls with a precomputed alternative run the small
        // incremental to holding disk instead of a full that cannot
        // reach tape tonight.
        for job_id in 0..self.jobs.len() {
            if !matches!(
                self.jobs[job_id].state,
                JobState::Waiting | JobState::Runnable
            ) {
                continue;
            }
            if self.jobs[job_id].entry.demote() {
                let job = &self.jobs[job_id];
                debug!(
                    job = job_id,
                    level = job.entry.level,
                    "switched to degraded level for holding-only run"
                );
                if self.runnable.remove(job_id) {
                    let (priority, size) = (job.entry.priority, job.entry.size);
                    self.runnable.insert(job_id, priority, size);
                }
            }
        }
    }

    /// A dump that will not reach tape tonight: keep the image, free
    /// the writer slot, count the dump as succeeded.
    fn leave_staged(&mut self, job_id: JobId) {
        let job = &mut self.jobs[job_id];
        job.state = JobState::Done;
        let serial = job.serial;
        self.inflight.remove(&serial);
        self.holding.detach_writers(&mut self.jobs[job_id].reservations);
        let job = &self.jobs[job_id];
        self.runlog.append(
            LogKind::Info,
            &[
                "staged",
                &job.entry.host.clone(),
                &job.entry.device.clone(),
                "awaiting flush",
            ],
        );
    }

    // ── Space-blocked recovery ─────────────────────────────────────

    /// Grant outstanding space-blocked jobs, then break a structural
    /// deadlock by aborting the cheapest blocked job.
    fn continue_dumps(&mut self) {
        // FIFO grant attempts. Jobs already being torn down are left
        // alone; their space comes back via the abort path.
        let blocked: Vec<JobId> = self.space_blocked.clone();
        for job_id in blocked {
            if self.jobs[job_id].teardown.is_some() {
                continue;
            }
            let Some(pair_idx) = self.jobs[job_id].pair else {
                continue;
            };
            if self.grant_more(pair_idx, job_id) {
                self.jobs[job_id].space_blocked = false;
                self.space_blocked.retain(|&j| j != job_id);
                debug!(job = job_id, "space-blocked job resumed");
            }
        }

        if self.space_blocked.is_empty() {
            return;
        }

        // Deadlock: every busy pair's job is space-blocked, the taper
        // is not moving data off the holding disks, and no abort is
        // already pending. Abort the job with the smallest outstanding
        // request — the cheapest way to let the others proceed.
        let all_blocked = self
            .pairs
            .iter()
            .filter_map(|p| p.job)
            .all(|j| self.jobs[j].space_blocked);
        let any_acks = self.jobs.iter().any(|j| !j.pending_acks.is_empty());
        if !all_blocked || self.taper_job.is_some() || any_acks {
            return;
        }

        let victim = self
            .space_blocked
            .iter()
            .copied()
            .min_by_key(|&j| self.jobs[j].pending_request);
        if let Some(victim) = victim {
            warn!(job = victim, "holding-space deadlock, aborting cheapest blocked job");
            self.runlog.append(
                LogKind::Warning,
                &[
                    "space-deadlock",
                    &self.jobs[victim].entry.host.clone(),
                    &self.jobs[victim].entry.device.clone(),
                ],
            );
            self.begin_teardown(victim, TeardownOutcome::Requeue);
        }
    }

    // ── Worker retirement ──────────────────────────────────────────

    /// A worker produced garbage or vanished; it is never reused this
    /// run. Its in-flight job is requeued once, then failed.
    fn worker_down(&mut self, worker: WorkerId, reason: &str) {
        let Some(role) = self.roles.get(&worker).copied() else {
            return;
        };
        match role {
            Role::Dumper(pair_idx) | Role::Chunker(pair_idx) => {
                let already_down = match role {
                    Role::Dumper(_) => self.pairs[pair_idx].dumper_state == SlotState::Down,
                    _ => self.pairs[pair_idx].chunker_state == SlotState::Down,
                };
                if already_down {
                    return;
                }
                warn!(worker, reason, "worker retired for the run");
                match role {
                    Role::Dumper(_) => self.pairs[pair_idx].dumper_state = SlotState::Down,
                    _ => self.pairs[pair_idx].chunker_state = SlotState::Down,
                }
                if let Some(job_id) = self.pairs[pair_idx].job {
                    if self.jobs[job_id].teardown.is_some() {
                        // It can no longer acknowledge; count its ack.
                        if self.jobs[job_id].pending_acks.contains(&worker) {
                            self.ack_abort(job_id, worker);
                        }
                    } else {
                        let message = format!("worker retired: {reason}");
                        let outcome = if self.jobs[job_id].attempts == 0 {
                            TeardownOutcome::Requeue
                        } else {
                            TeardownOutcome::Fail(message)
                        };
                        self.begin_teardown(job_id, outcome);
                    }
                }
            }
            Role::Taper => {
                if self.taper_state == SlotState::Down && self.degraded {
                    return;
                }
                self.enter_degraded(&format!("taper retired: {reason}"));
            }
        }
    }

    // ── End-of-run cleanup ─────────────────────────────────────────

    /// Nothing is in flight and nothing can be: resolve every job that
    /// will never run tonight.
    fn fail_stranded(&mut self) {
        let stranded: Vec<JobId> = self
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| matches!(j.state, JobState::Waiting | JobState::Runnable))
            .map(|(id, _)| id)
            .collect();
        for job_id in stranded {
            self.fail_from_queue(job_id, "could not be dispatched before end of run");
        }

        // Staged dumps with no usable taper stay on holding disk.
        while let Some(job_id) = self.tape_ready.peek_big() {
            self.tape_ready.remove(job_id);
            self.leave_staged(job_id);
        }
    }
}

fn default_disk(entry: &ScheduleEntry) -> Disk {
    Disk {
        host: entry.host.clone(),
        device: entry.device.clone(),
        strategy: spool_core::DumpStrategy::Standard,
        priority: entry.priority,
        compression: spool_core::Compression::None,
        spindle: -1,
        max_dumps: 1,
        interface: "default".to_string(),
        no_hold: false,
        start_delay_secs: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{LocalWorker, WorkerKind, connect_local};
    use spool_core::{Compression, DumpStrategy};

    const RUNDATE: EpochDay = 20_500;

    struct Harness {
        driver: Driver,
        dumpers: Vec<LocalWorker>,
        chunkers: Vec<LocalWorker>,
        taper: Option<LocalWorker>,
        runlog: RunLog,
        stats: StatsStore,
    }

    fn config(extra: &str) -> SpoolConfig {
        SpoolConfig::from_str(&format!(
            r#"
            [tape]
            length_kb = 10000000
            filemark_kb = 100
            label = "DAILY01"

            [cycle]
            dumpcycle_days = 7
            runs_per_cycle = 7
            tapecycle = 10

            [timeouts]
            etimeout_secs = 60
            dtimeout_secs = 0
            retry_delay_secs = 30

            {extra}
        "#
        ))
        .unwrap()
    }

    fn disk(host: &str, device: &str) -> Disk {
        Disk {
            host: host.to_string(),
            device: device.to_string(),
            strategy: DumpStrategy::Standard,
            priority: 5,
            compression: Compression::None,
            spindle: -1,
            max_dumps: 1,
            interface: "default".to_string(),
            no_hold: false,
            start_delay_secs: 0,
        }
    }

    fn entry(host: &str, device: &str, priority: u32, size: Kb, time_secs: u64) -> ScheduleEntry {
        ScheduleEntry {
            host: host.to_string(),
            device: device.to_string(),
            priority,
            level: 0,
            dumpdate: 0,
            size,
            time_secs,
            degraded: None,
        }
    }

    fn harness(
        config: SpoolConfig,
        disks: Vec<Disk>,
        schedule: Vec<ScheduleEntry>,
        pairs: usize,
        with_taper: bool,
    ) -> Harness {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut dumpers = Vec::new();
        let mut chunkers = Vec::new();
        let mut pair_handles = Vec::new();
        for idx in 0..pairs {
            let (dumper_handle, dumper) =
                connect_local(idx * 2, WorkerKind::Dumper, events_tx.clone());
            let (chunker_handle, chunker) =
                connect_local(idx * 2 + 1, WorkerKind::Chunker, events_tx.clone());
            dumpers.push(dumper);
            chunkers.push(chunker);
            pair_handles.push((dumper_handle, chunker_handle));
        }
        let (taper_handle, taper) = if with_taper {
            let (handle, local) = connect_local(1000, WorkerKind::Taper, events_tx.clone());
            (Some(handle), Some(local))
        } else {
            (None, None)
        };

        let stats = StatsStore::open_in_memory().unwrap();
        let runlog = RunLog::memory();
        let mut driver = Driver::new(
            config,
            disks,
            schedule,
            RUNDATE,
            stats.clone(),
            runlog.clone(),
            WorkerSet {
                pairs: pair_handles,
                taper: taper_handle,
            },
            events_rx,
        );
        driver.begin_run();
        driver.tick();
        Harness {
            driver,
            dumpers,
            chunkers,
            taper,
            runlog,
            stats,
        }
    }

    fn serial_of(command: &Command) -> Serial {
        match command {
            Command::FileWrite { serial, .. }
            | Command::PortWrite { serial, .. }
            | Command::PortDump { serial, .. }
            | Command::Continue { serial, .. }
            | Command::Abort { serial } => *serial,
            other => panic!("command has no serial: {other:?}"),
        }
    }

    /// Drive one dispatched dump (its FILE-WRITE already consumed by
    /// the caller) from PORT through both DONEs.
    fn complete_dump(h: &mut Harness, pair: usize, serial: Serial, origin: Kb, dumped: Kb, secs: u64) {
        h.chunkers[pair].reply_line(&format!("PORT {}", 4000 + pair));
        h.driver.tick();
        let port_dump = h.dumpers[pair].next_command().expect("dumper command");
        assert!(matches!(port_dump, Command::PortDump { .. }));

        h.dumpers[pair].reply_line(&format!("DONE {serial} {origin} {dumped} {secs}"));
        h.driver.tick();
        h.chunkers[pair].reply_line(&format!("DONE {serial} {origin} {dumped} {secs}"));
        h.driver.tick();
    }

    #[test]
    fn staged_dump_reaches_tape_and_advances_stats() {
        let cfg = config(
            r#"
            [workers]
            inparallel = 1
            dump_order = "T"
            max_dumps_per_host = 1

            [[holdingdisk]]
            directory = "/hold"
            capacity_kb = 1000000
            chunk_kb = 1024
        "#,
        );
        let mut h = harness(
            cfg,
            vec![disk("web1", "/home")],
            vec![entry("web1", "/home", 9, 50_000, 50)],
            1,
            true,
        );

        // START-TAPER goes out at begin_run.
        assert!(matches!(
            h.taper.as_mut().unwrap().next_command(),
            Some(Command::StartTaper { .. })
        ));

        // Chunker got the holding file; path follows the naming scheme.
        let serial = {
            let command = h.chunkers[0].next_command().expect("FILE-WRITE");
            match &command {
                Command::FileWrite { path, .. } => {
                    assert_eq!(
                        path,
                        &std::path::PathBuf::from("/hold/20500/web1._home.0")
                    );
                }
                other => panic!("expected FILE-WRITE, got {other:?}"),
            }
            serial_of(&command)
        };

        h.chunkers[0].reply_line("PORT 4010");
        h.driver.tick();
        match h.dumpers[0].next_command().expect("PORT-DUMP") {
            Command::PortDump { port, .. } => assert_eq!(port, 4010),
            other => panic!("expected PORT-DUMP, got {other:?}"),
        }

        h.dumpers[0].reply_line(&format!("DONE {serial} 50000 42000 48"));
        h.driver.tick();
        h.chunkers[0].reply_line(&format!("DONE {serial} 50000 42000 48"));
        h.driver.tick();

        // Now queued for tape and dispatched to the taper.
        match h.taper.as_mut().unwrap().next_command().expect("taper FILE-WRITE") {
            Command::FileWrite { serial: s, .. } => assert_eq!(s, serial),
            other => panic!("expected taper FILE-WRITE, got {other:?}"),
        }
        h.taper.as_ref().unwrap().reply_line(&format!("TAPER-OK {serial}"));
        h.driver.tick();

        assert!(h.driver.finished());
        let summary = h.driver.finish_run();
        assert_eq!(
            summary,
            RunSummary {
                succeeded: 1,
                failed: 0,
                taped: 1,
                degraded: false
            }
        );

        // Stats advanced, with the tape position recorded.
        let stats = h.stats.get("web1", "/home").unwrap().unwrap();
        assert_eq!(stats.last_level, 0);
        assert_eq!(stats.levels[0].size, 50_000);
        assert_eq!(stats.levels[0].csize, 42_000);
        assert_eq!(stats.levels[0].date, RUNDATE);
        assert_eq!(stats.levels[0].label.as_deref(), Some("DAILY01"));

        let lines = h.runlog.lines();
        assert!(lines.iter().any(|l| l.starts_with("SUCCESS web1 /home 0")));
        assert!(lines.iter().any(|l| l.starts_with("DONE driver 1 0 1")));
    }

    // Scenario: the highest-priority runnable needs more bandwidth than
    // is free; the scheduler skips it, dispatches the next eligible
    // one, and comes back once bandwidth frees.
    #[test]
    fn bandwidth_gate_skips_then_readmits() {
        let cfg = config(
            r#"
            [workers]
            inparallel = 2
            dump_order = "TT"
            max_dumps_per_host = 4

            [[interface]]
            name = "eth0"
            max_kbps = 1000

            [[holdingdisk]]
            directory = "/hold"
            capacity_kb = 10000000
            chunk_kb = 1024
        "#,
        );
        let mut d0 = disk("first", "/a");
        d0.interface = "eth0".to_string();
        let mut da = disk("heavy", "/a");
        da.interface = "eth0".to_string();
        let mut db = disk("light", "/a");
        db.interface = "eth0".to_string();

        let mut h = harness(
            cfg,
            vec![d0, da, db],
            vec![
                entry("first", "/a", 10, 8_000, 10), // 800 kbps
                entry("heavy", "/a", 9, 9_000, 10),  // 900 kbps
                entry("light", "/a", 5, 1_000, 10),  // 100 kbps
            ],
            2,
            false,
        );

        // Pair 0 took "first"; pair 1 skipped "heavy" (200 kbps free)
        // and dispatched "light".
        let first_cmd = h.chunkers[0].next_command().expect("first dispatch");
        match &first_cmd {
            Command::FileWrite { spec, .. } => assert_eq!(spec.host, "first"),
            other => panic!("unexpected {other:?}"),
        }
        match h.chunkers[1].next_command().expect("light dispatch") {
            Command::FileWrite { spec, .. } => assert_eq!(spec.host, "light"),
            other => panic!("unexpected {other:?}"),
        }

        // Finish "first": its 800 kbps frees, leaving 900 available.
        complete_dump(&mut h, 0, serial_of(&first_cmd), 8_000, 8_000, 10);

        match h.chunkers[0].next_command().expect("heavy dispatch") {
            Command::FileWrite { spec, .. } => assert_eq!(spec.host, "heavy"),
            other => panic!("unexpected {other:?}"),
        }
    }

    // Scenario: a tape error mid-run degrades the whole run; staged
    // dumps stay on holding disk and no-hold disks are failed, not
    // dispatched.
    #[test]
    fn tape_error_enters_degraded_mode() {
        let cfg = config(
            r#"
            [workers]
            inparallel = 1
            dump_order = "T"
            max_dumps_per_host = 2

            [[holdingdisk]]
            directory = "/hold"
            capacity_kb = 1000000
            chunk_kb = 1024
        "#,
        );
        let mut nohold = disk("web1", "/nohold");
        nohold.no_hold = true;

        // A pending full with a precomputed degraded incremental, held
        // back by a start delay so it is still queued when tape dies.
        let mut pending_full = entry("web2", "/home", 3, 80_000, 80);
        pending_full.degraded = Some(spool_core::DegradedEntry {
            level: 1,
            dumpdate: RUNDATE - 7,
            size: 4_000,
            time_secs: 4,
        });
        let mut delayed = disk("web2", "/home");
        delayed.start_delay_secs = 100;

        let mut h = harness(
            cfg,
            vec![disk("web1", "/home"), nohold, delayed],
            vec![
                entry("web1", "/home", 9, 50_000, 50),
                entry("web1", "/nohold", 5, 10_000, 10),
                pending_full,
            ],
            1,
            true,
        );
        let _ = h.taper.as_mut().unwrap().next_command(); // START-TAPER

        let command = h.chunkers[0].next_command().expect("dispatch");
        let serial = serial_of(&command);
        complete_dump(&mut h, 0, serial, 50_000, 42_000, 48);

        // Taper takes the staged dump, then the drive dies.
        let _ = h.taper.as_mut().unwrap().next_command().expect("taper FILE-WRITE");
        h.taper
            .as_ref()
            .unwrap()
            .reply_line(&format!("TAPE-ERROR {serial} write failed"));
        h.driver.tick();

        assert!(h.driver.degraded);
        let lines = h.runlog.lines();
        assert!(lines.iter().any(|l| l.starts_with("DEGRADED")));
        // The staged dump is kept for a later flush run.
        assert!(lines.iter().any(|l| l.starts_with("INFO staged web1 /home")));
        // The no-hold disk is failed, not dispatched.
        assert!(lines.iter().any(|l| l.starts_with("FAIL web1 /nohold")));
        // And nothing further goes to the taper.
        assert!(h.taper.as_mut().unwrap().next_command().is_none());

        // Once its start delay passes, the pending full runs its
        // degraded incremental to holding disk instead.
        h.driver.clock_secs = 100;
        h.driver.tick();
        match h.chunkers[0].next_command().expect("degraded dispatch") {
            Command::FileWrite { spec, .. } => {
                assert_eq!(spec.host, "web2");
                assert_eq!(spec.level, 1);
                assert_eq!(spec.dumpdate, RUNDATE - 7);
            }
            other => panic!("expected FILE-WRITE, got {other:?}"),
        }

        let summary = h.driver.finish_run();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.taped, 0);
        assert!(summary.degraded);
    }

    #[test]
    fn tryagain_retries_once_then_fails() {
        let cfg = config(
            r#"
            [workers]
            inparallel = 1
            dump_order = "T"
            max_dumps_per_host = 1

            [[holdingdisk]]
            directory = "/hold"
            capacity_kb = 1000000
            chunk_kb = 1024
        "#,
        );
        let mut h = harness(
            cfg,
            vec![disk("web1", "/home")],
            vec![entry("web1", "/home", 9, 50_000, 50)],
            1,
            false,
        );

        let first = h.chunkers[0].next_command().expect("dispatch");
        let serial1 = serial_of(&first);
        h.chunkers[0].reply_line("PORT 4010");
        h.driver.tick();
        let _ = h.dumpers[0].next_command();

        // First TRYAGAIN: the chunker is aborted, then the job requeues.
        h.dumpers[0].reply_line(&format!("TRYAGAIN {serial1} client busy"));
        h.driver.tick();
        match h.chunkers[0].next_command().expect("abort") {
            Command::Abort { serial } => assert_eq!(serial, serial1),
            other => panic!("expected ABORT, got {other:?}"),
        }
        h.chunkers[0].reply_line(&format!("ABORT-FINISHED {serial1}"));
        h.driver.tick();

        // Not yet failed; requeued with a retry delay.
        assert!(!h.driver.finished());
        assert!(h.chunkers[0].next_command().is_none(), "retry must be delayed");

        h.driver.clock_secs = 30;
        h.driver.tick();
        let second = h.chunkers[0].next_command().expect("redispatch");
        let serial2 = serial_of(&second);
        assert_ne!(serial1, serial2, "a retry gets a fresh serial");

        // Second TRYAGAIN is promoted to failure.
        h.chunkers[0].reply_line("PORT 4011");
        h.driver.tick();
        let _ = h.dumpers[0].next_command();
        h.dumpers[0].reply_line(&format!("TRYAGAIN {serial2} still busy"));
        h.driver.tick();
        match h.chunkers[0].next_command().expect("abort") {
            Command::Abort { serial } => assert_eq!(serial, serial2),
            other => panic!("expected ABORT, got {other:?}"),
        }
        h.chunkers[0].reply_line(&format!("ABORT-FINISHED {serial2}"));
        h.driver.tick();

        assert!(h.driver.finished());
        let lines = h.runlog.lines();
        assert!(lines.iter().any(|l| l.starts_with("FAIL web1 /home")));
        // Stats were never advanced for the failed dump.
        assert!(h.stats.get("web1", "/home").unwrap().is_none());
    }

    #[test]
    fn bogus_worker_is_retired_and_job_moves_to_another_pair() {
        let cfg = config(
            r#"
            [workers]
            inparallel = 2
            dump_order = "TT"
            max_dumps_per_host = 1

            [[holdingdisk]]
            directory = "/hold"
            capacity_kb = 1000000
            chunk_kb = 1024
        "#,
        );
        let mut h = harness(
            cfg,
            vec![disk("web1", "/home")],
            vec![entry("web1", "/home", 9, 50_000, 50)],
            2,
            false,
        );

        let first = h.chunkers[0].next_command().expect("dispatch");
        let serial1 = serial_of(&first);
        h.chunkers[0].reply_line("PORT 4010");
        h.driver.tick();
        let _ = h.dumpers[0].next_command();

        // Dumper 0 emits garbage: retired for the run.
        h.dumpers[0].reply_line("!!not a protocol line!!");
        h.driver.tick();
        match h.chunkers[0].next_command().expect("abort for in-flight job") {
            Command::Abort { serial } => assert_eq!(serial, serial1),
            other => panic!("expected ABORT, got {other:?}"),
        }
        h.chunkers[0].reply_line(&format!("ABORT-FINISHED {serial1}"));
        h.driver.tick();

        let lines = h.runlog.lines();
        assert!(lines.iter().any(|l| l.starts_with("STRANGE worker 0")));

        // After the retry delay the job lands on the healthy pair.
        h.driver.clock_secs = 30;
        h.driver.tick();
        assert!(h.chunkers[0].next_command().is_none(), "pair 0 is down");
        let second = h.chunkers[1].next_command().expect("redispatch on pair 1");
        assert_ne!(serial_of(&second), serial1);
    }

    #[test]
    fn mismatched_serial_is_logged_and_dropped() {
        let cfg = config(
            r#"
            [workers]
            inparallel = 1
            dump_order = "T"
            max_dumps_per_host = 1

            [[holdingdisk]]
            directory = "/hold"
            capacity_kb = 1000000
            chunk_kb = 1024
        "#,
        );
        let mut h = harness(
            cfg,
            vec![disk("web1", "/home")],
            vec![entry("web1", "/home", 9, 50_000, 50)],
            1,
            false,
        );

        let command = h.chunkers[0].next_command().expect("dispatch");
        let serial = serial_of(&command);

        // A result for a serial that is not in flight.
        h.dumpers[0].reply_line("DONE 9-99 1 1 1");
        h.driver.tick();

        assert!(
            h.runlog.lines().iter().any(|l| l.starts_with("STRANGE serial-mismatch")),
            "mismatch must be logged"
        );
        // The real job is unaffected and can still complete.
        h.chunkers[0].reply_line("PORT 4010");
        h.driver.tick();
        let _ = h.dumpers[0].next_command();
        h.dumpers[0].reply_line(&format!("DONE {serial} 100 100 1"));
        h.driver.tick();
        h.chunkers[0].reply_line(&format!("DONE {serial} 100 100 1"));
        h.driver.tick();
        assert!(h.stats.get("web1", "/home").unwrap().is_some());
    }

    #[test]
    fn rq_more_disk_walks_segments_then_extends() {
        let cfg = config(
            r#"
            [workers]
            inparallel = 1
            dump_order = "T"
            max_dumps_per_host = 1

            [[holdingdisk]]
            directory = "/hold1"
            capacity_kb = 30000
            chunk_kb = 1000

            [[holdingdisk]]
            directory = "/hold2"
            capacity_kb = 15000
            chunk_kb = 1000
        "#,
        );
        // 40_000 KiB exceeds either disk alone: 30_000 from disk 0
        // (29_000 of data), the remaining 11_000 from disk 1.
        let mut h = harness(
            cfg,
            vec![disk("web1", "/home")],
            vec![entry("web1", "/home", 9, 40_000, 50)],
            1,
            false,
        );

        let command = h.chunkers[0].next_command().expect("dispatch");
        let serial = serial_of(&command);
        match &command {
            Command::FileWrite { path, use_kb, .. } => {
                assert_eq!(path, &std::path::PathBuf::from("/hold1/20500/web1._home.0"));
                assert_eq!(*use_kb, 29_000);
            }
            other => panic!("unexpected {other:?}"),
        }
        h.chunkers[0].reply_line("PORT 4010");
        h.driver.tick();
        let _ = h.dumpers[0].next_command();

        // First RQ-MORE-DISK advances to the pre-granted second segment.
        h.chunkers[0].reply_line(&format!("RQ-MORE-DISK {serial}"));
        h.driver.tick();
        match h.chunkers[0].next_command().expect("CONTINUE") {
            Command::Continue { path, .. } => {
                // The spill segment lives on the second disk.
                assert_eq!(path, std::path::PathBuf::from("/hold2/20500/web1._home.0.1"));
            }
            other => panic!("expected CONTINUE, got {other:?}"),
        }

        // Second RQ-MORE-DISK has no granted segment left: a 5% padded
        // extension is granted on the same disk and merged.
        h.chunkers[0].reply_line(&format!("RQ-MORE-DISK {serial}"));
        h.driver.tick();
        match h.chunkers[0].next_command().expect("extension CONTINUE") {
            Command::Continue { path, use_kb, .. } => {
                assert_eq!(path, std::path::PathBuf::from("/hold2/20500/web1._home.0.1"));
                assert_eq!(use_kb, 2_000); // 40_000 / 20
            }
            other => panic!("expected CONTINUE, got {other:?}"),
        }
    }

    #[test]
    fn space_deadlock_aborts_the_cheapest_blocked_job() {
        let cfg = config(
            r#"
            [workers]
            inparallel = 1
            dump_order = "T"
            max_dumps_per_host = 1

            [[holdingdisk]]
            directory = "/hold"
            capacity_kb = 50000
            chunk_kb = 10000
        "#,
        );
        let mut h = harness(
            cfg,
            vec![disk("web1", "/home")],
            vec![entry("web1", "/home", 9, 35_000, 50)],
            1,
            false,
        );

        let command = h.chunkers[0].next_command().expect("dispatch");
        let serial = serial_of(&command);
        h.chunkers[0].reply_line("PORT 4010");
        h.driver.tick();
        let _ = h.dumpers[0].next_command();

        // Extension succeeds once (10_000 granted, 15_000 free)…
        h.chunkers[0].reply_line(&format!("RQ-MORE-DISK {serial}"));
        h.driver.tick();
        assert!(matches!(
            h.chunkers[0].next_command(),
            Some(Command::Continue { .. })
        ));

        // …then the disk is exhausted: the job parks, and since every
        // busy worker is space-blocked with no taper draining, the
        // deadlock breaker aborts it.
        h.chunkers[0].reply_line(&format!("RQ-MORE-DISK {serial}"));
        h.driver.tick();

        let mut aborted = Vec::new();
        if let Some(Command::Abort { serial }) = h.dumpers[0].next_command() {
            aborted.push(serial);
        }
        if let Some(Command::Abort { serial }) = h.chunkers[0].next_command() {
            aborted.push(serial);
        }
        assert!(!aborted.is_empty(), "deadlock breaker must abort the job");
        assert!(aborted.iter().all(|s| *s == serial));
        assert!(
            h.runlog.lines().iter().any(|l| l.starts_with("WARNING space-deadlock")),
            "deadlock must be logged"
        );

        // Resources come back only after the acknowledgments.
        h.dumpers[0].reply_line(&format!("ABORT-FINISHED {serial}"));
        h.driver.tick();
        h.chunkers[0].reply_line(&format!("ABORT-FINISHED {serial}"));
        h.driver.tick();
        assert_eq!(h.driver.holding.allocated_kb(0), 0);
        assert!(!h.driver.finished(), "job is requeued, not failed");
    }

    #[test]
    fn no_hold_disk_dumps_direct_to_tape() {
        let cfg = config(
            r#"
            [workers]
            inparallel = 1
            dump_order = "T"
            max_dumps_per_host = 1

            [[holdingdisk]]
            directory = "/hold"
            capacity_kb = 1000000
            chunk_kb = 1024
        "#,
        );
        let mut nohold = disk("db1", "/data");
        nohold.no_hold = true;

        let mut h = harness(
            cfg,
            vec![nohold],
            vec![entry("db1", "/data", 9, 20_000, 20)],
            1,
            true,
        );
        let taper = h.taper.as_mut().unwrap();
        let _ = taper.next_command(); // START-TAPER

        let port_write = taper.next_command().expect("PORT-WRITE");
        let serial = serial_of(&port_write);
        assert!(matches!(port_write, Command::PortWrite { .. }));

        h.taper.as_ref().unwrap().reply_line("PORT 5000");
        h.driver.tick();
        match h.dumpers[0].next_command().expect("PORT-DUMP") {
            Command::PortDump { port, .. } => assert_eq!(port, 5000),
            other => panic!("unexpected {other:?}"),
        }

        h.dumpers[0].reply_line(&format!("DONE {serial} 20000 20000 20"));
        h.driver.tick();
        h.taper.as_ref().unwrap().reply_line(&format!("TAPER-OK {serial}"));
        h.driver.tick();

        assert!(h.driver.finished());
        let summary = h.driver.finish_run();
        assert_eq!(summary.taped, 1);
        assert_eq!(summary.succeeded, 1);
    }

    #[test]
    fn spindle_conflicts_serialize_same_host_dumps() {
        let cfg = config(
            r#"
            [workers]
            inparallel = 2
            dump_order = "TT"
            max_dumps_per_host = 4

            [[holdingdisk]]
            directory = "/hold"
            capacity_kb = 1000000
            chunk_kb = 1024
        "#,
        );
        let mut a = disk("web1", "/a");
        a.spindle = 1;
        a.max_dumps = 4;
        let mut b = disk("web1", "/b");
        b.spindle = 1;
        b.max_dumps = 4;

        let mut h = harness(
            cfg,
            vec![a, b],
            vec![
                entry("web1", "/a", 9, 10_000, 10),
                entry("web1", "/b", 5, 10_000, 10),
            ],
            2,
            false,
        );

        // Only one of the two same-spindle disks may run.
        let first = h.chunkers[0].next_command().expect("first spindle dispatch");
        assert!(h.chunkers[1].next_command().is_none(), "spindle gate must hold");

        complete_dump(&mut h, 0, serial_of(&first), 10_000, 10_000, 10);

        // With the spindle free the second disk dispatches.
        let second = h
            .chunkers
            .iter_mut()
            .find_map(|c| c.next_command())
            .expect("second disk dispatches after spindle frees");
        match second {
            Command::FileWrite { spec, .. } => assert_eq!(spec.device, "/b"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn stranded_jobs_fail_at_end_of_run() {
        // No holding disks and no taper: nothing can ever dispatch.
        let cfg = config(
            r#"
            [workers]
            inparallel = 1
            dump_order = "T"
            max_dumps_per_host = 1
        "#,
        );
        let mut h = harness(
            cfg,
            vec![disk("web1", "/home")],
            vec![entry("web1", "/home", 9, 10_000, 10)],
            1,
            false,
        );

        assert!(!h.driver.finished());
        h.driver.fail_stranded();
        assert!(h.driver.finished());
        assert!(
            h.runlog
                .lines()
                .iter()
                .any(|l| l.starts_with("FAIL web1 /home 0 could not be dispatched"))
        );
    }
}
