//! Holding-space ledger.
//!
//! Tracks each holding disk's allocated bytes and active writer count,
//! grants space for dumps (spilling across disks when one cannot cover
//! a request), and reconciles reservations against actual usage.
//!
//! Every reservation carries one chunk of header overhead: a grant of
//! `G` KiB holds `G − chunk` KiB of dump data. A disk is only eligible
//! while it has more than one free chunk.

use std::path::{Path, PathBuf};

use tracing::debug;

use spool_core::config::HoldingDiskConfig;
use spool_core::{EpochDay, Kb};

/// One disk's ledger entry.
#[derive(Debug)]
struct HoldingSlot {
    config: HoldingDiskConfig,
    allocated_kb: Kb,
    writers: u32,
}

/// A grant of space on one disk, not yet committed to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceRequest {
    pub disk: usize,
    pub kb: Kb,
}

/// A committed byte range on one holding disk, bound to a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub disk: usize,
    pub reserved_kb: Kb,
    pub used_kb: Kb,
    pub path: PathBuf,
    released: bool,
}

impl Reservation {
    /// Usable dump-data capacity: the grant minus the chunk header.
    pub fn data_kb(&self, ledger: &HoldingLedger) -> Kb {
        self.reserved_kb
            .saturating_sub(ledger.disks[self.disk].config.chunk_kb)
    }
}

/// The per-run holding-disk ledger.
#[derive(Debug)]
pub struct HoldingLedger {
    disks: Vec<HoldingSlot>,
}

impl HoldingLedger {
    pub fn new(configs: Vec<HoldingDiskConfig>) -> Self {
        let disks = configs
            .into_iter()
            .map(|config| HoldingSlot {
                config,
                allocated_kb: 0,
                writers: 0,
            })
            .collect();
        Self { disks }
    }

    pub fn disk_count(&self) -> usize {
        self.disks.len()
    }

    fn free(&self, disk: usize) -> Kb {
        let slot = &self.disks[disk];
        slot.config.capacity_kb.saturating_sub(slot.allocated_kb)
    }

    /// Total free space across all disks, for exhaustion checks.
    pub fn total_free_kb(&self) -> Kb {
        (0..self.disks.len()).map(|d| self.free(d)).sum()
    }

    pub fn writers(&self, disk: usize) -> u32 {
        self.disks[disk].writers
    }

    pub fn allocated_kb(&self, disk: usize) -> Kb {
        self.disks[disk].allocated_kb
    }

    /// Find space for a `size` KiB dump.
    ///
    /// Prefers `preferred` while it has room, then the disk with the
    /// fewest active writers (most free bytes breaking ties), spilling
    /// to further disks when one cannot cover the remainder. Returns
    /// `None` only when no combination of disks covers the request.
    pub fn find_space(&self, size: Kb, preferred: Option<usize>) -> Option<Vec<SpaceRequest>> {
        let mut requests: Vec<SpaceRequest> = Vec::new();
        let mut remaining = size;

        loop {
            let taken: Vec<usize> = requests.iter().map(|r| r.disk).collect();
            let eligible = |d: &usize| {
                !taken.contains(d) && self.free(*d) > self.disks[*d].config.chunk_kb
            };

            let pick = preferred
                .filter(|d| requests.is_empty() && *d < self.disks.len() && eligible(d))
                .or_else(|| {
                    (0..self.disks.len())
                        .filter(eligible)
                        .min_by_key(|&d| (self.disks[d].writers, std::cmp::Reverse(self.free(d))))
                });
            let Some(disk) = pick else {
                return None;
            };

            let free = self.free(disk);
            let chunk = self.disks[disk].config.chunk_kb;
            if free >= remaining {
                // This disk covers the rest in one grant; the grant is
                // at least a chunk so the header fits.
                requests.push(SpaceRequest {
                    disk,
                    kb: remaining.max(chunk),
                });
                return Some(requests);
            }
            // Partial grant: take everything free; one chunk of it is
            // header, the rest is data.
            requests.push(SpaceRequest { disk, kb: free });
            remaining -= free - chunk;
        }
    }

    /// Commit granted space onto a job's reservation list.
    ///
    /// A grant on the same disk as the list's final reservation merges
    /// into it instead of growing the list; otherwise a new reservation
    /// is opened on the granted disk with the next continuation suffix.
    /// `rel` is the run-relative holding file name (`<rundate>/<name>`);
    /// each segment lives under its own disk's directory.
    pub fn assign(
        &mut self,
        reservations: &mut Vec<Reservation>,
        requests: &[SpaceRequest],
        rel: &Path,
    ) {
        for request in requests {
            self.disks[request.disk].allocated_kb += request.kb;

            if let Some(last) = reservations
                .last_mut()
                .filter(|r| r.disk == request.disk && !r.released)
            {
                last.reserved_kb += request.kb;
                debug!(disk = request.disk, kb = request.kb, "reservation extended");
                continue;
            }

            let base = self.disks[request.disk].config.directory.join(rel);
            let path = continuation_path(&base, reservations.len());
            self.disks[request.disk].writers += 1;
            debug!(disk = request.disk, kb = request.kb, path = %path.display(), "reservation opened");
            reservations.push(Reservation {
                disk: request.disk,
                reserved_kb: request.kb,
                used_kb: 0,
                path,
                released: false,
            });
        }
    }

    /// Reconcile one reservation against the bytes actually written,
    /// returning the unused remainder to the disk.
    pub fn adjust(&mut self, reservation: &mut Reservation, used_kb: Kb) {
        if reservation.released {
            return;
        }
        let charged = used_kb.min(reservation.reserved_kb);
        let unused = reservation.reserved_kb - charged;
        self.disks[reservation.disk].allocated_kb -= unused;
        reservation.reserved_kb = charged;
        reservation.used_kb = charged;
    }

    /// Give back part of a grant the chunker reported it cannot use.
    pub fn shrink(&mut self, reservation: &mut Reservation, shortfall_kb: Kb) {
        if reservation.released {
            return;
        }
        let returned = shortfall_kb.min(reservation.reserved_kb);
        reservation.reserved_kb -= returned;
        self.disks[reservation.disk].allocated_kb -= returned;
    }

    /// Release every reservation a job holds. Idempotent: already
    /// released reservations are not credited twice.
    pub fn release(&mut self, reservations: &mut [Reservation]) {
        for reservation in reservations.iter_mut() {
            if reservation.released {
                continue;
            }
            reservation.released = true;
            let slot = &mut self.disks[reservation.disk];
            slot.allocated_kb = slot.allocated_kb.saturating_sub(reservation.reserved_kb);
            slot.writers = slot.writers.saturating_sub(1);
            debug!(
                disk = reservation.disk,
                kb = reservation.reserved_kb,
                "reservation released"
            );
        }
    }

    /// Keep the space (the staged file is real data) but stop counting
    /// the job as an active writer. Used when a dump stays on holding
    /// disk for a later flush.
    pub fn detach_writers(&mut self, reservations: &mut [Reservation]) {
        for reservation in reservations.iter_mut() {
            if reservation.released {
                continue;
            }
            reservation.released = true;
            let slot = &mut self.disks[reservation.disk];
            slot.writers = slot.writers.saturating_sub(1);
        }
    }

    /// Directory root of a disk, for path construction.
    pub fn root(&self, disk: usize) -> &Path {
        &self.disks[disk].config.directory
    }

    pub fn chunk_kb(&self, disk: usize) -> Kb {
        self.disks[disk].config.chunk_kb
    }
}

// ── Holding file naming ────────────────────────────────────────────

/// Replace path separators and shell-hostile characters so a device
/// path becomes one filename component.
pub fn sanitize_device(device: &str) -> String {
    device
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

/// Run-relative holding file name: `<rundate>/<host>.<sanitized_device>.<level>`.
/// Joined to a holding disk's directory this yields the full
/// `<root>/<rundate>/<host>.<sanitized_device>.<level>` path.
pub fn holding_rel(rundate: EpochDay, host: &str, device: &str, level: u32) -> PathBuf {
    PathBuf::from(rundate.to_string())
        .join(format!("{host}.{}.{level}", sanitize_device(device)))
}

/// Continuation files append `.1`, `.2`, … to the base name.
pub fn continuation_path(base: &Path, seq: usize) -> PathBuf {
    if seq == 0 {
        base.to_path_buf()
    } else {
        let mut name = base.as_os_str().to_os_string();
        name.push(format!(".{seq}"));
        PathBuf::from(name)
    }
}
