//! The per-device report ring (§4.3): a fixed 4032-slot array anchored at
//! `equipmentReportsOffset`, backed by an append-only log and rotated
//! hourly to retire the oldest week to archive storage.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use gca_core::error::Result;
use gca_core::timeslot::{Timeslot, WEEK_SLOTS};
use gca_core::wire::report::{EquipmentReport, EQUIPMENT_REPORT_WIRE_SIZE, POWER_OUTPUT_EMPTY};

use crate::persist::append_log::archive_matching;
use crate::persist::AppendLog;

const RING_SLOTS: usize = 4032;
const ROTATION_THRESHOLD_SLOTS: u32 = 3024;
/// Bound on `recentReports`; halves (drops the front half) when full
/// rather than growing without limit.
const RECENT_REPORTS_CAPACITY: usize = 100_000;

/// What `integrate` decided to do with an incoming report, for callers
/// that want to distinguish "stored" from "already had it" from "banned".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrateOutcome {
    Stored,
    Idempotent,
    Banned,
    Dropped,
}

struct DeviceRing {
    offset: u32,
    slots: Box<[EquipmentReport; RING_SLOTS]>,
}

impl DeviceRing {
    fn new(offset: u32) -> Self {
        DeviceRing {
            offset,
            slots: Box::new([EquipmentReport {
                short_id: 0,
                timeslot: 0,
                power_output: POWER_OUTPUT_EMPTY,
                signature: [0u8; 64],
            }; RING_SLOTS]),
        }
    }

    fn idx(&self, timeslot: u32) -> Option<usize> {
        let idx = timeslot.checked_sub(self.offset)?;
        if idx as usize >= RING_SLOTS {
            return None;
        }
        Some(idx as usize)
    }
}

struct Inner {
    rings: HashMap<u32, DeviceRing>,
    recent: VecDeque<EquipmentReport>,
    log: AppendLog,
    log_path: PathBuf,
}

impl Inner {
    /// The pure decision function behind `integrate`: given the current
    /// slot contents (if any) and an incoming, already signature-verified
    /// report, decide what should land in the slot. Shared between the
    /// live ingest path and log replay.
    fn decide(existing: Option<&EquipmentReport>, incoming: &EquipmentReport) -> IntegrateOutcome {
        match existing {
            None => IntegrateOutcome::Stored,
            Some(slot) if slot.is_empty_slot() => IntegrateOutcome::Stored,
            Some(slot) if slot.is_banned_slot() => IntegrateOutcome::Dropped,
            Some(slot) if slot.power_output == incoming.power_output && slot.signature == incoming.signature => {
                IntegrateOutcome::Idempotent
            }
            Some(_) => IntegrateOutcome::Banned,
        }
    }
}

pub struct ReportStore {
    dir: PathBuf,
    inner: std::sync::Mutex<Inner>,
}

impl ReportStore {
    pub fn open(dir: &Path, now: Timeslot) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let log_path = dir.join("equipment-reports.dat");
        let raw_records = AppendLog::replay(&log_path, EQUIPMENT_REPORT_WIRE_SIZE)?;
        let log = AppendLog::open(&log_path, EQUIPMENT_REPORT_WIRE_SIZE)?;
        let anchor = default_ring_anchor(now);
        let mut inner = Inner {
            rings: HashMap::new(),
            recent: VecDeque::new(),
            log,
            log_path: log_path.clone(),
        };
        for raw in &raw_records {
            if let Ok(report) = EquipmentReport::from_bytes(raw) {
                inner.apply_without_logging(report, anchor);
            }
        }
        Ok(ReportStore {
            dir: dir.to_path_buf(),
            inner: std::sync::Mutex::new(inner),
        })
    }

    /// §4.3 `integrate`. Assumes the caller has already resolved whether
    /// `short_id` is known/banned (that lives in the equipment-authorization
    /// store, a separate mutex, never held at the same time as this one).
    pub fn integrate(&self, report: EquipmentReport, public_key: &[u8; 32], now: Timeslot) -> Result<IntegrateOutcome> {
        if !report.verify(public_key) {
            return Ok(IntegrateOutcome::Dropped);
        }

        let anchor = default_ring_anchor(now);
        let mut inner = self.inner.lock().expect("report store mutex poisoned");
        let outcome = inner.apply(report, anchor);
        if matches!(outcome, IntegrateOutcome::Stored | IntegrateOutcome::Banned) {
            inner.recent.push_back(report);
            if inner.recent.len() > RECENT_REPORTS_CAPACITY {
                let half = inner.recent.len() / 2;
                inner.recent.drain(0..half);
            }
        }
        Ok(outcome)
    }

    pub fn recent(&self) -> Vec<EquipmentReport> {
        let inner = self.inner.lock().expect("report store mutex poisoned");
        inner.recent.iter().copied().collect()
    }

    /// §4.3 ring rotation. Call from the hourly background task; a no-op
    /// unless the ring has drifted past the 1.5-week threshold. Besides
    /// retiring the in-memory ring's oldest week, this also shrinks the
    /// shared `equipment-reports.dat` log so a restart replays only the
    /// ~2 weeks still live, not the device's entire history.
    pub fn rotate_if_due(&self, short_id: u32, now: Timeslot) -> Result<()> {
        let archive_dir = self.dir.join("archive");
        std::fs::create_dir_all(&archive_dir)?;

        let mut inner = self.inner.lock().expect("report store mutex poisoned");
        let ring = match inner.rings.get(&short_id) {
            Some(r) => r,
            None => return Ok(()),
        };
        if now.0.saturating_sub(ring.offset) < ROTATION_THRESHOLD_SLOTS {
            return Ok(());
        }

        let old_offset = ring.offset;
        let new_offset = old_offset + WEEK_SLOTS;

        let mut new_ring = DeviceRing::new(new_offset);
        for (i, report) in ring.slots[WEEK_SLOTS as usize..RING_SLOTS].iter().enumerate() {
            new_ring.slots[i] = *report;
        }
        inner.rings.insert(short_id, new_ring);

        // Hold the lock across the rewrite so no concurrent `integrate()`
        // appends to the log between the replay and the rename.
        let archive_path = archive_dir.join(format!("{short_id}-week-{old_offset}.dat"));
        archive_matching(&inner.log_path, &archive_path, EQUIPMENT_REPORT_WIRE_SIZE, |record| {
            match EquipmentReport::from_bytes(record) {
                Ok(report) => report.short_id == short_id && report.timeslot >= old_offset && report.timeslot < new_offset,
                Err(_) => false,
            }
        })?;
        // The live log's file handle was opened in append mode against the
        // pre-rewrite inode; reopen it so later appends land in the
        // rewritten file instead of the now-unlinked old one.
        inner.log = AppendLog::open(&inner.log_path, EQUIPMENT_REPORT_WIRE_SIZE)?;
        Ok(())
    }

    pub fn log_path(&self) -> PathBuf {
        self.inner.lock().expect("report store mutex poisoned").log_path.clone()
    }

    /// §4.4 TCP sync: the current ring offset and bitfield for a device,
    /// or `None` if nothing has ever been ingested for it.
    pub fn sync_bitfield(&self, short_id: u32) -> Option<(u32, [u8; 504])> {
        let inner = self.inner.lock().expect("report store mutex poisoned");
        let ring = inner.rings.get(&short_id)?;
        Some((ring.offset, bitfield_for(&ring.slots)))
    }

    /// §4.5 `/recent-reports`: the most recent full week (2016 slots) of
    /// the device's ring — the upper half, since rotation always moves
    /// the newer half down to `[0, 2016)` only once it becomes the older
    /// half in turn.
    pub fn last_week(&self, short_id: u32) -> Option<Vec<EquipmentReport>> {
        let inner = self.inner.lock().expect("report store mutex poisoned");
        let ring = inner.rings.get(&short_id)?;
        Some(ring.slots[WEEK_SLOTS as usize..RING_SLOTS].to_vec())
    }

    /// §4.5 `/all-device-stats`: each known device's reports for the
    /// week starting at `timeslot_offset`.
    pub fn stats_for_offset(&self, timeslot_offset: u32) -> Vec<(u32, Vec<EquipmentReport>)> {
        let inner = self.inner.lock().expect("report store mutex poisoned");
        let mut out = Vec::new();
        for (&short_id, ring) in inner.rings.iter() {
            let Some(start) = timeslot_offset.checked_sub(ring.offset) else {
                continue;
            };
            let start = start as usize;
            if start >= RING_SLOTS {
                continue;
            }
            let end = (start + WEEK_SLOTS as usize).min(RING_SLOTS);
            out.push((short_id, ring.slots[start..end].to_vec()));
        }
        out
    }
}

/// A week boundary between one and two weeks before `now`, satisfying
/// §3's "≥ 4 days and < 2 weeks in the past" constraint on a freshly
/// created ring's anchor.
fn default_ring_anchor(now: Timeslot) -> u32 {
    now.week_start().0.saturating_sub(WEEK_SLOTS)
}

impl Inner {
    fn apply(&mut self, report: EquipmentReport, anchor: u32) -> IntegrateOutcome {
        let ring = self
            .rings
            .entry(report.short_id)
            .or_insert_with(|| DeviceRing::new(anchor));

        let Some(idx) = ring.idx(report.timeslot) else {
            return IntegrateOutcome::Dropped;
        };

        let existing = ring.slots[idx];
        let existing_ref = if existing.is_empty_slot() && existing.signature == [0u8; 64] {
            None
        } else {
            Some(&existing)
        };
        let outcome = Inner::decide(existing_ref, &report);

        match outcome {
            IntegrateOutcome::Stored => {
                ring.slots[idx] = report;
                let _ = self.log.append(&report.to_bytes());
            }
            IntegrateOutcome::Banned => {
                let sentinel = EquipmentReport::banned_sentinel(report.short_id, report.timeslot);
                ring.slots[idx] = sentinel;
                let _ = self.log.append(&sentinel.to_bytes());
            }
            IntegrateOutcome::Idempotent | IntegrateOutcome::Dropped => {}
        }
        outcome
    }

    /// Same decision rule as `apply`, used for replay: the record is
    /// already on disk, so no append happens.
    fn apply_without_logging(&mut self, report: EquipmentReport, default_offset: u32) {
        let ring = self
            .rings
            .entry(report.short_id)
            .or_insert_with(|| DeviceRing::new(default_offset));

        let Some(idx) = ring.idx(report.timeslot) else {
            return;
        };
        let existing = ring.slots[idx];
        let existing_ref = if existing.is_empty_slot() && existing.signature == [0u8; 64] {
            None
        } else {
            Some(&existing)
        };
        match Inner::decide(existing_ref, &report) {
            IntegrateOutcome::Stored => ring.slots[idx] = report,
            IntegrateOutcome::Banned => {
                ring.slots[idx] = EquipmentReport::banned_sentinel(report.short_id, report.timeslot)
            }
            IntegrateOutcome::Idempotent | IntegrateOutcome::Dropped => {}
        }
    }
}

/// Compute the 504-byte bitfield for §4.4's TCP sync response: bit `i` set
/// iff slot `offset+i` is non-empty and non-banned, for `i` in `[0, 4032)`.
pub fn bitfield_for(ring_slots: &[EquipmentReport; RING_SLOTS]) -> [u8; 504] {
    let mut out = [0u8; 504];
    for (i, report) in ring_slots.iter().enumerate() {
        if !report.is_empty_slot() && !report.is_banned_slot() {
            out[i / 8] |= 1 << (i % 8);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use gca_core::keys::KeyPair;

    #[test]
    fn empty_slot_is_stored() {
        let dir = tempfile::tempdir().unwrap();
        let kp = KeyPair::generate();
        let store = ReportStore::open(dir.path(), Timeslot(0)).unwrap();
        let r = EquipmentReport::new_signed(1, 0, 5, &kp);
        assert_eq!(store.integrate(r, &kp.public_bytes(), Timeslot(0)).unwrap(), IntegrateOutcome::Stored);
    }

    #[test]
    fn identical_resubmission_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let kp = KeyPair::generate();
        let store = ReportStore::open(dir.path(), Timeslot(0)).unwrap();
        let r = EquipmentReport::new_signed(1, 0, 5, &kp);
        store.integrate(r, &kp.public_bytes(), Timeslot(0)).unwrap();
        assert_eq!(
            store.integrate(r, &kp.public_bytes(), Timeslot(0)).unwrap(),
            IntegrateOutcome::Idempotent
        );
    }

    #[test]
    fn conflicting_report_bans_the_slot() {
        let dir = tempfile::tempdir().unwrap();
        let kp_a = KeyPair::generate();
        let kp_b = KeyPair::generate();
        let store = ReportStore::open(dir.path(), Timeslot(0)).unwrap();
        let a = EquipmentReport::new_signed(1, 0, 5, &kp_a);
        let b = EquipmentReport::new_signed(1, 0, 9, &kp_b);
        store.integrate(a, &kp_a.public_bytes(), Timeslot(0)).unwrap();
        assert_eq!(store.integrate(b, &kp_b.public_bytes(), Timeslot(0)).unwrap(), IntegrateOutcome::Banned);

        // A further report for the now-banned slot is dropped.
        let c = EquipmentReport::new_signed(1, 0, 3, &kp_a);
        assert_eq!(store.integrate(c, &kp_a.public_bytes(), Timeslot(0)).unwrap(), IntegrateOutcome::Dropped);
    }

    #[test]
    fn out_of_range_timeslot_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let kp = KeyPair::generate();
        let store = ReportStore::open(dir.path(), Timeslot(0)).unwrap();
        let r = EquipmentReport::new_signed(1, 10_000, 5, &kp);
        assert_eq!(store.integrate(r, &kp.public_bytes(), Timeslot(0)).unwrap(), IntegrateOutcome::Dropped);
    }

    #[test]
    fn bad_signature_is_dropped_without_state_change() {
        let dir = tempfile::tempdir().unwrap();
        let kp = KeyPair::generate();
        let other = KeyPair::generate();
        let store = ReportStore::open(dir.path(), Timeslot(0)).unwrap();
        let r = EquipmentReport::new_signed(1, 0, 5, &other);
        assert_eq!(store.integrate(r, &kp.public_bytes(), Timeslot(0)).unwrap(), IntegrateOutcome::Dropped);
    }

    #[test]
    fn ban_survives_restart_via_replay() {
        let dir = tempfile::tempdir().unwrap();
        let kp_a = KeyPair::generate();
        let kp_b = KeyPair::generate();
        {
            let store = ReportStore::open(dir.path(), Timeslot(0)).unwrap();
            let a = EquipmentReport::new_signed(1, 0, 5, &kp_a);
            let b = EquipmentReport::new_signed(1, 0, 9, &kp_b);
            store.integrate(a, &kp_a.public_bytes(), Timeslot(0)).unwrap();
            store.integrate(b, &kp_b.public_bytes(), Timeslot(0)).unwrap();
        }
        let reopened = ReportStore::open(dir.path(), Timeslot(0)).unwrap();
        let recent = reopened.recent();
        // Replay doesn't repopulate `recent` (it's a live-ingest audit
        // ring, not reconstructed state); the ban itself lives in the ring,
        // which this test exercises indirectly via a further integrate.
        let _ = recent;
        let c = EquipmentReport::new_signed(1, 0, 3, &kp_a);
        assert_eq!(
            reopened.integrate(c, &kp_a.public_bytes(), Timeslot(0)).unwrap(),
            IntegrateOutcome::Dropped
        );
    }

    #[test]
    fn rotation_shrinks_the_shared_log_and_leaves_other_devices_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let kp_1 = KeyPair::generate();
        let kp_2 = KeyPair::generate();
        let store = ReportStore::open(dir.path(), Timeslot(0)).unwrap();

        let r1 = EquipmentReport::new_signed(1, 0, 5, &kp_1);
        let r2 = EquipmentReport::new_signed(2, 0, 7, &kp_2);
        store.integrate(r1, &kp_1.public_bytes(), Timeslot(0)).unwrap();
        store.integrate(r2, &kp_2.public_bytes(), Timeslot(0)).unwrap();

        let log_path = store.log_path();
        let before = EquipmentReport::from_bytes(&AppendLog::replay(&log_path, EQUIPMENT_REPORT_WIRE_SIZE).unwrap()[0]).unwrap();
        assert_eq!(before.short_id, 1);

        store.rotate_if_due(1, Timeslot(ROTATION_THRESHOLD_SLOTS)).unwrap();

        let remaining = AppendLog::replay(&log_path, EQUIPMENT_REPORT_WIRE_SIZE).unwrap();
        assert_eq!(remaining.len(), 1);
        let remaining_report = EquipmentReport::from_bytes(&remaining[0]).unwrap();
        assert_eq!(remaining_report.short_id, 2, "device 2's untouched record must survive device 1's rotation");

        let archive_path = dir.path().join("archive").join("1-week-0.dat");
        let archived = AppendLog::replay(&archive_path, EQUIPMENT_REPORT_WIRE_SIZE).unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(EquipmentReport::from_bytes(&archived[0]).unwrap().short_id, 1);

        // The log handle must still be usable for further appends after rotation.
        let r3 = EquipmentReport::new_signed(1, ROTATION_THRESHOLD_SLOTS + 10, 9, &kp_1);
        store.integrate(r3, &kp_1.public_bytes(), Timeslot(ROTATION_THRESHOLD_SLOTS)).unwrap();
        let after_append = AppendLog::replay(&log_path, EQUIPMENT_REPORT_WIRE_SIZE).unwrap();
        assert_eq!(after_append.len(), 2);
    }
}
