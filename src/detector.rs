//! Change detection over attendance snapshots.
//!
//! A refresh signal from the realtime channel carries no payload; the
//! authoritative event list is always a full re-fetched snapshot. The
//! detector diffs that snapshot against the stored fingerprint set to decide
//! which events are genuinely new.

use crate::types::{AccessResult, AttendanceEvent, Fingerprint};
use chrono::NaiveDate;
use std::collections::HashSet;

/// Result of comparing one snapshot against the stored fingerprints.
#[derive(Clone, Debug)]
pub struct ChangeSet {
    /// Snapshot events whose fingerprint was not previously stored.
    pub new_events: Vec<AttendanceEvent>,
    /// Stored fingerprints absent from the snapshot. Signals possible
    /// upstream data loss or a shortened result window; reported, not an
    /// error.
    pub missing: Vec<Fingerprint>,
    /// Number of events in the snapshot.
    pub total_current: usize,
    /// Fingerprints of the whole snapshot, the store's replacement set.
    pub snapshot_fingerprints: HashSet<Fingerprint>,
}

impl ChangeSet {
    pub fn changed(&self) -> bool {
        !self.new_events.is_empty() || !self.missing.is_empty()
    }
}

/// Diff a snapshot against previously-seen fingerprints.
///
/// Pure: the same snapshot and store always produce the same result. New
/// events keep their snapshot order; missing fingerprints are sorted so the
/// output does not depend on set iteration order.
pub fn detect(snapshot: &[AttendanceEvent], known: &HashSet<Fingerprint>) -> ChangeSet {
    let snapshot_fingerprints: HashSet<Fingerprint> =
        snapshot.iter().map(|e| e.fingerprint()).collect();

    let new_events: Vec<AttendanceEvent> = snapshot
        .iter()
        .filter(|e| !known.contains(&e.fingerprint()))
        .cloned()
        .collect();

    let mut missing: Vec<Fingerprint> = known
        .iter()
        .filter(|fp| !snapshot_fingerprints.contains(fp))
        .copied()
        .collect();
    missing.sort();

    ChangeSet {
        new_events,
        missing,
        total_current: snapshot.len(),
        snapshot_fingerprints,
    }
}

/// Summary of one employee's scans for a single day.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DayAnalysis {
    pub scans: usize,
    pub denied: usize,
    /// Scans pair up as entry/exit; an odd count suggests a missing exit.
    pub complete: bool,
}

/// Summarize one employee's activity on `day` from a snapshot.
pub fn analyze_day(snapshot: &[AttendanceEvent], employee_id: &str, day: NaiveDate) -> DayAnalysis {
    let mine: Vec<&AttendanceEvent> = snapshot
        .iter()
        .filter(|e| e.employee_id.trim() == employee_id.trim())
        .filter(|e| e.timestamp.date_naive() == day)
        .collect();

    let denied = mine
        .iter()
        .filter(|e| e.result == AccessResult::Denied)
        .count();

    DayAnalysis {
        scans: mine.len(),
        denied,
        complete: !mine.is_empty() && mine.len() % 2 == 0,
    }
}
