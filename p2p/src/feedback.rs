//! Per-peer call accounting.
//!
//! Every remote call reports its outcome here. The counters only ever grow; they are read back to compute scores and
//! are periodically written to a snapshot file, one record per peer.

use crate::errors::ScoringFault;
use crate::score::Scorer;
use libp2p::PeerId;
use log::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_SNAPSHOT_FILE: &str = "opt.log";

/// Latency thresholds, checked from the highest down.
const LATENCY_BUCKETS: [(Duration, Outcome); 3] = [
    (Duration::from_millis(3000), Outcome::LatencyOver3000ms),
    (Duration::from_millis(1000), Outcome::LatencyOver1000ms),
    (Duration::from_millis(300), Outcome::LatencyOver300ms),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    Failure,
    LatencyOver300ms,
    LatencyOver1000ms,
    LatencyOver3000ms,
    /// Recorded once for every call, whatever its result.
    CallCompleted,
}

impl Outcome {
    pub const fn slot(self) -> usize {
        match self {
            Outcome::Success => 0,
            Outcome::Failure => 1,
            Outcome::LatencyOver300ms => 2,
            Outcome::LatencyOver1000ms => 3,
            Outcome::LatencyOver3000ms => 4,
            Outcome::CallCompleted => 5,
        }
    }
}

/// The latency slot for a call that took `elapsed`: only the highest threshold exceeded counts.
/// Calls of 300ms or less land in no bucket at all.
pub fn latency_bucket(elapsed: Duration) -> Option<Outcome> {
    LATENCY_BUCKETS.iter().find(|(threshold, _)| elapsed > *threshold).map(|(_, outcome)| *outcome)
}

/// `[success, failure, >300ms, >1000ms, >3000ms, calls]` for one peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterVector([u64; 6]);

impl CounterVector {
    pub fn get(&self, outcome: Outcome) -> u64 {
        self.0[outcome.slot()]
    }

    pub fn success(&self) -> u64 {
        self.get(Outcome::Success)
    }

    pub fn failure(&self) -> u64 {
        self.get(Outcome::Failure)
    }

    pub fn total_calls(&self) -> u64 {
        self.get(Outcome::CallCompleted)
    }

    /// The five slots that take part in scoring, in weight order.
    pub fn scored_slots(&self) -> impl Iterator<Item = u64> + '_ {
        self.0[..5].iter().copied()
    }

    pub fn as_array(&self) -> [u64; 6] {
        self.0
    }

    fn increment(&mut self, outcome: Outcome) {
        let slot = &mut self.0[outcome.slot()];
        *slot = slot.saturating_add(1);
    }
}

impl From<[u64; 6]> for CounterVector {
    fn from(values: [u64; 6]) -> Self {
        CounterVector(values)
    }
}

/// The process-wide table of counters, guarded by a single lock.
///
/// Every method takes the lock for exactly one block and never across an await point or any I/O.
#[derive(Default)]
pub struct PeerCounterTable {
    rows: Mutex<HashMap<PeerId, CounterVector>>,
}

impl PeerCounterTable {
    pub fn increment(&self, peer: &PeerId, outcome: Outcome) {
        let mut rows = self.rows.lock();
        rows.entry(*peer).or_default().increment(outcome);
    }

    pub fn get(&self, peer: &PeerId) -> Option<CounterVector> {
        self.rows.lock().get(peer).copied()
    }

    /// A consistent copy of the whole table.
    pub fn snapshot(&self) -> Vec<(PeerId, CounterVector)> {
        let rows = self.rows.lock();
        rows.iter().map(|(peer, counters)| (*peer, *counters)).collect()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receives call outcomes and answers score queries. Cheap to clone.
#[derive(Clone)]
pub struct FeedbackCollector {
    table: Arc<PeerCounterTable>,
    scorer: Scorer,
}

impl FeedbackCollector {
    pub fn new(scorer: Scorer) -> Self {
        Self { table: Arc::new(PeerCounterTable::default()), scorer }
    }

    pub fn table(&self) -> &PeerCounterTable {
        &self.table
    }

    /// Bump a single counter for `peer`, creating the peer's row if this is the first report.
    pub fn feedback(&self, peer: &PeerId, outcome: Outcome) {
        trace!("Feedback for {peer}: {outcome:?}");
        self.table.increment(peer, outcome);
    }

    /// Record one finished call: its status, its latency bucket (if any) and the call itself.
    pub fn record_call(&self, peer: &PeerId, succeeded: bool, elapsed: Duration) {
        self.feedback(peer, if succeeded { Outcome::Success } else { Outcome::Failure });
        if let Some(bucket) = latency_bucket(elapsed) {
            self.feedback(peer, bucket);
        }
        self.feedback(peer, Outcome::CallCompleted);
    }

    pub fn counters(&self, peer: &PeerId) -> Option<CounterVector> {
        self.table.get(peer)
    }

    pub fn snapshot(&self) -> Vec<SnapshotRecord> {
        let mut records: Vec<SnapshotRecord> =
            self.table.snapshot().into_iter().map(|(peer, counters)| SnapshotRecord { peer, counters }).collect();
        records.sort_by_key(|r| r.peer.to_base58());
        records
    }

    /// The score of a known peer. `None` if the peer has never been reported.
    pub fn score(&self, peer: &PeerId) -> Option<Result<i64, ScoringFault>> {
        self.counters(peer).map(|counters| self.scorer.score(&counters))
    }

    pub fn scores(&self) -> Vec<(PeerId, Result<i64, ScoringFault>)> {
        self.table.snapshot().into_iter().map(|(peer, counters)| (peer, self.scorer.score(&counters))).collect()
    }

    pub fn scorer(&self) -> &Scorer {
        &self.scorer
    }
}

impl Default for FeedbackCollector {
    fn default() -> Self {
        Self::new(Scorer::default())
    }
}

/// One line of the snapshot file: `peer,success,failure,over300,over1000,over3000`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub peer: PeerId,
    pub counters: CounterVector,
}

impl SnapshotRecord {
    pub fn parse_line(line: &str) -> Result<Self, SnapshotParseError> {
        line.parse()
    }
}

impl Display for SnapshotRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let c = self.counters.as_array();
        write!(f, "{},{},{},{},{},{}", self.peer, c[0], c[1], c[2], c[3], c[4])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotParseError {
    #[error("Expected 6 comma-separated fields, found {0}.")]
    FieldCount(usize),
    #[error("Invalid peer id '{0}'.")]
    PeerId(String),
    #[error("Invalid counter '{0}'.")]
    Counter(String),
}

impl FromStr for SnapshotRecord {
    type Err = SnapshotParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = line.trim().split(',').collect();
        if fields.len() != 6 {
            return Err(SnapshotParseError::FieldCount(fields.len()));
        }
        let peer = fields[0].parse().map_err(|_| SnapshotParseError::PeerId(fields[0].to_string()))?;
        let mut values = [0u64; 6];
        for (slot, field) in values.iter_mut().zip(&fields[1..]) {
            *slot = field.parse().map_err(|_| SnapshotParseError::Counter(field.to_string()))?;
        }
        Ok(SnapshotRecord { peer, counters: CounterVector(values) })
    }
}

/// The default snapshot location: `opt.log` beside the running executable.
pub fn default_snapshot_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(DEFAULT_SNAPSHOT_FILE)))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SNAPSHOT_FILE))
}

fn render_snapshot(records: &[SnapshotRecord]) -> String {
    records.iter().map(|r| format!("{r}\n")).collect()
}

/// Rewrites `path` with the current counters. The table lock is only held while copying.
pub async fn write_snapshot(collector: &FeedbackCollector, path: &std::path::Path) -> std::io::Result<usize> {
    let records = collector.snapshot();
    tokio::fs::write(path, render_snapshot(&records)).await?;
    Ok(records.len())
}

/// Periodically rewrites the snapshot file until `shutdown` fires.
pub fn spawn_snapshot_task(
    collector: FeedbackCollector,
    path: PathBuf,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match write_snapshot(&collector, &path).await {
                Ok(n) => trace!("Wrote {n} peer records to {}", path.display()),
                Err(err) => warn!("Could not write counter snapshot to {}: {err}", path.display()),
            }
        }
        debug!("Snapshot task stopped");
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;

    fn peer() -> PeerId {
        libp2p::identity::Keypair::generate_ed25519().public().to_peer_id()
    }

    #[test]
    fn latency_classification_uses_highest_bucket() {
        assert_eq!(latency_bucket(Duration::from_millis(250)), None);
        assert_eq!(latency_bucket(Duration::from_millis(300)), None);
        assert_eq!(latency_bucket(Duration::from_millis(301)), Some(Outcome::LatencyOver300ms));
        assert_eq!(latency_bucket(Duration::from_millis(1500)), Some(Outcome::LatencyOver1000ms));
        assert_eq!(latency_bucket(Duration::from_millis(3500)), Some(Outcome::LatencyOver3000ms));
    }

    #[test]
    fn slow_call_only_counts_in_its_own_bucket() {
        let collector = FeedbackCollector::default();
        let p = peer();
        collector.record_call(&p, true, Duration::from_millis(3500));
        let c = collector.counters(&p).unwrap();
        assert_eq!(c.as_array(), [1, 0, 0, 0, 1, 1]);

        collector.record_call(&p, false, Duration::from_millis(250));
        let c = collector.counters(&p).unwrap();
        assert_eq!(c.as_array(), [1, 1, 0, 0, 1, 2]);
    }

    #[test]
    fn counters_only_grow() {
        let collector = FeedbackCollector::default();
        let p = peer();
        let mut previous = CounterVector::default();
        for i in 0..50u64 {
            collector.record_call(&p, i % 3 != 0, Duration::from_millis(i * 97));
            let now = collector.counters(&p).unwrap();
            for (before, after) in previous.as_array().iter().zip(now.as_array()) {
                assert!(after >= *before);
            }
            previous = now;
        }
        assert_eq!(previous.total_calls(), 50);
        assert_eq!(previous.success() + previous.failure(), 50);
    }

    #[test]
    fn unknown_peer_has_no_score() {
        let collector = FeedbackCollector::default();
        assert!(collector.score(&peer()).is_none());
        let p = peer();
        collector.feedback(&p, Outcome::Success);
        assert_eq!(collector.score(&p), Some(Ok(50)));
    }

    #[test]
    fn snapshot_records_round_trip_through_text() {
        let record = SnapshotRecord { peer: peer(), counters: CounterVector([10, 2, 1, 0, 0, 13]) };
        let line = record.to_string();
        assert_eq!(line.split(',').count(), 6);
        let parsed = SnapshotRecord::parse_line(&line).unwrap();
        assert_eq!(parsed.peer, record.peer);
        // The call count is not part of the record.
        assert_eq!(parsed.counters.as_array()[..5], record.counters.as_array()[..5]);
        assert_eq!(SnapshotRecord::parse_line("abc,1,2"), Err(SnapshotParseError::FieldCount(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn lock_is_released_between_snapshot_cycles() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("opt.log");
        let collector = FeedbackCollector::default();
        let shutdown = CancellationToken::new();
        let interval = Duration::from_secs(60);
        let task = spawn_snapshot_task(collector.clone(), path.clone(), interval, shutdown.clone());
        let (a, b) = (peer(), peer());

        for cycle in 1..=3u64 {
            let writers: Vec<_> = [a, b]
                .into_iter()
                .map(|p| {
                    let collector = collector.clone();
                    tokio::spawn(async move { collector.record_call(&p, true, Duration::ZERO) })
                })
                .collect();
            for w in writers {
                w.await.unwrap();
            }
            tokio::time::sleep(interval + Duration::from_millis(1)).await;
            // Real file I/O runs on the blocking pool; give it a moment.
            let mut contents = String::new();
            for _ in 0..100 {
                contents = std::fs::read_to_string(&path).unwrap_or_default();
                if contents.lines().count() == 2 && contents.contains(&format!(",{cycle},0,0,0,0")) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
                tokio::task::yield_now().await;
            }
            assert_eq!(contents.lines().count(), 2, "file is rewritten, not appended");
            assert_eq!(collector.counters(&a).unwrap().success(), cycle);
            assert_eq!(collector.counters(&b).unwrap().success(), cycle);
        }
        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn write_snapshot_truncates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("opt.log");
        std::fs::write(&path, "stale\nstale\nstale\n").unwrap();
        let collector = FeedbackCollector::default();
        let p = peer();
        collector.record_call(&p, false, Duration::from_millis(1200));
        assert_eq!(write_snapshot(&collector, &path).await.unwrap(), 1);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, format!("{p},0,1,0,1,0\n"));
    }
}
