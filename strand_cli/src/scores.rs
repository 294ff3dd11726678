use crate::error::CliError;
use std::path::Path;
use strand_p2p::{ScoringFault, Scorer, SnapshotRecord};

/// A peer's snapshot record and its score under some scorer.
pub struct ScoredPeer {
    pub record: SnapshotRecord,
    pub score: Result<i64, ScoringFault>,
}

/// Parses a snapshot file. Blank lines are ignored.
pub fn parse_snapshot(contents: &str) -> Result<Vec<SnapshotRecord>, CliError> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            SnapshotRecord::parse_line(line).map_err(|e| CliError::InvalidSnapshot { line: i + 1, reason: e.to_string() })
        })
        .collect()
}

/// Reads a snapshot file and scores every peer in it, best first.
pub fn read_scores<P: AsRef<Path>>(path: P, scorer: &Scorer) -> Result<Vec<ScoredPeer>, CliError> {
    let contents = std::fs::read_to_string(path)?;
    let mut peers: Vec<ScoredPeer> = parse_snapshot(&contents)?
        .into_iter()
        .map(|record| {
            let score = scorer.score(&record.counters);
            ScoredPeer { record, score }
        })
        .collect();
    // Unscored peers sort last.
    peers.sort_by_key(|p| std::cmp::Reverse(p.score.as_ref().ok().copied()));
    Ok(peers)
}

pub fn format_score(score: &Result<i64, ScoringFault>) -> String {
    match score {
        Ok(score) => score.to_string(),
        Err(fault) => format!("unscored ({fault})"),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use strand_p2p::{HostIdentity, ScoreWeights};

    #[test]
    fn scores_are_sorted_best_first() {
        let a = HostIdentity::random().peer_id();
        let b = HostIdentity::random().peer_id();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opt.log");
        std::fs::write(&path, format!("{a},1,5,0,0,0\n\n{b},10,2,1,0,0\n")).unwrap();

        let peers = read_scores(&path, &Scorer::default()).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].record.peer, b);
        assert_eq!(peers[0].score, Ok(445));
        assert_eq!(peers[1].score, Ok(50 - 125));
    }

    #[test]
    fn overflowing_scores_are_reported_as_unscored() {
        let a = HostIdentity::random().peer_id();
        let scorer = Scorer::from(ScoreWeights([i64::MAX, 0, 0, 0, 0]));
        let peers = parse_snapshot(&format!("{a},2,0,0,0,0")).unwrap();
        let score = scorer.score(&peers[0].counters);
        assert_eq!(score, Err(ScoringFault::Overflow));
        assert!(format_score(&score).starts_with("unscored"));
    }

    #[test]
    fn bad_lines_name_their_line_number() {
        let err = parse_snapshot("\nnot,a,record").unwrap_err();
        assert!(matches!(err, CliError::InvalidSnapshot { line: 2, .. }));
    }
}
