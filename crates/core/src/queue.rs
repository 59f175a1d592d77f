//! Queue entries and the submission-time priority policy.
//!
//! The exact weights are tunable policy, not a correctness contract;
//! tests assert relative ordering only.

use serde::{Deserialize, Serialize};

use crate::config::FlowConfiguration;
use crate::types::{FlowId, Timestamp};

// ---------------------------------------------------------------------------
// Priority policy
// ---------------------------------------------------------------------------

/// Base score every submission starts from.
pub const PRIORITY_BASE: i32 = 50;

/// Bonus for small batches (quick jobs run first).
const BONUS_SMALL_BATCH: i32 = 20;
const BONUS_MEDIUM_BATCH: i32 = 10;

/// Penalty for very large batches.
const PENALTY_LARGE_BATCH: i32 = -10;
const PENALTY_HUGE_BATCH: i32 = -20;

/// Bonus for high quality thresholds (the caller cares about the result).
const BONUS_HIGH_QUALITY: i32 = 10;
const BONUS_ELEVATED_QUALITY: i32 = 5;

/// Bonus when structured-data generation is requested.
const BONUS_STRUCTURED_DATA: i32 = 5;

/// Compute the scheduling priority for a submission. Higher runs first.
///
/// Favors small batches, penalizes very large ones, and nudges up flows
/// with a high quality bar or structured-data output.
pub fn compute_priority(config: &FlowConfiguration) -> i32 {
    let mut score = PRIORITY_BASE;

    score += match config.game_ids.len() {
        0..=2 => BONUS_SMALL_BATCH,
        3..=5 => BONUS_MEDIUM_BATCH,
        6..=20 => 0,
        21..=50 => PENALTY_LARGE_BATCH,
        _ => PENALTY_HUGE_BATCH,
    };

    if config.quality_threshold >= 0.9 {
        score += BONUS_HIGH_QUALITY;
    } else if config.quality_threshold >= 0.8 {
        score += BONUS_ELEVATED_QUALITY;
    }

    if config.enable_structured_data {
        score += BONUS_STRUCTURED_DATA;
    }

    score
}

// ---------------------------------------------------------------------------
// QueueEntry
// ---------------------------------------------------------------------------

/// One pending flow in the scheduler's queue. Entries exist only while
/// waiting; dispatch removes them, so the flow record alone carries the
/// execution status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub flow_id: FlowId,
    /// Higher runs first; ties broken by earliest `enqueued_at`.
    pub priority: i32,
    pub enqueued_at: Timestamp,
    /// How many times this flow re-entered the queue (resume, recovery).
    pub retry_count: u32,
    /// Flow ids that must all be `completed` before this entry runs.
    pub dependencies: Vec<FlowId>,
}

impl QueueEntry {
    pub fn new(flow_id: FlowId, priority: i32, now: Timestamp) -> Self {
        Self {
            flow_id,
            priority,
            enqueued_at: now,
            retry_count: 0,
            dependencies: Vec::new(),
        }
    }
}

/// Sort a queue by descending priority, ties broken by earliest enqueue.
pub fn sort_queue(entries: &mut [QueueEntry]) {
    entries.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.enqueued_at.cmp(&b.enqueued_at))
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn config_with_games(n: usize) -> FlowConfiguration {
        let ids = (0..n).map(|i| format!("g{i}")).collect();
        FlowConfiguration::new("w1", ids)
    }

    // -- compute_priority: relative ordering only -----------------------------

    #[test]
    fn small_batches_beat_large_batches() {
        let small = compute_priority(&config_with_games(2));
        let medium = compute_priority(&config_with_games(10));
        let large = compute_priority(&config_with_games(30));
        let huge = compute_priority(&config_with_games(100));

        assert!(small > medium);
        assert!(medium > large);
        assert!(large > huge);
    }

    #[test]
    fn high_quality_threshold_raises_priority() {
        let mut low = config_with_games(10);
        low.quality_threshold = 0.5;
        let mut high = config_with_games(10);
        high.quality_threshold = 0.95;

        assert!(compute_priority(&high) > compute_priority(&low));
    }

    #[test]
    fn structured_data_raises_priority() {
        let plain = config_with_games(10);
        let mut structured = config_with_games(10);
        structured.enable_structured_data = true;

        assert!(compute_priority(&structured) > compute_priority(&plain));
    }

    // -- sort_queue -----------------------------------------------------------

    #[test]
    fn queue_sorts_by_descending_priority() {
        let now = Utc::now();
        let mut entries = vec![
            QueueEntry::new("low".to_string(), 10, now),
            QueueEntry::new("high".to_string(), 90, now),
            QueueEntry::new("mid".to_string(), 50, now),
        ];
        sort_queue(&mut entries);

        let order: Vec<&str> = entries.iter().map(|e| e.flow_id.as_str()).collect();
        assert_eq!(order, vec!["high", "mid", "low"]);
    }

    #[test]
    fn equal_priority_ties_broken_by_enqueue_time() {
        let now = Utc::now();
        let mut entries = vec![
            QueueEntry::new("later".to_string(), 50, now + Duration::seconds(5)),
            QueueEntry::new("earlier".to_string(), 50, now),
        ];
        sort_queue(&mut entries);

        assert_eq!(entries[0].flow_id, "earlier");
        assert_eq!(entries[1].flow_id, "later");
    }
}
