// src/loop_scheduler.rs
//
// Deterministic cadences for control ticks and normalizer checkpoints.

use crate::types::TimestampMs;

#[derive(Debug, Clone)]
pub struct LoopScheduler {
    base_ms: TimestampMs,
    control_interval_ms: i64,
    /// `None` disables checkpoints.
    checkpoint_interval_ms: Option<i64>,
    next_control_ms: TimestampMs,
    next_checkpoint_ms: TimestampMs,
}

impl LoopScheduler {
    /// The first control tick is due at `base_ms`; the first checkpoint one
    /// checkpoint interval later. A checkpoint interval of 0 disables them.
    pub fn new(base_ms: TimestampMs, control_interval_ms: i64, checkpoint_interval_ms: i64) -> Self {
        let control = control_interval_ms.max(1);
        let checkpoint = (checkpoint_interval_ms > 0).then_some(checkpoint_interval_ms);
        Self {
            base_ms,
            control_interval_ms: control,
            checkpoint_interval_ms: checkpoint,
            next_control_ms: base_ms,
            next_checkpoint_ms: base_ms + checkpoint.unwrap_or(0),
        }
    }

    pub fn control_interval_ms(&self) -> i64 {
        self.control_interval_ms
    }

    pub fn next_control_ms(&self) -> TimestampMs {
        self.next_control_ms
    }

    /// Scheduled time of the tick being started; moves to the next slot.
    pub fn advance_control(&mut self) -> TimestampMs {
        let now_ms = self.next_control_ms;
        self.next_control_ms += self.control_interval_ms;
        now_ms
    }

    /// Index of the control slot nearest `now_ms`, counting the first tick
    /// as slot 0. Rounds so clock jitter under half an interval keeps a tick
    /// in its own slot.
    pub fn slot_at(&self, now_ms: TimestampMs) -> u64 {
        let offset = (now_ms - self.base_ms).max(0);
        ((offset + self.control_interval_ms / 2) / self.control_interval_ms) as u64
    }

    /// Skip slots already in the past (a tick overran its interval).
    /// Returns the number of slots skipped.
    pub fn catch_up(&mut self, now_ms: TimestampMs) -> u64 {
        let mut skipped = 0;
        while self.next_control_ms < now_ms {
            self.next_control_ms += self.control_interval_ms;
            skipped += 1;
        }
        skipped
    }

    pub fn checkpoint_due(&self, now_ms: TimestampMs) -> bool {
        self.checkpoint_interval_ms.is_some() && now_ms >= self.next_checkpoint_ms
    }

    pub fn mark_checkpoint_ran(&mut self) {
        if let Some(interval) = self.checkpoint_interval_ms {
            self.next_checkpoint_ms += interval;
        }
    }
}
