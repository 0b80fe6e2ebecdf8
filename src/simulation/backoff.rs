//! Backoff engine shared by WiFi stations and NR-U gNBs.
//!
//! A countdown is drawn in slots from a binary-exponential contention window and is always armed
//! together with a fixed offset (DIFS for WiFi, the prioritization period for NR-U). When the
//! medium turns busy mid-wait only whole slots counted after the offset are credited; the offset
//! has to be waited again before the countdown resumes.

use super::rng::SimRng;
use super::types::Micros;

/// Upper bound of the contention window after `failures` consecutive failures:
/// `min(2^failures * (cw_min + 1) - 1, cw_max)`.
pub fn contention_window_upper(failures: u32, cw_min: u32, cw_max: u32) -> u32 {
    let window = if failures >= 32 { u64::MAX } else { (cw_min as u64 + 1) << failures };
    (window - 1).min(cw_max as u64) as u32
}

/// Draws a backoff value in slots, uniformly from `[0, contention_window_upper(..)]`.
pub fn draw_backoff(rng: &SimRng, failures: u32, cw_min: u32, cw_max: u32) -> u32 {
    let upper = contention_window_upper(failures, cw_min, cw_max);
    rng.range_inclusive(0, upper as u64) as u32
}

/// Time removed from an armed countdown (offset included) when it is interrupted after `elapsed`.
///
/// An interruption inside the offset removes exactly the offset. Later interruptions also remove
/// every whole slot counted since the offset ended; a partially counted slot is lost.
pub fn credited_on_interrupt(elapsed: Micros, fixed_offset: Micros, slot: Micros) -> Micros {
    if elapsed <= fixed_offset {
        return fixed_offset;
    }
    let whole_slots = (elapsed - fixed_offset) / slot;
    whole_slots * slot + fixed_offset
}

/// Remaining slot countdown of one backoff episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffCountdown {
    remaining: Micros,
    fixed_offset: Micros,
    slot: Micros,
}

impl BackoffCountdown {
    pub fn new(slots: u32, slot: Micros, fixed_offset: Micros) -> Self {
        Self { remaining: slots as Micros * slot, fixed_offset, slot }
    }

    /// Slot countdown still to be counted, without the offset.
    pub fn remaining(&self) -> Micros {
        self.remaining
    }

    /// Duration of the next wait: offset plus the remaining slots.
    pub fn armed(&self) -> Micros {
        self.remaining + self.fixed_offset
    }

    /// Applies an interruption after `elapsed` of the armed wait and returns the slot time credited.
    pub fn interrupt(&mut self, elapsed: Micros) -> Micros {
        let charged = credited_on_interrupt(elapsed, self.fixed_offset, self.slot).min(self.armed());
        let credited = charged.saturating_sub(self.fixed_offset);
        self.remaining -= credited;
        credited
    }
}

/// Retransmission bookkeeping of the frame currently being sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    /// Failed attempts of the current frame.
    pub retransmissions: u32,
    /// Consecutive failures, driving the contention window.
    pub failures_in_row: u32,
}

impl RetryState {
    pub fn on_success(&mut self) {
        *self = Self::default();
    }

    /// Counts a failed attempt. Returns true when the frame exceeded `retry_limit` and was dropped,
    /// which also resets the failure streak.
    pub fn on_failure(&mut self, retry_limit: u32) -> bool {
        self.retransmissions += 1;
        self.failures_in_row += 1;
        if self.retransmissions > retry_limit {
            *self = Self::default();
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_doubles_until_cw_max() {
        assert_eq!(contention_window_upper(0, 15, 63), 15);
        assert_eq!(contention_window_upper(1, 15, 63), 31);
        assert_eq!(contention_window_upper(2, 15, 63), 63);
        assert_eq!(contention_window_upper(3, 15, 63), 63);
        assert_eq!(contention_window_upper(200, 15, 1023), 1023);
    }

    #[test]
    fn draws_respect_window() {
        let rng = SimRng::seed_from_u64(3);
        for failures in 0..6 {
            for _ in 0..200 {
                assert!(draw_backoff(&rng, failures, 15, 63) <= contention_window_upper(failures, 15, 63));
            }
        }
        assert_eq!(draw_backoff(&rng, 0, 0, 0), 0);
    }

    #[test]
    fn interruption_inside_offset_credits_no_slot() {
        assert_eq!(credited_on_interrupt(0, 34, 9), 34);
        assert_eq!(credited_on_interrupt(34, 34, 9), 34);
        let mut countdown = BackoffCountdown::new(10, 9, 34);
        assert_eq!(countdown.interrupt(20), 0);
        assert_eq!(countdown.remaining(), 90);
        assert_eq!(countdown.armed(), 124);
    }

    #[test]
    fn partial_slots_are_not_credited() {
        // 34 µs DIFS + 2 whole slots + 5 µs of the third slot.
        assert_eq!(credited_on_interrupt(34 + 18 + 5, 34, 9), 34 + 18);
        let mut countdown = BackoffCountdown::new(10, 9, 34);
        assert_eq!(countdown.interrupt(34 + 18 + 5), 18);
        assert_eq!(countdown.remaining(), 72);
    }

    #[test]
    fn interruption_at_completion_drains_countdown() {
        let mut countdown = BackoffCountdown::new(4, 9, 43);
        assert_eq!(countdown.interrupt(countdown.armed()), 36);
        assert_eq!(countdown.remaining(), 0);
        assert_eq!(countdown.armed(), 43);
    }

    #[test]
    fn repeated_interruptions_never_exceed_drawn_countdown() {
        let rng = SimRng::seed_from_u64(99);
        for (slot, offset) in [(9, 34), (9, 43), (9, 0)] {
            for _ in 0..300 {
                let slots = draw_backoff(&rng, 3, 15, 1023);
                let drawn = slots as Micros * slot;
                let mut countdown = BackoffCountdown::new(slots, slot, offset);
                let mut total_credited = 0;
                while countdown.remaining() > 0 {
                    let armed = countdown.armed();
                    let elapsed = rng.range_inclusive(0, armed);
                    let credited = countdown.interrupt(elapsed);
                    assert!(credited + offset <= armed);
                    total_credited += credited;
                    if elapsed == armed {
                        break;
                    }
                }
                assert!(total_credited <= drawn);
                assert_eq!(total_credited + countdown.remaining(), drawn);
            }
        }
    }

    #[test]
    fn frame_dropped_after_retry_limit() {
        let mut retry = RetryState::default();
        for attempt in 1..=7 {
            assert!(!retry.on_failure(7));
            assert_eq!(retry.failures_in_row, attempt);
        }
        assert!(retry.on_failure(7));
        assert_eq!(retry, RetryState::default());
    }

    #[test]
    fn success_resets_streak() {
        let mut retry = RetryState::default();
        retry.on_failure(7);
        retry.on_failure(7);
        retry.on_success();
        assert_eq!(retry.failures_in_row, 0);
        assert_eq!(retry.retransmissions, 0);
    }
}
