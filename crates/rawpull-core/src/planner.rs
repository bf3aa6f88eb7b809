//! Turns "pull the last N days" into a resumable sequence of `[since, until)` windows.
//!
//! The planner is pure: it only reads and mutates a [`SyncState`] and never performs I/O.
//! The watermark (`current_slice_date`), `completed_slices`, and `record_count` only ever move
//! forward.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::state::SyncState;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlannerError {
    #[error("empty time window: since {since} is not before until {until}")]
    EmptyWindow {
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    },
    #[error("no pending slice to complete")]
    NoPendingSlice,
}

/// Half-open interval `[since, until)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeWindow {
    since: DateTime<Utc>,
    until: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(since: DateTime<Utc>, until: DateTime<Utc>) -> Result<Self, PlannerError> {
        if since >= until {
            return Err(PlannerError::EmptyWindow { since, until });
        }
        Ok(Self { since, until })
    }

    pub fn since(&self) -> DateTime<Utc> {
        self.since
    }

    pub fn until(&self) -> DateTime<Utc> {
        self.until
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.since && ts < self.until
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlicePlanner {
    overlap_days: i64,
}

impl SlicePlanner {
    pub fn new(overlap_days: i64) -> Self {
        Self {
            overlap_days: overlap_days.max(0),
        }
    }

    pub fn overlap_days(&self) -> i64 {
        self.overlap_days
    }

    /// Plans a round of slices when none is pending. Returns `true` when a new round was planned.
    ///
    /// A range with pending slices is left untouched so an interrupted round resumes where it
    /// stopped.
    pub fn init_if_needed(&self, state: &mut SyncState, now: DateTime<Utc>) -> bool {
        if !state.range_is_set() {
            let start = if state.is_initial_sync {
                now - Duration::days(state.initial_days.max(0))
            } else {
                state
                    .last_completed_date
                    .or(state.last_sync_time)
                    .unwrap_or_else(|| now - Duration::days(state.recent_sync_days.max(0)))
            };
            plan_round(state, start, now);
            return true;
        }

        if self.all_complete(state) {
            let Some(start) = state.last_completed_date.or(state.sync_end_date) else {
                return false;
            };
            if now > start {
                plan_round(state, start, now);
                return true;
            }
        }

        false
    }

    pub fn next_window(&self, state: &SyncState) -> Option<TimeWindow> {
        let (current, end) = (state.current_slice_date?, state.sync_end_date?);
        if current >= end {
            return None;
        }
        let until = (current + slice_length(state)).min(end);
        let mut since = current;
        if self.overlap_days > 0 && !state.is_initial_sync && state.sync_start_date == Some(current)
        {
            since = current - Duration::days(self.overlap_days);
        }
        TimeWindow::new(since, until).ok()
    }

    /// Records a committed slice and advances the watermark to the window's upper bound.
    pub fn complete_slice(
        &self,
        state: &mut SyncState,
        rows_added: usize,
    ) -> Result<DateTime<Utc>, PlannerError> {
        let window = self.next_window(state).ok_or(PlannerError::NoPendingSlice)?;
        let advanced = window.until();

        state.current_slice_date = Some(advanced);
        state.completed_slices += 1;
        state.record_count = state
            .record_count
            .saturating_add(i64::try_from(rows_added).unwrap_or(i64::MAX));
        state.last_sync_time = Some(advanced);

        if let Some(end) = state.sync_end_date {
            if advanced >= end {
                state.is_initial_sync = false;
                state.last_completed_date = Some(end);
            }
        }
        Ok(advanced)
    }

    pub fn progress(&self, state: &SyncState) -> f64 {
        let done = state.completed_slices.max(0) as f64;
        let total = state.total_slices.max(1) as f64;
        (done / total).min(1.0)
    }

    pub fn all_complete(&self, state: &SyncState) -> bool {
        match (state.current_slice_date, state.sync_end_date) {
            (Some(current), Some(end)) => state.range_is_set() && current >= end,
            _ => false,
        }
    }
}

fn slice_length(state: &SyncState) -> Duration {
    Duration::days(state.slice_days.max(1))
}

fn plan_round(state: &mut SyncState, start: DateTime<Utc>, now: DateTime<Utc>) {
    let end = now.max(start);
    state.sync_start_date = Some(start);
    state.sync_end_date = Some(end);
    state.current_slice_date = Some(start);
    state.total_slices = state.completed_slices + slices_between(start, end, slice_length(state));
}

fn slices_between(start: DateTime<Utc>, end: DateTime<Utc>, slice: Duration) -> i64 {
    let span = end - start;
    let mut millis = span.num_milliseconds();
    if start + Duration::milliseconds(millis) < end {
        millis += 1;
    }
    if millis <= 0 {
        return 0;
    }
    let slice_millis = slice.num_milliseconds().max(1);
    (millis + slice_millis - 1) / slice_millis
}
