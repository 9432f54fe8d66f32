// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Wall-clock phase timing for a query
//!
//! Records when each lifecycle phase began and derives phase durations
//! from the boundaries. Every begin call is first-wins: retried
//! transitions never move a recorded boundary. Wall-clock timestamps are
//! kept for the creation and end of the query; everything in between uses
//! the monotonic clock.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Phase timer for one query
pub struct QueryStateTimer {
    create_time: DateTime<Utc>,
    created: Instant,
    inner: Mutex<TimerInner>,
}

#[derive(Default)]
struct TimerInner {
    queued: Option<Instant>,
    waiting_for_resources: Option<Instant>,
    dispatching: Option<Instant>,
    planning: Option<Instant>,
    starting: Option<Instant>,
    running: Option<Instant>,
    finishing: Option<Instant>,
    analysis_start: Option<Instant>,
    analysis: Option<Duration>,
    end: Option<Instant>,
    end_time: Option<DateTime<Utc>>,
    last_heartbeat: Option<DateTime<Utc>>,
}

impl QueryStateTimer {
    pub fn new() -> Self {
        Self {
            create_time: Utc::now(),
            created: Instant::now(),
            inner: Mutex::new(TimerInner::default()),
        }
    }

    pub fn begin_queued(&self) {
        Self::record(&mut self.inner.lock().queued);
    }

    pub fn begin_waiting_for_resources(&self) {
        Self::record(&mut self.inner.lock().waiting_for_resources);
    }

    pub fn begin_dispatching(&self) {
        Self::record(&mut self.inner.lock().dispatching);
    }

    pub fn begin_planning(&self) {
        Self::record(&mut self.inner.lock().planning);
    }

    pub fn begin_starting(&self) {
        Self::record(&mut self.inner.lock().starting);
    }

    pub fn begin_running(&self) {
        Self::record(&mut self.inner.lock().running);
    }

    pub fn begin_finishing(&self) {
        Self::record(&mut self.inner.lock().finishing);
    }

    pub fn begin_analysis(&self) {
        Self::record(&mut self.inner.lock().analysis_start);
    }

    pub fn end_analysis(&self) {
        let mut inner = self.inner.lock();
        if let (Some(start), None) = (inner.analysis_start, inner.analysis) {
            inner.analysis = Some(start.elapsed());
        }
    }

    /// Record the query's end; first call wins
    pub fn end_query(&self) {
        let mut inner = self.inner.lock();
        if inner.end.is_none() {
            inner.end = Some(Instant::now());
            inner.end_time = Some(Utc::now());
        }
    }

    pub fn record_heartbeat(&self) {
        self.inner.lock().last_heartbeat = Some(Utc::now());
    }

    pub fn create_time_millis(&self) -> i64 {
        self.create_time.timestamp_millis()
    }

    pub fn end_time_millis(&self) -> Option<i64> {
        self.inner.lock().end_time.map(|t| t.timestamp_millis())
    }

    pub fn last_heartbeat_millis(&self) -> i64 {
        self.inner
            .lock()
            .last_heartbeat
            .unwrap_or(self.create_time)
            .timestamp_millis()
    }

    /// Wall-clock instant execution began (dispatching), if it did
    pub fn execution_start_time_millis(&self) -> Option<i64> {
        let inner = self.inner.lock();
        inner.dispatching.map(|start| {
            let offset = start.duration_since(self.created);
            (self.create_time + chrono::Duration::from_std(offset).unwrap_or_default())
                .timestamp_millis()
        })
    }

    pub fn elapsed_time(&self) -> Duration {
        let inner = self.inner.lock();
        self.span(Some(self.created), &[inner.end])
    }

    pub fn waiting_for_prerequisites_time(&self) -> Duration {
        let inner = self.inner.lock();
        self.span(Some(self.created), &[inner.queued, inner.end])
    }

    pub fn queued_time(&self) -> Duration {
        let inner = self.inner.lock();
        self.span(inner.queued, &[inner.waiting_for_resources, inner.dispatching, inner.end])
    }

    pub fn waiting_for_resources_time(&self) -> Duration {
        let inner = self.inner.lock();
        self.span(inner.waiting_for_resources, &[inner.dispatching, inner.end])
    }

    pub fn dispatching_time(&self) -> Duration {
        let inner = self.inner.lock();
        self.span(inner.dispatching, &[inner.planning, inner.starting, inner.end])
    }

    pub fn planning_time(&self) -> Duration {
        let inner = self.inner.lock();
        self.span(inner.planning, &[inner.starting, inner.end])
    }

    pub fn execution_time(&self) -> Duration {
        let inner = self.inner.lock();
        self.span(inner.dispatching, &[inner.end])
    }

    pub fn finishing_time(&self) -> Duration {
        let inner = self.inner.lock();
        self.span(inner.finishing, &[inner.end])
    }

    pub fn analysis_time(&self) -> Duration {
        self.inner.lock().analysis.unwrap_or_default()
    }

    fn record(slot: &mut Option<Instant>) {
        if slot.is_none() {
            *slot = Some(Instant::now());
        }
    }

    /// Duration from `start` to the first recorded boundary in `ends`,
    /// falling back to now; zero when the phase never began
    fn span(&self, start: Option<Instant>, ends: &[Option<Instant>]) -> Duration {
        let Some(start) = start else {
            return Duration::ZERO;
        };
        let end = ends
            .iter()
            .flatten()
            .next()
            .copied()
            .unwrap_or_else(Instant::now);
        end.saturating_duration_since(start)
    }
}

impl Default for QueryStateTimer {
    fn default() -> Self {
        Self::new()
    }
}
