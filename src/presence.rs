//! Debounced presence signal and visit accounting.
//!
//! The detector's per-frame box count flickers: people are missed for a frame
//! or two, and overlapping boxes double up. `PresenceTracker` turns that raw
//! count into a smoothed count with a grace window of `grace_frames` empty
//! frames, counts visits on rising edges of the smoothed signal, and reports
//! a visit's duration on the falling edge when its whole seconds exceed
//! those of `min_visit`.

use serde::Deserialize;
use std::time::{Duration, Instant};

/// Empty frames tolerated before a visit is considered over.
pub const DEFAULT_GRACE_FRAMES: u32 = 35;

/// A visit produces a `VisitDuration` event only when its whole seconds
/// exceed this.
pub const DEFAULT_MIN_VISIT: Duration = Duration::from_secs(2);

/// How `total_visits` grows when the smoothed count rises.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisitCounting {
    /// One visit per 0 → non-zero transition, however many boxes appear.
    #[default]
    Episodes,
    /// Every increase of the smoothed count adds its delta, including
    /// increases while someone is already present.
    Occupants,
}

impl std::str::FromStr for VisitCounting {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "episodes" => Ok(VisitCounting::Episodes),
            "occupants" => Ok(VisitCounting::Occupants),
            other => Err(format!(
                "unknown visit counting '{}' (expected episodes or occupants)",
                other
            )),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrackerConfig {
    pub grace_frames: u32,
    pub min_visit: Duration,
    pub visit_counting: VisitCounting,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            grace_frames: DEFAULT_GRACE_FRAMES,
            min_visit: DEFAULT_MIN_VISIT,
            visit_counting: VisitCounting::Episodes,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresenceEvent {
    /// Smoothed count for the frame. Emitted every frame.
    CurrentCount(u32),
    /// New running total of visits.
    TotalVisitsChanged(u64),
    /// Length of a finished visit, in whole seconds.
    VisitDuration(u64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresenceState {
    Absent,
    Present,
    /// Nobody detected, but the grace window keeps the visit open.
    Grace,
}

/// Tracker state carried from frame to frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OccupancyState {
    pub raw_count: u32,
    pub hysteresis_remaining: u32,
    pub smoothed_count: u32,
    pub previous_smoothed_count: u32,
    pub visit_start: Option<Instant>,
    pub total_visits: u64,
}

impl OccupancyState {
    pub fn presence(&self) -> PresenceState {
        if self.smoothed_count == 0 {
            PresenceState::Absent
        } else if self.raw_count > 0 {
            PresenceState::Present
        } else {
            PresenceState::Grace
        }
    }
}

#[derive(Clone, Debug)]
pub struct PresenceTracker {
    config: TrackerConfig,
    state: OccupancyState,
}

impl PresenceTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            state: OccupancyState::default(),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn state(&self) -> &OccupancyState {
        &self.state
    }

    pub fn reset(&mut self) {
        self.state = OccupancyState::default();
    }

    /// Advance one frame. `raw_count` is the number of boxes above the
    /// confidence threshold; `at` is the frame's capture time.
    ///
    /// Events come out in the order total, duration, count.
    pub fn step(&mut self, raw_count: u32, at: Instant) -> Vec<PresenceEvent> {
        let state = &mut self.state;
        state.raw_count = raw_count;

        if raw_count > 0 {
            state.smoothed_count = raw_count;
            state.hysteresis_remaining = self.config.grace_frames;
        } else if state.hysteresis_remaining > 0 {
            state.smoothed_count = 1;
            state.hysteresis_remaining -= 1;
        } else {
            state.smoothed_count = 0;
        }

        let mut events = Vec::with_capacity(3);
        let (previous, current) = (state.previous_smoothed_count, state.smoothed_count);

        if previous == 0 && current > 0 {
            state.visit_start = Some(at);
            state.total_visits += match self.config.visit_counting {
                VisitCounting::Episodes => 1,
                VisitCounting::Occupants => u64::from(current),
            };
            events.push(PresenceEvent::TotalVisitsChanged(state.total_visits));
        } else if previous > 0
            && current > previous
            && self.config.visit_counting == VisitCounting::Occupants
        {
            state.total_visits += u64::from(current - previous);
            events.push(PresenceEvent::TotalVisitsChanged(state.total_visits));
        }

        if previous > 0 && current == 0 {
            if let Some(start) = state.visit_start {
                let elapsed = at.saturating_duration_since(start);
                if elapsed.as_secs() > self.config.min_visit.as_secs() {
                    events.push(PresenceEvent::VisitDuration(elapsed.as_secs()));
                    state.visit_start = None;
                } else {
                    log::debug!("visit of {:?} below minimum, not reported", elapsed);
                }
            }
        }

        events.push(PresenceEvent::CurrentCount(current));
        state.previous_smoothed_count = current;
        events
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: Duration = Duration::from_millis(100);

    fn tracker(grace_frames: u32, min_visit: Duration) -> PresenceTracker {
        PresenceTracker::new(TrackerConfig {
            grace_frames,
            min_visit,
            visit_counting: VisitCounting::Episodes,
        })
    }

    /// Run `counts` at 10 fps from `origin`; returns (smoothed, events).
    fn run(
        tracker: &mut PresenceTracker,
        origin: Instant,
        counts: &[u32],
    ) -> (Vec<u32>, Vec<PresenceEvent>) {
        let mut smoothed = Vec::new();
        let mut events = Vec::new();
        for (i, &count) in counts.iter().enumerate() {
            events.extend(tracker.step(count, origin + FRAME * i as u32));
            smoothed.push(tracker.state().smoothed_count);
        }
        (smoothed, events)
    }

    fn totals(events: &[PresenceEvent]) -> Vec<u64> {
        events
            .iter()
            .filter_map(|e| match e {
                PresenceEvent::TotalVisitsChanged(t) => Some(*t),
                _ => None,
            })
            .collect()
    }

    fn durations(events: &[PresenceEvent]) -> Vec<u64> {
        events
            .iter()
            .filter_map(|e| match e {
                PresenceEvent::VisitDuration(d) => Some(*d),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn grace_window_scenario() {
        let mut t = tracker(3, Duration::ZERO);
        let counts = [1, 1, 0, 1, 1, 0, 0, 0, 0, 0, 0];
        let (smoothed, events) = run(&mut t, Instant::now(), &counts);
        assert_eq!(smoothed, vec![1, 1, 1, 1, 1, 1, 1, 1, 0, 0, 0]);
        assert_eq!(totals(&events), vec![1]);
        // 0.8 s is under one whole second.
        assert!(durations(&events).is_empty());
    }

    #[test]
    fn returns_to_zero_only_after_full_grace_window() {
        for grace in 0..6u32 {
            let mut t = tracker(grace, Duration::ZERO);
            let mut counts = vec![2, 3];
            counts.extend(std::iter::repeat(0).take(grace as usize + 3));
            let (smoothed, _) = run(&mut t, Instant::now(), &counts);
            let first_zero = smoothed.iter().position(|&c| c == 0).unwrap();
            // Last positive frame is index 1; `grace` held frames follow it.
            assert_eq!(first_zero, 2 + grace as usize, "grace = {grace}");
            assert!(smoothed[first_zero..].iter().all(|&c| c == 0));
        }
    }

    #[test]
    fn isolated_miss_does_not_end_visit() {
        let mut t = tracker(1, Duration::ZERO);
        let (smoothed, events) = run(&mut t, Instant::now(), &[1, 1, 0, 1, 1]);
        assert!(smoothed.iter().all(|&c| c > 0));
        assert_eq!(totals(&events), vec![1]);
        assert!(durations(&events).is_empty());
    }

    #[test]
    fn without_grace_a_miss_splits_the_visit() {
        let mut t = tracker(0, Duration::ZERO);
        let (smoothed, events) = run(&mut t, Instant::now(), &[1, 0, 1]);
        assert_eq!(smoothed, vec![1, 0, 1]);
        assert_eq!(totals(&events), vec![1, 2]);
    }

    #[test]
    fn one_visit_per_rising_edge_regardless_of_jump() {
        let mut t = tracker(0, Duration::ZERO);
        let (_, events) = run(&mut t, Instant::now(), &[0, 3, 5, 1, 0, 4, 0]);
        assert_eq!(totals(&events), vec![1, 2]);
        assert_eq!(t.state().total_visits, 2);
    }

    #[test]
    fn occupants_policy_adds_every_increase() {
        let mut t = PresenceTracker::new(TrackerConfig {
            grace_frames: 0,
            min_visit: Duration::ZERO,
            visit_counting: VisitCounting::Occupants,
        });
        let (_, events) = run(&mut t, Instant::now(), &[0, 3, 5, 1, 0, 2]);
        assert_eq!(totals(&events), vec![3, 5, 7]);
    }

    #[test]
    fn short_visits_report_no_duration() {
        let mut t = tracker(2, Duration::from_secs(2));
        // Present for 10 frames (1s) plus 2 grace frames.
        let mut counts = vec![1; 10];
        counts.extend([0; 5]);
        let (_, events) = run(&mut t, Instant::now(), &counts);
        assert_eq!(totals(&events), vec![1]);
        assert!(durations(&events).is_empty());
    }

    #[test]
    fn long_visit_reports_whole_seconds() {
        let mut t = tracker(2, Duration::from_secs(2));
        // Rising edge at frame 0, falling edge at frame 37 (3.7 s).
        let mut counts = vec![1; 35];
        counts.extend([0; 5]);
        let (_, events) = run(&mut t, Instant::now(), &counts);
        assert_eq!(durations(&events), vec![3]);
        assert_eq!(t.state().visit_start, None);
    }

    #[test]
    fn events_are_ordered_and_count_is_emitted_every_frame() {
        let mut t = tracker(0, Duration::ZERO);
        let origin = Instant::now();
        assert_eq!(
            t.step(2, origin),
            vec![
                PresenceEvent::TotalVisitsChanged(1),
                PresenceEvent::CurrentCount(2)
            ]
        );
        assert_eq!(t.step(2, origin + FRAME), vec![PresenceEvent::CurrentCount(2)]);
        assert_eq!(
            t.step(0, origin + FRAME * 35),
            vec![
                PresenceEvent::VisitDuration(3),
                PresenceEvent::CurrentCount(0)
            ]
        );
        assert_eq!(t.step(0, origin + FRAME * 36), vec![PresenceEvent::CurrentCount(0)]);
    }

    #[test]
    fn visits_must_outlast_min_visit_in_whole_seconds() {
        let origin = Instant::now();
        for elapsed in [
            Duration::from_secs(2),
            Duration::from_millis(2500),
            Duration::from_millis(2999),
        ] {
            let mut t = tracker(0, Duration::from_secs(2));
            t.step(1, origin);
            assert_eq!(
                t.step(0, origin + elapsed),
                vec![PresenceEvent::CurrentCount(0)],
                "visit of {:?}",
                elapsed
            );
        }

        let mut t = tracker(0, Duration::from_secs(2));
        t.step(1, origin);
        assert_eq!(
            t.step(0, origin + Duration::from_secs(3)),
            vec![
                PresenceEvent::VisitDuration(3),
                PresenceEvent::CurrentCount(0)
            ]
        );
    }

    #[test]
    fn presence_state_tracks_grace() {
        let mut t = tracker(2, Duration::ZERO);
        let origin = Instant::now();
        assert_eq!(t.state().presence(), PresenceState::Absent);
        t.step(1, origin);
        assert_eq!(t.state().presence(), PresenceState::Present);
        t.step(0, origin + FRAME);
        assert_eq!(t.state().presence(), PresenceState::Grace);
        assert_eq!(t.state().hysteresis_remaining, 1);
        t.step(0, origin + FRAME * 2);
        t.step(0, origin + FRAME * 3);
        assert_eq!(t.state().presence(), PresenceState::Absent);
    }

    #[test]
    fn fresh_trackers_are_deterministic() {
        let counts = [0, 1, 1, 0, 0, 0, 2, 2, 0, 1, 0, 0, 0, 0, 0, 0];
        let origin = Instant::now();
        let mut first = tracker(3, Duration::from_millis(500));
        let mut second = tracker(3, Duration::from_millis(500));
        assert_eq!(run(&mut first, origin, &counts), run(&mut second, origin, &counts));

        first.reset();
        assert_eq!(first.state(), &OccupancyState::default());
        assert_eq!(
            run(&mut first, origin, &counts),
            run(&mut tracker(3, Duration::from_millis(500)), origin, &counts)
        );
    }

    #[test]
    fn smoothed_count_never_negative_and_hysteresis_bounded() {
        let mut t = tracker(4, Duration::ZERO);
        let origin = Instant::now();
        let mut seed = 7u32;
        for i in 0..500u32 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let count = if (seed >> 16) % 3 == 0 { (seed >> 20) % 4 } else { 0 };
            t.step(count, origin + FRAME * i);
            let s = t.state();
            assert!(s.hysteresis_remaining <= 4);
            if count > 0 {
                assert_eq!(s.smoothed_count, count);
            }
        }
    }
}
