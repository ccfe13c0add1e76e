//! Active liveness detection: blinks plus head movement over a time window.
//!
//! A printed photograph cannot blink, and a replayed video rarely produces
//! the required number of direction changes at the right pace. Each sample
//! feeds landmarks into a [`LivenessSession`], which accumulates evidence:
//!
//! - **Blinks**: mean eye aspect ratio dropping below the closed threshold
//!   while the eyes were open. The open threshold sits above the closed one,
//!   so single-frame jitter around one value cannot re-trigger.
//! - **Head movements**: nose-tip displacement above a pixel threshold
//!   between consecutive samples, counted only when the direction changes.
//!
//! The challenge completes when the blink and movement minimums and the
//! minimum duration all hold at the same time.
//!
//! # Threat Coverage
//!
//! - **Blocks:** Printed photographs, static screens, naive looping video.
//! - **Does not block:** Live-puppeted deepfakes or high-quality 3D masks.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geometry::{self, Direction};
use crate::types::Landmarks;

/// Thresholds and timing rules for the challenge.
///
/// The server validates submitted evidence against the same policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessPolicy {
    /// EAR below which open eyes count as closed.
    pub closed_ear: f32,
    /// EAR above which closed eyes count as open again.
    pub open_ear: f32,
    /// Minimum gap between two counted blinks.
    pub blink_debounce_ms: u64,
    /// Nose-tip travel between samples that counts as movement.
    pub movement_threshold_px: f32,
    /// Minimum gap between two counted movements.
    pub movement_debounce_ms: u64,
    pub min_blinks: u32,
    pub min_head_movements: u32,
    pub min_duration_ms: u64,
    pub timeout_ms: u64,
    pub sample_interval_ms: u64,
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self {
            closed_ear: 0.30,
            open_ear: 0.35,
            blink_debounce_ms: 200,
            movement_threshold_px: 25.0,
            movement_debounce_ms: 300,
            min_blinks: 2,
            min_head_movements: 3,
            min_duration_ms: 3_000,
            timeout_ms: 20_000,
            sample_interval_ms: 200,
        }
    }
}

/// Reason submitted evidence fails the policy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LivenessViolation {
    #[error("too few blinks: {got} < {need}")]
    TooFewBlinks { got: u32, need: u32 },
    #[error("too few head movements: {got} < {need}")]
    TooFewMovements { got: u32, need: u32 },
    #[error("challenge too short: {elapsed_ms} ms < {need_ms} ms")]
    TooShort { elapsed_ms: u64, need_ms: u64 },
    #[error("challenge exceeded its time limit: {elapsed_ms} ms > {limit_ms} ms")]
    TooLong { elapsed_ms: u64, limit_ms: u64 },
    #[error("{samples} samples cannot carry {events} events")]
    TooFewSamples { samples: u32, events: u32 },
}

impl LivenessPolicy {
    /// All three minimums hold simultaneously.
    pub fn is_satisfied(&self, blinks: u32, movements: u32, elapsed_ms: u64) -> bool {
        blinks >= self.min_blinks
            && movements >= self.min_head_movements
            && elapsed_ms >= self.min_duration_ms
    }

    /// Re-check evidence reported by a client.
    ///
    /// Beyond the minimums, the evidence must be internally consistent: the
    /// challenge cannot have outlived its timeout, and every counted event
    /// needs a sample of its own beyond the first one.
    pub fn validate(&self, evidence: &LivenessEvidence) -> Result<(), LivenessViolation> {
        if evidence.blink_count < self.min_blinks {
            return Err(LivenessViolation::TooFewBlinks {
                got: evidence.blink_count,
                need: self.min_blinks,
            });
        }
        if evidence.head_movement_count < self.min_head_movements {
            return Err(LivenessViolation::TooFewMovements {
                got: evidence.head_movement_count,
                need: self.min_head_movements,
            });
        }
        if evidence.elapsed_ms < self.min_duration_ms {
            return Err(LivenessViolation::TooShort {
                elapsed_ms: evidence.elapsed_ms,
                need_ms: self.min_duration_ms,
            });
        }
        if evidence.elapsed_ms > self.timeout_ms {
            return Err(LivenessViolation::TooLong {
                elapsed_ms: evidence.elapsed_ms,
                limit_ms: self.timeout_ms,
            });
        }
        let events = evidence.blink_count.max(evidence.head_movement_count);
        if evidence.sample_count <= events {
            return Err(LivenessViolation::TooFewSamples {
                samples: evidence.sample_count,
                events,
            });
        }
        Ok(())
    }
}

/// Aggregated evidence submitted alongside the descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessEvidence {
    pub blink_count: u32,
    pub head_movement_count: u32,
    pub elapsed_ms: u64,
    pub sample_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlinkState {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlinkEvent {
    pub at_ms: u64,
    pub ear: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MovementEvent {
    pub at_ms: u64,
    pub direction: Direction,
    pub magnitude: f32,
}

/// Outcome of feeding one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Pending,
    Complete,
    TimedOut,
}

/// Single-use evidence accumulator for one challenge attempt.
///
/// Timestamps are milliseconds on any monotonic clock shared by
/// [`LivenessSession::new`] and the sample calls. The session is consumed by
/// [`LivenessSession::into_evidence`], so counters can never be reused after
/// a submission.
#[derive(Debug, Clone)]
pub struct LivenessSession {
    policy: LivenessPolicy,
    started_at_ms: u64,
    blink_state: BlinkState,
    sample_count: u32,
    last_landmarks: Option<Landmarks>,
    head_position: Option<Direction>,
    blinks: Vec<BlinkEvent>,
    movements: Vec<MovementEvent>,
    completed_at_ms: Option<u64>,
}

impl LivenessSession {
    pub fn new(policy: LivenessPolicy, started_at_ms: u64) -> Self {
        Self {
            policy,
            started_at_ms,
            blink_state: BlinkState::Open,
            sample_count: 0,
            last_landmarks: None,
            head_position: None,
            blinks: Vec::new(),
            movements: Vec::new(),
            completed_at_ms: None,
        }
    }

    pub fn policy(&self) -> &LivenessPolicy {
        &self.policy
    }

    pub fn blink_count(&self) -> u32 {
        self.blinks.len() as u32
    }

    pub fn head_movement_count(&self) -> u32 {
        self.movements.len() as u32
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    pub fn blink_state(&self) -> BlinkState {
        self.blink_state
    }

    /// Direction of the last counted movement.
    pub fn head_position(&self) -> Option<Direction> {
        self.head_position
    }

    pub fn blink_events(&self) -> &[BlinkEvent] {
        &self.blinks
    }

    pub fn movement_events(&self) -> &[MovementEvent] {
        &self.movements
    }

    /// When every minimum was first met within the timeout.
    pub fn completed_at_ms(&self) -> Option<u64> {
        self.completed_at_ms
    }

    pub fn elapsed_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.started_at_ms)
    }

    /// Feed one landmark sample taken at `now_ms`.
    pub fn observe(&mut self, landmarks: &Landmarks, now_ms: u64) -> Progress {
        self.sample_count += 1;
        self.track_blink(landmarks, now_ms);
        self.track_movement(landmarks, now_ms);
        self.last_landmarks = Some(landmarks.clone());
        self.settle(now_ms)
    }

    /// A sample in which no face was found. Counts towards the timeout only;
    /// the motion baseline is dropped so the face reappearing elsewhere is
    /// not mistaken for a head movement.
    pub fn observe_missing(&mut self, now_ms: u64) -> Progress {
        self.last_landmarks = None;
        self.settle(now_ms)
    }

    /// A session that met every minimum within the timeout stays complete;
    /// minimums first met past the timeout do not count.
    pub fn progress(&self, now_ms: u64) -> Progress {
        if self.completed_at_ms.is_some() {
            return Progress::Complete;
        }
        let elapsed = self.elapsed_ms(now_ms);
        if elapsed > self.policy.timeout_ms {
            Progress::TimedOut
        } else if self
            .policy
            .is_satisfied(self.blink_count(), self.head_movement_count(), elapsed)
        {
            Progress::Complete
        } else {
            Progress::Pending
        }
    }

    fn settle(&mut self, now_ms: u64) -> Progress {
        let progress = self.progress(now_ms);
        if progress == Progress::Complete && self.completed_at_ms.is_none() {
            self.completed_at_ms = Some(now_ms);
        }
        progress
    }

    /// Freeze the counters for submission. Elapsed time is measured up to
    /// completion, so extraction retries after it do not age the evidence.
    pub fn into_evidence(self, now_ms: u64) -> LivenessEvidence {
        let until_ms = self.completed_at_ms.unwrap_or(now_ms);
        LivenessEvidence {
            blink_count: self.blink_count(),
            head_movement_count: self.head_movement_count(),
            elapsed_ms: self.elapsed_ms(until_ms),
            sample_count: self.sample_count,
        }
    }

    fn track_blink(&mut self, landmarks: &Landmarks, now_ms: u64) {
        let ear = geometry::mean_eye_aspect_ratio(landmarks);

        if ear < self.policy.closed_ear && self.blink_state == BlinkState::Open {
            self.blink_state = BlinkState::Closed;
            let debounced = match self.blinks.last() {
                None => true,
                Some(last) => now_ms.saturating_sub(last.at_ms) > self.policy.blink_debounce_ms,
            };
            if debounced {
                self.blinks.push(BlinkEvent { at_ms: now_ms, ear });
                tracing::debug!(ear, count = self.blinks.len(), "liveness: blink");
            }
        } else if ear > self.policy.open_ear {
            self.blink_state = BlinkState::Open;
        }
    }

    fn track_movement(&mut self, landmarks: &Landmarks, now_ms: u64) {
        let Some(prev) = self.last_landmarks.as_ref().and_then(Landmarks::nose_tip) else {
            return;
        };
        let Some(curr) = landmarks.nose_tip() else {
            return;
        };

        let motion = geometry::displacement(prev, curr);
        if motion.magnitude <= self.policy.movement_threshold_px {
            return;
        }

        let debounced = match self.movements.last() {
            None => true,
            Some(last) => now_ms.saturating_sub(last.at_ms) > self.policy.movement_debounce_ms,
        };
        if debounced && self.head_position != Some(motion.direction) {
            self.head_position = Some(motion.direction);
            self.movements.push(MovementEvent {
                at_ms: now_ms,
                direction: motion.direction,
                magnitude: motion.magnitude,
            });
            tracing::debug!(
                direction = ?motion.direction,
                magnitude = motion.magnitude,
                count = self.movements.len(),
                "liveness: head movement"
            );
        }
    }
}
