//! Liveness-gated verification controller.
//!
//! Wraps a [`LivenessSession`] with the phases around it: model loading,
//! camera acquisition, descriptor extraction once the challenge completes,
//! and the server round-trip. Recovery rules differ by failure:
//!
//! | Failure | Counters |
//! |---|---|
//! | no face at extraction | kept, back to the challenge |
//! | server rejects the face or the evidence | reset, fresh challenge |
//! | challenge timeout | discarded, attempt over |

use serde::Serialize;

use crate::liveness::{LivenessEvidence, LivenessPolicy, LivenessSession, Progress};
use crate::provider::{CameraError, Rejection, SessionGrant};
use crate::types::{FaceDescriptor, Landmarks};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyPhase {
    Idle,
    LoadingModels,
    AwaitingCamera,
    Challenge,
    Extracting,
    Verifying,
    Verified,
    TimedOut,
    Failed,
    Cancelled,
}

impl VerifyPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            VerifyPhase::Verified | VerifyPhase::TimedOut | VerifyPhase::Failed | VerifyPhase::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VerifyEvent {
    Start,
    ModelsLoaded,
    ModelsFailed(String),
    CameraReady { at_ms: u64 },
    CameraFailed(CameraError),
    /// Landmarks from one sampling tick; `None` when no face was found.
    Sampled { landmarks: Option<Landmarks>, at_ms: u64 },
    Extracted { descriptor: FaceDescriptor, at_ms: u64 },
    ExtractionFailed(String),
    Accepted(SessionGrant),
    Rejected { rejection: Rejection, at_ms: u64 },
    /// Start over after a terminal failure.
    Restart,
    Cancel,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VerifyAction {
    /// Grab one more frame, preprocess it and extract a descriptor.
    Extract,
    /// Send the descriptor and frozen evidence to the matcher.
    Submit {
        descriptor: FaceDescriptor,
        evidence: LivenessEvidence,
    },
    /// Stop sampling and release the camera.
    Release,
}

/// Serializable view for the rendering layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerifyStatus {
    pub phase: VerifyPhase,
    pub blink_count: u32,
    pub head_movement_count: u32,
    pub required_blinks: u32,
    pub required_head_movements: u32,
    pub message: Option<String>,
}

/// Liveness challenge state machine. Pure: timestamps arrive with events.
#[derive(Debug, Clone)]
pub struct VerificationController {
    policy: LivenessPolicy,
    phase: VerifyPhase,
    session: Option<LivenessSession>,
    grant: Option<SessionGrant>,
    message: Option<String>,
}

impl VerificationController {
    pub fn new(policy: LivenessPolicy) -> Self {
        Self {
            policy,
            phase: VerifyPhase::Idle,
            session: None,
            grant: None,
            message: None,
        }
    }

    pub fn phase(&self) -> VerifyPhase {
        self.phase
    }

    pub fn policy(&self) -> &LivenessPolicy {
        &self.policy
    }

    /// Live challenge state, present while a challenge is running.
    pub fn session(&self) -> Option<&LivenessSession> {
        self.session.as_ref()
    }

    pub fn grant(&self) -> Option<&SessionGrant> {
        self.grant.as_ref()
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn status(&self) -> VerifyStatus {
        VerifyStatus {
            phase: self.phase,
            blink_count: self.session.as_ref().map_or(0, LivenessSession::blink_count),
            head_movement_count: self
                .session
                .as_ref()
                .map_or(0, LivenessSession::head_movement_count),
            required_blinks: self.policy.min_blinks,
            required_head_movements: self.policy.min_head_movements,
            message: self.message.clone(),
        }
    }

    pub fn handle(&mut self, event: VerifyEvent) -> Option<VerifyAction> {
        match (self.phase, event) {
            (phase, VerifyEvent::Cancel) if !phase.is_terminal() => {
                self.session = None;
                self.message = None;
                self.phase = VerifyPhase::Cancelled;
                tracing::info!("verify: cancelled, challenge state discarded");
                Some(VerifyAction::Release)
            }

            (VerifyPhase::Idle, VerifyEvent::Start) => {
                self.phase = VerifyPhase::LoadingModels;
                self.message = None;
                None
            }
            (VerifyPhase::LoadingModels, VerifyEvent::ModelsLoaded) => {
                self.phase = VerifyPhase::AwaitingCamera;
                None
            }
            (VerifyPhase::LoadingModels, VerifyEvent::ModelsFailed(reason)) => {
                tracing::error!(%reason, "verify: model load failed");
                self.fail(VerifyPhase::Failed, "Face models could not be loaded. Try again.")
            }
            (VerifyPhase::AwaitingCamera, VerifyEvent::CameraReady { at_ms }) => {
                self.begin_challenge(at_ms);
                None
            }
            (VerifyPhase::AwaitingCamera, VerifyEvent::CameraFailed(err)) => {
                tracing::error!(error = %err, "verify: camera unavailable");
                self.fail(VerifyPhase::Failed, err.user_message())
            }

            (VerifyPhase::Challenge, VerifyEvent::Sampled { landmarks, at_ms }) => {
                let session = self.session.as_mut()?;
                let progress = match &landmarks {
                    Some(lm) => session.observe(lm, at_ms),
                    None => session.observe_missing(at_ms),
                };
                match progress {
                    Progress::Pending => None,
                    Progress::Complete => {
                        tracing::debug!(
                            blinks = session.blink_count(),
                            movements = session.head_movement_count(),
                            elapsed_ms = session.elapsed_ms(at_ms),
                            "verify: liveness challenge complete"
                        );
                        self.phase = VerifyPhase::Extracting;
                        self.message = None;
                        Some(VerifyAction::Extract)
                    }
                    Progress::TimedOut => {
                        tracing::warn!(
                            blinks = session.blink_count(),
                            movements = session.head_movement_count(),
                            "verify: liveness challenge timed out"
                        );
                        self.fail(
                            VerifyPhase::TimedOut,
                            "Liveness check timed out. Start again and follow the prompts.",
                        )
                    }
                }
            }

            (VerifyPhase::Extracting, VerifyEvent::Extracted { descriptor, at_ms }) => {
                let session = self.session.take()?;
                self.phase = VerifyPhase::Verifying;
                Some(VerifyAction::Submit {
                    descriptor,
                    evidence: session.into_evidence(at_ms),
                })
            }
            (VerifyPhase::Extracting, VerifyEvent::ExtractionFailed(reason)) => {
                // Counters survive: the user already proved liveness.
                self.phase = VerifyPhase::Challenge;
                self.message = Some(reason);
                None
            }

            (VerifyPhase::Verifying, VerifyEvent::Accepted(grant)) => {
                tracing::info!(user = %grant.user, "verify: identity confirmed");
                self.grant = Some(grant);
                self.phase = VerifyPhase::Verified;
                self.message = None;
                Some(VerifyAction::Release)
            }
            (VerifyPhase::Verifying, VerifyEvent::Rejected { rejection, at_ms }) => {
                tracing::warn!(reason = ?rejection.reason, "verify: rejected by server");
                if rejection.reason.is_retryable() {
                    self.begin_challenge(at_ms);
                    self.message = Some(rejection.message);
                    None
                } else {
                    self.fail(VerifyPhase::Failed, &rejection.message)
                }
            }

            (phase, VerifyEvent::Restart) if phase.is_terminal() && phase != VerifyPhase::Verified => {
                self.session = None;
                self.message = None;
                self.phase = VerifyPhase::Idle;
                None
            }

            (phase, event) => {
                tracing::debug!(?phase, ?event, "verify: event ignored");
                None
            }
        }
    }

    fn begin_challenge(&mut self, at_ms: u64) {
        self.session = Some(LivenessSession::new(self.policy.clone(), at_ms));
        self.phase = VerifyPhase::Challenge;
    }

    fn fail(&mut self, phase: VerifyPhase, message: &str) -> Option<VerifyAction> {
        self.session = None;
        self.phase = phase;
        self.message = Some(message.to_string());
        Some(VerifyAction::Release)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::tests::face;
    use crate::liveness::tests::passing_script;
    use crate::provider::RejectReason;
    use crate::types::Point;

    fn in_challenge() -> VerificationController {
        let mut ctl = VerificationController::new(LivenessPolicy::default());
        ctl.handle(VerifyEvent::Start);
        ctl.handle(VerifyEvent::ModelsLoaded);
        ctl.handle(VerifyEvent::CameraReady { at_ms: 0 });
        ctl
    }

    fn sample(ctl: &mut VerificationController, at_ms: u64, landmarks: Landmarks) -> Option<VerifyAction> {
        ctl.handle(VerifyEvent::Sampled {
            landmarks: Some(landmarks),
            at_ms,
        })
    }

    /// Run the passing script, then idle until completion fires.
    fn complete(ctl: &mut VerificationController, offset_ms: u64) -> u64 {
        for (at, lm) in passing_script() {
            assert_eq!(sample(ctl, offset_ms + at, lm), None);
        }
        let mut at = offset_ms + 1_400;
        loop {
            if let Some(action) = sample(ctl, at, face(Point::new(180.0, 150.0), 0.5)) {
                assert_eq!(action, VerifyAction::Extract);
                return at;
            }
            at += 200;
        }
    }

    fn descriptor() -> FaceDescriptor {
        FaceDescriptor::new(vec![0.1; 8])
    }

    fn grant() -> SessionGrant {
        SessionGrant {
            session_token: "session".into(),
            user: "admin".into(),
            expires_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn completion_waits_for_minimum_duration() {
        let mut ctl = in_challenge();
        let fired = complete(&mut ctl, 0);
        assert_eq!(fired, 3_000);
        assert_eq!(ctl.phase(), VerifyPhase::Extracting);
    }

    #[test]
    fn extraction_submits_frozen_evidence() {
        let mut ctl = in_challenge();
        let at = complete(&mut ctl, 0);
        let action = ctl.handle(VerifyEvent::Extracted {
            descriptor: descriptor(),
            at_ms: at + 50,
        });
        let Some(VerifyAction::Submit { evidence, .. }) = action else {
            panic!("expected submission, got {action:?}");
        };
        assert_eq!(evidence.blink_count, 2);
        assert_eq!(evidence.head_movement_count, 3);
        assert_eq!(evidence.elapsed_ms, 3_000);
        assert_eq!(ctl.phase(), VerifyPhase::Verifying);
        assert!(ctl.session().is_none());
    }

    #[test]
    fn extraction_failure_keeps_counters() {
        let mut ctl = in_challenge();
        let at = complete(&mut ctl, 0);
        ctl.handle(VerifyEvent::ExtractionFailed("No face detected".into()));

        assert_eq!(ctl.phase(), VerifyPhase::Challenge);
        assert_eq!(ctl.status().blink_count, 2);
        assert_eq!(ctl.status().head_movement_count, 3);
        // Evidence is still sufficient, so the very next sample re-triggers extraction.
        assert_eq!(
            sample(&mut ctl, at + 200, face(Point::new(180.0, 150.0), 0.5)),
            Some(VerifyAction::Extract)
        );
    }

    #[test]
    fn completion_near_the_limit_survives_an_extraction_retry() {
        let mut ctl = in_challenge();
        let still = face(Point::new(150.0, 150.0), 0.5);
        let mut at = 0;
        while at < 18_800 {
            assert_eq!(sample(&mut ctl, at, still.clone()), None);
            at += 200;
        }
        let mut fired = None;
        for (offset, lm) in passing_script() {
            if let Some(action) = sample(&mut ctl, 18_800 + offset, lm) {
                fired = Some((18_800 + offset, action));
            }
        }
        assert_eq!(fired, Some((20_000, VerifyAction::Extract)));

        ctl.handle(VerifyEvent::ExtractionFailed("No face detected".into()));
        assert_eq!(
            sample(&mut ctl, 20_400, face(Point::new(180.0, 150.0), 0.5)),
            Some(VerifyAction::Extract)
        );
        let action = ctl.handle(VerifyEvent::Extracted {
            descriptor: descriptor(),
            at_ms: 20_450,
        });
        let Some(VerifyAction::Submit { evidence, .. }) = action else {
            panic!("expected submission, got {action:?}");
        };
        assert_eq!(evidence.elapsed_ms, 20_000);
        assert_eq!(evidence.sample_count, 102);
        assert_eq!(LivenessPolicy::default().validate(&evidence), Ok(()));
    }

    #[test]
    fn face_mismatch_restarts_challenge_from_zero() {
        let mut ctl = in_challenge();
        let at = complete(&mut ctl, 0);
        ctl.handle(VerifyEvent::Extracted { descriptor: descriptor(), at_ms: at });
        let action = ctl.handle(VerifyEvent::Rejected {
            rejection: Rejection::new(RejectReason::FaceMismatch, "Face not recognised"),
            at_ms: at + 100,
        });

        assert_eq!(action, None);
        assert_eq!(ctl.phase(), VerifyPhase::Challenge);
        assert_eq!(ctl.status().blink_count, 0);
        assert_eq!(ctl.status().head_movement_count, 0);
        assert_eq!(ctl.message(), Some("Face not recognised"));

        // The fresh challenge measures its duration from the rejection.
        let fired = complete(&mut ctl, at + 100);
        assert_eq!(fired, at + 100 + 3_000);
    }

    #[test]
    fn non_retryable_rejection_is_terminal() {
        let mut ctl = in_challenge();
        let at = complete(&mut ctl, 0);
        ctl.handle(VerifyEvent::Extracted { descriptor: descriptor(), at_ms: at });
        let action = ctl.handle(VerifyEvent::Rejected {
            rejection: Rejection::new(RejectReason::RateLimited, "Too many attempts"),
            at_ms: at,
        });
        assert_eq!(action, Some(VerifyAction::Release));
        assert_eq!(ctl.phase(), VerifyPhase::Failed);
    }

    #[test]
    fn acceptance_stores_grant() {
        let mut ctl = in_challenge();
        let at = complete(&mut ctl, 0);
        ctl.handle(VerifyEvent::Extracted { descriptor: descriptor(), at_ms: at });
        let action = ctl.handle(VerifyEvent::Accepted(grant()));
        assert_eq!(action, Some(VerifyAction::Release));
        assert_eq!(ctl.phase(), VerifyPhase::Verified);
        assert_eq!(ctl.grant().unwrap().user, "admin");
    }

    #[test]
    fn timeout_discards_counters_and_restart_begins_at_zero() {
        let mut ctl = in_challenge();
        // One blink, then nothing useful for 20 s.
        sample(&mut ctl, 200, face(Point::new(150.0, 150.0), 0.2));
        assert_eq!(ctl.status().blink_count, 1);

        let mut at = 400;
        let action = loop {
            if let Some(action) = sample(&mut ctl, at, face(Point::new(150.0, 150.0), 0.5)) {
                break action;
            }
            at += 200;
        };
        assert_eq!(action, VerifyAction::Release);
        assert!(at > 20_000 && at <= 20_200);
        assert_eq!(ctl.phase(), VerifyPhase::TimedOut);
        assert_eq!(ctl.status().blink_count, 0);

        ctl.handle(VerifyEvent::Restart);
        ctl.handle(VerifyEvent::Start);
        ctl.handle(VerifyEvent::ModelsLoaded);
        ctl.handle(VerifyEvent::CameraReady { at_ms: 30_000 });
        assert_eq!(ctl.phase(), VerifyPhase::Challenge);
        let session = ctl.session().unwrap();
        assert_eq!(session.blink_count(), 0);
        assert_eq!(session.head_movement_count(), 0);
        assert_eq!(session.sample_count(), 0);
    }

    #[test]
    fn sample_at_20001_ms_times_out() {
        let mut ctl = in_challenge();
        assert_eq!(sample(&mut ctl, 20_000, face(Point::new(150.0, 150.0), 0.5)), None);
        assert_eq!(
            sample(&mut ctl, 20_001, face(Point::new(150.0, 150.0), 0.5)),
            Some(VerifyAction::Release)
        );
        assert_eq!(ctl.phase(), VerifyPhase::TimedOut);
    }

    #[test]
    fn missing_faces_still_time_out() {
        let mut ctl = in_challenge();
        assert_eq!(
            ctl.handle(VerifyEvent::Sampled { landmarks: None, at_ms: 25_000 }),
            Some(VerifyAction::Release)
        );
        assert_eq!(ctl.phase(), VerifyPhase::TimedOut);
    }

    #[test]
    fn cancel_discards_session() {
        let mut ctl = in_challenge();
        sample(&mut ctl, 200, face(Point::new(150.0, 150.0), 0.2));
        assert_eq!(ctl.handle(VerifyEvent::Cancel), Some(VerifyAction::Release));
        assert_eq!(ctl.phase(), VerifyPhase::Cancelled);
        assert!(ctl.session().is_none());
        assert_eq!(ctl.handle(VerifyEvent::Cancel), None);
    }

    #[test]
    fn samples_outside_challenge_are_ignored() {
        let mut ctl = VerificationController::new(LivenessPolicy::default());
        ctl.handle(VerifyEvent::Start);
        assert_eq!(sample(&mut ctl, 0, face(Point::new(150.0, 150.0), 0.2)), None);
        assert_eq!(ctl.phase(), VerifyPhase::LoadingModels);
    }

    #[test]
    fn camera_denial_fails_with_distinct_message() {
        let mut ctl = VerificationController::new(LivenessPolicy::default());
        ctl.handle(VerifyEvent::Start);
        ctl.handle(VerifyEvent::ModelsLoaded);
        ctl.handle(VerifyEvent::CameraFailed(CameraError::PermissionDenied));
        assert_eq!(ctl.phase(), VerifyPhase::Failed);
        assert_eq!(ctl.message(), Some(CameraError::PermissionDenied.user_message()));
    }
}
