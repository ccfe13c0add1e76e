//! Guided multi-pose enrollment.
//!
//! The user holds each pose of a fixed sequence for a continuous period; at
//! the end of each hold one frame is captured and turned into a descriptor.
//! When every step has a descriptor the ordered set is submitted as the
//! user's enrolled profile.

use serde::{Deserialize, Serialize};

use crate::geometry::Pose;
use crate::provider::CameraError;
use crate::types::FaceDescriptor;

/// One pose challenge of the enrollment protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoseStep {
    pub pose: Pose,
    pub label: String,
    /// Continuous hold required before the capture fires.
    pub hold_ms: u64,
}

impl PoseStep {
    pub fn new(pose: Pose, label: impl Into<String>, hold_ms: u64) -> Self {
        Self {
            pose,
            label: label.into(),
            hold_ms,
        }
    }
}

/// Ordered pose sequence plus the landmark sampling period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrollmentPlan {
    pub steps: Vec<PoseStep>,
    pub sample_interval_ms: u64,
}

impl Default for EnrollmentPlan {
    fn default() -> Self {
        const HOLD_MS: u64 = 1_200;
        Self {
            steps: vec![
                PoseStep::new(Pose::Center, "Look straight at the camera", HOLD_MS),
                PoseStep::new(Pose::Left, "Turn your head slightly to the left", HOLD_MS),
                PoseStep::new(Pose::Right, "Turn your head slightly to the right", HOLD_MS),
                PoseStep::new(Pose::Center, "Look straight at the camera again", HOLD_MS),
            ],
            sample_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum EnrollPhase {
    Idle,
    LoadingModels,
    AwaitingCamera,
    Posing { step: usize },
    Capturing { step: usize },
    Submitting,
    Success { stored: usize },
    Failed,
    Cancelled,
}

impl EnrollPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EnrollPhase::Success { .. } | EnrollPhase::Failed | EnrollPhase::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnrollEvent {
    Start,
    ModelsLoaded,
    ModelsFailed(String),
    CameraReady,
    CameraFailed(CameraError),
    /// Pose classified on a sampling tick; `None` when no face was found.
    PoseSampled { pose: Option<Pose>, at_ms: u64 },
    Captured(FaceDescriptor),
    CaptureFailed(String),
    Submitted(usize),
    SubmitFailed(String),
    Cancel,
}

/// Side effect the IO layer must perform after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum EnrollAction {
    /// Grab, mirror and preprocess the current frame, then extract a descriptor.
    Capture { step: usize },
    /// Persist the complete ordered descriptor set.
    Submit(Vec<FaceDescriptor>),
    /// Stop sampling and release the camera.
    Release,
}

/// Serializable view for the rendering layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrollStatus {
    #[serde(flatten)]
    pub phase: EnrollPhase,
    pub step_label: Option<String>,
    pub captured: usize,
    pub total_steps: usize,
    /// 0.0..=1.0 progress of the current hold.
    pub hold_progress: f32,
    pub message: Option<String>,
}

/// Enrollment state machine. Pure: no clocks, no IO.
#[derive(Debug, Clone)]
pub struct EnrollmentController {
    plan: EnrollmentPlan,
    phase: EnrollPhase,
    collected: Vec<FaceDescriptor>,
    hold_started_ms: Option<u64>,
    last_sample_ms: Option<u64>,
    message: Option<String>,
}

impl EnrollmentController {
    pub fn new(plan: EnrollmentPlan) -> Self {
        Self {
            plan,
            phase: EnrollPhase::Idle,
            collected: Vec::new(),
            hold_started_ms: None,
            last_sample_ms: None,
            message: None,
        }
    }

    pub fn plan(&self) -> &EnrollmentPlan {
        &self.plan
    }

    pub fn phase(&self) -> EnrollPhase {
        self.phase
    }

    pub fn collected(&self) -> &[FaceDescriptor] {
        &self.collected
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn current_step(&self) -> Option<&PoseStep> {
        match self.phase {
            EnrollPhase::Posing { step } | EnrollPhase::Capturing { step } => self.plan.steps.get(step),
            _ => None,
        }
    }

    pub fn status(&self) -> EnrollStatus {
        let hold_progress = match (self.current_step(), self.hold_started_ms, self.last_sample_ms) {
            (Some(step), Some(start), Some(now)) if step.hold_ms > 0 => {
                (now.saturating_sub(start) as f32 / step.hold_ms as f32).min(1.0)
            }
            _ => 0.0,
        };
        EnrollStatus {
            phase: self.phase,
            step_label: self.current_step().map(|s| s.label.clone()),
            captured: self.collected.len(),
            total_steps: self.plan.steps.len(),
            hold_progress,
            message: self.message.clone(),
        }
    }

    /// Apply one event. Events that do not apply to the current phase are
    /// ignored.
    pub fn handle(&mut self, event: EnrollEvent) -> Option<EnrollAction> {
        match (self.phase, event) {
            (phase, EnrollEvent::Cancel) if !phase.is_terminal() => {
                self.collected.clear();
                self.hold_started_ms = None;
                self.message = None;
                self.phase = EnrollPhase::Cancelled;
                tracing::info!("enroll: cancelled, in-progress descriptors discarded");
                Some(EnrollAction::Release)
            }

            (EnrollPhase::Idle, EnrollEvent::Start) => {
                if self.plan.steps.is_empty() {
                    return self.fail("Enrollment plan has no steps.");
                }
                self.phase = EnrollPhase::LoadingModels;
                None
            }

            (EnrollPhase::LoadingModels, EnrollEvent::ModelsLoaded) => {
                self.phase = EnrollPhase::AwaitingCamera;
                None
            }
            (EnrollPhase::LoadingModels, EnrollEvent::ModelsFailed(reason)) => {
                tracing::error!(%reason, "enroll: model load failed");
                self.fail("Face models could not be loaded. Try again.")
            }

            (EnrollPhase::AwaitingCamera, EnrollEvent::CameraReady) => {
                self.enter_posing(0);
                None
            }
            (EnrollPhase::AwaitingCamera, EnrollEvent::CameraFailed(err)) => {
                tracing::error!(error = %err, "enroll: camera unavailable");
                self.fail(err.user_message())
            }

            (EnrollPhase::Posing { step }, EnrollEvent::PoseSampled { pose, at_ms }) => {
                self.last_sample_ms = Some(at_ms);
                let expected = self.plan.steps[step].pose;
                if pose != Some(expected) {
                    self.hold_started_ms = None;
                    return None;
                }
                let started = *self.hold_started_ms.get_or_insert(at_ms);
                if at_ms.saturating_sub(started) >= self.plan.steps[step].hold_ms {
                    self.phase = EnrollPhase::Capturing { step };
                    tracing::debug!(step, "enroll: hold complete, capturing");
                    return Some(EnrollAction::Capture { step });
                }
                None
            }

            (EnrollPhase::Capturing { step }, EnrollEvent::Captured(descriptor)) => {
                self.collected.truncate(step);
                self.collected.push(descriptor);
                self.message = None;
                tracing::info!(step, captured = self.collected.len(), "enroll: pose captured");

                if step + 1 < self.plan.steps.len() {
                    self.enter_posing(step + 1);
                    None
                } else {
                    self.phase = EnrollPhase::Submitting;
                    Some(EnrollAction::Submit(self.collected.clone()))
                }
            }
            (EnrollPhase::Capturing { step }, EnrollEvent::CaptureFailed(reason)) => {
                self.enter_posing(step);
                self.message = Some(reason);
                None
            }

            (EnrollPhase::Submitting, EnrollEvent::Submitted(stored)) => {
                self.phase = EnrollPhase::Success { stored };
                self.message = None;
                tracing::info!(stored, "enroll: profile stored");
                Some(EnrollAction::Release)
            }
            (EnrollPhase::Submitting, EnrollEvent::SubmitFailed(reason)) => {
                // Keep every earlier step; only the last pose is retaken.
                let last = self.plan.steps.len() - 1;
                self.collected.truncate(last);
                self.enter_posing(last);
                self.message = Some(reason);
                None
            }

            (phase, event) => {
                tracing::debug!(?phase, ?event, "enroll: event ignored");
                None
            }
        }
    }

    fn enter_posing(&mut self, step: usize) {
        self.phase = EnrollPhase::Posing { step };
        self.hold_started_ms = None;
    }

    fn fail(&mut self, message: &str) -> Option<EnrollAction> {
        self.phase = EnrollPhase::Failed;
        self.collected.clear();
        self.message = Some(message.to_string());
        Some(EnrollAction::Release)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(tag: f32) -> FaceDescriptor {
        FaceDescriptor::new(vec![tag; 4])
    }

    fn ready() -> EnrollmentController {
        let mut ctl = EnrollmentController::new(EnrollmentPlan::default());
        ctl.handle(EnrollEvent::Start);
        ctl.handle(EnrollEvent::ModelsLoaded);
        ctl.handle(EnrollEvent::CameraReady);
        ctl
    }

    /// Hold `pose` from `from_ms` until the capture fires. Returns the time of
    /// the capturing sample.
    fn hold(ctl: &mut EnrollmentController, pose: Pose, from_ms: u64) -> u64 {
        let mut at = from_ms;
        loop {
            if let Some(action) = ctl.handle(EnrollEvent::PoseSampled { pose: Some(pose), at_ms: at }) {
                assert!(matches!(action, EnrollAction::Capture { .. }));
                return at;
            }
            at += 100;
            assert!(at < from_ms + 10_000, "hold never completed");
        }
    }

    #[test]
    fn start_walks_through_loading_phases() {
        let mut ctl = EnrollmentController::new(EnrollmentPlan::default());
        assert_eq!(ctl.phase(), EnrollPhase::Idle);
        ctl.handle(EnrollEvent::Start);
        assert_eq!(ctl.phase(), EnrollPhase::LoadingModels);
        ctl.handle(EnrollEvent::ModelsLoaded);
        assert_eq!(ctl.phase(), EnrollPhase::AwaitingCamera);
        ctl.handle(EnrollEvent::CameraReady);
        assert_eq!(ctl.phase(), EnrollPhase::Posing { step: 0 });
        assert_eq!(ctl.status().step_label.as_deref(), Some("Look straight at the camera"));
    }

    #[test]
    fn hold_of_1200_ms_triggers_capture() {
        let mut ctl = ready();
        let fired = hold(&mut ctl, Pose::Center, 0);
        assert_eq!(fired, 1_200);
        assert_eq!(ctl.phase(), EnrollPhase::Capturing { step: 0 });
    }

    #[test]
    fn pose_break_resets_hold() {
        let mut ctl = ready();
        for at in (0..=1_000).step_by(100) {
            assert!(ctl.handle(EnrollEvent::PoseSampled { pose: Some(Pose::Center), at_ms: at }).is_none());
        }
        ctl.handle(EnrollEvent::PoseSampled { pose: Some(Pose::Left), at_ms: 1_100 });
        assert_eq!(ctl.status().hold_progress, 0.0);

        // The next hold starts from scratch.
        let fired = hold(&mut ctl, Pose::Center, 1_200);
        assert_eq!(fired, 2_400);
    }

    #[test]
    fn lost_face_resets_hold() {
        let mut ctl = ready();
        ctl.handle(EnrollEvent::PoseSampled { pose: Some(Pose::Center), at_ms: 0 });
        ctl.handle(EnrollEvent::PoseSampled { pose: None, at_ms: 600 });
        assert!(ctl
            .handle(EnrollEvent::PoseSampled { pose: Some(Pose::Center), at_ms: 1_200 })
            .is_none());
    }

    #[test]
    fn full_run_submits_four_descriptors_in_step_order() {
        let mut ctl = ready();
        let poses = [Pose::Center, Pose::Left, Pose::Right, Pose::Center];
        let mut at = 0;
        let mut submitted = None;
        for (i, pose) in poses.into_iter().enumerate() {
            at = hold(&mut ctl, pose, at) + 100;
            submitted = ctl.handle(EnrollEvent::Captured(descriptor(i as f32)));
        }

        let Some(EnrollAction::Submit(descriptors)) = submitted else {
            panic!("expected submit, got {submitted:?}");
        };
        assert_eq!(descriptors, (0..4).map(|i| descriptor(i as f32)).collect::<Vec<_>>());
        assert_eq!(ctl.phase(), EnrollPhase::Submitting);

        assert_eq!(ctl.handle(EnrollEvent::Submitted(4)), Some(EnrollAction::Release));
        assert_eq!(ctl.phase(), EnrollPhase::Success { stored: 4 });
    }

    #[test]
    fn wrong_pose_does_not_advance_step() {
        let mut ctl = ready();
        let at = hold(&mut ctl, Pose::Center, 0);
        ctl.handle(EnrollEvent::Captured(descriptor(0.0)));
        assert_eq!(ctl.phase(), EnrollPhase::Posing { step: 1 });

        for t in (at..at + 3_000).step_by(100) {
            assert!(ctl.handle(EnrollEvent::PoseSampled { pose: Some(Pose::Right), at_ms: t }).is_none());
        }
        assert_eq!(ctl.phase(), EnrollPhase::Posing { step: 1 });
    }

    #[test]
    fn capture_without_face_retries_same_step() {
        let mut ctl = ready();
        let at = hold(&mut ctl, Pose::Center, 0);
        ctl.handle(EnrollEvent::CaptureFailed("No face detected".into()));

        assert_eq!(ctl.phase(), EnrollPhase::Posing { step: 0 });
        assert_eq!(ctl.message(), Some("No face detected"));
        assert!(ctl.collected().is_empty());

        // Hold timer was cleared: a full new hold is needed.
        let fired = hold(&mut ctl, Pose::Center, at + 100);
        assert_eq!(fired, at + 100 + 1_200);
    }

    #[test]
    fn cancel_after_two_captures_discards_everything() {
        let mut ctl = ready();
        let at = hold(&mut ctl, Pose::Center, 0);
        ctl.handle(EnrollEvent::Captured(descriptor(0.0)));
        hold(&mut ctl, Pose::Left, at + 100);
        ctl.handle(EnrollEvent::Captured(descriptor(1.0)));
        assert_eq!(ctl.collected().len(), 2);

        assert_eq!(ctl.handle(EnrollEvent::Cancel), Some(EnrollAction::Release));
        assert_eq!(ctl.phase(), EnrollPhase::Cancelled);
        assert!(ctl.collected().is_empty());

        // Terminal: nothing revives it.
        assert!(ctl.handle(EnrollEvent::Captured(descriptor(2.0))).is_none());
        assert!(ctl.collected().is_empty());
    }

    #[test]
    fn submit_failure_retakes_only_last_step() {
        let mut ctl = ready();
        let mut at = 0;
        for (i, pose) in [Pose::Center, Pose::Left, Pose::Right, Pose::Center].into_iter().enumerate() {
            at = hold(&mut ctl, pose, at) + 100;
            ctl.handle(EnrollEvent::Captured(descriptor(i as f32)));
        }
        ctl.handle(EnrollEvent::SubmitFailed("storage unavailable".into()));

        assert_eq!(ctl.phase(), EnrollPhase::Posing { step: 3 });
        assert_eq!(ctl.collected().len(), 3);
        assert_eq!(ctl.message(), Some("storage unavailable"));

        hold(&mut ctl, Pose::Center, at);
        let action = ctl.handle(EnrollEvent::Captured(descriptor(9.0)));
        let Some(EnrollAction::Submit(descriptors)) = action else {
            panic!("expected resubmission");
        };
        assert_eq!(descriptors.len(), 4);
        assert_eq!(descriptors[2], descriptor(2.0));
        assert_eq!(descriptors[3], descriptor(9.0));
    }

    #[test]
    fn model_failure_is_terminal() {
        let mut ctl = EnrollmentController::new(EnrollmentPlan::default());
        ctl.handle(EnrollEvent::Start);
        assert_eq!(ctl.handle(EnrollEvent::ModelsFailed("404".into())), Some(EnrollAction::Release));
        assert_eq!(ctl.phase(), EnrollPhase::Failed);
        assert!(ctl.handle(EnrollEvent::ModelsLoaded).is_none());
        assert_eq!(ctl.phase(), EnrollPhase::Failed);
    }

    #[test]
    fn camera_denial_has_its_own_message() {
        let mut denied = EnrollmentController::new(EnrollmentPlan::default());
        denied.handle(EnrollEvent::Start);
        denied.handle(EnrollEvent::ModelsLoaded);
        denied.handle(EnrollEvent::CameraFailed(CameraError::PermissionDenied));

        let mut broken = EnrollmentController::new(EnrollmentPlan::default());
        broken.handle(EnrollEvent::Start);
        broken.handle(EnrollEvent::ModelsLoaded);
        broken.handle(EnrollEvent::CameraFailed(CameraError::Unavailable("busy".into())));

        assert_eq!(denied.phase(), EnrollPhase::Failed);
        assert_eq!(broken.phase(), EnrollPhase::Failed);
        assert_ne!(denied.message(), broken.message());
    }

    #[test]
    fn status_serializes_phase_inline() {
        let mut ctl = ready();
        ctl.handle(EnrollEvent::PoseSampled { pose: Some(Pose::Center), at_ms: 0 });
        ctl.handle(EnrollEvent::PoseSampled { pose: Some(Pose::Center), at_ms: 600 });
        let json = serde_json::to_value(ctl.status()).unwrap();
        assert_eq!(json["phase"], "posing");
        assert_eq!(json["step"], 0);
        assert_eq!(json["total_steps"], 4);
        assert_eq!(json["hold_progress"], 0.5);
    }
}
