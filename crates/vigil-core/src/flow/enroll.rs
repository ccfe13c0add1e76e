use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{prepare_capture, until_cancelled, CaptureOptions, FlowClock, FlowError};
use crate::enrollment::{
    EnrollAction, EnrollEvent, EnrollPhase, EnrollStatus, EnrollmentController, EnrollmentPlan,
};
use crate::geometry::{pose_from_landmarks, Pose};
use crate::preprocess::{LightingNormalizer, Preprocess};
use crate::provider::{EnrollmentBackend, FaceAnalyzer, FrameSource, FrameStream, ModelLoader};
use crate::ticker::Ticker;
use crate::types::Frame;

const NO_FACE_AT_CAPTURE: &str = "No face detected. Hold the pose and try again.";
const SUBMIT_FAILED: &str = "Saving the enrollment failed. Hold the last pose to retry.";

/// Drives one guided enrollment from model load to stored profile.
pub struct EnrollmentFlow<'a, L, S, B> {
    models: &'a L,
    camera: &'a S,
    backend: &'a B,
    plan: EnrollmentPlan,
    options: CaptureOptions,
    preprocessor: Box<dyn Preprocess + 'a>,
}

impl<'a, L, S, B> EnrollmentFlow<'a, L, S, B>
where
    L: ModelLoader,
    S: FrameSource,
    B: EnrollmentBackend,
{
    pub fn new(models: &'a L, camera: &'a S, backend: &'a B) -> Self {
        Self {
            models,
            camera,
            backend,
            plan: EnrollmentPlan::default(),
            options: CaptureOptions::default(),
            preprocessor: Box::new(LightingNormalizer::default()),
        }
    }

    pub fn with_plan(mut self, plan: EnrollmentPlan) -> Self {
        self.plan = plan;
        self
    }

    pub fn with_options(mut self, options: CaptureOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_preprocessor(mut self, preprocessor: impl Preprocess + 'a) -> Self {
        self.preprocessor = Box::new(preprocessor);
        self
    }

    /// Run until the profile is stored, a terminal failure, or `cancel`
    /// fires. `observe` sees every status change.
    ///
    /// On cancellation the collected descriptors are discarded and nothing
    /// is submitted. The camera is released before this returns.
    pub async fn run<O>(&self, cancel: &CancellationToken, mut observe: O) -> Result<usize, FlowError>
    where
        O: FnMut(&EnrollStatus),
    {
        let clock = FlowClock::start();
        let mut ctl = EnrollmentController::new(self.plan.clone());
        ctl.handle(EnrollEvent::Start);
        observe(&ctl.status());

        let result = self.drive(&mut ctl, &clock, cancel, &mut observe).await;
        if let Err(FlowError::Cancelled) = result {
            ctl.handle(EnrollEvent::Cancel);
            observe(&ctl.status());
        }
        result
    }

    async fn drive<O>(
        &self,
        ctl: &mut EnrollmentController,
        clock: &FlowClock,
        cancel: &CancellationToken,
        observe: &mut O,
    ) -> Result<usize, FlowError>
    where
        O: FnMut(&EnrollStatus),
    {
        let mut analyzer = match until_cancelled(cancel, self.models.load()).await? {
            Ok(analyzer) => analyzer,
            Err(err) => {
                ctl.handle(EnrollEvent::ModelsFailed(err.to_string()));
                observe(&ctl.status());
                return Err(FlowError::ModelLoad(err));
            }
        };
        ctl.handle(EnrollEvent::ModelsLoaded);
        observe(&ctl.status());

        let mut stream = match until_cancelled(cancel, self.camera.open(&self.options.camera)).await? {
            Ok(stream) => stream,
            Err(err) => {
                ctl.handle(EnrollEvent::CameraFailed(err.clone()));
                observe(&ctl.status());
                return Err(FlowError::Camera(err));
            }
        };
        ctl.handle(EnrollEvent::CameraReady);
        observe(&ctl.status());

        let period = Duration::from_millis(self.plan.sample_interval_ms.max(1));
        let mut ticker = Ticker::new(period, cancel.clone());

        while ticker.tick().await.is_some() {
            let frame = match stream.grab() {
                Ok(frame) => Some(frame),
                Err(err) => {
                    tracing::warn!(error = %err, "enroll: frame grab failed");
                    None
                }
            };
            let pose = match &frame {
                Some(frame) => sample_pose(&mut analyzer, frame, cancel).await?,
                None => None,
            };

            let action = ctl.handle(EnrollEvent::PoseSampled {
                pose,
                at_ms: clock.now_ms(),
            });
            observe(&ctl.status());

            let (Some(EnrollAction::Capture { step }), Some(frame)) = (action, frame) else {
                continue;
            };
            let event = self.capture(&mut analyzer, &frame, step, cancel).await?;
            let action = ctl.handle(event);
            observe(&ctl.status());

            let Some(EnrollAction::Submit(descriptors)) = action else {
                continue;
            };
            let event = match until_cancelled(cancel, self.backend.submit_enrollment(&descriptors)).await? {
                Ok(stored) => EnrollEvent::Submitted(stored),
                Err(err) => {
                    tracing::warn!(error = %err, "enroll: submission failed");
                    EnrollEvent::SubmitFailed(SUBMIT_FAILED.to_string())
                }
            };
            ctl.handle(event);
            observe(&ctl.status());

            if let EnrollPhase::Success { stored } = ctl.phase() {
                return Ok(stored);
            }
        }

        Err(FlowError::Cancelled)
    }

    async fn capture(
        &self,
        analyzer: &mut L::Analyzer,
        frame: &Frame,
        step: usize,
        cancel: &CancellationToken,
    ) -> Result<EnrollEvent, FlowError> {
        let prepared = prepare_capture(frame, &self.options, self.preprocessor.as_ref());
        let event = match until_cancelled(cancel, analyzer.detect(&prepared)).await? {
            Ok(Some(detection)) => EnrollEvent::Captured(detection.descriptor),
            Ok(None) => {
                tracing::info!(step, "enroll: no face in capture frame");
                EnrollEvent::CaptureFailed(NO_FACE_AT_CAPTURE.to_string())
            }
            Err(err) => {
                tracing::warn!(step, error = %err, "enroll: descriptor extraction failed");
                EnrollEvent::CaptureFailed(NO_FACE_AT_CAPTURE.to_string())
            }
        };
        Ok(event)
    }
}

async fn sample_pose<A: FaceAnalyzer>(
    analyzer: &mut A,
    frame: &Frame,
    cancel: &CancellationToken,
) -> Result<Option<Pose>, FlowError> {
    match until_cancelled(cancel, analyzer.landmarks(frame)).await? {
        Ok(landmarks) => Ok(landmarks.as_ref().map(pose_from_landmarks)),
        Err(err) => {
            tracing::debug!(error = %err, "enroll: landmark detection failed");
            Ok(None)
        }
    }
}
