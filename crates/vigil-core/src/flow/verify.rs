use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{prepare_capture, until_cancelled, CaptureOptions, FlowClock, FlowError};
use crate::liveness::LivenessPolicy;
use crate::preprocess::{LightingNormalizer, Preprocess};
use crate::provider::{
    FaceAnalyzer, FrameSource, FrameStream, ModelLoader, SessionGrant, VerificationBackend,
    VerificationRequest,
};
use crate::ticker::Ticker;
use crate::types::Landmarks;
use crate::verification::{VerificationController, VerifyAction, VerifyEvent, VerifyPhase, VerifyStatus};

const NO_FACE_AT_EXTRACTION: &str = "Face lost. Look at the camera.";

/// Drives the liveness challenge for one challenge token and exchanges the
/// result for a session.
pub struct VerificationFlow<'a, L, S, B> {
    models: &'a L,
    camera: &'a S,
    backend: &'a B,
    challenge_token: String,
    policy: LivenessPolicy,
    options: CaptureOptions,
    preprocessor: Box<dyn Preprocess + 'a>,
}

impl<'a, L, S, B> VerificationFlow<'a, L, S, B>
where
    L: ModelLoader,
    S: FrameSource,
    B: VerificationBackend,
{
    pub fn new(models: &'a L, camera: &'a S, backend: &'a B, challenge_token: impl Into<String>) -> Self {
        Self {
            models,
            camera,
            backend,
            challenge_token: challenge_token.into(),
            policy: LivenessPolicy::default(),
            options: CaptureOptions::default(),
            preprocessor: Box::new(LightingNormalizer::default()),
        }
    }

    pub fn with_policy(mut self, policy: LivenessPolicy) -> Self {
        self.policy = policy;
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

    /// Run the challenge until the server grants a session, the challenge
    /// times out, the server refuses for good, or `cancel` fires.
    ///
    /// A face mismatch or insufficient liveness restarts the challenge from
    /// zero on the same camera stream. Every run starts with a fresh
    /// liveness session.
    pub async fn run<O>(&self, cancel: &CancellationToken, mut observe: O) -> Result<SessionGrant, FlowError>
    where
        O: FnMut(&VerifyStatus),
    {
        let clock = FlowClock::start();
        let mut ctl = VerificationController::new(self.policy.clone());
        ctl.handle(VerifyEvent::Start);
        observe(&ctl.status());

        let result = self.drive(&mut ctl, &clock, cancel, &mut observe).await;
        if let Err(FlowError::Cancelled) = result {
            ctl.handle(VerifyEvent::Cancel);
            observe(&ctl.status());
        }
        result
    }

    async fn drive<O>(
        &self,
        ctl: &mut VerificationController,
        clock: &FlowClock,
        cancel: &CancellationToken,
        observe: &mut O,
    ) -> Result<SessionGrant, FlowError>
    where
        O: FnMut(&VerifyStatus),
    {
        let mut analyzer = match until_cancelled(cancel, self.models.load()).await? {
            Ok(analyzer) => analyzer,
            Err(err) => {
                ctl.handle(VerifyEvent::ModelsFailed(err.to_string()));
                observe(&ctl.status());
                return Err(FlowError::ModelLoad(err));
            }
        };
        ctl.handle(VerifyEvent::ModelsLoaded);
        observe(&ctl.status());

        let mut stream = match until_cancelled(cancel, self.camera.open(&self.options.camera)).await? {
            Ok(stream) => stream,
            Err(err) => {
                ctl.handle(VerifyEvent::CameraFailed(err.clone()));
                observe(&ctl.status());
                return Err(FlowError::Camera(err));
            }
        };
        ctl.handle(VerifyEvent::CameraReady { at_ms: clock.now_ms() });
        observe(&ctl.status());

        let period = Duration::from_millis(self.policy.sample_interval_ms.max(1));
        let mut ticker = Ticker::new(period, cancel.clone());

        while ticker.tick().await.is_some() {
            let landmarks = self.sample(&mut analyzer, &mut stream, cancel).await?;
            let action = ctl.handle(VerifyEvent::Sampled {
                landmarks,
                at_ms: clock.now_ms(),
            });
            observe(&ctl.status());

            if ctl.phase() == VerifyPhase::TimedOut {
                return Err(FlowError::TimedOut);
            }
            if action != Some(VerifyAction::Extract) {
                continue;
            }

            let event = self.extract(&mut analyzer, &mut stream, clock, cancel).await?;
            let action = ctl.handle(event);
            observe(&ctl.status());

            let Some(VerifyAction::Submit { descriptor, evidence }) = action else {
                continue;
            };
            let request = VerificationRequest {
                challenge_token: self.challenge_token.clone(),
                descriptor,
                liveness: evidence,
            };
            match until_cancelled(cancel, self.backend.submit_verification(request)).await? {
                Ok(grant) => {
                    ctl.handle(VerifyEvent::Accepted(grant.clone()));
                    observe(&ctl.status());
                    return Ok(grant);
                }
                Err(rejection) => {
                    ctl.handle(VerifyEvent::Rejected {
                        rejection: rejection.clone(),
                        at_ms: clock.now_ms(),
                    });
                    observe(&ctl.status());
                    if ctl.phase() == VerifyPhase::Failed {
                        return Err(FlowError::Rejected(rejection));
                    }
                }
            }
        }

        Err(FlowError::Cancelled)
    }

    async fn sample(
        &self,
        analyzer: &mut L::Analyzer,
        stream: &mut S::Stream,
        cancel: &CancellationToken,
    ) -> Result<Option<Landmarks>, FlowError> {
        let frame = match stream.grab() {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(error = %err, "verify: frame grab failed");
                return Ok(None);
            }
        };
        match until_cancelled(cancel, analyzer.landmarks(&frame)).await? {
            Ok(landmarks) => Ok(landmarks),
            Err(err) => {
                tracing::debug!(error = %err, "verify: landmark detection failed");
                Ok(None)
            }
        }
    }

    async fn extract(
        &self,
        analyzer: &mut L::Analyzer,
        stream: &mut S::Stream,
        clock: &FlowClock,
        cancel: &CancellationToken,
    ) -> Result<VerifyEvent, FlowError> {
        let frame = match stream.grab() {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(error = %err, "verify: extraction frame grab failed");
                return Ok(VerifyEvent::ExtractionFailed(NO_FACE_AT_EXTRACTION.to_string()));
            }
        };
        let prepared = prepare_capture(&frame, &self.options, self.preprocessor.as_ref());
        let event = match until_cancelled(cancel, analyzer.detect(&prepared)).await? {
            Ok(Some(detection)) => VerifyEvent::Extracted {
                descriptor: detection.descriptor,
                at_ms: clock.now_ms(),
            },
            Ok(None) => VerifyEvent::ExtractionFailed(NO_FACE_AT_EXTRACTION.to_string()),
            Err(err) => {
                tracing::warn!(error = %err, "verify: descriptor extraction failed");
                VerifyEvent::ExtractionFailed(NO_FACE_AT_EXTRACTION.to_string())
            }
        };
        Ok(event)
    }
}
