//! Capabilities the controllers depend on but do not implement: the face
//! model, the camera, and the two server submissions.
//!
//! Every method that may wait on the outside world is `async` so the flow
//! drivers can race it against a cancellation token.
#![allow(async_fn_in_trait)]

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vigil_models::ModelPaths;

use crate::liveness::LivenessEvidence;
use crate::types::{Detection, FaceDescriptor, Frame, Landmarks};

// ── Camera ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CameraError {
    #[error("camera permission denied")]
    PermissionDenied,
    #[error("camera unavailable: {0}")]
    Unavailable(String),
    #[error("frame capture failed: {0}")]
    Capture(String),
}

impl CameraError {
    /// Short text suitable for showing to the user.
    pub fn user_message(&self) -> &'static str {
        match self {
            CameraError::PermissionDenied => {
                "Camera access was denied. Allow camera access and try again."
            }
            CameraError::Unavailable(_) | CameraError::Capture(_) => {
                "The camera could not be started. Check that it is connected and not in use."
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    Front,
    Back,
}

/// Video stream request: preferred resolution and orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraRequest {
    pub width: u32,
    pub height: u32,
    pub facing: Facing,
}

impl Default for CameraRequest {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            facing: Facing::Front,
        }
    }
}

/// An open camera stream. Dropping it must stop every track and release the
/// device.
pub trait FrameStream {
    fn grab(&mut self) -> Result<Frame, CameraError>;
}

pub trait FrameSource {
    type Stream: FrameStream;

    async fn open(&self, request: &CameraRequest) -> Result<Self::Stream, CameraError>;
}

// ── Face model ───────────────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DetectError {
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error(transparent)]
    Integrity(#[from] vigil_models::ModelIntegrityError),
    #[error("failed to load {role} model: {reason}")]
    Load { role: &'static str, reason: String },
}

/// Loaded detector + landmark predictor + descriptor network.
pub trait FaceAnalyzer {
    /// Landmarks of the most prominent face, if any. Cheap enough to run on
    /// every sampling tick.
    async fn landmarks(&mut self, frame: &Frame) -> Result<Option<Landmarks>, DetectError>;

    /// Full detection including the descriptor.
    async fn detect(&mut self, frame: &Frame) -> Result<Option<Detection>, DetectError>;
}

pub trait ModelLoader {
    type Analyzer: FaceAnalyzer;

    async fn load(&self) -> Result<Self::Analyzer, ModelError>;
}

/// Loader that refuses to build an analyzer until all three artifacts in the
/// model directory's manifest are present and checksum-valid.
pub struct ManifestLoader<F> {
    model_dir: PathBuf,
    factory: F,
}

impl<F> ManifestLoader<F> {
    pub fn new(model_dir: impl Into<PathBuf>, factory: F) -> Self {
        Self {
            model_dir: model_dir.into(),
            factory,
        }
    }
}

impl<F, A> ModelLoader for ManifestLoader<F>
where
    F: Fn(&ModelPaths) -> Result<A, ModelError>,
    A: FaceAnalyzer,
{
    type Analyzer = A;

    async fn load(&self) -> Result<A, ModelError> {
        let paths = vigil_models::verify_models_dir(&self.model_dir)?;
        tracing::info!(
            detector = %paths.detector.display(),
            landmarks = %paths.landmarks.display(),
            recognizer = %paths.recognizer.display(),
            "model artifacts verified"
        );
        (self.factory)(&paths)
    }
}

// ── Server submissions ───────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("enrollment rejected: {0}")]
    Rejected(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

pub trait EnrollmentBackend {
    /// Persist the ordered descriptor set. Returns how many were stored.
    async fn submit_enrollment(&self, descriptors: &[FaceDescriptor]) -> Result<usize, SubmitError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRequest {
    pub challenge_token: String,
    pub descriptor: FaceDescriptor,
    pub liveness: LivenessEvidence,
}

/// Full session issued after a successful face check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionGrant {
    pub session_token: String,
    pub user: String,
    pub expires_at: DateTime<Utc>,
}

/// Why a verification was refused. Coarse on purpose: distances and
/// thresholds never cross this boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    FaceMismatch,
    LivenessInsufficient,
    InvalidToken,
    NotEnrolled,
    RateLimited,
    Internal,
}

impl RejectReason {
    /// Whether a fresh liveness challenge can still succeed.
    pub fn is_retryable(self) -> bool {
        matches!(self, RejectReason::FaceMismatch | RejectReason::LivenessInsufficient)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct Rejection {
    pub reason: RejectReason,
    pub message: String,
}

impl Rejection {
    pub fn new(reason: RejectReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

pub trait VerificationBackend {
    async fn submit_verification(
        &self,
        request: VerificationRequest,
    ) -> Result<SessionGrant, Rejection>;
}
