//! vigil-core: biometric second-factor gate.
//!
//! Guided multi-pose face enrollment and a blink + head-movement liveness
//! challenge, built on top of an injected face model. The controllers are
//! plain state machines fed with timestamped events; the [`flow`] module is
//! the async adapter that owns the camera, the sampling timer and the
//! cancellation token around them.

pub mod enrollment;
pub mod flow;
pub mod geometry;
pub mod liveness;
pub mod matcher;
pub mod preprocess;
pub mod provider;
pub mod ticker;
pub mod types;
pub mod verification;

pub use enrollment::{EnrollStatus, EnrollmentController, EnrollmentPlan, PoseStep};
pub use flow::{CaptureOptions, EnrollmentFlow, FlowError, VerificationFlow};
pub use geometry::{Direction, Pose};
pub use liveness::{LivenessEvidence, LivenessPolicy, LivenessSession, LivenessViolation};
pub use matcher::{EuclideanMatcher, MatchError, MatchResult, Matcher};
pub use provider::{
    CameraError, CameraRequest, EnrollmentBackend, FaceAnalyzer, FrameSource, FrameStream,
    ManifestLoader, ModelError, ModelLoader, RejectReason, Rejection, SessionGrant, SubmitError,
    VerificationBackend, VerificationRequest,
};
pub use types::{Detection, EnrolledProfile, FaceDescriptor, Frame, Landmarks, Point};
pub use verification::{VerificationController, VerifyStatus};
