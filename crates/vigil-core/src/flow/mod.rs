//! Async drivers around the enrollment and verification controllers.
//!
//! A flow owns everything with a lifetime: the loaded model, the camera
//! stream and the sampling [`Ticker`](crate::ticker::Ticker). They are all
//! locals of the driving future, so every exit path (success, failure,
//! cancellation, or the future simply being dropped) releases the camera and
//! stops the timer. Each suspension point is raced against the flow's
//! [`CancellationToken`].
//!
//! Per-frame detection errors never escape the sampling loop; they are
//! logged and folded into the controller as "no face this sample".

mod enroll;
mod verify;

pub use enroll::EnrollmentFlow;
pub use verify::VerificationFlow;

use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::preprocess::{mirror, Preprocess};
use crate::provider::{CameraError, CameraRequest, ModelError, Rejection};
use crate::types::Frame;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("cancelled")]
    Cancelled,
    #[error("model load failed: {0}")]
    ModelLoad(#[source] ModelError),
    #[error("camera error: {0}")]
    Camera(#[source] CameraError),
    #[error("liveness challenge timed out")]
    TimedOut,
    #[error("verification refused: {0}")]
    Rejected(#[source] Rejection),
}

/// Camera request and capture orientation shared by both flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureOptions {
    pub camera: CameraRequest,
    /// Mirror captured frames so descriptors match what the user saw in
    /// the mirrored preview. Applied to enrollment and verification alike.
    pub mirror_capture: bool,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            camera: CameraRequest::default(),
            mirror_capture: true,
        }
    }
}

/// Milliseconds since the flow started, on the runtime's clock.
struct FlowClock {
    origin: Instant,
}

impl FlowClock {
    fn start() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

async fn until_cancelled<F: Future>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, FlowError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(FlowError::Cancelled),
        out = fut => Ok(out),
    }
}

fn prepare_capture(frame: &Frame, options: &CaptureOptions, preprocessor: &dyn Preprocess) -> Frame {
    if options.mirror_capture {
        preprocessor.preprocess(&mirror(frame))
    } else {
        preprocessor.preprocess(frame)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::LightingNormalizer;
    use image::Rgb;

    #[test]
    fn capture_is_mirrored_before_preprocessing() {
        let frame = Frame::from_fn(2, 1, |x, _| if x == 0 { Rgb([0, 0, 0]) } else { Rgb([255, 255, 255]) });

        let mirrored = prepare_capture(&frame, &CaptureOptions::default(), &LightingNormalizer::default());
        assert_eq!(mirrored.get_pixel(0, 0).0, [255, 255, 255]);

        let options = CaptureOptions {
            mirror_capture: false,
            ..CaptureOptions::default()
        };
        let straight = prepare_capture(&frame, &options, &LightingNormalizer::default());
        assert_eq!(straight.get_pixel(0, 0).0, [0, 0, 0]);
    }
}
