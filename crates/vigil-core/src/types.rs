use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A captured camera frame.
pub type Frame = image::RgbImage;

/// Number of points produced by the landmark predictor.
pub const LANDMARK_COUNT: usize = 68;

// 68-point layout indices used by the pipeline.
const NOSE_TIP: usize = 30;
const LEFT_EYE: std::ops::Range<usize> = 36..42;
const RIGHT_EYE: std::ops::Range<usize> = 42..48;
const LEFT_EYE_OUTER: usize = 36;
const RIGHT_EYE_OUTER: usize = 45;

/// A 2D point in frame pixel coordinates (y grows downward).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(self, other: Point) -> f32 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Facial landmarks for one detected face.
///
/// Normally 68 points. Fewer points are tolerated: accessors return empty
/// slices or `None` instead of panicking, so a partial detection degrades
/// into neutral geometry rather than an error.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Landmarks {
    points: Vec<Point>,
}

impl Landmarks {
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn is_complete(&self) -> bool {
        self.points.len() >= LANDMARK_COUNT
    }

    pub fn left_eye(&self) -> &[Point] {
        self.points.get(LEFT_EYE).unwrap_or(&[])
    }

    pub fn right_eye(&self) -> &[Point] {
        self.points.get(RIGHT_EYE).unwrap_or(&[])
    }

    pub fn nose_tip(&self) -> Option<Point> {
        self.points.get(NOSE_TIP).copied()
    }

    /// Outer corners of the left and right eye.
    pub fn outer_eye_corners(&self) -> Option<(Point, Point)> {
        Some((
            *self.points.get(LEFT_EYE_OUTER)?,
            *self.points.get(RIGHT_EYE_OUTER)?,
        ))
    }
}

/// Fixed-length face embedding produced by the descriptor network.
///
/// Immutable once produced: there is no mutable access to the values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FaceDescriptor(Vec<f32>);

impl FaceDescriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }

    /// Euclidean distance, or `None` if the dimensions differ.
    pub fn distance(&self, other: &FaceDescriptor) -> Option<f32> {
        if self.0.len() != other.0.len() {
            return None;
        }
        let sum: f32 = self
            .0
            .iter()
            .zip(&other.0)
            .map(|(a, b)| (a - b) * (a - b))
            .sum();
        Some(sum.sqrt())
    }
}

/// Output of a full detection: landmarks plus descriptor for the best face.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub landmarks: Landmarks,
    pub descriptor: FaceDescriptor,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("an enrolled profile needs at least one descriptor")]
pub struct EmptyProfile;

/// Ordered, non-empty descriptor set belonging to one identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrolledProfile {
    descriptors: Vec<FaceDescriptor>,
}

impl EnrolledProfile {
    pub fn new(descriptors: Vec<FaceDescriptor>) -> Result<Self, EmptyProfile> {
        if descriptors.is_empty() {
            return Err(EmptyProfile);
        }
        Ok(Self { descriptors })
    }

    pub fn descriptors(&self) -> &[FaceDescriptor] {
        &self.descriptors
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
