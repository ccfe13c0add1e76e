//! Pure landmark geometry: eye aspect ratio, head pose, frame-to-frame motion.

use serde::{Deserialize, Serialize};

use crate::types::{Landmarks, Point};

/// EAR reported when the eye contour is unusable. Sits above the blink
/// thresholds so a failed landmark pass reads as "eyes open".
pub const NEUTRAL_EAR: f32 = 0.5;

/// Normalised nose offset beyond which the head counts as turned.
pub const POSE_OFFSET_LIMIT: f32 = 0.2;

/// Coarse head orientation used by the enrollment protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pose {
    Center,
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    Horizontal,
    Vertical,
}

/// Coarse movement direction in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Displacement {
    pub magnitude: f32,
    pub axis: Axis,
    pub direction: Direction,
}

/// Eye aspect ratio for a six-point eye contour.
///
/// Points follow the 68-point convention: `p0`/`p3` are the horizontal
/// corners, `p1`/`p5` and `p2`/`p4` the upper/lower eyelid pairs.
/// `EAR = (|p1 - p5| + |p2 - p4|) / (2 |p0 - p3|)`.
///
/// Returns [`NEUTRAL_EAR`] for fewer than six points or a zero-width eye.
pub fn eye_aspect_ratio(eye: &[Point]) -> f32 {
    if eye.len() < 6 {
        return NEUTRAL_EAR;
    }
    let vertical_a = eye[1].distance(eye[5]);
    let vertical_b = eye[2].distance(eye[4]);
    let horizontal = eye[0].distance(eye[3]);
    if horizontal <= f32::EPSILON {
        return NEUTRAL_EAR;
    }
    (vertical_a + vertical_b) / (2.0 * horizontal)
}

/// Mean EAR over both eyes.
pub fn mean_eye_aspect_ratio(landmarks: &Landmarks) -> f32 {
    (eye_aspect_ratio(landmarks.left_eye()) + eye_aspect_ratio(landmarks.right_eye())) / 2.0
}

/// Signed nose offset relative to the eye line, normalised by eye span.
///
/// `None` when the required points are missing or the span is zero.
pub fn nose_offset(landmarks: &Landmarks) -> Option<f32> {
    let (left, right) = landmarks.outer_eye_corners()?;
    let nose = landmarks.nose_tip()?;
    let span = (right.x - left.x).abs();
    if span <= f32::EPSILON {
        return None;
    }
    let eye_center_x = (left.x + right.x) / 2.0;
    Some((nose.x - eye_center_x) / span)
}

/// Classify head pose from landmarks.
///
/// The ±[`POSE_OFFSET_LIMIT`] boundary is exclusive: an offset of exactly
/// 0.2 in either direction is `Center`. Degenerate landmarks are `Center`.
pub fn pose_from_landmarks(landmarks: &Landmarks) -> Pose {
    match nose_offset(landmarks) {
        Some(offset) if offset < -POSE_OFFSET_LIMIT => Pose::Left,
        Some(offset) if offset > POSE_OFFSET_LIMIT => Pose::Right,
        _ => Pose::Center,
    }
}

/// Motion between two positions of the same point.
///
/// Ties between the axes resolve to horizontal.
pub fn displacement(prev: Point, curr: Point) -> Displacement {
    let dx = curr.x - prev.x;
    let dy = curr.y - prev.y;
    let (axis, direction) = if dx.abs() >= dy.abs() {
        let dir = if dx < 0.0 { Direction::Left } else { Direction::Right };
        (Axis::Horizontal, dir)
    } else {
        let dir = if dy < 0.0 { Direction::Up } else { Direction::Down };
        (Axis::Vertical, dir)
    };
    Displacement {
        magnitude: prev.distance(curr),
        axis,
        direction,
    }
}
