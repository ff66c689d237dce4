use serde::{Deserialize, Serialize};

/// Descriptor length produced by the 68-landmark recognition net.
pub const DEFAULT_DESCRIPTOR_DIM: usize = 128;

/// Default maximum Euclidean distance for a positive match.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Label used for detections that matched no registered face.
pub const UNKNOWN_LABEL: &str = "unknown";

/// Overlay text when nothing has been registered yet.
pub const UNREGISTERED_LABEL: &str = "Unregistered";

/// Face descriptor vector (typically 128-dimensional).
pub type Descriptor = Vec<f32>;

/// Bounding box for a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    #[serde(default)]
    pub confidence: f32,
}

/// One face found in a frame by the external detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    pub descriptor: Descriptor,
}

/// All descriptors registered under one label.
///
/// Field names match the persisted JSON shape exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledDescriptorSet {
    pub label: String,
    pub descriptors: Vec<Descriptor>,
}

impl LabeledDescriptorSet {
    pub fn new(label: impl Into<String>, descriptor: Descriptor) -> Self {
        Self {
            label: label.into(),
            descriptors: vec![descriptor],
        }
    }
}

/// Outcome of classifying one descriptor.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Nearest label within the threshold.
    Match { label: String, distance: f32 },
    /// Nothing within the threshold. `distance` is the best distance found,
    /// or infinity when there was nothing to compare against.
    Unknown { distance: f32 },
}

impl Verdict {
    pub fn unknown() -> Self {
        Verdict::Unknown {
            distance: f32::INFINITY,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Verdict::Match { label, .. } => label,
            Verdict::Unknown { .. } => UNKNOWN_LABEL,
        }
    }

    pub fn distance(&self) -> f32 {
        match self {
            Verdict::Match { distance, .. } | Verdict::Unknown { distance } => *distance,
        }
    }

    pub fn is_match(&self) -> bool {
        matches!(self, Verdict::Match { .. })
    }

    /// Overlay text in the `"Alice (0.42)"` form.
    pub fn display_label(&self) -> String {
        let distance = self.distance();
        if distance.is_finite() {
            format!("{} ({:.2})", self.label(), distance)
        } else {
            self.label().to_string()
        }
    }
}

/// Wire form of a verdict: `{"label": ..., "distance": ...}`.
///
/// An infinite distance serializes as `null`.
#[derive(Debug, Serialize)]
pub struct VerdictView<'a> {
    pub label: &'a str,
    pub distance: f32,
}

impl<'a> From<&'a Verdict> for VerdictView<'a> {
    fn from(verdict: &'a Verdict) -> Self {
        Self {
            label: verdict.label(),
            distance: verdict.distance(),
        }
    }
}

/// Euclidean distance between two descriptors of equal length.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt()
}

/// Why a descriptor was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorDefect {
    WrongLength { expected: usize, actual: usize },
    NonFinite { index: usize },
}

impl std::fmt::Display for DescriptorDefect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DescriptorDefect::WrongLength { expected, actual } => {
                write!(f, "expected {expected} components, got {actual}")
            }
            DescriptorDefect::NonFinite { index } => {
                write!(f, "component {index} is not a finite number")
            }
        }
    }
}

/// Check that a descriptor has the canonical length and only finite values.
pub fn check_descriptor(descriptor: &[f32], dim: usize) -> Result<(), DescriptorDefect> {
    if descriptor.len() != dim {
        return Err(DescriptorDefect::WrongLength {
            expected: dim,
            actual: descriptor.len(),
        });
    }
    match descriptor.iter().position(|v| !v.is_finite()) {
        Some(index) => Err(DescriptorDefect::NonFinite { index }),
        None => Ok(()),
    }
}
