use crate::pipeline::PipelineResult;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Default, Debug)]
pub struct ProcessImageRequest {
    pub image_data: Bytes,
    /// Upload file name, used when saving debug images.
    pub image_name: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlateStatus {
    Success,
    NotDetected,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProcessImageResponse {
    pub status: PlateStatus,
    /// Recognized text, `None` when no plate was found.
    pub plate_text: Option<String>,
    /// `[x1, y1, x2, y2]` in pixels of the uploaded image.
    pub bounding_box: Option<[i32; 4]>,
    /// Detector confidence of the selected plate, 0.0 when none was found.
    pub confidence: f32,
}

impl From<PipelineResult> for ProcessImageResponse {
    fn from(result: PipelineResult) -> Self {
        match result {
            PipelineResult::Detected {
                text,
                bounding_box,
                confidence,
            } => Self {
                status: PlateStatus::Success,
                plate_text: Some(text),
                bounding_box: Some(bounding_box.into()),
                confidence,
            },
            PipelineResult::NotDetected => Self {
                status: PlateStatus::NotDetected,
                plate_text: None,
                bounding_box: None,
                confidence: 0.0,
            },
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub models_loaded: bool,
}

impl HealthResponse {
    pub fn new(models_loaded: bool) -> Self {
        Self {
            status: if models_loaded {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            models_loaded,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub detail: String,
}
