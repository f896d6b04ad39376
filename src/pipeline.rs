//! Plate reading pipeline: decode, detect, select, crop, normalize, recognize.

use crate::{
    api::ProcessImageRequest,
    detector::PlateDetector,
    image::{
        Image, ImageError, create_plate_image_name, crop, decode_image,
        encode_maybe_draw_boundary_box_and_save_jpeg, normalize_color, to_luma,
    },
    recognizer::TextRecognizer,
    selector::{BoundingBox, select_best_candidate},
};
use std::{
    path::{Path, PathBuf},
    time::Instant,
};
use thiserror::Error;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineResult {
    Detected {
        text: String,
        bounding_box: BoundingBox,
        confidence: f32,
    },
    NotDetected,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The upload is not an image we can decode. The client's fault.
    #[error(transparent)]
    Decode(#[from] ImageError),

    /// Detection or recognition failed.
    #[error("{0:#}")]
    Internal(anyhow::Error),
}

#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    /// Convert the crop to grayscale before recognition.
    pub grayscale_crop: bool,
    pub save_image_path: Option<PathBuf>,
    pub save_ref_image: bool,
}

#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub detector_model: String,
    pub recognizer_model: String,
}

pub struct Pipeline {
    detector: Box<dyn PlateDetector>,
    recognizer: Box<dyn TextRecognizer>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        detector: Box<dyn PlateDetector>,
        recognizer: Box<dyn TextRecognizer>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            detector,
            recognizer,
            config,
        }
    }

    pub fn model_info(&self) -> ModelInfo {
        ModelInfo {
            detector_model: self.detector.model_name().to_string(),
            recognizer_model: self.recognizer.model_name().to_string(),
        }
    }

    pub fn process_image(
        &mut self,
        request: ProcessImageRequest,
    ) -> Result<PipelineResult, PipelineError> {
        let ProcessImageRequest {
            image_data,
            image_name,
        } = request;

        let processing_time_start = Instant::now();
        let decoded_image =
            decode_image(image_name, &image_data, self.detector.input_layout())?;
        debug!(
            "Decode image time: {:?}, {}",
            processing_time_start.elapsed(),
            decoded_image
        );

        let result = self.read_plate(&decoded_image).map_err(|err| {
            error!(error = ?err, image = %decoded_image, "Plate reading failed");
            PipelineError::Internal(err)
        })?;

        if let Some(save_image_path) = self.config.save_image_path.as_ref() {
            if let Err(err) = self.save_images(save_image_path, &decoded_image, &image_data, &result)
            {
                warn!(error = ?err, "Failed to save images");
            }
        }

        debug!("Processing time: {:?}", processing_time_start.elapsed());
        Ok(result)
    }

    fn read_plate(&mut self, image: &Image) -> anyhow::Result<PipelineResult> {
        let detection_start_time = Instant::now();
        let candidates = self.detector.detect(image)?;
        debug!(
            "Detection time: {:?}, {} candidates",
            detection_start_time.elapsed(),
            candidates.len()
        );

        let Some(best) = select_best_candidate(&candidates, image.width, image.height) else {
            return Ok(PipelineResult::NotDetected);
        };

        let plate = crop(image, &best.bounding_box)?;
        let plate = if self.config.grayscale_crop {
            to_luma(&plate)
        } else {
            plate
        };
        let plate = normalize_color(&plate, self.recognizer.input_layout());

        let recognition_start_time = Instant::now();
        let text = self.recognizer.recognize(&plate)?;
        debug!("Recognition time: {:?}", recognition_start_time.elapsed());

        Ok(PipelineResult::Detected {
            text,
            bounding_box: best.bounding_box,
            confidence: best.confidence,
        })
    }

    fn save_images(
        &self,
        save_image_path: &Path,
        image: &Image,
        image_data: &[u8],
        result: &PipelineResult,
    ) -> anyhow::Result<()> {
        let Some(image_name) = image.name.as_deref() else {
            return Ok(());
        };

        if self.config.save_ref_image {
            let file_name = Path::new(image_name)
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("Failed to get file name from {image_name}"))?;
            std::fs::write(save_image_path.join(file_name), image_data)?;
        }

        let bounding_box = match result {
            PipelineResult::Detected { bounding_box, .. } => Some(bounding_box),
            PipelineResult::NotDetected => None,
        };
        encode_maybe_draw_boundary_box_and_save_jpeg(
            image,
            &save_image_path.join(create_plate_image_name(image_name)?),
            bounding_box,
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::{
        image::{PixelLayout, SAMPLE_PLATE_REGION, encode_jpeg, sample_plate_image},
        selector::{Candidate, Candidates},
    };
    use std::sync::{Arc, Mutex};

    /// Returns a fixed candidate list and records the images it was given.
    pub(crate) struct StubDetector {
        pub candidates: Vec<Candidate>,
        pub seen: Arc<Mutex<Vec<(usize, usize, PixelLayout)>>>,
        pub fail: bool,
    }

    impl StubDetector {
        pub(crate) fn returning(candidates: Vec<Candidate>) -> Self {
            Self {
                candidates,
                seen: Arc::default(),
                fail: false,
            }
        }
    }

    impl PlateDetector for StubDetector {
        fn input_layout(&self) -> PixelLayout {
            PixelLayout::Rgb
        }

        fn model_name(&self) -> &str {
            "stub-detector"
        }

        fn detect(&mut self, image: &Image) -> anyhow::Result<Candidates> {
            self.seen
                .lock()
                .unwrap()
                .push((image.width, image.height, image.layout));
            if self.fail {
                anyhow::bail!("detector exploded");
            }
            Ok(self.candidates.iter().copied().collect())
        }
    }

    /// Returns fixed text and records the crops it was given.
    pub(crate) struct StubRecognizer {
        pub text: String,
        pub seen: Arc<Mutex<Vec<Image>>>,
        pub fail: bool,
    }

    impl StubRecognizer {
        pub(crate) fn returning(text: &str) -> Self {
            Self {
                text: text.to_string(),
                seen: Arc::default(),
                fail: false,
            }
        }
    }

    impl TextRecognizer for StubRecognizer {
        fn input_layout(&self) -> PixelLayout {
            PixelLayout::Bgr
        }

        fn model_name(&self) -> &str {
            "stub-recognizer"
        }

        fn recognize(&mut self, image: &Image) -> anyhow::Result<String> {
            self.seen.lock().unwrap().push(image.clone());
            if self.fail {
                anyhow::bail!("recognizer exploded on {}x{}", image.width, image.height);
            }
            Ok(self.text.clone())
        }
    }

    pub(crate) fn plate_candidate(confidence: f32) -> Candidate {
        Candidate {
            bounding_box: SAMPLE_PLATE_REGION,
            confidence,
        }
    }

    pub(crate) fn sample_jpeg() -> Bytes {
        Bytes::from(encode_jpeg(&sample_plate_image(), 95).unwrap())
    }

    fn request(image_data: Bytes) -> ProcessImageRequest {
        ProcessImageRequest {
            image_data,
            image_name: Some("test_image.jpg".to_string()),
        }
    }

    fn pipeline(detector: StubDetector, recognizer: StubRecognizer) -> Pipeline {
        Pipeline::new(
            Box::new(detector),
            Box::new(recognizer),
            PipelineConfig::default(),
        )
    }

    #[test]
    fn detected_plate_is_cropped_and_recognized() {
        let detector = StubDetector::returning(vec![plate_candidate(0.9)]);
        let recognizer = StubRecognizer::returning("B1234XYZ");
        let crops = recognizer.seen.clone();
        let mut pipeline = pipeline(detector, recognizer);

        let result = pipeline.process_image(request(sample_jpeg())).unwrap();
        assert_eq!(
            result,
            PipelineResult::Detected {
                text: "B1234XYZ".to_string(),
                bounding_box: SAMPLE_PLATE_REGION,
                confidence: 0.9,
            }
        );

        let crops = crops.lock().unwrap();
        assert_eq!(crops.len(), 1);
        assert_eq!((crops[0].width, crops[0].height), (154, 40));
        assert_eq!(crops[0].layout, PixelLayout::Bgr);
    }

    #[test]
    fn detector_sees_image_in_its_layout() {
        let detector = StubDetector::returning(vec![]);
        let seen = detector.seen.clone();
        let mut pipeline = pipeline(detector, StubRecognizer::returning("X"));

        pipeline.process_image(request(sample_jpeg())).unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), &[(300, 100, PixelLayout::Rgb)]);
    }

    #[test]
    fn no_candidates_is_not_detected() {
        let recognizer = StubRecognizer::returning("unused");
        let crops = recognizer.seen.clone();
        let mut pipeline = pipeline(StubDetector::returning(vec![]), recognizer);

        let result = pipeline.process_image(request(sample_jpeg())).unwrap();
        assert_eq!(result, PipelineResult::NotDetected);
        assert!(crops.lock().unwrap().is_empty());
    }

    #[test]
    fn degenerate_candidate_is_not_detected() {
        let outside = Candidate {
            bounding_box: [400, 10, 500, 50].into(),
            confidence: 0.95,
        };
        let mut pipeline = pipeline(
            StubDetector::returning(vec![outside]),
            StubRecognizer::returning("unused"),
        );
        let result = pipeline.process_image(request(sample_jpeg())).unwrap();
        assert_eq!(result, PipelineResult::NotDetected);
    }

    #[test]
    fn undecodable_bytes_are_a_decode_error() {
        let detector = StubDetector::returning(vec![plate_candidate(0.9)]);
        let seen = detector.seen.clone();
        let mut pipeline = pipeline(detector, StubRecognizer::returning("X"));

        let result = pipeline.process_image(request(Bytes::from_static(b"not an image")));
        assert!(matches!(result, Err(PipelineError::Decode(_))));

        let jpeg = sample_jpeg();
        let result = pipeline.process_image(request(jpeg.slice(..jpeg.len() / 3)));
        assert!(matches!(result, Err(PipelineError::Decode(_))));

        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn detector_failure_is_internal() {
        let mut detector = StubDetector::returning(vec![]);
        detector.fail = true;
        let mut pipeline = pipeline(detector, StubRecognizer::returning("X"));

        let err = pipeline.process_image(request(sample_jpeg())).unwrap_err();
        assert!(matches!(err, PipelineError::Internal(_)));
        assert_eq!(err.to_string(), "detector exploded");
    }

    #[test]
    fn recognizer_failure_is_internal() {
        let mut recognizer = StubRecognizer::returning("X");
        recognizer.fail = true;
        let mut pipeline = pipeline(StubDetector::returning(vec![plate_candidate(0.5)]), recognizer);

        let err = pipeline.process_image(request(sample_jpeg())).unwrap_err();
        assert!(matches!(err, PipelineError::Internal(_)));
    }

    #[test]
    fn grayscale_crop_is_replicated_to_three_channels() {
        let recognizer = StubRecognizer::returning("X");
        let crops = recognizer.seen.clone();
        let mut pipeline = Pipeline::new(
            Box::new(StubDetector::returning(vec![plate_candidate(0.5)])),
            Box::new(recognizer),
            PipelineConfig {
                grayscale_crop: true,
                ..Default::default()
            },
        );

        pipeline.process_image(request(sample_jpeg())).unwrap();
        let crops = crops.lock().unwrap();
        assert_eq!(crops[0].layout, PixelLayout::Bgr);
        assert!(
            crops[0]
                .pixels
                .chunks_exact(3)
                .all(|p| p[0] == p[1] && p[1] == p[2])
        );
    }

    #[test]
    fn saves_annotated_image() {
        let dir = std::env::temp_dir().join(format!("plate_scan_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut pipeline = Pipeline::new(
            Box::new(StubDetector::returning(vec![plate_candidate(0.5)])),
            Box::new(StubRecognizer::returning("X")),
            PipelineConfig {
                grayscale_crop: false,
                save_image_path: Some(dir.clone()),
                save_ref_image: true,
            },
        );

        pipeline.process_image(request(sample_jpeg())).unwrap();
        assert!(dir.join("test_image_plate.jpg").exists());
        assert_eq!(std::fs::read(dir.join("test_image.jpg")).unwrap(), sample_jpeg());
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn model_info_names_both_models() {
        let pipeline = pipeline(
            StubDetector::returning(vec![]),
            StubRecognizer::returning("X"),
        );
        let info = pipeline.model_info();
        assert_eq!(info.detector_model, "stub-detector");
        assert_eq!(info.recognizer_model, "stub-recognizer");
    }
}
