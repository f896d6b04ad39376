use crate::{
    image::{Image, PixelLayout, Resizer, normalize_color, sample_plate_image},
    selector::{BoundingBox, Candidate, Candidates},
};
use anyhow::{Context, bail};
use ndarray::{Array, ArrayViewD, Axis, Ix2, s};
use ort::{session::Session, value::Tensor};
use std::{
    path::{Path, PathBuf},
    time::Instant,
};
use tracing::{debug, info};

/// Locates license plates in a decoded image.
///
/// Implementations may keep scratch buffers, so `detect` takes `&mut self`;
/// the pipeline worker is the only caller.
pub trait PlateDetector: Send {
    /// Layout the detector wants its input decoded into.
    fn input_layout(&self) -> PixelLayout;

    fn model_name(&self) -> &str;

    /// Returns every candidate above the detector's confidence threshold,
    /// in image coordinates. The boxes are not clamped.
    fn detect(&mut self, image: &Image) -> anyhow::Result<Candidates>;
}

#[derive(Debug, Clone)]
pub struct OnnxConfig {
    pub intra_threads: usize,
    pub inter_threads: usize,
}

impl Default for OnnxConfig {
    fn default() -> Self {
        Self {
            intra_threads: 192,
            inter_threads: 192,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub model: PathBuf,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub onnx_config: OnnxConfig,
}

const INPUT_SIZE: usize = 640;
/// Center x, center y, width, height and at least one class score.
const MIN_FEATURES: usize = 5;

/// YOLO style plate detector exported to ONNX.
///
/// Expects a single `[1, 3, 640, 640]` RGB input scaled to `[0, 1]` and a
/// `[1, 4 + classes, anchors]` output of center/size boxes followed by class
/// scores.
pub struct OnnxPlateDetector {
    session: Session,
    resizer: Resizer,
    input_name: String,
    confidence_threshold: f32,
    iou_threshold: f32,
    model_name: String,
}

impl OnnxPlateDetector {
    pub fn new(detector_config: DetectorConfig) -> anyhow::Result<Self> {
        let session = initialize_onnx(&detector_config.model, &detector_config.onnx_config)?;
        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .unwrap_or_else(|| "images".to_string());

        let mut detector = Self {
            session,
            resizer: Resizer::default(),
            input_name,
            confidence_threshold: detector_config.confidence_threshold,
            iou_threshold: detector_config.iou_threshold,
            model_name: model_name(&detector_config.model),
        };

        info!("Warming up the plate detector");
        let warmup_start_time = Instant::now();
        detector.detect(&sample_plate_image())?;
        info!(
            "Plate detector warmed up in: {:?}",
            warmup_start_time.elapsed()
        );

        Ok(detector)
    }
}

impl PlateDetector for OnnxPlateDetector {
    fn input_layout(&self) -> PixelLayout {
        PixelLayout::Rgb
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn detect(&mut self, image: &Image) -> anyhow::Result<Candidates> {
        let converted;
        let image = if image.layout == PixelLayout::Rgb {
            image
        } else {
            converted = normalize_color(image, PixelLayout::Rgb);
            &converted
        };

        let resize_factor_x = image.width as f32 / INPUT_SIZE as f32;
        let resize_factor_y = image.height as f32 / INPUT_SIZE as f32;

        let resize_image_start_time = Instant::now();
        let resized_image = self
            .resizer
            .resize_image(image, INPUT_SIZE, INPUT_SIZE)?;
        debug!("Resize image time: {:?}", resize_image_start_time.elapsed());

        let mut input = Array::zeros((1, 3, INPUT_SIZE, INPUT_SIZE));
        for (index, chunk) in resized_image.pixels.chunks_exact(3).enumerate() {
            let y = index / INPUT_SIZE;
            let x = index % INPUT_SIZE;
            input[[0, 0, y, x]] = chunk[0] as f32 / 255.0;
            input[[0, 1, y, x]] = chunk[1] as f32 / 255.0;
            input[[0, 2, y, x]] = chunk[2] as f32 / 255.0;
        }

        let start_inference_time = Instant::now();
        let input_value = Tensor::from_array(input).context("Failed to create input tensor")?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input_value])
            .context("Plate detection inference failed")?;
        debug!("Detector inference time: {:?}", start_inference_time.elapsed());

        let output = outputs[0]
            .try_extract_array::<f32>()
            .context("Failed to extract detector output")?;

        let candidates = post_process(
            output,
            self.confidence_threshold,
            resize_factor_x,
            resize_factor_y,
        )?;
        let candidates = non_maximum_suppression(candidates, self.iou_threshold);

        for (i, candidate) in candidates.iter().enumerate() {
            debug!("Plate candidate - {}: {:?}", i + 1, candidate);
        }

        Ok(candidates)
    }
}

fn post_process(
    output: ArrayViewD<'_, f32>,
    confidence_threshold: f32,
    resize_factor_x: f32,
    resize_factor_y: f32,
) -> anyhow::Result<Candidates> {
    if output.ndim() != 3 || output.shape()[0] != 1 {
        bail!("Unexpected detector output shape {:?}", output.shape());
    }
    let output = output.index_axis(Axis(0), 0).into_dimensionality::<Ix2>()?;
    // Features come first ([4 + classes, anchors]) unless the output is
    // anchor major, which shows as more rows than columns with a last axis
    // wide enough to hold a box and a score.
    let (rows, columns) = (output.shape()[0], output.shape()[1]);
    let output = if rows > columns && columns >= MIN_FEATURES {
        output.reversed_axes()
    } else {
        output
    };
    if output.shape()[0] < MIN_FEATURES {
        bail!(
            "Detector output has {} features per anchor, expected at least {MIN_FEATURES}",
            output.shape()[0]
        );
    }

    let mut candidates = Candidates::new();
    for anchor in output.columns() {
        let confidence = anchor
            .slice(s![4..])
            .iter()
            .copied()
            .fold(f32::NEG_INFINITY, f32::max);
        if confidence <= confidence_threshold {
            continue;
        }

        let x_center = anchor[0] * resize_factor_x;
        let y_center = anchor[1] * resize_factor_y;
        let width = anchor[2] * resize_factor_x;
        let height = anchor[3] * resize_factor_y;
        candidates.push(Candidate {
            bounding_box: BoundingBox {
                x1: (x_center - width / 2.0) as i32,
                y1: (y_center - height / 2.0) as i32,
                x2: (x_center + width / 2.0) as i32,
                y2: (y_center + height / 2.0) as i32,
            },
            confidence,
        });
    }

    Ok(candidates)
}

/// Drops candidates overlapping a more confident one by at least `iou_threshold`.
///
/// The sort is stable, so equally confident candidates keep their order.
fn non_maximum_suppression(mut candidates: Candidates, iou_threshold: f32) -> Candidates {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept = Candidates::new();
    for candidate in candidates {
        if kept
            .iter()
            .all(|k| calculate_iou(&candidate.bounding_box, &k.bounding_box) < iou_threshold)
        {
            kept.push(candidate);
        }
    }
    kept
}

fn calculate_iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let intersection = BoundingBox {
        x1: a.x1.max(b.x1),
        y1: a.y1.max(b.y1),
        x2: a.x2.min(b.x2),
        y2: a.y2.min(b.y2),
    }
    .area() as f32;
    let union = a.area() as f32 + b.area() as f32 - intersection;

    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Builds a CPU session for `model`, shared by the detector and the recognizer.
pub fn initialize_onnx(model: &Path, onnx_config: &OnnxConfig) -> anyhow::Result<Session> {
    let max_threads = num_cpus::get_physical().saturating_sub(1).max(1);
    let num_intra_threads = onnx_config.intra_threads.min(max_threads);
    let num_inter_threads = onnx_config.inter_threads.min(max_threads);
    info!(
        model = %model.display(),
        "Initializing ONNX session with {} intra and {} inter threads",
        num_intra_threads, num_inter_threads
    );

    let session = Session::builder()?
        .with_intra_threads(num_intra_threads)?
        .with_inter_threads(num_inter_threads)?
        .commit_from_file(model)
        .with_context(|| format!("Failed to load model {}", model.display()))?;
    Ok(session)
}

pub(crate) fn model_name(model: &Path) -> String {
    model
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| model.display().to_string())
}
