use crate::{
    detector::{OnnxConfig, initialize_onnx, model_name},
    image::{Image, PixelLayout, Resizer, normalize_color, sample_plate_image},
};
use anyhow::{Context, bail};
use ndarray::{Array, ArrayView2, ArrayViewD, Axis, Ix2};
use ort::{session::Session, value::Tensor};
use std::{
    path::{Path, PathBuf},
    time::Instant,
};
use tracing::{debug, info};

/// Reads the text in a cropped plate image.
pub trait TextRecognizer: Send {
    /// Layout the recognizer wants its input in.
    fn input_layout(&self) -> PixelLayout;

    fn model_name(&self) -> &str;

    fn recognize(&mut self, image: &Image) -> anyhow::Result<String>;
}

#[derive(Debug, Clone)]
pub struct RecognizerConfig {
    pub model: PathBuf,
    pub dictionary: PathBuf,
    pub onnx_config: OnnxConfig,
}

const INPUT_HEIGHT: usize = 48;
const MAX_INPUT_WIDTH: usize = 320;
const MIN_INPUT_WIDTH: usize = 8;

/// CTC text recognition model (PaddleOCR style) exported to ONNX.
///
/// Input is `[1, 3, 48, W]` in BGR order normalized to `[-1, 1]`, output is
/// `[1, T, classes]` where class 0 is the CTC blank and class `i` maps to
/// line `i` of the dictionary file.
pub struct OnnxTextRecognizer {
    session: Session,
    resizer: Resizer,
    dictionary: Vec<char>,
    input_name: String,
    model_name: String,
}

impl OnnxTextRecognizer {
    pub fn new(recognizer_config: RecognizerConfig) -> anyhow::Result<Self> {
        let dictionary = load_dictionary(&recognizer_config.dictionary)?;
        info!(
            "Loaded character dictionary with {} characters",
            dictionary.len() - 1
        );

        let session = initialize_onnx(&recognizer_config.model, &recognizer_config.onnx_config)?;
        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .unwrap_or_else(|| "x".to_string());

        let mut recognizer = Self {
            session,
            resizer: Resizer::default(),
            dictionary,
            input_name,
            model_name: model_name(&recognizer_config.model),
        };

        info!("Warming up the text recognizer");
        let warmup_start_time = Instant::now();
        let sample = normalize_color(&sample_plate_image(), PixelLayout::Bgr);
        recognizer.recognize(&sample)?;
        info!(
            "Text recognizer warmed up in: {:?}",
            warmup_start_time.elapsed()
        );

        Ok(recognizer)
    }
}

impl TextRecognizer for OnnxTextRecognizer {
    fn input_layout(&self) -> PixelLayout {
        PixelLayout::Bgr
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn recognize(&mut self, image: &Image) -> anyhow::Result<String> {
        if image.layout != PixelLayout::Bgr {
            bail!("Recognizer expects BGR input, got {}", image.layout);
        }

        let width = input_width(image.width, image.height);
        let resized_image = self.resizer.resize_image(image, width, INPUT_HEIGHT)?;

        let mut input = Array::zeros((1, 3, INPUT_HEIGHT, width));
        for (index, chunk) in resized_image.pixels.chunks_exact(3).enumerate() {
            let y = index / width;
            let x = index % width;
            for (c, &value) in chunk.iter().enumerate() {
                input[[0, c, y, x]] = (value as f32 / 255.0 - 0.5) / 0.5;
            }
        }

        let start_inference_time = Instant::now();
        let input_value = Tensor::from_array(input).context("Failed to create input tensor")?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input_value])
            .context("Text recognition inference failed")?;
        debug!(
            "Recognizer inference time: {:?}",
            start_inference_time.elapsed()
        );

        let output = outputs[0]
            .try_extract_array::<f32>()
            .context("Failed to extract recognizer output")?;
        let probabilities = sequence_view(output)?;
        let text = ctc_greedy_decode(probabilities, &self.dictionary);
        debug!(%text, "Recognized text");
        Ok(text)
    }
}

/// Keeps the aspect ratio at a fixed height of 48, within `[8, 320]`.
fn input_width(width: usize, height: usize) -> usize {
    if height == 0 {
        return MIN_INPUT_WIDTH;
    }
    let scaled = (width as f32 * INPUT_HEIGHT as f32 / height as f32).ceil() as usize;
    scaled.clamp(MIN_INPUT_WIDTH, MAX_INPUT_WIDTH)
}

fn sequence_view(output: ArrayViewD<'_, f32>) -> anyhow::Result<ArrayView2<'_, f32>> {
    match output.ndim() {
        3 if output.shape()[0] == 1 => Ok(output.index_axis_move(Axis(0), 0).into_dimensionality::<Ix2>()?),
        2 => Ok(output.into_dimensionality::<Ix2>()?),
        _ => bail!("Unexpected recognizer output shape {:?}", output.shape()),
    }
}

/// Best path decoding: argmax per step, collapse repeats, drop blanks (class 0).
fn ctc_greedy_decode(probabilities: ArrayView2<'_, f32>, dictionary: &[char]) -> String {
    let mut text = String::new();
    let mut previous = 0;
    for step in probabilities.outer_iter() {
        let best = step
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(index, _)| index)
            .unwrap_or(0);
        if best != 0 && best != previous {
            if let Some(&ch) = dictionary.get(best) {
                text.push(ch);
            }
        }
        previous = best;
    }
    text.trim().to_string()
}

/// One character per line; index 0 is reserved for the CTC blank and a
/// trailing space class is appended, as the PaddleOCR exports expect.
fn load_dictionary(path: &Path) -> anyhow::Result<Vec<char>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read dictionary {}", path.display()))?;
    parse_dictionary(&contents)
        .with_context(|| format!("Invalid dictionary {}", path.display()))
}

/// Line `i` is class `i + 1`, so every line must hold exactly one character.
fn parse_dictionary(contents: &str) -> anyhow::Result<Vec<char>> {
    let mut dictionary = vec!['\0'];
    for (index, line) in contents.lines().enumerate() {
        let mut chars = line.trim_end_matches('\r').chars();
        match (chars.next(), chars.next()) {
            (Some(ch), None) => dictionary.push(ch),
            (None, _) => bail!("Line {} is empty", index + 1),
            (Some(_), Some(_)) => bail!("Line {} holds more than one character", index + 1),
        }
    }
    dictionary.push(' ');
    Ok(dictionary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn one_hot(classes: &[usize], num_classes: usize) -> Array2<f32> {
        let mut probabilities = Array2::zeros((classes.len(), num_classes));
        for (step, &class) in classes.iter().enumerate() {
            probabilities[[step, class]] = 0.9;
        }
        probabilities
    }

    #[test]
    fn decode_collapses_repeats_and_drops_blanks() {
        let dictionary = parse_dictionary("A\nB\n1\n").unwrap();
        // blank, A, A, blank, A, B, B, 1
        let probabilities = one_hot(&[0, 1, 1, 0, 1, 2, 2, 3], dictionary.len());
        assert_eq!(ctc_greedy_decode(probabilities.view(), &dictionary), "AAB1");
    }

    #[test]
    fn decode_all_blank_is_empty() {
        let dictionary = parse_dictionary("A\n").unwrap();
        let probabilities = one_hot(&[0, 0, 0], dictionary.len());
        assert_eq!(ctc_greedy_decode(probabilities.view(), &dictionary), "");
    }

    #[test]
    fn decode_ignores_classes_outside_dictionary() {
        let dictionary = parse_dictionary("A\n").unwrap();
        let probabilities = one_hot(&[1, 5, 1], 6);
        assert_eq!(ctc_greedy_decode(probabilities.view(), &dictionary), "AA");
    }

    #[test]
    fn dictionary_reserves_blank_and_space() {
        let dictionary = parse_dictionary("0\r\n1\r\nB\nZ").unwrap();
        assert_eq!(dictionary, vec!['\0', '0', '1', 'B', 'Z', ' ']);
    }

    #[test]
    fn dictionary_rejects_lines_that_would_shift_classes() {
        let err = parse_dictionary("0\n1\n\nZ").unwrap_err();
        assert_eq!(err.to_string(), "Line 3 is empty");
        assert!(parse_dictionary("0\nAB\n").is_err());
        // A space is a character like any other.
        assert_eq!(parse_dictionary(" \n").unwrap(), vec!['\0', ' ', ' ']);
    }

    #[test]
    fn sequence_view_accepts_batched_and_flat_output() {
        let batched = ndarray::Array3::<f32>::zeros((1, 4, 7));
        assert_eq!(sequence_view(batched.view().into_dyn()).unwrap().shape(), &[4, 7]);
        let flat = Array2::<f32>::zeros((4, 7));
        assert_eq!(sequence_view(flat.view().into_dyn()).unwrap().shape(), &[4, 7]);
        let batch_of_two = ndarray::Array3::<f32>::zeros((2, 4, 7));
        assert!(sequence_view(batch_of_two.view().into_dyn()).is_err());
    }

    #[test]
    fn input_width_keeps_aspect_ratio() {
        assert_eq!(input_width(154, 40), 185);
        assert_eq!(input_width(1000, 10), MAX_INPUT_WIDTH);
        assert_eq!(input_width(2, 100), MIN_INPUT_WIDTH);
        assert_eq!(input_width(10, 0), MIN_INPUT_WIDTH);
    }
}
