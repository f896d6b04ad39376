use crate::selector::BoundingBox;
use anyhow::{anyhow, bail};
use image::{ImageBuffer, Rgb};
use jpeg_encoder::{ColorType, Encoder};
use std::{fmt, path::Path, time::Instant};
use thiserror::Error;
use tracing::{debug, info};
use zune_core::{colorspace::ColorSpace, options::DecoderOptions};
use zune_jpeg::JpegDecoder;

/// Order of the channels in `Image::pixels`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    Rgb,
    Bgr,
    Luma,
}

impl PixelLayout {
    pub fn channels(self) -> usize {
        match self {
            PixelLayout::Rgb | PixelLayout::Bgr => 3,
            PixelLayout::Luma => 1,
        }
    }
}

impl fmt::Display for PixelLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelLayout::Rgb => write!(f, "RGB"),
            PixelLayout::Bgr => write!(f, "BGR"),
            PixelLayout::Luma => write!(f, "Luma"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("Image data is empty")]
    Empty,

    #[error("Unsupported image format")]
    UnsupportedFormat,

    #[error("Failed to decode image: {0}")]
    DecodeFailed(String),
}

#[derive(Clone, PartialEq)]
pub struct Image {
    pub name: Option<String>,
    pub width: usize,
    pub height: usize,
    pub layout: PixelLayout,
    pub pixels: Vec<u8>,
}

impl Image {
    pub fn new(
        name: Option<String>,
        width: usize,
        height: usize,
        layout: PixelLayout,
        pixels: Vec<u8>,
    ) -> anyhow::Result<Self> {
        let expected = width * height * layout.channels();
        if pixels.len() != expected {
            bail!(
                "Pixel buffer has {} bytes, expected {} for {}x{} {}",
                pixels.len(),
                expected,
                width,
                height,
                layout
            );
        }
        Ok(Self {
            name,
            width,
            height,
            layout,
            pixels,
        })
    }

    pub fn channels(&self) -> usize {
        self.layout.channels()
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("name", &self.name)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}, Resolution: {}x{} {}",
            self.name, self.width, self.height, self.layout
        )
    }
}

/// Decodes an uploaded image into `layout`.
///
/// JPEG goes through zune-jpeg, every other supported format through the
/// `image` crate. The format is picked from the magic bytes, never from the
/// file name.
pub fn decode_image(
    name: Option<String>,
    bytes: &[u8],
    layout: PixelLayout,
) -> Result<Image, ImageError> {
    if bytes.is_empty() {
        return Err(ImageError::Empty);
    }

    let (width, height, rgb) = match bytes {
        [0xFF, 0xD8, 0xFF, ..] => decode_jpeg(bytes)?,
        _ => decode_other(bytes)?,
    };

    let pixels = match layout {
        PixelLayout::Rgb => rgb,
        PixelLayout::Bgr => swap_red_blue(&rgb),
        PixelLayout::Luma => rgb_to_luma(&rgb, PixelLayout::Rgb),
    };

    Image::new(name, width, height, layout, pixels)
        .map_err(|e| ImageError::DecodeFailed(e.to_string()))
}

fn decode_jpeg(jpeg: &[u8]) -> Result<(usize, usize, Vec<u8>), ImageError> {
    // zune-jpeg pads a cut off scan instead of failing
    if !has_end_of_image(jpeg) {
        return Err(ImageError::DecodeFailed(
            "JPEG data ends before the end of image marker".to_string(),
        ));
    }

    let options = DecoderOptions::default()
        .set_strict_mode(true)
        .jpeg_set_out_colorspace(ColorSpace::RGB);
    let mut decoder = JpegDecoder::new_with_options(jpeg, options);
    // We need to decode the headers first to get the output buffer size
    decoder
        .decode_headers()
        .map_err(|e| ImageError::DecodeFailed(e.to_string()))?;
    let output_buffer_size = decoder
        .output_buffer_size()
        .ok_or_else(|| ImageError::DecodeFailed("Missing output buffer size".to_string()))?;
    let mut pixels = vec![0; output_buffer_size];
    decoder
        .decode_into(&mut pixels)
        .map_err(|e| ImageError::DecodeFailed(e.to_string()))?;
    let (width, height) = decoder
        .dimensions()
        .ok_or_else(|| ImageError::DecodeFailed("Missing image dimensions".to_string()))?;

    // Grayscale JPEGs stay single channel whatever output colorspace is asked for.
    let pixel_count = width * height;
    let pixels = match pixels.len().checked_div(pixel_count) {
        Some(3) => pixels,
        Some(1) => pixels.iter().flat_map(|&v| [v, v, v]).collect(),
        _ => {
            return Err(ImageError::DecodeFailed(format!(
                "Unexpected JPEG output of {} bytes for {width}x{height}",
                pixels.len()
            )));
        }
    };
    Ok((width, height, pixels))
}

/// Looks for the EOI marker after the last start of scan.
///
/// Entropy coded data never contains `FF D9`, so a stream cut inside the
/// scan has none.
fn has_end_of_image(jpeg: &[u8]) -> bool {
    let Some(start_of_scan) = jpeg.windows(2).rposition(|marker| marker == [0xFF, 0xDA]) else {
        return false;
    };
    jpeg[start_of_scan..]
        .windows(2)
        .any(|marker| marker == [0xFF, 0xD9])
}

fn decode_other(bytes: &[u8]) -> Result<(usize, usize, Vec<u8>), ImageError> {
    let format = image::guess_format(bytes).map_err(|_| ImageError::UnsupportedFormat)?;
    let decoded = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| ImageError::DecodeFailed(e.to_string()))?
        .to_rgb8();
    Ok((
        decoded.width() as usize,
        decoded.height() as usize,
        decoded.into_raw(),
    ))
}

/// Copies the pixels inside `[y1,y2)×[x1,x2)` into a new image.
pub fn crop(image: &Image, bbox: &BoundingBox) -> anyhow::Result<Image> {
    if bbox.x1 < 0
        || bbox.y1 < 0
        || bbox.x2 <= bbox.x1
        || bbox.y2 <= bbox.y1
        || bbox.x2 as usize > image.width
        || bbox.y2 as usize > image.height
    {
        bail!(
            "Invalid crop box {:?} for {}x{} image",
            bbox,
            image.width,
            image.height
        );
    }

    let channels = image.channels();
    let (x1, y1, x2, y2) = (
        bbox.x1 as usize,
        bbox.y1 as usize,
        bbox.x2 as usize,
        bbox.y2 as usize,
    );
    let row_len = (x2 - x1) * channels;
    let mut pixels = Vec::with_capacity(row_len * (y2 - y1));
    for row in image.pixels.chunks_exact(image.width * channels).take(y2).skip(y1) {
        pixels.extend_from_slice(&row[x1 * channels..x2 * channels]);
    }

    Ok(Image {
        name: image.name.clone(),
        width: x2 - x1,
        height: y2 - y1,
        layout: image.layout,
        pixels,
    })
}

/// Converts `image` to the `target` layout.
///
/// Single channel input is replicated into three channels, RGB and BGR are
/// swapped. Width, height and pixel count never change.
pub fn normalize_color(image: &Image, target: PixelLayout) -> Image {
    let pixels = match (image.layout, target) {
        (from, to) if from == to => image.pixels.clone(),
        (PixelLayout::Luma, _) => image.pixels.iter().flat_map(|&v| [v, v, v]).collect(),
        (from, PixelLayout::Luma) => rgb_to_luma(&image.pixels, from),
        _ => swap_red_blue(&image.pixels),
    };
    Image {
        name: image.name.clone(),
        width: image.width,
        height: image.height,
        layout: target,
        pixels,
    }
}

pub fn to_luma(image: &Image) -> Image {
    normalize_color(image, PixelLayout::Luma)
}

fn swap_red_blue(pixels: &[u8]) -> Vec<u8> {
    pixels
        .chunks_exact(3)
        .flat_map(|p| [p[2], p[1], p[0]])
        .collect()
}

// ITU-R BT.601
fn rgb_to_luma(pixels: &[u8], layout: PixelLayout) -> Vec<u8> {
    pixels
        .chunks_exact(3)
        .map(|p| {
            let (r, g, b) = match layout {
                PixelLayout::Bgr => (p[2], p[1], p[0]),
                _ => (p[0], p[1], p[2]),
            };
            (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32).round() as u8
        })
        .collect()
}

pub struct Resizer {
    resizer: fast_image_resize::Resizer,
}

impl Default for Resizer {
    fn default() -> Self {
        Self {
            resizer: fast_image_resize::Resizer::new(),
        }
    }
}

impl Resizer {
    /// Resizes a three channel image, keeping its layout.
    pub fn resize_image(
        &mut self,
        original_image: &Image,
        target_width: usize,
        target_height: usize,
    ) -> anyhow::Result<Image> {
        if original_image.channels() != 3 {
            bail!("Resizer expects a three channel image, got {}", original_image.layout);
        }
        debug!(
            "Resizing image from {}x{} to {}x{}",
            original_image.width, original_image.height, target_width, target_height
        );
        let src_image = fast_image_resize::images::ImageRef::new(
            original_image.width as u32,
            original_image.height as u32,
            &original_image.pixels,
            fast_image_resize::PixelType::U8x3,
        )?;

        let mut pixels = vec![0; target_width * target_height * 3];
        {
            let mut dst_image = fast_image_resize::images::Image::from_slice_u8(
                target_width as u32,
                target_height as u32,
                &mut pixels,
                fast_image_resize::PixelType::U8x3,
            )?;
            self.resizer.resize(&src_image, &mut dst_image, None)?;
        }

        Ok(Image {
            name: original_image.name.clone(),
            width: target_width,
            height: target_height,
            layout: original_image.layout,
            pixels,
        })
    }
}

pub fn encode_jpeg(image: &Image, quality: u8) -> anyhow::Result<Vec<u8>> {
    let mut jpeg = Vec::new();
    let encoder = Encoder::new(&mut jpeg, quality);
    encoder.encode(
        &image.pixels,
        image.width as u16,
        image.height as u16,
        jpeg_color_type(image.layout),
    )?;
    Ok(jpeg)
}

pub fn encode_maybe_draw_boundary_box_and_save_jpeg(
    image: &Image,
    jpeg_file: &Path,
    bounding_box: Option<&BoundingBox>,
) -> anyhow::Result<()> {
    let encode_image_start_time = Instant::now();

    let image = match bounding_box {
        Some(bounding_box) => draw_boundary_box(image, bounding_box)?,
        None => image.clone(),
    };

    let encoder = Encoder::new_file(jpeg_file, 100)?;
    encoder.encode(
        &image.pixels,
        image.width as u16,
        image.height as u16,
        jpeg_color_type(image.layout),
    )?;
    debug!(encode_image_time = ?encode_image_start_time.elapsed(), "Encode image time");
    info!(?jpeg_file, "Image saved");
    Ok(())
}

fn jpeg_color_type(layout: PixelLayout) -> ColorType {
    match layout {
        PixelLayout::Rgb => ColorType::Rgb,
        PixelLayout::Bgr => ColorType::Bgr,
        PixelLayout::Luma => ColorType::Luma,
    }
}

fn draw_boundary_box(image: &Image, bounding_box: &BoundingBox) -> anyhow::Result<Image> {
    let rgb = normalize_color(image, PixelLayout::Rgb);
    let mut img: ImageBuffer<Rgb<u8>, Vec<u8>> =
        ImageBuffer::from_vec(rgb.width as u32, rgb.height as u32, rgb.pixels)
            .ok_or_else(|| anyhow!("Failed to create image buffer"))?;

    let dx = bounding_box.x2 - bounding_box.x1;
    let dy = bounding_box.y2 - bounding_box.y1;
    if dx > 0 && dy > 0 {
        imageproc::drawing::draw_hollow_rect_mut(
            &mut img,
            imageproc::rect::Rect::at(bounding_box.x1, bounding_box.y1)
                .of_size(dx as u32, dy as u32),
            Rgb([255, 0, 0]),
        );
    }

    Ok(Image {
        name: image.name.clone(),
        width: img.width() as usize,
        height: img.height() as usize,
        layout: PixelLayout::Rgb,
        pixels: img.into_raw(),
    })
}

pub fn create_random_jpeg_name() -> String {
    format!("image_{}.jpg", uuid::Uuid::new_v4())
}

/// `dir/car.png` becomes `car_plate.jpg`.
pub fn create_plate_image_name(image_name: &str) -> anyhow::Result<String> {
    let stem = Path::new(image_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("Failed to get file stem from {image_name}"))?;
    Ok(format!("{stem}_plate.jpg"))
}

/// A white 300x100 image with a row of dark "characters" spanning (10,30)-(164,70).
///
/// The eight solid blocks stand in for rendered plate text such as
/// "B1234XYZ", so no font asset is needed. Used for warming up models, by
/// tests with stub recognizers, and by the test client when no image is given.
pub fn sample_plate_image() -> Image {
    const WIDTH: u32 = 300;
    const HEIGHT: u32 = 100;
    let mut img = ImageBuffer::from_pixel(WIDTH, HEIGHT, Rgb([255u8, 255, 255]));
    for i in 0..8 {
        imageproc::drawing::draw_filled_rect_mut(
            &mut img,
            imageproc::rect::Rect::at(10 + i * 20, 30).of_size(14, 40),
            Rgb([0, 0, 0]),
        );
    }
    Image {
        name: Some("sample_plate.jpg".to_string()),
        width: WIDTH as usize,
        height: HEIGHT as usize,
        layout: PixelLayout::Rgb,
        pixels: img.into_raw(),
    }
}

/// Region of `sample_plate_image` covered by the dark blocks.
pub const SAMPLE_PLATE_REGION: BoundingBox = BoundingBox {
    x1: 10,
    y1: 30,
    x2: 164,
    y2: 70,
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn gradient(width: usize, height: usize, layout: PixelLayout) -> Image {
        let pixels = (0..width * height * layout.channels())
            .map(|i| (i % 251) as u8)
            .collect();
        Image::new(None, width, height, layout, pixels).unwrap()
    }

    fn encode_png(image: &Image) -> Vec<u8> {
        let rgb = normalize_color(image, PixelLayout::Rgb);
        let buffer: ImageBuffer<Rgb<u8>, Vec<u8>> =
            ImageBuffer::from_vec(rgb.width as u32, rgb.height as u32, rgb.pixels).unwrap();
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(buffer)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn decode_png_into_requested_layout() {
        let original = gradient(7, 5, PixelLayout::Rgb);
        let png = encode_png(&original);

        let rgb = decode_image(None, &png, PixelLayout::Rgb).unwrap();
        assert_eq!(rgb, original);

        let bgr = decode_image(None, &png, PixelLayout::Bgr).unwrap();
        assert_eq!(bgr.layout, PixelLayout::Bgr);
        assert_eq!(&bgr.pixels[..3], &[original.pixels[2], original.pixels[1], original.pixels[0]]);
    }

    #[test]
    fn decode_jpeg_sample() {
        let sample = sample_plate_image();
        let jpeg = encode_jpeg(&sample, 90).unwrap();
        let decoded = decode_image(Some("sample.jpg".into()), &jpeg, PixelLayout::Rgb).unwrap();
        assert_eq!((decoded.width, decoded.height), (300, 100));
        assert_eq!(decoded.pixels.len(), 300 * 100 * 3);
        assert_eq!(decoded.name.as_deref(), Some("sample.jpg"));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            decode_image(None, b"not an image", PixelLayout::Rgb),
            Err(ImageError::UnsupportedFormat)
        ));
        assert!(matches!(
            decode_image(None, b"", PixelLayout::Rgb),
            Err(ImageError::Empty)
        ));
    }

    #[test]
    fn decode_rejects_truncated_data() {
        let png = encode_png(&gradient(32, 32, PixelLayout::Rgb));
        let truncated = &png[..png.len() / 2];
        assert!(matches!(
            decode_image(None, truncated, PixelLayout::Rgb),
            Err(ImageError::DecodeFailed(_))
        ));

        let jpeg = encode_jpeg(&sample_plate_image(), 90).unwrap();
        assert!(decode_image(None, &jpeg[..64], PixelLayout::Rgb).is_err());
        // Cut inside the entropy coded scan, past every header.
        for divisor in [2, 3, 4] {
            assert!(
                matches!(
                    decode_image(None, &jpeg[..jpeg.len() / divisor], PixelLayout::Rgb),
                    Err(ImageError::DecodeFailed(_))
                ),
                "1/{divisor} of the JPEG decoded"
            );
        }
        assert!(decode_image(None, &jpeg[..jpeg.len() - 2], PixelLayout::Rgb).is_err());
    }

    #[test]
    fn decode_grayscale_jpeg_into_three_channels() {
        let gray = gradient(40, 20, PixelLayout::Luma);
        let jpeg = encode_jpeg(&gray, 90).unwrap();

        let rgb = decode_image(None, &jpeg, PixelLayout::Rgb).unwrap();
        assert_eq!((rgb.width, rgb.height, rgb.layout), (40, 20, PixelLayout::Rgb));
        assert_eq!(rgb.pixels.len(), 40 * 20 * 3);
        assert!(rgb.pixels.chunks_exact(3).all(|p| p[0] == p[1] && p[1] == p[2]));

        let resized = Resizer::default().resize_image(&rgb, 64, 64).unwrap();
        assert_eq!(resized.pixels.len(), 64 * 64 * 3);
    }

    #[test]
    fn crop_has_box_dimensions() {
        let image = gradient(20, 10, PixelLayout::Bgr);
        let bbox = BoundingBox {
            x1: 3,
            y1: 2,
            x2: 11,
            y2: 9,
        };
        let cropped = crop(&image, &bbox).unwrap();
        assert_eq!((cropped.width, cropped.height), (8, 7));
        assert_eq!(cropped.layout, PixelLayout::Bgr);
        assert_eq!(cropped.pixels.len(), 8 * 7 * 3);

        // First pixel of the crop is pixel (3, 2) of the source.
        let offset = (2 * 20 + 3) * 3;
        assert_eq!(&cropped.pixels[..3], &image.pixels[offset..offset + 3]);
    }

    #[test]
    fn crop_full_image_is_identity() {
        let image = gradient(6, 4, PixelLayout::Luma);
        let bbox = BoundingBox {
            x1: 0,
            y1: 0,
            x2: 6,
            y2: 4,
        };
        assert_eq!(crop(&image, &bbox).unwrap(), image);
    }

    #[test]
    fn crop_rejects_invalid_boxes() {
        let image = gradient(10, 10, PixelLayout::Rgb);
        for bbox in [
            BoundingBox { x1: 5, y1: 0, x2: 5, y2: 10 },
            BoundingBox { x1: 0, y1: 6, x2: 10, y2: 2 },
            BoundingBox { x1: -1, y1: 0, x2: 4, y2: 4 },
            BoundingBox { x1: 0, y1: 0, x2: 11, y2: 4 },
        ] {
            assert!(crop(&image, &bbox).is_err(), "{bbox:?}");
        }
    }

    #[test]
    fn normalize_is_idempotent() {
        for (from, to) in [
            (PixelLayout::Rgb, PixelLayout::Bgr),
            (PixelLayout::Bgr, PixelLayout::Rgb),
            (PixelLayout::Luma, PixelLayout::Bgr),
            (PixelLayout::Rgb, PixelLayout::Rgb),
        ] {
            let image = gradient(9, 4, from);
            let once = normalize_color(&image, to);
            let twice = normalize_color(&once, to);
            assert_eq!(once, twice);
            assert_eq!((once.width, once.height), (image.width, image.height));
            assert_eq!(once.pixels.len(), 9 * 4 * 3);
        }
    }

    #[test]
    fn normalize_swaps_and_replicates() {
        let rgb = Image::new(None, 1, 1, PixelLayout::Rgb, vec![10, 20, 30]).unwrap();
        assert_eq!(normalize_color(&rgb, PixelLayout::Bgr).pixels, vec![30, 20, 10]);

        let luma = Image::new(None, 2, 1, PixelLayout::Luma, vec![7, 200]).unwrap();
        assert_eq!(
            normalize_color(&luma, PixelLayout::Rgb).pixels,
            vec![7, 7, 7, 200, 200, 200]
        );
    }

    #[test]
    fn luma_ignores_channel_order() {
        let rgb = Image::new(None, 1, 1, PixelLayout::Rgb, vec![200, 100, 50]).unwrap();
        let bgr = normalize_color(&rgb, PixelLayout::Bgr);
        assert_eq!(to_luma(&rgb).pixels, to_luma(&bgr).pixels);
        assert_eq!(to_luma(&rgb).pixels, vec![124]);
    }

    #[test]
    fn resize_keeps_layout() {
        let image = gradient(40, 20, PixelLayout::Bgr);
        let resized = Resizer::default().resize_image(&image, 16, 8).unwrap();
        assert_eq!((resized.width, resized.height), (16, 8));
        assert_eq!(resized.layout, PixelLayout::Bgr);
        assert_eq!(resized.pixels.len(), 16 * 8 * 3);
        assert!(Resizer::default().resize_image(&to_luma(&image), 16, 8).is_err());
    }

    #[test]
    fn plate_image_name() {
        assert_eq!(create_plate_image_name("dir/car.png").unwrap(), "car_plate.jpg");
        assert_eq!(create_plate_image_name("car").unwrap(), "car_plate.jpg");
        assert!(create_plate_image_name("").is_err());
    }
}
