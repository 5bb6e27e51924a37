//! Image decoding and model-input tensor preparation.

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use std::path::Path;
use thiserror::Error;

/// Square input edge expected by the embedding model.
pub const MODEL_INPUT_SIZE: u32 = 112;
const INPUT_MEAN: f32 = 127.5;
const INPUT_SCALE: f32 = 128.0;

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("image decode failed: {0}")]
    Decode(String),
    #[error("degenerate image geometry: {width}x{height}")]
    Resize { width: u32, height: u32 },
}

/// Decode an encoded image (PNG, JPEG, ...) into 8-bit RGB. Alpha is dropped.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, PreprocessError> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgb8())
        .map_err(|e| PreprocessError::Decode(e.to_string()))
}

/// Read and decode an image file into 8-bit RGB.
pub fn load_image(path: impl AsRef<Path>) -> Result<RgbImage, PreprocessError> {
    let path = path.as_ref();
    image::open(path)
        .map(|img| img.to_rgb8())
        .map_err(|e| PreprocessError::Decode(format!("{}: {e}", path.display())))
}

/// Resize an RGB image to `target_size`×`target_size` and pack it into a
/// NHWC tensor `[1, size, size, 3]` with values `(v - 127.5) / 128`.
pub fn preprocess(image: &RgbImage, target_size: u32) -> Result<Array4<f32>, PreprocessError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 || target_size == 0 {
        return Err(PreprocessError::Resize { width, height });
    }

    let resized;
    let source = if (width, height) == (target_size, target_size) {
        image
    } else {
        resized = imageops::resize(image, target_size, target_size, FilterType::Triangle);
        &resized
    };

    let size = target_size as usize;
    let mut tensor = Array4::<f32>::zeros((1, size, size, 3));

    for (x, y, pixel) in source.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, y as usize, x as usize, c]] = normalize(pixel[c]);
        }
    }

    Ok(tensor)
}

#[inline]
fn normalize(v: u8) -> f32 {
    (v as f32 - INPUT_MEAN) / INPUT_SCALE
}
