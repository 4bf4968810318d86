use image::GrayImage;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to read image {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to load image: {0}")]
    Image(#[from] image::ImageError),
    #[error("no QR code found in image")]
    NoCode,
    #[error("QR code found but could not be decoded: {0}")]
    Unreadable(String),
}

pub fn decode_image_file(path: &Path) -> Result<String, DecodeError> {
    let bytes = std::fs::read(path).map_err(|source| DecodeError::Io {
        path: path.to_string_lossy().to_string(),
        source,
    })?;
    decode_image_bytes(&bytes)
}

/// Decodes the first readable QR symbol in an encoded image (PNG, JPEG, ...).
pub fn decode_image_bytes(bytes: &[u8]) -> Result<String, DecodeError> {
    let img = image::load_from_memory(bytes)?;
    decode_luma(&img.to_luma8())
}

pub fn decode_luma(frame: &GrayImage) -> Result<String, DecodeError> {
    let (width, height) = frame.dimensions();
    let mut prepared = rqrr::PreparedImage::prepare_from_greyscale(
        width as usize,
        height as usize,
        |x, y| frame.get_pixel(x as u32, y as u32).0[0],
    );

    let grids = prepared.detect_grids();
    if grids.is_empty() {
        return Err(DecodeError::NoCode);
    }

    let mut last_err = None;
    for grid in grids {
        match grid.decode() {
            Ok((_meta, content)) => return Ok(content),
            Err(e) => last_err = Some(e.to_string()),
        }
    }
    Err(DecodeError::Unreadable(
        last_err.unwrap_or_else(|| "unknown".to_string()),
    ))
}
