//
// preview.rs
// Dicom-Intake-rs
//
// Renders the first frame of an unsealed artifact as PNG for quick visual checks.
//
// Thales Matheus Mendonça Santos - November 2025

use std::io::Cursor;

use anyhow::{Context, Result};
use dicom_pixeldata::PixelDecoder;
use image::{DynamicImage, ImageFormat};

use crate::convert::parse_part10;

/// PNG bytes of frame 0 of a Part 10 byte stream.
pub fn first_frame_png(part10: &[u8]) -> Result<Vec<u8>> {
    let obj = parse_part10(part10).context("Artifact is not a readable DICOM file")?;
    // Default conversion: modality LUT, then the VOI window carried by the object.
    let decoded = obj
        .decode_pixel_data()
        .context("Failed to decode pixel data")?;
    let frame = decoded
        .to_dynamic_image(0)
        .context("Failed to render frame 0")?;
    encode_image(&frame, ImageFormat::Png)
}

fn encode_image(image: &DynamicImage, format: ImageFormat) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    image.write_to(&mut Cursor::new(&mut buffer), format)?;
    Ok(buffer)
}
