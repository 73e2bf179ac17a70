//
// common/mod.rs
// Dicom-Intake-rs
//
// Shared fixtures for the integration tests: sample images, a patient-tagged DICOM file and a scratch configuration.
//
// Thales Matheus Mendonça Santos - November 2025

#![allow(dead_code)]

use std::io::Cursor;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::StandardDataDictionary;
use dicom::object::{FileDicomObject, FileMetaTableBuilder, InMemDicomObject};
use dicom::transfer_syntax::entries::EXPLICIT_VR_LITTLE_ENDIAN;
use dicom_intake::config::Config;
use image::{DynamicImage, ImageBuffer, ImageFormat, Luma, Rgba};

pub const TEST_KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

/// Scratch configuration rooted in `root`, tuned for fast retries.
pub fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.storage.artifact_root = root.join("artifacts");
    config.storage.database = root.join("intake.db");
    config.sealing.encrypt = true;
    config.sealing.key_hex = Some(TEST_KEY_HEX.to_string());
    config.dispatch.workers = 2;
    config.dispatch.retry_backoff_ms = 1;
    config.dispatch.retry_backoff_max_ms = 5;
    config.broker.poll_interval_ms = 10;
    config
}

/// A small grayscale gradient encoded as PNG.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = ImageBuffer::from_fn(width, height, |x, y| Luma([((x + y) * 16 % 256) as u8]));
    encode(DynamicImage::ImageLuma8(img), ImageFormat::Png)
}

/// A fully transparent RGBA PNG; flattening onto white must give pure white.
pub fn transparent_png_bytes() -> Vec<u8> {
    let img = ImageBuffer::from_pixel(3, 3, Rgba([0u8, 0, 0, 0]));
    encode(DynamicImage::ImageRgba8(img), ImageFormat::Png)
}

/// Passes the PNG signature check but cannot be decoded.
pub fn truncated_png_bytes() -> Vec<u8> {
    let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    bytes.extend_from_slice(b"not really a png");
    bytes
}

fn encode(img: DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut buffer = Vec::new();
    img.write_to(&mut Cursor::new(&mut buffer), format)
        .expect("encode test image");
    buffer
}

/// A tiny Secondary Capture instance carrying patient and institution details.
pub fn patient_dicom_bytes() -> Vec<u8> {
    let mut obj = InMemDicomObject::new_empty_with_dict(StandardDataDictionary);
    let text = [
        (Tag(0x0010, 0x0010), VR::PN, "Test^Patient"),
        (Tag(0x0010, 0x0020), VR::LO, "PAT123"),
        (Tag(0x0010, 0x0030), VR::DA, "19700101"),
        (Tag(0x0008, 0x0080), VR::LO, "General Hospital"),
        (Tag(0x0008, 0x0090), VR::PN, "Dr^Who"),
        (Tag(0x0008, 0x0060), VR::CS, "OT"),
        (Tag(0x0008, 0x0016), VR::UI, "1.2.840.10008.5.1.4.1.1.7"),
        (Tag(0x0008, 0x0018), VR::UI, "1.2.826.0.1.3680043.2.1125.1"),
        (Tag(0x0028, 0x0004), VR::CS, "MONOCHROME2"),
    ];
    for (tag, vr, value) in text {
        obj.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
    }
    let shorts = [
        (Tag(0x0028, 0x0010), 2_u16), // Rows
        (Tag(0x0028, 0x0011), 2),     // Columns
        (Tag(0x0028, 0x0002), 1),     // Samples per pixel
        (Tag(0x0028, 0x0100), 8),     // Bits Allocated
        (Tag(0x0028, 0x0101), 8),     // Bits Stored
        (Tag(0x0028, 0x0102), 7),     // High Bit
        (Tag(0x0028, 0x0103), 0),     // Pixel Representation
    ];
    for (tag, value) in shorts {
        obj.put(DataElement::new(tag, VR::US, PrimitiveValue::from(value)));
    }
    obj.put(DataElement::new(
        Tag(0x7fe0, 0x0010),
        VR::OB,
        PrimitiveValue::from(vec![0_u8, 64, 128, 255]),
    ));

    let meta = FileMetaTableBuilder::new()
        .transfer_syntax(EXPLICIT_VR_LITTLE_ENDIAN.uid())
        .media_storage_sop_class_uid("1.2.840.10008.5.1.4.1.1.7")
        .media_storage_sop_instance_uid("1.2.826.0.1.3680043.2.1125.1")
        .build()
        .expect("meta");

    let mut file_obj = FileDicomObject::new_empty_with_dict_and_meta(StandardDataDictionary, meta);
    for elem in obj {
        file_obj.put(elem);
    }
    let mut bytes = Vec::new();
    file_obj.write_all(&mut bytes).expect("write test dicom");
    bytes
}

/// Poll `check` until it yields a value or `limit` passes.
pub fn wait_for<T>(limit: Duration, mut check: impl FnMut() -> Option<T>) -> T {
    let started = Instant::now();
    loop {
        if let Some(value) = check() {
            return value;
        }
        assert!(started.elapsed() < limit, "timed out after {limit:?}");
        thread::sleep(Duration::from_millis(20));
    }
}
