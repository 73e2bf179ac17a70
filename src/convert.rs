//
// convert.rs
// Dicom-Intake-rs
//
// Turns accepted raster uploads into minimal Secondary Capture DICOM objects, and parses uploads that already are DICOM.
//
// Thales Matheus Mendonça Santos - November 2025

use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::StandardDataDictionary;
use dicom::object::{DefaultDicomObject, FileDicomObject, FileMetaTableBuilder};
use dicom::transfer_syntax::entries::EXPLICIT_VR_LITTLE_ENDIAN;
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};
use sha2::{Digest, Sha256};

use crate::config::ConversionConfig;
use crate::validate::FileKind;

/// Secondary Capture Image Storage.
pub const SECONDARY_CAPTURE_SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.1.7";

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("input could not be decoded as an image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("input is not a readable DICOM file: {0}")]
    InvalidDicom(String),
    #[error("pixel data could not be embedded: {0}")]
    Embed(String),
}

#[derive(Debug, Clone)]
pub struct Converter {
    max_dimension: u32,
}

impl Converter {
    pub fn new(config: &ConversionConfig) -> Self {
        Self {
            max_dimension: config.max_dimension,
        }
    }

    /// Produce a DICOM object for `bytes`. The output only depends on the inputs,
    /// so a retried job yields byte-identical objects.
    pub fn convert(
        &self,
        bytes: &[u8],
        kind: FileKind,
        upload_id: &str,
    ) -> Result<DefaultDicomObject, ConversionError> {
        match kind {
            FileKind::Dicom => parse_part10(bytes),
            _ => {
                let pixels = self.rasterize(bytes)?;
                secondary_capture(&pixels, upload_id)
            }
        }
    }

    fn rasterize(&self, bytes: &[u8]) -> Result<GrayImage, ConversionError> {
        let img = image::load_from_memory(bytes)?;

        // Transparent regions are composited onto white before going grayscale.
        let gray = if img.color().has_alpha() {
            let la = img.to_luma_alpha8();
            let (width, height) = la.dimensions();
            GrayImage::from_fn(width, height, |x, y| {
                let [l, a] = la.get_pixel(x, y).0;
                let (l, a) = (u32::from(l), u32::from(a));
                Luma([((l * a + 255 * (255 - a)) / 255) as u8])
            })
        } else {
            img.to_luma8()
        };

        Ok(self.fit(gray))
    }

    fn fit(&self, img: GrayImage) -> GrayImage {
        let (width, height) = img.dimensions();
        let longest = width.max(height);
        if self.max_dimension == 0 || longest <= self.max_dimension {
            return img;
        }
        let scale = f64::from(self.max_dimension) / f64::from(longest);
        let new_width = ((f64::from(width) * scale) as u32).max(1);
        let new_height = ((f64::from(height) * scale) as u32).max(1);
        imageops::resize(&img, new_width, new_height, FilterType::Lanczos3)
    }
}

/// Parse a Part 10 byte stream, with or without the 128-byte preamble.
pub fn parse_part10(bytes: &[u8]) -> Result<DefaultDicomObject, ConversionError> {
    let body = if bytes.len() >= 132 && &bytes[128..132] == b"DICM" {
        &bytes[128..]
    } else {
        bytes
    };
    dicom::object::from_reader(body).map_err(|e| ConversionError::InvalidDicom(e.to_string()))
}

/// Build a `2.25.<n>` UID from a SHA-256 of the upload id and the UID's role.
pub fn derived_uid(upload_id: &str, role: &str) -> String {
    let digest = Sha256::digest(format!("{upload_id}/{role}").as_bytes());
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&digest[..16]);
    format!("2.25.{}", u128::from_be_bytes(raw))
}

fn secondary_capture(
    pixels: &GrayImage,
    upload_id: &str,
) -> Result<DefaultDicomObject, ConversionError> {
    let (width, height) = pixels.dimensions();
    let rows = u16::try_from(height)
        .map_err(|_| ConversionError::Embed(format!("{height} rows exceed the DICOM limit")))?;
    let columns = u16::try_from(width)
        .map_err(|_| ConversionError::Embed(format!("{width} columns exceed the DICOM limit")))?;

    let sop_instance_uid = derived_uid(upload_id, "instance");

    let file_meta = FileMetaTableBuilder::new()
        .transfer_syntax(EXPLICIT_VR_LITTLE_ENDIAN.uid())
        .media_storage_sop_class_uid(SECONDARY_CAPTURE_SOP_CLASS)
        .media_storage_sop_instance_uid(sop_instance_uid.as_str())
        .build()
        .map_err(|e| ConversionError::Embed(e.to_string()))?;

    let mut obj = FileDicomObject::new_empty_with_dict_and_meta(StandardDataDictionary, file_meta);

    // Identification: synthetic UIDs only, no patient fields.
    put(&mut obj, Tag(0x0008, 0x0008), VR::CS, "DERIVED\\SECONDARY"); // ImageType
    put(&mut obj, Tag(0x0008, 0x0016), VR::UI, SECONDARY_CAPTURE_SOP_CLASS);
    put(&mut obj, Tag(0x0008, 0x0018), VR::UI, sop_instance_uid.as_str());
    put(&mut obj, Tag(0x0008, 0x0060), VR::CS, "OT"); // Modality
    put(&mut obj, Tag(0x0008, 0x0064), VR::CS, "WSD"); // ConversionType
    put(&mut obj, Tag(0x0018, 0x1016), VR::LO, "Dicom-Intake");
    put(&mut obj, Tag(0x0018, 0x1018), VR::LO, "Image Preprocessor v1.0");
    put(&mut obj, Tag(0x0020, 0x000D), VR::UI, derived_uid(upload_id, "study"));
    put(&mut obj, Tag(0x0020, 0x000E), VR::UI, derived_uid(upload_id, "series"));
    put(&mut obj, Tag(0x0020, 0x0013), VR::IS, "1"); // InstanceNumber

    // Image pixel module: 8-bit grayscale, unsigned.
    put(&mut obj, Tag(0x0028, 0x0002), VR::US, 1_u16); // SamplesPerPixel
    put(&mut obj, Tag(0x0028, 0x0004), VR::CS, "MONOCHROME2");
    put(&mut obj, Tag(0x0028, 0x0010), VR::US, rows);
    put(&mut obj, Tag(0x0028, 0x0011), VR::US, columns);
    put(&mut obj, Tag(0x0028, 0x0100), VR::US, 8_u16); // BitsAllocated
    put(&mut obj, Tag(0x0028, 0x0101), VR::US, 8_u16); // BitsStored
    put(&mut obj, Tag(0x0028, 0x0102), VR::US, 7_u16); // HighBit
    put(&mut obj, Tag(0x0028, 0x0103), VR::US, 0_u16); // PixelRepresentation
    put(&mut obj, Tag(0x0028, 0x1050), VR::DS, "128"); // WindowCenter
    put(&mut obj, Tag(0x0028, 0x1051), VR::DS, "256"); // WindowWidth
    put(&mut obj, Tag(0x0028, 0x1052), VR::DS, "0"); // RescaleIntercept
    put(&mut obj, Tag(0x0028, 0x1053), VR::DS, "1"); // RescaleSlope

    let mut data = pixels.as_raw().clone();
    if data.len() % 2 == 1 {
        // OB values must have even length.
        data.push(0);
    }
    put(&mut obj, Tag(0x7FE0, 0x0010), VR::OB, data);

    Ok(obj)
}

fn put(obj: &mut DefaultDicomObject, tag: Tag, vr: VR, value: impl Into<PrimitiveValue>) {
    obj.put(DataElement::new(tag, vr, value.into()));
}
