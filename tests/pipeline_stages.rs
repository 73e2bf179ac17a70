//
// pipeline_stages.rs
// Dicom-Intake-rs
//
// Integration-style tests chaining the stages by hand: validation, conversion, anonymization, sealing and preview.
//
// Thales Matheus Mendonça Santos - November 2025

mod common;

use dicom::core::Tag;
use dicom_intake::anonymize::{self, Anonymizer};
use dicom_intake::config::{ConversionConfig, ValidationConfig};
use dicom_intake::convert::{self, Converter, SECONDARY_CAPTURE_SOP_CLASS};
use dicom_intake::preview;
use dicom_intake::seal::{self, Sealer};
use dicom_intake::validate::{FileKind, ValidationError, Validator};

use common::{patient_dicom_bytes, png_bytes, transparent_png_bytes};

fn converter(max_dimension: u32) -> Converter {
    Converter::new(&ConversionConfig { max_dimension })
}

fn element_str(obj: &dicom::object::DefaultDicomObject, tag: Tag) -> Option<String> {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches(['\0', ' ']).to_string())
}

#[test]
fn validator_detects_kinds_and_reports_reason_codes() {
    let validator = Validator::new(&ValidationConfig::default());

    assert_eq!(validator.check(&png_bytes(4, 4), None, "scan.bin"), Ok(FileKind::Png));
    assert_eq!(
        validator.check(&patient_dicom_bytes(), None, "study"),
        Ok(FileKind::Dicom)
    );

    let err = validator.check(b"%PDF-1.7", Some("application/pdf"), "report.pdf").unwrap_err();
    assert_eq!(err.code(), "unsupported-type");
    assert_eq!(validator.check(&[], None, "x.png").unwrap_err(), ValidationError::EmptyPayload);

    let small = Validator::new(&ValidationConfig {
        max_bytes: 16,
        ..ValidationConfig::default()
    });
    assert_eq!(small.check(&png_bytes(8, 8), None, "x.png").unwrap_err().code(), "size-exceeded");
}

#[test]
fn converted_png_is_a_deterministic_secondary_capture() {
    let bytes = png_bytes(40, 10);
    let conv = converter(20);

    let first = conv.convert(&bytes, FileKind::Png, "upload-1").expect("convert");
    let second = conv.convert(&bytes, FileKind::Png, "upload-1").expect("convert");
    assert_eq!(
        seal::encode(&first).expect("encode"),
        seal::encode(&second).expect("encode")
    );

    assert_eq!(
        element_str(&first, Tag(0x0008, 0x0016)).as_deref(),
        Some(SECONDARY_CAPTURE_SOP_CLASS)
    );
    assert_eq!(
        element_str(&first, Tag(0x0008, 0x0018)),
        Some(convert::derived_uid("upload-1", "instance"))
    );
    // Longest side capped at 20, aspect ratio kept.
    let rows = first.element(Tag(0x0028, 0x0010)).expect("rows").to_int::<u16>().expect("u16");
    let cols = first.element(Tag(0x0028, 0x0011)).expect("cols").to_int::<u16>().expect("u16");
    assert_eq!((rows, cols), (5, 20));
    assert!(first.element(Tag(0x0010, 0x0010)).is_err(), "no patient name is written");

    let other = conv.convert(&bytes, FileKind::Png, "upload-2").expect("convert");
    assert_ne!(
        element_str(&first, Tag(0x0020, 0x000D)),
        element_str(&other, Tag(0x0020, 0x000D))
    );
}

#[test]
fn transparency_is_flattened_onto_white() {
    let obj = converter(0)
        .convert(&transparent_png_bytes(), FileKind::Png, "u")
        .expect("convert");
    let pixels = obj
        .element(Tag(0x7FE0, 0x0010))
        .expect("pixel data")
        .to_bytes()
        .expect("bytes")
        .into_owned();
    assert!(pixels.iter().take(9).all(|&p| p == 255));
}

#[test]
fn anonymizer_strips_patient_tags_and_is_idempotent() {
    let mut obj = converter(0)
        .convert(&patient_dicom_bytes(), FileKind::Dicom, "u")
        .expect("dicom passes through");
    let anonymizer = Anonymizer::new(anonymize::default_rules());

    let modified = anonymizer.apply(&mut obj).expect("first pass");
    assert!(modified.iter().any(|t| t.starts_with("(0010,0010)")));
    assert!(modified.iter().any(|t| t.starts_with("(0008,0090)")));
    assert!(obj.element(Tag(0x0010, 0x0010)).is_err());
    assert!(obj.element(Tag(0x0010, 0x0020)).is_err());
    assert!(obj.element(Tag(0x0008, 0x0080)).is_err());
    assert_eq!(
        element_str(&obj, Tag(0x0008, 0x0090)).as_deref(),
        Some("ANONYMIZED")
    );

    let before = seal::encode(&obj).expect("encode");
    let second = anonymizer.apply(&mut obj).expect("second pass");
    assert!(second.is_empty(), "second pass changed {second:?}");
    assert_eq!(seal::encode(&obj).expect("encode"), before);
}

#[test]
fn hash_covers_cleartext_and_survives_fresh_nonces() {
    let obj = converter(0)
        .convert(&png_bytes(8, 8), FileKind::Png, "u")
        .expect("convert");
    let sealer = Sealer::with_key(&[7u8; 32]).expect("key");

    let a = sealer.seal(&obj).expect("seal");
    let b = sealer.seal(&obj).expect("seal");
    assert!(a.encrypted && b.encrypted);
    assert_ne!(a.nonce, b.nonce);
    assert_ne!(a.bytes, b.bytes);
    assert_eq!(a.content_hash, b.content_hash);

    let clear = sealer.unseal(&a.bytes, true).expect("unseal");
    assert!(seal::verify(&clear, &a.content_hash));
    assert_eq!(clear, seal::encode(&obj).expect("encode"));

    let plain = Sealer::plaintext().seal(&obj).expect("seal");
    assert!(!plain.encrypted);
    assert_eq!(plain.content_hash, a.content_hash);

    let other = Sealer::with_key(&[8u8; 32]).expect("key");
    assert!(other.unseal(&a.bytes, true).is_err());
}

#[test]
fn preview_renders_first_frame_of_an_artifact() {
    let obj = converter(0)
        .convert(&png_bytes(6, 4), FileKind::Png, "u")
        .expect("convert");
    let part10 = seal::encode(&obj).expect("encode");

    let png = preview::first_frame_png(&part10).expect("preview");
    assert_eq!(&png[..4], &[0x89, b'P', b'N', b'G']);
    let decoded = image::load_from_memory(&png).expect("decode preview");
    assert_eq!((decoded.width(), decoded.height()), (6, 4));

    assert!(preview::first_frame_png(b"not dicom").is_err());
}
