use anyhow::Result;
use image::{GrayImage, Luma};
use std::path::Path;
use stressrs_vision::{
    classifier::{OnnxClassifier, StressClassifier},
    locator::{BoundingBox, DetectorConfig, FaceLocator, YuNetLocator},
    normalize::Normalizer,
    video::{FfmpegSource, FrameSource},
};

const DETECTOR: &str = "models/face_detection_yunet_2023mar.onnx";
const CLASSIFIER: &str = "models/stressmodel.onnx";
const SAMPLE_VIDEO: &str = "test_videos/sample.webm";

/// A blank frame must come back with no faces and no error
#[test]
fn test_blank_frame_has_no_faces() -> Result<()> {
    env_logger::try_init().ok();
    let path = Path::new(DETECTOR);
    if !path.exists() {
        eprintln!("Skipping: {} not found", DETECTOR);
        return Ok(());
    }

    let locator = YuNetLocator::from_file(path, DetectorConfig::default())?;
    let frame = GrayImage::from_pixel(640, 480, Luma([128]));
    let faces = locator.locate(&frame)?;
    assert!(faces.is_empty(), "found {} face(s) in a blank frame", faces.len());
    println!("✓ blank frame -> 0 faces");
    Ok(())
}

/// Repeated calls against one loaded handle stay within the label set
#[test]
fn test_classifier_reuses_handle() -> Result<()> {
    env_logger::try_init().ok();
    let path = Path::new(CLASSIFIER);
    if !path.exists() {
        eprintln!("Skipping: {} not found", CLASSIFIER);
        return Ok(());
    }

    let classifier = OnnxClassifier::from_file(path, 7)?;
    let normalizer = Normalizer::default();
    let frame = GrayImage::from_fn(96, 96, |x, y| Luma([((x + y) % 256) as u8]));
    let region = BoundingBox {
        x: 0,
        y: 0,
        width: 96,
        height: 96,
        score: 1.0,
    };
    let face = normalizer.normalize(&frame, &region).expect("region inside frame");

    let first = classifier.classify(&face)?;
    for _ in 0..5 {
        let again = classifier.classify(&face)?;
        assert_eq!(again.label, first.label, "classification is not deterministic");
    }
    assert!(first.label < 7);
    assert!((0.0..=1.0).contains(&first.confidence));
    println!("✓ label {} ({:.3})", first.label, first.confidence);
    Ok(())
}

#[test]
fn test_decode_sample_video() -> Result<()> {
    env_logger::try_init().ok();
    let path = Path::new(SAMPLE_VIDEO);
    if !path.exists() {
        eprintln!("Skipping: {} not found", SAMPLE_VIDEO);
        return Ok(());
    }

    let source = FfmpegSource::default();
    let mut last = None;
    for frame in source.open(path)? {
        let frame = frame?;
        if let Some(prev) = last {
            assert!(frame.index > prev, "frames out of order");
        }
        last = Some(frame.index);
    }
    assert!(last.is_some());
    println!("✓ decoded {} frame(s)", last.map_or(0, |i| i + 1));
    Ok(())
}
