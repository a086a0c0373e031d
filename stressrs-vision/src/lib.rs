pub mod classifier;
pub mod locator;
pub mod model;
pub mod normalize;
pub mod video;
pub mod yunet;

// Re-export commonly used types
pub use classifier::{Classification, OnnxClassifier, StressClassifier};
pub use locator::{BoundingBox, DetectorConfig, FaceLocator, YuNetLocator};
pub use normalize::{NormalizedFace, Normalizer, NormalizerConfig, TensorLayout};
pub use video::{DecodeError, Frame, FrameSource, Frames, FfmpegSource};
