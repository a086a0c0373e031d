use thiserror::Error;

/// Why a run did not produce a verdict.
///
/// `ModelUnavailable` and `Inference` mean the system is broken;
/// `EmptyInput` means it worked but found nothing to score.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("model {name} unavailable: {source:#}")]
    ModelUnavailable {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(
        "no usable video for {individual_id}: {videos} video(s), {undecodable} undecodable, {without_faces} without faces"
    )]
    EmptyInput {
        individual_id: String,
        videos: usize,
        undecodable: usize,
        without_faces: usize,
    },
    #[error("run for {individual_id} cancelled")]
    Cancelled { individual_id: String },
    #[error("unknown individual {0}")]
    UnknownIndividual(String),
    #[error("{actor} is not allowed to {capability}")]
    AccessDenied { actor: String, capability: String },
    #[error("media store: {0:#}")]
    MediaStore(#[source] anyhow::Error),
    #[error("employee directory: {0:#}")]
    Directory(#[source] anyhow::Error),
    #[error("inference failed on {media}: {source:#}")]
    Inference {
        media: String,
        #[source]
        source: anyhow::Error,
    },
}

impl InferenceError {
    /// True when retrying later with the same inputs could succeed.
    pub fn is_system_failure(&self) -> bool {
        matches!(
            self,
            Self::ModelUnavailable { .. }
                | Self::MediaStore(_)
                | Self::Directory(_)
                | Self::Inference { .. }
        )
    }
}
