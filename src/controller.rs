//! Run controller: sequences decode, detection, classification and
//! aggregation for one individual and owns the skip/abort policy.
//!
//! Videos are scored in parallel on the engine's worker pool. Inside a video
//! a decoder thread feeds frames through a bounded channel to the
//! detect/classify loop, so a slow classifier stalls decoding instead of
//! buffering the whole video.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver};
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::Serialize;
use stressrs_vision::{
    DecodeError, FaceLocator, FfmpegSource, Frame, FrameSource, Normalizer, StressClassifier,
};
use uuid::Uuid;

use crate::aggregate::{self, CompositeScore, SignalTally, VideoScore};
use crate::config::Config;
use crate::decision::{DecisionEngine, Verdict};
use crate::directory::{EmployeeDirectory, FileDirectory};
use crate::error::InferenceError;
use crate::labels::LabelPartition;
use crate::media_store::{FsMediaStore, MediaStore, VideoSegment};
use crate::model_repo::{ModelRepository, OnnxRepository};

/// Shared cancellation flag with an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// The external systems a run talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub media: Arc<dyn MediaStore>,
    pub frames: Arc<dyn FrameSource>,
    pub models: Arc<dyn ModelRepository>,
    pub directory: Arc<dyn EmployeeDirectory>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    Undecodable { detail: String },
    NoFaces,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedVideo {
    pub video_id: String,
    pub sequence_index: u32,
    #[serde(flatten)]
    pub reason: SkipReason,
}

/// What a successful run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub verdict: Verdict,
    pub composite: CompositeScore,
    pub videos: Vec<VideoScore>,
    pub skipped: Vec<SkippedVideo>,
}

impl RunReport {
    pub fn undecodable(&self) -> usize {
        self.skipped
            .iter()
            .filter(|s| matches!(s.reason, SkipReason::Undecodable { .. }))
            .count()
    }

    pub fn without_faces(&self) -> usize {
        self.skipped
            .iter()
            .filter(|s| s.reason == SkipReason::NoFaces)
            .count()
    }
}

enum VideoOutcome {
    Scored(VideoScore),
    Skipped(SkippedVideo),
}

pub struct Engine {
    config: Config,
    collab: Collaborators,
    partition: LabelPartition,
    normalizer: Normalizer,
    decision: DecisionEngine,
    pool: rayon::ThreadPool,
}

impl Engine {
    pub fn new(config: Config, collab: Collaborators) -> anyhow::Result<Self> {
        config.validate()?;
        let workers = match config.runtime.workers {
            0 => std::thread::available_parallelism().map_or(1, |n| n.get()),
            n => n,
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("stressrs-worker-{}", i))
            .build()?;
        debug!("worker pool with {} thread(s)", workers);

        Ok(Self {
            partition: LabelPartition::from_config(&config.labels),
            normalizer: Normalizer::new(config.normalizer.clone()),
            decision: DecisionEngine::new(config.decision.threshold),
            config,
            collab,
            pool,
        })
    }

    /// Engine wired to the filesystem stores, ffmpeg and ONNX models.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let collab = Collaborators {
            media: Arc::new(FsMediaStore::new(
                &config.storage.videos,
                &config.storage.extension,
            )),
            frames: Arc::new(FfmpegSource {
                ffmpeg: config.media.ffmpeg.clone(),
                ffprobe: config.media.ffprobe.clone(),
                frame_step: config.media.frame_step,
            }),
            models: Arc::new(OnnxRepository::new(
                config.models.clone(),
                config.detector.clone(),
                config.labels.names.len(),
            )),
            directory: Arc::new(FileDirectory::new(&config.storage.directory)),
        };
        Self::new(config, collab)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn new_token(&self) -> CancelToken {
        let timeout = match self.config.runtime.timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        CancelToken::with_timeout(timeout)
    }

    /// Score every video of `individual_id` and persist the verdict.
    pub fn run_inference(&self, individual_id: &str) -> Result<RunReport, InferenceError> {
        self.run_inference_with(individual_id, &self.new_token())
    }

    /// Run several individuals in parallel; each result stands alone.
    pub fn run_batch(
        &self,
        individual_ids: &[String],
    ) -> Vec<(String, Result<RunReport, InferenceError>)> {
        self.pool.install(|| {
            individual_ids
                .par_iter()
                .map(|id| (id.clone(), self.run_inference(id)))
                .collect()
        })
    }

    pub fn run_inference_with(
        &self,
        individual_id: &str,
        cancel: &CancelToken,
    ) -> Result<RunReport, InferenceError> {
        let run_id = Uuid::new_v4();
        let version = &self.config.models.version;

        let classifier = self.collab.models.classifier(version).map_err(|source| {
            InferenceError::ModelUnavailable {
                name: version.clone(),
                source,
            }
        })?;
        let locator = self.collab.models.face_locator().map_err(|source| {
            InferenceError::ModelUnavailable {
                name: self.config.models.detector.clone(),
                source,
            }
        })?;

        if self
            .collab
            .directory
            .get(individual_id)
            .map_err(InferenceError::Directory)?
            .is_none()
        {
            return Err(InferenceError::UnknownIndividual(individual_id.to_string()));
        }

        let videos = self
            .collab
            .media
            .list(individual_id)
            .map_err(InferenceError::MediaStore)?;
        info!(
            "run {}: {} video(s) for {}",
            run_id,
            videos.len(),
            individual_id
        );

        let stages = Stages {
            frames: self.collab.frames.as_ref(),
            locator: locator.as_ref(),
            classifier: classifier.as_ref(),
            partition: &self.partition,
            normalizer: &self.normalizer,
            max_pending_frames: self.config.runtime.max_pending_frames,
            individual_id,
        };
        let outcomes = self.pool.install(|| {
            videos
                .par_iter()
                .map(|segment| stages.score_video(segment, cancel))
                .collect::<Result<Vec<_>, _>>()
        })?;

        let cancelled = || InferenceError::Cancelled {
            individual_id: individual_id.to_string(),
        };
        if cancel.is_cancelled() {
            return Err(cancelled());
        }

        let mut scores = Vec::new();
        let mut skipped = Vec::new();
        for outcome in outcomes {
            match outcome {
                VideoOutcome::Scored(score) => scores.push(score),
                VideoOutcome::Skipped(skip) => skipped.push(skip),
            }
        }

        let Some(composite) = aggregate::composite(individual_id, &scores) else {
            let undecodable = skipped
                .iter()
                .filter(|s| matches!(s.reason, SkipReason::Undecodable { .. }))
                .count();
            return Err(InferenceError::EmptyInput {
                individual_id: individual_id.to_string(),
                videos: videos.len(),
                undecodable,
                without_faces: skipped.len() - undecodable,
            });
        };
        info!(
            "run {}: composite {:.2} over {} video(s), {} skipped",
            run_id,
            composite.value,
            scores.len(),
            skipped.len()
        );

        // Last chance to abort before the only externally visible write.
        if cancel.is_cancelled() {
            return Err(cancelled());
        }
        let verdict = self.decision.decide(&composite);
        self.decision
            .commit(&verdict, self.collab.directory.as_ref())
            .map_err(InferenceError::Directory)?;

        Ok(RunReport {
            run_id,
            verdict,
            composite,
            videos: scores,
            skipped,
        })
    }
}

/// Borrowed per-run view of the pipeline stages.
struct Stages<'a> {
    frames: &'a dyn FrameSource,
    locator: &'a dyn FaceLocator,
    classifier: &'a dyn StressClassifier,
    partition: &'a LabelPartition,
    normalizer: &'a Normalizer,
    max_pending_frames: usize,
    individual_id: &'a str,
}

enum StreamEnd {
    Done { tally: SignalTally, frames: usize },
    Broken(DecodeError),
}

impl Stages<'_> {
    fn score_video(
        &self,
        segment: &VideoSegment,
        cancel: &CancelToken,
    ) -> Result<VideoOutcome, InferenceError> {
        let video_id = segment.media.id();
        let skip = |reason: SkipReason| {
            VideoOutcome::Skipped(SkippedVideo {
                video_id: video_id.clone(),
                sequence_index: segment.sequence_index,
                reason,
            })
        };

        if cancel.is_cancelled() {
            return Err(self.cancelled());
        }

        let frames = match self.frames.open(segment.media.path()) {
            Ok(frames) => frames,
            Err(e) => {
                warn!("skipping {}: {}", video_id, e);
                return Ok(skip(SkipReason::Undecodable {
                    detail: e.to_string(),
                }));
            }
        };

        let (tx, rx) = bounded::<Result<Frame, DecodeError>>(self.max_pending_frames);
        let (end, decoder_ok) = std::thread::scope(|scope| {
            let decoder = scope.spawn(move || {
                for item in frames {
                    let broken = item.is_err();
                    if tx.send(item).is_err() || broken {
                        break;
                    }
                }
            });
            let end = self.consume(&video_id, rx, cancel);
            (end, decoder.join().is_ok())
        });

        let end = end?;
        if !decoder_ok {
            warn!("skipping {}: decoder thread panicked", video_id);
            return Ok(skip(SkipReason::Undecodable {
                detail: "decoder thread panicked".to_string(),
            }));
        }

        match end {
            StreamEnd::Broken(e) => {
                warn!("skipping {}: {}", video_id, e);
                Ok(skip(SkipReason::Undecodable {
                    detail: e.to_string(),
                }))
            }
            StreamEnd::Done { tally, frames } => {
                match VideoScore::from_tally(video_id.clone(), segment.sequence_index, &tally) {
                    Some(score) => {
                        info!(
                            "{}: {:.2}% stressed ({} of {} faces, {} frames)",
                            video_id, score.stressed_percentage, tally.stressed, tally.total, frames
                        );
                        Ok(VideoOutcome::Scored(score))
                    }
                    None => {
                        warn!("{}: no faces in {} frames, excluded", video_id, frames);
                        Ok(skip(SkipReason::NoFaces))
                    }
                }
            }
        }
    }

    /// Detect, normalize and classify until the decoder hangs up.
    ///
    /// Takes the receiver by value: returning early drops it, which unblocks
    /// and stops the decoder thread.
    fn consume(
        &self,
        video_id: &str,
        rx: Receiver<Result<Frame, DecodeError>>,
        cancel: &CancelToken,
    ) -> Result<StreamEnd, InferenceError> {
        let mut tally = SignalTally::default();
        let mut frames = 0;

        for item in rx.iter() {
            let frame = match item {
                Ok(frame) => frame,
                Err(e) => return Ok(StreamEnd::Broken(e)),
            };
            if cancel.is_cancelled() {
                return Err(self.cancelled());
            }
            frames += 1;

            let faces = self
                .locator
                .locate(&frame.image)
                .map_err(|source| self.inference_error(video_id, source))?;

            for region in &faces {
                let Some(face) = self.normalizer.normalize(&frame.image, region) else {
                    debug!("{} frame {}: empty region {:?}", video_id, frame.index, region);
                    continue;
                };
                let result = self
                    .classifier
                    .classify(&face)
                    .map_err(|source| self.inference_error(video_id, source))?;
                let stressed = self.partition.is_stress(result.label);
                log::trace!(
                    "{} frame {}: {} ({:.2}) stressed={}",
                    video_id,
                    frame.index,
                    self.partition.name(result.label),
                    result.confidence,
                    stressed
                );
                tally.record(stressed);
            }
        }

        debug!(
            "{}: {} frame(s), {} face(s) classified",
            video_id, frames, tally.total
        );
        Ok(StreamEnd::Done { tally, frames })
    }

    fn cancelled(&self) -> InferenceError {
        InferenceError::Cancelled {
            individual_id: self.individual_id.to_string(),
        }
    }

    fn inference_error(&self, video_id: &str, source: anyhow::Error) -> InferenceError {
        InferenceError::Inference {
            media: format!("{}/{}", self.individual_id, video_id),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let shared = token.clone();
        shared.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_cancel_token_deadline() {
        let expired = CancelToken::with_timeout(Some(Duration::ZERO));
        assert!(expired.is_cancelled());
        let open = CancelToken::with_timeout(Some(Duration::from_secs(3600)));
        assert!(!open.is_cancelled());
    }
}
