use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use ort::{session::Session, value::Value};

use crate::model::SharedSession;
use crate::normalize::NormalizedFace;

/// Winning label of one classification and its probability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub label: usize,
    pub confidence: f32,
}

/// A loaded expression model. Implementations are shared read-only between
/// workers, so `classify` takes `&self` and keeps no per-call state.
pub trait StressClassifier: Send + Sync {
    fn classify(&self, face: &NormalizedFace) -> Result<Classification>;
}

pub struct OnnxClassifier {
    session: SharedSession,
    label_count: usize,
}

impl OnnxClassifier {
    pub fn new(session: Session, label_count: usize) -> Self {
        Self::with_session(Arc::new(Mutex::new(session)), label_count)
    }

    /// Wrap a session that may also back other handles.
    pub fn with_session(session: SharedSession, label_count: usize) -> Self {
        Self { session, label_count }
    }

    pub fn from_file(path: &Path, label_count: usize) -> Result<Self> {
        let session = crate::model::load_session(path).context("load stress classifier")?;
        Ok(Self::new(session, label_count))
    }

    pub fn label_count(&self) -> usize {
        self.label_count
    }
}

impl StressClassifier for OnnxClassifier {
    fn classify(&self, face: &NormalizedFace) -> Result<Classification> {
        let input = Value::from_array(face.to_tensor())?;

        let scores = {
            let mut session = self
                .session
                .lock()
                .map_err(|_| anyhow::anyhow!("classifier session lock poisoned"))?;
            let outputs = session.run(ort::inputs![input])?;
            let (_shape, data) = outputs[0].try_extract_tensor::<f32>()?;
            data.to_vec()
        };

        if scores.len() != self.label_count {
            anyhow::bail!(
                "classifier produced {} scores, expected {} labels",
                scores.len(),
                self.label_count
            );
        }
        pick_label(&scores).context("empty classifier output")
    }
}

/// Argmax over `scores`; ties go to the lowest index.
pub fn pick_label(scores: &[f32]) -> Option<Classification> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &s) in scores.iter().enumerate() {
        if s.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if s <= b => {}
            _ => best = Some((i, s)),
        }
    }
    let (label, _) = best?;
    let probs = as_distribution(scores);
    Some(Classification {
        label,
        confidence: probs[label],
    })
}

/// Pass probabilities through untouched, softmax anything else.
fn as_distribution(scores: &[f32]) -> Vec<f32> {
    let sum: f32 = scores.iter().sum();
    let is_probs = scores.iter().all(|&s| (0.0..=1.0).contains(&s)) && (sum - 1.0).abs() < 1e-3;
    if is_probs {
        return scores.to_vec();
    }
    let max = scores
        .iter()
        .copied()
        .filter(|s| !s.is_nan())
        .fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scores
        .iter()
        .map(|&s| if s.is_nan() { 0.0 } else { (s - max).exp() })
        .collect();
    let total: f32 = exps.iter().sum();
    exps.iter().map(|e| e / total).collect()
}
