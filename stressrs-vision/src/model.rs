use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
#[cfg(any(feature = "openvino", feature = "cuda"))]
use ort::ep::{self, ExecutionProvider};
use ort::session::{
    builder::{GraphOptimizationLevel, SessionBuilder},
    Session,
};

/// A session shared by every handle built over the same artifact.
pub type SharedSession = Arc<Mutex<Session>>;

/// Sessions are shared behind a lock and videos already run in parallel on
/// the worker pool, so each session keeps its own op-level threading small.
const INTRA_OP_THREADS: usize = 1;

pub fn session_builder() -> Result<SessionBuilder> {
    #[allow(unused_mut)]
    let mut builder = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(INTRA_OP_THREADS)?;

    #[cfg(feature = "openvino")]
    register(&mut builder, ep::OpenVINO::default(), "openvino")?;

    #[cfg(feature = "cuda")]
    register(&mut builder, ep::CUDA::default(), "cuda")?;

    Ok(builder)
}

#[cfg(any(feature = "openvino", feature = "cuda"))]
fn register<E: ExecutionProvider>(builder: &mut SessionBuilder, ep: E, name: &str) -> Result<()> {
    if ep.is_available()? {
        ep.register(builder)?;
        log::debug!("registered {} execution provider", name);
    } else {
        log::warn!(
            "{} feature is enabled, onnx runtime not compiled with {}",
            name,
            name
        );
    }
    Ok(())
}

/// Build a session from an `.onnx` artifact on disk.
pub fn load_session(path: &Path) -> Result<Session> {
    if !path.is_file() {
        anyhow::bail!("model artifact not found: {}", path.display());
    }
    log::debug!("loading onnx model {}", path.display());
    session_builder()?
        .commit_from_file(path)
        .with_context(|| format!("load model {}", path.display()))
}
