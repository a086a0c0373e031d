pub mod aggregate;
pub mod config;
pub mod controller;
pub mod decision;
pub mod directory;
pub mod error;
pub mod identity;
pub mod labels;
pub mod media_store;
pub mod model_repo;

// Re-export the pipeline surface for convenience
pub use controller::{CancelToken, Collaborators, Engine, RunReport};
pub use decision::{StressLevel, Verdict};
pub use error::InferenceError;
pub use stressrs_vision::{classifier, locator, normalize, video};
