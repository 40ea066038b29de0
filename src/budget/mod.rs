//! Token budget model: estimation, cost projection, context-window checks,
//! and chunk planning.
//!
//! Everything in this module is pure and does no I/O. The pipeline consults
//! it before every service call so an oversized prompt never reaches the
//! external service.

pub mod chunker;
pub mod estimator;
pub mod model;

pub use chunker::{calculate_splits, Chunk, ChunkPlan};
pub use estimator::{TokenEstimator, DEFAULT_SAFETY_MARGIN};
pub use model::ModelConfig;
