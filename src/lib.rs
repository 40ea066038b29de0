//! Resumable pipeline engine for turning a parsed book into an illustration guide.
//!
//! The engine runs four ordered phases (parse, analyze, extract, illustrate)
//! over the chapters of a book, driving per-chapter calls to an external
//! text- or image-generation service. Every phase is idempotent and
//! interruptible: progress is persisted to a versioned state document after
//! every unit of work, so a crashed or cancelled run resumes without
//! repeating completed calls.
//!
//! Collaborators (file-format parsers, network clients, renderers, progress
//! UIs) live outside this crate. They plug in through the typed contracts in
//! [`book`], [`executor::ServiceClient`], and [`events`].

pub mod book;
pub mod budget;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod pipeline;
pub mod state;

pub use book::{BookMetadata, Chapter, ParsedBook};
pub use config::PipelineConfig;
pub use error::{ErrorCategory, PipelineError};
pub use pipeline::{PhaseSummary, PipelineRunner, RunReport};
pub use state::{Phase, PipelineState, Status, SubPhase};
