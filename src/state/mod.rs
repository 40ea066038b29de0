//! Persisted pipeline state: the data model and its durable store.

pub mod model;
pub mod store;

pub use model::{
    ElementCatalog, ElementKind, Phase, PhaseState, PipelineState, StateError, Status,
    StoryElement, SubPhase, TocEntry, TokenStats, UnitState, STATE_SCHEMA_VERSION,
};
pub use store::{StateStore, StateStoreError, StateStoreResult, STATE_FILE_NAME};
