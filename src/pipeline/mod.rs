//! Phase orchestration: planning, estimation, payload preparation, and the
//! resumable engine loop that ties them to the executor and state store.

mod runner;
mod work;

pub use runner::{CancelHandle, PhaseSummary, PipelineRunner, RunReport};
pub use work::{
    assemble_element_catalog, element_seeds_from_analyze, plan_units, prepare_unit,
    project_units, ElementSeed, PreparedUnit, UnitProjection,
};
