//! Stage processors.

pub mod inference;
pub mod separation;
pub mod training;

use std::sync::Arc;

use crate::models::job::Stage;
use crate::services::engine::Transform;
use crate::services::processor::{StageContext, StageProcessor};

pub use inference::InferenceProcessor;
pub use separation::SeparationProcessor;
pub use training::TrainingProcessor;

/// Processor for `stage` running on `engine`.
pub fn processor_for(
    stage: Stage,
    ctx: StageContext,
    engine: Arc<dyn Transform>,
) -> Arc<dyn StageProcessor> {
    match stage {
        Stage::Separation => Arc::new(SeparationProcessor::new(ctx, engine)),
        Stage::Training => Arc::new(TrainingProcessor::new(ctx, engine)),
        Stage::Inference => Arc::new(InferenceProcessor::new(ctx, engine)),
    }
}
