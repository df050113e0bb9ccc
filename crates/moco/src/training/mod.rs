//! MoCo training pipeline: image data, contrastive loss, the negative queue,
//! momentum updates, metrics with health checks, the MoCo callback, and the
//! AdamW learner that dispatches callbacks.

pub mod callback;
pub mod data;
pub mod learner;
pub mod loss;
pub mod metrics;
pub mod momentum;
pub mod queue;
