//! Momentum Contrast (MoCo) self-supervised representation learning on burn.
//!
//! Provides a query/key encoder pair where the key encoder tracks the query
//! encoder as an exponential moving average, a circular queue of past key
//! embeddings used as negatives, and the InfoNCE loss that ties them together.
//! The recipe is packaged as a [`training::callback::MocoCallback`] driven by
//! the callback-dispatching [`training::learner::Learner`].

pub mod augment;
pub mod error;
pub mod inference;
pub mod model;
pub mod training;

pub use error::MocoError;
pub use model::moco_model::{MocoModel, MocoModelConfig};
pub use training::callback::{Batch, Callback, MocoCallback, MocoConfig};
pub use training::learner::{Learner, LearnerConfig};
