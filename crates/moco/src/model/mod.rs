//! MoCo model components: convolutional encoder, projection MLP, the
//! query/key model wrapper, and the tensor bridge for host image buffers.

pub mod bridge;
pub mod encoder;
pub mod moco_model;
pub mod projector;
