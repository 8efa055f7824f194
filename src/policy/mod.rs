//! Controllers: the trainable neural policy and a random explorer.

pub mod neural;
pub mod random;
pub mod trait_;

pub use neural::{Policy, PolicyConfig};
pub use random::RandomController;
pub use trait_::Controller;
