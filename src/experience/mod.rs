//! Experience storage: recorded episodes, regression pairs and initial states.

pub mod dataset;
pub mod episode;

pub use dataset::ExperienceDataset;
pub use episode::{Episode, ParamSnapshot};
