//! Study specification model, sequence flattening and progress tracking.

pub mod catalog;
pub mod flatten;
pub mod progress;
pub mod rng;
pub mod spec;

pub use catalog::StudyCatalog;
pub use flatten::{flatten, FlatSequence};
pub use progress::ProgressTracker;
pub use spec::{Block, ConditionSelector, Group, GroupOrder, Leaf, StudySpec};
