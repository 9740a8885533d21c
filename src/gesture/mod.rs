pub mod classifier;
pub mod confirm;
pub mod features;

pub use classifier::{classify, GestureLabel, RuleSet};
pub use confirm::{ConfirmationEngine, ConfirmationPolicy, Decision};
pub use features::{FeatureExtractor, FeatureVector};
