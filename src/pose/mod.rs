pub mod adapter;
#[cfg(feature = "desktop")]
pub mod detector;
pub mod landmark;
pub mod preprocess;

pub use adapter::{
    AdapterCounters, AdapterStats, InferenceEngine, InferenceOutcome, InferenceWorker,
    LandmarkAdapter, SubmitOutcome,
};
#[cfg(feature = "desktop")]
pub use detector::OnnxHandLandmarker;
pub use landmark::{HandLandmark, HandPose, Landmark};
pub use preprocess::{orient, RgbImage};
