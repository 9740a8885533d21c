pub mod mode;
pub mod smooth;

pub use mode::{ModeController, PointerQuery};
pub use smooth::PointerSmoother;
