#[cfg(feature = "desktop")]
pub mod capture;
pub mod frame;
pub mod session;
pub mod throttle;
pub mod worker;

#[cfg(feature = "desktop")]
pub use capture::OpenCvCamera;
pub use frame::{Frame, MonotonicClock, PixelFormat, SessionEpoch};
pub use session::{
    CameraDevice, CaptureRequest, Facing, FailureReason, SensorSession, SessionEvent, SessionState,
    StatusHandle,
};
pub use throttle::FrameThrottle;
pub use worker::SensorWorker;
