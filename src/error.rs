//! Error types shared by the sensor, inference and feature stages.
//!
//! Per-frame errors (`InferenceError`, `ExtractError`) never leave the stage that
//! produced them; only `SensorError` feeds the session state machine.

use thiserror::Error;

/// カメラ資源の障害区分
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorErrorClass {
    /// 切断・使用中・無効化など。バックオフ付きで再試行する
    Transient,
    /// デバイスレベルの障害。サービス全体を再起動する
    Fatal,
    /// 権限なし・前面カメラなし。再試行しても成功しないので即終了
    Unauthorized,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SensorError {
    #[error("camera disconnected")]
    Disconnected,
    #[error("camera in use by another client")]
    InUse,
    #[error("camera disabled by policy")]
    Disabled,
    #[error("camera unavailable: {0}")]
    Unavailable(String),
    #[error("failed to configure capture: {0}")]
    Configure(String),
    #[error("frame read failed: {0}")]
    Read(String),
    #[error("camera device failure: {0}")]
    DeviceFailure(String),
    #[error("camera permission denied")]
    PermissionDenied,
    #[error("no forward-facing camera found")]
    NoForwardFacing,
}

impl SensorError {
    pub fn class(&self) -> SensorErrorClass {
        match self {
            Self::DeviceFailure(_) => SensorErrorClass::Fatal,
            Self::PermissionDenied | Self::NoForwardFacing => SensorErrorClass::Unauthorized,
            Self::Disconnected
            | Self::InUse
            | Self::Disabled
            | Self::Unavailable(_)
            | Self::Configure(_)
            | Self::Read(_) => SensorErrorClass::Transient,
        }
    }
}

/// 推論エンジンが1フレームについて報告したエラー。"手なし" とは別物。
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InferenceError {
    #[error("input image rejected: {0}")]
    InvalidInput(String),
    #[error("engine failure: {0}")]
    Engine(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("expected {expected} landmarks, got {found}")]
    InsufficientLandmarks { expected: usize, found: usize },
}
