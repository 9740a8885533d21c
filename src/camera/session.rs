//! Camera session lifecycle and fault recovery.
//!
//! `SensorSession` is a plain state machine driven by the sensor worker thread:
//! the worker calls [`SensorSession::open`], [`SensorSession::pump`] and
//! [`SensorSession::poll`] with the current time, and the session talks to the
//! device, the frame callback and the observer. Nothing else touches the device.
//!
//! ```text
//! Closed -> Opening -> Open -> Streaming <-> Recovering
//!                                   |            |
//!                                   v            v
//!                                 Closed       Failed
//! ```

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::frame::{Frame, MonotonicClock, SessionEpoch};
use super::throttle::FrameThrottle;
use crate::config::{CameraConfig, RecoveryConfig};
use crate::error::{SensorError, SensorErrorClass};

/// レンズの向き
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facing {
    Front,
    Back,
}

/// カメラへの要求内容
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub facing: Facing,
    pub index: i32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl CaptureRequest {
    pub fn front(config: &CameraConfig) -> Self {
        Self {
            facing: Facing::Front,
            index: config.index,
            width: config.width,
            height: config.height,
            fps: config.fps,
        }
    }
}

/// Camera backend owned exclusively by the sensor worker.
pub trait CameraDevice: Send {
    /// Select a sensor matching `request.facing`, open and configure it and start
    /// the repeating capture.
    fn open(&mut self, request: &CaptureRequest) -> Result<(), SensorError>;

    /// Next captured frame, `Ok(None)` when none is ready yet.
    fn read_frame(&mut self) -> Result<Option<Frame>, SensorError>;

    fn close(&mut self);
}

impl<D: CameraDevice + ?Sized> CameraDevice for Box<D> {
    fn open(&mut self, request: &CaptureRequest) -> Result<(), SensorError> {
        (**self).open(request)
    }

    fn read_frame(&mut self) -> Result<Option<Frame>, SensorError> {
        (**self).read_frame()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opening,
    Open,
    Streaming,
    Recovering,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    RetriesExhausted,
    PermissionDenied,
    NoForwardFacing,
}

impl FailureReason {
    pub fn status_message(self) -> &'static str {
        match self {
            Self::RetriesExhausted => "Camera recovery failed - check permissions",
            Self::PermissionDenied => "Camera permission denied",
            Self::NoForwardFacing => "No front camera found.",
        }
    }
}

/// セッションから監視側へ通知するイベント
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Opened,
    RetryScheduled { attempt: u32, delay: Duration },
    Failed(FailureReason),
    /// デバイスレベルの障害。所有サービスが全体を再起動する
    Fatal(SensorError),
    Closed,
}

pub type FrameCallback = Box<dyn FnMut(Frame) + Send>;
pub type SessionObserver = Box<dyn FnMut(SessionEvent) + Send>;

/// 人間向けのセッション状態文字列（通知欄に相当）
#[derive(Debug, Clone, Default)]
pub struct StatusHandle(Arc<Mutex<String>>);

impl StatusHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, message: impl Into<String>) {
        let mut guard = self.0.lock().unwrap_or_else(|e| e.into_inner());
        *guard = message.into();
    }

    pub fn get(&self) -> String {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

pub struct SensorSession<D: CameraDevice> {
    device: D,
    device_open: bool,
    request: CaptureRequest,
    recovery: RecoveryConfig,
    state: SessionState,
    restart_count: u32,
    retry_at: Option<Instant>,
    scheduled_retries: u32,
    throttle: FrameThrottle,
    clock: MonotonicClock,
    last_timestamp_us: Option<u64>,
    epoch: SessionEpoch,
    current_epoch: u64,
    on_frame: Option<FrameCallback>,
    observer: Option<SessionObserver>,
    status: StatusHandle,
    frames_captured: u64,
    frames_throttled: u64,
}

impl<D: CameraDevice> SensorSession<D> {
    pub fn new(
        device: D,
        camera: &CameraConfig,
        recovery: &RecoveryConfig,
        epoch: SessionEpoch,
        status: StatusHandle,
    ) -> Self {
        Self {
            device,
            device_open: false,
            request: CaptureRequest::front(camera),
            recovery: recovery.clone(),
            state: SessionState::Closed,
            restart_count: 0,
            retry_at: None,
            scheduled_retries: 0,
            throttle: FrameThrottle::new(camera.frame_interval()),
            clock: MonotonicClock::new(),
            last_timestamp_us: None,
            current_epoch: epoch.current(),
            epoch,
            on_frame: None,
            observer: None,
            status,
            frames_captured: 0,
            frames_throttled: 0,
        }
    }

    /// 処理対象フレームの受け取り先を登録する
    pub fn on_frame_ready(&mut self, callback: impl FnMut(Frame) + Send + 'static) {
        self.on_frame = Some(Box::new(callback));
    }

    pub fn set_observer(&mut self, observer: impl FnMut(SessionEvent) + Send + 'static) {
        self.observer = Some(Box::new(observer));
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    /// これまでに予約した再試行タイマーの総数
    pub fn scheduled_retries(&self) -> u32 {
        self.scheduled_retries
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames_captured
    }

    pub fn frames_throttled(&self) -> u64 {
        self.frames_throttled
    }

    pub fn status(&self) -> &StatusHandle {
        &self.status
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Pending retry deadline, if a recovery timer is armed.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.retry_at
    }

    pub fn is_capturing(&self) -> bool {
        matches!(self.state, SessionState::Open | SessionState::Streaming)
    }

    pub fn open(&mut self, now: Instant) {
        match self.state {
            SessionState::Open | SessionState::Streaming | SessionState::Failed => {
                debug!(state = ?self.state, "open ignored");
                return;
            }
            _ => {}
        }

        self.retry_at = None;
        self.state = SessionState::Opening;
        self.status.set("Connecting to camera...");
        info!(attempt = self.restart_count, "opening camera");

        match self.device.open(&self.request) {
            Ok(()) => {
                self.device_open = true;
                self.state = SessionState::Open;
                self.restart_count = 0;
                self.current_epoch = self.epoch.advance();
                self.throttle.reset();
                self.status.set("Gesture Detection Active");
                info!(epoch = self.current_epoch, "camera opened");
                self.notify(SessionEvent::Opened);
            }
            Err(e) => self.handle_error(e, now),
        }
    }

    /// 読み取ったフレームを間引き・刻印してコールバックへ渡す。
    /// フレームを1枚でも取得できたら true
    pub fn pump(&mut self, now: Instant) -> bool {
        if !self.is_capturing() {
            return false;
        }

        match self.device.read_frame() {
            Ok(Some(mut frame)) => {
                self.frames_captured += 1;
                self.state = SessionState::Streaming;
                if !self.throttle.admit(now) {
                    // 取得して即解放
                    self.frames_throttled += 1;
                    return true;
                }
                frame.timestamp_us = self.next_timestamp(now);
                frame.epoch = self.current_epoch;
                if let Some(callback) = self.on_frame.as_mut() {
                    callback(frame);
                }
                true
            }
            Ok(None) => false,
            Err(e) => {
                self.handle_error(e, now);
                false
            }
        }
    }

    /// 再試行タイマーの期限を確認する
    pub fn poll(&mut self, now: Instant) {
        if self.state != SessionState::Recovering {
            return;
        }
        match self.retry_at {
            Some(at) if at <= now => {
                self.retry_at = None;
                if self.restart_count >= self.recovery.max_restart_attempts {
                    error!(
                        attempts = self.recovery.max_restart_attempts,
                        "giving up camera recovery"
                    );
                    self.fail(FailureReason::RetriesExhausted);
                } else {
                    self.open(now);
                }
            }
            _ => {}
        }
    }

    /// 同期的に閉じる。保留中の再試行タイマーも取り消す
    pub fn close(&mut self) {
        if self.state == SessionState::Closed && !self.device_open {
            return;
        }
        self.retry_at = None;
        self.release();
        self.state = SessionState::Closed;
        self.status.set("Camera closed");
        info!("camera session closed");
        self.notify(SessionEvent::Closed);
    }

    fn handle_error(&mut self, e: SensorError, now: Instant) {
        self.release();
        match e.class() {
            SensorErrorClass::Unauthorized => {
                error!(error = %e, "camera not usable, not retrying");
                let reason = match e {
                    SensorError::NoForwardFacing => FailureReason::NoForwardFacing,
                    _ => FailureReason::PermissionDenied,
                };
                self.fail(reason);
            }
            SensorErrorClass::Fatal => {
                error!(error = %e, "fatal camera error, requesting service restart");
                self.retry_at = None;
                self.state = SessionState::Closed;
                self.status.set("Camera device failure - restarting");
                self.notify(SessionEvent::Fatal(e));
            }
            SensorErrorClass::Transient => {
                warn!(error = %e, "camera lost");
                self.schedule_retry(now);
            }
        }
    }

    fn schedule_retry(&mut self, now: Instant) {
        let max = self.recovery.max_restart_attempts;
        if self.restart_count >= max {
            self.fail(FailureReason::RetriesExhausted);
            return;
        }
        self.restart_count += 1;
        let delay = self.recovery.retry_delay(self.restart_count);
        self.retry_at = Some(now + delay);
        self.scheduled_retries += 1;
        self.state = SessionState::Recovering;
        self.status.set(format!(
            "Camera lost. Retrying... ({}/{})",
            self.restart_count, max
        ));
        info!(attempt = self.restart_count, delay_ms = delay.as_millis() as u64, "retry scheduled");
        self.notify(SessionEvent::RetryScheduled {
            attempt: self.restart_count,
            delay,
        });
    }

    fn fail(&mut self, reason: FailureReason) {
        self.retry_at = None;
        self.state = SessionState::Failed;
        self.status.set(reason.status_message());
        self.notify(SessionEvent::Failed(reason));
    }

    /// 世代を進めてからデバイスを閉じる（遅れて届くコールバックを無効化）
    fn release(&mut self) {
        self.current_epoch = self.epoch.advance();
        if self.device_open {
            self.device.close();
            self.device_open = false;
        }
    }

    fn next_timestamp(&mut self, now: Instant) -> u64 {
        let ts = self.clock.micros_at(now);
        let ts = match self.last_timestamp_us {
            Some(last) if ts <= last => last + 1,
            _ => ts,
        };
        self.last_timestamp_us = Some(ts);
        ts
    }

    fn notify(&mut self, event: SessionEvent) {
        if let Some(observer) = self.observer.as_mut() {
            observer(event);
        }
    }
}

impl<D: CameraDevice> Drop for SensorSession<D> {
    fn drop(&mut self) {
        self.retry_at = None;
        self.release();
    }
}
