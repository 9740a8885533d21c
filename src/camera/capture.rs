use opencv::{
    core::Mat,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureAPIs},
};
use tracing::{info, warn};

use super::frame::{Frame, PixelFormat};
use super::session::{CameraDevice, CaptureRequest, Facing};
use crate::error::SensorError;

/// OpenCVを使用したカメラデバイス
///
/// デスクトップでは向きを問い合わせられないため、設定されたデバイス番号を前面カメラとみなす。
pub struct OpenCvCamera {
    capture: Option<VideoCapture>,
    width: u32,
    height: u32,
    /// 連続で空フレームが返った回数
    empty_reads: u32,
}

/// これを超えて空フレームが続いたら切断とみなす
const MAX_EMPTY_READS: u32 = 30;

impl OpenCvCamera {
    pub fn new() -> Self {
        Self {
            capture: None,
            width: 0,
            height: 0,
            empty_reads: 0,
        }
    }

    /// 解像度を取得
    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl Default for OpenCvCamera {
    fn default() -> Self {
        Self::new()
    }
}

fn configure(capture: &mut VideoCapture, request: &CaptureRequest) -> opencv::Result<()> {
    capture.set(videoio::CAP_PROP_FRAME_WIDTH, request.width as f64)?;
    capture.set(videoio::CAP_PROP_FRAME_HEIGHT, request.height as f64)?;
    capture.set(videoio::CAP_PROP_FPS, request.fps as f64)?;
    capture.set(videoio::CAP_PROP_BUFFERSIZE, 1.0)?;
    Ok(())
}

impl CameraDevice for OpenCvCamera {
    fn open(&mut self, request: &CaptureRequest) -> Result<(), SensorError> {
        if request.facing != Facing::Front {
            return Err(SensorError::NoForwardFacing);
        }
        self.close();

        let mut capture = VideoCapture::new(request.index, VideoCaptureAPIs::CAP_ANY as i32)
            .map_err(|e| SensorError::Unavailable(e.to_string()))?;
        let opened = capture
            .is_opened()
            .map_err(|e| SensorError::Unavailable(e.to_string()))?;
        if !opened {
            return Err(SensorError::Unavailable(format!(
                "camera {} is not available",
                request.index
            )));
        }

        configure(&mut capture, request).map_err(|e| SensorError::Configure(e.to_string()))?;

        self.width = capture.get(videoio::CAP_PROP_FRAME_WIDTH).unwrap_or(0.0) as u32;
        self.height = capture.get(videoio::CAP_PROP_FRAME_HEIGHT).unwrap_or(0.0) as u32;
        let fps = capture.get(videoio::CAP_PROP_FPS).unwrap_or(0.0);
        info!(index = request.index, width = self.width, height = self.height, fps, "camera configured");

        self.capture = Some(capture);
        self.empty_reads = 0;
        Ok(())
    }

    /// BGR形式でフレームを読み込む
    fn read_frame(&mut self) -> Result<Option<Frame>, SensorError> {
        let capture = self.capture.as_mut().ok_or(SensorError::Disconnected)?;

        let mut mat = Mat::default();
        let grabbed = capture
            .read(&mut mat)
            .map_err(|e| SensorError::Read(e.to_string()))?;

        if !grabbed || mat.empty() {
            self.empty_reads += 1;
            if self.empty_reads > MAX_EMPTY_READS {
                warn!(reads = self.empty_reads, "camera stopped delivering frames");
                return Err(SensorError::Disconnected);
            }
            return Ok(None);
        }
        self.empty_reads = 0;

        let width = mat.cols() as u32;
        let height = mat.rows() as u32;
        let format = match mat.channels() {
            1 => PixelFormat::Gray8,
            3 => PixelFormat::Bgr8,
            n => return Err(SensorError::Read(format!("unsupported channel count {}", n))),
        };
        let data = mat
            .data_bytes()
            .map_err(|e| SensorError::Read(e.to_string()))?
            .to_vec();

        Ok(Some(Frame::new(width, height, format, data)))
    }

    fn close(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            if let Err(e) = capture.release() {
                warn!("failed to release camera: {}", e);
            }
        }
    }
}
