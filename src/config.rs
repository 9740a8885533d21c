use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub features: FeatureConfig,
    #[serde(default)]
    pub confirmation: ConfirmationConfig,
    #[serde(default)]
    pub pointer: PointerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// デバイス番号（前面カメラ）
    #[serde(default = "default_camera_index")]
    pub index: i32,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,
    /// これより短い間隔で届いたフレームは処理せず捨てる（ミリ秒）
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
}

fn default_camera_index() -> i32 { 0 }
fn default_width() -> u32 { 640 }
fn default_height() -> u32 { 480 }
fn default_fps() -> u32 { 30 }
fn default_frame_interval_ms() -> u64 { 300 }

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            index: default_camera_index(),
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            frame_interval_ms: default_frame_interval_ms(),
        }
    }
}

impl CameraConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// 致命的エラー後、サービス再起動までの待ち時間
    #[serde(default = "default_fatal_restart_delay_ms")]
    pub fatal_restart_delay_ms: u64,
}

fn default_max_restart_attempts() -> u32 { 5 }
fn default_base_delay_ms() -> u64 { 3000 }
fn default_max_delay_ms() -> u64 { 15000 }
fn default_fatal_restart_delay_ms() -> u64 { 2000 }

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_restart_attempts: default_max_restart_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            fatal_restart_delay_ms: default_fatal_restart_delay_ms(),
        }
    }
}

impl RecoveryConfig {
    /// n回目の再試行までの待ち時間: min(base * n, max)
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let ms = self.base_delay_ms.saturating_mul(attempt as u64).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    pub fn fatal_restart_delay(&self) -> Duration {
        Duration::from_millis(self.fatal_restart_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InferenceConfig {
    /// これ未満の信頼度の手は "手なし" として扱う
    #[serde(default = "default_min_hand_confidence")]
    pub min_hand_confidence: f32,
    /// 推論前に適用する回転（0, 90, 180, 270 度）
    #[serde(default = "default_rotation")]
    pub rotation: u16,
    /// 左右反転（前面カメラ）
    #[serde(default = "default_mirror")]
    pub mirror: bool,
    #[serde(default = "default_model_path")]
    pub model_path: String,
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    #[serde(default = "default_input_name")]
    pub input_name: String,
    #[serde(default = "default_landmarks_output")]
    pub landmarks_output: String,
    #[serde(default = "default_score_output")]
    pub score_output: String,
}

fn default_min_hand_confidence() -> f32 { 0.7 }
fn default_rotation() -> u16 { 270 }
fn default_mirror() -> bool { true }
fn default_model_path() -> String { "models/hand_landmark.onnx".to_string() }
fn default_input_size() -> u32 { 224 }
fn default_input_name() -> String { "input_1".to_string() }
fn default_landmarks_output() -> String { "Identity".to_string() }
fn default_score_output() -> String { "Identity_1".to_string() }

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            min_hand_confidence: default_min_hand_confidence(),
            rotation: default_rotation(),
            mirror: default_mirror(),
            model_path: default_model_path(),
            input_size: default_input_size(),
            input_name: default_input_name(),
            landmarks_output: default_landmarks_output(),
            score_output: default_score_output(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeatureConfig {
    /// 指先が付け根より上にあると判定する最小距離（正規化Y）
    #[serde(default = "default_finger_threshold")]
    pub finger_threshold: f32,
    /// 親指の横方向の判定マージン（正規化X）
    #[serde(default = "default_thumb_threshold")]
    pub thumb_threshold: f32,
}

fn default_finger_threshold() -> f32 { 0.05 }
fn default_thumb_threshold() -> f32 { 0.05 }

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            finger_threshold: default_finger_threshold(),
            thumb_threshold: default_thumb_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmationConfig {
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// 静的ジェスチャーの確定に必要な連続フレーム数
    #[serde(default = "default_stability_frames")]
    pub stability_frames: u32,
}

fn default_cooldown_ms() -> u64 { 1500 }
fn default_stability_frames() -> u32 { 2 }

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: default_cooldown_ms(),
            stability_frames: default_stability_frames(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PointerConfig {
    /// 大きいほど滑らか（遅延も増える）
    #[serde(default = "default_smoothing_factor")]
    pub smoothing_factor: f32,
    #[serde(default = "default_pointer_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_stability_frames")]
    pub stability_frames: u32,
}

fn default_smoothing_factor() -> f32 { 0.5 }
fn default_pointer_cooldown_ms() -> u64 { 800 }

impl Default for PointerConfig {
    fn default() -> Self {
        Self {
            smoothing_factor: default_smoothing_factor(),
            cooldown_ms: default_pointer_cooldown_ms(),
            stability_frames: default_stability_frames(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// 確定した CursorToggle でポインタモードを切り替える
    #[serde(default = "default_cursor_toggle_switches_mode")]
    pub cursor_toggle_switches_mode: bool,
}

fn default_channel_capacity() -> usize { 4 }
fn default_heartbeat_secs() -> u64 { 30 }
fn default_cursor_toggle_switches_mode() -> bool { true }

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            heartbeat_secs: default_heartbeat_secs(),
            cursor_toggle_switches_mode: default_cursor_toggle_switches_mode(),
        }
    }
}

impl PipelineConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

fn default_listen_addr() -> String { "127.0.0.1:9400".to_string() }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// 読み込みに失敗したらデフォルト設定で続行する
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path.as_ref()) {
            Ok(config) => config,
            Err(e) => {
                warn!("config {} not used ({:#}), falling back to defaults", path.as_ref().display(), e);
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let s = self.pointer.smoothing_factor;
        if !(0.0..1.0).contains(&s) {
            bail!("pointer.smoothing_factor must be in [0, 1), got {}", s);
        }
        if self.confirmation.stability_frames == 0 || self.pointer.stability_frames == 0 {
            bail!("stability_frames must be at least 1");
        }
        if self.recovery.max_restart_attempts == 0 {
            bail!("recovery.max_restart_attempts must be at least 1");
        }
        if self.recovery.base_delay_ms > self.recovery.max_delay_ms {
            bail!(
                "recovery.base_delay_ms ({}) exceeds max_delay_ms ({})",
                self.recovery.base_delay_ms,
                self.recovery.max_delay_ms
            );
        }
        if !matches!(self.inference.rotation, 0 | 90 | 180 | 270) {
            bail!("inference.rotation must be 0, 90, 180 or 270, got {}", self.inference.rotation);
        }
        if self.pipeline.channel_capacity == 0 {
            bail!("pipeline.channel_capacity must be at least 1");
        }
        Ok(())
    }
}
