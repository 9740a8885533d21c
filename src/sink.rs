//! Outputs of the gesture pipeline.
//!
//! The pipeline talks only to an [`EventSink`]. In the service the sink is a
//! [`ChannelSink`] whose receiver is drained by the dispatcher.

use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, Receiver, Sender};
use tracing::debug;

use crate::gesture::GestureLabel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GestureEvent {
    pub label: GestureLabel,
    pub timestamp_us: u64,
}

/// オーバーレイ用のポインタ座標（正規化、範囲外は非表示）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointerUpdate {
    pub x: f32,
    pub y: f32,
}

impl PointerUpdate {
    pub const CENTER: PointerUpdate = PointerUpdate { x: 0.5, y: 0.5 };
    pub const HIDE: PointerUpdate = PointerUpdate { x: -1.0, y: -1.0 };

    /// [0, 1] に収めて作る
    pub fn clamped(x: f32, y: f32) -> Self {
        Self {
            x: x.clamp(0.0, 1.0),
            y: y.clamp(0.0, 1.0),
        }
    }

    pub fn is_hide(&self) -> bool {
        self.x < 0.0 || self.y < 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceStatus {
    HandDetected,
    NoHands,
}

impl PresenceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HandDetected => "hand_detected",
            Self::NoHands => "no_hands",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HandPresence {
    pub status: PresenceStatus,
    pub landmark_count: usize,
    pub confidence: f32,
}

impl HandPresence {
    pub fn no_hands() -> Self {
        Self {
            status: PresenceStatus::NoHands,
            landmark_count: 0,
            confidence: 0.0,
        }
    }

    pub fn detected(landmark_count: usize, confidence: f32) -> Self {
        Self {
            status: PresenceStatus::HandDetected,
            landmark_count,
            confidence,
        }
    }
}

pub trait EventSink: Send {
    fn on_gesture(&mut self, event: GestureEvent);
    fn on_pointer_update(&mut self, update: PointerUpdate);
    fn on_hand_presence(&mut self, presence: HandPresence);
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SinkEvent {
    Gesture(GestureEvent),
    Pointer(PointerUpdate),
    Presence(HandPresence),
}

/// 受け取ったイベントを順に溜める
impl EventSink for Vec<SinkEvent> {
    fn on_gesture(&mut self, event: GestureEvent) {
        self.push(SinkEvent::Gesture(event));
    }

    fn on_pointer_update(&mut self, update: PointerUpdate) {
        self.push(SinkEvent::Pointer(update));
    }

    fn on_hand_presence(&mut self, presence: HandPresence) {
        self.push(SinkEvent::Presence(presence));
    }
}

/// ディスパッチ側のスレッド・タスクへイベントを流す
#[derive(Clone)]
pub struct ChannelSink {
    tx: Sender<SinkEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, Receiver<SinkEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: SinkEvent) {
        if self.tx.send(event).is_err() {
            debug!(?event, "dispatcher gone, event dropped");
        }
    }
}

impl EventSink for ChannelSink {
    fn on_gesture(&mut self, event: GestureEvent) {
        self.forward(SinkEvent::Gesture(event));
    }

    fn on_pointer_update(&mut self, update: PointerUpdate) {
        self.forward(SinkEvent::Pointer(update));
    }

    fn on_hand_presence(&mut self, presence: HandPresence) {
        self.forward(SinkEvent::Presence(presence));
    }
}
