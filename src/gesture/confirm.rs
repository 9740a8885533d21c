//! Debounce and cooldown for classifier candidates.
//!
//! Static labels need `stability_frames` identical candidates in a row. Motion
//! labels are accepted on their first frame and fire on the next frame that still
//! has a recognised hand shape, so a single-frame blip followed by hand loss or a
//! `None` candidate never fires. After any
//! confirmation every label is suppressed for `cooldown`.

use std::time::Duration;

use super::classifier::GestureLabel;
use crate::config::{ConfirmationConfig, PointerConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationPolicy {
    pub cooldown: Duration,
    pub stability_frames: u32,
}

impl ConfirmationPolicy {
    pub fn discrete(config: &ConfirmationConfig) -> Self {
        Self {
            cooldown: Duration::from_millis(config.cooldown_ms),
            stability_frames: config.stability_frames,
        }
    }

    pub fn pointer(config: &PointerConfig) -> Self {
        Self {
            cooldown: Duration::from_millis(config.cooldown_ms),
            stability_frames: config.stability_frames,
        }
    }
}

/// 1フレームの判定結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// このフレームで確定。イベントを1回だけ出す
    Confirmed(GestureLabel),
    /// クールダウン中。直前に確定したラベルを保持している
    Held(GestureLabel),
    /// 安定待ち、または次フレームでの発火待ち
    Pending,
    Idle,
}

#[derive(Debug, Clone)]
pub struct ConfirmationEngine {
    policy: ConfirmationPolicy,
    candidate: Option<GestureLabel>,
    stability_count: u32,
    /// 次に手があるフレームで発火する動きジェスチャー
    armed: Option<GestureLabel>,
    last_confirmed: Option<GestureLabel>,
    /// クールダウンの起点 (µs)。手を見失っても残す
    last_confirmed_at: Option<u64>,
}

impl ConfirmationEngine {
    pub fn new(policy: ConfirmationPolicy) -> Self {
        Self {
            policy,
            candidate: None,
            stability_count: 0,
            armed: None,
            last_confirmed: None,
            last_confirmed_at: None,
        }
    }

    pub fn policy(&self) -> ConfirmationPolicy {
        self.policy
    }

    pub fn candidate(&self) -> Option<GestureLabel> {
        self.candidate
    }

    pub fn stability_count(&self) -> u32 {
        self.stability_count
    }

    pub fn last_confirmed(&self) -> Option<GestureLabel> {
        self.last_confirmed
    }

    /// 手が写っているフレームごとに呼ぶ
    pub fn observe(&mut self, candidate: Option<GestureLabel>, now_us: u64) -> Decision {
        // 認識できない手の形が来たら待機中の動きジェスチャーも捨てる
        let armed = self.armed.take().filter(|_| candidate.is_some());
        self.track(candidate);

        if let Some(label) = armed {
            if !self.in_cooldown(now_us) {
                self.confirm(label, now_us);
                return Decision::Confirmed(label);
            }
        }

        if self.in_cooldown(now_us) {
            return match self.last_confirmed {
                Some(label) => Decision::Held(label),
                None => Decision::Idle,
            };
        }

        let Some(label) = candidate else {
            return Decision::Idle;
        };

        if label.is_motion() {
            self.armed = Some(label);
            return Decision::Pending;
        }

        if self.stability_count >= self.policy.stability_frames {
            self.confirm(label, now_us);
            Decision::Confirmed(label)
        } else {
            Decision::Pending
        }
    }

    /// 手を見失った。カウンタと記憶を捨てるがクールダウンの起点は残す
    pub fn hand_lost(&mut self) {
        self.candidate = None;
        self.stability_count = 0;
        self.armed = None;
        self.last_confirmed = None;
    }

    pub fn reset(&mut self) {
        self.hand_lost();
        self.last_confirmed_at = None;
    }

    /// モード切替直後、`now_us` から1クールダウン分は何も確定させない
    pub fn hold_off(&mut self, now_us: u64) {
        self.reset();
        self.last_confirmed_at = Some(now_us);
    }

    pub fn in_cooldown(&self, now_us: u64) -> bool {
        match self.last_confirmed_at {
            Some(at) => now_us.saturating_sub(at) < self.policy.cooldown.as_micros() as u64,
            None => false,
        }
    }

    fn track(&mut self, candidate: Option<GestureLabel>) {
        match candidate {
            None => {
                self.candidate = None;
                self.stability_count = 0;
            }
            Some(label) if self.candidate == Some(label) => {
                self.stability_count = self.stability_count.saturating_add(1);
            }
            Some(label) => {
                self.candidate = Some(label);
                self.stability_count = 1;
            }
        }
    }

    fn confirm(&mut self, label: GestureLabel, now_us: u64) {
        self.last_confirmed = Some(label);
        self.last_confirmed_at = Some(now_us);
        self.stability_count = 0;
        self.armed = None;
    }
}
