use std::time::{Duration, Instant};

/// 最小処理間隔を強制するフレーム間引き
///
/// 間隔内に届いたフレームは取得して即解放する（キューに溜めない）。
#[derive(Debug, Clone)]
pub struct FrameThrottle {
    min_interval: Duration,
    last_admitted: Option<Instant>,
}

impl FrameThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_admitted: None,
        }
    }

    /// このフレームを処理すべきなら true
    pub fn admit(&mut self, now: Instant) -> bool {
        match self.last_admitted {
            Some(last) if now.saturating_duration_since(last) < self.min_interval => false,
            _ => {
                self.last_admitted = Some(now);
                true
            }
        }
    }

    pub fn reset(&mut self) {
        self.last_admitted = None;
    }
}
