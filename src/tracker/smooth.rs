use crate::config::PointerConfig;

/// EMAベースのポインタ座標平滑化フィルタ
///
/// smoothed = prev * factor + raw * (1 - factor)。factor が大きいほど滑らか。
pub struct PointerSmoother {
    factor: f32,
    prev: Option<(f32, f32)>,
}

impl PointerSmoother {
    pub fn new(factor: f32) -> Self {
        Self { factor, prev: None }
    }

    pub fn from_config(config: &PointerConfig) -> Self {
        Self::new(config.smoothing_factor)
    }

    pub fn apply(&mut self, raw: (f32, f32)) -> (f32, f32) {
        let raw = (raw.0.clamp(0.0, 1.0), raw.1.clamp(0.0, 1.0));
        let prev = match self.prev {
            Some(prev) => prev,
            None => {
                self.prev = Some(raw);
                return raw;
            }
        };

        let f = self.factor;
        let smoothed = (
            (prev.0 * f + raw.0 * (1.0 - f)).clamp(0.0, 1.0),
            (prev.1 * f + raw.1 * (1.0 - f)).clamp(0.0, 1.0),
        );
        self.prev = Some(smoothed);
        smoothed
    }

    pub fn current(&self) -> Option<(f32, f32)> {
        self.prev
    }

    pub fn reset(&mut self) {
        self.prev = None;
    }
}
