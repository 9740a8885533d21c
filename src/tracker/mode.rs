use std::sync::{Arc, Mutex};
use tracing::info;

use super::smooth::PointerSmoother;
use crate::config::PointerConfig;
use crate::pose::landmark::{HandLandmark, HandPose};
use crate::sink::{EventSink, PointerUpdate};

/// 現在のポインタ位置（TapAtCursor の送り先が問い合わせる）
#[derive(Debug, Clone, Default)]
pub struct PointerQuery(Arc<Mutex<Option<(f32, f32)>>>);

impl PointerQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// ポインタモードでなければ None
    pub fn get(&self) -> Option<(f32, f32)> {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set(&self, position: Option<(f32, f32)>) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = position;
    }
}

/// 離散ジェスチャーとポインタ操作の切り替え
pub struct ModeController {
    pointer_mode: bool,
    smoother: PointerSmoother,
    query: PointerQuery,
}

impl ModeController {
    pub fn new(config: &PointerConfig) -> Self {
        Self {
            pointer_mode: false,
            smoother: PointerSmoother::from_config(config),
            query: PointerQuery::new(),
        }
    }

    pub fn is_pointer_mode(&self) -> bool {
        self.pointer_mode
    }

    pub fn query(&self) -> PointerQuery {
        self.query.clone()
    }

    pub fn attach_query(&mut self, query: PointerQuery) {
        let position = if self.pointer_mode {
            self.smoother.current().or(Some((0.5, 0.5)))
        } else {
            None
        };
        query.set(position);
        self.query = query;
    }

    /// 状態が変わったら true。同じ値の再設定では何も出さない
    pub fn set_pointer_mode(&mut self, active: bool, sink: &mut dyn EventSink) -> bool {
        if self.pointer_mode == active {
            return false;
        }
        self.pointer_mode = active;
        self.smoother.reset();

        let update = if active {
            PointerUpdate::CENTER
        } else {
            PointerUpdate::HIDE
        };
        self.query.set((!update.is_hide()).then_some((update.x, update.y)));
        sink.on_pointer_update(update);
        info!(pointer_mode = active, "mode switched");
        true
    }

    /// ポインタモード中なら人差し指の先端を平滑化して送る
    pub fn track(&mut self, pose: &HandPose, sink: &mut dyn EventSink) -> Option<PointerUpdate> {
        if !self.pointer_mode {
            return None;
        }
        let tip = pose.get(HandLandmark::IndexTip)?;
        let (x, y) = self.smoother.apply((tip.x, 1.0 - tip.y));
        let update = PointerUpdate::clamped(x, y);
        self.query.set(Some((update.x, update.y)));
        sink.on_pointer_update(update);
        Some(update)
    }

    /// 手を見失ったら平滑化をやり直す
    pub fn hand_lost(&mut self) {
        self.smoother.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::landmark::Landmark;
    use crate::sink::SinkEvent;

    fn pose_with_tip(x: f32, y: f32) -> HandPose {
        let mut lm = vec![Landmark::default(); HandLandmark::COUNT];
        lm[HandLandmark::IndexTip as usize] = Landmark::new(x, y);
        HandPose::detected(lm, 0.9)
    }

    fn pointers(events: &[SinkEvent]) -> Vec<PointerUpdate> {
        events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Pointer(p) => Some(*p),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_toggle_is_idempotent() {
        let mut mode = ModeController::new(&PointerConfig::default());
        let mut sink: Vec<SinkEvent> = Vec::new();
        assert!(!mode.set_pointer_mode(false, &mut sink));
        assert!(mode.set_pointer_mode(true, &mut sink));
        assert!(!mode.set_pointer_mode(true, &mut sink));
        assert!(mode.set_pointer_mode(false, &mut sink));
        assert!(!mode.set_pointer_mode(false, &mut sink));
        assert_eq!(
            pointers(&sink),
            vec![PointerUpdate::CENTER, PointerUpdate::HIDE]
        );
    }

    #[test]
    fn test_query_follows_mode() {
        let mut mode = ModeController::new(&PointerConfig::default());
        let query = mode.query();
        let mut sink: Vec<SinkEvent> = Vec::new();
        assert_eq!(query.get(), None);
        mode.set_pointer_mode(true, &mut sink);
        assert_eq!(query.get(), Some((0.5, 0.5)));
        mode.track(&pose_with_tip(0.2, 0.9), &mut sink);
        let (x, y) = query.get().unwrap();
        assert!((x - 0.2).abs() < 1e-6 && (y - 0.1).abs() < 1e-6);
        mode.set_pointer_mode(false, &mut sink);
        assert_eq!(query.get(), None);
    }

    #[test]
    fn test_track_ignored_in_discrete_mode() {
        let mut mode = ModeController::new(&PointerConfig::default());
        let mut sink: Vec<SinkEvent> = Vec::new();
        assert_eq!(mode.track(&pose_with_tip(0.3, 0.3), &mut sink), None);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_track_converges() {
        let mut mode = ModeController::new(&PointerConfig::default());
        let mut sink: Vec<SinkEvent> = Vec::new();
        mode.set_pointer_mode(true, &mut sink);
        // y は反転されるので 0.9 -> 0.1、0.1 -> 0.9
        let mut xs = Vec::new();
        for i in 0..10 {
            let v = if i == 0 { 0.1 } else { 0.9 };
            let update = mode.track(&pose_with_tip(v, 1.0 - v), &mut sink).unwrap();
            assert!((update.x - update.y).abs() < 1e-5);
            xs.push(update.x);
        }
        assert!(xs.windows(2).all(|w| w[0] <= w[1]));
        assert!(xs.iter().all(|&x| (0.1 - 1e-6..=0.9 + 1e-6).contains(&x)));
        assert!(0.9 - xs[9] < 0.01);
    }

    #[test]
    fn test_mode_switch_resets_smoothing() {
        let mut mode = ModeController::new(&PointerConfig::default());
        let mut sink: Vec<SinkEvent> = Vec::new();
        mode.set_pointer_mode(true, &mut sink);
        mode.track(&pose_with_tip(0.1, 0.5), &mut sink);
        mode.set_pointer_mode(false, &mut sink);
        mode.set_pointer_mode(true, &mut sink);
        let update = mode.track(&pose_with_tip(0.8, 0.5), &mut sink).unwrap();
        assert!((update.x - 0.8).abs() < 1e-6);
    }
}
