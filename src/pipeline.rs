//! Per-frame gesture logic and the thread that runs it.
//!
//! Inference results and mode toggles arrive on one bounded channel and are
//! handled strictly in order, so a toggle always lands between two frames.

use anyhow::{Context, Result};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, info, warn};

use crate::camera::frame::SessionEpoch;
use crate::config::Config;
use crate::error::InferenceError;
use crate::gesture::{
    classify, ConfirmationEngine, ConfirmationPolicy, Decision, FeatureExtractor, GestureLabel,
    RuleSet,
};
use crate::pose::adapter::InferenceOutcome;
use crate::pose::landmark::HandPose;
use crate::sink::{EventSink, GestureEvent, HandPresence};
use crate::tracker::{ModeController, PointerQuery};

#[derive(Debug)]
pub enum PipelineMessage {
    Inference(InferenceOutcome),
    SetPointerMode(bool),
    Shutdown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames: u64,
    pub hands: u64,
    pub inference_errors: u64,
    pub extract_errors: u64,
    pub stale_results: u64,
    pub gestures: u64,
    pub mode_switches: u64,
}

pub struct GesturePipeline<S: EventSink> {
    extractor: FeatureExtractor,
    discrete: ConfirmationEngine,
    pointer: ConfirmationEngine,
    mode: ModeController,
    sink: S,
    min_confidence: f32,
    cursor_toggle_switches_mode: bool,
    /// 次のフレームで適用するモード
    pending_mode: Option<bool>,
    last_timestamp_us: u64,
    stats: PipelineStats,
}

impl<S: EventSink> GesturePipeline<S> {
    pub fn new(config: &Config, sink: S) -> Self {
        Self {
            extractor: FeatureExtractor::new(&config.features),
            discrete: ConfirmationEngine::new(ConfirmationPolicy::discrete(&config.confirmation)),
            pointer: ConfirmationEngine::new(ConfirmationPolicy::pointer(&config.pointer)),
            mode: ModeController::new(&config.pointer),
            sink,
            min_confidence: config.inference.min_hand_confidence,
            cursor_toggle_switches_mode: config.pipeline.cursor_toggle_switches_mode,
            pending_mode: None,
            last_timestamp_us: 0,
            stats: PipelineStats::default(),
        }
    }

    /// 再起動をまたいで同じ問い合わせ口を使う
    pub fn with_pointer_query(mut self, query: PointerQuery) -> Self {
        self.mode.attach_query(query);
        self
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn is_pointer_mode(&self) -> bool {
        self.mode.is_pointer_mode()
    }

    pub fn pointer_query(&self) -> PointerQuery {
        self.mode.query()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// 推論結果1件を処理する
    pub fn process(&mut self, result: Result<HandPose, InferenceError>, timestamp_us: u64) {
        let pose = match result {
            Ok(pose) => pose,
            Err(e) => {
                // 手なしとは扱わず、状態も変えない
                warn!(timestamp_us, error = %e, "inference failed, frame skipped");
                self.stats.inference_errors += 1;
                return;
            }
        };

        self.last_timestamp_us = self.last_timestamp_us.max(timestamp_us);
        if let Some(active) = self.pending_mode.take() {
            self.switch_mode(active, timestamp_us);
        }
        self.stats.frames += 1;

        if !pose.is_confident(self.min_confidence) {
            self.no_hand();
            return;
        }

        let features = match self.extractor.extract(&pose) {
            Ok(features) => features,
            Err(e) => {
                debug!(error = %e, "feature extraction failed");
                self.stats.extract_errors += 1;
                self.no_hand();
                return;
            }
        };

        self.stats.hands += 1;
        self.sink
            .on_hand_presence(HandPresence::detected(pose.landmark_count(), pose.confidence));

        let decision = if self.mode.is_pointer_mode() {
            self.mode.track(&pose, &mut self.sink);
            let candidate = classify(&features, RuleSet::Pointer);
            self.pointer.observe(candidate, timestamp_us)
        } else {
            let candidate = classify(&features, RuleSet::Discrete);
            self.discrete.observe(candidate, timestamp_us)
        };

        if let Decision::Confirmed(label) = decision {
            info!(gesture = %label, timestamp_us, "gesture confirmed");
            self.stats.gestures += 1;
            self.sink.on_gesture(GestureEvent {
                label,
                timestamp_us,
            });
            if label == GestureLabel::CursorToggle && self.cursor_toggle_switches_mode {
                self.pending_mode = Some(!self.mode.is_pointer_mode());
            }
        }
    }

    /// 外部からのモード切替。次のフレームから効く
    pub fn set_pointer_mode(&mut self, active: bool) -> bool {
        self.pending_mode = None;
        self.switch_mode(active, self.last_timestamp_us)
    }

    pub fn reset(&mut self) {
        self.pending_mode = None;
        self.discrete.reset();
        self.pointer.reset();
        self.mode.hand_lost();
    }

    pub fn note_stale(&mut self) {
        self.stats.stale_results += 1;
    }

    /// 終了時、ポインタ表示中なら隠す
    pub fn shutdown(&mut self) {
        self.pending_mode = None;
        self.mode.set_pointer_mode(false, &mut self.sink);
    }

    fn switch_mode(&mut self, active: bool, at_us: u64) -> bool {
        if !self.mode.set_pointer_mode(active, &mut self.sink) {
            return false;
        }
        self.stats.mode_switches += 1;
        self.discrete.reset();
        self.pointer.reset();
        // 切替の原因になった手の形で即座に戻らないようにする
        let target = if active {
            &mut self.pointer
        } else {
            &mut self.discrete
        };
        target.hold_off(at_us);
        true
    }

    fn no_hand(&mut self) {
        self.sink.on_hand_presence(HandPresence::no_hands());
        self.discrete.hand_lost();
        self.pointer.hand_lost();
        self.mode.hand_lost();
    }
}

/// パイプラインスレッドへの送信口
#[derive(Clone)]
pub struct PipelineSender(SyncSender<PipelineMessage>);

impl PipelineSender {
    /// 受信側が終了していたら false
    pub fn send(&self, message: PipelineMessage) -> bool {
        self.0.send(message).is_ok()
    }
}

pub type SharedStats = Arc<Mutex<PipelineStats>>;

pub struct PipelineThread {
    sender: PipelineSender,
    stats: SharedStats,
    handle: thread::JoinHandle<()>,
}

impl PipelineThread {
    pub fn spawn<S: EventSink + 'static>(
        pipeline: GesturePipeline<S>,
        epoch: SessionEpoch,
        capacity: usize,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        let stats: SharedStats = Arc::new(Mutex::new(PipelineStats::default()));
        let shared = Arc::clone(&stats);
        let handle = thread::Builder::new()
            .name("gesture-pipeline".into())
            .spawn(move || run(pipeline, epoch, rx, shared))
            .context("failed to spawn pipeline thread")?;
        Ok(Self {
            sender: PipelineSender(tx),
            stats,
            handle,
        })
    }

    pub fn sender(&self) -> PipelineSender {
        self.sender.clone()
    }

    pub fn stats(&self) -> PipelineStats {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 残りのメッセージを処理してから終了を待つ
    pub fn shutdown(self) -> PipelineStats {
        self.sender.send(PipelineMessage::Shutdown);
        if self.handle.join().is_err() {
            warn!("pipeline thread panicked");
        }
        *self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn run<S: EventSink>(
    mut pipeline: GesturePipeline<S>,
    epoch: SessionEpoch,
    rx: Receiver<PipelineMessage>,
    stats: SharedStats,
) {
    info!("pipeline started");
    let mut session_epoch = None;
    while let Ok(message) = rx.recv() {
        match message {
            PipelineMessage::Inference(outcome) => {
                if epoch.is_current(outcome.epoch) {
                    // セッションが開き直されたら時間的な状態を捨てる
                    if session_epoch.replace(outcome.epoch).is_some_and(|e| e != outcome.epoch) {
                        pipeline.reset();
                    }
                    pipeline.process(outcome.result, outcome.timestamp_us);
                } else {
                    debug!(epoch = outcome.epoch, "stale inference result dropped");
                    pipeline.note_stale();
                }
            }
            PipelineMessage::SetPointerMode(active) => {
                pipeline.set_pointer_mode(active);
            }
            PipelineMessage::Shutdown => break,
        }
        *stats.lock().unwrap_or_else(|e| e.into_inner()) = pipeline.stats();
    }
    pipeline.shutdown();
    *stats.lock().unwrap_or_else(|e| e.into_inner()) = pipeline.stats();
    info!("pipeline stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gesture::features::tests::synthetic_hand;
    use crate::pose::landmark::{HandLandmark, Landmark};
    use crate::sink::{ChannelSink, PointerUpdate, PresenceStatus, SinkEvent};
    use GestureLabel::*;

    const FRAME_US: u64 = 300_000;

    fn pipeline() -> GesturePipeline<Vec<SinkEvent>> {
        GesturePipeline::new(&Config::default(), Vec::new())
    }

    fn fist() -> HandPose {
        synthetic_hand(false, [false; 4])
    }

    fn index_only() -> HandPose {
        synthetic_hand(false, [true, false, false, false])
    }

    fn two_fingers() -> HandPose {
        synthetic_hand(false, [true, true, false, false])
    }

    fn pinky_only() -> HandPose {
        synthetic_hand(false, [false, false, false, true])
    }

    fn gestures(events: &[SinkEvent]) -> Vec<GestureEvent> {
        events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Gesture(g) => Some(*g),
                _ => None,
            })
            .collect()
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

    fn feed(p: &mut GesturePipeline<Vec<SinkEvent>>, poses: &[HandPose], start: u64) {
        for (i, pose) in poses.iter().enumerate() {
            p.process(Ok(pose.clone()), (start + i as u64) * FRAME_US);
        }
    }

    #[test]
    fn test_fist_twice_scrolls_up_once() {
        let mut p = pipeline();
        feed(&mut p, &[fist(), fist()], 1);
        assert_eq!(
            gestures(p.sink()),
            vec![GestureEvent {
                label: ScrollUp,
                timestamp_us: 2 * FRAME_US
            }]
        );
        feed(&mut p, &[fist(), fist()], 3);
        assert_eq!(gestures(p.sink()).len(), 1);
    }

    #[test]
    fn test_single_swipe_frame_then_no_hand() {
        let mut p = pipeline();
        p.process(Ok(two_fingers()), FRAME_US);
        p.process(Ok(HandPose::absent()), 2 * FRAME_US);
        p.process(Ok(fist()), 3 * FRAME_US);
        assert!(gestures(p.sink()).is_empty());
    }

    #[test]
    fn test_swipe_then_unrecognised_shape_emits_nothing() {
        let mut p = pipeline();
        let middle_only = synthetic_hand(false, [false, true, false, false]);
        p.process(Ok(two_fingers()), FRAME_US);
        p.process(Ok(middle_only), 2 * FRAME_US);
        assert!(gestures(p.sink()).is_empty());
        assert_eq!(p.stats().hands, 2);
    }

    #[test]
    fn test_no_hand_resets_pointer_smoothing() {
        let mut p = pipeline();
        p.set_pointer_mode(true);
        let mut first = index_only();
        first.landmarks[HandLandmark::IndexTip as usize] = Landmark::new(0.1, 0.9);
        p.process(Ok(first), FRAME_US);
        p.process(Ok(HandPose::absent()), 2 * FRAME_US);

        let mut second = index_only();
        second.landmarks[HandLandmark::IndexTip as usize] = Landmark::new(0.9, 0.1);
        p.process(Ok(second), 3 * FRAME_US);
        let last = *pointers(p.sink()).last().unwrap();
        assert!((last.x - 0.9).abs() < 1e-6, "x = {}", last.x);
        assert!((last.y - 0.9).abs() < 1e-6, "y = {}", last.y);
    }

    #[test]
    fn test_presence_once_per_frame() {
        let mut p = pipeline();
        feed(&mut p, &[fist(), HandPose::absent(), index_only()], 1);
        let presence: Vec<_> = p
            .sink()
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Presence(h) => Some(h.status),
                _ => None,
            })
            .collect();
        assert_eq!(
            presence,
            vec![
                PresenceStatus::HandDetected,
                PresenceStatus::NoHands,
                PresenceStatus::HandDetected
            ]
        );
    }

    #[test]
    fn test_low_confidence_is_no_hand() {
        let mut p = pipeline();
        let mut weak = index_only();
        weak.confidence = 0.5;
        feed(&mut p, &[index_only(), weak, index_only()], 1);
        assert!(gestures(p.sink()).is_empty());
        assert_eq!(p.stats().hands, 2);
    }

    #[test]
    fn test_insufficient_landmarks_is_no_hand() {
        let mut p = pipeline();
        let partial = HandPose::detected(vec![Landmark::default(); 10], 0.9);
        feed(&mut p, &[index_only(), partial, index_only()], 1);
        assert!(gestures(p.sink()).is_empty());
        assert_eq!(p.stats().extract_errors, 1);
    }

    #[test]
    fn test_inference_error_leaves_state_untouched() {
        let mut p = pipeline();
        p.process(Ok(index_only()), FRAME_US);
        p.process(Err(InferenceError::Engine("timeout".into())), 2 * FRAME_US);
        p.process(Ok(index_only()), 3 * FRAME_US);
        assert_eq!(
            gestures(p.sink()),
            vec![GestureEvent {
                label: Tap,
                timestamp_us: 3 * FRAME_US
            }]
        );
        assert_eq!(p.stats().inference_errors, 1);
        assert_eq!(p.stats().frames, 2);
    }

    #[test]
    fn test_pointer_mode_only_pointer_labels() {
        let mut p = pipeline();
        p.set_pointer_mode(true);
        // 人差し指だけ: 離散モードなら Tap だがポインタモードでは出ない
        feed(&mut p, &[index_only(), index_only(), index_only()], 10);
        feed(&mut p, &[two_fingers(), two_fingers(), two_fingers()], 13);
        assert!(gestures(p.sink()).is_empty());
        assert_eq!(pointers(p.sink()).len(), 7);

        feed(&mut p, &[fist(), fist(), fist()], 16);
        let labels: Vec<_> = gestures(p.sink()).iter().map(|g| g.label).collect();
        assert_eq!(labels, vec![TapAtCursor]);
    }

    #[test]
    fn test_discrete_mode_emits_no_pointer_updates() {
        let mut p = pipeline();
        feed(&mut p, &[index_only(), two_fingers(), fist()], 1);
        assert!(pointers(p.sink()).is_empty());
    }

    #[test]
    fn test_cursor_toggle_switches_on_next_frame() {
        let mut p = pipeline();
        feed(&mut p, &[pinky_only(), pinky_only()], 1);
        assert_eq!(gestures(p.sink()).last().map(|g| g.label), Some(CursorToggle));
        assert!(!p.is_pointer_mode());

        p.process(Ok(pinky_only()), 3 * FRAME_US);
        assert!(p.is_pointer_mode());
        let ptrs = pointers(p.sink());
        assert_eq!(ptrs.first(), Some(&PointerUpdate::CENTER));

        // 小指を立てたままでも直後に戻らない
        feed(&mut p, &[pinky_only(), pinky_only()], 4);
        assert!(p.is_pointer_mode());
        assert_eq!(gestures(p.sink()).len(), 1);
    }

    #[test]
    fn test_external_toggle_idempotent() {
        let mut p = pipeline();
        assert!(p.set_pointer_mode(true));
        assert!(!p.set_pointer_mode(true));
        assert!(p.set_pointer_mode(false));
        assert!(!p.set_pointer_mode(false));
        assert_eq!(
            pointers(p.sink()),
            vec![PointerUpdate::CENTER, PointerUpdate::HIDE]
        );
    }

    #[test]
    fn test_pointer_follows_index_tip() {
        let mut p = pipeline();
        p.set_pointer_mode(true);
        let mut pose = index_only();
        pose.landmarks[HandLandmark::IndexTip as usize] = Landmark::new(0.25, 0.75);
        p.process(Ok(pose), FRAME_US);
        let last = *pointers(p.sink()).last().unwrap();
        assert!((last.x - 0.25).abs() < 1e-6);
        assert!((last.y - 0.25).abs() < 1e-6);
        assert_eq!(p.pointer_query().get(), Some((last.x, last.y)));
    }

    #[test]
    fn test_shutdown_hides_pointer() {
        let mut p = pipeline();
        p.set_pointer_mode(true);
        p.shutdown();
        assert_eq!(pointers(p.sink()).last(), Some(&PointerUpdate::HIDE));
        p.shutdown();
        assert_eq!(pointers(p.sink()).len(), 2);
    }

    #[test]
    fn test_thread_drops_stale_results() {
        let (sink, rx) = ChannelSink::new();
        let epoch = SessionEpoch::new();
        let current = epoch.advance();
        let thread =
            PipelineThread::spawn(GesturePipeline::new(&Config::default(), sink), epoch.clone(), 4)
                .unwrap();
        let tx = thread.sender();

        for (i, e) in [current, current - 1, current].into_iter().enumerate() {
            tx.send(PipelineMessage::Inference(InferenceOutcome {
                epoch: e,
                timestamp_us: (i as u64 + 1) * FRAME_US,
                result: Ok(index_only()),
            }));
        }
        tx.send(PipelineMessage::SetPointerMode(true));
        let stats = thread.shutdown();

        assert_eq!(stats.frames, 2);
        assert_eq!(stats.stale_results, 1);
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            gestures(&events),
            vec![GestureEvent {
                label: Tap,
                timestamp_us: 3 * FRAME_US
            }]
        );
        // 切替で中央、終了で非表示
        assert_eq!(
            pointers(&events),
            vec![PointerUpdate::CENTER, PointerUpdate::HIDE]
        );
    }
}
