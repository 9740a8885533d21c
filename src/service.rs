//! Supervisor that owns the whole capture → inference → gesture chain.
//!
//! `GestureService::run` blocks the calling thread. Control commands and session
//! events share one channel; a fatal camera error tears every worker down and
//! builds a fresh chain after `recovery.fatal_restart_delay_ms`.

use anyhow::{Context, Result};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

use crate::camera::{CameraDevice, SensorSession, SensorWorker, SessionEpoch, SessionEvent, StatusHandle};
use crate::config::Config;
use crate::pipeline::{GesturePipeline, PipelineMessage, PipelineThread};
use crate::pose::{AdapterStats, InferenceEngine, InferenceWorker, LandmarkAdapter};
use crate::sink::EventSink;
use crate::tracker::PointerQuery;

pub type DeviceFactory = Box<dyn FnMut() -> Result<Box<dyn CameraDevice>> + Send>;
pub type EngineFactory = Box<dyn FnMut() -> Result<Box<dyn InferenceEngine>> + Send>;

/// サービスへの外部からの指示
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    SetPointerMode { active: bool },
    Restart,
    Shutdown,
}

#[derive(Debug)]
enum ServiceEvent {
    Control(ControlCommand),
    /// `run` はどの起動世代のセッションから来たか
    Session { run: u64, event: SessionEvent },
}

/// 別スレッドからサービスを操作するためのハンドル
#[derive(Clone)]
pub struct ServiceController {
    tx: Sender<ServiceEvent>,
}

impl ServiceController {
    pub fn send(&self, command: ControlCommand) -> bool {
        self.tx.send(ServiceEvent::Control(command)).is_ok()
    }

    pub fn set_pointer_mode(&self, active: bool) -> bool {
        self.send(ControlCommand::SetPointerMode { active })
    }

    pub fn restart(&self) -> bool {
        self.send(ControlCommand::Restart)
    }

    pub fn shutdown(&self) -> bool {
        self.send(ControlCommand::Shutdown)
    }
}

/// 1回分の起動で作ったワーカー一式
struct Running {
    sensor: SensorWorker,
    inference: InferenceWorker,
    pipeline: PipelineThread,
    adapter_stats: Arc<AdapterStats>,
}

pub struct GestureService<S: EventSink + Clone + 'static> {
    config: Config,
    devices: DeviceFactory,
    engines: EngineFactory,
    sink: S,
    status: StatusHandle,
    pointer: PointerQuery,
    epoch: SessionEpoch,
    run_id: u64,
    restarts: u64,
    tx: Sender<ServiceEvent>,
    rx: Receiver<ServiceEvent>,
}

impl<S: EventSink + Clone + 'static> GestureService<S> {
    pub fn new(config: Config, devices: DeviceFactory, engines: EngineFactory, sink: S) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            config,
            devices,
            engines,
            sink,
            status: StatusHandle::new(),
            pointer: PointerQuery::new(),
            epoch: SessionEpoch::new(),
            run_id: 0,
            restarts: 0,
            tx,
            rx,
        }
    }

    pub fn controller(&self) -> ServiceController {
        ServiceController {
            tx: self.tx.clone(),
        }
    }

    pub fn status(&self) -> StatusHandle {
        self.status.clone()
    }

    pub fn pointer_query(&self) -> PointerQuery {
        self.pointer.clone()
    }

    /// `Shutdown` を受け取るまで戻らない
    pub fn run(mut self) -> Result<()> {
        info!("gesture service starting");
        let mut running = Some(self.start()?);
        let mut restart_at: Option<Instant> = None;
        // 再起動待ちの間に届いたモード切替。次のチェーンに渡す
        let mut deferred_mode: Option<bool> = None;
        let heartbeat = self.config.pipeline.heartbeat_interval();
        let mut next_heartbeat = (!heartbeat.is_zero()).then(|| Instant::now() + heartbeat);

        loop {
            let timeout = [restart_at, next_heartbeat]
                .into_iter()
                .flatten()
                .min()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::from_secs(3600));

            match self.rx.recv_timeout(timeout) {
                Ok(ServiceEvent::Control(command)) => match command {
                    ControlCommand::SetPointerMode { active } => match &running {
                        Some(r) => {
                            r.pipeline.sender().send(PipelineMessage::SetPointerMode(active));
                        }
                        None => {
                            info!(active, "pointer mode change deferred until restart");
                            deferred_mode = Some(active);
                        }
                    },
                    ControlCommand::Restart => {
                        info!("restart requested");
                        self.stop(running.take());
                        running = self.restart(&mut deferred_mode);
                        restart_at = running.is_none().then(|| self.next_restart());
                    }
                    ControlCommand::Shutdown => break,
                },
                Ok(ServiceEvent::Session { run, event }) if run == self.run_id => match event {
                    SessionEvent::Fatal(e) => {
                        error!(error = %e, "fatal camera error, restarting service");
                        self.stop(running.take());
                        self.status.set("Camera device failure - restarting");
                        restart_at = Some(self.next_restart());
                    }
                    SessionEvent::Failed(reason) => {
                        error!(?reason, "camera session failed");
                    }
                    SessionEvent::RetryScheduled { attempt, delay } => {
                        info!(attempt, delay_ms = delay.as_millis() as u64, "camera recovery pending");
                    }
                    SessionEvent::Opened | SessionEvent::Closed => {}
                },
                Ok(ServiceEvent::Session { .. }) => {}
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            let now = Instant::now();
            if restart_at.is_some_and(|at| at <= now) {
                self.restarts += 1;
                running = self.restart(&mut deferred_mode);
                restart_at = running.is_none().then(|| self.next_restart());
            }
            if let Some(at) = next_heartbeat {
                if at <= now {
                    self.heartbeat(running.as_ref());
                    next_heartbeat = Some(now + heartbeat);
                }
            }
        }

        info!("gesture service shutting down");
        self.stop(running.take());
        self.status.set("Gesture detection stopped");
        Ok(())
    }

    fn start(&mut self) -> Result<Running> {
        self.run_id += 1;
        let run = self.run_id;

        let device = (self.devices)().context("failed to create camera device")?;
        let engine = (self.engines)().context("failed to create inference engine")?;

        let pipeline = GesturePipeline::new(&self.config, self.sink.clone())
            .with_pointer_query(self.pointer.clone());
        let pipeline = PipelineThread::spawn(
            pipeline,
            self.epoch.clone(),
            self.config.pipeline.channel_capacity,
        )?;

        let results = pipeline.sender();
        let (mut adapter, inference) = LandmarkAdapter::spawn(
            engine,
            &self.config.inference,
            self.epoch.clone(),
            move |outcome| {
                results.send(PipelineMessage::Inference(outcome));
            },
        )?;
        let adapter_stats = adapter.stats();

        let mut session = SensorSession::new(
            device,
            &self.config.camera,
            &self.config.recovery,
            self.epoch.clone(),
            self.status.clone(),
        );
        session.on_frame_ready(move |frame| {
            adapter.submit(frame);
        });
        let events = self.tx.clone();
        session.set_observer(move |event| {
            let _ = events.send(ServiceEvent::Session { run, event });
        });

        let sensor = SensorWorker::spawn(session)?;
        sensor.open();
        info!(run, "gesture chain started");

        Ok(Running {
            sensor,
            inference,
            pipeline,
            adapter_stats,
        })
    }

    /// 再起動。失敗してもサービスは止めず、呼び出し側が次の再試行を予約する
    fn restart(&mut self, deferred_mode: &mut Option<bool>) -> Option<Running> {
        match self.start() {
            Ok(r) => {
                if let Some(active) = deferred_mode.take() {
                    r.pipeline.sender().send(PipelineMessage::SetPointerMode(active));
                }
                Some(r)
            }
            Err(e) => {
                error!(error = %format!("{:#}", e), "failed to rebuild gesture chain");
                self.status.set("Camera device failure - restarting");
                None
            }
        }
    }

    fn next_restart(&self) -> Instant {
        Instant::now() + self.config.recovery.fatal_restart_delay()
    }

    /// カメラ → 推論 → パイプラインの順に止める
    fn stop(&mut self, running: Option<Running>) {
        let Some(r) = running else {
            return;
        };
        // セッションと一緒にアダプタも破棄され、推論スレッドの入力が閉じる
        r.sensor.shutdown();
        r.inference.join();
        let stats = r.pipeline.shutdown();
        info!(
            run = self.run_id,
            frames = stats.frames,
            gestures = stats.gestures,
            "gesture chain stopped"
        );
    }

    fn heartbeat(&self, running: Option<&Running>) {
        let Some(r) = running else {
            info!(status = %self.status.get(), restarts = self.restarts, "heartbeat (restarting)");
            return;
        };
        let stats = r.pipeline.stats();
        let adapter = r.adapter_stats.snapshot();
        info!(
            status = %self.status.get(),
            frames = stats.frames,
            hands = stats.hands,
            gestures = stats.gestures,
            inference_errors = stats.inference_errors,
            stale = stats.stale_results,
            submitted = adapter.submitted,
            dropped_busy = adapter.dropped_busy,
            restarts = self.restarts,
            "heartbeat"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::session::tests::FakeCamera;
    use crate::camera::{CaptureRequest, Frame, PixelFormat};
    use crate::error::{InferenceError, SensorError};
    use crate::gesture::features::tests::synthetic_hand;
    use crate::gesture::GestureLabel;
    use crate::pose::{HandPose, RgbImage};
    use crate::sink::{ChannelSink, PointerUpdate, SinkEvent};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;

    /// 10ms ごとにフレームを返すカメラ
    struct PacedCamera;

    impl CameraDevice for PacedCamera {
        fn open(&mut self, _request: &CaptureRequest) -> Result<(), SensorError> {
            Ok(())
        }

        fn read_frame(&mut self) -> Result<Option<Frame>, SensorError> {
            thread::sleep(Duration::from_millis(10));
            Ok(Some(Frame::new(2, 2, PixelFormat::Rgb8, vec![0; 12])))
        }

        fn close(&mut self) {}
    }

    struct FistEngine;

    impl InferenceEngine for FistEngine {
        fn detect(&mut self, _image: &RgbImage, _ts: u64) -> Result<HandPose, InferenceError> {
            Ok(synthetic_hand(false, [false; 4]))
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.camera.frame_interval_ms = 0;
        config.recovery.fatal_restart_delay_ms = 20;
        config.pipeline.heartbeat_secs = 0;
        config
    }

    fn engines() -> EngineFactory {
        Box::new(|| -> Result<Box<dyn InferenceEngine>> { Ok(Box::new(FistEngine)) })
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_frames_become_gestures() {
        let (sink, rx) = ChannelSink::new();
        let devices: DeviceFactory =
            Box::new(|| -> Result<Box<dyn CameraDevice>> { Ok(Box::new(PacedCamera)) });
        let service = GestureService::new(test_config(), devices, engines(), sink);
        let controller = service.controller();
        let status = service.status();
        let handle = thread::spawn(move || service.run());

        let mut events = Vec::new();
        let got_scroll = wait_for(|| {
            events.extend(rx.try_iter());
            events.iter().any(|e| {
                matches!(e, SinkEvent::Gesture(g) if g.label == GestureLabel::ScrollUp)
            })
        });
        assert!(got_scroll);
        assert_eq!(status.get(), "Gesture Detection Active");

        controller.set_pointer_mode(true);
        let got_center = wait_for(|| {
            events.extend(rx.try_iter());
            events.contains(&SinkEvent::Pointer(PointerUpdate::CENTER))
        });
        assert!(got_center);

        assert!(controller.shutdown());
        handle.join().unwrap().unwrap();
        events.extend(rx.try_iter());
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, SinkEvent::Pointer(p) if p.is_hide()))
                .count(),
            1
        );
    }

    #[test]
    fn test_fatal_error_restarts_chain() {
        let created = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&created);
        let devices: DeviceFactory = Box::new(move || -> Result<Box<dyn CameraDevice>> {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let mut cam = FakeCamera::default();
            if n == 0 {
                cam.reads.push_back(Err(SensorError::DeviceFailure("hal".into())));
            }
            Ok(Box::new(cam))
        });
        let (sink, _rx) = ChannelSink::new();
        let service = GestureService::new(test_config(), devices, engines(), sink);
        let controller = service.controller();
        let handle = thread::spawn(move || service.run());

        assert!(wait_for(|| created.load(Ordering::SeqCst) >= 2));
        controller.shutdown();
        handle.join().unwrap().unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_manual_restart() {
        let created = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&created);
        let devices: DeviceFactory = Box::new(move || -> Result<Box<dyn CameraDevice>> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeCamera::default()))
        });
        let (sink, _rx) = ChannelSink::new();
        let service = GestureService::new(test_config(), devices, engines(), sink);
        let controller = service.controller();
        let handle = thread::spawn(move || service.run());

        controller.restart();
        controller.shutdown();
        handle.join().unwrap().unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_pointer_mode_survives_fatal_restart() {
        let created = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&created);
        let devices: DeviceFactory = Box::new(move || -> Result<Box<dyn CameraDevice>> {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                let mut cam = FakeCamera::default();
                cam.reads.push_back(Err(SensorError::DeviceFailure("hal".into())));
                Ok(Box::new(cam))
            } else {
                Ok(Box::new(PacedCamera))
            }
        });
        let mut config = test_config();
        config.recovery.fatal_restart_delay_ms = 500;
        let (sink, rx) = ChannelSink::new();
        let service = GestureService::new(config, devices, engines(), sink);
        let controller = service.controller();
        let status = service.status();
        let handle = thread::spawn(move || service.run());

        assert!(wait_for(|| status.get() == "Camera device failure - restarting"));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(created.load(Ordering::SeqCst), 1);
        controller.set_pointer_mode(true);

        let mut events = Vec::new();
        let got_center = wait_for(|| {
            events.extend(rx.try_iter());
            events.contains(&SinkEvent::Pointer(PointerUpdate::CENTER))
        });
        assert!(got_center);
        assert_eq!(created.load(Ordering::SeqCst), 2);

        controller.shutdown();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_restart_factory_error_is_retried() {
        let created = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&created);
        let devices: DeviceFactory = Box::new(move || -> Result<Box<dyn CameraDevice>> {
            match counter.fetch_add(1, Ordering::SeqCst) {
                0 => {
                    let mut cam = FakeCamera::default();
                    cam.reads.push_back(Err(SensorError::DeviceFailure("hal".into())));
                    Ok(Box::new(cam))
                }
                1 => anyhow::bail!("camera busy"),
                _ => Ok(Box::new(FakeCamera::default())),
            }
        });
        let (sink, _rx) = ChannelSink::new();
        let service = GestureService::new(test_config(), devices, engines(), sink);
        let controller = service.controller();
        let handle = thread::spawn(move || service.run());

        assert!(wait_for(|| created.load(Ordering::SeqCst) >= 3));
        controller.shutdown();
        handle.join().unwrap().unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_device_factory_error_propagates() {
        let devices: DeviceFactory =
            Box::new(|| -> Result<Box<dyn CameraDevice>> { anyhow::bail!("no camera backend") });
        let (sink, _rx) = ChannelSink::new();
        let service = GestureService::new(test_config(), devices, engines(), sink);
        let err = service.run().unwrap_err();
        assert!(format!("{:#}", err).contains("no camera backend"));
    }
}
