//! Hand-off between the sensor worker and the inference engine.
//!
//! The sensor side calls [`LandmarkAdapter::submit`] from its frame callback. At
//! most one frame is in flight; anything arriving while the engine is busy is
//! dropped on the spot. The engine runs on its own thread and reports every
//! result through the callback given to [`LandmarkAdapter::spawn`].

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

use super::landmark::HandPose;
use super::preprocess::{orient, RgbImage};
use crate::camera::frame::{Frame, SessionEpoch};
use crate::config::InferenceConfig;
use crate::error::InferenceError;

/// 手ランドマーク推論エンジン
pub trait InferenceEngine: Send {
    /// `timestamp_us` は呼び出しごとに厳密に増加する
    fn detect(&mut self, image: &RgbImage, timestamp_us: u64) -> Result<HandPose, InferenceError>;
}

impl<E: InferenceEngine + ?Sized> InferenceEngine for Box<E> {
    fn detect(&mut self, image: &RgbImage, timestamp_us: u64) -> Result<HandPose, InferenceError> {
        (**self).detect(image, timestamp_us)
    }
}

/// 推論結果（推論スレッドから非同期に届く）
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceOutcome {
    pub epoch: u64,
    pub timestamp_us: u64,
    pub result: Result<HandPose, InferenceError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Submitted,
    /// 前のフレームが処理中
    Busy,
    /// 古いセッションのフレーム
    Stale,
    /// 推論スレッドが終了している
    Closed,
}

#[derive(Debug, Default)]
pub struct AdapterStats {
    submitted: AtomicU64,
    dropped_busy: AtomicU64,
    dropped_stale: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdapterCounters {
    pub submitted: u64,
    pub dropped_busy: u64,
    pub dropped_stale: u64,
}

impl AdapterStats {
    pub fn snapshot(&self) -> AdapterCounters {
        AdapterCounters {
            submitted: self.submitted.load(Ordering::Relaxed),
            dropped_busy: self.dropped_busy.load(Ordering::Relaxed),
            dropped_stale: self.dropped_stale.load(Ordering::Relaxed),
        }
    }
}

pub struct LandmarkAdapter {
    tx: SyncSender<Frame>,
    in_flight: Arc<AtomicBool>,
    last_timestamp_us: Option<u64>,
    epoch: SessionEpoch,
    stats: Arc<AdapterStats>,
}

/// 推論スレッドのハンドル。アダプタが破棄されると終了する
pub struct InferenceWorker {
    handle: thread::JoinHandle<()>,
}

impl InferenceWorker {
    pub fn join(self) {
        if self.handle.join().is_err() {
            warn!("inference worker panicked");
        }
    }
}

impl LandmarkAdapter {
    /// 推論スレッドを起動し、アダプタとスレッドハンドルを返す
    pub fn spawn<E, F>(
        engine: E,
        config: &InferenceConfig,
        epoch: SessionEpoch,
        on_result: F,
    ) -> Result<(Self, InferenceWorker)>
    where
        E: InferenceEngine + 'static,
        F: FnMut(InferenceOutcome) + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel::<Frame>(1);
        let in_flight = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            engine,
            rotation: config.rotation,
            mirror: config.mirror,
            in_flight: Arc::clone(&in_flight),
            epoch: epoch.clone(),
        };
        let handle = thread::Builder::new()
            .name("inference-worker".into())
            .spawn(move || worker.run(rx, on_result))
            .context("failed to spawn inference worker")?;

        let adapter = Self {
            tx,
            in_flight,
            last_timestamp_us: None,
            epoch,
            stats: Arc::new(AdapterStats::default()),
        };
        Ok((adapter, InferenceWorker { handle }))
    }

    pub fn stats(&self) -> Arc<AdapterStats> {
        Arc::clone(&self.stats)
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// フレームを推論に回す。処理中なら捨てる（キューに溜めない）
    pub fn submit(&mut self, mut frame: Frame) -> SubmitOutcome {
        if !self.epoch.is_current(frame.epoch) {
            self.stats.dropped_stale.fetch_add(1, Ordering::Relaxed);
            return SubmitOutcome::Stale;
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.stats.dropped_busy.fetch_add(1, Ordering::Relaxed);
            return SubmitOutcome::Busy;
        }

        frame.timestamp_us = match self.last_timestamp_us {
            Some(last) if frame.timestamp_us <= last => last + 1,
            _ => frame.timestamp_us,
        };
        let timestamp_us = frame.timestamp_us;

        match self.tx.try_send(frame) {
            Ok(()) => {
                self.last_timestamp_us = Some(timestamp_us);
                self.stats.submitted.fetch_add(1, Ordering::Relaxed);
                SubmitOutcome::Submitted
            }
            Err(TrySendError::Full(_)) => {
                self.in_flight.store(false, Ordering::Release);
                self.stats.dropped_busy.fetch_add(1, Ordering::Relaxed);
                SubmitOutcome::Busy
            }
            Err(TrySendError::Disconnected(_)) => {
                self.in_flight.store(false, Ordering::Release);
                SubmitOutcome::Closed
            }
        }
    }
}

struct Worker<E> {
    engine: E,
    rotation: u16,
    mirror: bool,
    in_flight: Arc<AtomicBool>,
    epoch: SessionEpoch,
}

impl<E: InferenceEngine> Worker<E> {
    fn run<F: FnMut(InferenceOutcome)>(mut self, rx: Receiver<Frame>, mut on_result: F) {
        info!("inference worker started");
        while let Ok(frame) = rx.recv() {
            let epoch = frame.epoch;
            let timestamp_us = frame.timestamp_us;

            if !self.epoch.is_current(epoch) {
                debug!(epoch, "discarding frame from closed session");
                self.in_flight.store(false, Ordering::Release);
                continue;
            }

            let image = orient(&frame, self.rotation, self.mirror);
            drop(frame);
            let result = image.and_then(|image| self.engine.detect(&image, timestamp_us));

            on_result(InferenceOutcome {
                epoch,
                timestamp_us,
                result,
            });
            self.in_flight.store(false, Ordering::Release);
        }
        info!("inference worker stopped");
    }
}
