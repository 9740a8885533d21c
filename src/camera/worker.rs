use anyhow::{Context, Result};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::session::{CameraDevice, SensorSession};

/// フレームが無いときの待ち時間
const IDLE_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorCommand {
    Open,
    Close,
    Shutdown,
}

/// カメラを専有するワーカースレッド
///
/// セッションはスレッド内に移動し、以後は `SensorCommand` でのみ操作する。
pub struct SensorWorker {
    tx: Sender<SensorCommand>,
    handle: Option<thread::JoinHandle<()>>,
}

impl SensorWorker {
    pub fn spawn<D: CameraDevice + 'static>(session: SensorSession<D>) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("sensor-worker".into())
            .spawn(move || run(session, rx))
            .context("failed to spawn sensor worker")?;
        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    pub fn open(&self) {
        self.send(SensorCommand::Open);
    }

    pub fn close(&self) {
        self.send(SensorCommand::Close);
    }

    /// セッションを同期的に閉じてスレッドを終了させる
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn send(&self, command: SensorCommand) {
        if self.tx.send(command).is_err() {
            warn!(?command, "sensor worker already stopped");
        }
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.tx.send(SensorCommand::Shutdown);
            if handle.join().is_err() {
                warn!("sensor worker panicked");
            }
        }
    }
}

impl Drop for SensorWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<D: CameraDevice>(mut session: SensorSession<D>, rx: Receiver<SensorCommand>) {
    info!("sensor worker started");
    loop {
        match next_command(&session, &rx) {
            Some(SensorCommand::Open) => session.open(Instant::now()),
            Some(SensorCommand::Close) => session.close(),
            Some(SensorCommand::Shutdown) => break,
            None => {}
        }

        session.poll(Instant::now());

        if session.is_capturing() && !session.pump(Instant::now()) {
            thread::sleep(IDLE_POLL);
        }
    }
    session.close();
    debug!(
        captured = session.frames_captured(),
        throttled = session.frames_throttled(),
        "sensor worker stopped"
    );
}

/// キャプチャ中はノンブロッキング、それ以外は再試行期限まで待つ
fn next_command<D: CameraDevice>(
    session: &SensorSession<D>,
    rx: &Receiver<SensorCommand>,
) -> Option<SensorCommand> {
    if session.is_capturing() {
        return match rx.try_recv() {
            Ok(cmd) => Some(cmd),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(SensorCommand::Shutdown),
        };
    }

    match session.next_deadline() {
        Some(deadline) => {
            let timeout = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(timeout) {
                Ok(cmd) => Some(cmd),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => Some(SensorCommand::Shutdown),
            }
        }
        None => Some(rx.recv().unwrap_or(SensorCommand::Shutdown)),
    }
}
