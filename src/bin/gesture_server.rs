//! Gesture server: captures the front camera, runs hand-landmark inference and
//! streams confirmed gestures and pointer updates to dispatchers over TCP.
//!
//! usage: gesture_server [gesture.toml]
//!
//! Signals: SIGUSR1 toggles pointer mode, SIGUSR2 restarts the capture chain,
//! SIGINT / SIGTERM shut down.

use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use signal_hook::consts::{SIGINT, SIGTERM, SIGUSR1, SIGUSR2};
use signal_hook::iterator::Signals;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

use handsfree_gesture::camera::{CameraDevice, OpenCvCamera, StatusHandle};
use handsfree_gesture::config::Config;
use handsfree_gesture::logging;
use handsfree_gesture::pose::{InferenceEngine, OnnxHandLandmarker};
use handsfree_gesture::protocol::{self, ServerMessage};
use handsfree_gesture::service::{GestureService, ServiceController};
use handsfree_gesture::sink::ChannelSink;
use handsfree_gesture::tracker::PointerQuery;

const DEFAULT_CONFIG: &str = "gesture.toml";

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

fn spawn_signal_thread(controller: ServiceController, pointer: PointerQuery) -> Result<()> {
    let mut signals = Signals::new([SIGUSR1, SIGUSR2, SIGINT, SIGTERM])?;
    thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            for signal in signals.forever() {
                match signal {
                    SIGUSR1 => {
                        let active = pointer.get().is_none();
                        info!("[signal] pointer mode -> {}", active);
                        controller.set_pointer_mode(active);
                    }
                    SIGUSR2 => {
                        info!("[signal] restart");
                        controller.restart();
                    }
                    _ => {
                        info!("[signal] shutdown");
                        controller.shutdown();
                        break;
                    }
                }
            }
        })?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Status watcher
// ---------------------------------------------------------------------------

/// 状態文字列が変わったら全クライアントへ流す
async fn watch_status(status: StatusHandle, events: broadcast::Sender<ServerMessage>) {
    let mut last = String::new();
    let mut interval = tokio::time::interval(Duration::from_millis(500));
    loop {
        interval.tick().await;
        let current = status.get();
        if current != last {
            info!("[status] {}", current);
            let _ = events.send(ServerMessage::Status {
                message: current.clone(),
            });
            last = current;
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let log_path = logging::init("gesture_server")?;
    info!("Gesture Server ({})", env!("GIT_VERSION"));
    info!("Log: {}", log_path.display());

    let config = Config::load_or_default(&config_path);
    info!(
        "[config] camera={} {}x{}@{} interval={}ms model={} listen={}",
        config.camera.index,
        config.camera.width,
        config.camera.height,
        config.camera.fps,
        config.camera.frame_interval_ms,
        config.inference.model_path,
        config.server.listen_addr
    );

    let inference_config = config.inference.clone();
    let (sink, sink_events) = ChannelSink::new();
    let service = GestureService::new(
        config.clone(),
        Box::new(|| -> Result<Box<dyn CameraDevice>> { Ok(Box::new(OpenCvCamera::new())) }),
        Box::new(move || -> Result<Box<dyn InferenceEngine>> {
            Ok(Box::new(OnnxHandLandmarker::new(&inference_config)?))
        }),
        sink,
    );
    let controller = service.controller();
    let pointer = service.pointer_query();
    let status = service.status();

    let service_thread = thread::Builder::new()
        .name("gesture-service".into())
        .spawn(move || service.run())
        .context("failed to spawn service thread")?;

    // パイプラインのイベントを全クライアントへ配る
    let (events, _) = broadcast::channel::<ServerMessage>(256);
    {
        let events = events.clone();
        thread::Builder::new()
            .name("dispatch".into())
            .spawn(move || {
                for event in sink_events {
                    let _ = events.send(ServerMessage::from(event));
                }
            })?;
    }
    tokio::spawn(watch_status(status.clone(), events.clone()));
    spawn_signal_thread(controller.clone(), pointer.clone())?;

    let listener = TcpListener::bind(&config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen_addr))?;
    info!("[tcp] listening on {}", config.server.listen_addr);

    let mut service_done = tokio::task::spawn_blocking(move || service_thread.join());
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (tcp, addr) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("[tcp] accept failed: {}", e);
                        continue;
                    }
                };
                tcp.set_nodelay(true)?;
                info!("[tcp] dispatcher connected: {}", addr);

                let mut stream = protocol::message_stream(tcp);
                let subscription = events.subscribe();
                let controller = controller.clone();
                let pointer = pointer.clone();
                let greeting = ServerMessage::Status { message: status.get() };
                tokio::spawn(async move {
                    let result = match protocol::send_message(&mut stream, &greeting).await {
                        Ok(()) => protocol::serve_client(stream, subscription, controller, pointer).await,
                        Err(e) => Err(e),
                    };
                    match result {
                        Ok(()) => info!("[tcp] dispatcher disconnected: {}", addr),
                        Err(e) => warn!("[tcp] session error ({}): {:#}", addr, e),
                    }
                });
            }
            joined = &mut service_done => {
                match joined {
                    Ok(Ok(Ok(()))) => info!("service stopped"),
                    Ok(Ok(Err(e))) => return Err(e.context("gesture service failed")),
                    Ok(Err(_)) => bail!("gesture service panicked"),
                    Err(e) => return Err(e.into()),
                }
                break;
            }
        }
    }

    Ok(())
}
