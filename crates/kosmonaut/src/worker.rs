//! Asynchronous worker socket.
//!
//! The worker keeps one long-lived connection to the broker. Its lifecycle
//! is an explicit state loop: connect (retrying forever), announce with
//! `RD`, then read until the connection dies, the consumer stops the
//! worker, or the broker reports 402.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Notify};
use tokio::time::{timeout, Instant};
use tracing::debug;
use webrocket_proto::{Packet, SocketKind, Status};

use crate::error::Error;
use crate::message::{parse_trigger, Message};
use crate::socket::{Connection, Socket};

/// Delay between reconnect attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Interval between heartbeat messages.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);

/// Timing knobs for the worker loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Wait between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Heartbeat cadence; the read deadline is derived from it.
    pub heartbeat_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            reconnect_delay: RECONNECT_DELAY,
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }
}

impl WorkerConfig {
    /// How long a read may block before the connection is considered dead.
    fn read_deadline(&self) -> Duration {
        2 * self.heartbeat_interval + Duration::from_secs(1)
    }

    /// Write deadline used while (re)connecting.
    fn write_deadline(&self) -> Duration {
        2 * self.heartbeat_interval
    }
}

/// A DLR-style backend worker.
pub struct Worker {
    socket: Socket,
    config: WorkerConfig,
    running: Arc<AtomicBool>,
    stop: Arc<Notify>,
}

impl Worker {
    /// Configure a worker for the given `wr://` URL with default timings.
    pub fn new(uri: &str) -> Result<Worker, Error> {
        Worker::with_config(uri, WorkerConfig::default())
    }

    /// Configure a worker with explicit timings.
    pub fn with_config(uri: &str, config: WorkerConfig) -> Result<Worker, Error> {
        Ok(Worker {
            socket: Socket::new(SocketKind::Dlr, uri)?,
            config,
            running: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(Notify::new()),
        })
    }

    /// Start the worker loop and return its message stream.
    ///
    /// The stream ends when [`stop`](Worker::stop) is called, the consumer
    /// drops the receiver, or the broker answers 402.
    pub fn run(&self) -> mpsc::Receiver<Message> {
        self.running.store(true, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(run_loop(
            self.socket.clone(),
            self.config.clone(),
            Arc::clone(&self.running),
            Arc::clone(&self.stop),
            tx,
        ));
        rx
    }

    /// Terminate the worker loop. A `QT` frame is sent on the way out.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stop.notify_waiters();
    }

    /// Whether the loop has been started and not yet stopped.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

async fn run_loop(
    socket: Socket,
    config: WorkerConfig,
    running: Arc<AtomicBool>,
    stop: Arc<Notify>,
    ex: mpsc::Sender<Message>,
) {
    'reconnect: loop {
        if !running.load(Ordering::SeqCst) {
            return;
        }
        let mut conn = match announce(&socket, &config).await {
            Ok(conn) => conn,
            Err(err) => {
                debug!(error = %err, "backend unreachable, retrying");
                tokio::select! {
                    _ = stop.notified() => return,
                    _ = tokio::time::sleep(config.reconnect_delay) => continue 'reconnect,
                }
            }
        };
        let mut heartbeat_at = Instant::now() + config.heartbeat_interval;

        loop {
            if !running.load(Ordering::SeqCst) {
                quit(&mut conn, &config).await;
                return;
            }
            let frames = tokio::select! {
                _ = stop.notified() => {
                    quit(&mut conn, &config).await;
                    return;
                }
                read = timeout(config.read_deadline(), conn.next()) => match read {
                    Ok(Some(Ok(frames))) => frames,
                    // Deadline, EOF or a transport error all mean the same
                    // thing here: the connection is gone.
                    Ok(Some(Err(_))) | Ok(None) | Err(_) => continue 'reconnect,
                },
            };
            if frames.is_empty() {
                continue;
            }
            match frames[0].as_str() {
                "HB" => {}
                "QT" => {
                    // The endpoint is going away; find another one.
                    continue 'reconnect;
                }
                "TR" => {
                    if ex.send(parse_trigger(&frames[1..])).await.is_err() {
                        return;
                    }
                }
                "ER" => {
                    let status = frames
                        .get(1)
                        .and_then(|raw| raw.parse::<u16>().ok())
                        .and_then(Status::from_code);
                    let fatal = status == Some(Status::Unauthorized);
                    let message = match status {
                        Some(status) => Message::Error(Error::Status(status)),
                        None => Message::Error(Error::UnknownResponse),
                    };
                    let delivered = ex.send(message).await.is_ok();
                    if fatal || !delivered {
                        running.store(false, Ordering::SeqCst);
                        return;
                    }
                }
                _ => {}
            }
            if Instant::now() >= heartbeat_at {
                if conn.send(Packet::new(["HB"])).await.is_err() {
                    continue 'reconnect;
                }
                heartbeat_at = Instant::now() + config.heartbeat_interval;
            }
        }
    }
}

/// Dial and send the `RD` announcement. No reply is expected.
async fn announce(socket: &Socket, config: &WorkerConfig) -> Result<Connection, Error> {
    let mut conn = socket.connect(config.read_deadline()).await?;
    let packet = Packet::with_identity(socket.identity(), ["RD"]);
    timeout(config.write_deadline(), conn.send(packet))
        .await
        .map_err(|_| Error::Timeout)??;
    Ok(conn)
}

async fn quit(conn: &mut Connection, config: &WorkerConfig) {
    let _ = timeout(config.write_deadline(), conn.send(Packet::new(["QT"]))).await;
}
