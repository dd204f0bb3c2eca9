//! Control channel client
//!
//! The supervisor's side of the local transport to the running engine.
//! Requests are matched to responses by an incrementing id, so slow
//! replies can never be attributed to the wrong request. A reader task
//! tracks inbound traffic (responses and heartbeats alike); a watchdog
//! treats a heartbeat gap beyond the timeout as engine death and flips
//! the channel health, which the supervisor turns into a Crashed
//! transition even if the OS has not reported the exit yet.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::UnixStream;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use warden_common::control::{read_frame, write_frame, ControlReply, ControlRequest, Frame};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control channel io: {0}")]
    Io(#[from] std::io::Error),

    #[error("control channel closed")]
    Closed,

    #[error("engine did not answer within {0:?}")]
    Timeout(Duration),
}

/// Channel liveness as seen by the watchdog
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelHealth {
    Alive,
    Dead { reason: String },
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<ControlReply>>>>;

/// Client end of the supervisor <-> engine control channel
pub struct ControlChannel {
    writer: tokio::sync::Mutex<tokio::net::unix::OwnedWriteHalf>,
    pending: PendingMap,
    next_id: AtomicU64,
    health_rx: watch::Receiver<ChannelHealth>,
    reader: JoinHandle<()>,
    watchdog: JoinHandle<()>,
}

impl ControlChannel {
    /// Connect to the engine's control socket and start the reader and
    /// heartbeat watchdog tasks.
    pub async fn connect(socket: &Path, heartbeat_timeout: Duration) -> std::io::Result<Self> {
        let stream = UnixStream::connect(socket).await?;
        let (read_half, write_half) = stream.into_split();

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let last_seen = Arc::new(Mutex::new(Instant::now()));
        let (health_tx, health_rx) = watch::channel(ChannelHealth::Alive);

        let reader = tokio::spawn(read_loop(
            read_half,
            Arc::clone(&pending),
            Arc::clone(&last_seen),
        ));
        let watchdog = tokio::spawn(watchdog_loop(last_seen, heartbeat_timeout, health_tx));

        Ok(Self {
            writer: tokio::sync::Mutex::new(write_half),
            pending,
            next_id: AtomicU64::new(1),
            health_rx,
            reader,
            watchdog,
        })
    }

    /// Observe channel health; flips to Dead exactly once
    pub fn health(&self) -> watch::Receiver<ChannelHealth> {
        self.health_rx.clone()
    }

    /// Send one request and wait for its matched response
    pub async fn request(
        &self,
        request: ControlRequest,
        timeout: Duration,
    ) -> Result<ControlReply, ControlError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending map poisoned").insert(id, tx);

        let frame = Frame::Request { id, request };
        let write_result = {
            let mut writer = self.writer.lock().await;
            write_frame(&mut *writer, &frame).await
        };
        if let Err(e) = write_result {
            self.pending.lock().expect("pending map poisoned").remove(&id);
            return Err(ControlError::Io(e));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ControlError::Closed),
            Err(_) => {
                self.pending.lock().expect("pending map poisoned").remove(&id);
                Err(ControlError::Timeout(timeout))
            }
        }
    }

    /// Request with one immediate retry on a transport error. A second
    /// failure is the caller's signal to treat the engine as crashed.
    pub async fn request_with_retry(
        &self,
        request: ControlRequest,
        timeout: Duration,
    ) -> Result<ControlReply, ControlError> {
        match self.request(request.clone(), timeout).await {
            Err(ControlError::Io(e)) => {
                warn!("control request failed ({e}), retrying once");
                self.request(request, timeout).await
            }
            other => other,
        }
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.reader.abort();
        self.watchdog.abort();
    }
}

async fn read_loop(
    mut reader: tokio::net::unix::OwnedReadHalf,
    pending: PendingMap,
    last_seen: Arc<Mutex<Instant>>,
) {
    loop {
        match read_frame(&mut reader).await {
            Ok(frame) => {
                *last_seen.lock().expect("last_seen poisoned") = Instant::now();
                match frame {
                    Frame::Heartbeat => {}
                    Frame::Response { id, reply } => {
                        let waiter = pending.lock().expect("pending map poisoned").remove(&id);
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(reply);
                            }
                            // Mismatched id: the engine answered a request
                            // we never made or already timed out
                            None => warn!("orphan control response for id {id}"),
                        }
                    }
                    Frame::Request { id, .. } => {
                        warn!("engine sent a request frame (id {id}); ignoring");
                    }
                }
            }
            Err(e) => {
                // A closed stream almost always means the process is
                // exiting; the exit is reported through the process
                // monitor, and a still-live engine that stops talking
                // trips the heartbeat watchdog. Declaring death here
                // would race both of those.
                debug!("control channel read ended: {e}");
                // Dropping the senders fails every in-flight request
                pending.lock().expect("pending map poisoned").clear();
                return;
            }
        }
    }
}

async fn watchdog_loop(
    last_seen: Arc<Mutex<Instant>>,
    timeout: Duration,
    health_tx: watch::Sender<ChannelHealth>,
) {
    let tick = timeout.checked_div(4).unwrap_or(timeout).max(Duration::from_millis(10));
    let mut interval = tokio::time::interval(tick);
    loop {
        interval.tick().await;
        let elapsed = last_seen.lock().expect("last_seen poisoned").elapsed();
        if elapsed > timeout {
            warn!("heartbeat missed for {elapsed:?} (timeout {timeout:?}); engine presumed dead");
            let _ = health_tx.send(ChannelHealth::Dead {
                reason: format!("heartbeat missed for {elapsed:?}"),
            });
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    /// Minimal fake engine: accepts one connection and hands frames to
    /// the given handler.
    async fn fake_engine<F>(listener: UnixListener, mut handle: F)
    where
        F: FnMut(Frame) -> Vec<Frame> + Send + 'static,
    {
        let (stream, _) = listener.accept().await.unwrap();
        let (mut r, mut w) = stream.into_split();
        while let Ok(frame) = read_frame(&mut r).await {
            for out in handle(frame) {
                write_frame(&mut w, &out).await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_responses_match_by_id() {
        let dir = tempfile::TempDir::new().unwrap();
        let sock = dir.path().join("engine.sock");
        let listener = UnixListener::bind(&sock).unwrap();

        // Answer pings in reverse arrival order: buffer the first
        // request and release it when the second comes in.
        let mut held: Option<u64> = None;
        tokio::spawn(fake_engine(listener, move |frame| match frame {
            Frame::Request { id, .. } => {
                if let Some(first) = held.take() {
                    vec![
                        Frame::Response {
                            id,
                            reply: ControlReply::Pong {
                                engine: format!("answer-{id}"),
                            },
                        },
                        Frame::Response {
                            id: first,
                            reply: ControlReply::Pong {
                                engine: format!("answer-{first}"),
                            },
                        },
                    ]
                } else {
                    held = Some(id);
                    vec![]
                }
            }
            _ => vec![],
        }));

        let chan = Arc::new(
            ControlChannel::connect(&sock, Duration::from_secs(5))
                .await
                .unwrap(),
        );
        let c1 = Arc::clone(&chan);
        let first = tokio::spawn(async move {
            c1.request(ControlRequest::Ping, Duration::from_secs(2)).await
        });
        // Let the first request reach the fake engine before the second
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = chan
            .request(ControlRequest::Ping, Duration::from_secs(2))
            .await
            .unwrap();
        let first = first.await.unwrap().unwrap();

        assert_eq!(
            first,
            ControlReply::Pong {
                engine: "answer-1".into()
            }
        );
        assert_eq!(
            second,
            ControlReply::Pong {
                engine: "answer-2".into()
            }
        );
    }

    #[tokio::test]
    async fn test_heartbeat_gap_flips_health() {
        let dir = tempfile::TempDir::new().unwrap();
        let sock = dir.path().join("engine.sock");
        let listener = UnixListener::bind(&sock).unwrap();

        // Accept and then go silent: no heartbeats at all
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let chan = ControlChannel::connect(&sock, Duration::from_millis(200))
            .await
            .unwrap();
        let mut health = chan.health();
        tokio::time::timeout(Duration::from_secs(2), health.changed())
            .await
            .expect("watchdog did not fire")
            .unwrap();
        assert!(matches!(*health.borrow(), ChannelHealth::Dead { .. }));
    }

    #[tokio::test]
    async fn test_request_times_out_without_reply() {
        let dir = tempfile::TempDir::new().unwrap();
        let sock = dir.path().join("engine.sock");
        let listener = UnixListener::bind(&sock).unwrap();

        // Keep the connection alive with heartbeats but never answer
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (_r, mut w) = stream.into_split();
            loop {
                if write_frame(&mut w, &Frame::Heartbeat).await.is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });

        let chan = ControlChannel::connect(&sock, Duration::from_secs(5))
            .await
            .unwrap();
        let err = chan
            .request(ControlRequest::Ping, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Timeout(_)));
        assert_eq!(*chan.health().borrow(), ChannelHealth::Alive);
    }
}
