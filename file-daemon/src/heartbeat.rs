//! Heartbeat monitor.
//!
//! While a job streams, the director connection sits idle and would hit its
//! idle timeout. The monitor sends `HEARTBEAT` to the director every
//! `heartbeat_interval`. In storage daemon mode it also owns the SD read
//! half for the duration of the session and drains the keep-alives the SD
//! sends back.

use crate::utils::errors::{FdError, Result};
use bnet::{ChannelReader, ChannelWriter, Frame, Signal, WaitStatus};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upper bound on one wait for SD input.
pub const WAIT_INTERVAL: Duration = Duration::from_secs(60);

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Director write half shared between the job and the monitor.
pub type SharedWriter = Arc<Mutex<ChannelWriter>>;

#[derive(Debug, Default)]
struct MonitorFlags {
    active: AtomicBool,
    heartbeats_sent: AtomicU64,
    sd_signals: AtomicU64,
}

/// What the monitor hands back when it stops in SD mode.
pub struct SdReturn {
    pub reader: ChannelReader,
    /// A data record that arrived on the SD leg while the monitor owned it.
    /// It belongs to the job (typically the SD's reply to the final EOD).
    pub pending: Option<Vec<u8>>,
}

enum Leg {
    Sd(JoinHandle<SdReturn>),
    Dir(JoinHandle<()>),
}

pub struct HeartbeatMonitor {
    cancel: CancellationToken,
    flags: Arc<MonitorFlags>,
    leg: Leg,
}

impl HeartbeatMonitor {
    /// Take over the SD read half and forward heartbeats to `dir`, if any.
    pub fn start_sd(sd: ChannelReader, dir: Option<SharedWriter>, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let flags = Arc::new(MonitorFlags::default());
        flags.active.store(true, Ordering::Release);
        debug!("Starting SD heartbeat monitor, interval {:?}", interval);
        let handle = tokio::spawn(sd_loop(sd, dir, interval, cancel.clone(), flags.clone()));
        Self {
            cancel,
            flags,
            leg: Leg::Sd(handle),
        }
    }

    /// Director-only mode, used while the job itself reads the SD channel.
    pub fn start_dir(dir: SharedWriter, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let flags = Arc::new(MonitorFlags::default());
        flags.active.store(true, Ordering::Release);
        debug!("Starting director heartbeat monitor, interval {:?}", interval);
        let handle = tokio::spawn(dir_loop(dir, interval, cancel.clone(), flags.clone()));
        Self {
            cancel,
            flags,
            leg: Leg::Dir(handle),
        }
    }

    pub fn is_active(&self) -> bool {
        self.flags.active.load(Ordering::Acquire)
    }

    pub fn heartbeats_sent(&self) -> u64 {
        self.flags.heartbeats_sent.load(Ordering::Acquire)
    }

    /// Stop the monitor and wait until its task has exited. In SD mode the
    /// read half comes back to the caller.
    pub async fn stop(self) -> Result<Option<SdReturn>> {
        self.cancel.cancel();
        let joined = match self.leg {
            Leg::Sd(handle) => handle.await.map(Some),
            Leg::Dir(handle) => handle.await.map(|_| None),
        };
        let returned = joined.map_err(|e| FdError::Daemon(format!("heartbeat task failed: {}", e)))?;
        debug!(
            "Heartbeat monitor stopped: {} sent, {} SD signals",
            self.flags.heartbeats_sent.load(Ordering::Acquire),
            self.flags.sd_signals.load(Ordering::Acquire)
        );
        Ok(returned)
    }
}

async fn send_heartbeat(dir: &mut Option<SharedWriter>, flags: &MonitorFlags) {
    let Some(writer) = dir else {
        return;
    };
    let res = writer.lock().await.signal(Signal::Heartbeat).await;
    match res {
        Ok(()) => {
            flags.heartbeats_sent.fetch_add(1, Ordering::AcqRel);
        }
        Err(e) => {
            warn!("Heartbeat to director failed, no more will be sent: {}", e);
            *dir = None;
        }
    }
}

async fn sd_loop(
    mut sd: ChannelReader,
    mut dir: Option<SharedWriter>,
    interval: Duration,
    cancel: CancellationToken,
    flags: Arc<MonitorFlags>,
) -> SdReturn {
    let interval = interval.max(MIN_INTERVAL);
    let wait = interval.min(WAIT_INTERVAL);
    let mut last_heartbeat = Instant::now();
    let mut pending = None;

    loop {
        // wait_data only peeks at the buffer, so dropping it is safe
        let status = tokio::select! {
            _ = cancel.cancelled() => break,
            status = sd.wait_data(wait) => status,
        };
        if last_heartbeat.elapsed() >= interval {
            send_heartbeat(&mut dir, &flags).await;
            last_heartbeat = Instant::now();
        }
        match status {
            Ok(WaitStatus::Timeout) => {}
            Ok(WaitStatus::Eof) => {
                debug!("{} closed the connection", sd.state().who());
                break;
            }
            Err(e) => {
                debug!("Heartbeat wait on {} failed: {}", sd.state().who(), e);
                break;
            }
            Ok(WaitStatus::Ready) => match sd.recv().await {
                Ok(Frame::Signal(sig)) => {
                    flags.sd_signals.fetch_add(1, Ordering::AcqRel);
                    debug!("Got {} from {}", sig, sd.state().who());
                    if sig == Signal::Terminate {
                        sd.state().set_terminated();
                        break;
                    }
                }
                Ok(Frame::Data(n)) => {
                    debug!("Got {} bytes of data on the heartbeat leg", n);
                    pending = Some(sd.msg().to_vec());
                    break;
                }
                Err(e) => {
                    debug!("Heartbeat read on {} failed: {}", sd.state().who(), e);
                    break;
                }
            },
        }
    }
    flags.active.store(false, Ordering::Release);
    SdReturn {
        reader: sd,
        pending,
    }
}

async fn dir_loop(dir: SharedWriter, interval: Duration, cancel: CancellationToken, flags: Arc<MonitorFlags>) {
    let mut dir = Some(dir);
    let interval = interval.max(MIN_INTERVAL);
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    while dir.is_some() {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => send_heartbeat(&mut dir, &flags).await,
        }
    }
    flags.active.store(false, Ordering::Release);
}
