//! The long-lived update service task.
//!
//! Runs on its own scheduling context so waiting on the network never
//! blocks the device's primary workload. The accept loop stays live while
//! a session runs; extra connection attempts are dropped at the gate.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use otalink_proto::UpdateError;

use crate::config::DeviceConfig;
use crate::gate::SessionGate;
use crate::session::{self, SessionStats, StateCell};
use crate::storage::Storage;

/// Reboot seam. The real device restarts into the new image; tests observe
/// the call instead.
pub trait Reboot: Send + Sync {
    fn reboot(&self);
}

/// Host-side stand-in: log and let the process exit.
pub struct LogReboot;

impl Reboot for LogReboot {
    fn reboot(&self) {
        info!("restarting into new image");
    }
}

/// What a finished session produced.
#[derive(Debug)]
pub enum SessionOutcome {
    Applied(SessionStats),
    Aborted(UpdateError),
}

/// Handle to a spawned update service.
pub struct ServiceHandle {
    pub local_addr: SocketAddr,
    /// One message per finished session, in order.
    pub outcomes: mpsc::UnboundedReceiver<SessionOutcome>,
    pub state: Arc<StateCell>,
    task: JoinHandle<()>,
}

impl ServiceHandle {
    /// Wait for the service task to end (it ends after a successful apply).
    pub async fn join(self) {
        let _ = self.task.await;
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Bind the listener and spawn the service on its own task.
pub async fn spawn(config: DeviceConfig, reboot: Arc<dyn Reboot>) -> anyhow::Result<ServiceHandle> {
    let listener = TcpListener::bind(config.bind_addr).await?;
    let local_addr = listener.local_addr()?;
    info!("update service listening on {}", local_addr);

    let state = Arc::new(StateCell::new());
    let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();

    let task_state = state.clone();
    let task = tokio::spawn(run(listener, config, task_state, reboot, outcome_tx));

    Ok(ServiceHandle {
        local_addr,
        outcomes: outcome_rx,
        state,
        task,
    })
}

/// Accept loop. One session at a time; the loop ends after a successful
/// apply, when the device hands off to the reboot hook.
async fn run(
    listener: TcpListener,
    config: DeviceConfig,
    state: Arc<StateCell>,
    reboot: Arc<dyn Reboot>,
    outcomes: mpsc::UnboundedSender<SessionOutcome>,
) {
    let gate = SessionGate::new();
    let storage = Storage::new(&config.app_root, config.capacity_bytes);
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Result<SessionStats, UpdateError>>();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (mut stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept error: {}", e);
                        continue;
                    }
                };
                let Some(permit) = gate.try_claim() else {
                    warn!(%peer, "session already active, dropping connection");
                    continue;
                };
                info!(%peer, "host connected");

                let session_config = config.clone();
                let session_storage = storage.clone();
                let session_state = state.clone();
                let done = done_tx.clone();
                tokio::spawn(async move {
                    let _ = socket2::SockRef::from(&stream).set_nodelay(true);
                    let result =
                        session::run_session(&mut stream, &session_config, &session_storage, &session_state)
                            .await;
                    // Re-open the gate before reporting, so a host retrying
                    // right after the outcome is never turned away.
                    drop(permit);
                    let _ = done.send(result);
                });
            }
            Some(result) = done_rx.recv() => {
                match result {
                    Ok(stats) => {
                        info!(files = stats.files, bytes = stats.bytes, "update applied, rebooting");
                        let _ = outcomes.send(SessionOutcome::Applied(stats));
                        reboot.reboot();
                        return;
                    }
                    Err(err) => {
                        warn!("session aborted: {}", err);
                        let _ = outcomes.send(SessionOutcome::Aborted(err));
                        // Previous image stays active; keep accepting.
                    }
                }
            }
        }
    }
}
