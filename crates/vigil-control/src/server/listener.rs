//! TCP accept loop for worker control channels.

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use vigil_core::protocol::{ControlMessage, WorkerMessage, bridge};

use super::session::{SessionError, run_session};
use crate::ControlPlane;

/// Per-connection channel depth.
const CHANNEL_CAPACITY: usize = 128;

/// Accept worker connections until `shutdown` flips to true.
pub async fn serve_workers(
    listener: TcpListener,
    plane: ControlPlane,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "Worker listener started");
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        continue;
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(error = %e, "Failed to set TCP_NODELAY");
                }
                let plane = plane.clone();
                tokio::spawn(async move {
                    debug!(peer = %peer, "Worker connected");
                    let channel = bridge::<WorkerMessage, ControlMessage, _>(stream, CHANNEL_CAPACITY);
                    let (inbound, outbound, tasks) = channel.into_parts();
                    match run_session(plane, inbound, outbound).await {
                        Ok(()) | Err(SessionError::NotRegistered) => {}
                        Err(e) => warn!(peer = %peer, error = %e, "Worker session ended with error"),
                    }
                    tasks.shutdown().await;
                    debug!(peer = %peer, "Worker connection closed");
                });
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("Worker listener stopped");
    Ok(())
}
