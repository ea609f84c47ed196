//! Host handoff over a Unix socket
//!
//! A discovery process sends one JSON [`HostInfo`] per connection and closes
//! its end. The record is read as-is; nothing about it is validated. The
//! socket side is Unix only; [`HostInfo`] itself is available everywhere.

#[cfg(unix)]
pub use self::unix::{send, serve};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// What the discovery process knows about the host application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    pub pid: u32,
    pub app_port: u16,
    /// OS user owning the application
    pub uid: u32,
    pub listen_port: u16,
    pub remote_ip: String,
    pub remote_port: u16,
    /// Opaque application configuration
    #[serde(default)]
    pub config: serde_json::Value,
}

/// `<run_dir>/<pid>.sock`
pub fn socket_path(run_dir: &Path, pid: u32) -> PathBuf {
    run_dir.join(format!("{pid}.sock"))
}

#[cfg(unix)]
mod unix {
    use super::HostInfo;
    use portmesh_common::{Result, TunnelError};
    use std::path::Path;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{UnixListener, UnixStream};
    use tokio::sync::mpsc;
    use tracing::{debug, info, warn};

    const MAX_RECORD_BYTES: u64 = 64 * 1024;

    /// Listen on `path` and forward every received record
    ///
    /// A stale socket file is replaced. The accept loop stops once the receiver
    /// is dropped.
    pub fn serve(path: &Path) -> Result<mpsc::Receiver<HostInfo>> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        info!("waiting for host handoff on {}", path.display());

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    () = tx.closed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => stream,
                        Err(e) => {
                            warn!("handoff accept failed: {}", e);
                            continue;
                        }
                    },
                };
                match read_record(stream).await {
                    Ok(host) => {
                        debug!(pid = host.pid, app_port = host.app_port, "host handoff received");
                        if tx.send(host).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("discarding handoff record: {}", e),
                }
            }
        });
        Ok(rx)
    }

    /// Deliver one record to the listener at `path`
    pub async fn send(path: &Path, host: &HostInfo) -> Result<()> {
        let payload =
            serde_json::to_vec(host).map_err(|e| TunnelError::Serialization(e.to_string()))?;
        let mut stream = UnixStream::connect(path).await?;
        stream.write_all(&payload).await?;
        stream.shutdown().await?;
        Ok(())
    }

    async fn read_record(stream: UnixStream) -> Result<HostInfo> {
        let mut payload = Vec::new();
        stream
            .take(MAX_RECORD_BYTES)
            .read_to_end(&mut payload)
            .await?;
        serde_json::from_slice(&payload).map_err(|e| TunnelError::Serialization(e.to_string()))
    }
}
