//! Bridges a byte stream to typed message channels.
//!
//! A reader task decodes inbound lines into an `mpsc` receiver and a writer
//! task encodes everything pushed into the outbound sender, so session logic
//! on both ends only deals with channels.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::codec::{decode_line, encode_line};

/// Typed duplex channel over one connection.
pub struct MessageChannel<In, Out> {
    pub inbound: mpsc::Receiver<In>,
    pub outbound: mpsc::Sender<Out>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl<In, Out> MessageChannel<In, Out> {
    /// Split into the raw halves, keeping the I/O tasks running.
    pub fn into_parts(self) -> (mpsc::Receiver<In>, mpsc::Sender<Out>, ChannelTasks) {
        (
            self.inbound,
            self.outbound,
            ChannelTasks {
                reader: self.reader,
                writer: self.writer,
            },
        )
    }
}

/// Background I/O tasks of a [`MessageChannel`].
pub struct ChannelTasks {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ChannelTasks {
    /// Stop reading immediately and let the writer flush what is queued.
    ///
    /// The writer exits once every outbound sender has been dropped.
    pub async fn shutdown(self) {
        self.reader.abort();
        let _ = self.writer.await;
    }
}

/// Spawn reader/writer tasks for `stream` and return the typed channel.
pub fn bridge<In, Out, S>(stream: S, capacity: usize) -> MessageChannel<In, Out>
where
    In: DeserializeOwned + Send + 'static,
    Out: Serialize + Send + 'static,
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let (in_tx, in_rx) = mpsc::channel::<In>(capacity);
    let (out_tx, mut out_rx) = mpsc::channel::<Out>(capacity);

    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(read_half).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match decode_line::<In>(&line) {
                        Ok(msg) => {
                            if in_tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "Dropping undecodable frame"),
                    }
                }
                Ok(None) => {
                    debug!("Peer closed connection");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Connection read error");
                    break;
                }
            }
        }
    });

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let line = match encode_line(&msg) {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "Failed to encode outbound frame");
                    continue;
                }
            };
            if let Err(e) = write_half.write_all(line.as_bytes()).await {
                warn!(error = %e, "Connection write error");
                break;
            }
            if let Err(e) = write_half.flush().await {
                warn!(error = %e, "Connection flush error");
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    MessageChannel {
        inbound: in_rx,
        outbound: out_tx,
        reader,
        writer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::{ControlMessage, WorkerMessage};

    #[tokio::test]
    async fn messages_cross_a_duplex_pipe() {
        let (a, b) = tokio::io::duplex(4096);
        let mut worker_side = bridge::<ControlMessage, WorkerMessage, _>(a, 8);
        let mut control_side = bridge::<WorkerMessage, ControlMessage, _>(b, 8);

        worker_side
            .outbound
            .send(WorkerMessage::Deregister {
                worker_id: "w1".into(),
            })
            .await
            .unwrap();
        let got = control_side.inbound.recv().await.unwrap();
        assert_eq!(
            got,
            WorkerMessage::Deregister {
                worker_id: "w1".into()
            }
        );

        control_side.outbound.send(ControlMessage::Clear).await.unwrap();
        assert_eq!(worker_side.inbound.recv().await.unwrap(), ControlMessage::Clear);
    }

    #[tokio::test]
    async fn garbage_lines_are_skipped() {
        let (mut raw, b) = tokio::io::duplex(4096);
        let mut control_side = bridge::<WorkerMessage, ControlMessage, _>(b, 8);

        raw.write_all(b"not json\n\n{\"type\":\"deregister\",\"worker_id\":\"w9\"}\n")
            .await
            .unwrap();

        let got = control_side.inbound.recv().await.unwrap();
        assert!(matches!(got, WorkerMessage::Deregister { worker_id } if worker_id == "w9"));
    }

    #[tokio::test]
    async fn inbound_closes_when_peer_hangs_up() {
        let (raw, b) = tokio::io::duplex(64);
        let mut control_side = bridge::<WorkerMessage, ControlMessage, _>(b, 8);
        drop(raw);
        assert!(control_side.inbound.recv().await.is_none());
    }
}
