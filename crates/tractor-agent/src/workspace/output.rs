use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tracing::warn;

/// One reader's view of a workspace's combined output.
///
/// Starts at the moment of connection; earlier output is never replayed.
/// Ends when the process exits or the workspace is stopped.
pub struct OutputStream {
    workspace: String,
    rx: broadcast::Receiver<Bytes>,
    skipped: u64,
}

impl OutputStream {
    pub(crate) fn new(workspace: String, rx: broadcast::Receiver<Bytes>) -> Self {
        Self {
            workspace,
            rx,
            skipped: 0,
        }
    }

    /// Next chunk of output, or `None` at end-of-stream.
    ///
    /// A reader that falls behind the channel capacity skips the lost chunks
    /// and keeps reading.
    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            match self.rx.recv().await {
                Ok(chunk) => return Some(chunk),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.skipped += n;
                    warn!(
                        event = "agent.workspace.output_lagged",
                        workspace = %self.workspace,
                        skipped_chunks = n,
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Collect everything until end-of-stream.
    pub async fn read_to_end(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = self.recv().await {
            out.extend_from_slice(&chunk);
        }
        out
    }

    /// Copy output into `writer` until end-of-stream. Returns bytes written.
    pub async fn copy_to<W>(&mut self, writer: &mut W) -> std::io::Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut written = 0u64;
        while let Some(chunk) = self.recv().await {
            writer.write_all(&chunk).await?;
            writer.flush().await?;
            written += chunk.len() as u64;
        }
        Ok(written)
    }

    /// Chunks lost to lagging so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }
}

/// Watches a byte stream for a line that begins with a marker.
///
/// Works across chunk boundaries. Fires once.
pub(crate) struct ReadinessDetector {
    marker: Vec<u8>,
    /// Bytes of the marker matched on the current line; `None` once the line
    /// can no longer match.
    matched: Option<usize>,
    fired: bool,
}

impl ReadinessDetector {
    pub(crate) fn new(marker: &str) -> Self {
        Self {
            marker: marker.as_bytes().to_vec(),
            matched: Some(0),
            fired: false,
        }
    }

    /// Feed a chunk. Returns true the first time the marker is seen.
    pub(crate) fn feed(&mut self, chunk: &[u8]) -> bool {
        if self.fired || self.marker.is_empty() {
            return false;
        }
        for &byte in chunk {
            if byte == b'\n' {
                self.matched = Some(0);
                continue;
            }
            if let Some(n) = self.matched {
                if self.marker[n] == byte {
                    if n + 1 == self.marker.len() {
                        self.fired = true;
                        return true;
                    }
                    self.matched = Some(n + 1);
                } else {
                    self.matched = None;
                }
            }
        }
        false
    }
}
