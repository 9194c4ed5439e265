use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::AgentError;

/// Longest message line accepted, newline excluded.
pub const MAX_MESSAGE_LEN: u64 = 64 * 1024;

/// Read the next JSONL message, skipping blank lines.
///
/// Returns `Ok(None)` at end of stream. Bytes after the message stay buffered
/// in `reader`, so a hijacked stream can be read from the same reader.
pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>, AgentError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = (&mut *reader)
            .take(MAX_MESSAGE_LEN + 1)
            .read_until(b'\n', &mut line)
            .await?;
        if n == 0 {
            return Ok(None);
        }
        if line.last() != Some(&b'\n') && n as u64 > MAX_MESSAGE_LEN {
            return Err(AgentError::ProtocolError(format!(
                "message longer than {MAX_MESSAGE_LEN} bytes"
            )));
        }

        let text = line.trim_ascii();
        if text.is_empty() {
            continue;
        }
        return serde_json::from_slice(text).map(Some).map_err(|e| {
            AgentError::ProtocolError(format!(
                "invalid JSON: {}: {}",
                e,
                String::from_utf8_lossy(text)
            ))
        });
    }
}

/// Write a single JSONL message and flush.
pub async fn write_message<W, T>(writer: &mut W, msg: &T) -> Result<(), AgentError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut json = serde_json::to_vec(msg)?;
    json.push(b'\n');
    writer.write_all(&json).await?;
    writer.flush().await?;
    Ok(())
}
