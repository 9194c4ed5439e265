use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

use crate::errors::AgentError;
use crate::protocol::codec::{read_message, write_message};
use crate::protocol::messages::{Method, Request, Response};

/// Async client for the agent socket.
///
/// One connection can carry any number of `start`/`stop` calls. `connect`
/// consumes the client, because a hijacked call owns the connection.
pub struct AgentClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_id: u64,
}

impl AgentClient {
    /// Connect to the agent listening on `socket_path`.
    ///
    /// Returns `AgentError::NotRunning` if the socket doesn't exist or the
    /// connection is refused.
    pub async fn connect(socket_path: &Path) -> Result<Self, AgentError> {
        let stream = UnixStream::connect(socket_path).await.map_err(|e| {
            match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
                    AgentError::NotRunning
                }
                _ => AgentError::ConnectionFailed(e.to_string()),
            }
        })?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
            next_id: 1,
        })
    }

    async fn send(&mut self, method: Method, params: &str) -> Result<Response, AgentError> {
        let id = self.next_id.to_string();
        self.next_id += 1;

        let request = Request::new(id.clone(), method, params);
        write_message(&mut self.writer, &request).await?;
        debug!(event = "agent.client.request_sent", id = %id, method = %method);

        let response: Response = read_message(&mut self.reader)
            .await?
            .ok_or_else(|| AgentError::ProtocolError("connection closed before reply".to_string()))?;

        if response.id() != id && !response.id().is_empty() {
            return Err(AgentError::ProtocolError(format!(
                "reply for call {} while waiting for {}",
                response.id(),
                id
            )));
        }
        if let Response::Error { code, message, .. } = response {
            return Err(AgentError::Remote { code, message });
        }
        Ok(response)
    }

    /// Make a request/response call and return the reply string.
    pub async fn call(&mut self, method: Method, params: &str) -> Result<String, AgentError> {
        match self.send(method, params).await? {
            Response::Reply { reply, .. } => Ok(reply),
            Response::Hijacked { .. } => Err(AgentError::ProtocolError(format!(
                "{method} hijacked a request/response call"
            ))),
            Response::Error { code, message, .. } => Err(AgentError::Remote { code, message }),
        }
    }

    pub async fn start(&mut self, path: &str) -> Result<String, AgentError> {
        self.call(Method::Start, path).await
    }

    pub async fn stop(&mut self, path: &str) -> Result<String, AgentError> {
        self.call(Method::Stop, path).await
    }

    /// Attach to a workspace's output, starting it if needed.
    pub async fn connect_workspace(mut self, path: &str) -> Result<HijackedStream, AgentError> {
        match self.send(Method::Connect, path).await? {
            Response::Hijacked { reply, .. } => Ok(HijackedStream {
                reply,
                reader: self.reader,
                writer: self.writer,
            }),
            Response::Reply { reply, .. } => Err(AgentError::ProtocolError(format!(
                "connect replied {reply:?} instead of hijacking"
            ))),
            Response::Error { code, message, .. } => Err(AgentError::Remote { code, message }),
        }
    }
}

/// The raw byte stream of a hijacked `connect` call.
pub struct HijackedStream {
    reply: Option<String>,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl HijackedStream {
    /// Reply string sent along with the hijack, if any.
    pub fn reply(&self) -> Option<&str> {
        self.reply.as_deref()
    }

    /// Copy workspace output into `writer` until the agent closes the stream.
    pub async fn copy_to<W>(&mut self, writer: &mut W) -> Result<u64, AgentError>
    where
        W: AsyncWrite + Unpin,
    {
        Ok(tokio::io::copy(&mut self.reader, writer).await?)
    }

    /// Read one chunk. Returns an empty vec at end-of-stream.
    pub async fn read_chunk(&mut self) -> Result<Vec<u8>, AgentError> {
        let mut buf = vec![0u8; 4096];
        let n = self.reader.read(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, AgentError> {
        let mut out = Vec::new();
        self.reader.read_to_end(&mut out).await?;
        Ok(out)
    }

    /// Close the caller side, ending the call.
    pub async fn close(mut self) -> Result<(), AgentError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_missing_socket_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let result = AgentClient::connect(&dir.path().join("absent.sock")).await;
        assert!(matches!(result, Err(AgentError::NotRunning)));
    }

    #[tokio::test]
    async fn test_call_maps_error_reply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (r, mut w) = stream.into_split();
            let mut r = BufReader::new(r);
            let req: Request = read_message(&mut r).await.unwrap().unwrap();
            let resp = Response::Error {
                id: req.id,
                code: "workspace_not_found".to_string(),
                message: "workspace not found: x".to_string(),
            };
            write_message(&mut w, &resp).await.unwrap();
        });

        let mut client = AgentClient::connect(&path).await.unwrap();
        let err = client.start("x").await.unwrap_err();
        assert_eq!(err.error_code(), "workspace_not_found");
        assert_eq!(err.to_string(), "workspace not found: x");
        server.await.unwrap();
    }
}
