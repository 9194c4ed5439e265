use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{CONNECT_REPLY, WorkspaceSet};
use crate::errors::AgentError;
use crate::protocol::codec::{read_message, write_message};
use crate::protocol::messages::{Method, Request, Response};
use crate::workspace::OutputStream;

/// Where a single call is in its life.
///
/// `Pending -> Replied` or `Pending -> Hijacked -> Closed`. A replied call
/// leaves the connection ready for the next request; a hijacked one owns the
/// connection until it closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Pending,
    Replied,
    Hijacked,
    Closed,
}

/// Answers exactly one call. Every method consumes the responder, so a call
/// cannot be both replied to and hijacked.
pub struct Responder {
    id: String,
    state: CallState,
}

impl Responder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: CallState::Pending,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub async fn reply<W>(mut self, writer: &mut W, reply: &str) -> Result<CallState, AgentError>
    where
        W: AsyncWrite + Unpin,
    {
        let response = Response::Reply {
            id: self.id.clone(),
            reply: reply.to_string(),
        };
        write_message(writer, &response).await?;
        self.state = CallState::Replied;
        Ok(self.state)
    }

    pub async fn fail<W>(mut self, writer: &mut W, err: &AgentError) -> Result<CallState, AgentError>
    where
        W: AsyncWrite + Unpin,
    {
        write_message(writer, &Response::error(self.id.clone(), err)).await?;
        self.state = CallState::Replied;
        Ok(self.state)
    }

    /// Tell the caller the connection now carries raw bytes.
    pub async fn hijack<W>(mut self, writer: &mut W, reply: Option<String>) -> Result<Hijacked, AgentError>
    where
        W: AsyncWrite + Unpin,
    {
        let response = Response::Hijacked {
            id: self.id.clone(),
            reply,
        };
        write_message(writer, &response).await?;
        self.state = CallState::Hijacked;
        Ok(Hijacked { id: self.id })
    }
}

/// A call whose connection has been handed over to a raw byte stream.
pub struct Hijacked {
    id: String,
}

impl Hijacked {
    /// Pipe `output` to the caller until the output ends, the caller closes,
    /// or `token` is cancelled. Caller input is discarded.
    pub async fn pipe<R, W>(
        self,
        output: &mut OutputStream,
        reader: &mut R,
        writer: &mut W,
        token: &CancellationToken,
    ) -> CallState
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let reason = tokio::select! {
            res = output.copy_to(writer) => match res {
                Ok(_) => "output_ended",
                Err(_) => "caller_gone",
            },
            _ = drain(reader) => "caller_closed",
            _ = token.cancelled() => "shutdown",
        };
        let _ = writer.shutdown().await;

        debug!(
            event = "agent.server.hijack_closed",
            id = %self.id,
            workspace = output.workspace(),
            reason = reason,
            skipped_chunks = output.skipped(),
        );
        CallState::Closed
    }
}

async fn drain<R: AsyncRead + Unpin>(reader: &mut R) {
    let mut buf = [0u8; 1024];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

/// Serve one client connection: read requests, dispatch, respond.
pub async fn handle_connection(
    stream: UnixStream,
    workspaces: Arc<WorkspaceSet>,
    token: CancellationToken,
) {
    debug!(event = "agent.server.connection_accepted");

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    loop {
        let request: Request = tokio::select! {
            msg = read_message(&mut reader) => {
                match msg {
                    Ok(Some(request)) => request,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(event = "agent.server.read_failed", error = %e);
                        let _ = write_message(&mut writer, &Response::error("", &e)).await;
                        break;
                    }
                }
            }
            _ = token.cancelled() => break,
        };

        match dispatch(&workspaces, request, &mut reader, &mut writer, &token).await {
            Ok(CallState::Replied) => continue,
            Ok(_) => break,
            Err(e) => {
                warn!(event = "agent.server.write_failed", error = %e);
                break;
            }
        }
    }

    debug!(event = "agent.server.connection_closed");
}

async fn dispatch<R, W>(
    workspaces: &WorkspaceSet,
    request: Request,
    reader: &mut R,
    writer: &mut W,
    token: &CancellationToken,
) -> Result<CallState, AgentError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let responder = Responder::new(request.id.clone());

    let method = match request.method.parse::<Method>() {
        Ok(method) => method,
        Err(e) => {
            warn!(event = "agent.server.unknown_method", method = %request.method);
            return responder.fail(writer, &e).await;
        }
    };
    info!(
        event = "agent.server.call_started",
        id = %request.id,
        method = %method,
        path = %request.params,
    );

    let result = match method {
        Method::Start => workspaces.start(&request.params).await,
        Method::Stop => workspaces.stop(&request.params).await,
        Method::Connect => match workspaces.connect(&request.params).await {
            Ok(mut output) => {
                let hijacked = responder
                    .hijack(writer, Some(CONNECT_REPLY.to_string()))
                    .await?;
                return Ok(hijacked.pipe(&mut output, reader, writer, token).await);
            }
            Err(e) => Err(e),
        },
    };

    match result {
        Ok(reply) => responder.reply(writer, &reply).await,
        Err(e) => {
            warn!(
                event = "agent.server.call_failed",
                method = %method,
                path = %request.params,
                error = %e,
            );
            responder.fail(writer, &e).await
        }
    }
}
