//! Single-shot JSON-RPC over HTTP.
//!
//! The connection is owned outright once the request is framed: the reply is
//! written byte for byte and the stream is closed on every path.

use std::sync::Arc;

use jrpc_proto::{ParsedRequest, Request, RpcError, marshal_response};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::dispatch::HandlerResult;
use crate::error::Result;
use crate::server::RpcServer;
use crate::transport::HttpRequest;

/// Cancels a token once the peer closes its end of the connection.
///
/// The watch task is aborted when the watcher is dropped.
struct CloseWatcher {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl CloseWatcher {
    fn spawn<R>(mut reader: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let token = CancellationToken::new();
        let closed = token.clone();
        let task = tokio::spawn(async move {
            let mut byte = [0u8; 1];
            match reader.read(&mut byte).await {
                Ok(0) | Err(_) => {
                    trace!("HTTP peer went away");
                    closed.cancel();
                }
                Ok(_) => {}
            }
        });
        Self { token, task }
    }

    fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for CloseWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Answer one framed HTTP request on `stream` and close it.
///
/// Notifications get no reply at all. Envelope parse failures are answered
/// with a `null` id.
///
/// # Errors
///
/// Never fails on write errors, which are only logged.
pub async fn json_rpc_read<S>(server: Arc<RpcServer>, stream: S, request: &HttpRequest) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (reader, mut writer) = tokio::io::split(stream);

    let (id, result): (_, HandlerResult) = match Request::parse(&request.body) {
        Ok(rpc_request) => {
            if rpc_request.is_notification(server.config().rpc_quirks) {
                debug!("Not replying to notification <{}>", rpc_request.method);
                close(&mut writer).await;
                return Ok(());
            }

            let watcher = CloseWatcher::spawn(reader);
            let ParsedRequest { id, method, cmd } = server.registry().parse_cmd(&rpc_request);
            let result = match cmd {
                Ok(cmd) => {
                    server
                        .standard_cmd_result(&method, cmd, watcher.token())
                        .await
                }
                Err(err) => Err(err),
            };
            drop(watcher);
            (id, result)
        }
        Err(e) => (None, Err(RpcError::from(e))),
    };

    let body = match marshal_response(id, result) {
        Ok(body) => body,
        Err(e) => {
            error!("Failed to marshal reply: {}", e);
            close(&mut writer).await;
            return Ok(());
        }
    };

    let mut response = format!(
        "{}Connection: close\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
        server.status_line(request.is_http11(), 200),
        body.len() + 1
    )
    .into_bytes();
    response.extend_from_slice(&body);
    // Newline-terminated for compatibility with Bitcoin Core clients.
    response.push(b'\n');

    if let Err(e) = writer.write_all(&response).await {
        error!("Failed to write reply: {}", e);
    }
    close(&mut writer).await;
    Ok(())
}

async fn close<W: AsyncWrite + Unpin>(writer: &mut W) {
    if let Err(e) = writer.flush().await {
        trace!("Flush on close failed: {}", e);
    }
    if let Err(e) = writer.shutdown().await {
        trace!("Shutdown on close failed: {}", e);
    }
}
