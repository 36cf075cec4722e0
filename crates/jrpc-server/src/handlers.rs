//! Built-in RPC handlers.
//!
//! - `getreadme` is served over both transports
//! - `help`, `session`, `notifyblocks` and `stopnotifyblocks` only make sense
//!   inside a WebSocket session

use std::sync::Arc;

use jrpc_proto::{
    GetReadMeCmd, HelpCmd, NotifyBlocksCmd, RpcError, SessionCmd, StopNotifyBlocksCmd,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::dispatch::DispatchTable;
use crate::notify::BLOCKS_TOPIC;
use crate::server::RpcServer;
use crate::websocket::WsClient;

const README: &str = "A JSON-RPC command server reachable over HTTP and WebSocket.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadMeResult {
    pub info: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionResult {
    pub sessionid: u64,
}

/// Bind every built-in handler on `table`.
pub fn register_default_handlers(table: &DispatchTable) {
    table.add_handler("getreadme", handle_get_readme);

    table.add_ws_handler("help", handle_websocket_help);
    table.add_ws_handler("session", handle_session);
    table.add_ws_handler("notifyblocks", handle_notify_blocks);
    table.add_ws_handler("stopnotifyblocks", handle_stop_notify_blocks);
}

// Handler signatures are fixed by the dispatch table
#[allow(clippy::unused_async, clippy::needless_pass_by_value)]
async fn handle_get_readme(
    _server: Arc<RpcServer>,
    cmd: GetReadMeCmd,
    _cancel: CancellationToken,
) -> Result<ReadMeResult, RpcError> {
    debug!("getreadme was called: {:?}", cmd);
    Ok(ReadMeResult {
        info: README.to_string(),
    })
}

/// Usage of one command, or of every registered command one per line.
#[allow(clippy::unused_async, clippy::needless_pass_by_value)]
async fn handle_websocket_help(client: Arc<WsClient>, cmd: HelpCmd) -> Result<String, RpcError> {
    let registry = client.server().registry();
    if let Some(method) = cmd.command {
        return registry
            .usage(&method)
            .map_err(|_| RpcError::invalid_params(format!("Unknown command: {method}")));
    }

    let usages: Vec<String> = registry
        .methods()
        .iter()
        .filter_map(|method| registry.usage(method).ok())
        .collect();
    Ok(usages.join("\n"))
}

#[allow(clippy::unused_async, clippy::needless_pass_by_value)]
async fn handle_session(client: Arc<WsClient>, _cmd: SessionCmd) -> Result<SessionResult, RpcError> {
    Ok(SessionResult {
        sessionid: client.session_id().as_u64(),
    })
}

#[allow(clippy::unused_async, clippy::needless_pass_by_value)]
async fn handle_notify_blocks(client: Arc<WsClient>, _cmd: NotifyBlocksCmd) -> Result<(), RpcError> {
    client
        .server()
        .notifications()
        .register(client.session_id(), BLOCKS_TOPIC);
    Ok(())
}

#[allow(clippy::unused_async, clippy::needless_pass_by_value)]
async fn handle_stop_notify_blocks(
    client: Arc<WsClient>,
    _cmd: StopNotifyBlocksCmd,
) -> Result<(), RpcError> {
    client
        .server()
        .notifications()
        .unregister(client.session_id(), BLOCKS_TOPIC);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use jrpc_proto::INVALID_PARAMS;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn client() -> Arc<WsClient> {
        let server = RpcServer::new(ServerConfig::default()).unwrap();
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40001);
        WsClient::new(server, addr).0
    }

    #[tokio::test]
    async fn test_get_readme() {
        let server = RpcServer::new(ServerConfig::default()).unwrap();
        let result = handle_get_readme(server, GetReadMeCmd {}, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.info, README);
    }

    #[tokio::test]
    async fn test_help_for_one_command() {
        let usage = handle_websocket_help(
            client(),
            HelpCmd {
                command: Some("getblock".to_string()),
            },
        )
        .await
        .unwrap();
        assert!(usage.starts_with("getblock \"hash\""));
    }

    #[tokio::test]
    async fn test_help_lists_every_command() {
        let usage = handle_websocket_help(client(), HelpCmd { command: None })
            .await
            .unwrap();
        let lines: Vec<&str> = usage.lines().collect();
        assert_eq!(lines.len(), 7);
        assert!(lines.iter().any(|line| line.starts_with("authenticate")));
        assert!(lines.contains(&"session"));
    }

    #[tokio::test]
    async fn test_help_unknown_command() {
        let err = handle_websocket_help(
            client(),
            HelpCmd {
                command: Some("nope".to_string()),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
        assert_eq!(err.message, "Unknown command: nope");
    }

    #[tokio::test]
    async fn test_session_returns_id() {
        let client = client();
        let result = handle_session(Arc::clone(&client), SessionCmd {})
            .await
            .unwrap();
        assert_eq!(result.sessionid, client.session_id().as_u64());
    }
}
