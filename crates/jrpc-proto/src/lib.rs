//! JSON-RPC command definitions shared by the jrpc server.
//!
//! This crate turns positional JSON-RPC parameter lists into strongly typed
//! command values and back into wire errors.
//!
//! # Architecture
//!
//! - [`protocol`]: JSON-RPC 1.0/2.0 envelope types (Request, Response, RpcError)
//! - [`registry`]: Command schema registry and shape descriptors
//! - [`command`]: Codec from a raw request to a registered command
//! - [`commands`]: Built-in command shapes
//! - [`error`]: Error taxonomy and Result type alias
//!
//! # Example
//!
//! ```
//! use jrpc_proto::{GetBlockCmd, Registry, Request, downcast};
//! use serde_json::json;
//!
//! let registry = Registry::with_default_commands().unwrap();
//! let request = Request::new("getblock", vec![json!("00ff")], json!(1));
//! let cmd = registry.unmarshal_cmd(&request).unwrap();
//! let cmd = downcast::<GetBlockCmd>(cmd).unwrap();
//! assert_eq!(cmd.verbose, Some(true));
//! ```

pub mod command;
pub mod commands;
pub mod error;
pub mod protocol;
pub mod registry;

pub use command::ParsedRequest;
pub use commands::{
    AuthenticateCmd, GetBlockCmd, GetReadMeCmd, HelpCmd, NotifyBlocksCmd, SessionCmd,
    StopNotifyBlocksCmd, register_default_commands,
};
pub use error::{Error, ErrorKind, Result};
pub use protocol::{
    INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, JSONRPC_V1, JSONRPC_V2, METHOD_NOT_FOUND,
    PARSE_ERROR, Request, Response, RpcError, marshal_response,
};
pub use registry::{
    BoxedCommand, Command, CommandValue, Field, FieldType, MethodInfo, Registry, Shape,
    Unsupported, UsageFlags, downcast, downcast_ref,
};
