//! Built-in command shapes.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::registry::{Command, Field, FieldType, Registry, Shape, UsageFlags};

/// `getblock "hash" (verbose=true verbosetx=false)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBlockCmd {
    pub hash: String,
    #[serde(default)]
    pub verbose: Option<bool>,
    #[serde(default, rename = "verbosetx")]
    pub verbose_tx: Option<bool>,
}

impl Command for GetBlockCmd {
    fn shape() -> Shape {
        Shape::Struct(vec![
            Field::required("hash", FieldType::String),
            Field::optional("verbose", FieldType::Bool).with_default("true"),
            Field::optional("verbosetx", FieldType::Bool).with_default("false"),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetReadMeCmd {}

impl Command for GetReadMeCmd {
    fn shape() -> Shape {
        Shape::Struct(Vec::new())
    }
}

/// First command of every WebSocket session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticateCmd {
    pub username: String,
    pub passphrase: String,
}

impl Command for AuthenticateCmd {
    fn shape() -> Shape {
        Shape::Struct(vec![
            Field::required("username", FieldType::String),
            Field::required("passphrase", FieldType::String),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelpCmd {
    #[serde(default)]
    pub command: Option<String>,
}

impl Command for HelpCmd {
    fn shape() -> Shape {
        Shape::Struct(vec![Field::optional("command", FieldType::String)])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCmd {}

impl Command for SessionCmd {
    fn shape() -> Shape {
        Shape::Struct(Vec::new())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyBlocksCmd {}

impl Command for NotifyBlocksCmd {
    fn shape() -> Shape {
        Shape::Struct(Vec::new())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopNotifyBlocksCmd {}

impl Command for StopNotifyBlocksCmd {
    fn shape() -> Shape {
        Shape::Struct(Vec::new())
    }
}

/// Register every built-in command on `registry`.
///
/// # Errors
///
/// Fails if any of the names is already taken.
pub fn register_default_commands(registry: &Registry) -> Result<()> {
    let ws = UsageFlags::WEBSOCKET_ONLY;
    registry.register::<GetBlockCmd>("getblock", UsageFlags::NONE)?;
    registry.register::<GetReadMeCmd>("getreadme", UsageFlags::NONE)?;
    registry.register::<AuthenticateCmd>("authenticate", UsageFlags::NONE)?;
    registry.register::<HelpCmd>("help", ws)?;
    registry.register::<SessionCmd>("session", ws)?;
    registry.register::<NotifyBlocksCmd>("notifyblocks", ws)?;
    registry.register::<StopNotifyBlocksCmd>("stopnotifyblocks", ws)?;
    Ok(())
}

impl Registry {
    /// A registry with the built-in commands already registered.
    ///
    /// # Errors
    ///
    /// Only fails if a built-in shape is malformed.
    pub fn with_default_commands() -> Result<Self> {
        let registry = Self::new();
        register_default_commands(&registry)?;
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_default_commands_register() {
        let registry = Registry::with_default_commands().unwrap();
        assert_eq!(
            registry.methods(),
            vec![
                "authenticate",
                "getblock",
                "getreadme",
                "help",
                "notifyblocks",
                "session",
                "stopnotifyblocks",
            ]
        );
        assert!(
            registry
                .usage_flags("session")
                .unwrap()
                .contains(UsageFlags::WEBSOCKET_ONLY)
        );
    }

    #[test]
    fn test_default_commands_twice_fails() {
        let registry = Registry::with_default_commands().unwrap();
        let err = register_default_commands(&registry).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DuplicateMethod);
    }

    #[test]
    fn test_builtin_usage() {
        let registry = Registry::with_default_commands().unwrap();
        assert_eq!(
            registry.usage("authenticate").unwrap(),
            "authenticate \"username\" \"passphrase\""
        );
        assert_eq!(registry.usage("help").unwrap(), "help (\"command\")");
        assert_eq!(registry.usage("getreadme").unwrap(), "getreadme");
    }
}
