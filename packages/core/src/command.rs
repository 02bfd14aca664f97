//! Command objects routed through the Central API.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A request addressed to `(api_identifier, api_path)`.
///
/// Commands are plain data: they serialize to JSON and back without loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub api_identifier: String,
    pub api_path: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Command {
    pub fn new(
        api_identifier: impl Into<String>,
        api_path: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            api_identifier: api_identifier.into(),
            api_path: api_path.into(),
            payload,
        }
    }

    /// Build the untyped command for a typed one.
    pub fn from_typed<C: TypedCommand>(command: &C) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            C::API_IDENTIFIER,
            C::API_PATH,
            serde_json::to_value(command)?,
        ))
    }
}

/// A command whose route and result type are known at compile time.
pub trait TypedCommand: Serialize {
    const API_IDENTIFIER: &'static str;
    const API_PATH: &'static str;

    /// What the handler returns, decoded from its JSON result.
    type Output: DeserializeOwned;
}
