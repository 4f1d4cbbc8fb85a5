use std::io;

use thiserror::Error;

use crate::registry::Token;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("no native engine has been installed")]
    EngineNotInstalled,
    #[error("a native engine is already installed for this process")]
    EngineAlreadyInstalled,
    #[error("native engine refused to allocate a {0}")]
    AllocationRefused(&'static str),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl BridgeError {
    pub fn config(err: impl ToString) -> Self {
        BridgeError::Config(err.to_string())
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    #[error("token {0:?} is not registered")]
    NotFound(Token),
    #[error("{label} registry has no free slots")]
    Exhausted { label: &'static str },
}
