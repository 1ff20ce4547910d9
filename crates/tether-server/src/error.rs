use tether_core::errors::ErrorKind;
use tether_engine::EngineError;
use tether_store::StoreError;

use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("bind failed: {0}")]
    Bind(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl ServerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Bind(_) | Self::Config(_) => ErrorKind::Fatal,
            Self::Store(e) => e.kind(),
            Self::Engine(e) => e.kind(),
        }
    }
}
