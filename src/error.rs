// Copyright (c) 2025 Weft Contributors

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("runtime already initialized")]
    AlreadyInitialized,

    #[error("runtime not initialized")]
    NotInitialized,

    #[error("runtime must be shut down from the thread that started it")]
    WrongThread,
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
