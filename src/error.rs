// Copyright 2020 Joyent, Inc.

use std::io;

use thiserror::Error;

/// Errors surfaced to callers of the client API.
#[derive(Error, Debug)]
pub enum Error {
    #[error("connection refused: {0}")]
    ConnectionRefused(#[source] io::Error),

    #[error("unknown host: {0}")]
    HostUnknown(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("not connected")]
    NotConnected,

    #[error("already connected")]
    AlreadyConnected,

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("function already registered: {0}")]
    AlreadyRegistered(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn invalid_message<S: Into<String>>(msg: S) -> Error {
        Error::InvalidMessage(msg.into())
    }
}
