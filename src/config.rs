// Copyright 2020 Joyent, Inc.

use serde_derive::{Deserialize, Serialize};

pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// Tunables for an `RpcEngine` and the connection feeding it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Answer undecodable frames that carry no usable msgid with a 400 error
    /// addressed to msgid 0.  When false such frames are only logged.
    pub answer_unaddressed_frames: bool,
    /// Reject `register_function` for a name that already has a handler
    /// instead of replacing it.
    pub strict_registration: bool,
    /// Largest partial frame kept in the decode buffer.
    pub max_frame_size: usize,
    /// Size of each socket read.
    pub read_buffer_size: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        RpcConfig {
            answer_unaddressed_frames: false,
            strict_registration: false,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}
