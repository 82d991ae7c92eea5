// Copyright 2020 Joyent, Inc.

//! msgpack-rpc-client: a bidirectional msgpack RPC client
//!
//! A single TCP connection carries traffic in both directions: the local
//! process sends requests and notifications to the remote peer, and the peer
//! may send requests and notifications back.  Local functions are registered
//! by name and become callable by the peer.
//!
//! Protocol definition
//!
//! Every frame is one msgpack array.  The first element is the message type:
//!
//! * REQUEST   `[0, MSGID, FUNCTION, PARAMS]`
//!
//! * RESPONSE  `[1, MSGID, ERROR, RESULT]`
//!
//! * NOTIFY    `[2, nil, FUNCTION, PARAMS]`
//!
//! * MSGID     unsigned 32-bit integer chosen by the sender of a request.  The
//!             response to that request carries the same value.
//!
//! * FUNCTION  string naming the remote function.  Inbound notifications are
//!             always handed to the function registered as `broadcast`.
//!
//! * PARAMS    array of arguments.
//!
//! * ERROR     nil on success, otherwise `[CODE, DESCRIPTION]`.  This crate
//!             emits code 400 for messages it could not handle and 418 for
//!             unexpected internal failures.
//!
//! Message IDs: outbound message ids are scoped to the connection and are
//! allocated sequentially from a circular 31-bit space.

#![allow(missing_docs)]

pub mod client;
pub mod config;
pub mod connection;
pub mod correlation;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod protocol;

pub use crate::client::RpcClient;
pub use crate::config::RpcConfig;
pub use crate::error::Error;
pub use crate::protocol::{Message, MsgId, Notify, Request, Response};
