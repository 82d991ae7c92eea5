// Copyright 2020 Joyent, Inc.

use std::sync::{Arc, Mutex};

use rmpv::Value;
use slog::{debug, o, warn, Drain, Logger};

use crate::config::RpcConfig;
use crate::connection::Connection;
use crate::correlation::ResponseCallback;
use crate::dispatcher::{HandlerError, Reply};
use crate::engine::RpcEngine;
use crate::error::Error;
use crate::protocol::{Message, MessageId, MsgId, Notify, Request};

/// A msgpack RPC session with one remote peer.
///
/// Functions registered with `register_function` can be called by the peer
/// as soon as the client is connected.  Outbound requests are sent with
/// `send`; their responses are delivered to the callback given there.
pub struct RpcClient {
    engine: Arc<RpcEngine>,
    connection: Option<Connection>,
    msg_ids: Mutex<MessageId>,
    log: Logger,
}

impl RpcClient {
    pub fn new(config: RpcConfig, log: Option<&Logger>) -> RpcClient {
        let log = log.cloned().unwrap_or_else(|| {
            Logger::root(slog_stdlog::StdLog.fuse(), o!())
        });

        RpcClient {
            engine: Arc::new(RpcEngine::new(config, Some(&log))),
            connection: None,
            msg_ids: Mutex::new(MessageId::new()),
            log,
        }
    }

    pub fn engine(&self) -> &Arc<RpcEngine> {
        &self.engine
    }

    pub fn next_msgid(&self) -> MsgId {
        self.msg_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .next_id()
    }

    /// Build a request addressed with a fresh message id.
    pub fn request<S: Into<String>>(&self, function: S, params: Vec<Value>) -> Message {
        Message::Request(Request::new(self.next_msgid(), function, params))
    }

    pub fn notify<S: Into<String>>(&self, function: S, params: Vec<Value>) -> Message {
        Message::Notify(Notify::new(function, params))
    }

    pub async fn connect(&mut self, host: &str, port: u16) -> Result<(), Error> {
        if self.connection.is_some() {
            return Err(Error::AlreadyConnected);
        }

        let engine = Arc::clone(&self.engine);
        let log = self.log.clone();
        let on_receive = move |data: &[u8]| {
            let mut frames = Vec::new();
            for reply in engine.message_callback(data) {
                debug!(log, "sending reply"; "msg" => %reply);
                match reply.pack() {
                    Ok(bytes) => frames.push(bytes),
                    Err(e) => warn!(log, "unable to encode reply"; "err" => %e),
                }
            }
            frames
        };

        let connection = Connection::connect(
            host,
            port,
            on_receive,
            self.engine.config().read_buffer_size,
            Some(&self.log),
        )
        .await?;
        self.connection = Some(connection);
        Ok(())
    }

    /// Send a message to the peer.
    ///
    /// With `on_response` set the message must be a request; the callback
    /// runs once, on the receive task, when the matching response arrives.
    /// Resolves when the bytes have been written to the socket.
    pub async fn send(
        &self,
        msg: Message,
        on_response: Option<ResponseCallback>,
    ) -> Result<(), Error> {
        let connection = self.connection.as_ref().ok_or(Error::NotConnected)?;
        let awaiting = match on_response {
            Some(_) => msg.msgid(),
            None => None,
        };

        let bytes = self.engine.prepare_send(&msg, on_response)?;
        if let Err(e) = connection.send(bytes).await {
            if let Some(msgid) = awaiting {
                self.engine.forget_response(msgid);
            }
            return Err(e);
        }
        Ok(())
    }

    pub fn register_function<F>(&self, name: &str, handler: F) -> Result<(), Error>
    where
        F: Fn(&Message, &Logger) -> Result<Reply, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.engine.register_function(name, handler)
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .map(Connection::is_connected)
            .unwrap_or(false)
    }

    pub fn disconnect(&self) -> Result<(), Error> {
        let connection = self.connection.as_ref().ok_or(Error::NotConnected)?;
        connection.disconnect();
        Ok(())
    }

    /// Wait until the connection is closed.
    pub async fn listen(&self) -> Result<(), Error> {
        let connection = self.connection.as_ref().ok_or(Error::NotConnected)?;
        connection.wait_disconnected().await;
        Ok(())
    }
}
