// Copyright 2020 Joyent, Inc.

//! The protocol state machine.
//!
//! `RpcEngine` owns the dispatcher table, the response correlation table and
//! the decode buffer for one connection.  Raw bytes go in through
//! `message_callback`; the messages owed to the peer in reply come out.  The
//! engine never touches the socket itself.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use slog::{crit, debug, info, o, warn, Drain, Logger};

use crate::config::RpcConfig;
use crate::correlation::{ResponseCallback, ResponseCallbacks};
use crate::dispatcher::{
    DispatchError, Dispatcher, Handler, HandlerError, Reply, BROADCAST,
};
use crate::error::Error;
use crate::protocol::{
    InvalidFrame, Message, MsgId, Response, Unpacker, ERROR_INVALID_MESSAGE,
    ERROR_UNEXPECTED,
};

pub struct RpcEngine {
    dispatcher: Mutex<Dispatcher>,
    callbacks: Mutex<ResponseCallbacks>,
    unpacker: Mutex<Unpacker>,
    config: RpcConfig,
    log: Logger,
}

// Handlers and callbacks never run under these locks.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown panic")
    }
}

/// Translate a failed request into the response sent back to the peer.
pub fn error_response(msgid: MsgId, err: &DispatchError) -> Response {
    if err.code() == ERROR_INVALID_MESSAGE {
        let desc = format!("Could not handle request! {}", err);
        Response::error(msgid, ERROR_INVALID_MESSAGE, &desc)
    } else {
        Response::error(msgid, ERROR_UNEXPECTED, "Unexpected exception occurred!")
    }
}

impl RpcEngine {
    pub fn new(config: RpcConfig, log: Option<&Logger>) -> RpcEngine {
        let log = log.cloned().unwrap_or_else(|| {
            Logger::root(slog_stdlog::StdLog.fuse(), o!())
        });

        RpcEngine {
            dispatcher: Mutex::new(Dispatcher::new()),
            callbacks: Mutex::new(ResponseCallbacks::new()),
            unpacker: Mutex::new(Unpacker::new(config.max_frame_size)),
            config,
            log,
        }
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Make `handler` callable by the peer under `name`.  Registering
    /// `broadcast` installs the handler for inbound notifications.
    pub fn register_function<F>(&self, name: &str, handler: F) -> Result<(), Error>
    where
        F: Fn(&Message, &Logger) -> Result<Reply, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        let handler: Arc<Handler> = Arc::new(handler);
        let mut dispatcher = lock(&self.dispatcher);

        if self.config.strict_registration && dispatcher.contains(name) {
            return Err(Error::AlreadyRegistered(name.to_string()));
        }

        if dispatcher.register(name.to_string(), handler).is_some() {
            info!(self.log, "replaced registered function"; "function" => name);
        } else {
            debug!(self.log, "registered function"; "function" => name);
        }
        Ok(())
    }

    /// Validate and encode an outbound message.  When a callback is given it
    /// is registered before the bytes are returned, so the caller must hand
    /// them to the transport afterwards and not before.
    pub fn prepare_send(
        &self,
        msg: &Message,
        callback: Option<ResponseCallback>,
    ) -> Result<Vec<u8>, Error> {
        let msgid = msg.msgid();
        if callback.is_some() && msgid.is_none() {
            return Err(Error::invalid_message(
                "Notify message does not support responses",
            ));
        }

        let bytes = msg.pack()?;

        if let (Some(callback), Some(msgid)) = (callback, msgid) {
            lock(&self.callbacks).insert(msgid, callback)?;
        }

        debug!(self.log, "sending message"; "msg" => %msg);
        Ok(bytes)
    }

    /// Drop the callback waiting on `msgid`, if any.
    pub fn forget_response(&self, msgid: MsgId) -> bool {
        lock(&self.callbacks).pop(msgid).is_some()
    }

    pub fn is_pending(&self, msgid: MsgId) -> bool {
        lock(&self.callbacks).contains(msgid)
    }

    pub fn pending(&self) -> usize {
        lock(&self.callbacks).len()
    }

    /// Feed bytes received from the peer.  Returns the messages that must be
    /// sent back, in order.
    pub fn message_callback(&self, data: &[u8]) -> Vec<Message> {
        let decoded = lock(&self.unpacker).feed(data);

        let mut replies = Vec::new();
        let mut messages = Vec::new();
        for item in decoded {
            match item {
                Ok(msg) => messages.push(msg),
                Err(frame) => {
                    if let Some(reply) = self.invalid_frame_reply(frame) {
                        replies.push(reply);
                    }
                }
            }
        }

        if messages.is_empty() {
            debug!(self.log, "received incomplete message"; "bytes" => data.len());
            return replies;
        }

        for msg in messages {
            if let Some(reply) = self.route(msg) {
                replies.push(reply);
            }
        }
        replies
    }

    fn invalid_frame_reply(&self, frame: InvalidFrame) -> Option<Message> {
        warn!(self.log, "received invalid message";
            "reason" => %frame.reason, "msgid" => ?frame.msgid);

        let msgid = match frame.msgid {
            Some(msgid) => msgid,
            None if self.config.answer_unaddressed_frames => 0,
            None => return None,
        };
        let desc = format!("Invalid Message Format: {}", frame.reason);
        Some(Response::error(msgid, ERROR_INVALID_MESSAGE, &desc).into())
    }

    fn route(&self, msg: Message) -> Option<Message> {
        debug!(self.log, "received message"; "msg" => %msg);

        match msg {
            Message::Request(ref req) => {
                Some(self.handle_request(req.msgid, &req.function, &msg).into())
            }
            Message::Notify(ref notify) => {
                self.handle_notify(&notify.function, &msg);
                None
            }
            Message::Response(rsp) => {
                self.handle_response(rsp);
                None
            }
        }
    }

    fn handle_request(
        &self,
        msgid: MsgId,
        function: &str,
        msg: &Message,
    ) -> Response {
        match self.dispatch(function, msg) {
            Ok(reply) => Response::new(msgid, reply.error, reply.result),
            Err(e) => {
                warn!(self.log, "unable to handle request";
                    "msgid" => msgid, "function" => function, "err" => %e);
                error_response(msgid, &e)
            }
        }
    }

    fn handle_response(&self, rsp: Response) {
        let callback = lock(&self.callbacks).pop(rsp.msgid);

        match callback {
            Some(callback) => {
                let msgid = rsp.msgid;
                let result =
                    panic::catch_unwind(AssertUnwindSafe(move || callback(rsp)));
                if let Err(payload) = result {
                    warn!(self.log, "response callback panicked";
                        "msgid" => msgid, "err" => panic_message(payload));
                }
            }
            None => match &rsp.error {
                Some(err) => {
                    warn!(self.log, "received error unrelated to any request";
                        "msgid" => rsp.msgid, "error" => %err);
                }
                None => {
                    warn!(self.log, "response msgid does not match any request";
                        "msgid" => rsp.msgid);
                }
            },
        }
    }

    fn handle_notify(&self, function: &str, msg: &Message) {
        match self.dispatch(BROADCAST, msg) {
            Ok(_) => (),
            Err(DispatchError::UnknownFunction(_)) => {
                crit!(self.log, "no broadcast handler registered, notification dropped";
                    "function" => function);
            }
            Err(e) => {
                warn!(self.log, "unable to handle notification";
                    "function" => function, "err" => %e);
            }
        }
    }

    fn dispatch(&self, name: &str, msg: &Message) -> Result<Reply, DispatchError> {
        let handler = lock(&self.dispatcher)
            .get(name)
            .ok_or_else(|| DispatchError::UnknownFunction(name.to_string()))?;

        let log = self.log.new(o!("function" => name.to_string()));
        match panic::catch_unwind(AssertUnwindSafe(|| handler(msg, &log))) {
            Ok(result) => result.map_err(DispatchError::from),
            Err(payload) => Err(DispatchError::Panicked(panic_message(payload))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use rmpv::Value;
    use slog::Discard;

    use crate::protocol::{Notify, Request};

    fn engine_with(config: RpcConfig) -> RpcEngine {
        let log = Logger::root(Discard, o!());
        RpcEngine::new(config, Some(&log))
    }

    fn engine() -> RpcEngine {
        engine_with(RpcConfig::default())
    }

    fn encode(value: Value) -> Vec<u8> {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &value).unwrap();
        buf
    }

    fn request(msgid: u32, function: &str) -> Value {
        Value::Array(vec![
            Value::from(0),
            Value::from(msgid),
            Value::from(function),
            Value::Array(vec![]),
        ])
    }

    fn response(msgid: u32, result: &str) -> Value {
        Value::Array(vec![
            Value::from(1),
            Value::from(msgid),
            Value::Nil,
            Value::from(result),
        ])
    }

    fn notify(function: &str) -> Value {
        Value::Array(vec![
            Value::from(2),
            Value::Nil,
            Value::from(function),
            Value::Array(vec![]),
        ])
    }

    fn pong(_msg: &Message, _log: &Logger) -> Result<Reply, HandlerError> {
        Ok(Reply::ok("pong"))
    }

    fn reply(msg: &Message) -> &Response {
        match msg {
            Message::Response(rsp) => rsp,
            other => panic!("expected a response, got {}", other),
        }
    }

    #[test]
    fn ping_request_gets_pong() {
        let engine = engine();
        engine.register_function("ping", pong).unwrap();

        let out = engine.message_callback(&encode(request(7, "ping")));
        assert_eq!(out.len(), 1);

        let expected = Value::Array(vec![
            Value::from(1),
            Value::from(7),
            Value::Nil,
            Value::from("pong"),
        ]);
        assert_eq!(out[0].to_value(), expected);
    }

    #[test]
    fn handler_sees_params_and_sets_error() {
        let engine = engine();
        engine
            .register_function("echo", |msg: &Message, _log: &Logger| {
                let params = msg.params().unwrap_or(&[]);
                match params.first() {
                    Some(v) => Ok(Reply::ok(v.clone())),
                    None => Ok(Reply::err("nothing to echo")),
                }
            })
            .unwrap();

        let mut frame = request(2, "echo");
        if let Value::Array(items) = &mut frame {
            items[3] = Value::Array(vec![Value::from(42)]);
        }
        let out = engine.message_callback(&encode(frame));
        assert_eq!(reply(&out[0]).result, Value::from(42));

        let out = engine.message_callback(&encode(request(3, "echo")));
        assert_eq!(reply(&out[0]).error, Some(Value::from("nothing to echo")));
        assert_eq!(reply(&out[0]).msgid, 3);
    }

    #[test]
    fn unknown_function_answers_400() {
        let engine = engine();
        let out = engine.message_callback(&encode(request(12, "missing")));
        assert_eq!(out.len(), 1);
        let rsp = reply(&out[0]);
        assert_eq!(rsp.msgid, 12);
        assert_eq!(rsp.error_code(), Some(400));
    }

    #[test]
    fn handler_errors_map_to_wire_codes() {
        let engine = engine();
        engine
            .register_function("bad", |_: &Message, _: &Logger| {
                Err(HandlerError::InvalidMessage("wrong params".into()))
            })
            .unwrap();
        engine
            .register_function("broken", |_: &Message, _: &Logger| {
                Err(HandlerError::Internal("disk on fire".into()))
            })
            .unwrap();
        engine
            .register_function("panics", |_: &Message, _: &Logger| {
                panic!("boom")
            })
            .unwrap();

        let out = engine.message_callback(&encode(request(1, "bad")));
        assert_eq!(reply(&out[0]).error_code(), Some(400));

        let out = engine.message_callback(&encode(request(2, "broken")));
        assert_eq!(reply(&out[0]).error_code(), Some(418));

        let out = engine.message_callback(&encode(request(3, "panics")));
        assert_eq!(reply(&out[0]).msgid, 3);
        assert_eq!(reply(&out[0]).error_code(), Some(418));
    }

    #[test]
    fn response_invokes_callback_once() {
        let engine = engine();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&calls);

        let req = Message::from(Request::new(3, "work", vec![]));
        let callback: ResponseCallback =
            Box::new(move |rsp: Response| seen.lock().unwrap().push(rsp));
        engine.prepare_send(&req, Some(callback)).unwrap();
        assert!(engine.is_pending(3));

        let out = engine.message_callback(&encode(response(3, "ok")));
        assert!(out.is_empty());
        assert!(!engine.is_pending(3));

        // A duplicate response finds no callback and is dropped.
        let out = engine.message_callback(&encode(response(3, "ok")));
        assert!(out.is_empty());

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], Response::ok(3, Value::from("ok")));
    }

    #[test]
    fn unsolicited_response_is_discarded() {
        let engine = engine();
        let err = Value::Array(vec![
            Value::from(1),
            Value::from(99),
            Value::Array(vec![Value::from(400), Value::from("nope")]),
            Value::Nil,
        ]);
        assert!(engine.message_callback(&encode(err)).is_empty());
        assert!(engine.message_callback(&encode(response(98, "late"))).is_empty());
        assert_eq!(engine.pending(), 0);
    }

    #[test]
    fn panicking_callback_does_not_stop_siblings() {
        let engine = engine();
        engine.register_function("ping", pong).unwrap();

        let req = Message::from(Request::new(5, "work", vec![]));
        let callback: ResponseCallback = Box::new(|_: Response| panic!("bad callback"));
        engine.prepare_send(&req, Some(callback)).unwrap();

        let mut bytes = encode(response(5, "ok"));
        bytes.extend(encode(request(6, "ping")));
        let out = engine.message_callback(&bytes);
        assert_eq!(out.len(), 1);
        assert_eq!(reply(&out[0]).msgid, 6);
    }

    #[test]
    fn unsolicited_response_does_not_stop_chunk() {
        let engine = engine();
        engine.register_function("ping", pong).unwrap();

        let mut bytes = encode(response(42, "stray"));
        bytes.extend(encode(request(43, "ping")));
        let out = engine.message_callback(&bytes);
        assert_eq!(out.len(), 1);
        assert_eq!(*reply(&out[0]), Response::ok(43, Value::from("pong")));
    }

    #[test]
    fn notify_goes_to_broadcast() {
        let engine = engine();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        engine
            .register_function(BROADCAST, move |msg: &Message, _: &Logger| {
                assert_eq!(msg.function(), Some("update"));
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Reply::ok(Value::Nil))
            })
            .unwrap();

        let out = engine.message_callback(&encode(notify("update")));
        assert!(out.is_empty());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn notify_without_broadcast_sends_nothing() {
        let engine = engine();
        engine.register_function("update", pong).unwrap();
        assert!(engine.message_callback(&encode(notify("update"))).is_empty());
    }

    #[test]
    fn notify_with_callback_rejected() {
        let engine = engine();
        let msg = Message::from(Notify::new("tick", vec![]));
        let callback: ResponseCallback = Box::new(|_: Response| ());
        match engine.prepare_send(&msg, Some(callback)) {
            Err(Error::InvalidMessage(_)) => (),
            other => panic!("unexpected send result: {:?}", other),
        }
        assert_eq!(engine.pending(), 0);

        assert!(engine.prepare_send(&msg, None).is_ok());
    }

    #[test]
    fn malformed_frame_among_good_ones() {
        let engine = engine();
        engine.register_function("ping", pong).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        engine
            .register_function(BROADCAST, move |_: &Message, _: &Logger| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Reply::ok(Value::Nil))
            })
            .unwrap();

        let malformed = Value::Array(vec![
            Value::from(0),
            Value::from(4),
            Value::from(5),
            Value::Array(vec![]),
        ]);
        let mut bytes = encode(request(1, "ping"));
        bytes.extend(encode(malformed));
        bytes.extend(encode(notify("x")));
        bytes.extend(encode(request(2, "ping")));

        let out = engine.message_callback(&bytes);
        assert_eq!(out.len(), 3);
        assert_eq!(reply(&out[0]).msgid, 4);
        assert_eq!(reply(&out[0]).error_code(), Some(400));
        assert_eq!(reply(&out[1]).msgid, 1);
        assert_eq!(reply(&out[1]).result, Value::from("pong"));
        assert_eq!(reply(&out[2]).msgid, 2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unaddressed_malformed_frame() {
        let engine = engine();
        assert!(engine.message_callback(&encode(Value::from("junk"))).is_empty());

        let config = RpcConfig {
            answer_unaddressed_frames: true,
            ..RpcConfig::default()
        };
        let engine = engine_with(config);
        let out = engine.message_callback(&encode(Value::from("junk")));
        assert_eq!(out.len(), 1);
        assert_eq!(reply(&out[0]).msgid, 0);
        assert_eq!(reply(&out[0]).error_code(), Some(400));
    }

    #[test]
    fn split_frame_waits_for_rest() {
        let engine = engine();
        engine.register_function("ping", pong).unwrap();

        let bytes = encode(request(8, "ping"));
        let (head, tail) = bytes.split_at(3);
        assert!(engine.message_callback(head).is_empty());
        let out = engine.message_callback(tail);
        assert_eq!(reply(&out[0]).msgid, 8);
    }

    #[test]
    fn strict_registration_rejects_overwrite() {
        let engine = engine();
        engine.register_function("ping", pong).unwrap();
        assert!(engine.register_function("ping", pong).is_ok());

        let config = RpcConfig {
            strict_registration: true,
            ..RpcConfig::default()
        };
        let engine = engine_with(config);
        engine.register_function("ping", pong).unwrap();
        match engine.register_function("ping", pong) {
            Err(Error::AlreadyRegistered(name)) => assert_eq!(name, "ping"),
            other => panic!("unexpected register result: {:?}", other),
        }
    }

    #[test]
    fn forget_response_drops_callback() {
        let engine = engine();
        let req = Message::from(Request::new(10, "work", vec![]));
        let callback: ResponseCallback = Box::new(|_: Response| ());
        engine.prepare_send(&req, Some(callback)).unwrap();
        assert!(engine.forget_response(10));
        assert!(!engine.forget_response(10));
    }
}
