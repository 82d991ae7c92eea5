// Copyright 2020 Joyent, Inc.

use std::collections::HashMap;
use std::sync::Arc;

use rmpv::Value;
use slog::Logger;
use thiserror::Error;

use crate::protocol::{Message, ERROR_INVALID_MESSAGE, ERROR_UNEXPECTED};

/// Name of the handler every inbound notification is routed to.
pub const BROADCAST: &str = "broadcast";

/// What a handler produces for a request: an optional error value and a
/// result value, copied verbatim into the response.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub error: Option<Value>,
    pub result: Value,
}

impl Reply {
    pub fn ok<V: Into<Value>>(result: V) -> Reply {
        Reply {
            error: None,
            result: result.into(),
        }
    }

    pub fn err<V: Into<Value>>(error: V) -> Reply {
        Reply {
            error: Some(error.into()),
            result: Value::Nil,
        }
    }
}

impl From<(Option<Value>, Value)> for Reply {
    fn from((error, result): (Option<Value>, Value)) -> Reply {
        Reply { error, result }
    }
}

/// Failure reported by a handler.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HandlerError {
    /// The message could not be handled; answered with wire code 400.
    #[error("{0}")]
    InvalidMessage(String),

    /// Something unexpected went wrong; answered with wire code 418.
    #[error("{0}")]
    Internal(String),
}

/// Failure to route a message to a handler.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("no function registered as {0}")]
    UnknownFunction(String),

    #[error("{0}")]
    Handler(#[from] HandlerError),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl DispatchError {
    /// Wire error code used when answering a request that failed this way.
    pub fn code(&self) -> u32 {
        match self {
            DispatchError::UnknownFunction(_)
            | DispatchError::Handler(HandlerError::InvalidMessage(_)) => {
                ERROR_INVALID_MESSAGE
            }
            DispatchError::Handler(HandlerError::Internal(_))
            | DispatchError::Panicked(_) => ERROR_UNEXPECTED,
        }
    }
}

pub type Handler =
    dyn Fn(&Message, &Logger) -> Result<Reply, HandlerError> + Send + Sync;

/// Function name to handler mapping.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<String, Arc<Handler>>,
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        Dispatcher::default()
    }

    /// Install a handler, returning the one it replaced.
    pub fn register(
        &mut self,
        name: String,
        handler: Arc<Handler>,
    ) -> Option<Arc<Handler>> {
        self.handlers.insert(name, handler)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Handler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use slog::{o, Discard};

    use crate::protocol::Request;

    fn constant(value: &'static str) -> Arc<Handler> {
        Arc::new(move |_msg: &Message, _log: &Logger| Ok(Reply::ok(value)))
    }

    #[test]
    fn last_registration_wins() {
        let log = Logger::root(Discard, o!());
        let msg = Message::from(Request::new(1, "f", vec![]));

        let mut dispatcher = Dispatcher::new();
        assert!(dispatcher.register("f".into(), constant("first")).is_none());
        assert!(dispatcher.register("f".into(), constant("second")).is_some());
        assert_eq!(dispatcher.len(), 1);

        let handler = dispatcher.get("f").unwrap();
        assert_eq!(handler(&msg, &log), Ok(Reply::ok("second")));
    }

    #[test]
    fn unknown_name_is_absent() {
        let dispatcher = Dispatcher::new();
        assert!(dispatcher.get(BROADCAST).is_none());
        assert!(!dispatcher.contains("ping"));
        assert!(dispatcher.is_empty());
    }

    #[test]
    fn dispatch_error_codes() {
        assert_eq!(DispatchError::UnknownFunction("x".into()).code(), 400);
        assert_eq!(
            DispatchError::from(HandlerError::InvalidMessage("x".into()))
                .code(),
            400
        );
        assert_eq!(
            DispatchError::from(HandlerError::Internal("x".into())).code(),
            418
        );
        assert_eq!(DispatchError::Panicked("x".into()).code(), 418);
    }
}
