// Copyright 2020 Joyent, Inc.

use std::collections::HashMap;

use crate::error::Error;
use crate::protocol::{MsgId, Response};

/// One-shot callback run when the response to a request arrives.
pub type ResponseCallback = Box<dyn FnOnce(Response) + Send>;

/// Outstanding requests, keyed by message id.
///
/// Entries live until the matching response is taken with `pop`; nothing
/// expires them.
#[derive(Default)]
pub struct ResponseCallbacks {
    pending: HashMap<MsgId, ResponseCallback>,
}

impl ResponseCallbacks {
    pub fn new() -> ResponseCallbacks {
        ResponseCallbacks::default()
    }

    pub fn insert(
        &mut self,
        msgid: MsgId,
        callback: ResponseCallback,
    ) -> Result<(), Error> {
        if self.pending.contains_key(&msgid) {
            let msg = format!("msgid {} is already awaiting a response", msgid);
            return Err(Error::invalid_message(msg));
        }
        self.pending.insert(msgid, callback);
        Ok(())
    }

    pub fn pop(&mut self, msgid: MsgId) -> Option<ResponseCallback> {
        self.pending.remove(&msgid)
    }

    pub fn contains(&self, msgid: MsgId) -> bool {
        self.pending.contains_key(&msgid)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
