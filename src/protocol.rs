// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::io;

use bytes::BytesMut;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use rmpv::Value;
use tokio_util::codec::{Decoder, Encoder};

use crate::config::DEFAULT_MAX_FRAME_SIZE;
use crate::error::Error;

/*
 * Message IDs: each request carries a message id, which is scoped to the
 * connection.  We allocate these sequentially from a circular 31-bit space.
 */
const MSGID_MAX: u32 = i32::max_value() as u32;

/// Wire error code for messages that could not be handled.
pub const ERROR_INVALID_MESSAGE: u32 = 400;
/// Wire error code for unexpected failures while handling a request.
pub const ERROR_UNEXPECTED: u32 = 418;

const FRAME_LEN: usize = 4;
const NOTIFY_SHORT_FRAME_LEN: usize = 3;

pub type MsgId = u32;

/// Outcome of decoding a single frame.
pub type Decoded = Result<Message, InvalidFrame>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum MessageType {
    Request = 0,
    Response = 1,
    Notify = 2,
}

/// Sequential message id allocator.
#[derive(Debug, Default)]
pub struct MessageId(u32);

impl MessageId {
    pub fn new() -> MessageId {
        MessageId(0)
    }

    pub fn next_id(&mut self) -> MsgId {
        self.0 = if self.0 >= MSGID_MAX { 1 } else { self.0 + 1 };
        self.0
    }
}

impl Iterator for MessageId {
    type Item = MsgId;

    fn next(&mut self) -> Option<MsgId> {
        Some(self.next_id())
    }
}

/// A frame that could not be turned into a `Message`.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("{reason}")]
pub struct InvalidFrame {
    /// Message id recovered from the frame, if it had a usable one.
    pub msgid: Option<MsgId>,
    pub reason: String,
}

impl InvalidFrame {
    fn new<S: Into<String>>(msgid: Option<MsgId>, reason: S) -> InvalidFrame {
        InvalidFrame {
            msgid,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub msgid: MsgId,
    pub function: String,
    pub params: Vec<Value>,
}

impl Request {
    pub fn new<S: Into<String>>(
        msgid: MsgId,
        function: S,
        params: Vec<Value>,
    ) -> Request {
        Request {
            msgid,
            function: function.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub msgid: MsgId,
    /// `None` on success, otherwise usually `[code, description]`.
    pub error: Option<Value>,
    pub result: Value,
}

impl Response {
    pub fn new(msgid: MsgId, error: Option<Value>, result: Value) -> Response {
        Response {
            msgid,
            error,
            result,
        }
    }

    pub fn ok(msgid: MsgId, result: Value) -> Response {
        Response::new(msgid, None, result)
    }

    /// Build an error response carrying `[code, description]`.
    pub fn error(msgid: MsgId, code: u32, description: &str) -> Response {
        let error = Value::Array(vec![Value::from(code), Value::from(description)]);
        Response::new(msgid, Some(error), Value::Nil)
    }

    /// The numeric code of a `[code, description]` error, if there is one.
    pub fn error_code(&self) -> Option<u64> {
        match &self.error {
            Some(Value::Array(items)) => items.get(0).and_then(Value::as_u64),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notify {
    pub function: String,
    pub params: Vec<Value>,
}

impl Notify {
    pub fn new<S: Into<String>>(function: S, params: Vec<Value>) -> Notify {
        Notify {
            function: function.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notify(Notify),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Request(_) => MessageType::Request,
            Message::Response(_) => MessageType::Response,
            Message::Notify(_) => MessageType::Notify,
        }
    }

    /// Notifications never carry a message id.
    pub fn msgid(&self) -> Option<MsgId> {
        match self {
            Message::Request(req) => Some(req.msgid),
            Message::Response(rsp) => Some(rsp.msgid),
            Message::Notify(_) => None,
        }
    }

    pub fn function(&self) -> Option<&str> {
        match self {
            Message::Request(req) => Some(req.function.as_str()),
            Message::Notify(notify) => Some(notify.function.as_str()),
            Message::Response(_) => None,
        }
    }

    pub fn params(&self) -> Option<&[Value]> {
        match self {
            Message::Request(req) => Some(req.params.as_slice()),
            Message::Notify(notify) => Some(notify.params.as_slice()),
            Message::Response(_) => None,
        }
    }

    pub fn to_value(&self) -> Value {
        let tag = Value::from(self.message_type() as u8);
        match self {
            Message::Request(req) => Value::Array(vec![
                tag,
                Value::from(req.msgid),
                Value::from(req.function.as_str()),
                Value::Array(req.params.clone()),
            ]),
            Message::Response(rsp) => Value::Array(vec![
                tag,
                Value::from(rsp.msgid),
                rsp.error.clone().unwrap_or(Value::Nil),
                rsp.result.clone(),
            ]),
            Message::Notify(notify) => Value::Array(vec![
                tag,
                Value::Nil,
                Value::from(notify.function.as_str()),
                Value::Array(notify.params.clone()),
            ]),
        }
    }

    /// Serialize the message into a single msgpack frame.
    pub fn pack(&self) -> Result<Vec<u8>, Error> {
        if let Some(function) = self.function() {
            if function.is_empty() {
                return Err(Error::invalid_message("function name is empty"));
            }
        }

        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &self.to_value()).map_err(|e| {
            Error::invalid_message(format!("failed to encode message: {}", e))
        })?;
        Ok(buf)
    }

    /// Validate a decoded msgpack value against the message schema.
    pub fn from_value(value: Value) -> Result<Message, InvalidFrame> {
        let items = match value {
            Value::Array(items) => items,
            other => {
                let msg = format!("expected array, got {}", other);
                return Err(InvalidFrame::new(None, msg));
            }
        };

        let msgid = recover_msgid(&items);
        let msg_type = parse_type(&items)
            .map_err(|reason| InvalidFrame::new(msgid, reason))?;

        let parsed = match msg_type {
            MessageType::Request => parse_request(items),
            MessageType::Response => parse_response(items),
            MessageType::Notify => parse_notify(items),
        };
        parsed.map_err(|reason| InvalidFrame::new(msgid, reason))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_value())
    }
}

impl From<Request> for Message {
    fn from(req: Request) -> Message {
        Message::Request(req)
    }
}

impl From<Response> for Message {
    fn from(rsp: Response) -> Message {
        Message::Response(rsp)
    }
}

impl From<Notify> for Message {
    fn from(notify: Notify) -> Message {
        Message::Notify(notify)
    }
}

fn recover_msgid(items: &[Value]) -> Option<MsgId> {
    items
        .get(1)
        .and_then(Value::as_u64)
        .and_then(|id| MsgId::from_u64(id))
}

fn parse_type(items: &[Value]) -> Result<MessageType, String> {
    let tag = items
        .get(0)
        .and_then(Value::as_u64)
        .ok_or_else(|| String::from("missing or non-integer message type"))?;
    MessageType::from_u64(tag)
        .ok_or_else(|| format!("unknown message type {}", tag))
}

fn check_length(items: &[Value], expected: usize) -> Result<(), String> {
    if items.len() != expected {
        Err(format!(
            "expected {} elements in message, got {}",
            expected,
            items.len()
        ))
    } else {
        Ok(())
    }
}

fn parse_msgid(value: &Value) -> Result<MsgId, String> {
    value
        .as_u64()
        .and_then(MsgId::from_u64)
        .ok_or_else(|| format!("invalid msgid {}", value))
}

fn parse_function(value: Value) -> Result<String, String> {
    match value {
        Value::String(s) => s
            .into_str()
            .ok_or_else(|| String::from("function name is not valid UTF-8")),
        other => Err(format!("function name must be a string, got {}", other)),
    }
}

fn parse_params(value: Value) -> Result<Vec<Value>, String> {
    match value {
        Value::Array(params) => Ok(params),
        other => Err(format!("params must be an array, got {}", other)),
    }
}

fn parse_request(items: Vec<Value>) -> Result<Message, String> {
    check_length(&items, FRAME_LEN)?;
    let msgid = parse_msgid(&items[1])?;
    let mut rest = items.into_iter().skip(2);
    let function = parse_function(rest.next().unwrap_or(Value::Nil))?;
    let params = parse_params(rest.next().unwrap_or(Value::Nil))?;

    Ok(Message::Request(Request {
        msgid,
        function,
        params,
    }))
}

fn parse_response(items: Vec<Value>) -> Result<Message, String> {
    check_length(&items, FRAME_LEN)?;
    let msgid = parse_msgid(&items[1])?;
    let mut rest = items.into_iter().skip(2);
    let error = match rest.next() {
        Some(Value::Nil) | None => None,
        Some(err) => Some(err),
    };
    let result = rest.next().unwrap_or(Value::Nil);

    Ok(Message::Response(Response {
        msgid,
        error,
        result,
    }))
}

fn parse_notify(items: Vec<Value>) -> Result<Message, String> {
    let skip = match items.len() {
        FRAME_LEN if items[1].is_nil() => 2,
        FRAME_LEN => {
            return Err(String::from("notify message must not carry a msgid"))
        }
        NOTIFY_SHORT_FRAME_LEN => 1,
        n => {
            return Err(format!(
                "expected {} elements in message, got {}",
                FRAME_LEN, n
            ))
        }
    };
    let mut rest = items.into_iter().skip(skip);
    let function = parse_function(rest.next().unwrap_or(Value::Nil))?;
    let params = parse_params(rest.next().unwrap_or(Value::Nil))?;

    Ok(Message::Notify(Notify { function, params }))
}

fn invalid_data<S: Into<String>>(msg: S) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// One msgpack token: its encoded size and, for arrays and maps, the number
/// of values that follow it.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Token {
    len: usize,
    items: u64,
}

impl Token {
    fn scalar(len: usize) -> Option<Token> {
        Some(Token { len, items: 0 })
    }
}

fn read_be(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0, |acc, b| (acc << 8) | u64::from(*b))
}

/// A str, bin or ext token whose payload length follows the marker in a
/// `width`-byte field.  `extra` covers the ext type byte.
fn sized(buf: &[u8], width: usize, extra: usize) -> io::Result<Option<Token>> {
    let header = 1 + width + extra;
    if buf.len() < 1 + width {
        return Ok(None);
    }
    let payload = read_be(&buf[1..=width]) as usize;
    let len = header
        .checked_add(payload)
        .ok_or_else(|| invalid_data("msgpack token length overflows"))?;
    Ok(Token::scalar(len))
}

/// An array (`per_item` 1) or map (`per_item` 2) with its count in a
/// `width`-byte field.
fn counted(buf: &[u8], width: usize, per_item: u64) -> Option<Token> {
    if buf.len() < 1 + width {
        return None;
    }
    Some(Token {
        len: 1 + width,
        items: read_be(&buf[1..=width]) * per_item,
    })
}

/// Size the token at the front of `buf`.  `None` means its header is not
/// complete yet.
fn token(buf: &[u8]) -> io::Result<Option<Token>> {
    let marker = match buf.first() {
        Some(marker) => *marker,
        None => return Ok(None),
    };

    let token = match marker {
        0x00..=0x7f | 0xc0 | 0xc2 | 0xc3 | 0xe0..=0xff => Token::scalar(1),
        0x80..=0x8f => Some(Token {
            len: 1,
            items: u64::from(marker & 0x0f) * 2,
        }),
        0x90..=0x9f => Some(Token {
            len: 1,
            items: u64::from(marker & 0x0f),
        }),
        0xa0..=0xbf => Token::scalar(1 + usize::from(marker & 0x1f)),
        0xcc | 0xd0 => Token::scalar(2),
        0xcd | 0xd1 | 0xd4 => Token::scalar(3),
        0xd5 => Token::scalar(4),
        0xca | 0xce | 0xd2 => Token::scalar(5),
        0xd6 => Token::scalar(6),
        0xcb | 0xcf | 0xd3 => Token::scalar(9),
        0xd7 => Token::scalar(10),
        0xd8 => Token::scalar(18),
        0xc4 | 0xd9 => return sized(buf, 1, 0),
        0xc5 | 0xda => return sized(buf, 2, 0),
        0xc6 | 0xdb => return sized(buf, 4, 0),
        0xc7 => return sized(buf, 1, 1),
        0xc8 => return sized(buf, 2, 1),
        0xc9 => return sized(buf, 4, 1),
        0xdc => counted(buf, 2, 1),
        0xdd => counted(buf, 4, 1),
        0xde => counted(buf, 2, 2),
        0xdf => counted(buf, 4, 2),
        _ => {
            let msg = format!("invalid msgpack marker 0x{:02x}", marker);
            return Err(invalid_data(msg));
        }
    };
    Ok(token)
}

/// Resumable search for the end of the msgpack value at the front of a
/// buffer.  Bytes already walked are not looked at again when more data
/// arrives, so a large frame delivered in small reads costs linear time.
#[derive(Debug, Clone, Default)]
struct FrameScan {
    /// Offset of the next unread token.
    pos: usize,
    /// Values still owed by each open array or map, outermost first.
    open: Vec<u64>,
}

impl FrameScan {
    fn reset(&mut self) {
        self.pos = 0;
        self.open.clear();
    }

    /// Returns the length of the first complete value in `buf`, or `None`
    /// if it is still incomplete.
    fn advance(&mut self, buf: &[u8]) -> io::Result<Option<usize>> {
        if self.pos > buf.len() {
            self.reset();
        }
        if self.open.is_empty() {
            self.open.push(1);
        }

        loop {
            let token = match token(&buf[self.pos..])? {
                Some(token) => token,
                None => return Ok(None),
            };
            if buf.len() - self.pos < token.len {
                return Ok(None);
            }
            self.pos += token.len;

            if let Some(owed) = self.open.last_mut() {
                *owed -= 1;
            }
            if token.items > 0 {
                self.open.push(token.items);
            }
            while self.open.last() == Some(&0) {
                self.open.pop();
            }

            if self.open.is_empty() {
                let end = self.pos;
                self.reset();
                return Ok(Some(end));
            }
        }
    }
}

/// Frame codec for msgpack RPC messages.
///
/// Frames are self-delimiting msgpack values.  The decoder first finds where
/// the value at the front of the buffer ends, remembering how far it got
/// between calls, and only then decodes it.  A frame that is complete but not
/// a valid message is returned as `Err(InvalidFrame)` in the item and does
/// not stop the stream; bytes that are not msgpack at all are a codec error
/// since the stream cannot be resynchronised.
///
/// A codec instance keeps scan state for the buffer it is decoding, so it
/// must only ever be used with one stream.
#[derive(Debug, Clone)]
pub struct MsgpackRpc {
    max_frame_size: usize,
    scan: FrameScan,
}

impl MsgpackRpc {
    pub fn new(max_frame_size: usize) -> MsgpackRpc {
        MsgpackRpc {
            max_frame_size,
            scan: FrameScan::default(),
        }
    }
}

impl Default for MsgpackRpc {
    fn default() -> Self {
        MsgpackRpc::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for MsgpackRpc {
    type Item = Decoded;
    type Error = io::Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, io::Error> {
        if buf.is_empty() {
            return Ok(None);
        }

        let end = match self.scan.advance(&buf[..]) {
            Ok(Some(end)) => end,
            Ok(None) if buf.len() > self.max_frame_size => {
                self.scan.reset();
                let msg = format!(
                    "partial frame of {} bytes exceeds limit of {}",
                    buf.len(),
                    self.max_frame_size
                );
                return Err(invalid_data(msg));
            }
            Ok(None) => return Ok(None),
            Err(e) => {
                self.scan.reset();
                return Err(e);
            }
        };

        let frame = buf.split_to(end);
        match rmpv::decode::read_value(&mut &frame[..]) {
            Ok(value) => Ok(Some(Message::from_value(value))),
            Err(e) => {
                let reason = format!("failed to decode msgpack frame: {}", e);
                Ok(Some(Err(InvalidFrame::new(None, reason))))
            }
        }
    }
}

impl Encoder<Message> for MsgpackRpc {
    type Error = io::Error;

    fn encode(
        &mut self,
        item: Message,
        buf: &mut BytesMut,
    ) -> Result<(), io::Error> {
        let bytes = item.pack().map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidInput, e.to_string())
        })?;
        buf.reserve(bytes.len());
        buf.extend_from_slice(&bytes);
        Ok(())
    }
}

/// Incremental decode buffer.
///
/// Bytes fed in are appended to an internal buffer and every complete frame
/// is decoded.  Trailing partial frames stay buffered for the next feed.
#[derive(Debug)]
pub struct Unpacker {
    codec: MsgpackRpc,
    buf: BytesMut,
}

impl Unpacker {
    pub fn new(max_frame_size: usize) -> Unpacker {
        Unpacker {
            codec: MsgpackRpc::new(max_frame_size),
            buf: BytesMut::new(),
        }
    }

    pub fn feed(&mut self, data: &[u8]) -> Vec<Decoded> {
        self.buf.extend_from_slice(data);

        let mut decoded = Vec::new();
        loop {
            match self.codec.decode(&mut self.buf) {
                Ok(Some(item)) => decoded.push(item),
                Ok(None) => break,
                Err(e) => {
                    // Not msgpack: nothing after this point can be trusted.
                    self.buf.clear();
                    decoded.push(Err(InvalidFrame::new(None, e.to_string())));
                    break;
                }
            }
        }
        decoded
    }

    /// Number of bytes held back as a partial frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl Default for Unpacker {
    fn default() -> Self {
        Unpacker::new(DEFAULT_MAX_FRAME_SIZE)
    }
}
