// Copyright 2020 Joyent, Inc.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use slog::{debug, info, o, warn, Drain, Logger};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::error::Error;

struct Outbound {
    bytes: Vec<u8>,
    done: oneshot::Sender<io::Result<()>>,
}

/// Handle for writing to a connection.  Cheap to clone; every clone feeds
/// the same writer task, so writes are never interleaved.
#[derive(Clone)]
pub struct ConnectionSender {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionSender {
    /// Write `bytes` and wait until the socket has accepted all of them.
    pub async fn send(&self, bytes: Vec<u8>) -> Result<(), Error> {
        let (done, accepted) = oneshot::channel();
        self.tx
            .send(Outbound { bytes, done })
            .map_err(|_| Error::NotConnected)?;

        match accepted.await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::NotConnected),
        }
    }
}

/// A TCP connection with a background reader and writer.
///
/// Every chunk the reader receives is handed to the `on_receive` callback,
/// which returns the frames to write back.  The reader waits for each of
/// them to be written before it reads again, so a peer that stops reading
/// also stops being read from.  The connection is reported as
/// disconnected once either side of the socket fails, the peer closes it, or
/// `disconnect` is called.
pub struct Connection {
    sender: ConnectionSender,
    disconnected: watch::Receiver<bool>,
    signal: Arc<watch::Sender<bool>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    log: Logger,
}

async fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>, Error> {
    if host.is_empty() {
        return Err(Error::InvalidAddress(String::from("empty host name")));
    }
    if port == 0 {
        return Err(Error::InvalidAddress(String::from("port must be non-zero")));
    }

    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|e| Error::HostUnknown(format!("{}: {}", host, e)))?
        .collect();

    if addrs.is_empty() {
        Err(Error::HostUnknown(host.to_string()))
    } else {
        Ok(addrs)
    }
}

async fn open_stream(host: &str, port: u16) -> Result<TcpStream, Error> {
    let mut last_err = None;
    for addr in resolve(host, port).await? {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }

    match last_err {
        Some(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
            Err(Error::ConnectionRefused(e))
        }
        Some(e) => Err(Error::Io(e)),
        None => Err(Error::HostUnknown(host.to_string())),
    }
}

async fn read_loop<F>(
    mut stream: OwnedReadHalf,
    mut on_receive: F,
    sender: ConnectionSender,
    buffer_size: usize,
    signal: Arc<watch::Sender<bool>>,
    log: Logger,
) where
    F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
{
    let mut read_buf = vec![0; buffer_size.max(1)];

    'read: loop {
        match stream.read(&mut read_buf).await {
            Ok(0) => {
                info!(log, "peer closed connection");
                break;
            }
            Ok(byte_count) => {
                debug!(log, "received data"; "bytes" => byte_count);
                for reply in on_receive(&read_buf[..byte_count]) {
                    if let Err(e) = sender.send(reply).await {
                        warn!(log, "unable to send reply"; "err" => %e);
                        break 'read;
                    }
                }
            }
            Err(e) => {
                warn!(log, "failed to read from connection"; "err" => %e);
                break;
            }
        }
    }

    let _ = signal.send(true);
}

async fn write_loop(
    mut stream: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    signal: Arc<watch::Sender<bool>>,
    log: Logger,
) {
    while let Some(out) = rx.recv().await {
        let result = stream.write_all(&out.bytes).await;
        let failed = result.is_err();
        if let Err(e) = &result {
            warn!(log, "failed to write to connection"; "err" => %e);
        }
        let _ = out.done.send(result);
        if failed {
            break;
        }
    }

    let _ = stream.shutdown().await;
    let _ = signal.send(true);
}

impl Connection {
    pub async fn connect<F>(
        host: &str,
        port: u16,
        on_receive: F,
        read_buffer_size: usize,
        log: Option<&Logger>,
    ) -> Result<Connection, Error>
    where
        F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
            .new(o!("host" => host.to_string(), "port" => port));

        let stream = open_stream(host, port).await?;
        info!(log, "connected");
        let (read_half, write_half) = stream.into_split();

        let (tx, rx) = mpsc::unbounded_channel();
        let (signal, disconnected) = watch::channel(false);
        let signal = Arc::new(signal);
        let sender = ConnectionSender { tx };

        let writer = tokio::spawn(write_loop(
            write_half,
            rx,
            Arc::clone(&signal),
            log.clone(),
        ));
        let reader = tokio::spawn(read_loop(
            read_half,
            on_receive,
            sender.clone(),
            read_buffer_size,
            Arc::clone(&signal),
            log.clone(),
        ));

        Ok(Connection {
            sender,
            disconnected,
            signal,
            reader,
            writer,
            log,
        })
    }

    pub async fn send(&self, bytes: Vec<u8>) -> Result<(), Error> {
        self.sender.send(bytes).await
    }

    pub fn disconnect(&self) {
        info!(self.log, "disconnecting");
        self.reader.abort();
        self.writer.abort();
        let _ = self.signal.send(true);
    }

    pub fn is_connected(&self) -> bool {
        !*self.disconnected.borrow()
    }

    /// Resolves once the connection is closed, for whatever reason.
    pub async fn wait_disconnected(&self) {
        let mut disconnected = self.disconnected.clone();
        loop {
            let done = *disconnected.borrow();
            if done || disconnected.changed().await.is_err() {
                break;
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}
