//! RESP protocol client.
//!
//! One `Client` owns exactly one TCP connection. `send` only queues the
//! encoded command; `recv` drives the socket until the next reply frame is
//! available. Queued bytes are written while replies are being read, so a
//! pipelined batch larger than the socket buffers cannot deadlock against a
//! server that stops reading until its replies are drained.

use crate::command::Command;
use crate::endpoint::Endpoint;
use crate::error::HarnessError;
use crate::protocols::resp::parser::{parse, ParseResult};
use crate::protocols::resp::Reply;
use bytes::{Buf, BytesMut};
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// Queued request bytes above which `send` starts pushing data to the socket.
const FLUSH_THRESHOLD: usize = 64 * 1024;

/// Base delay between connect attempts; attempt `n` waits `n` times this.
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Connection tuning shared by every client of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientOptions {
    /// Bound on each TCP connect attempt
    pub connect_timeout: Duration,
    /// Bound on waiting for any single reply
    pub command_timeout: Duration,
    /// Extra connect attempts after the first failure
    pub connect_retries: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(2000),
            command_timeout: Duration::from_millis(5000),
            connect_retries: 2,
        }
    }
}

/// Outcome of one socket step while waiting for replies.
enum IoEvent {
    Wrote(io::Result<usize>),
    Read(io::Result<usize>),
}

/// A connection to one endpoint.
#[derive(Debug)]
pub struct Client {
    endpoint: Endpoint,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    read_buf: BytesMut,
    write_buf: BytesMut,
    /// Commands sent whose replies have not been received yet.
    pending: usize,
    command_timeout: Duration,
}

impl Client {
    /// Connect and complete a `PING` handshake.
    ///
    /// Any failure here, including a timed out or malformed handshake reply,
    /// is reported as a connection error.
    pub async fn connect(
        endpoint: &Endpoint,
        options: &ClientOptions,
    ) -> Result<Self, HarnessError> {
        let stream = connect_with_retry(endpoint, options).await?;
        configure_socket(&stream).map_err(|e| connection_error(endpoint, e))?;

        let (reader, writer) = stream.into_split();
        let mut client = Client {
            endpoint: endpoint.clone(),
            reader,
            writer,
            read_buf: BytesMut::with_capacity(BUFFER_SIZE),
            write_buf: BytesMut::with_capacity(BUFFER_SIZE),
            pending: 0,
            command_timeout: options.command_timeout,
        };

        match client.execute(&Command::ping()).await {
            Ok(Reply::Error(msg)) => Err(connection_error(
                endpoint,
                io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("handshake rejected: {msg}"),
                ),
            )),
            Ok(reply) => {
                debug!(endpoint = %endpoint, %reply, "Connected");
                Ok(client)
            }
            Err(e @ HarnessError::Connection { .. }) => Err(e),
            Err(e) => Err(connection_error(
                endpoint,
                io::Error::new(io::ErrorKind::Other, format!("handshake failed: {e}")),
            )),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Number of commands sent and still awaiting a reply.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Queue a command without waiting for its reply.
    ///
    /// May be called any number of times before `recv`; replies come back in
    /// the order the commands were sent.
    pub async fn send(&mut self, command: &Command) -> Result<(), HarnessError> {
        trace!(endpoint = %self.endpoint, %command, "send");
        command.encode_into(&mut self.write_buf);
        self.pending += 1;

        if self.write_buf.len() >= FLUSH_THRESHOLD {
            let after = self.command_timeout;
            match tokio::time::timeout(after, self.drain_writes()).await {
                Ok(result) => result?,
                Err(_) => return Err(self.timeout_error(after)),
            }
        }
        Ok(())
    }

    /// Wait for the reply to the oldest outstanding command.
    pub async fn recv(&mut self) -> Result<Reply, HarnessError> {
        if self.pending == 0 {
            return Err(HarnessError::Protocol {
                endpoint: self.endpoint.clone(),
                index: None,
                message: "recv called with no command awaiting a reply".to_string(),
            });
        }

        let after = self.command_timeout;
        match tokio::time::timeout(after, self.next_reply()).await {
            Ok(result) => result,
            Err(_) => Err(self.timeout_error(after)),
        }
    }

    /// Send one command and wait for its reply.
    pub async fn execute(&mut self, command: &Command) -> Result<Reply, HarnessError> {
        self.send(command).await?;
        self.recv().await
    }

    /// Shut the connection down. Dropping a client also closes it; this just
    /// sends FIN first so the server sees a clean close.
    pub async fn close(mut self) {
        if self.pending > 0 {
            debug!(
                endpoint = %self.endpoint,
                pending = self.pending,
                "Closing with replies outstanding"
            );
        }
        if let Err(e) = self.writer.shutdown().await {
            debug!(endpoint = %self.endpoint, error = %e, "Shutdown failed");
        }
    }

    async fn next_reply(&mut self) -> Result<Reply, HarnessError> {
        loop {
            match parse(&self.read_buf) {
                ParseResult::Complete(frame, consumed) => {
                    self.read_buf.advance(consumed);
                    self.pending -= 1;
                    return Ok(Reply::from(frame));
                }
                ParseResult::Error(message) => {
                    warn!(endpoint = %self.endpoint, error = %message, "Malformed reply");
                    return Err(HarnessError::Protocol {
                        endpoint: self.endpoint.clone(),
                        index: None,
                        message,
                    });
                }
                ParseResult::Incomplete => {
                    // A partial reply is parsed again from its start, so read
                    // capacity grows with it and parsing waits for new bytes.
                    let buffered = self.read_buf.len();
                    self.read_buf.reserve(buffered.max(BUFFER_SIZE));
                    while self.read_buf.len() == buffered {
                        self.pump().await?;
                    }
                }
            }
        }
    }

    async fn drain_writes(&mut self) -> Result<(), HarnessError> {
        while !self.write_buf.is_empty() {
            self.pump().await?;
        }
        Ok(())
    }

    /// Make one unit of progress on the socket: write queued bytes if there
    /// are any, and read whatever replies have arrived in the meantime.
    async fn pump(&mut self) -> Result<(), HarnessError> {
        let event = if self.write_buf.is_empty() {
            IoEvent::Read(self.reader.read_buf(&mut self.read_buf).await)
        } else {
            tokio::select! {
                res = self.writer.write(&self.write_buf[..]) => IoEvent::Wrote(res),
                res = self.reader.read_buf(&mut self.read_buf) => IoEvent::Read(res),
            }
        };

        let n = match event {
            IoEvent::Wrote(res) => {
                let n = res.map_err(|e| connection_error(&self.endpoint, e))?;
                self.write_buf.advance(n);
                n
            }
            IoEvent::Read(res) => res.map_err(|e| connection_error(&self.endpoint, e))?,
        };

        if n == 0 {
            return Err(connection_error(
                &self.endpoint,
                io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by server"),
            ));
        }
        Ok(())
    }

    fn timeout_error(&self, after: Duration) -> HarnessError {
        warn!(endpoint = %self.endpoint, ?after, pending = self.pending, "Reply timed out");
        HarnessError::Timeout {
            endpoint: self.endpoint.clone(),
            index: None,
            after,
        }
    }
}

fn connection_error(endpoint: &Endpoint, source: io::Error) -> HarnessError {
    HarnessError::Connection {
        endpoint: endpoint.clone(),
        index: None,
        source,
    }
}

/// TCP connect with a bounded number of attempts, each bounded in time.
async fn connect_with_retry(
    endpoint: &Endpoint,
    options: &ClientOptions,
) -> Result<TcpStream, HarnessError> {
    let attempts = options.connect_retries + 1;
    let mut last_error = None;

    for attempt in 1..=attempts {
        let connect = TcpStream::connect((endpoint.host(), endpoint.port()));
        let error = match tokio::time::timeout(options.connect_timeout, connect).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => e,
            Err(_) => io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect timed out after {:?}", options.connect_timeout),
            ),
        };

        warn!(endpoint = %endpoint, attempt, attempts, error = %error, "Connect failed");
        last_error = Some(error);
        if attempt < attempts {
            tokio::time::sleep(RETRY_BACKOFF * attempt).await;
        }
    }

    let source = last_error
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "no connect attempt made"));
    Err(connection_error(endpoint, source))
}

fn configure_socket(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(30));
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}
