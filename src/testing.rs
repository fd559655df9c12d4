//! In-process RESP server for tests.
//!
//! Speaks enough of the Redis command set to exercise the client, the
//! benchmark runner and the comparator over real sockets. Flavours change
//! how it answers so the failure and divergence paths can be driven.

use crate::endpoint::Endpoint;
use crate::protocols::resp::parser::{parse, Frame, ParseResult};
use bytes::{Buf, Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// How the server answers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Flavor {
    /// Behaves like Redis for the supported commands.
    Standard,
    /// Counter commands reply with bulk strings instead of integers.
    StringCounters,
    /// Answers the handshake PING, then never replies again.
    Stalls,
    /// Answers the handshake PING, then replies with bytes that are not RESP.
    Garbage,
    /// Refuses every command, including the handshake.
    RejectsAll,
}

#[derive(Debug, Clone)]
enum Value {
    Str(Bytes),
    List(VecDeque<Bytes>),
}

type Store = Arc<Mutex<HashMap<String, Value>>>;

pub(crate) struct MockServer {
    endpoint: Endpoint,
    store: Store,
    accept_loop: JoinHandle<()>,
}

impl MockServer {
    pub(crate) async fn start(flavor: Flavor) -> Self {
        Self::start_on(0, flavor).await
    }

    /// Listen on a specific port; 0 picks a free one.
    pub(crate) async fn start_on(port: u16, flavor: Flavor) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let store: Store = Arc::default();

        let shared = Arc::clone(&store);
        let accept_loop = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let store = Arc::clone(&shared);
                tokio::spawn(handle_connection(stream, store, flavor));
            }
        });

        MockServer {
            endpoint: Endpoint::new("127.0.0.1", port),
            store,
            accept_loop,
        }
    }

    pub(crate) fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    /// Store a string value directly, bypassing the protocol.
    pub(crate) fn seed(&self, key: &str, value: &str) {
        self.store.lock().unwrap().insert(
            key.to_string(),
            Value::Str(Bytes::copy_from_slice(value.as_bytes())),
        );
    }

    /// Current string value of a key.
    pub(crate) fn value(&self, key: &str) -> Option<String> {
        match self.store.lock().unwrap().get(key) {
            Some(Value::Str(data)) => Some(String::from_utf8_lossy(data).into_owned()),
            _ => None,
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

async fn handle_connection(mut stream: TcpStream, store: Store, flavor: Flavor) {
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);
    let mut handshaken = false;

    loop {
        match parse(&buffer) {
            ParseResult::Complete(frame, consumed) => {
                buffer.advance(consumed);
                let args = match request_args(frame) {
                    Ok(args) => args,
                    Err(msg) => {
                        let _ = stream.write_all(&Frame::Error(msg).encode()).await;
                        continue;
                    }
                };

                let reply = match flavor {
                    Flavor::RejectsAll => {
                        Frame::Error("NOAUTH Authentication required.".to_string()).encode()
                    }
                    _ if !handshaken => {
                        handshaken = true;
                        execute(&args, &store, flavor).encode()
                    }
                    Flavor::Stalls => continue,
                    Flavor::Garbage => BytesMut::from(&b"?garbage\r\n"[..]),
                    Flavor::Standard | Flavor::StringCounters => {
                        execute(&args, &store, flavor).encode()
                    }
                };
                if stream.write_all(&reply).await.is_err() {
                    return;
                }
            }
            ParseResult::Incomplete => match stream.read_buf(&mut buffer).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            },
            ParseResult::Error(e) => {
                let _ = stream.write_all(&Frame::Error(format!("ERR {e}")).encode()).await;
                return;
            }
        }
    }
}

fn request_args(frame: Frame) -> Result<Vec<Bytes>, String> {
    let Frame::Array(Some(frames)) = frame else {
        return Err("ERR expected array".to_string());
    };
    frames
        .into_iter()
        .map(|f| match f {
            Frame::Bulk(Some(data)) => Ok(data),
            _ => Err("ERR expected bulk string argument".to_string()),
        })
        .collect()
}

fn wrong_args(name: &str) -> Frame {
    Frame::Error(format!(
        "ERR wrong number of arguments for '{}' command",
        name.to_lowercase()
    ))
}

fn wrong_type() -> Frame {
    Frame::Error("WRONGTYPE Operation against a key holding the wrong kind of value".to_string())
}

fn execute(args: &[Bytes], store: &Store, flavor: Flavor) -> Frame {
    let Some((name, rest)) = args.split_first() else {
        return Frame::Error("ERR empty command".to_string());
    };
    let name = String::from_utf8_lossy(name).to_uppercase();
    let key = rest.first().map(|k| String::from_utf8_lossy(k).into_owned());
    let mut store = store.lock().unwrap();

    match (name.as_str(), key, rest.len()) {
        ("PING", _, 0) => Frame::Simple("PONG".to_string()),
        ("PING" | "ECHO", _, 1) => Frame::Bulk(Some(rest[0].clone())),
        ("FLUSHALL", _, 0) => {
            store.clear();
            Frame::Simple("OK".to_string())
        }
        ("GET", Some(key), 1) => match store.get(&key) {
            Some(Value::Str(data)) => Frame::Bulk(Some(data.clone())),
            Some(Value::List(_)) => wrong_type(),
            None => Frame::Bulk(None),
        },
        ("SET", Some(key), 2) => {
            store.insert(key, Value::Str(rest[1].clone()));
            Frame::Simple("OK".to_string())
        }
        ("DEL", Some(_), _) => {
            let removed = rest
                .iter()
                .filter(|k| store.remove(&*String::from_utf8_lossy(k)).is_some())
                .count();
            Frame::Integer(removed as i64)
        }
        ("INCR" | "DECR", Some(key), 1) => {
            let delta = if name == "INCR" { 1 } else { -1 };
            add_to_counter(&mut store, key, delta, flavor)
        }
        ("INCRBY" | "DECRBY", Some(key), 2) => {
            let Some(by) = std::str::from_utf8(&rest[1])
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
            else {
                return Frame::Error("ERR value is not an integer or out of range".to_string());
            };
            let delta = if name == "INCRBY" { by } else { -by };
            add_to_counter(&mut store, key, delta, flavor)
        }
        ("LPUSH" | "RPUSH", Some(key), 2) => {
            let entry = store
                .entry(key)
                .or_insert_with(|| Value::List(VecDeque::new()));
            match entry {
                Value::List(list) => {
                    if name == "LPUSH" {
                        list.push_front(rest[1].clone());
                    } else {
                        list.push_back(rest[1].clone());
                    }
                    Frame::Integer(list.len() as i64)
                }
                Value::Str(_) => wrong_type(),
            }
        }
        ("LPOP" | "RPOP", Some(key), 1) => {
            let (popped, drained) = match store.get_mut(&key) {
                Some(Value::List(list)) => {
                    let popped = if name == "LPOP" {
                        list.pop_front()
                    } else {
                        list.pop_back()
                    };
                    (popped, list.is_empty())
                }
                Some(Value::Str(_)) => return wrong_type(),
                None => return Frame::Bulk(None),
            };
            if drained {
                store.remove(&key);
            }
            Frame::Bulk(popped)
        }
        ("LLEN", Some(key), 1) => match store.get(&key) {
            Some(Value::List(list)) => Frame::Integer(list.len() as i64),
            Some(Value::Str(_)) => wrong_type(),
            None => Frame::Integer(0),
        },
        ("PING" | "ECHO" | "FLUSHALL" | "GET" | "SET" | "DEL" | "INCR" | "DECR" | "INCRBY"
        | "DECRBY" | "LPUSH" | "RPUSH" | "LPOP" | "RPOP" | "LLEN", _, _) => wrong_args(&name),
        _ => Frame::Error(format!("ERR unknown command '{name}'")),
    }
}

fn add_to_counter(
    store: &mut HashMap<String, Value>,
    key: String,
    delta: i64,
    flavor: Flavor,
) -> Frame {
    let current = match store.get(&key) {
        Some(Value::Str(data)) => {
            let parsed = std::str::from_utf8(data)
                .ok()
                .and_then(|s| s.parse::<i64>().ok());
            match parsed {
                Some(n) => n,
                None => {
                    return Frame::Error("ERR value is not an integer or out of range".to_string())
                }
            }
        }
        Some(Value::List(_)) => return wrong_type(),
        None => 0,
    };

    let Some(next) = current.checked_add(delta) else {
        return Frame::Error("ERR increment or decrement would overflow".to_string());
    };
    let text = Bytes::from(next.to_string());
    store.insert(key, Value::Str(text.clone()));

    match flavor {
        Flavor::StringCounters => Frame::Bulk(Some(text)),
        _ => Frame::Integer(next),
    }
}
