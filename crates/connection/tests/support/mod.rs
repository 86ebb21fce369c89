//! Fake line-protocol servers and requests for the engine tests.
//!
//! A request is one line, `<verb> <key>...\r\n`; a normal server answers it
//! with one line naming itself and echoing the keys, so a test can tell
//! which server handled a key.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use connection::{ConnectionError, Decoded, Intent, OperationFactory, Request, Result};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const VERSION: &str = "1.6.21-test";

/// How a fake server answers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Behaviour {
    /// `<name> <keys>` for every request.
    Echo,
    /// Reads requests, never answers.
    Silent,
    /// Answers every keyed request with `MOVED`.
    Moved,
    /// Answers every keyed request with `SWITCHOVER`.
    Switchover,
}

pub struct FakeServer {
    pub name: String,
    pub addr: String,
    behaviour: Behaviour,
    accept: Option<JoinHandle<()>>,
    conns: Arc<Mutex<Vec<JoinHandle<()>>>>,
    pub requests: Arc<AtomicUsize>,
}

impl FakeServer {
    pub async fn start(name: &str, behaviour: Behaviour) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::serve(name, listener, behaviour)
    }

    /// Bind `addr` again after [`kill`](Self::kill).
    pub async fn restart(&mut self) {
        self.kill();
        let mut attempts = 0;
        let listener = loop {
            match TcpListener::bind(&self.addr).await {
                Ok(listener) => break listener,
                Err(_) if attempts < 50 => {
                    attempts += 1;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Err(e) => panic!("rebinding {}: {}", self.addr, e),
            }
        };
        let mut restarted = Self::serve(&self.name, listener, self.behaviour);
        self.accept = restarted.accept.take();
        self.conns = Arc::clone(&restarted.conns);
        self.requests = Arc::clone(&restarted.requests);
    }

    fn serve(name: &str, listener: TcpListener, behaviour: Behaviour) -> Self {
        let addr = listener.local_addr().unwrap().to_string();
        let conns: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::default();
        let requests = Arc::new(AtomicUsize::new(0));
        let accept = {
            let name = name.to_string();
            let conns = Arc::clone(&conns);
            let requests = Arc::clone(&requests);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let task = tokio::spawn(serve_conn(
                        stream,
                        name.clone(),
                        behaviour,
                        Arc::clone(&requests),
                    ));
                    conns.lock().push(task);
                }
            })
        };
        Self {
            name: name.to_string(),
            addr,
            behaviour,
            accept: Some(accept),
            conns,
            requests,
        }
    }

    /// Close the listener and every accepted connection.
    pub fn kill(&mut self) {
        if let Some(accept) = self.accept.take() {
            accept.abort();
        }
        for conn in self.conns.lock().drain(..) {
            conn.abort();
        }
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn serve_conn(stream: TcpStream, name: String, behaviour: Behaviour, requests: Arc<AtomicUsize>) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let mut words = line.split_whitespace();
        let verb = words.next().unwrap_or_default();
        let keys: Vec<&str> = words.collect();
        let reply = if verb == "version" {
            format!("{}\r\n", VERSION)
        } else {
            requests.fetch_add(1, Ordering::SeqCst);
            match behaviour {
                Behaviour::Echo => format!("{} {}\r\n", name, keys.join(" ")),
                Behaviour::Silent => continue,
                Behaviour::Moved => "MOVED\r\n".to_string(),
                Behaviour::Switchover => "SWITCHOVER\r\n".to_string(),
            }
        };
        if write.write_all(reply.as_bytes()).await.is_err() {
            return;
        }
    }
}

/// `get <keys>` answered by a single line.
#[derive(Debug, Clone)]
pub struct LineRequest {
    pub verb: &'static str,
    pub keys: Vec<Bytes>,
    pub intent: Intent,
    pub idempotent: bool,
}

impl LineRequest {
    pub fn get(key: &str) -> Box<dyn Request> {
        Self::multi(&[key])
    }

    pub fn multi(keys: &[&str]) -> Box<dyn Request> {
        Box::new(Self {
            verb: "get",
            keys: keys.iter().map(|k| Bytes::copy_from_slice(k.as_bytes())).collect(),
            intent: Intent::Read,
            idempotent: true,
        })
    }

    pub fn set(key: &str) -> Box<dyn Request> {
        Box::new(Self {
            verb: "set",
            keys: vec![Bytes::copy_from_slice(key.as_bytes())],
            intent: Intent::Write,
            idempotent: false,
        })
    }

    pub fn version() -> Box<dyn Request> {
        Box::new(Self {
            verb: "version",
            keys: Vec::new(),
            intent: Intent::Read,
            idempotent: true,
        })
    }
}

impl Request for LineRequest {
    fn keys(&self) -> Vec<Bytes> {
        self.keys.clone()
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(self.verb.as_bytes());
        for key in &self.keys {
            buf.extend_from_slice(b" ");
            buf.extend_from_slice(key);
        }
        buf.extend_from_slice(b"\r\n");
    }

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Decoded> {
        let Some(end) = buf.windows(2).position(|w| w == b"\r\n") else {
            return Ok(Decoded::Incomplete);
        };
        let line = buf.split_to(end).freeze();
        buf.advance(2);
        match &line[..] {
            b"MOVED" => Ok(Decoded::Redirect),
            b"SWITCHOVER" => Ok(Decoded::Switchover),
            b"ERROR" => Err(ConnectionError::Protocol("server error".into())),
            _ => Ok(Decoded::Complete(line)),
        }
    }

    fn intent(&self) -> Intent {
        self.intent
    }

    fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    fn is_batchable(&self) -> bool {
        self.verb == "get"
    }

    fn split_by_key(&self) -> Vec<Box<dyn Request>> {
        self.keys
            .iter()
            .map(|key| {
                Box::new(Self {
                    keys: vec![key.clone()],
                    ..self.clone()
                }) as Box<dyn Request>
            })
            .collect()
    }
}

/// Sends `version` as the handshake.
pub struct VersionFactory;

impl OperationFactory for VersionFactory {
    fn version(&self) -> Option<Box<dyn Request>> {
        Some(LineRequest::version())
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Name of the server that answered, from an echo line.
pub fn responder(frame: &[u8]) -> String {
    String::from_utf8_lossy(frame)
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_string()
}
