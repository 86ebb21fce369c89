//! Socket readiness for the engine thread.
//!
//! Every connected socket gets a watcher task on the engine's runtime. The
//! watcher waits until the socket is ready for the interest the engine last
//! armed, reports it once on the event channel and then sleeps until the
//! engine re-arms it. That is the selection-key contract: the engine owns the
//! interest set and readiness is only reported for what it asked for.
//!
//! Events carry the connection generation they were produced for, so events
//! from a socket the engine has since dropped are recognised and ignored.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use corelib::NodeId;
use tokio::io::{Interest, Ready};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::trace;

use crate::config::SocketOptions;

pub(crate) type EventSender = mpsc::UnboundedSender<IoEvent>;

#[derive(Debug)]
pub(crate) enum IoEvent {
    /// A connect attempt finished.
    Connected {
        node: NodeId,
        generation: u64,
        result: io::Result<TcpStream>,
    },
    /// The socket is ready for (part of) the armed interest.
    Ready {
        node: NodeId,
        generation: u64,
        ready: Ready,
    },
    /// Polling the socket failed.
    Failed {
        node: NodeId,
        generation: u64,
        error: io::Error,
    },
}

impl IoEvent {
    pub(crate) fn target(&self) -> (NodeId, u64) {
        match self {
            IoEvent::Connected { node, generation, .. }
            | IoEvent::Ready { node, generation, .. }
            | IoEvent::Failed { node, generation, .. } => (*node, *generation),
        }
    }
}

/// A connected socket and its readiness watcher.
pub(crate) struct Channel {
    stream: Arc<TcpStream>,
    interest: watch::Sender<Interest>,
    watcher: JoinHandle<()>,
}

impl Channel {
    /// Register `stream`. Must be called from within the engine's runtime.
    pub(crate) fn register(
        stream: TcpStream,
        node: NodeId,
        generation: u64,
        interest: Interest,
        events: EventSender,
    ) -> Self {
        let stream = Arc::new(stream);
        let (tx, rx) = watch::channel(interest);
        let watcher = tokio::spawn(watch_readiness(
            Arc::clone(&stream),
            node,
            generation,
            rx,
            events,
        ));
        Self {
            stream,
            interest: tx,
            watcher,
        }
    }

    pub(crate) fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub(crate) fn interest(&self) -> Interest {
        *self.interest.borrow()
    }

    /// Arm the watcher for another readiness report.
    pub(crate) fn rearm(&self, interest: Interest) {
        self.interest.send_replace(interest);
    }

    /// False once the watcher has exited; the socket is no longer polled.
    pub(crate) fn is_watched(&self) -> bool {
        !self.watcher.is_finished()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

async fn watch_readiness(
    stream: Arc<TcpStream>,
    node: NodeId,
    generation: u64,
    mut interest: watch::Receiver<Interest>,
    events: EventSender,
) {
    loop {
        let wanted = *interest.borrow_and_update();
        tokio::select! {
            result = stream.ready(wanted) => {
                let event = match result {
                    Ok(ready) => IoEvent::Ready { node, generation, ready },
                    Err(error) => {
                        let _ = events.send(IoEvent::Failed { node, generation, error });
                        return;
                    }
                };
                if events.send(event).is_err() {
                    return;
                }
                // Reported; wait for the engine to re-arm.
                if interest.changed().await.is_err() {
                    return;
                }
            }
            changed = interest.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

/// Start a connect attempt; its outcome arrives as [`IoEvent::Connected`].
pub(crate) fn spawn_connect(
    node: NodeId,
    generation: u64,
    addr: String,
    options: SocketOptions,
    events: EventSender,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = connect(&addr, options).await;
        trace!(node = %addr, ok = result.is_ok(), "connect attempt finished");
        let _ = events.send(IoEvent::Connected {
            node,
            generation,
            result,
        });
    })
}

async fn connect(addr: &str, options: SocketOptions) -> io::Result<TcpStream> {
    let target: SocketAddr = lookup_host(addr).await?.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, format!("{} did not resolve", addr))
    })?;
    let socket = if target.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_keepalive(options.keep_alive)?;
    let stream = tokio::time::timeout(options.connect_timeout, socket.connect(target))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
    stream.set_nodelay(options.tcp_nodelay)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn options() -> SocketOptions {
        SocketOptions {
            tcp_nodelay: true,
            keep_alive: false,
            connect_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_connect_and_report_readiness_once_per_arm() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, mut rx) = mpsc::unbounded_channel();

        spawn_connect(NodeId(7), 1, addr, options(), tx.clone());
        let (mut server, _) = listener.accept().await.unwrap();
        let stream = match rx.recv().await.unwrap() {
            IoEvent::Connected { node, generation, result } => {
                assert_eq!((node, generation), (NodeId(7), 1));
                result.unwrap()
            }
            other => panic!("unexpected event {:?}", other),
        };

        let channel = Channel::register(stream, NodeId(7), 1, Interest::READABLE, tx);
        server.write_all(b"hello").await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.target(), (NodeId(7), 1));
        assert!(matches!(event, IoEvent::Ready { ready, .. } if ready.is_readable()));

        // Not re-armed: no further report even though data is still unread.
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.is_err());

        channel.rearm(Interest::READABLE);
        assert!(matches!(rx.recv().await.unwrap(), IoEvent::Ready { .. }));
        assert!(channel.is_watched());
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let (tx, mut rx) = mpsc::unbounded_channel();

        spawn_connect(NodeId(1), 3, addr, options(), tx);
        match rx.recv().await.unwrap() {
            IoEvent::Connected { result, .. } => assert!(result.is_err()),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
