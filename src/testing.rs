//! Scripted stand-in for the instrument server, for tests.
//!
//! Each accepted connection reads newline-terminated commands and asks a
//! script what to do with each one. The script sees the zero-based index of
//! the connection, so a test can misbehave on the first connection and
//! recover on the next.

use crate::connection::Endpoint;
use crate::protocol::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// What the fake instrument does with one received command.
pub(crate) enum PeerReply {
    /// Reply with this line
    Line(String),
    /// Never reply
    Silent,
    /// Reply after a delay; later commands wait behind it
    After(Duration, String),
    /// Close the connection without replying
    Hangup,
    /// Write these bytes verbatim
    Raw(Vec<u8>),
}

type Script = Arc<dyn Fn(usize, &str) -> PeerReply + Send + Sync>;

#[derive(Clone)]
struct Peer {
    script: Script,
    accepted: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<String>>>,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Peer {
    fn spawn_connection<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let index = self.accepted.fetch_add(1, Ordering::SeqCst);
        let task = tokio::spawn(serve(stream, index, self.clone()));
        self.connections.lock().unwrap().push(task);
    }
}

async fn serve<S>(stream: S, index: usize, peer: Peer)
where
    S: AsyncRead + AsyncWrite,
{
    let (read, mut write) = tokio::io::split(stream);
    let mut lines = BufReader::new(read).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        peer.received.lock().unwrap().push(line.clone());

        let bytes = match (peer.script)(index, &line) {
            PeerReply::Line(text) => format!("{text}\n").into_bytes(),
            PeerReply::Silent => continue,
            PeerReply::After(delay, text) => {
                tokio::time::sleep(delay).await;
                format!("{text}\n").into_bytes()
            }
            PeerReply::Hangup => return,
            PeerReply::Raw(bytes) => bytes,
        };

        if write.write_all(&bytes).await.is_err() {
            return;
        }
    }
}

pub(crate) struct FakeInstrument {
    endpoint: Endpoint,
    peer: Peer,
    accept: Mutex<Option<JoinHandle<()>>>,
    _dir: Option<tempfile::TempDir>,
}

impl FakeInstrument {
    /// Listens on an ephemeral localhost TCP port.
    pub(crate) async fn tcp<F>(script: F) -> Self
    where
        F: Fn(usize, &str) -> PeerReply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let peer = Peer::new(Arc::new(script));

        let acceptor = peer.clone();
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                acceptor.spawn_connection(stream);
            }
        });

        Self {
            endpoint: Endpoint::tcp("127.0.0.1", port),
            peer,
            accept: Mutex::new(Some(accept)),
            _dir: None,
        }
    }

    /// Listens on a socket file inside a fresh temporary directory.
    #[cfg(unix)]
    pub(crate) async fn unix<F>(script: F) -> Self
    where
        F: Fn(usize, &str) -> PeerReply + Send + Sync + 'static,
    {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reg-socket");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();
        let peer = Peer::new(Arc::new(script));

        let acceptor = peer.clone();
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                acceptor.spawn_connection(stream);
            }
        });

        Self {
            endpoint: Endpoint::unix(&path),
            peer,
            accept: Mutex::new(Some(accept)),
            _dir: Some(dir),
        }
    }

    /// Replies `OK:<command>` to everything.
    pub(crate) fn echo_ok() -> impl Fn(usize, &str) -> PeerReply + Send + Sync + 'static {
        |_, cmd: &str| PeerReply::Line(format!("OK:{cmd}"))
    }

    pub(crate) fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Every command received so far, across all connections.
    pub(crate) fn received(&self) -> Vec<String> {
        self.peer.received.lock().unwrap().clone()
    }

    /// Number of connections accepted so far.
    pub(crate) fn connections(&self) -> usize {
        self.peer.accepted.load(Ordering::SeqCst)
    }

    /// Closes every open connection but keeps listening.
    pub(crate) fn drop_connections(&self) {
        for task in self.peer.connections.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    /// Stops listening, then closes every open connection.
    pub(crate) async fn shutdown(&self) {
        let accept = self.accept.lock().unwrap().take();
        if let Some(accept) = accept {
            accept.abort();
            let _ = accept.await;
        }
        self.drop_connections();
    }
}

impl Peer {
    fn new(script: Script) -> Self {
        Self {
            script,
            accepted: Arc::new(AtomicUsize::new(0)),
            received: Arc::new(Mutex::new(Vec::new())),
            connections: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Drop for FakeInstrument {
    fn drop(&mut self) {
        if let Some(accept) = self.accept.lock().unwrap().take() {
            accept.abort();
        }
        self.drop_connections();
    }
}

/// Builds commands from literals known to be valid.
pub(crate) fn commands(names: &[&str]) -> Vec<Command> {
    names.iter().map(|name| Command::new(*name).unwrap()).collect()
}
