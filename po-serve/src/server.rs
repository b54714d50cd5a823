//! Socket server for the remote-call adapter: TCP or Unix domain socket, one thread per
//! connection. Each connection is one session; it may run any number of episodes back to back.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use po_core::{Encoding, Endpoint};
use po_logging::ServeEventV1;
use po_proto::{recv, send, AdviceRequest};
use po_runtime::SessionId;

use crate::error::ServeError;
use crate::remote::AdviceService;

const ACCEPT_POLL: Duration = Duration::from_millis(20);

/// Either socket flavour behind one `Read + Write`.
pub enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    pub fn connect(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => {
                let s = TcpStream::connect(addr)?;
                s.set_nodelay(true)?;
                Ok(Stream::Tcp(s))
            }
            Endpoint::Unix(path) => Ok(Stream::Unix(UnixStream::connect(path)?)),
        }
    }

    fn set_blocking(&self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => {
                s.set_nonblocking(false)?;
                s.set_nodelay(true)
            }
            Stream::Unix(s) => s.set_nonblocking(false),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            Stream::Unix(s) => s.flush(),
        }
    }
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
}

pub struct AdviceServer {
    listener: Listener,
    next_session: AtomicU64,
}

impl AdviceServer {
    pub fn bind(endpoint: &Endpoint) -> Result<Self, ServeError> {
        let listener = match endpoint {
            Endpoint::Tcp(addr) => Listener::Tcp(TcpListener::bind(addr)?),
            Endpoint::Unix(path) => {
                // A stale socket file from a previous run blocks bind.
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                Listener::Unix(UnixListener::bind(path)?, path.clone())
            }
        };
        match &listener {
            Listener::Tcp(l) => l.set_nonblocking(true)?,
            Listener::Unix(l, _) => l.set_nonblocking(true)?,
        }
        Ok(Self {
            listener,
            next_session: AtomicU64::new(1),
        })
    }

    /// Where clients should connect (resolves port 0 to the real port).
    pub fn local_endpoint(&self) -> Result<Endpoint, ServeError> {
        match &self.listener {
            Listener::Tcp(l) => {
                let addr: SocketAddr = l.local_addr()?;
                Ok(Endpoint::Tcp(addr.to_string()))
            }
            Listener::Unix(_, path) => Ok(Endpoint::Unix(path.clone())),
        }
    }

    /// Accept connections until `shutdown` is raised. Connection threads are detached and end
    /// when their peer hangs up.
    pub fn serve(
        &self,
        service: AdviceService,
        encoding: Encoding,
        shutdown: Arc<AtomicBool>,
    ) -> Result<(), ServeError> {
        if let Some(j) = service.advisor().journal() {
            let ev = ServeEventV1::new("listening", "remote").detail(self.local_endpoint()?.to_string());
            if let Err(e) = j.record_event(&ev) {
                eprintln!("[po-serve] event log write failed: {e}");
            }
        }
        while !shutdown.load(Ordering::Relaxed) {
            let stream = match self.accept() {
                Ok(Some(s)) => s,
                Ok(None) => {
                    thread::sleep(ACCEPT_POLL);
                    continue;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            stream.set_blocking()?;
            let session = self.next_session.fetch_add(1, Ordering::Relaxed);
            let service = service.clone();
            thread::Builder::new()
                .name(format!("po-advice-conn-{session}"))
                .spawn(move || serve_connection(service, stream, encoding, session))?;
        }
        Ok(())
    }

    fn accept(&self) -> io::Result<Option<Stream>> {
        let res = match &self.listener {
            Listener::Tcp(l) => l.accept().map(|(s, _)| Stream::Tcp(s)),
            Listener::Unix(l, _) => l.accept().map(|(s, _)| Stream::Unix(s)),
        };
        match res {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Drop for AdviceServer {
    fn drop(&mut self) {
        if let Listener::Unix(_, path) = &self.listener {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn serve_connection(service: AdviceService, mut stream: Stream, encoding: Encoding, session: SessionId) {
    note(&service, ServeEventV1::new("peer_connected", "remote").session(session));
    loop {
        let advice = match recv::<_, AdviceRequest>(&mut stream, encoding) {
            Ok(req) => service.get_advice(session, &req),
            Err(e) => {
                let e = ServeError::from(e);
                if e.is_episode_local() {
                    service.fail(session, &e)
                } else if matches!(e, ServeError::PeerDisconnected) {
                    break;
                } else {
                    eprintln!("[po-serve] session {session}: connection error: {e}");
                    // Framing is lost, so this reply is the last thing on the stream.
                    let advice = service.fail(session, &e);
                    let _ = send(&mut stream, encoding, &advice);
                    break;
                }
            }
        };
        if let Err(e) = send(&mut stream, encoding, &advice) {
            eprintln!("[po-serve] session {session}: reply failed: {e}");
            break;
        }
    }
    service.end_session(session);
    note(&service, ServeEventV1::new("peer_disconnected", "remote").session(session));
}

fn note(service: &AdviceService, ev: ServeEventV1) {
    if let Some(j) = service.advisor().journal() {
        if let Err(e) = j.record_event(&ev) {
            eprintln!("[po-serve] event log write failed: {e}");
        }
    }
}
