//! Framed connections over every [`Endpoint`] scheme.
//!
//! All channels exchange length-delimited frames (4-byte big-endian length
//! followed by an encoded [`Envelope`](crate::envelope::Envelope)). This module
//! hides the difference between TCP, Unix sockets and in-process pipes behind
//! a boxed [`Io`] stream so routers, clients and workers share one code path.
//!
//! In-process endpoints are resolved through an [`InprocHub`], an explicit
//! value shared by everyone who should see the same `inproc://` names.

use crate::{
    common::error::{Error, Result},
    endpoint::{Endpoint, Scheme},
};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    io::{AsyncRead, AsyncWrite, DuplexStream},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Upper bound on a single frame unless configured otherwise: 16 MiB.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Buffer size of each direction of an in-process pipe.
const INPROC_PIPE_BYTES: usize = 64 * 1024;

/// Any bidirectional byte stream a connection can run over.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// A length-delimited connection.
pub type Connection = Framed<Box<dyn Io>, LengthDelimitedCodec>;

/// Wraps a raw stream in the length-delimited codec.
pub fn framed(io: Box<dyn Io>, max_frame_bytes: usize) -> Connection {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_bytes)
        .new_codec();
    Framed::new(io, codec)
}

/// Registry of `inproc://` names for one process (or one test).
#[derive(Clone, Debug, Default)]
pub struct InprocHub {
    listeners: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<DuplexStream>>>>,
}

impl InprocHub {
    fn bind(&self, name: &str) -> Result<mpsc::UnboundedReceiver<DuplexStream>> {
        let mut listeners = self.listeners.lock();
        if listeners.get(name).is_some_and(|tx| !tx.is_closed()) {
            return Err(Error::Transport {
                context: format!("inproc://{name} is already bound"),
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        listeners.insert(name.to_string(), tx);
        Ok(rx)
    }

    fn connect(&self, name: &str) -> Result<DuplexStream> {
        let listeners = self.listeners.lock();
        let tx = listeners.get(name).ok_or_else(|| Error::Transport {
            context: format!("inproc://{name} is not bound"),
        })?;
        let (local, remote) = tokio::io::duplex(INPROC_PIPE_BYTES);
        tx.send(remote).map_err(|_| Error::Transport {
            context: format!("inproc://{name} listener is closed"),
        })?;
        Ok(local)
    }
}

/// A bound endpoint accepting connections.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Ipc {
        listener: tokio::net::UnixListener,
        path: std::path::PathBuf,
    },
    Inproc(mpsc::UnboundedReceiver<DuplexStream>),
}

impl Listener {
    /// Binds `endpoint`, using the wildcard host for TCP.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the address is in use or the scheme is
    /// unsupported on this platform.
    pub async fn bind(endpoint: &Endpoint, hub: &InprocHub) -> Result<Self> {
        match endpoint.scheme() {
            Scheme::Tcp => Ok(Self::Tcp(
                TcpListener::bind(endpoint.tcp_bind_addr()).await?,
            )),
            #[cfg(unix)]
            Scheme::Ipc => {
                let path = std::path::PathBuf::from(endpoint.address());
                // A socket file left behind by a previous run blocks bind.
                let _ = std::fs::remove_file(&path);
                let listener = tokio::net::UnixListener::bind(&path)?;
                Ok(Self::Ipc { listener, path })
            }
            #[cfg(not(unix))]
            Scheme::Ipc => Err(Error::Transport {
                context: "ipc endpoints are not supported on this platform".to_string(),
            }),
            Scheme::Inproc => Ok(Self::Inproc(hub.bind(endpoint.address())?)),
        }
    }

    /// Waits for the next connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] on accept failure, or when an in-process
    /// hub has been dropped.
    pub async fn accept(&mut self) -> Result<Box<dyn Io>> {
        match self {
            Self::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            Self::Ipc { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            Self::Inproc(rx) => match rx.recv().await {
                Some(stream) => Ok(Box::new(stream)),
                None => Err(Error::Transport {
                    context: "inproc hub closed".to_string(),
                }),
            },
        }
    }

    /// Local socket address of a TCP listener.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        match self {
            Self::Tcp(listener) => listener.local_addr().ok(),
            _ => None,
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Self::Ipc { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Opens a connection to `endpoint`.
///
/// # Errors
///
/// Returns [`Error::Transport`] if nothing is listening on the endpoint.
pub async fn connect(endpoint: &Endpoint, hub: &InprocHub) -> Result<Box<dyn Io>> {
    match endpoint.scheme() {
        Scheme::Tcp => {
            let stream = TcpStream::connect(endpoint.address()).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        Scheme::Ipc => Ok(Box::new(
            tokio::net::UnixStream::connect(endpoint.address()).await?,
        )),
        #[cfg(not(unix))]
        Scheme::Ipc => Err(Error::Transport {
            context: "ipc endpoints are not supported on this platform".to_string(),
        }),
        Scheme::Inproc => Ok(Box::new(hub.connect(endpoint.address())?)),
    }
}
