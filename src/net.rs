//! Async byte transport: a TCP accept loop plus a client connection, both
//! multiplexed on a single-worker event loop owned by the transport.
//!
//! The transport moves whole frames but stays byte-oriented: a single read
//! may deliver a partial or combined frame, so both sides accumulate bytes
//! until [crate::proto::frame_len] reports a complete frame. One request is
//! in flight per client connection at a time; concurrent submitters queue
//! on the connection lock and responses match requests by position.

use bytes::BytesMut;
use futures::future::{AbortHandle, Abortable};
use log::*;
use nix::errno::Errno;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Builder, Handle, Runtime};

use crate::proto;

/// Callback invoked with every complete request frame received on any
/// accepted connection; the returned bytes are written back on the same
/// connection. An empty return suppresses the reply.
pub type FrameHandler = Arc<dyn Fn(Vec<u8>) -> Vec<u8> + Send + Sync + 'static>;

const READ_BUF_SIZE: usize = 8 * 1024;

struct ClientConn {
    peer: SocketAddr,
    stream: TcpStream,
    rbuf: BytesMut,
}

/// One transport instance owns one I/O worker thread driving its event
/// loop. Submission is safe from any thread; the synchronous paths must
/// not be called from the I/O thread itself.
pub struct Transport {
    rt: Option<Runtime>,
    client: Arc<tokio::sync::Mutex<Option<ClientConn>>>,
    listener: Mutex<Option<TcpListener>>,
    acceptor: Mutex<Option<AbortHandle>>,
    conns: Arc<Mutex<HashMap<SocketAddr, AbortHandle>>>,
}

impl Transport {
    pub fn new() -> io::Result<Self> {
        let rt = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("xrpc-io")
            .enable_all()
            .build()?;
        Ok(Self {
            rt: Some(rt),
            client: Arc::new(tokio::sync::Mutex::new(None)),
            listener: Mutex::new(None),
            acceptor: Mutex::new(None),
            conns: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    #[inline]
    fn handle(&self) -> &Handle {
        self.rt.as_ref().expect("transport stopped").handle()
    }

    /// Dial `addr` if not already connected to it. An existing connection
    /// to the same peer is reused; a connection to a different peer is
    /// replaced.
    pub fn connect(&self, addr: SocketAddr) -> io::Result<()> {
        let client = self.client.clone();
        self.handle().block_on(async move {
            let mut guard = client.lock().await;
            if let Some(conn) = guard.as_ref() {
                if conn.peer == addr {
                    return Ok(());
                }
            }
            let stream = TcpStream::connect(addr).await?;
            info!("connected to {}", addr);
            *guard = Some(ClientConn {
                peer: addr,
                stream,
                rbuf: BytesMut::with_capacity(READ_BUF_SIZE),
            });
            Ok(())
        })
    }

    /// Write one frame and block the calling thread until one response
    /// frame arrives or the connection fails.
    pub fn send_and_wait(&self, frame: Vec<u8>) -> io::Result<Vec<u8>> {
        let client = self.client.clone();
        self.handle().block_on(async move { Self::exchange(&client, frame).await })
    }

    /// Write one frame and return immediately; `completion` runs on the
    /// event-loop thread with the response bytes and a success flag.
    pub fn send_async<F>(&self, frame: Vec<u8>, completion: F)
    where
        F: FnOnce(Vec<u8>, bool) + Send + 'static,
    {
        let client = self.client.clone();
        self.handle().spawn(async move {
            match Self::exchange(&client, frame).await {
                Ok(bytes) => completion(bytes, true),
                Err(e) => {
                    warn!("async exchange failed: {}", e);
                    completion(Vec::new(), false);
                }
            }
        });
    }

    async fn exchange(
        client: &tokio::sync::Mutex<Option<ClientConn>>, frame: Vec<u8>,
    ) -> io::Result<Vec<u8>> {
        let mut guard = client.lock().await;
        let conn = guard.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "transport not connected")
        })?;
        let r = async {
            conn.stream.write_all(&frame).await?;
            match read_frame(&mut conn.stream, &mut conn.rbuf).await? {
                Some(resp) => Ok(resp),
                None => Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before response",
                )),
            }
        }
        .await;
        if let Err(ref e) = r {
            warn!("{} exchange error: {}", conn.peer, e);
            // the connection state is unknown, force a reconnect next call
            *guard = None;
        }
        r
    }

    /// Bind the acceptor. Returns the actually-bound `ip:port`, which
    /// resolves a configured port 0.
    pub fn bind(&self, addr: SocketAddr) -> io::Result<String> {
        let listener = self
            .handle()
            .block_on(async move { TcpListener::bind(addr).await })?;
        let local = listener.local_addr()?;
        info!("listening on {}", local);
        *self.listener.lock().unwrap() = Some(listener);
        Ok(local.to_string())
    }

    /// Start the accept loop on the event-loop thread. Every complete frame
    /// read from an accepted connection is handed to `on_frame` and the
    /// returned bytes are written back on the same connection.
    pub fn start_server(&self, on_frame: FrameHandler) -> io::Result<()> {
        let listener = self.listener.lock().unwrap().take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "transport not bound")
        })?;
        let handle = self.handle().clone();
        let conns = self.conns.clone();
        let (abort_handle, abort_registration) = AbortHandle::new_pair();
        let accept_loop = Abortable::new(
            async move {
                loop {
                    match listener.accept().await {
                        Err(e) => {
                            warn!("accept error: {}", e);
                            continue;
                        }
                        Ok((stream, peer)) => {
                            debug!("client connected: {}", peer);
                            let (conn_abort, conn_reg) = AbortHandle::new_pair();
                            conns.lock().unwrap().insert(peer, conn_abort);
                            let conns2 = conns.clone();
                            let on_frame = on_frame.clone();
                            handle.spawn(Abortable::new(
                                async move {
                                    if let Err(e) = serve_conn(stream, &on_frame).await {
                                        debug!("{} read loop ended: {}", peer, e);
                                    }
                                    debug!("client disconnected: {}", peer);
                                    conns2.lock().unwrap().remove(&peer);
                                },
                                conn_reg,
                            ));
                        }
                    }
                }
            },
            abort_registration,
        );
        self.handle().spawn(accept_loop);
        *self.acceptor.lock().unwrap() = Some(abort_handle);
        Ok(())
    }

    /// Cancel all outstanding I/O, close the acceptor and every connection.
    pub fn stop(&self) {
        if let Some(h) = self.acceptor.lock().unwrap().take() {
            h.abort();
        }
        self.listener.lock().unwrap().take();
        for (_, h) in self.conns.lock().unwrap().drain() {
            h.abort();
        }
        // a busy connection is abandoned to the runtime shutdown instead
        // of blocking here behind an in-flight exchange
        if let Ok(mut guard) = self.client.try_lock() {
            guard.take();
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.stop();
        if let Some(rt) = self.rt.take() {
            // bounded wait so a live peer cannot hang the destructor
            rt.shutdown_timeout(Duration::from_secs(1));
        }
    }
}

/// Serve one accepted connection until EOF or error.
async fn serve_conn(mut stream: TcpStream, on_frame: &FrameHandler) -> io::Result<()> {
    let mut rbuf = BytesMut::with_capacity(READ_BUF_SIZE);
    loop {
        let Some(req) = read_frame(&mut stream, &mut rbuf).await? else {
            return Ok(());
        };
        let resp = on_frame(req);
        if !resp.is_empty() {
            stream.write_all(&resp).await?;
        }
    }
}

/// Accumulate bytes until `rbuf` holds one complete frame, then split it
/// off. Returns `Ok(None)` on a clean close between frames; EOF inside a
/// frame is an error.
async fn read_frame(stream: &mut TcpStream, rbuf: &mut BytesMut) -> io::Result<Option<Vec<u8>>> {
    loop {
        match proto::frame_len(&rbuf[..]) {
            Err(e) => {
                return Err(io::Error::new(io::ErrorKind::InvalidData, e));
            }
            Ok(Some(total)) if rbuf.len() >= total => {
                return Ok(Some(rbuf.split_to(total).to_vec()));
            }
            _ => {}
        }
        let n = stream.read_buf(rbuf).await?;
        if n == 0 {
            if rbuf.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "eof inside frame"));
        }
    }
}

/// Parse an `ip:port` string, mapping failure onto an errno-backed error.
pub(crate) fn parse_addr(addr: &str) -> io::Result<SocketAddr> {
    match addr.parse::<SocketAddr>() {
        Ok(a) => Ok(a),
        Err(_) => {
            error!("fail to parse addr {:?}", addr);
            Err(Errno::EFAULT.into())
        }
    }
}
