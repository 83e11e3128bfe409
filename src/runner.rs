use crate::controller::Controller;
use crate::errors::ParseError;
use crate::idletracker::IdleTracker;
use crate::protocol::{self, Protocol};
use crate::tlsheader::ClientHello;
use anyhow::anyhow;
use anyhow::Result;
use lazy_static::lazy_static;
use log::{debug, error, info, warn};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::{sync::Arc, time::Duration};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::lookup_host;
use tokio::sync::mpsc;
use tokio::{
    io::{ReadHalf, WriteHalf},
    net::{TcpListener, TcpStream},
    sync::{Mutex, RwLock},
    task::JoinHandle,
    time::sleep,
};

use crate::{config::Listener, listener_stats::ListenerStats, resolver};

/// Largest TLS plaintext record, header included
pub const MAX_HEADER_LEN: usize = 16384 + 5;

lazy_static! {
    static ref COUNTER: Arc<AtomicU64> = Arc::new(AtomicU64::new(0));
}

fn id() -> u64 {
    COUNTER.fetch_add(1, Ordering::SeqCst) + 1
}

/// Settings shared by every connection of one listener
struct Route {
    name: String,
    listener: Listener,
    protocol: &'static Protocol,
    header_timeout: Duration,
    self_ips: Vec<IpAddr>,
}

/// What to do with a connection once its first record has been parsed
#[derive(Debug, PartialEq)]
enum Verdict {
    Forward { host: String, hello: ClientHello },
    Fallback(String),
    Abort,
    Close,
}

pub struct Runner {
    pub name: String,
    pub listener: Listener,
    pub controller: Arc<RwLock<Controller>>,
    pub header_timeout: Duration,
    pub self_ips: Vec<IpAddr>,
}

impl Runner {
    pub fn new(
        name: String,
        listener: Listener,
        controller: Arc<RwLock<Controller>>,
        header_timeout: Duration,
        self_ips: Vec<IpAddr>,
    ) -> Runner {
        Runner {
            name,
            listener,
            controller,
            header_timeout,
            self_ips,
        }
    }

    pub async fn start(self) -> Result<Arc<ListenerStats>> {
        let protocol_name = self.listener.protocol_name().to_string();
        let protocol = protocol::lookup(&protocol_name)
            .await
            .ok_or_else(|| anyhow!("listener {} uses unknown protocol `{protocol_name}`", self.name))?;
        let bind = self.listener.bind.clone();
        let name = self.name.clone();
        let stats = Arc::new(ListenerStats::new(&name, self.listener.max_idle_time_ms()));
        let route = Arc::new(Route {
            name: name.clone(),
            listener: self.listener,
            protocol,
            header_timeout: self.header_timeout,
            self_ips: self.self_ips,
        });
        let controller_clone = Arc::clone(&self.controller);
        let stats_clone = Arc::clone(&stats);
        let (tx, mut rx) = mpsc::channel(1);
        let _ = self.controller
            .write()
            .await
            .spawn(async move {
                let mut listener = TcpListener::bind(&bind).await;
                let max_retry = 3;
                for i in 1..max_retry + 1 {
                    if listener.is_ok() {
                        break;
                    }
                    warn!("Listener: `{}` unable to bind to `{}` yet. retrying({i} of {max_retry})", &route.name, &bind);
                    sleep(Duration::from_millis(100)).await;
                    listener = TcpListener::bind(&bind).await;
                }
                match listener {
                    Ok(inner_listener) => {
                        let _ = tx.send(None).await;
                        let name = route.name.clone();
                        if let Err(cause) = Self::run_listener(inner_listener, route, stats_clone, controller_clone).await {
                            error!("listener {name} failed with {cause}");
                        }
                    }
                    Err(cause) => {
                        let _ = tx.send(Some(format!("{cause}"))).await;
                    }
                }
            })
            .await;
        let fail_reason = tokio::select! {
            _ = sleep(Duration::from_secs(1)) => {
                None
            },
            what = rx.recv() => {
                what
            }
        };
        match fail_reason {
            None => {
                info!("listener {name} start cancelled");
                Ok(stats)
            }
            Some(None) => {
                info!("listener {name} started on {}", protocol.name);
                Ok(stats)
            }
            Some(Some(cause)) => {
                warn!("listener {name} start with error {cause}");
                Err(anyhow!("{}", cause))
            }
        }
    }

    async fn run_listener(
        listener: TcpListener,
        route: Arc<Route>,
        stats: Arc<ListenerStats>,
        controller: Arc<RwLock<Controller>>,
    ) -> Result<()> {
        loop {
            let (socket, addr) = listener.accept().await?;
            let conn_id = id();
            let stats = Arc::clone(&stats);
            let route = Arc::clone(&route);
            let controller_inner = Arc::clone(&controller);
            controller.write().await.spawn(async move {
                let new_active = stats.increase_conn_count();
                let new_total = stats.total_count();
                let name = &route.name;
                info!("{conn_id} ({name}) new connection from {addr:?} active {new_active} total {new_total}");
                if let Err(cause) = Self::worker(conn_id, &route, socket, Arc::clone(&stats), controller_inner).await {
                    warn!("{conn_id} connection error: {cause}");
                }
                let new_active = stats.decrease_conn_count();
                let new_total = stats.total_count();
                info!("{conn_id} closing connection: active {new_active} total {new_total}");
            }).await;
        }
    }

    /// Read until the protocol parser stops asking for more bytes. Returns the
    /// number of bytes buffered and the final parse outcome, or `None` when
    /// the peer went away first.
    async fn read_header<R: AsyncRead + Unpin>(
        socket: &mut R,
        protocol: &'static Protocol,
        buffer: &mut [u8],
    ) -> Option<(usize, Result<ClientHello, ParseError>)> {
        let mut read_count: usize = 0;
        loop {
            match socket.read(&mut buffer[read_count..]).await {
                Ok(0) => {
                    debug!("peer closed after {read_count} header bytes");
                    return None;
                },
                Err(cause) => {
                    debug!("header read failed after {read_count} bytes: {cause}");
                    return None;
                },
                Ok(nread) => {
                    read_count += nread;
                    let outcome = (protocol.parse_packet)(&buffer[..read_count]);
                    match outcome {
                        Err(ParseError::Incomplete) if read_count < buffer.len() => {
                            debug!("incomplete header after {read_count} bytes, reading more");
                        }
                        outcome => {
                            return Some((read_count, outcome));
                        }
                    }
                },
            }
        }
    }

    async fn read_header_with_timeout<R: AsyncRead + Unpin>(
        socket: &mut R,
        protocol: &'static Protocol,
        timeout: Duration,
        buffer: &mut [u8],
    ) -> Option<(usize, Result<ClientHello, ParseError>)> {
        let read_future = Self::read_header(socket, protocol, buffer);
        tokio::time::timeout(timeout, read_future).await.ok().flatten()
    }

    fn decide(conn_id: u64, listener: &Listener, outcome: Result<ClientHello, ParseError>) -> Verdict {
        match outcome {
            Ok(hello) => {
                let host = hello.sni_host_lossy();
                if listener.is_allowed(&host) {
                    info!("{conn_id} {host} allowed by ACL");
                    Verdict::Forward { host, hello }
                } else {
                    info!("{conn_id} {host} denied by ACL");
                    Verdict::Close
                }
            }
            Err(ParseError::NoSni) => match &listener.fallback {
                Some(fallback) => {
                    info!("{conn_id} no server name, using fallback {fallback}");
                    Verdict::Fallback(fallback.clone())
                }
                None => {
                    info!("{conn_id} no server name and no fallback configured");
                    Verdict::Close
                }
            },
            Err(ParseError::Incomplete) => {
                info!("{conn_id} header does not fit in {MAX_HEADER_LEN} bytes");
                Verdict::Close
            }
            Err(ParseError::AllocationFailure) => {
                warn!("{conn_id} out of memory reading server name, shedding connection");
                Verdict::Close
            }
            Err(cause @ ParseError::InvalidArgument(_)) => {
                error!("{conn_id} {cause}");
                Verdict::Close
            }
            Err(cause @ ParseError::Malformed(_)) => {
                info!("{conn_id} {cause}");
                Verdict::Abort
            }
        }
    }

    /// Resolve `target` once. `None` when any address is one of ours, so
    /// the caller connects only to addresses that passed the check.
    async fn resolve_target(conn_id: u64, target: &str, self_ips: &[IpAddr]) -> Result<Option<Vec<SocketAddr>>> {
        let addresses: Vec<SocketAddr> = lookup_host(target).await?.collect();
        if addresses.is_empty() {
            return Err(anyhow!("{target} resolved to no address"));
        }
        for next_address in &addresses {
            if self_ips.contains(&next_address.ip()) {
                warn!("{conn_id} rejected self connection: {}", next_address.ip());
                return Ok(None);
            }
        }
        Ok(Some(addresses))
    }

    async fn worker(
        conn_id: u64,
        route: &Route,
        socket: TcpStream,
        context: Arc<ListenerStats>,
        controller: Arc<RwLock<Controller>>,
    ) -> Result<()> {
        let mut socket = socket;
        let mut header = vec![0u8; MAX_HEADER_LEN];
        let timeout = route.header_timeout;
        let header_result = Self::read_header_with_timeout(&mut socket, route.protocol, timeout, &mut header).await;
        let (header_len, outcome) = match header_result {
            None => {
                info!("{conn_id} header timed out or closed after {timeout:?}");
                return Ok(());
            }
            Some(inner) => inner,
        };
        info!("{conn_id} header read {header_len} bytes");
        header.truncate(header_len);

        let target = match Self::decide(conn_id, &route.listener, outcome) {
            Verdict::Forward { host, hello } => {
                let port = route.listener.target_port.unwrap_or(route.protocol.default_port);
                let resolved = resolver::resolve(&host).await;
                info!("{conn_id} resolved {host} to {resolved}");
                if route.listener.fragment {
                    (route.protocol.modify_packet)(&mut header, &hello)?;
                    debug!("{conn_id} split client hello at offset {}", hello.sni_offset + 1);
                }
                context.mark_routed();
                format!("{resolved}:{port}")
            }
            Verdict::Fallback(fallback) => {
                context.mark_no_sni();
                fallback
            }
            Verdict::Abort => {
                context.mark_rejected();
                socket.write_all(route.protocol.abort_message).await?;
                return Ok(());
            }
            Verdict::Close => {
                context.mark_rejected();
                return Ok(());
            }
        };

        let addresses = match Self::resolve_target(conn_id, &target, &route.self_ips).await? {
            Some(addresses) => addresses,
            None => return Ok(()),
        };
        let connect_future = TcpStream::connect(&addresses[..]);
        let r_stream = tokio::time::timeout(Duration::from_secs(5), connect_future).await??;
        let local_addr: SocketAddr = r_stream.local_addr()?;
        info!("{conn_id} connected to {target} via {local_addr:?}");
        let (lr, lw) = tokio::io::split(socket);
        let (rr, mut rw) = tokio::io::split(r_stream);

        let idle_tracker = Arc::new(Mutex::new(IdleTracker::new(context.idle_timeout_ms)));
        let uploaded = Arc::new(AtomicU64::new(0));
        let downloaded = Arc::new(AtomicU64::new(0));
        if let Err(cause) = Self::write_header(&mut rw, &header, route.listener.fragment).await {
            warn!("{conn_id} header write error: {cause}");
            return Ok(());
        }
        context.increase_uploaded_bytes(header.len());
        uploaded.fetch_add(header.len() as u64, Ordering::SeqCst);

        let jh1 = Self::pipe(
            conn_id,
            lr,
            rw,
            Arc::clone(&context),
            Arc::clone(&idle_tracker),
            true,
            Arc::clone(&uploaded),
            Arc::clone(&controller),
        )
        .await;
        let jh2 = Self::pipe(
            conn_id,
            rr,
            lw,
            Arc::clone(&context),
            Arc::clone(&idle_tracker),
            false,
            Arc::clone(&downloaded),
            Arc::clone(&controller),
        )
        .await;

        let jh = Self::run_idle_tracker(conn_id, jh1, jh2, idle_tracker, controller).await;
        let _ = jh.await;
        let uploaded_total = uploaded.load(Ordering::SeqCst);
        let downloaded_total = downloaded.load(Ordering::SeqCst);
        info!("{conn_id} end uploaded {uploaded_total} downloaded {downloaded_total}");
        Ok(())
    }

    // A split header goes out as two writes so the records leave in
    // separate segments where the stack allows it.
    async fn write_header<W: AsyncWrite + Unpin>(writer: &mut W, header: &[u8], split: bool) -> std::io::Result<()> {
        if split && header.len() > 5 {
            let first_len = 5 + ((header[3] as usize) << 8 | header[4] as usize);
            let first_len = first_len.min(header.len());
            writer.write_all(&header[..first_len]).await?;
            writer.flush().await?;
            writer.write_all(&header[first_len..]).await?;
        } else {
            writer.write_all(header).await?;
        }
        writer.flush().await
    }

    async fn run_idle_tracker(
        conn_id: u64,
        jh1: JoinHandle<Option<()>>,
        jh2: JoinHandle<Option<()>>,
        idletracker: Arc<Mutex<IdleTracker>>,
        controller: Arc<RwLock<Controller>>,
    ) -> JoinHandle<Option<()>> {
        controller
            .write()
            .await
            .spawn(async move {
                loop {
                    if jh1.is_finished() || jh2.is_finished() {
                        if !jh1.is_finished() {
                            info!("{conn_id} abort upload as download stopped");
                            jh1.abort();
                        }
                        if !jh2.is_finished() {
                            info!("{conn_id} abort download as upload stopped");
                            jh2.abort();
                        }
                        break;
                    }
                    let tracker = idletracker.lock().await;
                    if tracker.is_expired() {
                        info!("{conn_id} idled {:?} > {:?}. aborting.", tracker.idled_for(), tracker.max_idle());
                        jh1.abort();
                        jh2.abort();
                        break;
                    }
                    drop(tracker);
                    sleep(Duration::from_millis(500)).await;
                }
            })
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn pipe(
        conn_id: u64,
        mut reader: ReadHalf<TcpStream>,
        mut writer: WriteHalf<TcpStream>,
        context: Arc<ListenerStats>,
        idletracker: Arc<Mutex<IdleTracker>>,
        is_upload: bool,
        counter: Arc<AtomicU64>,
        controller: Arc<RwLock<Controller>>,
    ) -> JoinHandle<Option<()>> {
        let direction = match is_upload {
            true => "upload",
            false => "download",
        };
        controller
            .write()
            .await
            .spawn(async move {
                let mut buf = vec![0; 4096];
                loop {
                    let n = match reader.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    if writer.write_all(&buf[0..n]).await.is_err() {
                        break;
                    }
                    counter.fetch_add(n as u64, Ordering::SeqCst);
                    if is_upload {
                        context.increase_uploaded_bytes(n);
                    } else {
                        context.increase_downloaded_bytes(n);
                    }
                    idletracker.lock().await.mark();
                }
                info!("{conn_id} {direction} ended");
            })
            .await
    }
}
