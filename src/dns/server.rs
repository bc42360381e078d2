//! UDP and TCP stub listeners

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{Builder, JoinHandle};
use std::time::Duration;

use derive_more::{Display, Error, From};

use crate::dns::config::{ResolvedConfig, ServerEndpoint, DNS_PORT};
use crate::dns::handler::{DnsHandler, UDP_MAX_RESPONSE_SIZE};
use crate::dns::netutil::{read_packet_length, write_packet_length};
use crate::dns::pool::WorkerPool;

#[derive(Debug, Display, From, Error)]
pub enum ServerError {
    Io(std::io::Error),
    InvalidBindAddress,
}

type Result<T> = std::result::Result<T, ServerError>;

const UDP_BUFFER_SIZE: usize = 4096;

/// How long a blocked receive or accept waits before re-checking the
/// shutdown flag.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A TCP client connection is dropped after this much idle time.
const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// The stub listener: one UDP socket and one TCP listener per configured
/// bind address, all feeding the shared worker pool.
///
/// `start` binds every socket before any loop is spawned, so a single bind
/// failure aborts startup with nothing half-running. `close` is idempotent;
/// the receive and accept loops notice the cleared running flag within one
/// poll interval and release their sockets on exit.
pub struct DnsServer {
    handler: Arc<DnsHandler>,
    pool: Arc<WorkerPool>,
    stub_listener: bool,
    bind_address: String,
    extra_endpoints: Vec<ServerEndpoint>,
    port: u16,
    running: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    udp_addrs: Mutex<Vec<SocketAddr>>,
    tcp_addrs: Mutex<Vec<SocketAddr>>,
}

impl DnsServer {
    pub fn new(config: &ResolvedConfig, handler: Arc<DnsHandler>, pool: Arc<WorkerPool>) -> DnsServer {
        DnsServer {
            handler,
            pool,
            stub_listener: config.dns_stub_listener,
            bind_address: config.bind_address.clone(),
            extra_endpoints: config.dns_stub_listener_extra.clone(),
            port: DNS_PORT,
            running: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
            udp_addrs: Mutex::new(Vec::new()),
            tcp_addrs: Mutex::new(Vec::new()),
        }
    }

    /// Override the primary listen port. Tests bind port 0 to get an
    /// ephemeral port; production stays on 53.
    pub fn with_port(mut self, port: u16) -> DnsServer {
        self.port = port;
        self
    }

    /// The addresses the UDP sockets actually bound, available after `start`.
    pub fn udp_addrs(&self) -> Vec<SocketAddr> {
        self.udp_addrs
            .lock()
            .map(|addrs| addrs.clone())
            .unwrap_or_default()
    }

    /// The addresses the TCP listeners actually bound, available after `start`.
    pub fn tcp_addrs(&self) -> Vec<SocketAddr> {
        self.tcp_addrs
            .lock()
            .map(|addrs| addrs.clone())
            .unwrap_or_default()
    }

    pub fn start(&self) -> Result<()> {
        if !self.stub_listener {
            log::info!("DNSStubListener is disabled, not starting server");
            return Ok(());
        }

        let mut endpoints = vec![ServerEndpoint {
            host: self.bind_address.clone(),
            port: self.port,
        }];
        endpoints.extend(self.extra_endpoints.clone());

        // Bind everything up front: a single failure aborts startup
        let mut udp_sockets = Vec::new();
        let mut tcp_listeners = Vec::new();
        for endpoint in &endpoints {
            let addr = resolve_bind_addr(endpoint)?;
            udp_sockets.push(bind_udp(addr)?);
            tcp_listeners.push(bind_tcp(addr)?);
        }

        self.running.store(true, Ordering::Release);

        let mut threads = self
            .threads
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut udp_addrs = self
            .udp_addrs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut tcp_addrs = self
            .tcp_addrs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        for socket in udp_sockets {
            let addr = socket.local_addr()?;
            udp_addrs.push(addr);
            log::info!("UDP server listening on {}", addr);

            let handler = self.handler.clone();
            let pool = self.pool.clone();
            let running = self.running.clone();
            threads.push(
                Builder::new()
                    .name(format!("dns-udp-{}", addr))
                    .spawn(move || run_udp_loop(socket, handler, pool, running))?,
            );
        }

        for listener in tcp_listeners {
            let addr = listener.local_addr()?;
            tcp_addrs.push(addr);
            log::info!("TCP server listening on {}", addr);

            let handler = self.handler.clone();
            let pool = self.pool.clone();
            let running = self.running.clone();
            threads.push(
                Builder::new()
                    .name(format!("dns-tcp-{}", addr))
                    .spawn(move || run_tcp_loop(listener, handler, pool, running))?,
            );
        }

        Ok(())
    }

    /// Stop the listeners and the worker pool. Safe to call repeatedly.
    pub fn close(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        let threads = {
            let mut guard = self
                .threads
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *guard)
        };

        for thread in threads {
            let _ = thread.join();
        }

        self.pool.shutdown();
        log::info!("DNS server stopped");
    }
}

fn resolve_bind_addr(endpoint: &ServerEndpoint) -> Result<SocketAddr> {
    (endpoint.host.as_str(), endpoint.port)
        .to_socket_addrs()?
        .next()
        .ok_or(ServerError::InvalidBindAddress)
}

fn bind_udp(addr: SocketAddr) -> Result<Arc<UdpSocket>> {
    let socket = UdpSocket::bind(addr)?;
    // A read timeout lets the receive loop observe shutdown
    socket.set_read_timeout(Some(POLL_INTERVAL))?;

    Ok(Arc::new(socket))
}

fn bind_tcp(addr: SocketAddr) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr)?;
    // Non-blocking accept, polled, for the same reason
    listener.set_nonblocking(true)?;

    Ok(listener)
}

fn run_udp_loop(
    socket: Arc<UdpSocket>,
    handler: Arc<DnsHandler>,
    pool: Arc<WorkerPool>,
    running: Arc<AtomicBool>,
) {
    let mut buf = [0u8; UDP_BUFFER_SIZE];

    while running.load(Ordering::Acquire) {
        match socket.recv_from(&mut buf) {
            Ok((len, src)) => {
                let query = buf[..len].to_vec();
                let socket = socket.clone();
                let handler = handler.clone();

                pool.execute(move || {
                    if let Some(response) = handler.handle(&query, UDP_MAX_RESPONSE_SIZE) {
                        if let Err(e) = socket.send_to(&response, src) {
                            log::warn!("Failed to send UDP response to {}: {}", src, e);
                        }
                    }
                });
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if running.load(Ordering::Acquire) {
                    log::error!("UDP receive error: {}", e);
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }

    log::debug!("UDP listener shut down");
}

fn run_tcp_loop(
    listener: TcpListener,
    handler: Arc<DnsHandler>,
    pool: Arc<WorkerPool>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, _peer)) => {
                let handler = handler.clone();
                let running = running.clone();

                pool.execute(move || handle_tcp_connection(stream, handler, running));
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if running.load(Ordering::Acquire) {
                    log::error!("TCP accept error: {}", e);
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }

    log::debug!("TCP listener shut down");
}

/// Serve length-prefixed queries off one connection until the client goes
/// away, the idle timeout fires, or a query fails to parse.
fn handle_tcp_connection(mut stream: TcpStream, handler: Arc<DnsHandler>, running: Arc<AtomicBool>) {
    // The accepted stream may inherit the listener's non-blocking mode
    if stream.set_nonblocking(false).is_err() {
        return;
    }
    if stream.set_read_timeout(Some(TCP_IDLE_TIMEOUT)).is_err() {
        return;
    }

    while running.load(Ordering::Acquire) {
        let len = match read_packet_length(&mut stream) {
            Ok(len) => len as usize,
            Err(_) => break,
        };

        let mut query = vec![0u8; len];
        if stream.read_exact(&mut query).is_err() {
            break;
        }

        // No response size ceiling on TCP
        let response = match handler.handle(&query, usize::MAX) {
            Some(response) => response,
            None => break,
        };

        if write_packet_length(&mut stream, response.len()).is_err() {
            break;
        }
        if stream.write_all(&response).is_err() {
            break;
        }
        let _ = stream.flush();
    }

    let _ = stream.shutdown(Shutdown::Both);
}
