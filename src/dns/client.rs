//! client for sending DNS queries to upstream servers

use std::io::Write;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use derive_more::{Display, Error, From};
use rand::random;

use crate::dns::buffer::{BytePacketBuffer, StreamPacketBuffer};
use crate::dns::netutil::{read_packet_length, write_packet_length};
use crate::dns::protocol::DnsPacket;

#[derive(Debug, Display, From, Error)]
pub enum ClientError {
    Protocol(crate::dns::protocol::ProtocolError),
    Io(std::io::Error),
    NoServerAddress,
    IdMismatch,
}

type Result<T> = std::result::Result<T, ClientError>;

/// Read and connect deadline for a single upstream exchange.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(2);

/// Transport used to exchange one query with one upstream server.
///
/// The network implementation below is the production path; tests substitute
/// a stub so resolution policy can be exercised without sockets.
pub trait DnsClient {
    fn send_query(&self, query: &DnsPacket, server: (&str, u16)) -> Result<DnsPacket>;
}

pub struct DnsNetworkClient;

impl DnsNetworkClient {
    pub fn new() -> DnsNetworkClient {
        DnsNetworkClient
    }

    fn server_addr(server: (&str, u16)) -> Result<SocketAddr> {
        server
            .to_socket_addrs()?
            .next()
            .ok_or(ClientError::NoServerAddress)
    }

    /// Assign a fresh id so the upstream exchange is independent of whatever
    /// id the client used; the handler rewrites the id on the way out.
    fn prepare_query(query: &DnsPacket) -> DnsPacket {
        let mut packet = query.clone();
        packet.header.id = random::<u16>();
        packet
    }

    /// Send a DNS query using UDP transport
    pub fn send_udp_query(&self, query: &DnsPacket, server: (&str, u16)) -> Result<DnsPacket> {
        let addr = Self::server_addr(server)?;
        let packet = Self::prepare_query(query);

        let bind_addr = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr)?;
        socket.set_read_timeout(Some(UPSTREAM_TIMEOUT))?;

        let req_data = packet.to_bytes()?;
        socket.send_to(&req_data, addr)?;

        let mut res_buffer = BytePacketBuffer::new();
        socket.recv_from(&mut res_buffer.buf)?;

        let response = DnsPacket::from_buffer(&mut res_buffer)?;
        if response.header.id != packet.header.id {
            return Err(ClientError::IdMismatch);
        }

        Ok(response)
    }

    /// Send a DNS query using TCP transport
    ///
    /// This is much simpler than using UDP, since the kernel will take care
    /// of packet ordering, connection state, timeouts etc.
    pub fn send_tcp_query(&self, query: &DnsPacket, server: (&str, u16)) -> Result<DnsPacket> {
        let addr = Self::server_addr(server)?;
        let packet = Self::prepare_query(query);

        let mut stream = TcpStream::connect_timeout(&addr, UPSTREAM_TIMEOUT)?;
        stream.set_read_timeout(Some(UPSTREAM_TIMEOUT))?;
        stream.set_write_timeout(Some(UPSTREAM_TIMEOUT))?;

        let req_data = packet.to_bytes()?;
        write_packet_length(&mut stream, req_data.len())?;
        stream.write_all(&req_data)?;
        stream.flush()?;

        let _ = read_packet_length(&mut stream)?;

        let mut stream_buffer = StreamPacketBuffer::new(&mut stream);
        let response = DnsPacket::from_buffer(&mut stream_buffer)?;
        if response.header.id != packet.header.id {
            return Err(ClientError::IdMismatch);
        }

        Ok(response)
    }
}

impl Default for DnsNetworkClient {
    fn default() -> Self {
        DnsNetworkClient::new()
    }
}

impl DnsClient for DnsNetworkClient {
    fn send_query(&self, query: &DnsPacket, server: (&str, u16)) -> Result<DnsPacket> {
        let packet = self.send_udp_query(query, server)?;
        if !packet.header.truncated_message {
            return Ok(packet);
        }

        log::debug!("Response truncated, retrying with TCP: {}", server.0);
        self.send_tcp_query(query, server)
    }
}
