//! implements the DNS protocol in a transport agnostic fashion

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use derive_more::{Display, Error, From};

use crate::dns::buffer::{PacketBuffer, VectorPacketBuffer};

#[derive(Debug, Display, From, Error)]
pub enum ProtocolError {
    Buffer(crate::dns::buffer::BufferError),
    Io(std::io::Error),
}

type Result<T> = std::result::Result<T, ProtocolError>;

/// `QueryType` represents the requested Record Type of a query
///
/// The specific type Unknown carries an integer parameter in order to retain
/// the code of an unrecognized record when re-serializing a reply. An integer
/// can be converted to a querytype using the `from_num` function, and back to
/// an integer using the `to_num` method.
#[derive(PartialEq, Eq, Debug, Clone, Hash, Copy)]
pub enum QueryType {
    Unknown(u16),
    A,     // 1
    Ns,    // 2
    Cname, // 5
    Soa,   // 6
    Mx,    // 15
    Txt,   // 16
    Aaaa,  // 28
    Srv,   // 33
    Opt,   // 41
}

impl QueryType {
    pub fn to_num(&self) -> u16 {
        match *self {
            QueryType::Unknown(x) => x,
            QueryType::A => 1,
            QueryType::Ns => 2,
            QueryType::Cname => 5,
            QueryType::Soa => 6,
            QueryType::Mx => 15,
            QueryType::Txt => 16,
            QueryType::Aaaa => 28,
            QueryType::Srv => 33,
            QueryType::Opt => 41,
        }
    }

    pub fn from_num(num: u16) -> QueryType {
        match num {
            1 => QueryType::A,
            2 => QueryType::Ns,
            5 => QueryType::Cname,
            6 => QueryType::Soa,
            15 => QueryType::Mx,
            16 => QueryType::Txt,
            28 => QueryType::Aaaa,
            33 => QueryType::Srv,
            41 => QueryType::Opt,
            _ => QueryType::Unknown(num),
        }
    }
}

/// `DnsRecord` is the primary representation of a DNS record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsRecord {
    Unknown {
        domain: String,
        qtype: u16,
        data: Vec<u8>,
        ttl: u32,
    }, // 0
    A {
        domain: String,
        addr: Ipv4Addr,
        ttl: u32,
    }, // 1
    Ns {
        domain: String,
        host: String,
        ttl: u32,
    }, // 2
    Cname {
        domain: String,
        host: String,
        ttl: u32,
    }, // 5
    Soa {
        domain: String,
        m_name: String,
        r_name: String,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
        ttl: u32,
    }, // 6
    Mx {
        domain: String,
        priority: u16,
        host: String,
        ttl: u32,
    }, // 15
    Txt {
        domain: String,
        data: String,
        ttl: u32,
    }, // 16
    Aaaa {
        domain: String,
        addr: Ipv6Addr,
        ttl: u32,
    }, // 28
    Srv {
        domain: String,
        priority: u16,
        weight: u16,
        port: u16,
        host: String,
        ttl: u32,
    }, // 33
    Opt {
        packet_len: u16,
        flags: u32,
        data: Vec<u8>,
    }, // 41
}

impl DnsRecord {
    pub fn read<T: PacketBuffer>(buffer: &mut T) -> Result<DnsRecord> {
        let mut domain = String::new();
        buffer.read_qname(&mut domain)?;

        let qtype_num = buffer.read_u16()?;
        let qtype = QueryType::from_num(qtype_num);
        let class = buffer.read_u16()?;
        let ttl = buffer.read_u32()?;
        let data_len = buffer.read_u16()?;

        match qtype {
            QueryType::A => {
                let raw_addr = buffer.read_u32()?;
                let addr = Ipv4Addr::from(raw_addr);

                Ok(DnsRecord::A { domain, addr, ttl })
            }
            QueryType::Aaaa => {
                let mut octets = [0u8; 16];
                for octet in octets.iter_mut() {
                    *octet = buffer.read()?;
                }
                let addr = Ipv6Addr::from(octets);

                Ok(DnsRecord::Aaaa { domain, addr, ttl })
            }
            QueryType::Ns => {
                let mut ns = String::new();
                buffer.read_qname(&mut ns)?;

                Ok(DnsRecord::Ns {
                    domain,
                    host: ns,
                    ttl,
                })
            }
            QueryType::Cname => {
                let mut cname = String::new();
                buffer.read_qname(&mut cname)?;

                Ok(DnsRecord::Cname {
                    domain,
                    host: cname,
                    ttl,
                })
            }
            QueryType::Srv => {
                let priority = buffer.read_u16()?;
                let weight = buffer.read_u16()?;
                let port = buffer.read_u16()?;

                let mut srv = String::new();
                buffer.read_qname(&mut srv)?;

                Ok(DnsRecord::Srv {
                    domain,
                    priority,
                    weight,
                    port,
                    host: srv,
                    ttl,
                })
            }
            QueryType::Mx => {
                let priority = buffer.read_u16()?;
                let mut mx = String::new();
                buffer.read_qname(&mut mx)?;

                Ok(DnsRecord::Mx {
                    domain,
                    priority,
                    host: mx,
                    ttl,
                })
            }
            QueryType::Soa => {
                let mut m_name = String::new();
                buffer.read_qname(&mut m_name)?;

                let mut r_name = String::new();
                buffer.read_qname(&mut r_name)?;

                let serial = buffer.read_u32()?;
                let refresh = buffer.read_u32()?;
                let retry = buffer.read_u32()?;
                let expire = buffer.read_u32()?;
                let minimum = buffer.read_u32()?;

                Ok(DnsRecord::Soa {
                    domain,
                    m_name,
                    r_name,
                    serial,
                    refresh,
                    retry,
                    expire,
                    minimum,
                    ttl,
                })
            }
            QueryType::Txt => {
                let cur_pos = buffer.pos();
                let data = String::from_utf8_lossy(buffer.get_range(cur_pos, data_len as usize)?)
                    .to_string();

                buffer.step(data_len as usize)?;

                Ok(DnsRecord::Txt { domain, data, ttl })
            }
            QueryType::Opt => {
                let cur_pos = buffer.pos();
                let data = buffer.get_range(cur_pos, data_len as usize)?.to_vec();
                buffer.step(data_len as usize)?;

                Ok(DnsRecord::Opt {
                    packet_len: class,
                    flags: ttl,
                    data,
                })
            }
            QueryType::Unknown(_) => {
                let cur_pos = buffer.pos();
                let data = buffer.get_range(cur_pos, data_len as usize)?.to_vec();
                buffer.step(data_len as usize)?;

                Ok(DnsRecord::Unknown {
                    domain,
                    qtype: qtype_num,
                    data,
                    ttl,
                })
            }
        }
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<usize> {
        let start_pos = buffer.pos();

        match *self {
            DnsRecord::A {
                ref domain,
                ref addr,
                ttl,
            } => {
                buffer.write_qname(domain)?;
                buffer.write_u16(QueryType::A.to_num())?;
                buffer.write_u16(1)?;
                buffer.write_u32(ttl)?;
                buffer.write_u16(4)?;

                for octet in &addr.octets() {
                    buffer.write_u8(*octet)?;
                }
            }
            DnsRecord::Aaaa {
                ref domain,
                ref addr,
                ttl,
            } => {
                buffer.write_qname(domain)?;
                buffer.write_u16(QueryType::Aaaa.to_num())?;
                buffer.write_u16(1)?;
                buffer.write_u32(ttl)?;
                buffer.write_u16(16)?;

                for segment in &addr.segments() {
                    buffer.write_u16(*segment)?;
                }
            }
            DnsRecord::Ns {
                ref domain,
                ref host,
                ttl,
            } => {
                buffer.write_qname(domain)?;
                buffer.write_u16(QueryType::Ns.to_num())?;
                buffer.write_u16(1)?;
                buffer.write_u32(ttl)?;

                let pos = buffer.pos();
                buffer.write_u16(0)?;

                buffer.write_qname(host)?;

                let size = buffer.pos() - (pos + 2);
                buffer.set_u16(pos, size as u16)?;
            }
            DnsRecord::Cname {
                ref domain,
                ref host,
                ttl,
            } => {
                buffer.write_qname(domain)?;
                buffer.write_u16(QueryType::Cname.to_num())?;
                buffer.write_u16(1)?;
                buffer.write_u32(ttl)?;

                let pos = buffer.pos();
                buffer.write_u16(0)?;

                buffer.write_qname(host)?;

                let size = buffer.pos() - (pos + 2);
                buffer.set_u16(pos, size as u16)?;
            }
            DnsRecord::Srv {
                ref domain,
                priority,
                weight,
                port,
                ref host,
                ttl,
            } => {
                buffer.write_qname(domain)?;
                buffer.write_u16(QueryType::Srv.to_num())?;
                buffer.write_u16(1)?;
                buffer.write_u32(ttl)?;

                let pos = buffer.pos();
                buffer.write_u16(0)?;

                buffer.write_u16(priority)?;
                buffer.write_u16(weight)?;
                buffer.write_u16(port)?;
                buffer.write_qname(host)?;

                let size = buffer.pos() - (pos + 2);
                buffer.set_u16(pos, size as u16)?;
            }
            DnsRecord::Mx {
                ref domain,
                priority,
                ref host,
                ttl,
            } => {
                buffer.write_qname(domain)?;
                buffer.write_u16(QueryType::Mx.to_num())?;
                buffer.write_u16(1)?;
                buffer.write_u32(ttl)?;

                let pos = buffer.pos();
                buffer.write_u16(0)?;

                buffer.write_u16(priority)?;
                buffer.write_qname(host)?;

                let size = buffer.pos() - (pos + 2);
                buffer.set_u16(pos, size as u16)?;
            }
            DnsRecord::Soa {
                ref domain,
                ref m_name,
                ref r_name,
                serial,
                refresh,
                retry,
                expire,
                minimum,
                ttl,
            } => {
                buffer.write_qname(domain)?;
                buffer.write_u16(QueryType::Soa.to_num())?;
                buffer.write_u16(1)?;
                buffer.write_u32(ttl)?;

                let pos = buffer.pos();
                buffer.write_u16(0)?;

                buffer.write_qname(m_name)?;
                buffer.write_qname(r_name)?;
                buffer.write_u32(serial)?;
                buffer.write_u32(refresh)?;
                buffer.write_u32(retry)?;
                buffer.write_u32(expire)?;
                buffer.write_u32(minimum)?;

                let size = buffer.pos() - (pos + 2);
                buffer.set_u16(pos, size as u16)?;
            }
            DnsRecord::Txt {
                ref domain,
                ref data,
                ttl,
            } => {
                buffer.write_qname(domain)?;
                buffer.write_u16(QueryType::Txt.to_num())?;
                buffer.write_u16(1)?;
                buffer.write_u32(ttl)?;
                buffer.write_u16(data.len() as u16)?;

                for b in data.as_bytes() {
                    buffer.write_u8(*b)?;
                }
            }
            DnsRecord::Opt {
                packet_len,
                flags,
                ref data,
            } => {
                buffer.write_qname("")?;
                buffer.write_u16(QueryType::Opt.to_num())?;
                buffer.write_u16(packet_len)?;
                buffer.write_u32(flags)?;
                buffer.write_u16(data.len() as u16)?;

                for b in data {
                    buffer.write_u8(*b)?;
                }
            }
            DnsRecord::Unknown {
                ref domain,
                qtype,
                ref data,
                ttl,
            } => {
                buffer.write_qname(domain)?;
                buffer.write_u16(qtype)?;
                buffer.write_u16(1)?;
                buffer.write_u32(ttl)?;
                buffer.write_u16(data.len() as u16)?;

                for b in data {
                    buffer.write_u8(*b)?;
                }
            }
        }

        Ok(buffer.pos() - start_pos)
    }

    pub fn get_querytype(&self) -> QueryType {
        match *self {
            DnsRecord::A { .. } => QueryType::A,
            DnsRecord::Aaaa { .. } => QueryType::Aaaa,
            DnsRecord::Ns { .. } => QueryType::Ns,
            DnsRecord::Cname { .. } => QueryType::Cname,
            DnsRecord::Srv { .. } => QueryType::Srv,
            DnsRecord::Mx { .. } => QueryType::Mx,
            DnsRecord::Unknown { qtype, .. } => QueryType::Unknown(qtype),
            DnsRecord::Soa { .. } => QueryType::Soa,
            DnsRecord::Txt { .. } => QueryType::Txt,
            DnsRecord::Opt { .. } => QueryType::Opt,
        }
    }

    pub fn get_ttl(&self) -> Option<u32> {
        match *self {
            DnsRecord::A { ttl, .. }
            | DnsRecord::Aaaa { ttl, .. }
            | DnsRecord::Ns { ttl, .. }
            | DnsRecord::Cname { ttl, .. }
            | DnsRecord::Srv { ttl, .. }
            | DnsRecord::Mx { ttl, .. }
            | DnsRecord::Unknown { ttl, .. }
            | DnsRecord::Soa { ttl, .. }
            | DnsRecord::Txt { ttl, .. } => Some(ttl),
            // The TTL field of an OPT pseudo-record encodes EDNS flags
            DnsRecord::Opt { .. } => None,
        }
    }

    pub fn ttl_mut(&mut self) -> Option<&mut u32> {
        match *self {
            DnsRecord::A { ref mut ttl, .. }
            | DnsRecord::Aaaa { ref mut ttl, .. }
            | DnsRecord::Ns { ref mut ttl, .. }
            | DnsRecord::Cname { ref mut ttl, .. }
            | DnsRecord::Srv { ref mut ttl, .. }
            | DnsRecord::Mx { ref mut ttl, .. }
            | DnsRecord::Unknown { ref mut ttl, .. }
            | DnsRecord::Soa { ref mut ttl, .. }
            | DnsRecord::Txt { ref mut ttl, .. } => Some(ttl),
            DnsRecord::Opt { .. } => None,
        }
    }
}

/// The result code for a DNS query, as described in the specification
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum ResultCode {
    #[default]
    NOERROR = 0,
    FORMERR = 1,
    SERVFAIL = 2,
    NXDOMAIN = 3,
    NOTIMP = 4,
    REFUSED = 5,
}

impl ResultCode {
    pub fn from_num(num: u8) -> ResultCode {
        match num {
            1 => ResultCode::FORMERR,
            2 => ResultCode::SERVFAIL,
            3 => ResultCode::NXDOMAIN,
            4 => ResultCode::NOTIMP,
            5 => ResultCode::REFUSED,
            _ => ResultCode::NOERROR,
        }
    }
}

/// Representation of a DNS header
#[derive(Clone, Debug, Default)]
pub struct DnsHeader {
    pub id: u16, // 16 bits

    pub recursion_desired: bool,    // 1 bit
    pub truncated_message: bool,    // 1 bit
    pub authoritative_answer: bool, // 1 bit
    pub opcode: u8,                 // 4 bits
    pub response: bool,             // 1 bit

    pub rescode: ResultCode,       // 4 bits
    pub checking_disabled: bool,   // 1 bit
    pub authed_data: bool,         // 1 bit
    pub z: bool,                   // 1 bit
    pub recursion_available: bool, // 1 bit

    pub questions: u16,             // 16 bits
    pub answers: u16,               // 16 bits
    pub authoritative_entries: u16, // 16 bits
    pub resource_entries: u16,      // 16 bits
}

impl DnsHeader {
    pub fn new() -> DnsHeader {
        DnsHeader::default()
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<()> {
        buffer.write_u16(self.id)?;

        buffer.write_u8(
            (self.recursion_desired as u8)
                | ((self.truncated_message as u8) << 1)
                | ((self.authoritative_answer as u8) << 2)
                | (self.opcode << 3)
                | ((self.response as u8) << 7),
        )?;

        buffer.write_u8(
            (self.rescode as u8)
                | ((self.checking_disabled as u8) << 4)
                | ((self.authed_data as u8) << 5)
                | ((self.z as u8) << 6)
                | ((self.recursion_available as u8) << 7),
        )?;

        buffer.write_u16(self.questions)?;
        buffer.write_u16(self.answers)?;
        buffer.write_u16(self.authoritative_entries)?;
        buffer.write_u16(self.resource_entries)?;

        Ok(())
    }

    pub fn read<T: PacketBuffer>(&mut self, buffer: &mut T) -> Result<()> {
        self.id = buffer.read_u16()?;

        let flags = buffer.read_u16()?;
        let a = (flags >> 8) as u8;
        let b = (flags & 0xFF) as u8;
        self.recursion_desired = (a & (1 << 0)) > 0;
        self.truncated_message = (a & (1 << 1)) > 0;
        self.authoritative_answer = (a & (1 << 2)) > 0;
        self.opcode = (a >> 3) & 0x0F;
        self.response = (a & (1 << 7)) > 0;

        self.rescode = ResultCode::from_num(b & 0x0F);
        self.checking_disabled = (b & (1 << 4)) > 0;
        self.authed_data = (b & (1 << 5)) > 0;
        self.z = (b & (1 << 6)) > 0;
        self.recursion_available = (b & (1 << 7)) > 0;

        self.questions = buffer.read_u16()?;
        self.answers = buffer.read_u16()?;
        self.authoritative_entries = buffer.read_u16()?;
        self.resource_entries = buffer.read_u16()?;

        Ok(())
    }
}

/// Representation of a DNS question
///
/// The class is retained verbatim from the wire so that cache keys can match
/// on it; in practice it is always IN (1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: QueryType,
    pub qclass: u16,
}

impl DnsQuestion {
    pub fn new(name: String, qtype: QueryType) -> DnsQuestion {
        DnsQuestion {
            name,
            qtype,
            qclass: 1,
        }
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<()> {
        buffer.write_qname(&self.name)?;

        buffer.write_u16(self.qtype.to_num())?;
        buffer.write_u16(self.qclass)?;

        Ok(())
    }

    pub fn read<T: PacketBuffer>(&mut self, buffer: &mut T) -> Result<()> {
        buffer.read_qname(&mut self.name)?;
        self.qtype = QueryType::from_num(buffer.read_u16()?);
        self.qclass = buffer.read_u16()?;

        Ok(())
    }
}

impl fmt::Display for DnsQuestion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.name, self.qtype)
    }
}

/// Representation of a complete DNS packet
///
/// This is the work horse of the proxy. A DNS packet can be read and written
/// in a single operation, and is used both by the network facing components
/// and internally by the handler, filter and cache.
#[derive(Clone, Debug, Default)]
pub struct DnsPacket {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub resources: Vec<DnsRecord>,
}

impl DnsPacket {
    pub fn new() -> DnsPacket {
        DnsPacket::default()
    }

    pub fn from_buffer<T: PacketBuffer>(buffer: &mut T) -> Result<DnsPacket> {
        let mut result = DnsPacket::new();
        result.header.read(buffer)?;

        for _ in 0..result.header.questions {
            let mut question = DnsQuestion::new("".to_string(), QueryType::Unknown(0));
            question.read(buffer)?;
            result.questions.push(question);
        }

        for _ in 0..result.header.answers {
            let rec = DnsRecord::read(buffer)?;
            result.answers.push(rec);
        }
        for _ in 0..result.header.authoritative_entries {
            let rec = DnsRecord::read(buffer)?;
            result.authorities.push(rec);
        }
        for _ in 0..result.header.resource_entries {
            let rec = DnsRecord::read(buffer)?;
            result.resources.push(rec);
        }

        Ok(result)
    }

    /// All records of the answer, authority and additional sections in order.
    pub fn records(&self) -> impl Iterator<Item = &DnsRecord> {
        self.answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.resources.iter())
    }

    pub fn records_mut(&mut self) -> impl Iterator<Item = &mut DnsRecord> {
        self.answers
            .iter_mut()
            .chain(self.authorities.iter_mut())
            .chain(self.resources.iter_mut())
    }

    /// The smallest TTL across all sections, which bounds how long the whole
    /// message may be cached. `None` when the message holds no TTL-bearing
    /// records.
    pub fn min_ttl(&self) -> Option<u32> {
        self.records().filter_map(|rec| rec.get_ttl()).min()
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<()> {
        let mut header = self.header.clone();
        header.questions = self.questions.len() as u16;
        header.answers = self.answers.len() as u16;
        header.authoritative_entries = self.authorities.len() as u16;
        header.resource_entries = self.resources.len() as u16;

        header.write(buffer)?;

        for question in &self.questions {
            question.write(buffer)?;
        }

        for rec in self.records() {
            rec.write(buffer)?;
        }

        Ok(())
    }

    /// Serialize the packet into a standalone byte vector, with name
    /// compression applied.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buffer = VectorPacketBuffer::new();
        self.write(&mut buffer)?;

        Ok(buffer.buffer)
    }
}
