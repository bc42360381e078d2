//! per-query orchestration: parse, cache lookup, upstream resolve, flatten,
//! cache insert, respond

use std::sync::Arc;

use crate::dns::buffer::BytePacketBuffer;
use crate::dns::cache::DnsCache;
use crate::dns::filter::flatten_answers;
use crate::dns::protocol::{DnsPacket, DnsQuestion, ResultCode};
use crate::dns::resolve::UpstreamResolver;

/// Ceiling for responses sent back over UDP. Anything larger is replaced by
/// a minimal truncated reply so the client retries over TCP.
pub const UDP_MAX_RESPONSE_SIZE: usize = 512;

/// Handles one query from raw bytes to raw bytes.
///
/// The handler owns no sockets; the listeners feed it datagram or stream
/// payloads and ship whatever it returns back to the client. `None` means
/// the query was unparseable and the caller should drop it.
pub struct DnsHandler {
    resolver: UpstreamResolver,
    cache: Arc<DnsCache>,
    cache_enabled: bool,
}

impl DnsHandler {
    pub fn new(resolver: UpstreamResolver, cache: Arc<DnsCache>, cache_enabled: bool) -> DnsHandler {
        DnsHandler {
            resolver,
            cache,
            cache_enabled,
        }
    }

    pub fn handle(&self, query_data: &[u8], max_response_size: usize) -> Option<Vec<u8>> {
        let mut req_buffer = BytePacketBuffer::new();
        if query_data.len() > req_buffer.buf.len() {
            log::warn!("Dropping oversized query of {} bytes", query_data.len());
            return None;
        }
        req_buffer.buf[..query_data.len()].copy_from_slice(query_data);

        let query = match DnsPacket::from_buffer(&mut req_buffer) {
            Ok(query) => query,
            Err(e) => {
                log::warn!("Failed to parse DNS query: {}", e);
                return None;
            }
        };

        let query_id = query.header.id;

        let question = match query.questions.first() {
            Some(question) => question.clone(),
            None => {
                log::warn!("Query has no question section");
                return serialize(&servfail_response(query_id, None));
            }
        };

        log::debug!("Query: {}", question);

        let qtype = question.qtype.to_num();
        let qclass = question.qclass;

        if self.cache_enabled {
            if let Some(mut response) = self.cache.get(&question.name, qtype, qclass) {
                response.header.id = query_id;
                return self.respond(response, &question, query_id, max_response_size);
            }
        }

        let response = match self.resolver.resolve(&query) {
            Ok(response) => response,
            Err(e) => {
                log::error!("Upstream query failed: {}", e);
                return serialize(&servfail_response(query_id, Some(&question)));
            }
        };

        let mut filtered = flatten_answers(&response);

        // Transient upstream failures must never become sticky
        if self.cache_enabled && filtered.header.rescode != ResultCode::SERVFAIL {
            let is_nxdomain = filtered.header.rescode == ResultCode::NXDOMAIN;
            self.cache
                .put(&question.name, qtype, qclass, &filtered, is_nxdomain);
        }

        filtered.header.id = query_id;

        self.respond(filtered, &question, query_id, max_response_size)
    }

    fn respond(
        &self,
        response: DnsPacket,
        question: &DnsQuestion,
        query_id: u16,
        max_response_size: usize,
    ) -> Option<Vec<u8>> {
        let data = serialize(&response)?;
        if data.len() <= max_response_size {
            return Some(data);
        }

        log::debug!("Response truncated for UDP, client should retry with TCP");
        serialize(&truncated_response(query_id, question))
    }
}

fn serialize(packet: &DnsPacket) -> Option<Vec<u8>> {
    match packet.to_bytes() {
        Ok(data) => Some(data),
        Err(e) => {
            log::warn!("Failed to serialize response: {}", e);
            None
        }
    }
}

fn servfail_response(query_id: u16, question: Option<&DnsQuestion>) -> DnsPacket {
    let mut packet = DnsPacket::new();
    packet.header.id = query_id;
    packet.header.response = true;
    packet.header.rescode = ResultCode::SERVFAIL;

    if let Some(question) = question {
        packet.questions.push(question.clone());
    }

    packet
}

fn truncated_response(query_id: u16, question: &DnsQuestion) -> DnsPacket {
    let mut packet = DnsPacket::new();
    packet.header.id = query_id;
    packet.header.response = true;
    packet.header.truncated_message = true;
    packet.questions.push(question.clone());

    packet
}

#[cfg(test)]
mod tests {

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::dns::client::tests::DnsStubClient;
    use crate::dns::client::ClientError;
    use crate::dns::config::{ResolvedConfig, ServerEndpoint};
    use crate::dns::protocol::{DnsRecord, QueryType};

    fn parse(data: &[u8]) -> DnsPacket {
        let mut buffer = BytePacketBuffer::new();
        buffer.buf[..data.len()].copy_from_slice(data);
        DnsPacket::from_buffer(&mut buffer).unwrap()
    }

    fn build_query_bytes(id: u16, qname: &str, qtype: QueryType) -> Vec<u8> {
        let mut query = DnsPacket::new();
        query.header.id = id;
        query.header.recursion_desired = true;
        query
            .questions
            .push(DnsQuestion::new(qname.to_string(), qtype));
        query.to_bytes().unwrap()
    }

    fn handler_with(
        callback: Box<crate::dns::client::tests::StubCallback>,
        cache_enabled: bool,
    ) -> DnsHandler {
        let config = ResolvedConfig {
            dns: vec![ServerEndpoint::new("10.0.0.1")],
            ..ResolvedConfig::default()
        };
        let resolver = UpstreamResolver::new(&config, Box::new(DnsStubClient::new(callback)));
        DnsHandler::new(resolver, Arc::new(DnsCache::new()), cache_enabled)
    }

    fn a_record(domain: &str, addr: &str, ttl: u32) -> DnsRecord {
        DnsRecord::A {
            domain: domain.to_string(),
            addr: addr.parse().unwrap(),
            ttl,
        }
    }

    #[test]
    fn test_answers_flattened_to_one_per_type() {
        let handler = handler_with(
            Box::new(|query, _| {
                let mut response = DnsPacket::new();
                response.header.id = query.header.id;
                response.header.response = true;
                response.questions.extend(query.questions.clone());
                response.answers.push(a_record("example.com", "1.1.1.1", 300));
                response.answers.push(a_record("example.com", "2.2.2.2", 300));
                response.answers.push(a_record("example.com", "3.3.3.3", 300));
                Ok(response)
            }),
            true,
        );

        let data = handler
            .handle(&build_query_bytes(99, "example.com", QueryType::A), UDP_MAX_RESPONSE_SIZE)
            .unwrap();
        let response = parse(&data);

        assert_eq!(99, response.header.id);
        assert_eq!(vec![a_record("example.com", "1.1.1.1", 300)], response.answers);
    }

    #[test]
    fn test_cache_hit_skips_upstream_and_rewrites_id() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let handler = handler_with(
            Box::new(move |query, _| {
                calls_clone.fetch_add(1, Ordering::SeqCst);

                let mut response = DnsPacket::new();
                response.header.id = query.header.id;
                response.header.response = true;
                response.questions.extend(query.questions.clone());
                response.answers.push(a_record("example.com", "1.1.1.1", 300));
                Ok(response)
            }),
            true,
        );

        let first = handler
            .handle(&build_query_bytes(1, "example.com", QueryType::A), UDP_MAX_RESPONSE_SIZE)
            .unwrap();
        assert_eq!(1, parse(&first).header.id);
        assert_eq!(1, calls.load(Ordering::SeqCst));

        let second = handler
            .handle(&build_query_bytes(2, "example.com", QueryType::A), UDP_MAX_RESPONSE_SIZE)
            .unwrap();
        let response = parse(&second);

        assert_eq!(2, response.header.id);
        assert_eq!(1, response.answers.len());
        // Still one upstream call: the second answer came from the cache
        assert_eq!(1, calls.load(Ordering::SeqCst));
    }

    #[test]
    fn test_cache_disabled_always_resolves_upstream() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let handler = handler_with(
            Box::new(move |query, _| {
                calls_clone.fetch_add(1, Ordering::SeqCst);

                let mut response = DnsPacket::new();
                response.header.id = query.header.id;
                response.header.response = true;
                response.questions.extend(query.questions.clone());
                response.answers.push(a_record("example.com", "1.1.1.1", 300));
                Ok(response)
            }),
            false,
        );

        for id in 0..3 {
            handler
                .handle(&build_query_bytes(id, "example.com", QueryType::A), UDP_MAX_RESPONSE_SIZE)
                .unwrap();
        }

        assert_eq!(3, calls.load(Ordering::SeqCst));
    }

    #[test]
    fn test_malformed_query_is_dropped() {
        let handler = handler_with(
            Box::new(|_, _| {
                panic!("resolver must not be called for malformed queries");
            }),
            true,
        );

        assert!(handler.handle(&[0xFF, 0x00, 0x01], UDP_MAX_RESPONSE_SIZE).is_none());
    }

    #[test]
    fn test_question_less_query_gets_servfail() {
        let handler = handler_with(
            Box::new(|_, _| {
                panic!("resolver must not be called without a question");
            }),
            true,
        );

        let mut query = DnsPacket::new();
        query.header.id = 321;
        let data = handler
            .handle(&query.to_bytes().unwrap(), UDP_MAX_RESPONSE_SIZE)
            .unwrap();
        let response = parse(&data);

        assert_eq!(321, response.header.id);
        assert!(response.header.response);
        assert_eq!(ResultCode::SERVFAIL, response.header.rescode);
    }

    #[test]
    fn test_upstream_failure_maps_to_servfail() {
        let handler = handler_with(
            Box::new(|_, _| {
                Err(ClientError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "timed out",
                )))
            }),
            true,
        );

        let data = handler
            .handle(&build_query_bytes(5, "example.com", QueryType::A), UDP_MAX_RESPONSE_SIZE)
            .unwrap();
        let response = parse(&data);

        assert_eq!(5, response.header.id);
        assert_eq!(ResultCode::SERVFAIL, response.header.rescode);
        assert_eq!("example.com", response.questions[0].name);
    }

    #[test]
    fn test_servfail_is_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let handler = handler_with(
            Box::new(move |query, _| {
                calls_clone.fetch_add(1, Ordering::SeqCst);

                let mut response = DnsPacket::new();
                response.header.id = query.header.id;
                response.header.response = true;
                response.header.rescode = ResultCode::SERVFAIL;
                response.questions.extend(query.questions.clone());
                Ok(response)
            }),
            true,
        );

        for id in 0..2 {
            let data = handler
                .handle(&build_query_bytes(id, "example.com", QueryType::A), UDP_MAX_RESPONSE_SIZE)
                .unwrap();
            assert_eq!(ResultCode::SERVFAIL, parse(&data).header.rescode);
        }

        // No caching of SERVFAIL: the upstream was asked both times
        assert_eq!(2, calls.load(Ordering::SeqCst));
    }

    #[test]
    fn test_nxdomain_is_negatively_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let handler = handler_with(
            Box::new(move |query, _| {
                calls_clone.fetch_add(1, Ordering::SeqCst);

                let mut response = DnsPacket::new();
                response.header.id = query.header.id;
                response.header.response = true;
                response.header.rescode = ResultCode::NXDOMAIN;
                response.questions.extend(query.questions.clone());
                Ok(response)
            }),
            true,
        );

        let first = handler
            .handle(&build_query_bytes(1, "nope.example", QueryType::A), UDP_MAX_RESPONSE_SIZE)
            .unwrap();
        assert_eq!(ResultCode::NXDOMAIN, parse(&first).header.rescode);

        let second = handler
            .handle(&build_query_bytes(2, "nope.example", QueryType::A), UDP_MAX_RESPONSE_SIZE)
            .unwrap();
        let response = parse(&second);
        assert_eq!(ResultCode::NXDOMAIN, response.header.rescode);
        assert_eq!(2, response.header.id);

        // The second NXDOMAIN came from the negative cache
        assert_eq!(1, calls.load(Ordering::SeqCst));
    }

    #[test]
    fn test_oversized_udp_response_is_truncated() {
        let handler = handler_with(
            Box::new(|query, _| {
                let mut response = DnsPacket::new();
                response.header.id = query.header.id;
                response.header.response = true;
                response.questions.extend(query.questions.clone());
                // One TXT answer big enough to blow through 512 bytes
                response.answers.push(DnsRecord::Txt {
                    domain: query.questions[0].name.clone(),
                    data: "x".repeat(600),
                    ttl: 300,
                });
                Ok(response)
            }),
            true,
        );

        let data = handler
            .handle(&build_query_bytes(7, "big.example", QueryType::Txt), UDP_MAX_RESPONSE_SIZE)
            .unwrap();
        assert!(data.len() <= UDP_MAX_RESPONSE_SIZE);

        let response = parse(&data);
        assert_eq!(7, response.header.id);
        assert!(response.header.response);
        assert!(response.header.truncated_message);
        assert_eq!("big.example", response.questions[0].name);
        assert!(response.answers.is_empty());

        // The same response fits when no UDP ceiling applies (the TCP path)
        let data = handler
            .handle(&build_query_bytes(8, "big.example", QueryType::Txt), usize::MAX)
            .unwrap();
        let response = parse(&data);
        assert!(!response.header.truncated_message);
        assert_eq!(1, response.answers.len());
    }

    #[test]
    fn test_cached_response_can_still_be_truncated() {
        let handler = handler_with(
            Box::new(|query, _| {
                let mut response = DnsPacket::new();
                response.header.id = query.header.id;
                response.header.response = true;
                response.questions.extend(query.questions.clone());
                response.answers.push(DnsRecord::Txt {
                    domain: query.questions[0].name.clone(),
                    data: "x".repeat(600),
                    ttl: 300,
                });
                Ok(response)
            }),
            true,
        );

        // Prime the cache over the TCP-sized path
        handler
            .handle(&build_query_bytes(1, "big.example", QueryType::Txt), usize::MAX)
            .unwrap();

        // A UDP-sized read of the cached entry must truncate
        let data = handler
            .handle(&build_query_bytes(2, "big.example", QueryType::Txt), UDP_MAX_RESPONSE_SIZE)
            .unwrap();
        let response = parse(&data);
        assert!(response.header.truncated_message);
        assert_eq!(2, response.header.id);
    }
}
