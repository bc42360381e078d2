//! upstream resolution policy: walk the primary tier, then the fallback tier

use derive_more::{Display, Error};

use crate::dns::client::DnsClient;
use crate::dns::config::{ResolvedConfig, ServerEndpoint};
use crate::dns::protocol::DnsPacket;

#[derive(Debug, Display, Error)]
pub enum ResolveError {
    AllServersFailed,
}

type Result<T> = std::result::Result<T, ResolveError>;

/// Forwards a query to the configured upstream servers, one at a time.
///
/// Every primary server is tried before any fallback server; the first
/// response wins and later servers are never contacted. There is no parallel
/// racing, which keeps upstream load low at the cost of tail latency. A
/// response carrying a DNS error rcode is still a response; only transport
/// failures move the walk along.
pub struct UpstreamResolver {
    primary: Vec<ServerEndpoint>,
    fallback: Vec<ServerEndpoint>,
    client: Box<dyn DnsClient + Send + Sync>,
}

impl UpstreamResolver {
    pub fn new(
        config: &ResolvedConfig,
        client: Box<dyn DnsClient + Send + Sync>,
    ) -> UpstreamResolver {
        UpstreamResolver {
            primary: config.dns.clone(),
            fallback: config.fallback_dns.clone(),
            client,
        }
    }

    pub fn resolve(&self, query: &DnsPacket) -> Result<DnsPacket> {
        if let Some(response) = self.try_servers(query, &self.primary) {
            return Ok(response);
        }

        log::warn!("All primary DNS servers failed, trying fallback servers");

        if let Some(response) = self.try_servers(query, &self.fallback) {
            return Ok(response);
        }

        Err(ResolveError::AllServersFailed)
    }

    fn try_servers(&self, query: &DnsPacket, servers: &[ServerEndpoint]) -> Option<DnsPacket> {
        for server in servers {
            match self
                .client
                .send_query(query, (server.host.as_str(), server.port))
            {
                Ok(response) => return Some(response),
                Err(e) => log::warn!("DNS query failed for server {}: {}", server, e),
            }
        }

        None
    }
}
