//! TTL-aware response cache shared across worker threads
//!
//! Entries are keyed by `(lowercased qname, qtype, qclass)` and hold the
//! filtered upstream response together with its insertion time. A hit
//! returns a clone whose record TTLs are decremented by the elapsed time;
//! the decremented clone is memoized for one second per entry, which is
//! below TTL granularity and therefore invisible to clients, but saves
//! rebuilding the clone on every read of a hot key.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::dns::protocol::DnsPacket;

pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Fixed lifetime for cached NXDOMAIN responses, regardless of what the
/// upstream's authority section claims.
pub const NEGATIVE_CACHE_TTL: Duration = Duration::from_secs(30);

const EVICTION_BATCH_SIZE: usize = 100;
const TTL_ADJUSTMENT_INTERVAL: Duration = Duration::from_secs(1);

struct CacheEntry {
    original: DnsPacket,
    creation: Instant,
    expiration: Instant,
    adjusted: RwLock<Option<(Instant, DnsPacket)>>,
}

impl CacheEntry {
    fn new(original: DnsPacket, ttl: Duration, now: Instant) -> CacheEntry {
        CacheEntry {
            original,
            creation: now,
            expiration: now + ttl,
            adjusted: RwLock::new(None),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now > self.expiration
    }

    fn adjusted_packet(&self, now: Instant) -> DnsPacket {
        if let Ok(memo) = self.adjusted.read() {
            if let Some((at, packet)) = memo.as_ref() {
                if now.duration_since(*at) < TTL_ADJUSTMENT_INTERVAL {
                    return packet.clone();
                }
            }
        }

        let packet = self.adjust_ttl(now);
        if let Ok(mut memo) = self.adjusted.write() {
            *memo = Some((now, packet.clone()));
        }

        packet
    }

    fn adjust_ttl(&self, now: Instant) -> DnsPacket {
        let elapsed = now.duration_since(self.creation).as_secs() as u32;

        let mut adjusted = self.original.clone();
        for rec in adjusted.records_mut() {
            if let Some(ttl) = rec.ttl_mut() {
                *ttl = ttl.saturating_sub(elapsed);
            }
        }

        adjusted
    }
}

/// Concurrent cache of filtered upstream responses.
///
/// `get` and `put` may be called from any number of workers. Eviction races
/// with inserts; the size settles below `max_entries` rather than never
/// exceeding it.
pub struct DnsCache {
    entries: DashMap<String, CacheEntry>,
    max_entries: usize,
    insert_counter: AtomicUsize,
}

impl DnsCache {
    pub fn new() -> DnsCache {
        DnsCache::with_max_entries(DEFAULT_MAX_ENTRIES)
    }

    pub fn with_max_entries(max_entries: usize) -> DnsCache {
        DnsCache {
            entries: DashMap::new(),
            max_entries,
            insert_counter: AtomicUsize::new(0),
        }
    }

    fn build_key(qname: &str, qtype: u16, qclass: u16) -> String {
        format!("{}:{}:{}", qname.to_lowercase(), qtype, qclass)
    }

    pub fn get(&self, qname: &str, qtype: u16, qclass: u16) -> Option<DnsPacket> {
        let key = Self::build_key(qname, qtype, qclass);
        let now = Instant::now();

        {
            let entry = self.entries.get(&key)?;
            if !entry.is_expired(now) {
                log::debug!("Cache hit: {}", key);
                return Some(entry.adjusted_packet(now));
            }
        }

        // Expired: drop the read guard above before removing, and only
        // remove if a concurrent put hasn't replaced the entry meanwhile.
        self.entries.remove_if(&key, |_, entry| entry.is_expired(now));
        log::debug!("Cache entry expired: {}", key);

        None
    }

    pub fn put(&self, qname: &str, qtype: u16, qclass: u16, packet: &DnsPacket, is_nxdomain: bool) {
        let key = Self::build_key(qname, qtype, qclass);

        let ttl = if is_nxdomain {
            NEGATIVE_CACHE_TTL
        } else {
            match packet.min_ttl() {
                Some(ttl) if ttl > 0 => Duration::from_secs(ttl as u64),
                _ => {
                    log::debug!("Not caching response with TTL <= 0: {}", key);
                    return;
                }
            }
        };

        if (self.insert_counter.fetch_add(1, Ordering::Relaxed) + 1) % EVICTION_BATCH_SIZE == 0 {
            self.evict_expired();
        }

        if self.entries.len() >= self.max_entries {
            self.evict_expired();
        }

        if self.entries.len() >= self.max_entries {
            self.evict_oldest();
        }

        let now = Instant::now();
        self.entries.insert(key.clone(), CacheEntry::new(packet.clone(), ttl, now));

        log::debug!("Cached response: {} (TTL: {}s)", key, ttl.as_secs());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
        log::info!("Cache cleared");
    }

    /// Time left until the entry for this key expires, mainly useful for
    /// inspecting negative-cache behavior.
    pub fn remaining_ttl(&self, qname: &str, qtype: u16, qclass: u16) -> Option<Duration> {
        let key = Self::build_key(qname, qtype, qclass);
        let now = Instant::now();

        self.entries
            .get(&key)
            .map(|entry| entry.expiration.saturating_duration_since(now))
    }

    fn evict_expired(&self) {
        let now = Instant::now();
        let before = self.entries.len();

        self.entries.retain(|_, entry| !entry.is_expired(now));

        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            log::debug!("Evicted {} expired cache entries", evicted);
        }
    }

    fn evict_oldest(&self) {
        let target = (self.max_entries / 10).max(1);

        let mut entries: Vec<(String, Instant)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().creation))
            .collect();
        entries.sort_by_key(|(_, creation)| *creation);

        for (key, _) in entries.into_iter().take(target) {
            self.entries.remove(&key);
        }

        log::debug!("Evicted {} oldest cache entries", target);
    }
}

impl Default for DnsCache {
    fn default() -> Self {
        DnsCache::new()
    }
}

#[cfg(test)]
mod tests {

    use std::thread::sleep;

    use super::*;
    use crate::dns::protocol::{DnsQuestion, DnsRecord, QueryType, ResultCode};

    const QTYPE_A: u16 = 1;
    const CLASS_IN: u16 = 1;

    fn response(domain: &str, addr: &str, ttl: u32) -> DnsPacket {
        let mut packet = DnsPacket::new();
        packet.header.response = true;
        packet
            .questions
            .push(DnsQuestion::new(domain.to_string(), QueryType::A));
        packet.answers.push(DnsRecord::A {
            domain: domain.to_string(),
            addr: addr.parse().unwrap(),
            ttl,
        });
        packet
    }

    fn nxdomain(domain: &str, soa_minimum: u32) -> DnsPacket {
        let mut packet = DnsPacket::new();
        packet.header.response = true;
        packet.header.rescode = ResultCode::NXDOMAIN;
        packet
            .questions
            .push(DnsQuestion::new(domain.to_string(), QueryType::A));
        packet.authorities.push(DnsRecord::Soa {
            domain: domain.to_string(),
            m_name: "ns1.example.com".to_string(),
            r_name: "hostmaster.example.com".to_string(),
            serial: 1,
            refresh: 3600,
            retry: 600,
            expire: 86400,
            minimum: soa_minimum,
            ttl: soa_minimum,
        });
        packet
    }

    #[test]
    fn test_hit_and_miss() {
        let cache = DnsCache::new();

        cache.put("example.com.", QTYPE_A, CLASS_IN, &response("example.com", "1.1.1.1", 300), false);

        assert!(cache.get("example.com.", QTYPE_A, CLASS_IN).is_some());
        assert!(cache.get("other.com.", QTYPE_A, CLASS_IN).is_none());
        assert!(cache.get("example.com.", 28, CLASS_IN).is_none());
    }

    #[test]
    fn test_case_insensitive_keys() {
        let cache = DnsCache::new();

        cache.put("EXAMPLE.COM.", QTYPE_A, CLASS_IN, &response("example.com", "1.1.1.1", 300), false);

        assert!(cache.get("example.com.", QTYPE_A, CLASS_IN).is_some());
        assert!(cache.get("EXAMPLE.COM.", QTYPE_A, CLASS_IN).is_some());
        assert!(cache.get("Example.Com.", QTYPE_A, CLASS_IN).is_some());
    }

    #[test]
    fn test_expiration() {
        let cache = DnsCache::new();

        cache.put("example.com.", QTYPE_A, CLASS_IN, &response("example.com", "1.1.1.1", 1), false);
        assert!(cache.get("example.com.", QTYPE_A, CLASS_IN).is_some());

        sleep(Duration::from_millis(1100));

        assert!(cache.get("example.com.", QTYPE_A, CLASS_IN).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_ttl_decrement_on_hit() {
        let cache = DnsCache::new();

        cache.put("example.com.", QTYPE_A, CLASS_IN, &response("example.com", "1.1.1.1", 300), false);

        sleep(Duration::from_millis(1100));

        let hit = cache.get("example.com.", QTYPE_A, CLASS_IN).unwrap();
        assert_eq!(Some(299), hit.answers[0].get_ttl());
    }

    #[test]
    fn test_memoized_reads_within_a_second_agree() {
        let cache = DnsCache::new();

        cache.put("example.com.", QTYPE_A, CLASS_IN, &response("example.com", "1.1.1.1", 300), false);

        let first = cache.get("example.com.", QTYPE_A, CLASS_IN).unwrap();
        let second = cache.get("example.com.", QTYPE_A, CLASS_IN).unwrap();

        assert_eq!(first.answers, second.answers);
        assert_eq!(Some(300), first.answers[0].get_ttl());
    }

    #[test]
    fn test_zero_ttl_not_cached() {
        let cache = DnsCache::new();

        cache.put("example.com.", QTYPE_A, CLASS_IN, &response("example.com", "1.1.1.1", 0), false);

        assert!(cache.get("example.com.", QTYPE_A, CLASS_IN).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_empty_response_not_cached() {
        let cache = DnsCache::new();

        let mut packet = DnsPacket::new();
        packet.header.response = true;
        packet.header.rescode = ResultCode::SERVFAIL;

        cache.put("example.com.", QTYPE_A, CLASS_IN, &packet, false);

        assert!(cache.is_empty());
    }

    #[test]
    fn test_min_ttl_across_sections_governs_lifetime() {
        let cache = DnsCache::new();

        let mut packet = response("example.com", "1.1.1.1", 300);
        packet.authorities.push(DnsRecord::Ns {
            domain: "example.com".to_string(),
            host: "ns1.example.com".to_string(),
            ttl: 5,
        });

        cache.put("example.com.", QTYPE_A, CLASS_IN, &packet, false);

        let remaining = cache.remaining_ttl("example.com.", QTYPE_A, CLASS_IN).unwrap();
        assert!(remaining <= Duration::from_secs(5));
    }

    #[test]
    fn test_negative_cache_uses_fixed_ttl() {
        let cache = DnsCache::new();

        // The SOA advertises an hour; the negative entry must still expire
        // after the fixed 30 seconds.
        cache.put("nope.example.", QTYPE_A, CLASS_IN, &nxdomain("nope.example", 3600), true);

        let hit = cache.get("nope.example.", QTYPE_A, CLASS_IN).unwrap();
        assert_eq!(ResultCode::NXDOMAIN, hit.header.rescode);

        let remaining = cache.remaining_ttl("nope.example.", QTYPE_A, CLASS_IN).unwrap();
        assert!(remaining <= NEGATIVE_CACHE_TTL);
        assert!(remaining > Duration::from_secs(25));
    }

    #[test]
    fn test_oldest_entries_evicted_when_full() {
        let cache = DnsCache::with_max_entries(3);

        cache.put("a.com.", QTYPE_A, CLASS_IN, &response("a.com", "1.1.1.1", 300), false);
        sleep(Duration::from_millis(5));
        cache.put("b.com.", QTYPE_A, CLASS_IN, &response("b.com", "2.2.2.2", 300), false);
        sleep(Duration::from_millis(5));
        cache.put("c.com.", QTYPE_A, CLASS_IN, &response("c.com", "3.3.3.3", 300), false);
        sleep(Duration::from_millis(5));

        assert_eq!(3, cache.len());

        cache.put("d.com.", QTYPE_A, CLASS_IN, &response("d.com", "4.4.4.4", 300), false);

        assert!(cache.get("a.com.", QTYPE_A, CLASS_IN).is_none());
        assert!(cache.get("b.com.", QTYPE_A, CLASS_IN).is_some());
        assert!(cache.get("c.com.", QTYPE_A, CLASS_IN).is_some());
        assert!(cache.get("d.com.", QTYPE_A, CLASS_IN).is_some());
    }

    #[test]
    fn test_clear() {
        let cache = DnsCache::new();

        cache.put("a.com.", QTYPE_A, CLASS_IN, &response("a.com", "1.1.1.1", 300), false);
        cache.put("b.com.", QTYPE_A, CLASS_IN, &response("b.com", "2.2.2.2", 300), false);
        assert_eq!(2, cache.len());

        cache.clear();

        assert!(cache.is_empty());
        assert!(cache.get("a.com.", QTYPE_A, CLASS_IN).is_none());
    }
}
