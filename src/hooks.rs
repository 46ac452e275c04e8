use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use dashmap::DashMap;
use hickory_proto::op::Message;
use hickory_proto::rr::{RData, RecordType};
use tracing::info;

/// What a side-effect sink gets to see of the query being handled.
#[derive(Debug, Clone, Copy)]
pub struct QueryContext<'a> {
    pub client_ip: IpAddr,
    pub qname: &'a str,
    pub qtype: RecordType,
    pub request: &'a Message,
}

/// Fire-and-forget notification channel. Implementations must not block.
pub trait Notifier: Send + Sync {
    fn notify(&self, channel: &str, ctx: &QueryContext<'_>);
}

/// Emits every notification as a tracing event.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, channel: &str, ctx: &QueryContext<'_>) {
        info!(
            target = "notify",
            channel = %channel,
            client_ip = %ctx.client_ip,
            qname = %ctx.qname,
            qtype = %ctx.qtype,
            "rule notification"
        );
    }
}

/// Named address collections fed from matching messages (ipset-style).
pub trait IpCollections: Send + Sync {
    /// Adds the A/AAAA addresses found in `msg` to `collection`.
    fn add_addresses(&self, collection: &str, msg: &Message, record_name: &str);
}

/// Used where no kernel address-set integration exists: every call is a no-op.
#[derive(Debug, Default)]
pub struct NoopCollections;

impl IpCollections for NoopCollections {
    fn add_addresses(&self, _collection: &str, _msg: &Message, _record_name: &str) {}
}

/// Entries kept per collection when no limit is given.
pub const DEFAULT_COLLECTION_LIMIT: usize = 65_536;

/// Keeps named address sets in memory, each capped at `limit` addresses.
#[derive(Debug)]
pub struct MemoryCollections {
    sets: DashMap<String, CollectedSet>,
    limit: usize,
}

#[derive(Debug, Default)]
struct CollectedSet {
    addrs: HashSet<IpAddr>,
    /// New addresses refused because the set was full.
    dropped: u64,
}

impl Default for MemoryCollections {
    fn default() -> Self {
        Self::with_limit(DEFAULT_COLLECTION_LIMIT)
    }
}

impl MemoryCollections {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            sets: DashMap::new(),
            limit,
        }
    }

    #[cfg(test)]
    pub fn contains(&self, collection: &str, ip: IpAddr) -> bool {
        self.sets
            .get(collection)
            .is_some_and(|set| set.addrs.contains(&ip))
    }

    #[cfg(test)]
    pub fn len(&self, collection: &str) -> usize {
        self.sets.get(collection).map_or(0, |set| set.addrs.len())
    }

    /// Per-collection sizes, sorted by name.
    pub fn summary(&self) -> CollectionsSummary {
        let mut sets: Vec<(String, usize, u64)> = self
            .sets
            .iter()
            .map(|e| (e.key().clone(), e.addrs.len(), e.dropped))
            .collect();
        sets.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        CollectionsSummary { sets }
    }

    fn insert(&self, set: &mut CollectedSet, ip: IpAddr) {
        if set.addrs.contains(&ip) {
            return;
        }
        if set.addrs.len() >= self.limit {
            set.dropped += 1;
            return;
        }
        set.addrs.insert(ip);
    }
}

impl IpCollections for MemoryCollections {
    fn add_addresses(&self, collection: &str, msg: &Message, _record_name: &str) {
        let mut set = self.sets.entry(collection.to_string()).or_default();
        for rec in msg.answers() {
            match rec.data() {
                Some(RData::A(a)) => self.insert(&mut set, IpAddr::V4(a.0)),
                Some(RData::AAAA(aaaa)) => self.insert(&mut set, IpAddr::V6(aaaa.0)),
                _ => {}
            }
        }
    }
}

/// Point-in-time view of [`MemoryCollections`], for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionsSummary {
    /// (name, addresses kept, addresses dropped)
    pub sets: Vec<(String, usize, u64)>,
}

impl fmt::Display for CollectionsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, kept, dropped)) in self.sets.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={kept}")?;
            if *dropped > 0 {
                write!(f, " (dropped {dropped})")?;
            }
        }
        Ok(())
    }
}

/// Side-effect sinks handed to rule evaluation.
#[derive(Clone)]
pub struct Hooks {
    pub notifier: Arc<dyn Notifier>,
    pub collections: Arc<dyn IpCollections>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            notifier: Arc::new(LogNotifier),
            collections: Arc::new(NoopCollections),
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Hooks")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::{A, AAAA, CNAME};
    use hickory_proto::rr::{Name, Record};
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::str::FromStr;

    #[test]
    fn memory_collections_collect_only_addresses() {
        let name = Name::from_str("example.com.").unwrap();
        let mut msg = Message::new();
        msg.add_answer(Record::from_rdata(
            name.clone(),
            60,
            RData::CNAME(CNAME(Name::from_str("edge.example.net.").unwrap())),
        ));
        msg.add_answer(Record::from_rdata(
            name.clone(),
            60,
            RData::A(A(Ipv4Addr::new(192, 0, 2, 7))),
        ));
        msg.add_answer(Record::from_rdata(
            name,
            60,
            RData::AAAA(AAAA(Ipv6Addr::LOCALHOST)),
        ));

        let sets = MemoryCollections::new();
        sets.add_addresses("blocked", &msg, "example.com");
        assert_eq!(sets.len("blocked"), 2);
        assert!(sets.contains("blocked", "192.0.2.7".parse().unwrap()));
        assert!(sets.contains("blocked", "::1".parse().unwrap()));
        assert!(!sets.contains("other", "192.0.2.7".parse().unwrap()));
    }

    #[test]
    fn memory_collections_stop_growing_at_limit() {
        let name = Name::from_str("example.com.").unwrap();
        let mut msg = Message::new();
        for last in 1..=5u8 {
            msg.add_answer(Record::from_rdata(
                name.clone(),
                60,
                RData::A(A(Ipv4Addr::new(192, 0, 2, last))),
            ));
        }

        let sets = MemoryCollections::with_limit(3);
        sets.add_addresses("blocked", &msg, "example.com");
        sets.add_addresses("blocked", &msg, "example.com");
        sets.add_addresses("allowed", &Message::new(), "example.com");
        assert_eq!(sets.len("blocked"), 3);
        assert!(sets.contains("blocked", "192.0.2.1".parse().unwrap()));
        assert!(!sets.contains("blocked", "192.0.2.5".parse().unwrap()));

        let summary = sets.summary();
        assert_eq!(
            summary.sets,
            vec![("allowed".to_string(), 0, 0), ("blocked".to_string(), 3, 4)]
        );
        assert_eq!(summary.to_string(), "allowed=0, blocked=3 (dropped 4)");
    }

    #[test]
    fn noop_collections_accept_anything() {
        NoopCollections.add_addresses("x", &Message::new(), "example.com");
    }
}
