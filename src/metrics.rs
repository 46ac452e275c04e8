use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use hickory_proto::op::ResponseCode;

#[derive(Debug, Default)]
struct Timing {
    count: AtomicU64,
    ns_total: AtomicU64,
}

impl Timing {
    #[inline]
    fn observe(&self, dur: Duration) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.ns_total
            .fetch_add(dur.as_nanos() as u64, Ordering::Relaxed);
    }

    fn avg_us(&self) -> f64 {
        let count = self.count.load(Ordering::Relaxed);
        let ns = self.ns_total.load(Ordering::Relaxed);
        if count > 0 {
            (ns / count) as f64 / 1000.0
        } else {
            0.0
        }
    }
}

/// Process-wide forwarding counters. Cheap to update from any task.
#[derive(Debug, Default)]
pub struct Metrics {
    // (server, host) -> request count and total duration / (服务, 上游) -> 请求数与总耗时
    requests: DashMap<(String, String), Timing>,
    // (server, host, rcode) -> count / (服务, 上游, 响应码) -> 计数
    rcodes: DashMap<(String, String, u16), AtomicU64>,
    lookup_hit: Timing,
    lookup_miss: Timing,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// One finished upstream request.
    pub fn observe_request(&self, server: &str, host: &str, rcode: ResponseCode, dur: Duration) {
        self.requests
            .entry((server.to_string(), host.to_string()))
            .or_default()
            .observe(dur);
        self.rcodes
            .entry((server.to_string(), host.to_string(), u16::from(rcode)))
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Duration of a zone lookup, split by whether a zone matched.
    pub fn observe_lookup(&self, hit: bool, dur: Duration) {
        if hit {
            self.lookup_hit.observe(dur);
        } else {
            self.lookup_miss.observe(dur);
        }
    }

    #[cfg(test)]
    pub fn request_count(&self, server: &str, host: &str) -> u64 {
        self.requests
            .get(&(server.to_string(), host.to_string()))
            .map_or(0, |h| h.count.load(Ordering::Relaxed))
    }

    #[cfg(test)]
    pub fn rcode_count(&self, server: &str, host: &str, rcode: ResponseCode) -> u64 {
        self.rcodes
            .get(&(server.to_string(), host.to_string(), u16::from(rcode)))
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    pub fn lookup_counts(&self) -> (u64, u64) {
        (
            self.lookup_hit.count.load(Ordering::Relaxed),
            self.lookup_miss.count.load(Ordering::Relaxed),
        )
    }

    pub fn snapshot(&self) -> String {
        let mut lines = Vec::with_capacity(self.requests.len() + self.rcodes.len() + 1);
        let (hit, miss) = self.lookup_counts();
        lines.push(format!(
            "lookup hit={} hit_avg_us={} miss={} miss_avg_us={}",
            hit,
            self.lookup_hit.avg_us(),
            miss,
            self.lookup_miss.avg_us()
        ));
        for entry in self.requests.iter() {
            let (server, host) = entry.key();
            lines.push(format!(
                "request server={} host={} count={} avg_us={}",
                server,
                host,
                entry.value().count.load(Ordering::Relaxed),
                entry.value().avg_us()
            ));
        }
        for entry in self.rcodes.iter() {
            let (server, host, rcode) = entry.key();
            lines.push(format!(
                "rcode server={} host={} rcode={} count={}",
                server,
                host,
                ResponseCode::from_low(*rcode as u8),
                entry.value().load(Ordering::Relaxed)
            ));
        }
        lines.sort_unstable();
        lines.join("\n")
    }
}
