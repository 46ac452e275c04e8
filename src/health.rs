use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use hickory_proto::rr::{Name, RecordType};
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::error::ConfigError;
use crate::host::UpstreamHost;
use crate::transport::{Exchanger, build_query};

/// Load-balancing policy of a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Random,
    RoundRobin,
    /// Always the earliest eligible host, i.e. fail-over.
    Sequential,
}

impl FromStr for Policy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "random" => Ok(Policy::Random),
            "round_robin" => Ok(Policy::RoundRobin),
            "sequential" => Ok(Policy::Sequential),
            other => Err(ConfigError::UnknownPolicy(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthParams {
    /// Counter value at which a host stops being selected. 0 disables gating.
    pub max_fails: u32,
    /// Periodic probe interval. Zero disables probing and failure accounting.
    pub check_interval: Duration,
    /// Window after which a recorded failure is forgotten.
    pub fail_timeout: Duration,
    /// An immediate probe fires on every n-th accumulated failure.
    pub probe_every: u32,
    pub recursion_desired: bool,
}

impl Default for HealthParams {
    fn default() -> Self {
        Self {
            max_fails: 3,
            check_interval: Duration::from_secs(2),
            fail_timeout: Duration::from_secs(2),
            probe_every: 3,
            recursion_desired: true,
        }
    }
}

/// Hosts of one zone, their selection policy and failure accounting.
pub struct HealthCheck {
    hosts: Vec<Arc<UpstreamHost>>,
    policy: Policy,
    spray: bool,
    params: HealthParams,
    next: AtomicUsize,
    exchanger: Arc<dyn Exchanger>,
    started: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl HealthCheck {
    pub fn new(
        hosts: Vec<Arc<UpstreamHost>>,
        policy: Policy,
        spray: bool,
        params: HealthParams,
        exchanger: Arc<dyn Exchanger>,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            hosts,
            policy,
            spray,
            params,
            next: AtomicUsize::new(0),
            exchanger,
            started: AtomicBool::new(false),
            stop_tx,
        }
    }

    pub fn hosts(&self) -> &[Arc<UpstreamHost>] {
        &self.hosts
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    #[inline]
    fn gating_enabled(&self) -> bool {
        self.params.max_fails != 0 && !self.params.check_interval.is_zero()
    }

    #[inline]
    fn eligible(&self, host: &UpstreamHost) -> bool {
        !self.gating_enabled() || host.is_eligible(self.params.max_fails)
    }

    /// Picks a host under the zone policy. `None` only when health gating
    /// excludes every host and spray is off.
    pub fn select(&self) -> Option<Arc<UpstreamHost>> {
        let n = self.hosts.len();
        if n == 0 {
            return None;
        }
        let picked = match self.policy {
            Policy::Random => {
                let start = fastrand::usize(..n);
                (0..n)
                    .map(|i| &self.hosts[(start + i) % n])
                    .find(|h| self.eligible(h))
            }
            Policy::RoundRobin => {
                let start = self.next.fetch_add(1, Ordering::Relaxed);
                (0..n)
                    .map(|i| &self.hosts[(start + i) % n])
                    .find(|h| self.eligible(h))
            }
            Policy::Sequential => self.hosts.iter().find(|h| self.eligible(h)),
        };

        match picked {
            Some(host) => Some(host.clone()),
            None if self.spray => {
                let host = &self.hosts[fastrand::usize(..n)];
                debug!(target = "health", host = %host, "all hosts down, spraying");
                Some(host.clone())
            }
            None => None,
        }
    }

    /// The host carrying `tag`, if it exists and is eligible.
    pub fn select_by_tag(&self, tag: &str) -> Option<Arc<UpstreamHost>> {
        self.hosts
            .iter()
            .find(|h| h.tag.as_deref() == Some(tag))
            .filter(|h| self.eligible(h))
            .cloned()
    }

    /// Records one failed exchange with `host`. The failure is forgotten after
    /// `fail_timeout`; every `probe_every`-th accumulated failure probes right away.
    pub fn report_failure(&self, host: &Arc<UpstreamHost>) {
        if !self.gating_enabled() {
            return;
        }
        let fails = count_failure(host, self.params.fail_timeout);
        if self.params.probe_every > 0 && fails > 0 && fails % self.params.probe_every as i32 == 0 {
            let host = host.clone();
            let exchanger = self.exchanger.clone();
            let params = self.params.clone();
            tokio::spawn(async move {
                probe(&*exchanger, &host, &params).await;
            });
        }
    }

    /// Spawns one recurring probe task per host. Calling it twice is a no-op.
    pub fn start(&self) {
        if !self.gating_enabled() || self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        for host in &self.hosts {
            let host = host.clone();
            let exchanger = self.exchanger.clone();
            let params = self.params.clone();
            let mut stop_rx = self.stop_tx.subscribe();
            tokio::spawn(async move {
                let mut ticker = interval(params.check_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // First tick completes immediately / 首个 tick 立即完成
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = stop_rx.changed() => break,
                        _ = ticker.tick() => probe(&*exchanger, &host, &params).await,
                    }
                    if *stop_rx.borrow() {
                        break;
                    }
                }
                debug!(target = "health", host = %host, "health check stopped");
            });
        }
        info!(
            target = "health",
            hosts = self.hosts.len(),
            interval_ms = self.params.check_interval.as_millis() as u64,
            "health check started"
        );
    }

    /// Cancels probe tasks and drops cached connections. Safe to call more than once
    /// or without a prior `start`.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
        for host in &self.hosts {
            host.release_conn();
        }
    }
}

impl Drop for HealthCheck {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
    }
}

fn count_failure(host: &Arc<UpstreamHost>, fail_timeout: Duration) -> i32 {
    let fails = host.add_fail();
    let decay = host.clone();
    tokio::spawn(async move {
        tokio::time::sleep(fail_timeout).await;
        decay.relieve();
    });
    fails
}

/// Sends `. IN NS` to `host`. Failure counts against the host, success relieves it by one.
async fn probe(exchanger: &dyn Exchanger, host: &Arc<UpstreamHost>, params: &HealthParams) {
    let query = build_query(Name::root(), RecordType::NS, params.recursion_desired);
    match exchanger.exchange(host, &query).await {
        Ok(_) => {
            host.relieve();
            debug!(target = "health", host = %host, fails = host.fails(), "probe ok");
        }
        Err(err) => {
            let fails = count_failure(host, params.fail_timeout);
            warn!(target = "health", host = %host, fails, error = %err, "probe failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExchangeError;
    use crate::testing::{ScriptedExchanger, reply, test_host};
    use hickory_proto::op::ResponseCode;

    fn pool(policy: Policy, spray: bool, exchanger: Arc<dyn Exchanger>) -> HealthCheck {
        HealthCheck::new(
            vec![
                test_host("10.0.0.1:53", Some("first")),
                test_host("10.0.0.2:53", None),
            ],
            policy,
            spray,
            HealthParams::default(),
            exchanger,
        )
    }

    #[test]
    fn policy_names() {
        assert_eq!("round_robin".parse::<Policy>().unwrap(), Policy::RoundRobin);
        assert!(matches!(
            "weighted".parse::<Policy>(),
            Err(ConfigError::UnknownPolicy(_))
        ));
    }

    #[test]
    fn round_robin_alternates_and_skips_gated_host() {
        let hc = pool(Policy::RoundRobin, false, ScriptedExchanger::answering());
        let a = hc.select().unwrap().name.clone();
        let b = hc.select().unwrap().name.clone();
        assert_ne!(a, b);

        hc.hosts()[0].set_fails(3);
        for _ in 0..10 {
            assert_eq!(hc.select().unwrap().name, "dns://10.0.0.2:53");
        }
    }

    #[test]
    fn sequential_prefers_earliest_eligible() {
        let hc = pool(Policy::Sequential, false, ScriptedExchanger::answering());
        assert_eq!(hc.select().unwrap().name, "dns://10.0.0.1:53");
        hc.hosts()[0].set_fails(5);
        assert_eq!(hc.select().unwrap().name, "dns://10.0.0.2:53");
        hc.hosts()[0].set_fails(2);
        assert_eq!(hc.select().unwrap().name, "dns://10.0.0.1:53");
    }

    #[test]
    fn random_reaches_every_eligible_host() {
        let hc = HealthCheck::new(
            vec![
                test_host("10.0.0.1:53", None),
                test_host("10.0.0.2:53", None),
                test_host("10.0.0.3:53", None),
            ],
            Policy::Random,
            false,
            HealthParams::default(),
            ScriptedExchanger::answering(),
        );
        hc.hosts()[0].set_fails(3);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            seen.insert(hc.select().unwrap().name.clone());
        }
        let mut seen: Vec<String> = seen.into_iter().collect();
        seen.sort();
        assert_eq!(seen, vec!["dns://10.0.0.2:53", "dns://10.0.0.3:53"]);

        for h in hc.hosts() {
            h.set_fails(3);
        }
        assert!(hc.select().is_none());
    }

    #[test]
    fn random_never_returns_gated_host() {
        let hc = pool(Policy::Random, false, ScriptedExchanger::answering());
        hc.hosts()[1].set_fails(3);
        for _ in 0..50 {
            assert_eq!(hc.select().unwrap().name, "dns://10.0.0.1:53");
        }
    }

    #[test]
    fn all_gated_yields_none_unless_spray() {
        let hc = pool(Policy::RoundRobin, false, ScriptedExchanger::answering());
        hc.hosts().iter().for_each(|h| h.set_fails(3));
        assert!(hc.select().is_none());

        let hc = pool(Policy::RoundRobin, true, ScriptedExchanger::answering());
        hc.hosts().iter().for_each(|h| h.set_fails(3));
        assert!(hc.select().is_some());
    }

    #[test]
    fn zero_max_fails_ignores_health() {
        let hc = HealthCheck::new(
            vec![test_host("10.0.0.1:53", None)],
            Policy::Sequential,
            false,
            HealthParams {
                max_fails: 0,
                ..HealthParams::default()
            },
            ScriptedExchanger::answering(),
        );
        hc.hosts()[0].set_fails(100);
        assert!(hc.select().is_some());
    }

    #[test]
    fn tagged_host_only_when_healthy() {
        let hc = pool(Policy::RoundRobin, false, ScriptedExchanger::answering());
        assert_eq!(hc.select_by_tag("first").unwrap().name, "dns://10.0.0.1:53");
        assert!(hc.select_by_tag("missing").is_none());
        hc.hosts()[0].set_fails(3);
        assert!(hc.select_by_tag("first").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failures_decay_and_third_failure_probes() {
        let exchanger = ScriptedExchanger::answering();
        let hc = pool(Policy::Sequential, false, exchanger.clone());
        let host = hc.hosts()[0].clone();

        hc.report_failure(&host);
        hc.report_failure(&host);
        assert_eq!(host.fails(), 2);
        assert_eq!(exchanger.call_count(), 0);

        hc.report_failure(&host);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(exchanger.call_count(), 1, "probe on third failure");
        assert_eq!(host.fails(), 2, "successful probe relieves one failure");

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(host.fails(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_counts_as_failure() {
        let exchanger = ScriptedExchanger::new(|_, _| Err(ExchangeError::Timeout(5000)));
        let hc = pool(Policy::Sequential, false, exchanger.clone());
        let host = hc.hosts()[0].clone();
        for _ in 0..3 {
            hc.report_failure(&host);
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(host.fails(), 4);
        assert!(!host.is_eligible(3));
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_probe_runs_until_stopped() {
        let exchanger = ScriptedExchanger::new(|_, req| Ok(reply(req, ResponseCode::NoError)));
        let hc = pool(Policy::Sequential, false, exchanger.clone());
        hc.start();
        hc.start();

        tokio::time::sleep(Duration::from_millis(4_100)).await;
        // two hosts, two ticks each
        assert_eq!(exchanger.call_count(), 4);
        assert!(exchanger.calls().iter().all(|c| c.starts_with("dns://10.0.0.")));

        hc.stop();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(exchanger.call_count(), 4);
    }

    #[test]
    fn disabled_checks_do_not_count() {
        let hc = HealthCheck::new(
            vec![test_host("10.0.0.1:53", None)],
            Policy::Sequential,
            false,
            HealthParams {
                check_interval: Duration::ZERO,
                ..HealthParams::default()
            },
            ScriptedExchanger::answering(),
        );
        // no runtime needed: nothing is spawned
        hc.report_failure(&hc.hosts()[0].clone());
        assert_eq!(hc.hosts()[0].fails(), 0);
        hc.stop();
    }
}
