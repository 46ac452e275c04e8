use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{GlobalSettings, ZoneConfig};
use crate::domain_set::{DomainSet, DomainSetBuilder, normalize_domain};
use crate::error::ConfigError;
use crate::health::{HealthCheck, HealthParams, Policy};
use crate::host::{TransportOptions, UpstreamHost, parse_host_port};
use crate::matcher::SubMatchers;
use crate::tags::TagHandle;
use crate::transport::Exchanger;

const MIN_HEALTH_CHECK: Duration = Duration::from_secs(1);
const MIN_EXPIRE: Duration = Duration::from_secs(1);

/// One forwarding block: which names it takes and where they go.
pub struct Zone {
    pub name: String,
    match_any: bool,
    match_tags: Vec<String>,
    non_match_tags: Vec<String>,
    inline: DomainSet,
    ignored: DomainSet,
    tags: TagHandle,
    pub health: HealthCheck,
    pub matchers: SubMatchers,
    pub no_ipv6: bool,
    pub debug: bool,
}

impl Zone {
    pub fn from_config(
        cfg: &ZoneConfig,
        settings: &GlobalSettings,
        tags: TagHandle,
        exchanger: Arc<dyn Exchanger>,
    ) -> Result<Self, ConfigError> {
        let (match_any, match_tags, non_match_tags) = parse_from(&cfg.from)?;
        let name = cfg.from.join(" ");

        let ignored = build_set(&name, "except", &cfg.except);
        let inline = build_set(&name, "inline", &cfg.inline);
        if match_any && !inline.is_empty() {
            let mut names: Vec<String> = inline.iter().map(str::to_string).collect();
            names.sort_unstable();
            return Err(ConfigError::InlineWithMatchAll(names));
        }

        if cfg.to.is_empty() {
            return Err(ConfigError::MissingProperty("to"));
        }
        let policy: Policy = cfg.policy.parse()?;

        let check_interval = Duration::from_millis(cfg.health_check_ms);
        check_min("health_check", check_interval, MIN_HEALTH_CHECK)?;
        let expire = Duration::from_millis(cfg.expire_ms);
        check_min("expire", expire, MIN_EXPIRE)?;
        check_counter("max_fails", cfg.max_fails)?;
        check_counter("probe_every", cfg.probe_every)?;

        let zone_server_name = match cfg.tls_servername.as_deref() {
            Some(raw) => Some(
                normalize_domain(raw).ok_or_else(|| ConfigError::InvalidServerName(raw.to_string()))?,
            ),
            None => None,
        };
        let bootstrap = cfg
            .bootstrap
            .iter()
            .map(|b| parse_host_port(b.trim(), 53))
            .collect::<Result<Vec<_>, _>>()?;

        let opts = Arc::new(TransportOptions {
            timeout: Duration::from_millis(settings.attempt_timeout_ms),
            expire,
            bootstrap,
            no_ipv6: cfg.no_ipv6,
        });
        let hosts = cfg
            .to
            .iter()
            .map(|h| {
                UpstreamHost::from_config(h, zone_server_name.as_deref(), opts.clone()).map(Arc::new)
            })
            .collect::<Result<Vec<_>, _>>()?;
        for host in &hosts {
            info!(target = "zone", zone = %name, host = %host, tag = ?host.tag, "upstream");
        }

        let matchers = SubMatchers::from_config(&cfg.rules, tags.clone())?;
        for rule in matchers.rules() {
            if let Some(to) = rule.to.as_deref() {
                if !hosts.iter().any(|h| h.tag.as_deref() == Some(to)) {
                    warn!(target = "zone", zone = %name, rule = %rule.name, to = %to, "no host carries this tag, policy selection will be used");
                }
            }
        }

        let params = HealthParams {
            max_fails: cfg.max_fails,
            check_interval,
            fail_timeout: Duration::from_millis(cfg.fail_timeout_ms),
            probe_every: cfg.probe_every,
            recursion_desired: !cfg.health_check_no_rec,
        };
        let health = HealthCheck::new(hosts, policy, cfg.spray, params, exchanger);
        info!(target = "zone", zone = %name, policy = ?health.policy(), hosts = health.hosts().len(), rules = matchers.rules().len(), "zone compiled");

        Ok(Self {
            name,
            match_any,
            match_tags,
            non_match_tags,
            inline,
            ignored,
            tags,
            health,
            matchers,
            no_ipv6: cfg.no_ipv6,
            debug: cfg.debug,
        })
    }

    /// True if this zone takes `name` (lower-cased, no trailing dot).
    pub fn matches(&self, name: &str) -> bool {
        if self.ignored.matches(name) {
            debug!(target = "zone", zone = %self.name, qname = %name, "skip ignored name");
            return false;
        }
        if self.match_any {
            return true;
        }
        if self.inline.matches(name) {
            return true;
        }
        if !self.tags.is_enabled() {
            return false;
        }

        if self.tags.has_any_tag(&self.match_tags, name) {
            debug!(target = "zone", zone = %self.name, qname = %name, "matched by tags");
            return true;
        }
        if !self.non_match_tags.is_empty() {
            return !self.tags.has_any_tag(&self.non_match_tags, name);
        }
        false
    }

    pub fn is_match_any(&self) -> bool {
        self.match_any
    }

    pub fn start(&self) {
        self.health.start();
    }

    pub fn stop(&self) {
        self.health.stop();
    }
}

fn parse_from(from: &[String]) -> Result<(bool, Vec<String>, Vec<String>), ConfigError> {
    if from.is_empty() {
        return Err(ConfigError::ArgCount("from"));
    }
    if from.len() == 1 && from[0].trim() == "." {
        return Ok((true, Vec::new(), Vec::new()));
    }

    let mut positive = Vec::new();
    let mut negative = Vec::new();
    for form in from {
        let form = form.trim();
        if form == "." {
            return Err(ConfigError::MatchAllWithTags(from.to_vec()));
        }
        match form.strip_prefix('!') {
            Some("") => return Err(ConfigError::ArgCount("from")),
            Some(tag) => negative.push(tag.to_string()),
            None if form.is_empty() => return Err(ConfigError::ArgCount("from")),
            None => positive.push(form.to_string()),
        }
    }
    Ok((false, positive, negative))
}

fn build_set(zone: &str, what: &str, names: &[String]) -> DomainSet {
    let mut builder = DomainSetBuilder::new();
    for n in names {
        if !builder.add(n) {
            warn!(target = "zone", zone = %zone, list = %what, name = %n, "not a domain name, skipped");
        }
    }
    let set = builder.build();
    if !set.is_empty() {
        info!(target = "zone", zone = %zone, list = %what, count = set.len(), names = %set, "domain list");
    }
    set
}

fn check_min(property: &'static str, got: Duration, min: Duration) -> Result<(), ConfigError> {
    if !got.is_zero() && got < min {
        return Err(ConfigError::IntervalTooShort {
            property,
            min_ms: min.as_millis() as u64,
            got_ms: got.as_millis() as u64,
        });
    }
    Ok(())
}

/// Fail counters are signed 32-bit; larger limits would wrap negative.
fn check_counter(property: &'static str, got: u32) -> Result<(), ConfigError> {
    if got > i32::MAX as u32 {
        return Err(ConfigError::OutOfRange {
            property,
            max: i32::MAX as u64,
            got: got as u64,
        });
    }
    Ok(())
}
