use std::fmt;
use std::net::IpAddr;

use hickory_proto::op::Message;
use hickory_proto::rr::RData;
use ipnet::IpNet;
use tracing::{debug, info};

use crate::config::RuleConfig;
use crate::domain_set::normalize_qname;
use crate::ecs;
use crate::error::ConfigError;
use crate::hooks::{Hooks, QueryContext};
use crate::tags::{TagHandle, parse_net};

/// One entry of an IP predicate: a literal network or a network tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetMatcher {
    Net(IpNet),
    Tag(String),
}

impl NetMatcher {
    fn from_config(value: &str) -> Self {
        match parse_net(value) {
            Ok(net) => NetMatcher::Net(net),
            Err(_) => NetMatcher::Tag(value.trim().to_string()),
        }
    }

    #[inline]
    fn matches(&self, ip: IpAddr, tags: &TagHandle) -> bool {
        match self {
            NetMatcher::Net(net) => net.contains(&ip),
            NetMatcher::Tag(tag) => tags.network_has_tag(tag, ip),
        }
    }
}

impl fmt::Display for NetMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetMatcher::Net(net) => write!(f, "{net}"),
            NetMatcher::Tag(tag) => f.write_str(tag),
        }
    }
}

/// A per-zone rule: up to four predicates and the actions taken on a hit.
#[derive(Debug, Clone)]
pub struct SubMatcher {
    pub name: String,
    /// Tag of the host a matching query is sent to.
    pub to: Option<String>,
    pub query_names: Vec<String>,
    pub client_ips: Vec<NetMatcher>,
    pub answer_ips: Vec<NetMatcher>,
    pub answer_cnames: Vec<String>,
    pub nxdomain: bool,
    pub force_ecs: Option<String>,
    pub notify: Option<String>,
    pub ipset: Vec<String>,
}

impl SubMatcher {
    pub fn from_config(cfg: &RuleConfig) -> Result<Self, ConfigError> {
        let non_empty = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let ipset = cfg
            .ipset
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        Ok(Self {
            name: cfg.name.clone(),
            to: non_empty(&cfg.to),
            query_names: cfg.query_names.clone(),
            client_ips: cfg.client_ips.iter().map(|s| NetMatcher::from_config(s)).collect(),
            answer_ips: cfg.answer_ips.iter().map(|s| NetMatcher::from_config(s)).collect(),
            answer_cnames: cfg.answer_cnames.clone(),
            nxdomain: cfg.nxdomain,
            force_ecs: non_empty(&cfg.force_ecs),
            notify: non_empty(&cfg.notify),
            ipset,
        })
    }

    fn match_query_name(&self, name: &str, tags: &TagHandle) -> bool {
        tags.has_any_tag(&self.query_names, name)
    }

    fn match_answer_cname(&self, name: &str, tags: &TagHandle) -> bool {
        tags.has_any_tag(&self.answer_cnames, name)
    }

    fn match_client_ip(&self, ip: IpAddr, tags: &TagHandle) -> bool {
        self.client_ips.iter().any(|m| m.matches(ip, tags))
    }

    fn match_answer_ip(&self, ip: IpAddr, tags: &TagHandle) -> bool {
        self.answer_ips.iter().any(|m| m.matches(ip, tags))
    }
}

impl fmt::Display for SubMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |v: &[NetMatcher]| v.iter().map(|m| m.to_string()).collect::<Vec<_>>().join(",");
        write!(
            f,
            "rule {} to:{} client_ips:[{}] query_names:[{}] answer_ips:[{}] answer_cnames:[{}] notify:{} force_ecs:{} ipset:[{}] nxdomain:{}",
            self.name,
            self.to.as_deref().unwrap_or("-"),
            join(&self.client_ips),
            self.query_names.join(","),
            join(&self.answer_ips),
            self.answer_cnames.join(","),
            self.notify.as_deref().unwrap_or("-"),
            self.force_ecs.as_deref().unwrap_or("-"),
            self.ipset.join(","),
            self.nxdomain,
        )
    }
}

/// Outcome of the query phase.
#[derive(Debug, Clone, Default)]
pub struct QueryOutcome {
    /// Host tag the matching rule points at.
    pub to: Option<String>,
    pub nxdomain: bool,
    /// ECS was forced onto a query that had none; strip it from the reply.
    pub strip_ecs: bool,
}

/// Ordered rule list of a zone. In every lookup the earliest matching rule wins.
#[derive(Debug, Clone, Default)]
pub struct SubMatchers {
    rules: Vec<SubMatcher>,
    tags: TagHandle,
}

impl SubMatchers {
    pub fn new(rules: Vec<SubMatcher>, tags: TagHandle) -> Self {
        Self { rules, tags }
    }

    pub fn from_config(cfgs: &[RuleConfig], tags: TagHandle) -> Result<Self, ConfigError> {
        let rules = cfgs
            .iter()
            .map(SubMatcher::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(rules, tags))
    }

    pub fn rules(&self) -> &[SubMatcher] {
        &self.rules
    }

    pub fn match_query(&self, name: &str) -> Option<&SubMatcher> {
        self.rules.iter().find(|r| r.match_query_name(name, &self.tags))
    }

    pub fn match_client_ip(&self, ip: IpAddr) -> Option<&SubMatcher> {
        self.rules.iter().find(|r| r.match_client_ip(ip, &self.tags))
    }

    pub fn match_answer_ip(&self, ip: IpAddr) -> Option<&SubMatcher> {
        self.rules.iter().find(|r| r.match_answer_ip(ip, &self.tags))
    }

    pub fn match_answer_cname(&self, name: &str) -> Option<&SubMatcher> {
        self.rules.iter().find(|r| r.match_answer_cname(name, &self.tags))
    }

    /// Query phase: the name rule first, else the client address rule.
    /// May attach a forced ECS option to `outgoing`.
    pub fn eval_query(
        &self,
        ctx: &QueryContext<'_>,
        outgoing: &mut Message,
        hooks: &Hooks,
        verbose: bool,
    ) -> QueryOutcome {
        let Some(rule) = self
            .match_query(ctx.qname)
            .or_else(|| self.match_client_ip(ctx.client_ip))
        else {
            return QueryOutcome::default();
        };
        if verbose {
            info!(target = "matcher", qname = %ctx.qname, client_ip = %ctx.client_ip, "query hit {}", rule);
        }

        fire_side_effects(rule, ctx, ctx.request, ctx.qname, hooks);

        let mut outcome = QueryOutcome {
            to: rule.to.clone(),
            nxdomain: rule.nxdomain,
            strip_ecs: false,
        };
        if rule.nxdomain {
            return outcome;
        }

        if let Some(tag) = rule.force_ecs.as_deref() {
            let forced = self
                .tags
                .resolve_forced_subnet(tag, ctx.client_ip)
                .and_then(ecs::subnet_for);
            if let Some(subnet) = forced {
                debug!(target = "matcher", qname = %ctx.qname, subnet = ?subnet, "forcing ecs");
                outcome.strip_ecs = !ecs::has_ecs(ctx.request);
                ecs::set_ecs(outgoing, subnet);
            }
        }
        outcome
    }

    /// Answer phase: every A/AAAA and CNAME record is matched on its own.
    /// Returns true if a hit forces NXDOMAIN.
    pub fn eval_answer(
        &self,
        ctx: &QueryContext<'_>,
        reply: &Message,
        hooks: &Hooks,
        verbose: bool,
    ) -> bool {
        for rec in reply.answers() {
            let rule = match rec.data() {
                Some(RData::A(a)) => self.match_answer_ip(IpAddr::V4(a.0)),
                Some(RData::AAAA(aaaa)) => self.match_answer_ip(IpAddr::V6(aaaa.0)),
                Some(RData::CNAME(cname)) => {
                    self.match_answer_cname(&normalize_qname(&cname.0.to_ascii()))
                }
                _ => None,
            };
            let Some(rule) = rule else {
                continue;
            };
            if verbose {
                info!(target = "matcher", qname = %ctx.qname, record = %rec, "answer hit {}", rule);
            }

            let record_name = normalize_qname(&rec.name().to_ascii());
            fire_side_effects(rule, ctx, reply, &record_name, hooks);
            if rule.nxdomain {
                return true;
            }
        }
        false
    }
}

fn fire_side_effects(
    rule: &SubMatcher,
    ctx: &QueryContext<'_>,
    msg: &Message,
    record_name: &str,
    hooks: &Hooks,
) {
    if let Some(channel) = rule.notify.as_deref() {
        hooks.notifier.notify(channel, ctx);
    }
    for collection in &rule.ipset {
        hooks.collections.add_addresses(collection, msg, record_name);
    }
}
