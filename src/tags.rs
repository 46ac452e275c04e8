use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use tracing::warn;

use crate::config::TagConfig;
use crate::domain_set::{DomainSet, DomainSetBuilder};
use crate::error::ConfigError;

/// Classification lookups consumed by zone matching and rule evaluation.
pub trait TagService: Send + Sync {
    /// True if `name` (lower-cased, no trailing dot) carries any of `tags`.
    fn has_any_tag(&self, tags: &[String], name: &str) -> bool;
    /// True if `ip` belongs to a network classified under `tag`.
    fn network_has_tag(&self, tag: &str, ip: IpAddr) -> bool;
    /// Subnet address to advertise as ECS for `client` under `tag`.
    fn resolve_forced_subnet(&self, tag: &str, client: IpAddr) -> Option<IpAddr>;
}

/// Handle to an optional [`TagService`]. A disabled handle answers every
/// lookup negatively, so tag zones and tag rules simply never match.
#[derive(Clone, Default)]
pub struct TagHandle(Option<Arc<dyn TagService>>);

impl TagHandle {
    pub fn new(service: Arc<dyn TagService>) -> Self {
        Self(Some(service))
    }

    pub fn disabled() -> Self {
        Self(None)
    }

    /// Static service from the `tags` section; disabled when the section is empty.
    pub fn from_config(raw: &HashMap<String, TagConfig>) -> Result<Self, ConfigError> {
        if raw.is_empty() {
            return Ok(Self::disabled());
        }
        Ok(Self::new(Arc::new(StaticTags::from_config(raw)?)))
    }

    pub fn is_enabled(&self) -> bool {
        self.0.is_some()
    }

    #[inline]
    pub fn has_any_tag(&self, tags: &[String], name: &str) -> bool {
        match &self.0 {
            Some(svc) if !tags.is_empty() => svc.has_any_tag(tags, name),
            _ => false,
        }
    }

    #[inline]
    pub fn network_has_tag(&self, tag: &str, ip: IpAddr) -> bool {
        self.0
            .as_ref()
            .is_some_and(|svc| svc.network_has_tag(tag, ip))
    }

    pub fn resolve_forced_subnet(&self, tag: &str, client: IpAddr) -> Option<IpAddr> {
        self.0.as_ref()?.resolve_forced_subnet(tag, client)
    }
}

impl fmt::Debug for TagHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TagHandle")
            .field(&if self.is_enabled() { "enabled" } else { "disabled" })
            .finish()
    }
}

#[derive(Debug, Default)]
struct StaticTag {
    domains: DomainSet,
    networks: Vec<IpNet>,
    ecs: Vec<EcsEntry>,
}

#[derive(Debug)]
struct EcsEntry {
    client: Option<IpNet>,
    subnet: IpAddr,
}

/// Tag service backed by the `tags` section of the configuration file.
#[derive(Debug, Default)]
pub struct StaticTags {
    tags: HashMap<String, StaticTag>,
}

impl StaticTags {
    pub fn from_config(raw: &HashMap<String, TagConfig>) -> Result<Self, ConfigError> {
        let mut tags = HashMap::with_capacity(raw.len());
        for (name, cfg) in raw {
            let mut domains = DomainSetBuilder::new();
            for d in &cfg.domains {
                if !domains.add(d) {
                    warn!(target = "tags", tag = %name, domain = %d, "not a domain name, skipped");
                }
            }
            let networks = cfg
                .networks
                .iter()
                .map(|n| parse_net(n))
                .collect::<Result<Vec<_>, _>>()?;
            let mut ecs = Vec::with_capacity(cfg.ecs.len());
            for e in &cfg.ecs {
                let client = e.client.as_deref().map(parse_net).transpose()?;
                let subnet = e
                    .subnet
                    .parse::<IpAddr>()
                    .map_err(|err| ConfigError::InvalidAddress {
                        value: e.subnet.clone(),
                        reason: err.to_string(),
                    })?;
                ecs.push(EcsEntry { client, subnet });
            }
            tags.insert(
                name.clone(),
                StaticTag {
                    domains: domains.build(),
                    networks,
                    ecs,
                },
            );
        }
        Ok(Self { tags })
    }
}

impl TagService for StaticTags {
    fn has_any_tag(&self, tags: &[String], name: &str) -> bool {
        tags.iter()
            .filter_map(|t| self.tags.get(t))
            .any(|t| t.domains.matches(name))
    }

    fn network_has_tag(&self, tag: &str, ip: IpAddr) -> bool {
        self.tags
            .get(tag)
            .is_some_and(|t| t.networks.iter().any(|n| n.contains(&ip)))
    }

    fn resolve_forced_subnet(&self, tag: &str, client: IpAddr) -> Option<IpAddr> {
        self.tags
            .get(tag)?
            .ecs
            .iter()
            .find(|e| e.client.is_none_or(|n| n.contains(&client)))
            .map(|e| e.subnet)
    }
}

/// Accepts a CIDR or a bare address (host route).
pub fn parse_net(value: &str) -> Result<IpNet, ConfigError> {
    let value = value.trim();
    value
        .parse::<IpNet>()
        .or_else(|_| value.parse::<IpAddr>().map(IpNet::from))
        .map_err(|err| ConfigError::InvalidNetwork {
            value: value.to_string(),
            reason: err.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EcsEntryConfig;

    fn sample() -> StaticTags {
        let mut raw = HashMap::new();
        raw.insert(
            "ads".to_string(),
            TagConfig {
                domains: vec!["doubleclick.net".into(), "ads.example.com".into()],
                networks: vec!["203.0.113.0/24".into()],
                ecs: vec![],
            },
        );
        raw.insert(
            "cn".to_string(),
            TagConfig {
                domains: vec!["example.cn".into()],
                networks: vec![],
                ecs: vec![
                    EcsEntryConfig {
                        client: Some("10.0.0.0/8".into()),
                        subnet: "1.2.3.0".into(),
                    },
                    EcsEntryConfig {
                        client: None,
                        subnet: "2001:db8::".into(),
                    },
                ],
            },
        );
        StaticTags::from_config(&raw).expect("static tags")
    }

    #[test]
    fn name_and_network_lookups() {
        let tags = sample();
        assert!(tags.has_any_tag(&["ads".into()], "x.doubleclick.net"));
        assert!(tags.has_any_tag(&["cn".into(), "ads".into()], "example.cn"));
        assert!(!tags.has_any_tag(&["cn".into()], "doubleclick.net"));
        assert!(!tags.has_any_tag(&["missing".into()], "doubleclick.net"));
        assert!(tags.network_has_tag("ads", "203.0.113.9".parse().unwrap()));
        assert!(!tags.network_has_tag("ads", "198.51.100.1".parse().unwrap()));
    }

    #[test]
    fn forced_subnet_uses_first_matching_entry() {
        let tags = sample();
        assert_eq!(
            tags.resolve_forced_subnet("cn", "10.1.1.1".parse().unwrap()),
            Some("1.2.3.0".parse().unwrap())
        );
        assert_eq!(
            tags.resolve_forced_subnet("cn", "192.168.1.1".parse().unwrap()),
            Some("2001:db8::".parse().unwrap())
        );
        assert_eq!(tags.resolve_forced_subnet("ads", "10.1.1.1".parse().unwrap()), None);
    }

    #[test]
    fn disabled_handle_answers_negatively() {
        let handle = TagHandle::disabled();
        assert!(!handle.is_enabled());
        assert!(!handle.has_any_tag(&["ads".into()], "doubleclick.net"));
        assert!(!handle.network_has_tag("ads", "203.0.113.9".parse().unwrap()));
        assert!(handle.resolve_forced_subnet("cn", "10.1.1.1".parse().unwrap()).is_none());
    }

    #[test]
    fn parse_net_accepts_bare_address() {
        assert_eq!(parse_net("1.2.3.4").unwrap().prefix_len(), 32);
        assert_eq!(parse_net("10.0.0.0/8").unwrap().prefix_len(), 8);
        assert!(parse_net("nope").is_err());
    }
}
