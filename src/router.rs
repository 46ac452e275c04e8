use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::{ForwardConfig, GlobalSettings, HostConfig};
use crate::error::ConfigError;
use crate::host::{TransportOptions, UpstreamHost};
use crate::metrics::Metrics;
use crate::tags::TagHandle;
use crate::transport::Exchanger;
use crate::zone::Zone;

/// Ordered zone list compiled from one configuration document.
///
/// Routing is first-match in declaration order, not longest-suffix: operators
/// express precedence by the order of `zones`.
pub struct Router {
    pub settings: GlobalSettings,
    zones: Vec<Zone>,
    fallthrough: Option<Arc<UpstreamHost>>,
    exchanger: Arc<dyn Exchanger>,
}

impl Router {
    pub fn new(
        settings: GlobalSettings,
        zones: Vec<Zone>,
        fallthrough: Option<Arc<UpstreamHost>>,
        exchanger: Arc<dyn Exchanger>,
    ) -> Self {
        Self {
            settings,
            zones,
            fallthrough,
            exchanger,
        }
    }

    pub fn from_config(
        cfg: &ForwardConfig,
        tags: TagHandle,
        exchanger: Arc<dyn Exchanger>,
    ) -> Result<Self, ConfigError> {
        if cfg.zones.is_empty() {
            return Err(ConfigError::NoZones);
        }
        let zones = cfg
            .zones
            .iter()
            .map(|z| Zone::from_config(z, &cfg.settings, tags.clone(), exchanger.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(pos) = zones.iter().position(Zone::is_match_any) {
            if pos + 1 < zones.len() {
                warn!(target = "router", zone = %zones[pos].name, "zones after a match-all zone only see its except names");
            }
        }

        let fallthrough = match cfg.settings.fallthrough.as_deref() {
            Some(raw) => {
                let opts = Arc::new(TransportOptions {
                    timeout: Duration::from_millis(cfg.settings.attempt_timeout_ms),
                    ..TransportOptions::default()
                });
                Some(Arc::new(UpstreamHost::from_config(
                    &HostConfig::Plain(raw.to_string()),
                    None,
                    opts,
                )?))
            }
            None => None,
        };

        info!(
            target = "router",
            zones = zones.len(),
            fallthrough = ?fallthrough.as_ref().map(|h| h.name.as_str()),
            "router compiled"
        );
        Ok(Self::new(cfg.settings.clone(), zones, fallthrough, exchanger))
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn exchanger(&self) -> &Arc<dyn Exchanger> {
        &self.exchanger
    }

    pub fn fallthrough(&self) -> Option<&Arc<UpstreamHost>> {
        self.fallthrough.as_ref()
    }

    /// First zone taking `name` (lower-cased, no trailing dot). Lookup time is
    /// recorded as a hit or a miss.
    pub fn route(&self, name: &str, metrics: &Metrics) -> Option<&Zone> {
        let start = Instant::now();
        let zone = self.zones.iter().find(|z| z.matches(name));
        metrics.observe_lookup(zone.is_some(), start.elapsed());
        if zone.is_none() {
            debug!(target = "router", qname = %name, "no zone matched");
        }
        zone
    }

    /// Starts health checking of every zone.
    pub fn start(&self) {
        for zone in &self.zones {
            zone.start();
        }
    }

    pub fn stop(&self) {
        for zone in &self.zones {
            zone.stop();
        }
        if let Some(host) = &self.fallthrough {
            host.release_conn();
        }
    }
}
