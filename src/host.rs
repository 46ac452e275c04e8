use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use reqwest::Url;
use tokio::sync::{Mutex, OnceCell};

use crate::config::HostConfig;
use crate::domain_set::normalize_domain;
use crate::error::ConfigError;
use crate::transport::CachedConn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    /// Classic DNS: UDP exchange.
    Dns,
    Udp,
    Tcp,
    Tls,
    Https,
}

impl Proto {
    fn default_port(self) -> u16 {
        match self {
            Proto::Tls => 853,
            Proto::Https => 443,
            _ => 53,
        }
    }
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Proto::Dns => "dns",
            Proto::Udp => "udp",
            Proto::Tcp => "tcp",
            Proto::Tls => "tls",
            Proto::Https => "https",
        })
    }
}

/// Where an exchange is sent.
#[derive(Debug, Clone)]
pub enum Endpoint {
    Socket(SocketAddr),
    Url(Url),
}

/// Transport settings shared by every host of one zone.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub timeout: Duration,
    /// Cached connections older than this are replaced. Zero keeps them forever.
    pub expire: Duration,
    pub bootstrap: Vec<SocketAddr>,
    pub no_ipv6: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            expire: Duration::from_secs(10),
            bootstrap: Vec::new(),
            no_ipv6: false,
        }
    }
}

/// One destination endpoint of a zone.
pub struct UpstreamHost {
    pub name: String,
    pub proto: Proto,
    pub endpoint: Endpoint,
    pub tls_server_name: Option<String>,
    /// Tag rules use to address this host directly.
    pub tag: Option<String>,
    pub opts: Arc<TransportOptions>,
    fails: AtomicI32,
    pub(crate) conn: Mutex<Option<CachedConn>>,
    pub(crate) doh: OnceCell<reqwest::Client>,
}

impl UpstreamHost {
    pub fn new(
        proto: Proto,
        endpoint: Endpoint,
        tls_server_name: Option<String>,
        tag: Option<String>,
        opts: Arc<TransportOptions>,
    ) -> Self {
        let name = match &endpoint {
            Endpoint::Socket(addr) => format!("{proto}://{addr}"),
            Endpoint::Url(url) => url.to_string(),
        };
        Self {
            name,
            proto,
            endpoint,
            tls_server_name,
            tag,
            opts,
            fails: AtomicI32::new(0),
            conn: Mutex::new(None),
            doh: OnceCell::new(),
        }
    }

    /// Parses one `to` entry. `zone_server_name` is the zone-wide TLS server name.
    pub fn from_config(
        raw: &HostConfig,
        zone_server_name: Option<&str>,
        opts: Arc<TransportOptions>,
    ) -> Result<Self, ConfigError> {
        let (target, tag, host_server_name) = match raw {
            HostConfig::Plain(s) => (s.as_str(), None, None),
            HostConfig::Detailed {
                addr,
                tag,
                tls_servername,
            } => (addr.as_str(), tag.clone(), tls_servername.as_deref()),
        };
        let target = target.trim();
        let (proto, rest) = split_scheme(target)?;

        if proto == Proto::Https {
            let url = Url::parse(target).map_err(|err| ConfigError::InvalidUrl {
                url: target.to_string(),
                reason: err.to_string(),
            })?;
            let Some(host) = url.host_str() else {
                return Err(ConfigError::InvalidUrl {
                    url: target.to_string(),
                    reason: "missing host".to_string(),
                });
            };
            let server_name = Some(host.trim_matches(['[', ']']).to_string());
            return Ok(Self::new(proto, Endpoint::Url(url), server_name, tag, opts));
        }

        let (addr, at_name) = match rest.split_once('@') {
            Some((addr, name)) => (addr, Some(name)),
            None => (rest, None),
        };
        let addr = parse_host_port(addr, proto.default_port())?;

        let tls_server_name = if proto == Proto::Tls {
            // per-host setting > @servername > zone setting / 单主机设置 > @servername > 区域设置
            match host_server_name.or(at_name).or(zone_server_name) {
                Some(name) => Some(
                    normalize_domain(name)
                        .ok_or_else(|| ConfigError::InvalidServerName(name.to_string()))?,
                ),
                None => None,
            }
        } else {
            None
        };

        Ok(Self::new(
            proto,
            Endpoint::Socket(addr),
            tls_server_name,
            tag,
            opts,
        ))
    }

    #[inline]
    pub fn fails(&self) -> i32 {
        self.fails.load(Ordering::Acquire)
    }

    /// Returns the counter value after the increment.
    #[inline]
    pub fn add_fail(&self) -> i32 {
        self.fails.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements only if the counter is positive.
    pub fn relieve(&self) {
        let _ = self
            .fails
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > 0).then_some(n - 1)
            });
    }

    /// Healthy while the counter is below `max_fails`; `0` disables the check.
    #[inline]
    pub fn is_eligible(&self, max_fails: u32) -> bool {
        max_fails == 0 || self.fails() < max_fails as i32
    }

    #[cfg(test)]
    pub fn set_fails(&self, n: i32) {
        self.fails.store(n, Ordering::Release);
    }

    /// Drops the cached stream connection, if nobody is using it.
    pub fn release_conn(&self) {
        if let Ok(mut slot) = self.conn.try_lock() {
            slot.take();
        }
    }
}

impl fmt::Debug for UpstreamHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamHost")
            .field("name", &self.name)
            .field("tls_server_name", &self.tls_server_name)
            .field("tag", &self.tag)
            .field("fails", &self.fails())
            .finish()
    }
}

impl fmt::Display for UpstreamHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

fn split_scheme(target: &str) -> Result<(Proto, &str), ConfigError> {
    let Some((scheme, rest)) = target.split_once("://") else {
        return Ok((Proto::Dns, target));
    };
    let proto = match scheme.to_ascii_lowercase().as_str() {
        "dns" => Proto::Dns,
        "udp" => Proto::Udp,
        "tcp" => Proto::Tcp,
        "tls" => Proto::Tls,
        "https" => Proto::Https,
        _ => return Err(ConfigError::UnsupportedScheme(scheme.to_string())),
    };
    Ok((proto, rest))
}

/// `ip`, `ip:port`, `[v6]` or `[v6]:port`.
pub fn parse_host_port(value: &str, default_port: u16) -> Result<SocketAddr, ConfigError> {
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let bare = value.trim_start_matches('[').trim_end_matches(']');
    bare.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, default_port))
        .map_err(|_| ConfigError::NotAnIpAddress(value.to_string()))
}
