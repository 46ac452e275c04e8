use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use reqwest::Url;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{Instant, timeout};
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::debug;

use crate::error::ExchangeError;
use crate::host::{Endpoint, Proto, UpstreamHost};

const MAX_UDP_PAYLOAD: usize = 65_535;
const DNS_MESSAGE: &str = "application/dns-message";

/// Sends one query to one host and returns its reply.
///
/// A reply is returned as received; matching it against the query is the
/// caller's business.
#[async_trait]
pub trait Exchanger: Send + Sync {
    async fn exchange(&self, host: &UpstreamHost, req: &Message) -> Result<Message, ExchangeError>;
}

/// Network-backed exchanger speaking plain DNS, DNS over TCP/TLS and DoH.
#[derive(Debug, Default)]
pub struct TransportExchanger;

#[async_trait]
impl Exchanger for TransportExchanger {
    async fn exchange(&self, host: &UpstreamHost, req: &Message) -> Result<Message, ExchangeError> {
        let packet = req.to_vec()?;
        let limit = host.opts.timeout;
        let fut = async {
            match (host.proto, &host.endpoint) {
                (Proto::Dns | Proto::Udp, Endpoint::Socket(addr)) => {
                    udp_exchange(*addr, &packet).await
                }
                (Proto::Tcp | Proto::Tls, Endpoint::Socket(addr)) => {
                    stream_exchange(host, *addr, &packet).await
                }
                (Proto::Https, Endpoint::Url(url)) => doh_exchange(host, url, &packet).await,
                _ => Err(ExchangeError::Proto(format!(
                    "{} endpoint does not fit its transport",
                    host.name
                ))),
            }
        };
        let bytes = timeout(limit, fut)
            .await
            .map_err(|_| ExchangeError::Timeout(limit.as_millis() as u64))??;
        Ok(Message::from_vec(&bytes)?)
    }
}

/// Builds a standard query with a random id.
pub fn build_query(name: Name, qtype: RecordType, recursion_desired: bool) -> Message {
    let mut msg = Message::new();
    msg.set_id(fastrand::u16(..));
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(recursion_desired);
    msg.add_query(Query::query(name, qtype));
    msg
}

async fn udp_exchange(addr: SocketAddr, packet: &[u8]) -> Result<Vec<u8>, ExchangeError> {
    let bind: SocketAddr = match addr {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(addr).await?;
    socket.send(packet).await?;
    let mut buf = vec![0u8; MAX_UDP_PAYLOAD];
    let len = socket.recv(&mut buf).await?;
    buf.truncate(len);
    Ok(buf)
}

pub(crate) enum Stream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// A stream connection parked on its host between exchanges.
pub struct CachedConn {
    stream: Stream,
    created: Instant,
}

impl CachedConn {
    fn expired(&self, expire: Duration) -> bool {
        !expire.is_zero() && self.created.elapsed() >= expire
    }

    async fn connect(host: &UpstreamHost, addr: SocketAddr) -> Result<Self, ExchangeError> {
        let tcp = TcpStream::connect(addr).await?;
        tcp.set_nodelay(true)?;
        let stream = match host.proto {
            Proto::Tls => {
                let server_name = match &host.tls_server_name {
                    Some(name) => ServerName::try_from(name.clone())
                        .map_err(|e| ExchangeError::Tls(format!("{name}: {e}")))?,
                    None => ServerName::from(addr.ip()),
                };
                let tls = TlsConnector::from(TLS_CONFIG.clone())
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| ExchangeError::Tls(e.to_string()))?;
                Stream::Tls(Box::new(tls))
            }
            _ => Stream::Tcp(tcp),
        };
        debug!(target = "transport", host = %host, "stream connection established");
        Ok(Self {
            stream,
            created: Instant::now(),
        })
    }

    async fn roundtrip(&mut self, packet: &[u8]) -> io::Result<Vec<u8>> {
        match &mut self.stream {
            Stream::Tcp(s) => framed_roundtrip(s, packet).await,
            Stream::Tls(s) => framed_roundtrip(s.as_mut(), packet).await,
        }
    }
}

static TLS_CONFIG: LazyLock<Arc<rustls::ClientConfig>> = LazyLock::new(|| {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
});

async fn stream_exchange(
    host: &UpstreamHost,
    addr: SocketAddr,
    packet: &[u8],
) -> Result<Vec<u8>, ExchangeError> {
    // Take the connection out so no other query can use it meanwhile / 取出连接，期间其他查询无法使用
    let cached = host
        .conn
        .lock()
        .await
        .take()
        .filter(|c| !c.expired(host.opts.expire));
    let reused = cached.is_some();
    let mut conn = match cached {
        Some(conn) => conn,
        None => CachedConn::connect(host, addr).await?,
    };

    match conn.roundtrip(packet).await {
        Ok(reply) => {
            let mut slot = host.conn.lock().await;
            if slot.is_none() {
                *slot = Some(conn);
            }
            Ok(reply)
        }
        Err(err) if reused && is_peer_closed(&err) => {
            debug!(target = "transport", host = %host, error = %err, "cached connection closed by peer");
            Err(ExchangeError::CachedConnClosed)
        }
        Err(err) => Err(err.into()),
    }
}

fn is_peer_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

async fn framed_roundtrip<S>(stream: &mut S, packet: &[u8]) -> io::Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_with_length_prefix(stream, packet).await?;
    read_with_length_prefix(stream).await
}

pub async fn send_with_length_prefix<S>(stream: &mut S, packet: &[u8]) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let len = u16::try_from(packet.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "message exceeds 65535 bytes"))?;
    let mut framed = Vec::with_capacity(packet.len() + 2);
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(packet);
    stream.write_all(&framed).await?;
    stream.flush().await
}

pub async fn read_with_length_prefix<S>(stream: &mut S) -> io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let len = stream.read_u16().await? as usize;
    if len == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "zero length message"));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn doh_exchange(host: &UpstreamHost, url: &Url, packet: &[u8]) -> Result<Vec<u8>, ExchangeError> {
    let client = host
        .doh
        .get_or_try_init(|| build_doh_client(host, url))
        .await?;
    let resp = client
        .post(url.clone())
        .header(CONTENT_TYPE, DNS_MESSAGE)
        .header(ACCEPT, DNS_MESSAGE)
        .body(packet.to_vec())
        .send()
        .await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(ExchangeError::Http(format!("{url} returned HTTP {status}")));
    }
    Ok(resp.bytes().await?.to_vec())
}

async fn build_doh_client(host: &UpstreamHost, url: &Url) -> Result<reqwest::Client, ExchangeError> {
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .timeout(host.opts.timeout);
    if let Some(domain) = url.domain() {
        if !host.opts.bootstrap.is_empty() {
            let ips = bootstrap_lookup(domain, &host.opts.bootstrap, host.opts.no_ipv6).await?;
            let port = url.port_or_known_default().unwrap_or(443);
            let addrs: Vec<SocketAddr> = ips.into_iter().map(|ip| SocketAddr::new(ip, port)).collect();
            debug!(target = "transport", domain = %domain, addrs = ?addrs, "bootstrap resolved");
            builder = builder.resolve_to_addrs(domain, &addrs);
        }
    }
    Ok(builder.build()?)
}

/// Resolves `domain` through the first bootstrap server that yields an address.
pub async fn bootstrap_lookup(
    domain: &str,
    servers: &[SocketAddr],
    no_ipv6: bool,
) -> Result<Vec<IpAddr>, ExchangeError> {
    let name = Name::from_utf8(domain)?;
    let qtypes: &[RecordType] = if no_ipv6 {
        &[RecordType::A]
    } else {
        &[RecordType::A, RecordType::AAAA]
    };

    let mut last_err = None;
    for server in servers {
        let mut ips = Vec::new();
        for qtype in qtypes {
            let query = build_query(name.clone(), *qtype, true);
            let reply = match udp_exchange(*server, &query.to_vec()?).await {
                Ok(bytes) => Message::from_vec(&bytes)?,
                Err(err) => {
                    last_err = Some(err);
                    continue;
                }
            };
            for rec in reply.answers() {
                match rec.data() {
                    Some(RData::A(a)) => ips.push(IpAddr::V4(a.0)),
                    Some(RData::AAAA(aaaa)) => ips.push(IpAddr::V6(aaaa.0)),
                    _ => {}
                }
            }
        }
        if !ips.is_empty() {
            return Ok(ips);
        }
    }
    Err(last_err.unwrap_or_else(|| {
        ExchangeError::Proto(format!("bootstrap lookup of {domain} returned no address"))
    }))
}
