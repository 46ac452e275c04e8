mod config;
mod domain_set;
mod ecs;
mod engine;
mod error;
mod health;
mod hooks;
mod host;
mod matcher;
mod metrics;
mod router;
mod tags;
#[cfg(test)]
mod testing;
mod transport;
mod watcher;
mod zone;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use arc_swap::ArcSwap;
use clap::Parser;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::load_config;
use crate::engine::Engine;
use crate::hooks::{DEFAULT_COLLECTION_LIMIT, Hooks, MemoryCollections};
use crate::metrics::Metrics;
use crate::router::Router;
use crate::tags::TagHandle;
use crate::transport::{Exchanger, TransportExchanger, send_with_length_prefix};

#[derive(Parser, Debug)]
#[command(author, version, about = "Zone-based DNS forwarder with health-checked upstreams", long_about = None)]
struct Args {
    /// 配置文件路径（JSON）
    #[arg(short = 'c', long = "config", default_value = "config/forward.json")]
    config: PathBuf,
    /// 启用调试日志
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
    /// UDP worker 数量，默认等于 CPU 核数
    #[arg(long = "udp-workers", default_value_t = 0)]
    udp_workers: usize,
    /// 在内存中保留规则 ipset 集合，退出时输出统计
    #[arg(long = "collect-ips", default_value_t = false)]
    collect_ips: bool,
    /// 每个 ipset 集合最多保留的地址数
    #[arg(long = "collect-ips-limit", default_value_t = DEFAULT_COLLECTION_LIMIT)]
    collect_ips_limit: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let cfg = load_config(&args.config).context("load initial config")?;
    let tags = TagHandle::from_config(&cfg.tags).context("compile tags")?;
    let exchanger: Arc<dyn Exchanger> = Arc::new(TransportExchanger);
    let router = Router::from_config(&cfg, tags, exchanger.clone()).context("compile zones")?;
    let bind_udp: SocketAddr = cfg.settings.bind_udp.parse().context("parse bind addr")?;
    let bind_tcp: SocketAddr = cfg
        .settings
        .bind_tcp
        .parse()
        .context("parse tcp bind addr")?;

    router.start();
    let router = Arc::new(ArcSwap::from_pointee(router));
    let collected = args
        .collect_ips
        .then(|| Arc::new(MemoryCollections::with_limit(args.collect_ips_limit)));
    let hooks = match &collected {
        Some(sets) => Hooks {
            collections: sets.clone(),
            ..Hooks::default()
        },
        None => Hooks::default(),
    };
    let engine = Engine::new(
        router.clone(),
        hooks,
        Arc::new(Metrics::new()),
        format!("udp://{bind_udp}"),
    );

    watcher::spawn(
        args.config.clone(),
        router.clone(),
        exchanger,
        tokio::runtime::Handle::current(),
    );

    let udp_workers = if args.udp_workers > 0 {
        args.udp_workers
    } else {
        num_cpus::get()
    };

    info!(bind_udp = %bind_udp, bind_tcp = %bind_tcp, udp_workers, "dns forwarder started");

    #[cfg(unix)]
    {
        // One SO_REUSEPORT socket per worker, the kernel spreads packets / 每个 worker 一个 SO_REUSEPORT socket，由内核分发
        for worker_id in 0..udp_workers {
            let engine = engine.clone();
            let std_socket = create_reuseport_udp_socket(bind_udp)
                .with_context(|| format!("create udp socket for worker {worker_id}"))?;
            let socket = UdpSocket::from_std(std_socket)?;
            tokio::spawn(async move {
                if let Err(err) = run_udp_worker(Arc::new(socket), engine).await {
                    error!(worker_id, error = %err, "udp worker exited");
                }
            });
        }
    }

    #[cfg(not(unix))]
    {
        use socket2::{Domain, Protocol, Socket, Type};
        let domain = if bind_udp.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create socket")?;
        let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
        let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
        socket.set_nonblocking(true).context("set nonblocking")?;
        socket.bind(&bind_udp.into()).context("bind socket")?;

        let udp_socket = Arc::new(UdpSocket::from_std(socket.into()).context("from_std")?);
        for worker_id in 0..udp_workers {
            let engine = engine.clone();
            let socket = Arc::clone(&udp_socket);
            tokio::spawn(async move {
                if let Err(err) = run_udp_worker(socket, engine).await {
                    error!(worker_id, error = %err, "udp worker exited");
                }
            });
        }
    }

    let tcp_listener = TcpListener::bind(bind_tcp)
        .await
        .context("bind tcp listener")?;
    let tcp_engine = engine.with_label(format!("tcp://{bind_tcp}"));
    let tcp_handle = tokio::spawn(async move {
        if let Err(err) = run_tcp(tcp_listener, tcp_engine).await {
            error!(error = %err, "tcp server exited");
        }
    });

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("listen for ctrl-c")?;
            info!("shutting down");
        }
        _ = tcp_handle => {}
    }

    router.load().stop();
    info!(metrics = %engine.metrics().snapshot(), "final metrics");
    if let Some(sets) = &collected {
        info!(collections = %sets.summary(), "collected addresses");
    }
    Ok(())
}

fn init_tracing(debug: bool) {
    // Only warn unless debug, to keep logging cheap / 非 debug 仅 warn，降低日志开销
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_level(debug);

    let level = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

#[cfg(unix)]
fn create_reuseport_udp_socket(addr: SocketAddr) -> anyhow::Result<std::net::UdpSocket> {
    use libc::{SO_REUSEPORT, SOL_SOCKET, c_int, c_void, setsockopt, socklen_t};
    use socket2::{Domain, Protocol, Socket, Type};
    use std::os::unix::io::AsRawFd;

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    let val: c_int = 1;
    let ret = unsafe {
        setsockopt(
            socket.as_raw_fd(),
            SOL_SOCKET,
            SO_REUSEPORT,
            &val as *const _ as *const c_void,
            std::mem::size_of_val(&val) as socklen_t,
        )
    };
    if ret != 0 {
        // Non-fatal: one worker still gets all packets / 非致命：单个 worker 仍可收到全部报文
        debug!(addr = %addr, "SO_REUSEPORT unavailable");
    }
    let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
    let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Receives datagrams and forwards each on its own task.
async fn run_udp_worker(socket: Arc<UdpSocket>, engine: Engine) -> anyhow::Result<()> {
    let mut buf = vec![0u8; 4096];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(err) => {
                debug!(error = %err, "udp recv failed");
                continue;
            }
        };
        let packet = buf[..len].to_vec();
        let engine = engine.clone();
        let socket = Arc::clone(&socket);
        tokio::spawn(async move {
            match engine.handle_packet(&packet, peer).await {
                Ok(resp) => {
                    let _ = socket.send_to(&resp, peer).await;
                }
                Err(err) => debug!(peer = %peer, error = %err, "dropping malformed packet"),
            }
        });
    }
}

async fn run_tcp(listener: TcpListener, engine: Engine) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let engine = engine.clone();
        tokio::spawn(async move {
            let _ = handle_tcp_conn(stream, peer, engine).await;
        });
    }
}

async fn handle_tcp_conn(
    mut stream: TcpStream,
    peer: SocketAddr,
    engine: Engine,
) -> anyhow::Result<()> {
    const MAX_TCP_FRAME: usize = 64 * 1024;
    let mut len_buf = [0u8; 2];

    loop {
        if let Err(err) = stream.read_exact(&mut len_buf).await {
            if err.kind() != std::io::ErrorKind::UnexpectedEof {
                return Err(err.into());
            }
            return Ok(());
        }
        let frame_len = u16::from_be_bytes(len_buf) as usize;
        if frame_len == 0 || frame_len > MAX_TCP_FRAME {
            return Ok(());
        }

        let mut buf = vec![0u8; frame_len];
        if stream.read_exact(&mut buf).await.is_err() {
            return Ok(());
        }

        let resp = match engine.handle_packet(&buf, peer).await {
            Ok(r) => r,
            Err(_) => return Ok(()),
        };

        send_with_length_prefix(&mut stream, &resp).await?;
    }
}
