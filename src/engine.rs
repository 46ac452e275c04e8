use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use arc_swap::ArcSwap;
use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::RecordType;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain_set::normalize_qname;
use crate::ecs;
use crate::error::{ExchangeError, ForwardError};
use crate::hooks::{Hooks, QueryContext};
use crate::metrics::Metrics;
use crate::router::Router;
use crate::zone::Zone;

/// Immediate retries on a cached connection the peer has closed, per attempt.
const MAX_CLOSED_CONN_RETRIES: usize = 3;

/// What the forwarding core did with a query.
#[derive(Debug)]
pub enum Handled {
    Response(Message),
    /// No zone takes the name; the next handler decides.
    Fallthrough,
}

#[derive(Clone)]
pub struct Engine {
    router: Arc<ArcSwap<Router>>,
    hooks: Hooks,
    metrics: Arc<Metrics>,
    listener_label: Arc<str>,
}

impl Engine {
    pub fn new(
        router: Arc<ArcSwap<Router>>,
        hooks: Hooks,
        metrics: Arc<Metrics>,
        listener_label: String,
    ) -> Self {
        Self {
            router,
            hooks,
            metrics,
            listener_label: Arc::from(listener_label),
        }
    }

    /// Same engine, reporting metrics under another listener label.
    pub fn with_label(&self, listener_label: String) -> Self {
        Self {
            listener_label: Arc::from(listener_label),
            ..self.clone()
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub async fn handle_packet(&self, packet: &[u8], peer: SocketAddr) -> anyhow::Result<Bytes> {
        let req = Message::from_vec(packet).context("parse request")?;
        let resp = self.handle(&req, peer.ip()).await;
        Ok(Bytes::from(resp.to_vec().context("encode response")?))
    }

    /// Full handling of one query, including the next-handler fallback.
    pub async fn handle(&self, req: &Message, client_ip: IpAddr) -> Message {
        match self.forward(req, client_ip).await {
            Ok(Handled::Response(resp)) => resp,
            Ok(Handled::Fallthrough) => self.next_handler(req).await,
            Err(err) => {
                warn!(
                    target = "engine",
                    qname = ?req.queries().first().map(|q| q.name().to_ascii()),
                    error = %err,
                    "forward failed"
                );
                build_response(req, ResponseCode::ServFail)
            }
        }
    }

    /// Routes `req` to a zone and exchanges it there.
    pub async fn forward(&self, req: &Message, client_ip: IpAddr) -> Result<Handled, ForwardError> {
        let Some(query) = req.queries().first() else {
            return Ok(Handled::Response(build_response(req, ResponseCode::FormErr)));
        };
        let qname = normalize_qname(&query.name().to_ascii());
        let router = self.router.load_full();
        let Some(zone) = router.route(&qname, &self.metrics) else {
            return Ok(Handled::Fallthrough);
        };

        let ctx = QueryContext {
            client_ip,
            qname: &qname,
            qtype: query.query_type(),
            request: req,
        };
        self.exchange_zone(&router, zone, &ctx)
            .await
            .map(Handled::Response)
    }

    async fn exchange_zone(
        &self,
        router: &Router,
        zone: &Zone,
        ctx: &QueryContext<'_>,
    ) -> Result<Message, ForwardError> {
        let req = ctx.request;
        if zone.no_ipv6 && ctx.qtype == RecordType::AAAA {
            return Ok(build_response(req, ResponseCode::NoError));
        }

        let mut outgoing = req.clone();
        let outcome = zone
            .matchers
            .eval_query(ctx, &mut outgoing, &self.hooks, zone.debug);
        if outcome.nxdomain {
            return Ok(build_response(req, ResponseCode::NXDomain));
        }

        let settings = &router.settings;
        let backoff = Duration::from_millis(settings.retry_backoff_ms);
        let deadline = Instant::now() + Duration::from_millis(settings.exchange_timeout_ms);
        let exchanger = router.exchanger();
        let mut last_err: Option<ExchangeError> = None;

        while Instant::now() < deadline {
            let start = Instant::now();
            let host = outcome
                .to
                .as_deref()
                .and_then(|tag| zone.health.select_by_tag(tag))
                .or_else(|| zone.health.select())
                .ok_or(ForwardError::NoHealthyHost)?;
            debug!(target = "engine", zone = %zone.name, qname = %ctx.qname, host = %host, "upstream host selected");

            let mut result = exchanger.exchange(&host, &outgoing).await;
            let mut retries = 0;
            while matches!(result, Err(ExchangeError::CachedConnClosed))
                && retries < MAX_CLOSED_CONN_RETRIES
            {
                retries += 1;
                debug!(target = "engine", host = %host, retries, "cached connection closed, retrying");
                result = exchanger.exchange(&host, &outgoing).await;
            }

            let mut reply = match result {
                Ok(reply) => reply,
                Err(err) => {
                    warn!(
                        target = "engine",
                        host = %host,
                        qname = %ctx.qname,
                        error = %err,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "upstream exchange failed"
                    );
                    zone.health.report_failure(&host);
                    last_err = Some(err);
                    if Instant::now() + backoff >= deadline {
                        break;
                    }
                    tokio::time::sleep(backoff).await;
                    continue;
                }
            };

            if !reply_matches(&outgoing, &reply) {
                debug!(
                    target = "engine",
                    host = %host,
                    id = reply.id(),
                    qname = %ctx.qname,
                    qtype = %ctx.qtype,
                    "reply does not match query"
                );
                return Ok(build_response(req, ResponseCode::FormErr));
            }

            if zone
                .matchers
                .eval_answer(ctx, &reply, &self.hooks, zone.debug)
            {
                return Ok(build_response(req, ResponseCode::NXDomain));
            }
            if outcome.strip_ecs {
                ecs::strip_ecs(&mut reply);
            }

            let dur = start.elapsed();
            self.metrics
                .observe_request(&self.listener_label, &host.name, reply.response_code(), dur);
            debug!(target = "engine", host = %host, qname = %ctx.qname, upstream_ns = dur.as_nanos() as u64, "upstream call latency");
            return Ok(reply);
        }

        Err(ForwardError::DeadlineExceeded {
            last: last_err.unwrap_or(ExchangeError::Timeout(settings.exchange_timeout_ms)),
        })
    }

    /// Unmatched queries go to the fallthrough upstream, or are refused.
    async fn next_handler(&self, req: &Message) -> Message {
        let router = self.router.load_full();
        let Some(host) = router.fallthrough() else {
            return build_response(req, ResponseCode::Refused);
        };
        match router.exchanger().exchange(host, req).await {
            Ok(reply) if reply_matches(req, &reply) => reply,
            Ok(_) => build_response(req, ResponseCode::FormErr),
            Err(err) => {
                warn!(target = "engine", host = %host, error = %err, "fallthrough exchange failed");
                build_response(req, ResponseCode::ServFail)
            }
        }
    }
}

/// Same id, response bit set, and the same question (names compare case-insensitively).
fn reply_matches(req: &Message, reply: &Message) -> bool {
    if reply.message_type() != MessageType::Response || reply.id() != req.id() {
        return false;
    }
    match (req.queries().first(), reply.queries()) {
        (Some(q), [r]) => {
            q.name() == r.name() && q.query_type() == r.query_type() && q.query_class() == r.query_class()
        }
        _ => false,
    }
}

fn build_response(req: &Message, rcode: ResponseCode) -> Message {
    let mut msg = Message::new();
    msg.set_id(req.id());
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(req.recursion_desired());
    msg.set_recursion_available(true);
    msg.set_authoritative(false);
    msg.set_response_code(rcode);
    msg.add_queries(req.queries().to_vec());
    msg
}
