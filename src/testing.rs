//! Test doubles shared by the unit tests.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record};

use crate::error::ExchangeError;
use crate::host::{Endpoint, Proto, TransportOptions, UpstreamHost};
use crate::transport::Exchanger;

type Handler = dyn Fn(&UpstreamHost, &Message) -> Result<Message, ExchangeError> + Send + Sync;

/// Exchanger answering from a closure and recording every host it was asked to contact.
pub struct ScriptedExchanger {
    handler: Box<Handler>,
    calls: Mutex<Vec<String>>,
    count: AtomicUsize,
}

impl ScriptedExchanger {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&UpstreamHost, &Message) -> Result<Message, ExchangeError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
            count: AtomicUsize::new(0),
        })
    }

    /// Every host answers NOERROR with one A record `192.0.2.1`.
    pub fn answering() -> Arc<Self> {
        Self::new(|_, req| Ok(reply_with_a(req, Ipv4Addr::new(192, 0, 2, 1))))
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Exchanger for ScriptedExchanger {
    async fn exchange(&self, host: &UpstreamHost, req: &Message) -> Result<Message, ExchangeError> {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push(host.name.clone());
        (self.handler)(host, req)
    }
}

/// Response echoing id and question of `req`.
pub fn reply(req: &Message, rcode: ResponseCode) -> Message {
    let mut msg = Message::new();
    msg.set_id(req.id());
    msg.set_message_type(MessageType::Response);
    msg.set_recursion_desired(req.recursion_desired());
    msg.set_recursion_available(true);
    msg.set_response_code(rcode);
    msg.add_queries(req.queries().to_vec());
    msg
}

pub fn reply_with_a(req: &Message, ip: Ipv4Addr) -> Message {
    let mut msg = reply(req, ResponseCode::NoError);
    if let Some(q) = req.queries().first() {
        msg.add_answer(Record::from_rdata(q.name().clone(), 60, RData::A(A(ip))));
    }
    msg
}

pub fn test_host(addr: &str, tag: Option<&str>) -> Arc<UpstreamHost> {
    let addr: SocketAddr = addr.parse().unwrap();
    Arc::new(UpstreamHost::new(
        Proto::Dns,
        Endpoint::Socket(addr),
        None,
        tag.map(str::to_string),
        Arc::new(TransportOptions::default()),
    ))
}
