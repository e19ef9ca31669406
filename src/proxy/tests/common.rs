use crate::callrecord::{CallRecordEvent, CallRecordReceiver};
use crate::config::ProxyConfig;
use crate::proxy::server::{SipServer, SipServerBuilder};
use crate::proxy::user::{MemoryUserBackend, RoutingPolicy, SipUser, UserBackend};
use anyhow::Result;
use async_trait::async_trait;
use rsip::headers::UntypedHeader;
use rsip::{Header, HostWithPort, SipMessage};
use rsipstack::transaction::endpoint::EndpointInner;
use rsipstack::transaction::key::{TransactionKey, TransactionRole};
use rsipstack::transaction::random_text;
use rsipstack::transaction::transaction::Transaction;
use rsipstack::transport::channel::ChannelConnection;
use rsipstack::transport::{SipAddr, TransportLayer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

pub const WAIT: Duration = Duration::from_secs(3);
pub const QUIET: Duration = Duration::from_millis(300);

pub fn create_test_users() -> Vec<SipUser> {
    vec![
        SipUser::new(1, "alice", RoutingPolicy::Proxy),
        SipUser::new(2, "bob", RoutingPolicy::Proxy),
        SipUser::new(3, "carol", RoutingPolicy::Redirect),
    ]
}

pub fn make_branch() -> String {
    format!("z9hG4bK{}", random_text(16))
}

pub fn make_tag() -> String {
    random_text(10)
}

/// Memory backend whose lookups take `delay`, keeping requests in flight.
pub struct SlowUserBackend {
    inner: MemoryUserBackend,
    delay: Duration,
}

impl SlowUserBackend {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryUserBackend::new(Some(create_test_users())),
            delay,
        }
    }
}

#[async_trait]
impl UserBackend for SlowUserBackend {
    async fn find_by_login(&self, login: &str) -> Result<Option<SipUser>> {
        tokio::time::sleep(self.delay).await;
        self.inner.find_by_login(login).await
    }
}

/// Server transaction over an in-memory channel, for driving modules directly.
pub async fn create_transaction(request: rsip::Request) -> (Transaction, Arc<EndpointInner>) {
    let mock_addr = SipAddr {
        r#type: Some(rsip::Transport::Udp),
        addr: HostWithPort {
            host: "127.0.0.1".parse().unwrap(),
            port: Some(5060.into()),
        },
    };
    let (tx, rx) = mpsc::unbounded_channel();
    let connection = ChannelConnection::create_connection(rx, tx, mock_addr)
        .await
        .expect("failed to create channel connection");
    let transport_layer = TransportLayer::new(CancellationToken::new());
    transport_layer.add_transport(connection.into());

    let endpoint_inner = EndpointInner::new(
        "sipswitch test".to_string(),
        transport_layer,
        CancellationToken::new(),
        Some(Duration::from_millis(20)),
        vec![rsip::Method::Invite, rsip::Method::Register],
    );

    let key = TransactionKey::from_request(&request, TransactionRole::Server).unwrap();
    let tx = Transaction::new_server(key, request, endpoint_inner.clone(), None);
    (tx, endpoint_inner)
}

pub fn create_test_proxy_config() -> ProxyConfig {
    ProxyConfig {
        addr: "127.0.0.1".to_string(),
        udp_port: 0,
        in_dialog_timeout: 2,
        ..Default::default()
    }
}

pub struct TestProxy {
    pub server: Arc<SipServer>,
    pub cancel_token: CancellationToken,
    pub addr: SocketAddr,
    pub records: Mutex<CallRecordReceiver>,
}

impl TestProxy {
    pub async fn start() -> Self {
        Self::start_with_config(create_test_proxy_config()).await
    }

    pub async fn start_with_config(config: ProxyConfig) -> Self {
        Self::start_with(
            config,
            Box::new(MemoryUserBackend::new(Some(create_test_users()))),
        )
        .await
    }

    pub async fn start_with(config: ProxyConfig, user_backend: Box<dyn UserBackend>) -> Self {
        let cancel_token = CancellationToken::new();
        let (sender, receiver) = mpsc::unbounded_channel();
        let server = SipServerBuilder::new(Arc::new(config))
            .with_user_backend(user_backend)
            .with_cancel_token(cancel_token.clone())
            .with_callrecord_sender(Some(sender))
            .with_default_modules()
            .build()
            .await
            .expect("build proxy");
        let server = Arc::new(server);
        let addr = server.local_addr();
        let serving = server.clone();
        tokio::spawn(async move {
            serving.serve().await.ok();
        });
        Self {
            server,
            cancel_token,
            addr,
            records: Mutex::new(receiver),
        }
    }

    pub fn hostport(&self) -> String {
        self.addr.to_string()
    }

    pub async fn dialog_count(&self) -> usize {
        self.server.inner.dialogs.len().await
    }

    pub async fn invite_count(&self) -> usize {
        self.server.inner.invites.len().await
    }

    /// Waits for the next call record event.
    pub async fn next_record(&self) -> CallRecordEvent {
        tokio::time::timeout(WAIT, self.records.lock().await.recv())
            .await
            .expect("call record event timeout")
            .expect("call record channel closed")
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// A scripted user agent on a loopback UDP socket.
pub struct TestUa {
    pub user: String,
    pub socket: UdpSocket,
    pub addr: SocketAddr,
    pub proxy: SocketAddr,
}

impl TestUa {
    pub async fn new(user: &str, proxy: SocketAddr) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind ua");
        let addr = socket.local_addr().expect("ua addr");
        Self {
            user: user.to_string(),
            socket,
            addr,
            proxy,
        }
    }

    pub fn uri(&self) -> String {
        format!("sip:{}@{}", self.user, self.addr)
    }

    pub async fn send(&self, text: &str) {
        self.socket
            .send_to(text.as_bytes(), self.proxy)
            .await
            .expect("send datagram");
    }

    pub async fn recv(&self, wait: Duration) -> Option<SipMessage> {
        let mut buf = vec![0u8; 65535];
        loop {
            let (len, _) = tokio::time::timeout(wait, self.socket.recv_from(&mut buf))
                .await
                .ok()?
                .ok()?;
            let text = String::from_utf8_lossy(&buf[..len]).to_string();
            if text.trim().is_empty() {
                continue;
            }
            return Some(SipMessage::try_from(text.as_str()).expect("parse SIP message"));
        }
    }

    pub async fn recv_response(&self) -> rsip::Response {
        match self.recv(WAIT).await {
            Some(SipMessage::Response(response)) => response,
            other => panic!("{}: expected response, got {:?}", self.user, other),
        }
    }

    pub async fn recv_request(&self) -> rsip::Request {
        match self.recv(WAIT).await {
            Some(SipMessage::Request(request)) => request,
            other => panic!("{}: expected request, got {:?}", self.user, other),
        }
    }

    /// Skips responses until one with `code` for `method` arrives.
    pub async fn recv_final(&self, method: rsip::Method, code: u16) -> rsip::Response {
        loop {
            let response = self.recv_response().await;
            let cseq_method = crate::proxy::transform::cseq(&response.headers).map(|c| c.method);
            if response.status_code.code() == code && cseq_method == Some(method) {
                return response;
            }
        }
    }

    pub async fn expect_silence(&self) {
        if let Some(message) = self.recv(QUIET).await {
            panic!("{}: expected nothing, got {:?}", self.user, message);
        }
    }

    pub fn register_text(&self, proxy: &str, extra: &str) -> String {
        format!(
            "REGISTER sip:{proxy} SIP/2.0\r\n\
             Via: SIP/2.0/UDP {addr};branch={branch};rport\r\n\
             Max-Forwards: 70\r\n\
             From: <sip:{user}@{proxy}>;tag={tag}\r\n\
             To: <sip:{user}@{proxy}>\r\n\
             Call-ID: {call_id}\r\n\
             CSeq: 1 REGISTER\r\n\
             Contact: <{uri}>\r\n\
             {extra}\
             Content-Length: 0\r\n\r\n",
            proxy = proxy,
            addr = self.addr,
            branch = make_branch(),
            user = self.user,
            tag = make_tag(),
            call_id = make_tag(),
            uri = self.uri(),
            extra = extra,
        )
    }

    pub async fn register(&self) -> rsip::Response {
        let text = self.register_text(&self.proxy.to_string(), "");
        self.send(&text).await;
        self.recv_response().await
    }

    pub fn invite_text(&self, callee: &str, call: &CallIds, extra: &str) -> String {
        format!(
            "INVITE sip:{callee}@{proxy} SIP/2.0\r\n\
             Via: SIP/2.0/UDP {addr};branch={branch};rport\r\n\
             {extra}\
             From: <sip:{user}@{proxy}>;tag={tag}\r\n\
             To: <sip:{callee}@{proxy}>\r\n\
             Call-ID: {call_id}\r\n\
             CSeq: 1 INVITE\r\n\
             Contact: <{uri}>\r\n\
             Content-Length: 0\r\n\r\n",
            callee = callee,
            proxy = self.proxy,
            addr = self.addr,
            branch = call.branch,
            extra = extra,
            user = self.user,
            tag = call.from_tag,
            call_id = call.call_id,
            uri = self.uri(),
        )
    }

    pub fn cancel_text(&self, callee: &str, call: &CallIds) -> String {
        format!(
            "CANCEL sip:{callee}@{proxy} SIP/2.0\r\n\
             Via: SIP/2.0/UDP {addr};branch={branch};rport\r\n\
             Max-Forwards: 70\r\n\
             From: <sip:{user}@{proxy}>;tag={tag}\r\n\
             To: <sip:{callee}@{proxy}>\r\n\
             Call-ID: {call_id}\r\n\
             CSeq: 1 CANCEL\r\n\
             Content-Length: 0\r\n\r\n",
            callee = callee,
            proxy = self.proxy,
            addr = self.addr,
            branch = call.branch,
            user = self.user,
            tag = call.from_tag,
            call_id = call.call_id,
        )
    }

    /// In-dialog request routed through the proxy.
    pub fn in_dialog_text(
        &self,
        method: &str,
        target: &str,
        call: &CallIds,
        remote_tag: &str,
        cseq: u32,
    ) -> String {
        format!(
            "{method} {target} SIP/2.0\r\n\
             Via: SIP/2.0/UDP {addr};branch={branch};rport\r\n\
             Max-Forwards: 70\r\n\
             Route: <sip:{proxy};lr>\r\n\
             From: <sip:{user}@{proxy}>;tag={tag}\r\n\
             To: <sip:remote@{proxy}>;tag={remote_tag}\r\n\
             Call-ID: {call_id}\r\n\
             CSeq: {cseq} {method}\r\n\
             Content-Length: 0\r\n\r\n",
            method = method,
            target = target,
            addr = self.addr,
            branch = make_branch(),
            proxy = self.proxy,
            user = self.user,
            tag = call.from_tag,
            remote_tag = remote_tag,
            call_id = call.call_id,
            cseq = cseq,
        )
    }

    /// Answers `request` the way a UAS would, echoing its Via stack.
    pub async fn reply(&self, request: &rsip::Request, code: u16, reason: &str, to_tag: Option<&str>) {
        self.reply_with(request, code, reason, to_tag, &[]).await
    }

    /// Like `reply`, with `extra` header lines placed before the echoed ones.
    pub async fn reply_with(
        &self,
        request: &rsip::Request,
        code: u16,
        reason: &str,
        to_tag: Option<&str>,
        extra: &[&str],
    ) {
        let mut text = format!("SIP/2.0 {} {}\r\n", code, reason);
        for line in extra {
            text.push_str(line);
            text.push_str("\r\n");
        }
        for header in request.headers.iter() {
            match header {
                Header::Via(via) => text.push_str(&format!("Via: {}\r\n", via.value())),
                Header::From(from) => text.push_str(&format!("From: {}\r\n", from.value())),
                Header::CallId(call_id) => {
                    text.push_str(&format!("Call-ID: {}\r\n", call_id.value()))
                }
                Header::CSeq(cseq) => text.push_str(&format!("CSeq: {}\r\n", cseq.value())),
                Header::RecordRoute(rr) => {
                    text.push_str(&format!("Record-Route: {}\r\n", rr.value()))
                }
                Header::To(to) => match to_tag {
                    Some(tag) if !to.value().contains(";tag=") => {
                        text.push_str(&format!("To: {};tag={}\r\n", to.value(), tag))
                    }
                    _ => text.push_str(&format!("To: {}\r\n", to.value())),
                },
                _ => {}
            }
        }
        if (200..300).contains(&code) && request.method == rsip::Method::Invite {
            text.push_str(&format!("Contact: <{}>\r\n", self.uri()));
        }
        text.push_str("Content-Length: 0\r\n\r\n");
        self.send(&text).await;
    }
}

/// Identifiers of one call attempt from the caller's side.
pub struct CallIds {
    pub call_id: String,
    pub branch: String,
    pub from_tag: String,
}

impl CallIds {
    pub fn new() -> Self {
        Self {
            call_id: format!("{}@test", make_tag()),
            branch: make_branch(),
            from_tag: make_tag(),
        }
    }
}

/// Registers alice and bob and returns their agents.
pub async fn register_pair(proxy: &TestProxy) -> (TestUa, TestUa) {
    let alice = TestUa::new("alice", proxy.addr).await;
    let bob = TestUa::new("bob", proxy.addr).await;
    assert_eq!(alice.register().await.status_code.code(), 200);
    assert_eq!(bob.register().await.status_code.code(), 200);
    (alice, bob)
}

pub fn parse_request(text: &str) -> rsip::Request {
    match SipMessage::try_from(text) {
        Ok(SipMessage::Request(request)) => request,
        other => panic!("not a request: {:?}", other),
    }
}

pub fn parse_response(text: &str) -> rsip::Response {
    match SipMessage::try_from(text) {
        Ok(SipMessage::Response(response)) => response,
        other => panic!("not a response: {:?}", other),
    }
}
