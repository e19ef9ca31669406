use super::{
    FnCreateProxyModule, ProxyAction, ProxyModule,
    call::CallModule,
    dialog::DialogTable,
    invite::InviteTable,
    locator::{Locator, MemoryLocator},
    registrar::RegistrarModule,
    transform,
    user::{MemoryUserBackend, UserBackend},
};
use crate::{
    callrecord::{CallRecordEvent, CallRecordSender},
    config::ProxyConfig,
    error::ProxyError,
};
use anyhow::{Result, anyhow};
use rsipstack::{
    EndpointBuilder,
    transaction::{
        Endpoint, TransactionReceiver,
        endpoint::EndpointInner,
        key::{TransactionKey, TransactionRole},
        transaction::Transaction,
    },
    transport::{SipAddr, TransportLayer, udp::UdpConnection},
};
use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct SipServerInner {
    pub cancel_token: CancellationToken,
    pub config: Arc<ProxyConfig>,
    pub user_backend: Arc<Box<dyn UserBackend>>,
    pub locator: Arc<Box<dyn Locator>>,
    pub invites: InviteTable,
    pub dialogs: DialogTable,
    pub callrecord_sender: Option<CallRecordSender>,
    /// Host advertised in Via, Record-Route and Contact.
    pub host: String,
    pub port: u16,
    pub useragent: String,
}

pub type SipServerRef = Arc<SipServerInner>;

impl SipServerInner {
    pub fn hostport(&self) -> String {
        transform::format_host_port(&self.host, self.port)
    }

    pub fn record(&self, event: CallRecordEvent) {
        if let Some(sender) = self.callrecord_sender.as_ref() {
            if let Err(e) = sender.send(event) {
                debug!("call record dropped: {}", e);
            }
        }
    }

    pub async fn update_gauges(&self) {
        crate::metrics::sip::set_invite_transactions(self.invites.len().await);
        crate::metrics::sip::set_active_dialogs(self.dialogs.len().await);
        crate::metrics::sip::set_active_registrations(self.locator.count().await);
    }

    /// Answers `tx` with a response generated by this node.
    pub async fn reply(
        &self,
        tx: &mut Transaction,
        status_code: rsip::StatusCode,
        headers: Vec<rsip::Header>,
    ) -> Result<()> {
        let response =
            transform::make_response(&tx.original, status_code, headers, None, &self.useragent);
        self.respond(tx, response).await
    }

    pub async fn respond(&self, tx: &mut Transaction, response: rsip::Response) -> Result<()> {
        crate::metrics::sip::response(
            response.status_code.code(),
            &tx.original.method.to_string(),
        );
        tx.respond(response).await.map_err(|e| anyhow!(e))
    }

    /// Resolves `uri` to the UDP address its datagrams go to.
    pub async fn resolve(&self, uri: &rsip::Uri) -> Result<SipAddr> {
        let (host, port) = transform::host_port(&uri.host_with_port);
        let addr = tokio::net::lookup_host(transform::format_host_port(&host, port))
            .await?
            .next()
            .ok_or_else(|| anyhow!("unable to resolve {}:{}", host, port))?;
        Ok(SipAddr {
            r#type: Some(rsip::Transport::Udp),
            addr: addr.into(),
        })
    }

    /// Starts a client transaction for `request` toward `destination`.
    pub async fn send_request(
        &self,
        endpoint_inner: Arc<EndpointInner>,
        request: rsip::Request,
        destination: SipAddr,
    ) -> Result<Transaction> {
        crate::metrics::sip::message(&request.method.to_string(), "out");
        let key = TransactionKey::from_request(&request, TransactionRole::Client)
            .map_err(|e| anyhow!(e))?;
        let mut tx = Transaction::new_client(key, request, endpoint_inner, None);
        tx.destination = Some(destination);
        tx.send().await.map_err(|e| anyhow!(e))?;
        Ok(tx)
    }
}

pub struct SipServer {
    pub inner: SipServerRef,
    pub endpoint: Endpoint,
    modules: Arc<Vec<Box<dyn ProxyModule>>>,
    allow_methods: Arc<HashSet<String>>,
    local_addr: SocketAddr,
}

pub struct SipServerBuilder {
    config: Arc<ProxyConfig>,
    cancel_token: Option<CancellationToken>,
    user_backend: Option<Box<dyn UserBackend>>,
    locator: Option<Box<dyn Locator>>,
    callrecord_sender: Option<CallRecordSender>,
    create_module_fns: HashMap<String, FnCreateProxyModule>,
}

impl SipServerBuilder {
    pub fn new(config: Arc<ProxyConfig>) -> Self {
        Self {
            config,
            cancel_token: None,
            user_backend: None,
            locator: None,
            callrecord_sender: None,
            create_module_fns: HashMap::new(),
        }
    }

    pub fn with_user_backend(mut self, user_backend: Box<dyn UserBackend>) -> Self {
        self.user_backend = Some(user_backend);
        self
    }

    pub fn with_locator(mut self, locator: Box<dyn Locator>) -> Self {
        self.locator = Some(locator);
        self
    }

    pub fn with_cancel_token(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = Some(cancel_token);
        self
    }

    pub fn with_callrecord_sender(mut self, sender: Option<CallRecordSender>) -> Self {
        self.callrecord_sender = sender;
        self
    }

    pub fn register_module(mut self, name: &str, create_fn: FnCreateProxyModule) -> Self {
        self.create_module_fns.insert(name.to_string(), create_fn);
        self
    }

    /// Registers the modules shipped with the proxy.
    pub fn with_default_modules(self) -> Self {
        self.register_module("registrar", RegistrarModule::create)
            .register_module("call", CallModule::create)
    }

    pub async fn build(self) -> Result<SipServer> {
        let config = self.config;
        let cancel_token = self.cancel_token.unwrap_or_default();
        let host = crate::net_tool::advertised_host(config.external_ip.as_deref(), &config.addr)?;
        let useragent = config
            .useragent
            .clone()
            .unwrap_or_else(crate::version::get_useragent);

        let bind_addr: SocketAddr = transform::format_host_port(&config.addr, config.udp_port)
            .parse()
            .map_err(|e| anyhow!("proxy: failed to parse bind address: {}", e))?;
        let transport_layer = TransportLayer::new(cancel_token.clone());
        let udp_conn = UdpConnection::create_connection(bind_addr, None)
            .await
            .map_err(|e| anyhow!("Failed to create UDP connection: {}", e))?;
        let local_addr: SocketAddr = udp_conn
            .get_addr()
            .addr
            .clone()
            .try_into()
            .map_err(|e| anyhow!("proxy: invalid local address: {:?}", e))?;
        transport_layer.add_transport(udp_conn.into());
        let port = config.external_port.unwrap_or(local_addr.port());
        info!(%local_addr, host, port, "SIP transport bound");

        let endpoint = EndpointBuilder::new()
            .with_user_agent(useragent.as_str())
            .with_cancel_token(cancel_token.clone())
            .with_transport_layer(transport_layer)
            .build();

        let inner = Arc::new(SipServerInner {
            cancel_token,
            config: config.clone(),
            user_backend: Arc::new(
                self.user_backend
                    .unwrap_or_else(|| Box::new(MemoryUserBackend::new(None))),
            ),
            locator: Arc::new(self.locator.unwrap_or_else(|| {
                Box::new(MemoryLocator::new(Duration::from_secs(
                    config.registrar_expires as u64,
                )))
            })),
            invites: InviteTable::new(),
            dialogs: DialogTable::new(),
            callrecord_sender: self.callrecord_sender,
            host,
            port,
            useragent,
        });

        let load_modules = config
            .modules
            .clone()
            .unwrap_or_else(|| vec!["registrar".to_string(), "call".to_string()]);
        let start_time = Instant::now();
        let mut modules = Vec::new();
        for name in load_modules.iter() {
            let create_fn = match self.create_module_fns.get(name) {
                Some(create_fn) => create_fn,
                None => {
                    warn!("proxy: module {} not registered, skipped", name);
                    continue;
                }
            };
            let mut module = create_fn(inner.clone(), config.clone())?;
            if let Err(e) = module.on_start().await {
                error!("proxy: failed to start module {}: {}", name, e);
                return Err(anyhow!("proxy: failed to start module {}: {}", name, e));
            }
            modules.push(module);
        }
        info!(
            "proxy: started with modules: {:?}, elapsed: {:?}",
            modules.iter().map(|m| m.name()).collect::<Vec<_>>(),
            start_time.elapsed()
        );

        let allow_methods = modules
            .iter()
            .flat_map(|m| m.allow_methods())
            .map(|m| m.to_string())
            .collect::<HashSet<_>>();
        Ok(SipServer {
            inner,
            endpoint,
            modules: Arc::new(modules),
            allow_methods: Arc::new(allow_methods),
            local_addr,
        })
    }
}

impl SipServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn serve(&self) -> Result<()> {
        let incoming = self.endpoint.incoming_transactions();
        let cancel_token = self.inner.cancel_token.clone();
        info!(
            local_addr = %self.local_addr,
            advertised = self.inner.hostport(),
            "proxy: serving"
        );
        select! {
            _ = cancel_token.cancelled() => {
                info!("cancelled");
            }
            _ = self.endpoint.serve() => {
                info!("endpoint finished");
            }
            _ = self.handle_incoming(incoming) => {
                info!("incoming transactions stopped");
            }
            _ = self.sweep_loop() => {}
        };

        for module in self.modules.iter() {
            if let Err(e) = module.on_stop().await {
                error!("proxy: failed to stop module {}: {}", module.name(), e);
            }
        }
        info!("proxy: stopped");
        Ok(())
    }

    pub fn stop(&self) {
        self.inner.cancel_token.cancel();
    }

    /// Removes INVITE attempts that outlived their downstream timeout.
    async fn sweep_loop(&self) {
        let config = &self.inner.config;
        let interval = Duration::from_secs(config.transaction_sweep_interval.max(1));
        let max_age = Duration::from_secs(config.invite_timeout + 5);
        loop {
            tokio::time::sleep(interval).await;
            let removed = self.inner.invites.sweep(max_age).await;
            if removed > 0 {
                warn!(removed, "swept abandoned invite transactions");
                self.inner.update_gauges().await;
            }
        }
    }

    async fn handle_incoming(&self, mut incoming: TransactionReceiver) -> Result<()> {
        let runnings_tx = Arc::new(AtomicUsize::new(0));
        while let Some(mut tx) = incoming.recv().await {
            let key = tx.key.to_string();
            let method = tx.original.method.clone();
            crate::metrics::sip::message(&method.to_string(), "in");
            debug!(key, "Received transaction");

            if !self.allow_methods.contains(&method.to_string()) {
                info!(key, "Method not allowed: {}", method);
                if method != rsip::Method::Ack {
                    let allow = self.allow_header();
                    self.inner
                        .reply(&mut tx, rsip::StatusCode::MethodNotAllowed, vec![allow])
                        .await
                        .ok();
                }
                continue;
            }

            if let Some(max_concurrency) = self.inner.config.max_concurrency {
                if runnings_tx.load(Ordering::Relaxed) >= max_concurrency {
                    info!(
                        key,
                        runnings = runnings_tx.load(Ordering::Relaxed),
                        "Max concurrency reached, not process this transaction"
                    );
                    if method != rsip::Method::Ack {
                        self.inner
                            .reply(&mut tx, rsip::StatusCode::ServiceUnavailable, vec![])
                            .await
                            .ok();
                    }
                    continue;
                }
            }

            let modules = self.modules.clone();
            let server = self.inner.clone();
            let token = self.inner.cancel_token.child_token();
            let runnings_tx = runnings_tx.clone();
            runnings_tx.fetch_add(1, Ordering::Relaxed);
            tokio::spawn(async move {
                let start_time = Instant::now();
                select! {
                    _ = Self::process_transaction(token.clone(), &server, modules, &key, &mut tx) => {
                        let final_status = tx.last_response.as_ref().map(|r| r.status_code.code());
                        debug!(key, ?final_status, "Transaction processed in {:?}", start_time.elapsed());
                    }
                    _ = token.cancelled() => {
                        info!(key, "Transaction cancelled");
                        if tx.last_response.is_none() && tx.original.method != rsip::Method::Ack {
                            server
                                .reply(&mut tx, rsip::StatusCode::RequestTerminated, vec![])
                                .await
                                .ok();
                        }
                    }
                };
                crate::metrics::sip::handler_latency_seconds(
                    start_time.elapsed().as_secs_f64(),
                    &tx.original.method.to_string(),
                );
                runnings_tx.fetch_sub(1, Ordering::Relaxed);
            });
        }
        Ok(())
    }

    fn allow_header(&self) -> rsip::Header {
        use rsip::headers::UntypedHeader;
        let mut methods = self.allow_methods.iter().cloned().collect::<Vec<_>>();
        methods.sort();
        rsip::Header::Allow(rsip::headers::Allow::new(methods.join(", ")))
    }

    async fn process_transaction(
        token: CancellationToken,
        server: &SipServerRef,
        modules: Arc<Vec<Box<dyn ProxyModule>>>,
        key: &str,
        tx: &mut Transaction,
    ) {
        for module in modules.iter() {
            match module.on_transaction_begin(token.clone(), tx).await {
                Ok(ProxyAction::Continue) => {}
                Ok(ProxyAction::Abort) => break,
                Err(e) => {
                    let status = match e.downcast_ref::<ProxyError>() {
                        Some(proxy_error) => {
                            info!(key, module = module.name(), "request rejected: {}", proxy_error);
                            proxy_error.status_code()
                        }
                        None => {
                            error!(key, module = module.name(), "proxy: failed to handle transaction: {}", e);
                            rsip::StatusCode::ServerInternalError
                        }
                    };
                    if tx.last_response.is_none() && tx.original.method != rsip::Method::Ack {
                        server.reply(tx, status, vec![]).await.ok();
                    }
                    break;
                }
            }
        }
        for module in modules.iter() {
            if let Err(e) = module.on_transaction_end(tx).await {
                warn!(key, module = module.name(), "transaction end hook failed: {}", e);
            }
        }
    }
}
