use super::{ProxyAction, ProxyModule, server::SipServerRef, transform};
use crate::{config::ProxyConfig, error::ProxyError};
use anyhow::Result;
use async_trait::async_trait;
use rsip::{Header, headers::UntypedHeader};
use rsipstack::transaction::transaction::Transaction;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Clone)]
pub struct RegistrarModule {
    server: SipServerRef,
    config: Arc<ProxyConfig>,
}

impl RegistrarModule {
    pub fn create(server: SipServerRef, config: Arc<ProxyConfig>) -> Result<Box<dyn ProxyModule>> {
        let module = RegistrarModule::new(server, config);
        Ok(Box::new(module))
    }

    pub fn new(server: SipServerRef, config: Arc<ProxyConfig>) -> Self {
        Self { server, config }
    }

    async fn handle_register(&self, tx: &mut Transaction) -> Result<(), ProxyError> {
        let headers = tx.original.headers.clone();
        let headers = &headers;
        let source = transform::request_source(headers).ok_or_else(|| {
            crate::metrics::sip::registration_failed("bad_request");
            ProxyError::BadRequest("missing Via".to_string())
        })?;
        let login = transform::from_user(headers).ok_or_else(|| {
            crate::metrics::sip::registration_failed("bad_request");
            ProxyError::BadRequest("missing From user".to_string())
        })?;
        let contact = transform::contact_uri(headers).ok_or_else(|| {
            crate::metrics::sip::registration_failed("bad_request");
            ProxyError::BadRequest("missing Contact".to_string())
        })?;

        match self.server.user_backend.find_by_login(&login).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                crate::metrics::sip::registration_failed("not_found");
                return Err(ProxyError::NotFound(login));
            }
            Err(e) => {
                crate::metrics::sip::registration_failed("backend_error");
                return Err(ProxyError::Other(e));
            }
        }

        let expires = transform::requested_expires(headers);
        if expires == Some(0) {
            self.server.locator.unregister(&login).await?;
            info!(login, source, "unregistered");
            self.server
                .reply(tx, rsip::StatusCode::OK, vec![Header::Expires(0u32.into())])
                .await?;
            self.server.update_gauges().await;
            return Ok(());
        }

        let reachable = transform::make_reachable_contact(&login, &source).unwrap_or_else(|| contact.clone());
        let ttl = Duration::from_secs(
            expires
                .map(u64::from)
                .unwrap_or(self.config.registrar_expires as u64),
        );
        let binding = self
            .server
            .locator
            .register(&login, reachable, &source, ttl)
            .await?;
        let granted = ttl.as_secs() as u32;
        info!(
            login,
            source,
            contact = %binding.contact,
            expires = granted,
            "registered"
        );

        let reply_headers = vec![
            Header::Contact(rsip::headers::Contact::new(format!(
                "<{}>;expires={}",
                contact, granted
            ))),
            Header::Expires(granted.into()),
        ];
        self.server
            .reply(tx, rsip::StatusCode::OK, reply_headers)
            .await?;
        crate::metrics::sip::registration_succeeded();
        self.server.update_gauges().await;
        Ok(())
    }
}

#[async_trait]
impl ProxyModule for RegistrarModule {
    fn name(&self) -> &str {
        "registrar"
    }
    fn allow_methods(&self) -> Vec<rsip::Method> {
        vec![rsip::Method::Register]
    }
    async fn on_start(&mut self) -> Result<()> {
        Ok(())
    }
    async fn on_stop(&self) -> Result<()> {
        Ok(())
    }

    async fn on_transaction_begin(
        &self,
        _token: CancellationToken,
        tx: &mut Transaction,
    ) -> Result<ProxyAction> {
        if !matches!(tx.original.method, rsip::Method::Register) {
            return Ok(ProxyAction::Continue);
        }
        self.handle_register(tx).await?;
        Ok(ProxyAction::Abort)
    }
}
