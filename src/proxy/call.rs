use super::{
    ProxyAction, ProxyModule,
    dialog::{DialogContext, DialogKey},
    invite::{
        CallState, InviteContext, InviteContextRef, InviteKey, OutboundInvite, StoreResult,
    },
    server::{SipServerInner, SipServerRef},
    transform,
    user::RoutingPolicy,
};
use crate::{
    callrecord::{CallRecordEvent, EndedBy},
    config::ProxyConfig,
    error::ProxyError,
};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use rsip::{Header, SipMessage, headers::UntypedHeader};
use rsipstack::{
    rsip_ext::RsipResponseExt,
    transaction::{endpoint::EndpointInner, transaction::Transaction},
    transport::SipAddr,
};
use std::{sync::Arc, time::Duration};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

enum InviteEvent {
    Response(rsip::Response),
    Cancel,
    Timeout,
    Abandoned,
    UpstreamClosed,
    DownstreamClosed,
    Ignored,
}

/// Routes INVITE to registered users and relays CANCEL, ACK and BYE within
/// the dialogs it established.
#[derive(Clone)]
pub struct CallModule {
    server: SipServerRef,
    config: Arc<ProxyConfig>,
}

impl CallModule {
    pub fn create(server: SipServerRef, config: Arc<ProxyConfig>) -> Result<Box<dyn ProxyModule>> {
        let module = CallModule::new(config, server);
        Ok(Box::new(module))
    }

    pub fn new(config: Arc<ProxyConfig>, server: SipServerRef) -> Self {
        Self { server, config }
    }

    fn in_dialog_timeout(&self) -> Duration {
        Duration::from_secs(self.config.in_dialog_timeout)
    }

    async fn handle_invite(
        &self,
        token: CancellationToken,
        tx: &mut Transaction,
    ) -> Result<(), ProxyError> {
        let mut original = tx.original.clone();
        let callee = transform::to_user(&original.headers)
            .ok_or_else(|| ProxyError::BadRequest("missing To user".to_string()))?;
        transform::decrement_max_forwards(&mut original)?;
        transform::detect_via_loop(&original, &self.server.hostport())?;
        let key = InviteKey::from_request(&original)
            .ok_or_else(|| ProxyError::BadRequest("missing Via branch".to_string()))?;
        let source = transform::request_source(&original.headers).unwrap_or_default();

        let ctx = match self
            .server
            .invites
            .store(InviteContext::new(
                key.clone(),
                original,
                source,
                token.child_token(),
            ))
            .await
        {
            StoreResult::Stored(ctx) => ctx,
            StoreResult::Existing(existing) => {
                debug!(%key, "retransmitted INVITE, replaying last response");
                match existing.last_response() {
                    Some(response) => self.server.respond(tx, response).await?,
                    None => {
                        self.server
                            .reply(tx, rsip::StatusCode::Trying, vec![])
                            .await?
                    }
                }
                return Ok(());
            }
        };
        self.server.update_gauges().await;
        self.reply_upstream(&ctx, tx, rsip::StatusCode::Trying, vec![])
            .await;

        if let Err(e) = self.route_invite(&ctx, tx, &callee).await {
            info!(%key, callee, "INVITE failed: {}", e);
            if ctx.finalize() {
                ctx.set_state(CallState::Terminated);
                self.reply_upstream(&ctx, tx, e.status_code(), vec![]).await;
            }
        }
        self.server.invites.remove(&key).await;
        self.server.update_gauges().await;
        Ok(())
    }

    /// Single decision point between redirecting and proxying, driven by the
    /// callee's routing policy. A CANCEL arriving while the callee is looked
    /// up ends the call with 487.
    async fn route_invite(
        &self,
        ctx: &InviteContextRef,
        tx: &mut Transaction,
        callee: &str,
    ) -> Result<(), ProxyError> {
        let lookup = async {
            let user = self
                .server
                .user_backend
                .find_by_login(callee)
                .await?
                .ok_or_else(|| ProxyError::NotFound(callee.to_string()))?;
            let binding = self
                .server
                .locator
                .lookup(callee)
                .await?
                .ok_or_else(|| ProxyError::NotFound(format!("{} is not registered", callee)))?;
            Ok::<_, ProxyError>((user, binding))
        };
        let (user, binding) = select! {
            r = lookup => r?,
            Some(_) = Self::upstream_cancel(tx) => {
                self.terminate_cancelled(ctx, tx).await;
                return Ok(());
            }
            _ = ctx.cancelled.cancelled() => {
                self.terminate_cancelled(ctx, tx).await;
                return Ok(());
            }
            _ = ctx.token.cancelled() => {
                debug!(key = %ctx.key, "INVITE abandoned during lookup");
                return Ok(());
            }
        };

        match user.routing {
            RoutingPolicy::Redirect => {
                if ctx.finalize() {
                    let contact = Header::Contact(rsip::headers::Contact::new(format!(
                        "<{}>",
                        binding.contact
                    )));
                    self.reply_upstream(ctx, tx, rsip::StatusCode::MovedTemporarily, vec![contact])
                        .await;
                    info!(key = %ctx.key, callee, contact = %binding.contact, "redirected");
                }
                ctx.set_state(CallState::Terminated);
                Ok(())
            }
            RoutingPolicy::Proxy => self.proxy_invite(ctx, tx, callee, binding.contact).await,
        }
    }

    /// Waits for a CANCEL delivered to the INVITE server transaction.
    /// `None` once the transaction stops yielding messages.
    async fn upstream_cancel(tx: &mut Transaction) -> Option<rsip::Request> {
        while let Some(msg) = tx.receive().await {
            if let SipMessage::Request(req) = msg {
                if req.method == rsip::Method::Cancel {
                    return Some(req);
                }
            }
        }
        None
    }

    async fn proxy_invite(
        &self,
        ctx: &InviteContextRef,
        tx: &mut Transaction,
        callee: &str,
        target: rsip::Uri,
    ) -> Result<(), ProxyError> {
        let destination = self
            .server
            .resolve(&target)
            .await
            .map_err(|e| ProxyError::Unavailable(e.to_string()))?;
        let request = transform::build_outbound_invite(
            &ctx.original,
            &target,
            &self.server.host,
            self.server.port,
        );
        let mut client_tx = {
            let mut outbound = ctx.outbound.lock().await;
            if ctx.is_finalized() {
                debug!(key = %ctx.key, "INVITE finished before it could be forwarded");
                return Ok(());
            }
            let client_tx = self
                .server
                .send_request(tx.endpoint_inner.clone(), request.clone(), destination.clone())
                .await
                .map_err(|e| ProxyError::Unavailable(e.to_string()))?;
            *outbound = Some(OutboundInvite {
                request,
                destination: destination.clone(),
            });
            client_tx
        };
        ctx.set_state(CallState::Proxying);

        info!(key = %ctx.key, callee, %target, destination = %destination.addr, "INVITE forwarded");
        self.server.record(CallRecordEvent::Started {
            call_id: transform::call_id(&ctx.original.headers).unwrap_or_default(),
            from_tag: transform::from_tag(&ctx.original.headers).unwrap_or_default(),
            caller: transform::from_user(&ctx.original.headers).unwrap_or_default(),
            callee: callee.to_string(),
            at: Utc::now(),
        });

        let deadline = tokio::time::sleep(Duration::from_secs(self.config.invite_timeout));
        tokio::pin!(deadline);
        let mut upstream_open = true;
        let mut cancelling = false;
        loop {
            let event = select! {
                _ = ctx.token.cancelled() => InviteEvent::Abandoned,
                _ = &mut deadline => InviteEvent::Timeout,
                r = Self::upstream_cancel(tx), if upstream_open => match r {
                    Some(_) => InviteEvent::Cancel,
                    None => InviteEvent::UpstreamClosed,
                },
                _ = ctx.cancelled.cancelled(), if !cancelling => InviteEvent::Cancel,
                r = client_tx.receive() => match r {
                    Some(SipMessage::Response(response)) => InviteEvent::Response(response),
                    Some(_) => InviteEvent::Ignored,
                    None => InviteEvent::DownstreamClosed,
                },
            };

            match event {
                InviteEvent::Abandoned => {
                    debug!(key = %ctx.key, "INVITE abandoned");
                    return Ok(());
                }
                InviteEvent::Timeout => {
                    self.on_invite_timeout(ctx, tx, client_tx).await;
                    return Ok(());
                }
                InviteEvent::UpstreamClosed => upstream_open = false,
                InviteEvent::Ignored => {}
                InviteEvent::Cancel => {
                    if cancelling {
                        continue;
                    }
                    cancelling = true;
                    if !self.cancel_downstream(ctx, tx.endpoint_inner.clone()).await {
                        self.terminate_cancelled(ctx, tx).await;
                        return Ok(());
                    }
                }
                InviteEvent::DownstreamClosed => {
                    warn!(key = %ctx.key, "downstream closed before a final response");
                    self.finish_invite(ctx, tx, rsip::StatusCode::ServiceUnavailable, None)
                        .await;
                    return Ok(());
                }
                InviteEvent::Response(response) => {
                    let code = response.status_code.code();
                    if code == 100 {
                        continue;
                    }
                    if code < 200 {
                        self.relay_provisional(ctx, tx, &response).await;
                        continue;
                    }
                    if code < 300 {
                        self.commit_dialog(ctx, &response).await;
                    }
                    self.finish_invite(ctx, tx, response.status_code.clone(), Some(&response))
                        .await;
                    return Ok(());
                }
            }
        }
    }

    async fn relay_provisional(
        &self,
        ctx: &InviteContextRef,
        tx: &mut Transaction,
        response: &rsip::Response,
    ) {
        if ctx.is_finalized() {
            return;
        }
        if transform::to_tag(&response.headers).is_some() && ctx.state() == CallState::Proxying {
            ctx.set_state(CallState::Early);
            self.server.record(CallRecordEvent::Ringing {
                call_id: transform::call_id(&ctx.original.headers).unwrap_or_default(),
                at: Utc::now(),
            });
        }
        let upstream = transform::make_upstream_response(&ctx.original, response);
        self.respond_upstream(ctx, tx, upstream).await;
    }

    async fn reply_upstream(
        &self,
        ctx: &InviteContext,
        tx: &mut Transaction,
        status_code: rsip::StatusCode,
        headers: Vec<Header>,
    ) {
        let response = transform::make_response(
            &tx.original,
            status_code,
            headers,
            None,
            &self.server.useragent,
        );
        self.respond_upstream(ctx, tx, response).await;
    }

    async fn respond_upstream(
        &self,
        ctx: &InviteContext,
        tx: &mut Transaction,
        response: rsip::Response,
    ) {
        ctx.set_last_response(&response);
        let code = response.status_code.code();
        if let Err(e) = self.server.respond(tx, response).await {
            warn!(key = %ctx.key, code, "failed to answer INVITE: {}", e);
        }
    }

    /// Delivers the final response upstream unless a CANCEL already did.
    async fn finish_invite(
        &self,
        ctx: &InviteContextRef,
        tx: &mut Transaction,
        status_code: rsip::StatusCode,
        response: Option<&rsip::Response>,
    ) {
        let code = status_code.code();
        let reason = response
            .and_then(|r| r.reason_phrase().map(|phrase| format!("{} {}", code, phrase)))
            .unwrap_or_else(|| status_code.to_string());
        if !ctx.finalize() {
            debug!(key = %ctx.key, code, "INVITE already finalized, dropping final response");
            return;
        }
        match response {
            Some(response) => {
                let upstream = transform::make_upstream_response(&ctx.original, response);
                self.respond_upstream(ctx, tx, upstream).await;
            }
            None => self.reply_upstream(ctx, tx, status_code, vec![]).await,
        }
        let call_id = transform::call_id(&ctx.original.headers).unwrap_or_default();
        if (200..300).contains(&code) {
            ctx.set_state(CallState::Confirmed);
            self.server.record(CallRecordEvent::Answered {
                call_id,
                to_tag: response.and_then(|r| transform::to_tag(&r.headers)),
                at: Utc::now(),
            });
        } else {
            ctx.set_state(CallState::Terminated);
            let ended_by = match code {
                487 => EndedBy::Caller,
                500..=599 if response.is_none() => EndedBy::System,
                _ => EndedBy::Callee,
            };
            self.record_ended(ctx, code, reason, ended_by);
        }
        info!(key = %ctx.key, code, "INVITE finalized");
    }

    /// Answers 504 upstream and cancels the downstream branch. The client
    /// transaction is kept until the callee's final response so that it
    /// still gets acknowledged.
    async fn on_invite_timeout(
        &self,
        ctx: &InviteContextRef,
        tx: &mut Transaction,
        mut client_tx: Transaction,
    ) {
        warn!(key = %ctx.key, "no final response before deadline");
        self.finish_invite(ctx, tx, rsip::StatusCode::ServerTimeOut, None)
            .await;
        let outbound = ctx.outbound.lock().await.clone();
        let outbound = match outbound {
            Some(outbound) => outbound,
            None => return,
        };
        let server = self.server.clone();
        let endpoint_inner = tx.endpoint_inner.clone();
        let linger = self.in_dialog_timeout();
        let key = ctx.key.clone();
        tokio::spawn(async move {
            let cancel = transform::build_cancel(&outbound.request);
            match tokio::time::timeout(
                linger,
                send_and_wait_final(&server, endpoint_inner, cancel, outbound.destination),
            )
            .await
            {
                Ok(Ok(response)) => {
                    debug!(%key, status = %response.status_code, "timed out INVITE cancelled")
                }
                Ok(Err(e)) => debug!(%key, "failed to cancel timed out INVITE: {}", e),
                Err(_) => debug!(%key, "CANCEL for timed out INVITE unanswered"),
            }
            let drain = async {
                while let Some(msg) = client_tx.receive().await {
                    if let SipMessage::Response(response) = msg {
                        if response.status_code.code() >= 200 {
                            return;
                        }
                    }
                }
            };
            tokio::time::timeout(linger, drain).await.ok();
        });
    }

    fn record_ended(&self, ctx: &InviteContext, status_code: u16, reason: String, ended_by: EndedBy) {
        self.server.record(CallRecordEvent::Ended {
            call_id: transform::call_id(&ctx.original.headers).unwrap_or_default(),
            status_code,
            reason,
            ended_by,
            at: Utc::now(),
        });
    }

    /// Stores both directions of the dialog established by `response`.
    /// Runs at most once per INVITE.
    pub async fn commit_dialog(&self, ctx: &InviteContext, response: &rsip::Response) -> bool {
        let headers = &ctx.original.headers;
        let (call_id, caller_tag, callee_tag, callee_target) = match (
            transform::call_id(headers),
            transform::from_tag(headers),
            transform::to_tag(&response.headers),
            transform::contact_uri(&response.headers),
        ) {
            (Some(call_id), Some(caller_tag), Some(callee_tag), Some(target)) => {
                (call_id, caller_tag, callee_tag, target)
            }
            _ => {
                warn!(key = %ctx.key, "2xx lacks dialog identifiers, no dialog stored");
                return false;
            }
        };
        let caller_target = transform::contact_uri(headers).or_else(|| {
            transform::make_reachable_contact(
                &transform::from_user(headers).unwrap_or_default(),
                &ctx.source,
            )
        });
        let caller_target = match caller_target {
            Some(target) => target,
            None => {
                warn!(key = %ctx.key, "caller is unreachable, no dialog stored");
                return false;
            }
        };
        if !ctx.mark_dialog_created() {
            debug!(key = %ctx.key, "dialog already stored");
            return false;
        }

        let (route_set, reverse_route_set) =
            transform::split_route_sets(response, &self.server.host, self.server.port);
        let key_ab = DialogKey::new(&call_id, &caller_tag, &callee_tag);
        let key_ba = key_ab.reversed();
        let stored = self
            .server
            .dialogs
            .store_pair(
                key_ab.clone(),
                DialogContext {
                    remote_target: callee_target,
                    route_set,
                    from_caller: true,
                },
                key_ba,
                DialogContext {
                    remote_target: caller_target,
                    route_set: reverse_route_set,
                    from_caller: false,
                },
            )
            .await;
        if stored {
            info!(dialog = %key_ab, "dialog established");
        }
        self.server.update_gauges().await;
        stored
    }

    /// A CANCEL the INVITE server transaction did not absorb. Matched by the
    /// INVITE's Via branch; the INVITE handler does the rest.
    async fn handle_cancel(&self, tx: &mut Transaction) -> Result<(), ProxyError> {
        let ctx = match InviteKey::from_request(&tx.original) {
            Some(key) => self.server.invites.get(&key).await,
            None => None,
        };
        let ctx = match ctx {
            Some(ctx) => ctx,
            None => {
                debug!("CANCEL matches no pending INVITE");
                self.server
                    .reply(tx, rsip::StatusCode::CallTransactionDoesNotExist, vec![])
                    .await?;
                return Ok(());
            }
        };
        self.server.reply(tx, rsip::StatusCode::OK, vec![]).await?;
        if ctx.is_finalized() || ctx.state() == CallState::Confirmed {
            debug!(key = %ctx.key, state = ?ctx.state(), "CANCEL after final response ignored");
            return Ok(());
        }
        ctx.cancelled.cancel();
        Ok(())
    }

    /// Sends CANCEL for the forwarded INVITE and waits for its answer.
    /// `false` when the callee could not be reached.
    async fn cancel_downstream(
        &self,
        ctx: &InviteContextRef,
        endpoint_inner: Arc<EndpointInner>,
    ) -> bool {
        let outbound = match ctx.outbound.lock().await.clone() {
            Some(outbound) => outbound,
            None => return false,
        };
        let cancel = transform::build_cancel(&outbound.request);
        let result = tokio::time::timeout(
            self.in_dialog_timeout(),
            send_and_wait_final(&self.server, endpoint_inner, cancel, outbound.destination),
        )
        .await;
        match result {
            Ok(Ok(response)) => {
                debug!(key = %ctx.key, status = %response.status_code, "downstream CANCEL answered");
                true
            }
            Ok(Err(e)) => {
                warn!(key = %ctx.key, "downstream CANCEL failed: {}", e);
                false
            }
            Err(_) => {
                warn!(key = %ctx.key, "downstream CANCEL timed out");
                false
            }
        }
    }

    /// Answers the INVITE with 487.
    async fn terminate_cancelled(&self, ctx: &InviteContextRef, tx: &mut Transaction) {
        if ctx.finalize() {
            ctx.set_state(CallState::Terminated);
            self.reply_upstream(ctx, tx, rsip::StatusCode::RequestTerminated, vec![])
                .await;
            self.record_ended(
                ctx,
                487,
                rsip::StatusCode::RequestTerminated.to_string(),
                EndedBy::Caller,
            );
        }
    }

    async fn lookup_dialog(&self, req: &rsip::Request) -> Option<(DialogKey, DialogContext)> {
        let call_id = transform::call_id(&req.headers)?;
        let from_tag = transform::from_tag(&req.headers)?;
        let to_tag = transform::to_tag(&req.headers)?;
        self.server.dialogs.lookup(&call_id, &from_tag, &to_tag).await
    }

    async fn handle_ack(&self, tx: &mut Transaction) -> Result<(), ProxyError> {
        let (key, dialog) = match self.lookup_dialog(&tx.original).await {
            Some(found) => found,
            None => {
                debug!("ACK outside any dialog dropped");
                return Ok(());
            }
        };
        let (request, next_hop) = transform::build_in_dialog_request(
            &tx.original,
            &dialog.remote_target,
            &dialog.route_set,
            &self.server.host,
            self.server.port,
        )?;
        let destination = self.server.resolve(&next_hop).await?;
        self.server
            .send_request(tx.endpoint_inner.clone(), request, destination.clone())
            .await?;
        debug!(dialog = %key, destination = %destination.addr, "ACK forwarded");
        Ok(())
    }

    async fn handle_bye(&self, tx: &mut Transaction) -> Result<(), ProxyError> {
        let (key, dialog) = self
            .lookup_dialog(&tx.original)
            .await
            .ok_or(ProxyError::NoDialog)?;
        let (request, next_hop) = transform::build_in_dialog_request(
            &tx.original,
            &dialog.remote_target,
            &dialog.route_set,
            &self.server.host,
            self.server.port,
        )?;
        let destination = match self.server.resolve(&next_hop).await {
            Ok(destination) => destination,
            Err(e) => {
                warn!(dialog = %key, "unable to resolve BYE target: {}", e);
                self.server
                    .reply(tx, rsip::StatusCode::BadGateway, vec![])
                    .await?;
                return Ok(());
            }
        };

        let result = tokio::time::timeout(
            self.in_dialog_timeout(),
            send_and_wait_final(&self.server, tx.endpoint_inner.clone(), request, destination),
        )
        .await;
        let mut response = match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(dialog = %key, "BYE forwarding failed: {}", e);
                self.server
                    .reply(tx, rsip::StatusCode::BadGateway, vec![])
                    .await?;
                return Ok(());
            }
            Err(_) => {
                warn!(dialog = %key, "BYE timed out");
                return Err(ProxyError::Timeout);
            }
        };

        let code = response.status_code.code();
        let reason = match response.reason_phrase() {
            Some(phrase) => format!("BYE {} {}", code, phrase),
            None => format!("BYE {}", code),
        };
        transform::strip_top_via(&mut response.headers);
        self.server.respond(tx, response).await?;

        if (200..300).contains(&code) || code == 481 {
            if self.server.dialogs.delete_pair(&key).await {
                let ended_by = if dialog.from_caller {
                    EndedBy::Caller
                } else {
                    EndedBy::Callee
                };
                info!(dialog = %key, ?ended_by, code, "dialog terminated");
                self.server.record(CallRecordEvent::Ended {
                    call_id: key.call_id.clone(),
                    status_code: code,
                    reason,
                    ended_by,
                    at: Utc::now(),
                });
            }
            self.server.update_gauges().await;
        }
        Ok(())
    }
}

/// Sends `request` in a client transaction and waits for its final response.
async fn send_and_wait_final(
    server: &SipServerInner,
    endpoint_inner: Arc<EndpointInner>,
    request: rsip::Request,
    destination: SipAddr,
) -> Result<rsip::Response> {
    let mut client_tx = server
        .send_request(endpoint_inner, request, destination)
        .await?;
    while let Some(msg) = client_tx.receive().await {
        if let SipMessage::Response(response) = msg {
            if response.status_code.code() >= 200 {
                return Ok(response);
            }
        }
    }
    Err(anyhow!("transaction ended without a final response"))
}

#[async_trait]
impl ProxyModule for CallModule {
    fn name(&self) -> &str {
        "call"
    }
    fn allow_methods(&self) -> Vec<rsip::Method> {
        vec![
            rsip::Method::Invite,
            rsip::Method::Ack,
            rsip::Method::Cancel,
            rsip::Method::Bye,
        ]
    }
    async fn on_start(&mut self) -> Result<()> {
        Ok(())
    }
    async fn on_stop(&self) -> Result<()> {
        Ok(())
    }

    async fn on_transaction_begin(
        &self,
        token: CancellationToken,
        tx: &mut Transaction,
    ) -> Result<ProxyAction> {
        match tx.original.method {
            rsip::Method::Invite => self.handle_invite(token, tx).await?,
            rsip::Method::Cancel => self.handle_cancel(tx).await?,
            rsip::Method::Ack => self.handle_ack(tx).await?,
            rsip::Method::Bye => self.handle_bye(tx).await?,
            _ => return Ok(ProxyAction::Continue),
        }
        Ok(ProxyAction::Abort)
    }
}
