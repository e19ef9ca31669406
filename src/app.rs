use crate::{
    callrecord::{CallRecordManager, CallRecordManagerBuilder},
    config::Config,
    proxy::{
        server::{SipServer, SipServerBuilder},
        user::create_user_backend,
    },
};
use anyhow::Result;
use std::sync::Arc;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct AppStateInner {
    pub config: Arc<Config>,
    pub token: CancellationToken,
    pub proxy: SipServer,
}

pub type AppState = Arc<AppStateInner>;

pub struct AppStateBuilder {
    pub config: Option<Config>,
    pub token: Option<CancellationToken>,
}

impl Default for AppStateBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AppStateBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            token: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Builds the proxy and, when configured, the call record manager that
    /// consumes its events. The manager is returned separately so it can be
    /// driven on its own task.
    pub async fn build(self) -> Result<(AppState, Option<CallRecordManager>)> {
        let config = Arc::new(self.config.unwrap_or_default());
        let token = self.token.unwrap_or_default();

        let callrecord = config.callrecord.clone().map(|callrecord_config| {
            CallRecordManagerBuilder::new()
                .with_cancel_token(token.child_token())
                .with_config(callrecord_config)
                .build()
        });

        let user_backend = create_user_backend(&config.proxy.user_backend).await?;
        let proxy = SipServerBuilder::new(Arc::new(config.proxy.clone()))
            .with_cancel_token(token.child_token())
            .with_user_backend(user_backend)
            .with_callrecord_sender(callrecord.as_ref().map(|m| m.sender.clone()))
            .with_default_modules()
            .build()
            .await?;

        Ok((
            Arc::new(AppStateInner {
                config,
                token,
                proxy,
            }),
            callrecord,
        ))
    }
}

pub async fn run(state: AppState, callrecord: Option<CallRecordManager>) -> Result<()> {
    let token = state.token.clone();
    if let Some(mut callrecord) = callrecord {
        tokio::spawn(async move {
            callrecord.serve().await;
        });
    }

    select! {
        r = state.proxy.serve() => {
            if let Err(e) = r {
                error!("proxy server error: {}", e);
                return Err(e);
            }
        }
        _ = token.cancelled() => {
            info!("Application shutting down due to cancellation");
        }
    }
    token.cancel();
    state.proxy.stop();
    Ok(())
}
