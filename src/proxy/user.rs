use super::user_plain::PlainTextBackend;
use crate::config::UserBackendConfig;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::info;

/// How INVITEs addressed to a user are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPolicy {
    /// Forward the INVITE and stay in the signalling path.
    #[default]
    Proxy,
    /// Answer with 302 pointing at the registered contact.
    Redirect,
}

impl std::str::FromStr for RoutingPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "proxy" => Ok(RoutingPolicy::Proxy),
            "redirect" => Ok(RoutingPolicy::Redirect),
            other => Err(anyhow::anyhow!("unknown routing policy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SipUser {
    pub id: u64,
    pub username: String,
    pub enabled: bool,
    pub routing: RoutingPolicy,
}

impl SipUser {
    pub fn new(id: u64, username: &str, routing: RoutingPolicy) -> Self {
        Self {
            id,
            username: username.to_string(),
            enabled: true,
            routing,
        }
    }

    /// Parses a `login[:proxy|redirect]` entry.
    pub fn parse_entry(id: u64, entry: &str) -> Result<Self> {
        let mut parts = entry.splitn(2, ':');
        let username = parts.next().unwrap_or_default().trim();
        if username.is_empty() {
            return Err(anyhow::anyhow!("empty login in entry: {:?}", entry));
        }
        let routing = match parts.next() {
            Some(policy) => policy.parse()?,
            None => RoutingPolicy::Proxy,
        };
        Ok(Self::new(id, username, routing))
    }
}

#[async_trait]
pub trait UserBackend: Send + Sync {
    /// Looks up a login. Disabled users are reported as absent.
    async fn find_by_login(&self, login: &str) -> Result<Option<SipUser>>;
}

pub struct MemoryUserBackend {
    users: Mutex<HashMap<String, SipUser>>,
}

impl MemoryUserBackend {
    pub fn new(builtin_users: Option<Vec<SipUser>>) -> Self {
        info!(
            "Creating MemoryUserBackend, users: {}",
            builtin_users.as_ref().map(|us| us.len()).unwrap_or(0)
        );
        let users = builtin_users
            .unwrap_or_default()
            .into_iter()
            .map(|user| (user.username.clone(), user))
            .collect();
        Self {
            users: Mutex::new(users),
        }
    }

    pub async fn create_user(&self, user: SipUser) -> Result<()> {
        self.users.lock().await.insert(user.username.clone(), user);
        Ok(())
    }

    pub async fn delete_user(&self, login: &str) -> Result<()> {
        self.users.lock().await.remove(login);
        Ok(())
    }

    pub async fn set_enabled(&self, login: &str, enabled: bool) -> Result<()> {
        let mut users = self.users.lock().await;
        let user = users
            .get_mut(login)
            .ok_or_else(|| anyhow::anyhow!("missing user: {}", login))?;
        user.enabled = enabled;
        Ok(())
    }
}

#[async_trait]
impl UserBackend for MemoryUserBackend {
    async fn find_by_login(&self, login: &str) -> Result<Option<SipUser>> {
        Ok(self
            .users
            .lock()
            .await
            .get(login)
            .filter(|user| user.enabled)
            .cloned())
    }
}

pub async fn create_user_backend(config: &UserBackendConfig) -> Result<Box<dyn UserBackend>> {
    match config {
        UserBackendConfig::Memory { users } => {
            let users = users
                .iter()
                .enumerate()
                .map(|(i, entry)| SipUser::parse_entry(i as u64 + 1, entry))
                .collect::<Result<Vec<_>>>()?;
            Ok(Box::new(MemoryUserBackend::new(Some(users))) as Box<dyn UserBackend>)
        }
        UserBackendConfig::Plain { path } => {
            let backend = PlainTextBackend::new(path);
            backend.load().await?;
            Ok(Box::new(backend) as Box<dyn UserBackend>)
        }
    }
}
