use anyhow::Result;
use async_trait::async_trait;
use std::{collections::HashMap, time::Duration};
use tokio::{sync::RwLock, time::Instant};

/// Where a registered user can currently be reached.
#[derive(Debug, Clone)]
pub struct ContactBinding {
    pub user: String,
    pub contact: rsip::Uri,
    /// Transport address the REGISTER arrived from.
    pub source: String,
    pub expires_at: Instant,
}

impl ContactBinding {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[async_trait]
pub trait Locator: Send + Sync {
    /// Upserts the binding for `user`. A zero `ttl` uses the default lifetime.
    async fn register(
        &self,
        user: &str,
        contact: rsip::Uri,
        source: &str,
        ttl: Duration,
    ) -> Result<ContactBinding>;
    async fn unregister(&self, user: &str) -> Result<()>;
    /// Returns the binding if unexpired. Expired bindings are evicted.
    async fn lookup(&self, user: &str) -> Result<Option<ContactBinding>>;
    async fn count(&self) -> usize;
}

pub struct MemoryLocator {
    default_ttl: Duration,
    bindings: RwLock<HashMap<String, ContactBinding>>,
}

impl MemoryLocator {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            bindings: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Locator for MemoryLocator {
    async fn register(
        &self,
        user: &str,
        contact: rsip::Uri,
        source: &str,
        ttl: Duration,
    ) -> Result<ContactBinding> {
        let ttl = if ttl.is_zero() { self.default_ttl } else { ttl };
        let binding = ContactBinding {
            user: user.to_string(),
            contact,
            source: source.to_string(),
            expires_at: Instant::now() + ttl,
        };
        self.bindings
            .write()
            .await
            .insert(user.to_string(), binding.clone());
        Ok(binding)
    }

    async fn unregister(&self, user: &str) -> Result<()> {
        self.bindings.write().await.remove(user);
        Ok(())
    }

    async fn lookup(&self, user: &str) -> Result<Option<ContactBinding>> {
        let now = Instant::now();
        {
            let bindings = self.bindings.read().await;
            match bindings.get(user) {
                None => return Ok(None),
                Some(binding) if !binding.is_expired(now) => return Ok(Some(binding.clone())),
                Some(_) => {}
            }
        }
        let mut bindings = self.bindings.write().await;
        // re-check, a REGISTER may have refreshed it between the two locks
        match bindings.get(user) {
            Some(binding) if !binding.is_expired(Instant::now()) => Ok(Some(binding.clone())),
            Some(_) => {
                bindings.remove(user);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn count(&self) -> usize {
        self.bindings.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(s: &str) -> rsip::Uri {
        rsip::Uri::try_from(s).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_binding_expires_at_ttl() {
        let locator = MemoryLocator::new(Duration::from_secs(60));
        locator
            .register(
                "alice",
                contact("sip:alice@10.0.0.9:55000"),
                "10.0.0.9:55000",
                Duration::from_secs(10),
            )
            .await
            .unwrap();

        tokio::time::advance(Duration::from_millis(9_999)).await;
        assert!(locator.lookup("alice").await.unwrap().is_some());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(locator.lookup("alice").await.unwrap().is_none());
        assert_eq!(locator.count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_uses_default() {
        let locator = MemoryLocator::new(Duration::from_secs(60));
        locator
            .register("bob", contact("sip:bob@10.0.0.3"), "10.0.0.3:5060", Duration::ZERO)
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(locator.lookup("bob").await.unwrap().is_some());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(locator.lookup("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_last_register_wins() {
        let locator = MemoryLocator::new(Duration::from_secs(60));
        locator
            .register("alice", contact("sip:alice@10.0.0.1"), "10.0.0.1:5060", Duration::ZERO)
            .await
            .unwrap();
        locator
            .register("alice", contact("sip:alice@10.0.0.2"), "10.0.0.2:5060", Duration::ZERO)
            .await
            .unwrap();
        let binding = locator.lookup("alice").await.unwrap().unwrap();
        assert_eq!(binding.source, "10.0.0.2:5060");
        assert_eq!(locator.count().await, 1);

        locator.unregister("alice").await.unwrap();
        assert!(locator.lookup("alice").await.unwrap().is_none());
    }
}
