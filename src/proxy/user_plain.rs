use super::user::{SipUser, UserBackend};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Users read from a text file, one `login[:proxy|redirect]` per line.
/// Blank lines and lines starting with `#` are skipped.
pub struct PlainTextBackend {
    users: Arc<Mutex<HashMap<String, SipUser>>>,
    path: String,
}

impl PlainTextBackend {
    pub fn new(path: &str) -> Self {
        info!("Creating PlainTextBackend: {}", path);
        Self {
            users: Arc::new(Mutex::new(HashMap::new())),
            path: path.to_string(),
        }
    }

    pub async fn load(&self) -> Result<()> {
        let content = tokio::fs::read_to_string(Path::new(&self.path))
            .await
            .map_err(|e| anyhow::anyhow!("{}: {}", e, self.path))?;

        let mut loaded = HashMap::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match SipUser::parse_entry(loaded.len() as u64 + 1, line) {
                Ok(user) => {
                    loaded.insert(user.username.clone(), user);
                }
                Err(e) => warn!(path = self.path, line = lineno + 1, "skip user entry: {}", e),
            }
        }

        let mut users = self
            .users
            .lock()
            .map_err(|_| anyhow::anyhow!("user table poisoned"))?;
        *users = loaded;
        info!("Loaded {} users from {}", users.len(), self.path);
        Ok(())
    }
}

#[async_trait]
impl UserBackend for PlainTextBackend {
    async fn find_by_login(&self, login: &str) -> Result<Option<SipUser>> {
        let users = self
            .users
            .lock()
            .map_err(|_| anyhow::anyhow!("user table poisoned"))?;
        Ok(users.get(login).filter(|user| user.enabled).cloned())
    }
}
