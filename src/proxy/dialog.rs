use std::collections::HashMap;
use tokio::sync::Mutex;

/// Call-ID plus the tags of both ends, in either order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogKey {
    pub call_id: String,
    pub tag_a: String,
    pub tag_b: String,
}

impl DialogKey {
    pub fn new(call_id: &str, tag_a: &str, tag_b: &str) -> Self {
        Self {
            call_id: call_id.to_string(),
            tag_a: tag_a.to_string(),
            tag_b: tag_b.to_string(),
        }
    }

    pub fn reversed(&self) -> Self {
        Self::new(&self.call_id, &self.tag_b, &self.tag_a)
    }
}

impl std::fmt::Display for DialogKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}|{}", self.call_id, self.tag_a, self.tag_b)
    }
}

/// How to reach the far end of one direction of a dialog.
#[derive(Debug, Clone)]
pub struct DialogContext {
    pub remote_target: rsip::Uri,
    /// Nearest hop first.
    pub route_set: Vec<rsip::Uri>,
    /// Set on the entry whose requests originate from the caller.
    pub from_caller: bool,
}

#[derive(Default)]
pub struct DialogTable {
    entries: Mutex<HashMap<DialogKey, DialogContext>>,
}

impl DialogTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores both directions under one lock. An already stored pair is kept.
    pub async fn store_pair(
        &self,
        key_ab: DialogKey,
        ctx_ab: DialogContext,
        key_ba: DialogKey,
        ctx_ba: DialogContext,
    ) -> bool {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&key_ab) || entries.contains_key(&key_ba) {
            return false;
        }
        entries.insert(key_ab, ctx_ab);
        entries.insert(key_ba, ctx_ba);
        true
    }

    /// Tries `(tag_x, tag_y)` then `(tag_y, tag_x)`.
    pub async fn lookup(&self, call_id: &str, tag_x: &str, tag_y: &str) -> Option<(DialogKey, DialogContext)> {
        let entries = self.entries.lock().await;
        let key = DialogKey::new(call_id, tag_x, tag_y);
        if let Some(ctx) = entries.get(&key) {
            return Some((key, ctx.clone()));
        }
        let key = key.reversed();
        entries.get(&key).map(|ctx| (key, ctx.clone()))
    }

    /// Removes both orderings. Returns false when nothing was stored.
    pub async fn delete_pair(&self, key: &DialogKey) -> bool {
        let mut entries = self.entries.lock().await;
        let a = entries.remove(key).is_some();
        let b = entries.remove(&key.reversed()).is_some();
        a || b
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}
