use rsipstack::transport::SipAddr;
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{sync::Mutex, time::Instant};
use tokio_util::sync::CancellationToken;

/// Correlates retransmissions and CANCELs with the INVITE they belong to:
/// the branch of the topmost Via.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InviteKey(pub String);

impl InviteKey {
    pub fn from_request(req: &rsip::Request) -> Option<Self> {
        super::transform::top_via_branch(&req.headers).map(InviteKey)
    }
}

impl std::fmt::Display for InviteKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "INVITE|{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Trying,
    Proxying,
    Early,
    Confirmed,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct OutboundInvite {
    pub request: rsip::Request,
    pub destination: SipAddr,
}

pub struct InviteContext {
    pub key: InviteKey,
    /// Inbound INVITE with Max-Forwards already decremented.
    pub original: rsip::Request,
    /// `host:port` the caller is reached at.
    pub source: String,
    pub outbound: Mutex<Option<OutboundInvite>>,
    pub created_at: Instant,
    /// Stops the INVITE handler without answering; fired by the sweeper.
    pub token: CancellationToken,
    /// Fired when a CANCEL for this INVITE arrives as its own transaction.
    pub cancelled: CancellationToken,
    last_response: StdMutex<Option<rsip::Response>>,
    state: StdMutex<CallState>,
    finalized: AtomicBool,
    dialog_created: AtomicBool,
}

pub type InviteContextRef = Arc<InviteContext>;

impl InviteContext {
    pub fn new(
        key: InviteKey,
        original: rsip::Request,
        source: String,
        token: CancellationToken,
    ) -> Self {
        Self {
            key,
            original,
            source,
            outbound: Mutex::new(None),
            created_at: Instant::now(),
            token,
            cancelled: CancellationToken::new(),
            last_response: StdMutex::new(None),
            state: StdMutex::new(CallState::Trying),
            finalized: AtomicBool::new(false),
            dialog_created: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> CallState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(CallState::Terminated)
    }

    pub fn set_state(&self, state: CallState) {
        if let Ok(mut s) = self.state.lock() {
            *s = state;
        }
    }

    /// Last response sent upstream, replayed to retransmitted INVITEs.
    pub fn last_response(&self) -> Option<rsip::Response> {
        self.last_response.lock().ok().and_then(|last| last.clone())
    }

    pub fn set_last_response(&self, response: &rsip::Response) {
        if let Ok(mut last) = self.last_response.lock() {
            *last = Some(response.clone());
        }
    }

    /// Claims the right to deliver the final response. Only the first caller
    /// gets `true`.
    pub fn finalize(&self) -> bool {
        self.finalized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    /// Claims the right to store the dialog pair. Only the first caller gets
    /// `true`.
    pub fn mark_dialog_created(&self) -> bool {
        self.dialog_created
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

pub enum StoreResult {
    Stored(InviteContextRef),
    Existing(InviteContextRef),
}

#[derive(Default)]
pub struct InviteTable {
    entries: Mutex<HashMap<InviteKey, InviteContextRef>>,
}

impl InviteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// First write wins: an existing entry for the key is returned untouched.
    pub async fn store(&self, ctx: InviteContext) -> StoreResult {
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.get(&ctx.key) {
            return StoreResult::Existing(existing.clone());
        }
        let ctx = Arc::new(ctx);
        entries.insert(ctx.key.clone(), ctx.clone());
        StoreResult::Stored(ctx)
    }

    pub async fn get(&self, key: &InviteKey) -> Option<InviteContextRef> {
        self.entries.lock().await.get(key).cloned()
    }

    pub async fn remove(&self, key: &InviteKey) -> Option<InviteContextRef> {
        self.entries.lock().await.remove(key)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Drops entries older than `max_age` and stops their INVITE handlers.
    /// Returns how many were removed.
    pub async fn sweep(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, ctx| {
            let keep = now.duration_since(ctx.created_at) < max_age;
            if !keep {
                ctx.token.cancel();
            }
            keep
        });
        before - entries.len()
    }
}
