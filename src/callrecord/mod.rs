use crate::config::CallRecordConfig;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, future::Future, path::Path, pin::Pin, sync::Arc, time::Instant};
use tokio::{fs::File, io::AsyncWriteExt, select};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub type CallRecordSender = tokio::sync::mpsc::UnboundedSender<CallRecordEvent>;
pub type CallRecordReceiver = tokio::sync::mpsc::UnboundedReceiver<CallRecordEvent>;

pub type FnSaveCallRecord = Arc<
    Box<
        dyn Fn(
                &CancellationToken,
                Arc<CallRecordConfig>,
                CallRecord,
            ) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>
            + Send
            + Sync,
    >,
>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndedBy {
    Caller,
    Callee,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallResult {
    Answered,
    Rejected,
    Cancelled,
    NoAnswer,
    Failed,
}

/// Milestones of a proxied call, reported by the proxy as they happen.
#[derive(Debug, Clone)]
pub enum CallRecordEvent {
    Started {
        call_id: String,
        from_tag: String,
        caller: String,
        callee: String,
        at: DateTime<Utc>,
    },
    Ringing {
        call_id: String,
        at: DateTime<Utc>,
    },
    Answered {
        call_id: String,
        to_tag: Option<String>,
        at: DateTime<Utc>,
    },
    Ended {
        call_id: String,
        status_code: u16,
        reason: String,
        ended_by: EndedBy,
        at: DateTime<Utc>,
    },
}

impl CallRecordEvent {
    pub fn call_id(&self) -> &str {
        match self {
            CallRecordEvent::Started { call_id, .. }
            | CallRecordEvent::Ringing { call_id, .. }
            | CallRecordEvent::Answered { call_id, .. }
            | CallRecordEvent::Ended { call_id, .. } => call_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: String,
    pub from_tag: String,
    pub to_tag: Option<String>,
    pub caller: String,
    pub callee: String,
    pub start_time: DateTime<Utc>,
    pub ring_time: Option<DateTime<Utc>>,
    pub answer_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub status_code: u16,
    pub reason: Option<String>,
    pub result: Option<CallResult>,
    pub ended_by: Option<EndedBy>,
    /// Milliseconds from start to first ringing.
    pub ring_ms: Option<i64>,
    /// Milliseconds from answer to end.
    pub talk_ms: Option<i64>,
}

impl CallRecord {
    fn finish(&mut self, status_code: u16, reason: String, ended_by: EndedBy, at: DateTime<Utc>) {
        self.end_time = Some(at);
        self.reason = Some(reason);
        self.ended_by = Some(ended_by);
        self.ring_ms = self
            .ring_time
            .map(|ring| (ring - self.start_time).num_milliseconds());
        self.talk_ms = self
            .answer_time
            .map(|answer| (at - answer).num_milliseconds());
        self.result = Some(match (self.answer_time, status_code) {
            (Some(_), _) => CallResult::Answered,
            (None, 487) => CallResult::Cancelled,
            (None, 408) | (None, 480) | (None, 504) => CallResult::NoAnswer,
            (None, 400..=699) => CallResult::Rejected,
            _ => CallResult::Failed,
        });
        if self.answer_time.is_none() || self.status_code == 0 {
            self.status_code = status_code;
        }
    }
}

/// Folds events into records; a record is complete on its `Ended` event.
#[derive(Default)]
pub struct CallRecordBook {
    pending: HashMap<String, CallRecord>,
}

impl CallRecordBook {
    pub fn apply(&mut self, event: CallRecordEvent) -> Option<CallRecord> {
        match event {
            CallRecordEvent::Started {
                call_id,
                from_tag,
                caller,
                callee,
                at,
            } => {
                self.pending.entry(call_id.clone()).or_insert(CallRecord {
                    call_id,
                    from_tag,
                    to_tag: None,
                    caller,
                    callee,
                    start_time: at,
                    ring_time: None,
                    answer_time: None,
                    end_time: None,
                    status_code: 0,
                    reason: None,
                    result: None,
                    ended_by: None,
                    ring_ms: None,
                    talk_ms: None,
                });
                None
            }
            CallRecordEvent::Ringing { call_id, at } => {
                if let Some(record) = self.pending.get_mut(&call_id) {
                    record.ring_time.get_or_insert(at);
                }
                None
            }
            CallRecordEvent::Answered {
                call_id,
                to_tag,
                at,
            } => {
                if let Some(record) = self.pending.get_mut(&call_id) {
                    record.answer_time.get_or_insert(at);
                    if record.to_tag.is_none() {
                        record.to_tag = to_tag;
                    }
                    record.status_code = 200;
                }
                None
            }
            CallRecordEvent::Ended {
                call_id,
                status_code,
                reason,
                ended_by,
                at,
            } => {
                let mut record = self.pending.remove(&call_id)?;
                record.finish(status_code, reason, ended_by, at);
                Some(record)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

pub struct CallRecordManager {
    pub sender: CallRecordSender,
    config: Arc<CallRecordConfig>,
    cancel_token: CancellationToken,
    receiver: CallRecordReceiver,
    saver_fn: FnSaveCallRecord,
}

pub struct CallRecordManagerBuilder {
    pub cancel_token: Option<CancellationToken>,
    pub config: Option<CallRecordConfig>,
    saver_fn: Option<FnSaveCallRecord>,
}

impl Default for CallRecordManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CallRecordManagerBuilder {
    pub fn new() -> Self {
        Self {
            cancel_token: None,
            config: None,
            saver_fn: None,
        }
    }

    pub fn with_cancel_token(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = Some(cancel_token);
        self
    }

    pub fn with_config(mut self, config: CallRecordConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_saver(mut self, saver: FnSaveCallRecord) -> Self {
        self.saver_fn = Some(saver);
        self
    }

    pub fn build(self) -> CallRecordManager {
        let cancel_token = self.cancel_token.unwrap_or_default();
        let config = Arc::new(self.config.unwrap_or_default());
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        let saver_fn = self
            .saver_fn
            .unwrap_or_else(|| Arc::new(Box::new(CallRecordManager::default_saver)));

        if let CallRecordConfig::Local { root } = config.as_ref() {
            if !Path::new(&root).exists() {
                match std::fs::create_dir_all(root) {
                    Ok(_) => {
                        info!("CallRecordManager created directory: {}", root);
                    }
                    Err(e) => {
                        error!("CallRecordManager failed to create directory: {}", e);
                    }
                }
            }
        }

        CallRecordManager {
            cancel_token,
            sender,
            receiver,
            config,
            saver_fn,
        }
    }
}

impl CallRecordManager {
    fn default_saver(
        _cancel_token: &CancellationToken,
        config: Arc<CallRecordConfig>,
        record: CallRecord,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
        Box::pin(async move {
            let start_time = Instant::now();
            let file_content = serde_json::to_string(&record)?;
            match config.as_ref() {
                CallRecordConfig::Local { root } => {
                    let file_name = Path::new(&root).join(format!("{}.json", record.call_id));
                    let mut file = File::create(&file_name).await?;
                    file.write_all(file_content.as_bytes()).await?;
                    file.flush().await?;
                    info!(
                        elapsed = ?start_time.elapsed(),
                        call_id = record.call_id,
                        file_name = %file_name.display(),
                        "CallRecordManager saved"
                    );
                }
                CallRecordConfig::Log => {
                    info!(call_id = record.call_id, record = file_content, "call record");
                }
            }
            Ok(())
        })
    }

    pub async fn serve(&mut self) {
        let token = self.cancel_token.clone();
        select! {
            _ = self.cancel_token.cancelled() => {
                info!("CallRecordManager cancelled");
            }
            _ = Self::recv_loop(
                token,
                self.config.clone(),
                self.saver_fn.clone(),
                &mut self.receiver,
            ) => {
                info!("CallRecordManager received done");
            }
        }
    }

    async fn recv_loop(
        cancel_token: CancellationToken,
        config: Arc<CallRecordConfig>,
        saver_fn: FnSaveCallRecord,
        receiver: &mut CallRecordReceiver,
    ) -> Result<()> {
        let mut book = CallRecordBook::default();
        while let Some(event) = receiver.recv().await {
            debug!(call_id = event.call_id(), "call record event");
            let record = match book.apply(event) {
                Some(record) => record,
                None => continue,
            };
            let cancel_token_ref = cancel_token.clone();
            let save_fn_ref = saver_fn.clone();
            let config_ref = config.clone();
            tokio::spawn(async move {
                select! {
                    _ = cancel_token_ref.cancelled() => {
                        warn!("CallRecordManager cancelled before record saved");
                    }
                    r = save_fn_ref(&cancel_token_ref, config_ref, record) => {
                        if let Err(e) = r {
                            error!("Failed to save call record: {}", e);
                        }
                    }
                }
            });
        }
        Ok(())
    }
}
