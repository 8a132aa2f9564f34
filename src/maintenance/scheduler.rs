//! MaintenanceScheduler — deferred memory compaction and log indexing.
//!
//! A finished request submits its transcript under `(identity, persona)`.
//! Two independent coalescing queues hold the latest transcript per key; a
//! periodic tick per queue drains them:
//!
//! - **memory**: prior note + transcript are resummarized and the note is
//!   overwritten.
//! - **index**: the summarizer names a few topic terms and the exchange is
//!   appended under each term as `[USER] …` / `[ASSISTANT] …` lines.
//!
//! Failures are logged and the item is dropped. There is no retry, and no
//! error ever reaches the request that produced the work.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::errors::MaintenanceError;
use super::queue::{mutex_lock, CoalescingQueue, WorkKey};
use super::store::{NoteStore, TermIndex};
use crate::config::RuntimeConfig;
use crate::inference::client::ModelClient;
use crate::inference::errors::InferenceError;
use crate::inference::types::{ChatMessage, ModelRequest};

// ─── Public Types ────────────────────────────────────────────────────────────

/// The exchange a request produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    pub query: String,
    pub answer: String,
}

/// Summarizer call parameters.
#[derive(Debug, Clone)]
pub struct SummarizerSettings {
    pub model: String,
    pub temperature: f32,
    pub max_terms: usize,
    pub memory_interval: Duration,
    pub index_interval: Duration,
}

impl SummarizerSettings {
    pub fn from_config(config: &RuntimeConfig) -> Result<Self, InferenceError> {
        let maint = &config.maintenance;
        Ok(Self {
            model: config.summarizer_model()?,
            temperature: maint.summarizer_temperature,
            max_terms: maint.max_terms,
            memory_interval: maint.memory_interval(),
            index_interval: maint.index_interval(),
        })
    }
}

/// Outcome of one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub processed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy)]
enum QueueKind {
    Memory,
    Index,
}

impl QueueKind {
    fn as_str(self) -> &'static str {
        match self {
            QueueKind::Memory => "memory",
            QueueKind::Index => "index",
        }
    }
}

// ─── State ───────────────────────────────────────────────────────────────────

struct TickRuntime {
    stop_txs: Vec<oneshot::Sender<()>>,
    joins: Vec<JoinHandle<()>>,
}

struct SchedulerState {
    memory_queue: CoalescingQueue<Transcript>,
    index_queue: CoalescingQueue<Transcript>,
    notes: Arc<dyn NoteStore>,
    index: Arc<dyn TermIndex>,
    summarizer: Arc<dyn ModelClient>,
    settings: SummarizerSettings,
    loops: Mutex<Option<TickRuntime>>,
}

/// Background maintenance owner. Cheap to clone.
#[derive(Clone)]
pub struct MaintenanceScheduler {
    state: Arc<SchedulerState>,
}

impl std::fmt::Debug for MaintenanceScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceScheduler")
            .field("memory_pending", &self.state.memory_queue.len())
            .field("index_pending", &self.state.index_queue.len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl MaintenanceScheduler {
    pub fn new(
        notes: Arc<dyn NoteStore>,
        index: Arc<dyn TermIndex>,
        summarizer: Arc<dyn ModelClient>,
        settings: SummarizerSettings,
    ) -> Self {
        Self {
            state: Arc::new(SchedulerState {
                memory_queue: CoalescingQueue::new(),
                index_queue: CoalescingQueue::new(),
                notes,
                index,
                summarizer,
                settings,
                loops: Mutex::new(None),
            }),
        }
    }

    /// Queue a finished exchange for both memory and index maintenance.
    ///
    /// Replaces any unprocessed transcript for the same key.
    pub fn submit(&self, key: WorkKey, transcript: Transcript) {
        let replaced_memory = self
            .state
            .memory_queue
            .submit(key.clone(), transcript.clone());
        let replaced_index = self.state.index_queue.submit(key.clone(), transcript);
        tracing::debug!(
            key = %key,
            coalesced = replaced_memory || replaced_index,
            "maintenance work submitted"
        );
    }

    pub fn pending(&self) -> (usize, usize) {
        (self.state.memory_queue.len(), self.state.index_queue.len())
    }

    /// Drain the memory queue once.
    pub async fn tick_memory(&self) -> TickReport {
        tick(&self.state, QueueKind::Memory).await
    }

    /// Drain the index queue once.
    pub async fn tick_index(&self) -> TickReport {
        tick(&self.state, QueueKind::Index).await
    }

    /// Memory context for the next request: the note plus frequent topics.
    ///
    /// Storage errors are logged and yield `None`.
    pub fn recall(&self, key: &WorkKey) -> Option<String> {
        let note = match self.state.notes.get(key) {
            Ok(note) => note.filter(|n| !n.trim().is_empty()),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "failed to load memory note");
                None
            }
        };
        let topics = match self
            .state
            .index
            .top_terms(key, self.state.settings.max_terms)
        {
            Ok(terms) => terms,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "failed to load index topics");
                Vec::new()
            }
        };

        match (note, topics.is_empty()) {
            (None, true) => None,
            (Some(note), true) => Some(note),
            (None, false) => Some(format!("Topics discussed before: {}", topics.join(", "))),
            (Some(note), false) => Some(format!(
                "{note}\nTopics discussed before: {}",
                topics.join(", ")
            )),
        }
    }

    // ─── Periodic loops ──────────────────────────────────────────────────

    /// Spawn the two tick loops. The first tick of each runs after its interval.
    pub fn start(&self) -> Result<(), MaintenanceError> {
        let settings = &self.state.settings;
        if settings.memory_interval.is_zero() || settings.index_interval.is_zero() {
            return Err(MaintenanceError::InvalidInterval);
        }

        let handle = Handle::try_current().map_err(|_| MaintenanceError::RuntimeUnavailable)?;
        let mut runtime = mutex_lock(&self.state.loops);
        if runtime
            .as_ref()
            .is_some_and(|r| r.joins.iter().any(|j| !j.is_finished()))
        {
            return Err(MaintenanceError::AlreadyRunning);
        }

        let mut stop_txs = Vec::with_capacity(2);
        let mut joins = Vec::with_capacity(2);
        for (kind, interval) in [
            (QueueKind::Memory, settings.memory_interval),
            (QueueKind::Index, settings.index_interval),
        ] {
            let (stop_tx, stop_rx) = oneshot::channel();
            let weak_state = Arc::downgrade(&self.state);
            joins.push(handle.spawn(tick_loop(weak_state, kind, interval, stop_rx)));
            stop_txs.push(stop_tx);
        }

        *runtime = Some(TickRuntime { stop_txs, joins });
        tracing::info!(
            memory_interval_secs = settings.memory_interval.as_secs(),
            index_interval_secs = settings.index_interval.as_secs(),
            "maintenance loops started"
        );
        Ok(())
    }

    /// Stop the tick loops and wait for them. Returns `true` if they were running.
    pub async fn stop(&self) -> bool {
        let runtime = {
            let mut guard = mutex_lock(&self.state.loops);
            guard.take()
        };

        let Some(runtime) = runtime else {
            return false;
        };

        for stop_tx in runtime.stop_txs {
            let _ = stop_tx.send(());
        }
        for join in runtime.joins {
            let _ = join.await;
        }
        tracing::info!("maintenance loops stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        let mut runtime = mutex_lock(&self.state.loops);
        if runtime
            .as_ref()
            .is_some_and(|r| r.joins.iter().all(|j| j.is_finished()))
        {
            *runtime = None;
            return false;
        }
        runtime.is_some()
    }
}

async fn tick_loop(
    state: Weak<SchedulerState>,
    kind: QueueKind,
    interval: Duration,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            _ = ticker.tick() => {
                let Some(state) = state.upgrade() else {
                    break;
                };
                tick(&state, kind).await;
            }
        }
    }
}

// ─── Processing ──────────────────────────────────────────────────────────────

async fn tick(state: &SchedulerState, kind: QueueKind) -> TickReport {
    let items = match kind {
        QueueKind::Memory => state.memory_queue.drain(),
        QueueKind::Index => state.index_queue.drain(),
    };

    let mut report = TickReport::default();
    for (key, transcript) in items {
        let result = match kind {
            QueueKind::Memory => compact_memory(state, &key, &transcript).await,
            QueueKind::Index => index_transcript(state, &key, &transcript).await,
        };
        match result {
            Ok(()) => report.processed += 1,
            Err(e) => {
                report.failed += 1;
                tracing::warn!(
                    queue = kind.as_str(),
                    key = %key,
                    error = %e,
                    "maintenance item failed, dropping"
                );
            }
        }
    }

    if report.processed + report.failed > 0 {
        tracing::info!(
            queue = kind.as_str(),
            processed = report.processed,
            failed = report.failed,
            "maintenance tick"
        );
    }
    report
}

async fn compact_memory(
    state: &SchedulerState,
    key: &WorkKey,
    transcript: &Transcript,
) -> Result<(), MaintenanceError> {
    let prior = state.notes.get(key)?;
    let prompt = format!(
        "Previous memory:\n{}\n\nNew exchange:\nUser: {}\nAssistant: {}",
        prior.as_deref().unwrap_or("(none)"),
        transcript.query,
        transcript.answer
    );
    let request = ModelRequest {
        model: state.settings.model.clone(),
        messages: vec![
            ChatMessage::system(MEMORY_INSTRUCTIONS),
            ChatMessage::user(prompt),
        ],
        temperature: state.settings.temperature,
    };

    let summary = state.summarizer.chat_completion(request).await?;
    let summary = summary.trim();
    if summary.is_empty() {
        return Err(MaintenanceError::Summarization {
            reason: "summarizer returned an empty note".into(),
        });
    }
    state.notes.put(key, summary)
}

async fn index_transcript(
    state: &SchedulerState,
    key: &WorkKey,
    transcript: &Transcript,
) -> Result<(), MaintenanceError> {
    let request = ModelRequest {
        model: state.settings.model.clone(),
        messages: vec![
            ChatMessage::system(format!(
                "List at most {} short topic keywords for the exchange below. \
                 Reply with a JSON array of lowercase strings and nothing else.",
                state.settings.max_terms
            )),
            ChatMessage::user(format!(
                "User: {}\nAssistant: {}",
                transcript.query, transcript.answer
            )),
        ],
        temperature: state.settings.temperature,
    };

    let reply = state.summarizer.chat_completion(request).await?;
    let terms = parse_terms(&reply, state.settings.max_terms)?;

    let user_line = format!("[USER] {}", escape_newlines(&transcript.query));
    let assistant_line = format!("[ASSISTANT] {}", escape_newlines(&transcript.answer));
    for term in &terms {
        state.index.append(key, term, &user_line)?;
        state.index.append(key, term, &assistant_line)?;
    }
    Ok(())
}

const MEMORY_INSTRUCTIONS: &str = "You maintain a short memory about the user. \
    Merge the previous memory with the new exchange, keep only durable facts, \
    preferences and ongoing topics, and reply with the updated memory only.";

/// Extract the JSON string array from a term-extraction reply.
///
/// Surrounding prose or code fences are tolerated; terms are normalized,
/// deduplicated and capped at `max_terms`.
pub fn parse_terms(reply: &str, max_terms: usize) -> Result<Vec<String>, MaintenanceError> {
    let malformed = || MaintenanceError::MalformedTerms {
        raw: reply.to_string(),
    };

    let start = reply.find('[').ok_or_else(malformed)?;
    let end = reply.rfind(']').ok_or_else(malformed)?;
    if end < start {
        return Err(malformed());
    }

    let raw: Vec<String> = serde_json::from_str(&reply[start..=end]).map_err(|_| malformed())?;

    let mut terms: Vec<String> = Vec::new();
    for term in raw {
        let term = super::store::normalize_term(&term);
        if !term.is_empty() && !terms.contains(&term) {
            terms.push(term);
        }
    }
    terms.truncate(max_terms);
    Ok(terms)
}

fn escape_newlines(text: &str) -> String {
    text.replace('\n', "\\n")
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::client::TokenStream;
    use crate::maintenance::store::MemoryDatabase;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Summarizer that answers term requests with a fixed array and memory
    /// requests with the user prompt it was given.
    struct FakeSummarizer {
        terms_reply: String,
        fail: bool,
        calls: AtomicUsize,
    }

    impl FakeSummarizer {
        fn new(terms_reply: &str) -> Self {
            Self {
                terms_reply: terms_reply.to_string(),
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ModelClient for FakeSummarizer {
        async fn chat_completion_stream(
            &self,
            _request: ModelRequest,
        ) -> Result<TokenStream, InferenceError> {
            Err(InferenceError::StreamError {
                reason: "not used".into(),
            })
        }

        async fn chat_completion(&self, request: ModelRequest) -> Result<String, InferenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(InferenceError::Timeout { duration_secs: 1 });
            }
            if request.messages[0].content.contains("JSON array") {
                return Ok(self.terms_reply.clone());
            }
            Ok(format!("NOTE<{}>", request.messages[1].content))
        }
    }

    fn settings() -> SummarizerSettings {
        SummarizerSettings {
            model: "summarizer".into(),
            temperature: 0.0,
            max_terms: 3,
            memory_interval: Duration::from_secs(10),
            index_interval: Duration::from_secs(10),
        }
    }

    fn scheduler(summarizer: FakeSummarizer) -> (MaintenanceScheduler, Arc<MemoryDatabase>) {
        let db = Arc::new(MemoryDatabase::open(":memory:").unwrap());
        let sched = MaintenanceScheduler::new(
            db.clone(),
            db.clone(),
            Arc::new(summarizer),
            settings(),
        );
        (sched, db)
    }

    fn transcript(query: &str, answer: &str) -> Transcript {
        Transcript {
            query: query.into(),
            answer: answer.into(),
        }
    }

    #[tokio::test]
    async fn test_coalesced_submissions_keep_only_latest() {
        let (sched, db) = scheduler(FakeSummarizer::new(r#"["tea"]"#));
        let key = WorkKey::new("alice", "default");
        sched.submit(key.clone(), transcript("w1 query", "w1 answer"));
        sched.submit(key.clone(), transcript("w2 query", "w2 answer"));
        assert_eq!(sched.pending(), (1, 1));

        let report = sched.tick_memory().await;
        assert_eq!(report, TickReport { processed: 1, failed: 0 });

        let note = db.get(&key).unwrap().unwrap();
        assert!(note.contains("w2 query"));
        assert!(!note.contains("w1"));
        assert_eq!(sched.pending(), (0, 1));
    }

    #[tokio::test]
    async fn test_distinct_keys_both_drained() {
        let (sched, db) = scheduler(FakeSummarizer::new(r#"["tea"]"#));
        let a = WorkKey::new("alice", "default");
        let b = WorkKey::new("bob", "default");
        sched.submit(a.clone(), transcript("qa", "aa"));
        sched.submit(b.clone(), transcript("qb", "ab"));

        assert_eq!(sched.tick_memory().await.processed, 2);
        assert!(db.get(&a).unwrap().is_some());
        assert!(db.get(&b).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_memory_includes_prior_note() {
        let (sched, db) = scheduler(FakeSummarizer::new("[]"));
        let key = WorkKey::new("alice", "default");
        db.put(&key, "likes tea").unwrap();
        sched.submit(key.clone(), transcript("q", "a"));
        sched.tick_memory().await;
        assert!(db.get(&key).unwrap().unwrap().contains("likes tea"));
    }

    #[tokio::test]
    async fn test_index_appends_escaped_lines_per_term() {
        let (sched, db) = scheduler(FakeSummarizer::new(
            "Sure!\n```json\n[\"Tea\", \"tea\", \"mornings\"]\n```",
        ));
        let key = WorkKey::new("alice", "default");
        sched.submit(key.clone(), transcript("tea\nplease", "here\nyou go"));

        assert_eq!(sched.tick_index().await.processed, 1);
        let lines = db.search(&key, "tea").unwrap();
        assert_eq!(lines, ["[USER] tea\\nplease", "[ASSISTANT] here\\nyou go"]);
        assert_eq!(db.search(&key, "mornings").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failures_are_dropped_without_retry() {
        let mut fake = FakeSummarizer::new("[]");
        fake.fail = true;
        let (sched, db) = scheduler(fake);
        let key = WorkKey::new("alice", "default");
        sched.submit(key.clone(), transcript("q", "a"));

        assert_eq!(sched.tick_memory().await, TickReport { processed: 0, failed: 1 });
        assert!(db.get(&key).unwrap().is_none());
        assert_eq!(sched.tick_memory().await, TickReport::default());
    }

    #[tokio::test]
    async fn test_malformed_terms_dropped() {
        let (sched, db) = scheduler(FakeSummarizer::new("tea, coffee"));
        let key = WorkKey::new("alice", "default");
        sched.submit(key.clone(), transcript("q", "a"));
        assert_eq!(sched.tick_index().await.failed, 1);
        assert!(db.top_terms(&key, 5).unwrap().is_empty());
    }

    #[test]
    fn test_parse_terms() {
        assert_eq!(
            parse_terms(r#"["A", " b ", "", "a", "c", "d"]"#, 3).unwrap(),
            ["a", "b", "c"]
        );
        assert!(parse_terms("no array here", 3).is_err());
        assert!(parse_terms("] backwards [", 3).is_err());
        assert!(parse_terms("[1, 2]", 3).is_err());
    }

    #[tokio::test]
    async fn test_recall_combines_note_and_topics() {
        let (sched, db) = scheduler(FakeSummarizer::new("[]"));
        let key = WorkKey::new("alice", "default");
        assert!(sched.recall(&key).is_none());

        db.put(&key, "likes tea").unwrap();
        db.append(&key, "tea", "[USER] x").unwrap();
        let recalled = sched.recall(&key).unwrap();
        assert_eq!(recalled, "likes tea\nTopics discussed before: tea");
    }

    #[tokio::test]
    async fn test_index_and_recall_stay_with_their_identity() {
        let (sched, db) = scheduler(FakeSummarizer::new(r#"["medical"]"#));
        let bob = WorkKey::new("bob", "default");
        sched.submit(bob.clone(), transcript("bob secret diagnosis", "ok"));
        assert_eq!(sched.tick_index().await.processed, 1);

        let alice = WorkKey::new("alice", "default");
        assert!(sched.recall(&alice).is_none());
        assert!(db.search(&alice, "medical").unwrap().is_empty());

        assert_eq!(
            sched.recall(&bob).as_deref(),
            Some("Topics discussed before: medical")
        );
        assert_eq!(
            db.search(&bob, "medical").unwrap(),
            ["[USER] bob secret diagnosis", "[ASSISTANT] ok"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_loops_drain_and_stop() {
        let (sched, db) = scheduler(FakeSummarizer::new(r#"["tea"]"#));
        let key = WorkKey::new("alice", "default");

        sched.start().unwrap();
        assert!(sched.is_running());
        assert!(matches!(sched.start(), Err(MaintenanceError::AlreadyRunning)));

        sched.submit(key.clone(), transcript("q", "a"));
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(sched.pending(), (0, 0));
        assert!(db.get(&key).unwrap().is_some());
        assert_eq!(db.search(&key, "tea").unwrap().len(), 2);

        assert!(sched.stop().await);
        assert!(!sched.is_running());
        assert!(!sched.stop().await);
    }

    #[test]
    fn test_start_requires_runtime() {
        let (sched, _db) = scheduler(FakeSummarizer::new("[]"));
        assert!(matches!(
            sched.start(),
            Err(MaintenanceError::RuntimeUnavailable)
        ));
    }
}
