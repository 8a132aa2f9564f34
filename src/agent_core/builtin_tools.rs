//! Built-in tools: the clock and conversation-log search.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde_json::{json, Map, Value};

use super::dispatcher::{ToolContext, ToolHandler, ToolRegistry, ToolResult};
use super::errors::DispatchError;
use crate::maintenance::queue::WorkKey;
use crate::maintenance::store::TermIndex;

/// Reply fed back when the log index has nothing for a query.
pub const NO_LOG_RESULTS: &str =
    "No results found in logs, do not search logs for this query.";

/// Wrap tool output so the next round answers from it.
pub fn context_template(context: &str, query: &str) -> String {
    format!(
        "Here is some context for the query:\n{context}\n\n\
         Here is the query:\n{query}\n\n\
         Answer the query using the context provided above."
    )
}

/// Register every built-in tool.
pub fn register_builtin_tools(
    registry: &mut ToolRegistry,
    index: Arc<dyn TermIndex>,
) -> Result<(), DispatchError> {
    registry.register(Arc::new(ClockTool::default()))?;
    registry.register(Arc::new(LogSearchTool::new(index)))?;
    Ok(())
}

// ─── Clock.get_time ──────────────────────────────────────────────────────────

/// Source of the current local time.
pub type NowFn = Arc<dyn Fn() -> DateTime<Local> + Send + Sync>;

/// `Clock.get_time` — current local date and time.
pub struct ClockTool {
    now: NowFn,
}

impl Default for ClockTool {
    fn default() -> Self {
        Self {
            now: Arc::new(Local::now),
        }
    }
}

impl ClockTool {
    pub fn with_clock(now: NowFn) -> Self {
        Self { now }
    }
}

#[async_trait]
impl ToolHandler for ClockTool {
    fn family(&self) -> &str {
        "Clock"
    }

    fn operation(&self) -> &str {
        "get_time"
    }

    fn description(&self) -> &str {
        "Get the current local date and time"
    }

    async fn invoke(&self, ctx: &ToolContext, _arguments: &Map<String, Value>) -> Vec<ToolResult> {
        let now = (self.now)();
        let context = format!(
            "The current date and time is {}.",
            now.format("%A, %B %-d %Y, %H:%M")
        );
        vec![ToolResult::Result(context_template(&context, &ctx.query))]
    }
}

// ─── Logs.search_conversation_logs ───────────────────────────────────────────

/// `Logs.search_conversation_logs` — look up the caller's past exchanges by
/// topic. Only lines indexed for the same identity and persona are visible.
pub struct LogSearchTool {
    index: Arc<dyn TermIndex>,
}

impl LogSearchTool {
    pub fn new(index: Arc<dyn TermIndex>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl ToolHandler for LogSearchTool {
    fn family(&self) -> &str {
        "Logs"
    }

    fn operation(&self) -> &str {
        "search_conversation_logs"
    }

    fn description(&self) -> &str {
        "Search previous conversations for one or more comma-separated topic keywords"
    }

    fn argument_schema(&self) -> Value {
        json!({"terms": "<comma separated list of search terms>"})
    }

    async fn invoke(&self, ctx: &ToolContext, arguments: &Map<String, Value>) -> Vec<ToolResult> {
        let Some(terms) = arguments.get("terms").and_then(Value::as_str) else {
            return vec![ToolResult::System(
                "Logs.search_conversation_logs needs a 'terms' argument".into(),
            )];
        };

        let mut results = vec![ToolResult::System(format!("Searching logs for {terms}"))];
        let key = WorkKey::new(ctx.identity.as_str(), ctx.persona.as_str());

        let mut seen = BTreeSet::new();
        let mut lines = Vec::new();
        for term in terms.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match self.index.search(&key, term) {
                Ok(found) => {
                    for line in found {
                        if seen.insert(line.clone()) {
                            lines.push(line);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(term = %term, error = %e, "log search failed");
                }
            }
        }

        tracing::info!(key = %key, terms = %terms, hits = lines.len(), "log search");

        let context = if lines.is_empty() {
            NO_LOG_RESULTS.to_string()
        } else {
            lines.join("\n")
        };
        results.push(ToolResult::Result(context_template(&context, &ctx.query)));
        results
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maintenance::store::MemoryDatabase;
    use chrono::TimeZone;

    fn ctx() -> ToolContext {
        ToolContext {
            identity: "alice".into(),
            persona: "default".into(),
            query: "what did we say about tea?".into(),
        }
    }

    #[tokio::test]
    async fn test_clock_reports_time_in_context() {
        let fixed = Local.with_ymd_and_hms(2024, 3, 5, 14, 7, 0).unwrap();
        let tool = ClockTool::with_clock(Arc::new(move || fixed));
        let results = tool.invoke(&ctx(), &Map::new()).await;
        match results.as_slice() {
            [ToolResult::Result(text)] => {
                assert!(text.contains("Tuesday, March 5 2024, 14:07"));
                assert!(text.contains("Here is the query:\nwhat did we say about tea?"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_log_search_hits() {
        let db = Arc::new(MemoryDatabase::open(":memory:").unwrap());
        let alice = WorkKey::new("alice", "default");
        db.append(&alice, "tea", "[USER] I like green tea").unwrap();
        db.append(&alice, "tea", "[ASSISTANT] Noted").unwrap();
        db.append(&alice, "green", "[USER] I like green tea").unwrap();

        let tool = LogSearchTool::new(db);
        let mut args = Map::new();
        args.insert("terms".into(), json!("tea, green"));
        let results = tool.invoke(&ctx(), &args).await;

        assert!(matches!(&results[0], ToolResult::System(t) if t == "Searching logs for tea, green"));
        match &results[1] {
            ToolResult::Result(text) => {
                assert_eq!(text.matches("[USER] I like green tea").count(), 1);
                assert!(text.contains("[ASSISTANT] Noted"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_log_search_no_results() {
        let db = Arc::new(MemoryDatabase::open(":memory:").unwrap());
        let tool = LogSearchTool::new(db);
        let mut args = Map::new();
        args.insert("terms".into(), json!("nothing"));
        let results = tool.invoke(&ctx(), &args).await;
        assert!(matches!(&results[1], ToolResult::Result(t) if t.contains(NO_LOG_RESULTS)));
    }

    #[tokio::test]
    async fn test_log_search_missing_terms() {
        let db = Arc::new(MemoryDatabase::open(":memory:").unwrap());
        let tool = LogSearchTool::new(db);
        let results = tool.invoke(&ctx(), &Map::new()).await;
        assert!(matches!(results.as_slice(), [ToolResult::System(_)]));

        let mut args = Map::new();
        args.insert("query".into(), json!("tea"));
        let results = tool.invoke(&ctx(), &args).await;
        assert!(matches!(results.as_slice(), [ToolResult::System(t)] if t.contains("'terms'")));
    }

    #[tokio::test]
    async fn test_log_search_ignores_other_identities() {
        let db = Arc::new(MemoryDatabase::open(":memory:").unwrap());
        db.append(&WorkKey::new("bob", "default"), "medical", "[USER] bob secret diagnosis")
            .unwrap();

        let tool = LogSearchTool::new(db);
        let mut args = Map::new();
        args.insert("terms".into(), json!("medical"));
        let results = tool.invoke(&ctx(), &args).await;
        match &results[1] {
            ToolResult::Result(text) => {
                assert!(text.contains(NO_LOG_RESULTS));
                assert!(!text.contains("bob"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_log_search_schema_names_terms() {
        let db = Arc::new(MemoryDatabase::open(":memory:").unwrap());
        let schema = LogSearchTool::new(db).argument_schema();
        assert!(schema.get("terms").is_some());
    }

    #[test]
    fn test_register_builtin_tools() {
        let db = Arc::new(MemoryDatabase::open(":memory:").unwrap());
        let mut registry = ToolRegistry::new();
        register_builtin_tools(&mut registry, db).unwrap();
        assert_eq!(
            registry.actions(),
            ["Clock.get_time", "Logs.search_conversation_logs"]
        );
    }
}
