//! ToolDispatcher — routes captured tool payloads to registered handlers.
//!
//! A payload is the text the segmenter captured between tool markers:
//!
//! ```text
//! {"action": "Family.operation", "arguments": {...}}
//! ```
//!
//! `arguments` may also arrive as a JSON-encoded string, which small models
//! produce when they copy the prompt's example literally. Handlers are looked
//! up in an explicit `(family, operation)` registry; there is no reflection.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::errors::DispatchError;
use super::segmenter::DelimiterSpec;

/// Notice returned when no handler matches the action.
pub const TOOL_NOT_FOUND: &str = "tool not found";

// ─── Public Types ────────────────────────────────────────────────────────────

/// Post-processor applied to the reply of a [`ToolResult::Feedback`] call.
pub type FormatFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// What a handler asks the conversation loop to do next.
#[derive(Clone)]
pub enum ToolResult {
    /// Side-channel notice for the caller; conversation state is unchanged.
    System(String),
    /// Final content; the loop stops.
    End(String),
    /// Context fed back to the model in place of the last exchange.
    Result(String),
    /// Ask the model once more with `query`, format its reply, and stop.
    Feedback { query: String, format: FormatFn },
}

impl ToolResult {
    pub fn feedback<F>(query: impl Into<String>, format: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        ToolResult::Feedback {
            query: query.into(),
            format: Arc::new(format),
        }
    }

    /// Whether this result ends the conversation loop.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ToolResult::End(_) | ToolResult::Feedback { .. })
    }
}

impl fmt::Debug for ToolResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolResult::System(t) => f.debug_tuple("System").field(t).finish(),
            ToolResult::End(t) => f.debug_tuple("End").field(t).finish(),
            ToolResult::Result(t) => f.debug_tuple("Result").field(t).finish(),
            ToolResult::Feedback { query, .. } => f
                .debug_struct("Feedback")
                .field("query", query)
                .finish_non_exhaustive(),
        }
    }
}

/// A decoded tool payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    /// `"Family.operation"` as written by the model.
    pub action: String,
    pub arguments: Map<String, Value>,
}

impl ToolInvocation {
    /// Decode a captured payload.
    ///
    /// `arguments` may be an object, a JSON string holding an object, or
    /// absent / `null` / `""` (no arguments).
    pub fn parse(payload: &str) -> Result<Self, DispatchError> {
        let value: Value = serde_json::from_str(payload.trim())?;

        let Value::Object(mut obj) = value else {
            return Err(DispatchError::Parse {
                reason: "payload is not a JSON object".into(),
            });
        };

        let action = match obj.remove("action") {
            Some(Value::String(action)) if !action.trim().is_empty() => action.trim().to_string(),
            _ => {
                return Err(DispatchError::Parse {
                    reason: "missing string field 'action'".into(),
                })
            }
        };

        let arguments = match obj.remove("arguments") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(Value::String(raw)) if raw.trim().is_empty() => Map::new(),
            Some(Value::String(raw)) => match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Object(map)) => map,
                Ok(other) => {
                    return Err(DispatchError::Arguments {
                        action,
                        reason: format!("expected an object, got {other}"),
                    })
                }
                Err(e) => {
                    return Err(DispatchError::Arguments {
                        action,
                        reason: e.to_string(),
                    })
                }
            },
            Some(other) => {
                return Err(DispatchError::Arguments {
                    action,
                    reason: format!("expected an object, got {other}"),
                })
            }
        };

        Ok(Self { action, arguments })
    }

    /// `(family, operation)`, or `None` when the action has no `.`.
    pub fn split_action(&self) -> Option<(&str, &str)> {
        self.action.split_once('.')
    }

    /// Canonical JSON of the arguments (keys sorted).
    pub fn arguments_json(&self) -> String {
        Value::Object(self.arguments.clone()).to_string()
    }

    /// Stable key identifying this exact action + arguments pair.
    pub fn call_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.action.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.arguments_json().as_bytes());
        let hash = hasher.finalize();
        format!("{hash:x}")
    }
}

/// Per-request information handed to every handler.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub identity: String,
    pub persona: String,
    /// The user query that started the turn.
    pub query: String,
}

/// A callable tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn family(&self) -> &str;
    fn operation(&self) -> &str;
    fn description(&self) -> &str;

    /// Example argument object shown to the model in the catalogue.
    fn argument_schema(&self) -> Value {
        Value::Object(Map::new())
    }

    async fn invoke(&self, ctx: &ToolContext, arguments: &Map<String, Value>) -> Vec<ToolResult>;
}

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// Explicit `(family, operation) → handler` table.
#[derive(Default)]
pub struct ToolRegistry {
    handlers: HashMap<(String, String), Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) -> Result<(), DispatchError> {
        let key = (handler.family().to_string(), handler.operation().to_string());
        if self.handlers.contains_key(&key) {
            return Err(DispatchError::DuplicateTool {
                action: format!("{}.{}", key.0, key.1),
            });
        }
        self.handlers.insert(key, handler);
        Ok(())
    }

    pub fn get(&self, family: &str, operation: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers
            .get(&(family.to_string(), operation.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Sorted `Family.operation` names.
    pub fn actions(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .keys()
            .map(|(family, op)| format!("{family}.{op}"))
            .collect();
        names.sort();
        names
    }

    /// Render the tool instructions for the system prompt.
    ///
    /// `grammar` supplies the markers the model must wrap its call in.
    pub fn catalogue(&self, grammar: &DelimiterSpec) -> String {
        if self.handlers.is_empty() {
            return String::new();
        }

        let mut entries: Vec<&Arc<dyn ToolHandler>> = self.handlers.values().collect();
        entries.sort_by(|a, b| {
            (a.family(), a.operation()).cmp(&(b.family(), b.operation()))
        });

        let mut out = format!(
            "You can use the following tools. To call one, write a {start} block \
             containing a JSON object with the tool name and its arguments, then close \
             the block with {end}:\n\
             {start}\n{{\"action\": \"Family.operation\", \"arguments\": {{...}}}}\n{end}\n\
             Only call a tool when the query needs it, and never call the same tool \
             twice with the same arguments.\n\nAvailable tools:\n",
            start = grammar.start,
            end = grammar.end,
        );

        for handler in entries {
            out.push_str(&format!(
                "Tool Name: {}.{}\n  - Description: {}\n  - Arguments: {}\n",
                handler.family(),
                handler.operation(),
                handler.description(),
                handler.argument_schema(),
            ));
        }
        out
    }
}

// ─── ToolDispatcher ──────────────────────────────────────────────────────────

/// A dispatched call and the results its handler produced.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub invocation: ToolInvocation,
    pub results: Vec<ToolResult>,
}

/// Parses payloads and invokes the matching handler.
#[derive(Clone)]
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
}

impl ToolDispatcher {
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Decode `payload` and run its handler.
    ///
    /// An unknown action is not an error: it yields a single
    /// `System("tool not found")` result.
    pub async fn dispatch(
        &self,
        payload: &str,
        ctx: &ToolContext,
    ) -> Result<Dispatched, DispatchError> {
        let invocation = ToolInvocation::parse(payload)?;

        tracing::info!(
            action = %invocation.action,
            arguments = %invocation.arguments_json(),
            identity = %ctx.identity,
            persona = %ctx.persona,
            "dispatching tool call"
        );

        let handler = invocation
            .split_action()
            .and_then(|(family, op)| self.registry.get(family, op));

        let results = match handler {
            Some(handler) => handler.invoke(ctx, &invocation.arguments).await,
            None => {
                tracing::warn!(action = %invocation.action, "tool not found");
                vec![ToolResult::System(TOOL_NOT_FOUND.to_string())]
            }
        };

        Ok(Dispatched {
            invocation,
            results,
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl ToolHandler for Echo {
        fn family(&self) -> &str {
            "Echo"
        }
        fn operation(&self) -> &str {
            "say"
        }
        fn description(&self) -> &str {
            "Repeat the given text"
        }
        fn argument_schema(&self) -> Value {
            json!({"text": "string"})
        }
        async fn invoke(&self, _ctx: &ToolContext, args: &Map<String, Value>) -> Vec<ToolResult> {
            let text = args.get("text").and_then(Value::as_str).unwrap_or_default();
            vec![ToolResult::Result(format!("echo: {text}"))]
        }
    }

    fn dispatcher() -> ToolDispatcher {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo)).unwrap();
        ToolDispatcher::new(registry)
    }

    #[test]
    fn test_parse_object_arguments() {
        let inv = ToolInvocation::parse(r#"{"action":"Echo.say","arguments":{"text":"hi"}}"#)
            .unwrap();
        assert_eq!(inv.action, "Echo.say");
        assert_eq!(inv.arguments["text"], "hi");
        assert_eq!(inv.split_action(), Some(("Echo", "say")));
    }

    #[test]
    fn test_parse_string_encoded_arguments() {
        let inv = ToolInvocation::parse(
            r#"  {"action": "Echo.say", "arguments": "{\"text\": \"hi\"}"}  "#,
        )
        .unwrap();
        assert_eq!(inv.arguments["text"], "hi");
    }

    #[test]
    fn test_parse_missing_arguments_is_empty() {
        for payload in [
            r#"{"action":"Clock.get_time"}"#,
            r#"{"action":"Clock.get_time","arguments":null}"#,
            r#"{"action":"Clock.get_time","arguments":""}"#,
        ] {
            let inv = ToolInvocation::parse(payload).unwrap();
            assert!(inv.arguments.is_empty(), "{payload}");
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            ToolInvocation::parse("not json"),
            Err(DispatchError::Parse { .. })
        ));
        assert!(matches!(
            ToolInvocation::parse("[1, 2]"),
            Err(DispatchError::Parse { .. })
        ));
        assert!(matches!(
            ToolInvocation::parse(r#"{"arguments":{}}"#),
            Err(DispatchError::Parse { .. })
        ));
        assert!(matches!(
            ToolInvocation::parse(r#"{"action":"Echo.say","arguments":"{broken"}"#),
            Err(DispatchError::Arguments { .. })
        ));
        assert!(matches!(
            ToolInvocation::parse(r#"{"action":"Echo.say","arguments":[1]}"#),
            Err(DispatchError::Arguments { .. })
        ));
    }

    #[test]
    fn test_call_key_ignores_key_order() {
        let a = ToolInvocation::parse(r#"{"action":"A.b","arguments":{"x":1,"y":2}}"#).unwrap();
        let b = ToolInvocation::parse(r#"{"action":"A.b","arguments":"{\"y\":2,\"x\":1}"}"#)
            .unwrap();
        let c = ToolInvocation::parse(r#"{"action":"A.b","arguments":{"x":2}}"#).unwrap();
        assert_eq!(a.call_key(), b.call_key());
        assert_ne!(a.call_key(), c.call_key());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo)).unwrap();
        let err = registry.register(Arc::new(Echo)).unwrap_err();
        assert!(matches!(err, DispatchError::DuplicateTool { action } if action == "Echo.say"));
    }

    #[test]
    fn test_catalogue_lists_tools() {
        let d = dispatcher();
        let text = d.registry().catalogue(&DelimiterSpec::tool_code());
        assert!(text.contains("```tool_code"));
        assert!(text.contains("Tool Name: Echo.say"));
        assert!(text.contains("  - Description: Repeat the given text"));
        assert!(text.contains(r#"  - Arguments: {"text":"string"}"#));
    }

    #[test]
    fn test_empty_registry_has_no_catalogue() {
        assert!(ToolRegistry::new()
            .catalogue(&DelimiterSpec::tool_code())
            .is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_known_tool() {
        let d = dispatcher();
        let out = d
            .dispatch(r#"{"action":"Echo.say","arguments":{"text":"hi"}}"#, &ToolContext::default())
            .await
            .unwrap();
        assert_eq!(out.invocation.action, "Echo.say");
        assert!(matches!(out.results.as_slice(), [ToolResult::Result(t)] if t == "echo: hi"));
    }

    #[tokio::test]
    async fn test_dispatch_unknown_tool() {
        let d = dispatcher();
        for payload in [r#"{"action":"Echo.shout"}"#, r#"{"action":"nodot"}"#] {
            let out = d.dispatch(payload, &ToolContext::default()).await.unwrap();
            assert!(
                matches!(out.results.as_slice(), [ToolResult::System(t)] if t == TOOL_NOT_FOUND),
                "{payload}"
            );
        }
    }

    #[test]
    fn test_feedback_format_applies() {
        let result = ToolResult::feedback("q", |reply| reply.to_uppercase());
        assert!(result.is_terminal());
        match result {
            ToolResult::Feedback { query, format } => {
                assert_eq!(query, "q");
                assert_eq!(format("done"), "DONE");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!ToolResult::Result(String::new()).is_terminal());
    }
}
