//! Incremental delimiter segmentation of streamed model output.
//!
//! A [`StreamSegmenter`] watches a text stream for one delimiter grammar
//! (`start … end`) and splits it into pass-through prose and captured
//! regions. Fragments may split a marker anywhere, including inside a
//! multi-byte character boundary of the marker text; the output is the same
//! whatever the chunking.
//!
//! Several grammars are composed with a [`SegmenterChain`]: the pass-through
//! output of one segmenter is fed into the next.

use serde::{Deserialize, Serialize};

use super::errors::AgentError;

// ─── Public Types ────────────────────────────────────────────────────────────

/// What a captured region is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrammarKind {
    /// Model reasoning, hidden from the user by default.
    Reasoning,
    /// A tool invocation payload.
    Tool,
}

/// A named delimiter grammar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelimiterSpec {
    pub name: String,
    pub kind: GrammarKind,
    pub start: String,
    pub end: String,
}

impl DelimiterSpec {
    pub fn new(name: &str, kind: GrammarKind, start: &str, end: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            start: start.to_string(),
            end: end.to_string(),
        }
    }

    /// `<think>` … `</think>` reasoning grammar.
    pub fn reasoning() -> Self {
        Self::new("think", GrammarKind::Reasoning, "<think>", "</think>")
    }

    /// Fenced ```` ```tool_code ```` … ```` ``` ```` tool grammar.
    pub fn tool_code() -> Self {
        Self::new("tool_code", GrammarKind::Tool, "```tool_code", "```")
    }
}

/// Output of [`StreamSegmenter::feed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentEvent {
    /// Text outside any delimited region, markers removed.
    PassThrough(String),
    /// A completed delimited region, markers stripped.
    Captured {
        grammar: String,
        kind: GrammarKind,
        content: String,
    },
}

/// Scanner position relative to the grammar's markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// Plain text; no candidate start marker buffered.
    Outside,
    /// A proper prefix of the start marker is buffered.
    Scanning,
    /// Inside a region; waiting for the end marker.
    Inside,
}

// ─── StreamSegmenter ─────────────────────────────────────────────────────────

/// Finite-state segmenter for a single delimiter grammar.
///
/// One instance per stream. Never fails: malformed input degrades to
/// pass-through text, and an unterminated region at stream end stays
/// buffered and is never emitted.
#[derive(Debug, Clone)]
pub struct StreamSegmenter {
    spec: DelimiterSpec,
    state: ScanState,
    /// Candidate start-marker prefix (Outside/Scanning).
    pending: String,
    /// Region content plus any partial end marker (Inside).
    captured: String,
    matches: Vec<String>,
}

impl StreamSegmenter {
    pub fn new(spec: DelimiterSpec) -> Result<Self, AgentError> {
        validate_spec(&spec)?;
        Ok(Self {
            spec,
            state: ScanState::Outside,
            pending: String::new(),
            captured: String::new(),
            matches: Vec::new(),
        })
    }

    pub fn spec(&self) -> &DelimiterSpec {
        &self.spec
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Every region captured so far, in completion order.
    pub fn matches(&self) -> &[String] {
        &self.matches
    }

    /// Number of characters held back (partial marker or open region).
    pub fn buffered_len(&self) -> usize {
        self.pending.chars().count() + self.captured.chars().count()
    }

    /// Consume one fragment and return the events it completes.
    ///
    /// Adjacent pass-through text within one call is coalesced.
    pub fn feed(&mut self, fragment: &str) -> Vec<SegmentEvent> {
        let mut events = Vec::new();
        let mut out = String::new();

        for ch in fragment.chars() {
            match self.state {
                ScanState::Outside | ScanState::Scanning => self.scan(ch, &mut out),
                ScanState::Inside => self.capture(ch, &mut out, &mut events),
            }
        }

        if !out.is_empty() {
            events.push(SegmentEvent::PassThrough(out));
        }
        events
    }

    fn scan(&mut self, ch: char, out: &mut String) {
        self.pending.push(ch);

        // Release leading characters until the buffer is again a prefix of
        // the start marker. Every suffix is re-examined, so an overlapping
        // marker ("<<think>") is still found.
        while !self.spec.start.starts_with(self.pending.as_str()) {
            let mut chars = self.pending.chars();
            if let Some(first) = chars.next() {
                out.push(first);
            }
            self.pending = chars.as_str().to_string();
        }

        if self.pending == self.spec.start {
            self.pending.clear();
            self.state = ScanState::Inside;
        } else if self.pending.is_empty() {
            self.state = ScanState::Outside;
        } else {
            self.state = ScanState::Scanning;
        }
    }

    fn capture(&mut self, ch: char, out: &mut String, events: &mut Vec<SegmentEvent>) {
        self.captured.push(ch);
        if !self.captured.ends_with(self.spec.end.as_str()) {
            return;
        }

        let content_len = self.captured.len() - self.spec.end.len();
        let content = self.captured[..content_len].to_string();
        self.captured.clear();
        self.state = ScanState::Outside;

        if !out.is_empty() {
            events.push(SegmentEvent::PassThrough(std::mem::take(out)));
        }
        self.matches.push(content.clone());
        events.push(SegmentEvent::Captured {
            grammar: self.spec.name.clone(),
            kind: self.spec.kind,
            content,
        });
    }
}

// ─── SegmenterChain ──────────────────────────────────────────────────────────

/// Several segmenters applied in sequence to one stream.
#[derive(Debug, Clone)]
pub struct SegmenterChain {
    stages: Vec<StreamSegmenter>,
}

impl SegmenterChain {
    /// Build a chain, rejecting grammars whose markers collide.
    pub fn new(specs: &[DelimiterSpec]) -> Result<Self, AgentError> {
        validate_grammars(specs)?;
        let stages = specs
            .iter()
            .cloned()
            .map(StreamSegmenter::new)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { stages })
    }

    pub fn feed(&mut self, fragment: &str) -> Vec<SegmentEvent> {
        let mut events = vec![SegmentEvent::PassThrough(fragment.to_string())];

        for stage in &mut self.stages {
            let mut next = Vec::with_capacity(events.len());
            for event in events {
                match event {
                    SegmentEvent::PassThrough(text) => next.extend(stage.feed(&text)),
                    captured => next.push(captured),
                }
            }
            events = next;
        }

        coalesce(events)
    }

    /// Captures so far for the named grammar.
    pub fn matches(&self, grammar: &str) -> Option<&[String]> {
        self.stages
            .iter()
            .find(|s| s.spec.name == grammar)
            .map(StreamSegmenter::matches)
    }

    /// Grammars left with an open region or partial marker.
    pub fn unterminated(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| s.buffered_len() > 0)
            .map(|s| s.spec.name.as_str())
            .collect()
    }
}

fn coalesce(events: Vec<SegmentEvent>) -> Vec<SegmentEvent> {
    let mut merged: Vec<SegmentEvent> = Vec::with_capacity(events.len());
    for event in events {
        if let SegmentEvent::PassThrough(text) = &event {
            if text.is_empty() {
                continue;
            }
            if let Some(SegmentEvent::PassThrough(prev)) = merged.last_mut() {
                prev.push_str(text);
                continue;
            }
        }
        merged.push(event);
    }
    merged
}

// ─── Validation ──────────────────────────────────────────────────────────────

fn validate_spec(spec: &DelimiterSpec) -> Result<(), AgentError> {
    if spec.name.trim().is_empty() {
        return Err(AgentError::InvalidGrammar {
            reason: "grammar name is empty".into(),
        });
    }
    if spec.start.is_empty() || spec.end.is_empty() {
        return Err(AgentError::InvalidGrammar {
            reason: format!("grammar '{}' has an empty marker", spec.name),
        });
    }
    Ok(())
}

/// Check that no two grammars share a name or have overlapping markers.
///
/// Markers overlap when one is a prefix of the other; a later stage would
/// otherwise never see text that an earlier stage swallowed.
pub fn validate_grammars(specs: &[DelimiterSpec]) -> Result<(), AgentError> {
    for spec in specs {
        validate_spec(spec)?;
    }

    for (i, a) in specs.iter().enumerate() {
        for b in &specs[i + 1..] {
            if a.name == b.name {
                return Err(AgentError::InvalidGrammar {
                    reason: format!("duplicate grammar name '{}'", a.name),
                });
            }
            for ma in [&a.start, &a.end] {
                for mb in [&b.start, &b.end] {
                    if ma.starts_with(mb.as_str()) || mb.starts_with(ma.as_str()) {
                        return Err(AgentError::InvalidGrammar {
                            reason: format!(
                                "markers '{ma}' ({}) and '{mb}' ({}) overlap",
                                a.name, b.name
                            ),
                        });
                    }
                }
            }
        }
    }
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn think() -> StreamSegmenter {
        StreamSegmenter::new(DelimiterSpec::reasoning()).unwrap()
    }

    fn pass_text(events: &[SegmentEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                SegmentEvent::PassThrough(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    fn feed_all(seg: &mut StreamSegmenter, parts: &[&str]) -> String {
        parts.iter().map(|p| pass_text(&seg.feed(p))).collect()
    }

    #[test]
    fn test_whole_input() {
        let mut seg = think();
        let events = seg.feed("Hello <think>World</think>!");
        assert_eq!(pass_text(&events), "Hello !");
        assert_eq!(seg.matches(), ["World"]);
        assert_eq!(seg.state(), ScanState::Outside);
    }

    #[test]
    fn test_event_order_within_one_feed() {
        let mut seg = think();
        let events = seg.feed("a<think>b</think>c");
        assert_eq!(
            events,
            vec![
                SegmentEvent::PassThrough("a".into()),
                SegmentEvent::Captured {
                    grammar: "think".into(),
                    kind: GrammarKind::Reasoning,
                    content: "b".into(),
                },
                SegmentEvent::PassThrough("c".into()),
            ]
        );
    }

    #[test]
    fn test_char_by_char_matches_whole() {
        let input = "Hello <think>World</think>!";
        let mut seg = think();
        let chars: Vec<String> = input.chars().map(String::from).collect();
        let parts: Vec<&str> = chars.iter().map(String::as_str).collect();
        assert_eq!(feed_all(&mut seg, &parts), "Hello !");
        assert_eq!(seg.matches(), ["World"]);
    }

    #[test]
    fn test_every_two_way_split_is_equivalent() {
        let input = "pre <think>one</think> mid <thi <think>two</think> post";
        let mut whole = think();
        let expected = pass_text(&whole.feed(input));

        for (i, _) in input.char_indices() {
            let mut seg = think();
            let got = feed_all(&mut seg, &[&input[..i], &input[i..]]);
            assert_eq!(got, expected, "split at {i}");
            assert_eq!(seg.matches(), whole.matches(), "split at {i}");
        }
    }

    #[test]
    fn test_no_delimiters_passes_through() {
        let mut seg = think();
        assert_eq!(feed_all(&mut seg, &["plain ", "text"]), "plain text");
        assert!(seg.matches().is_empty());
    }

    #[test]
    fn test_broken_start_marker_is_released() {
        let mut seg = think();
        assert_eq!(pass_text(&seg.feed("Hello <thinkWorld")), "Hello <thinkWorld");
        assert!(seg.matches().is_empty());
    }

    #[test]
    fn test_overlapping_start_marker() {
        let mut seg = think();
        let out = feed_all(&mut seg, &["<", "<think>x</think>"]);
        assert_eq!(out, "<");
        assert_eq!(seg.matches(), ["x"]);
    }

    #[test]
    fn test_unterminated_region_is_never_emitted() {
        let mut seg = think();
        let out = feed_all(&mut seg, &["before <think>lost", " forever"]);
        assert_eq!(out, "before ");
        assert!(seg.matches().is_empty());
        assert_eq!(seg.state(), ScanState::Inside);
        assert!(seg.buffered_len() > 0);
    }

    #[test]
    fn test_trailing_partial_start_marker_is_held() {
        let mut seg = think();
        assert_eq!(pass_text(&seg.feed("done <thi")), "done ");
        assert_eq!(seg.state(), ScanState::Scanning);
    }

    #[test]
    fn test_stray_end_marker_is_literal() {
        let mut seg = think();
        assert_eq!(pass_text(&seg.feed("a </think> b")), "a </think> b");
        assert!(seg.matches().is_empty());
    }

    #[test]
    fn test_fenced_json_grammar() {
        let spec = DelimiterSpec::new("json", GrammarKind::Tool, "```json", "```");
        let mut seg = StreamSegmenter::new(spec).unwrap();
        let input = "Here:\n```json\n\n{\"key\": \"value\"}\n\n```\nbye";
        let out = pass_text(&seg.feed(input));
        assert_eq!(out, "Here:\n\nbye");
        assert_eq!(seg.matches(), ["\n\n{\"key\": \"value\"}\n\n"]);
    }

    #[test]
    fn test_multibyte_text_around_markers() {
        let mut seg = think();
        let out = feed_all(&mut seg, &["héllo <th", "ink>ünï</thi", "nk> wörld"]);
        assert_eq!(out, "héllo  wörld");
        assert_eq!(seg.matches(), ["ünï"]);
    }

    #[test]
    fn test_empty_marker_rejected() {
        let spec = DelimiterSpec::new("bad", GrammarKind::Tool, "", "```");
        assert!(StreamSegmenter::new(spec).is_err());
    }

    #[test]
    fn test_chain_routes_both_grammars() {
        let mut chain =
            SegmenterChain::new(&[DelimiterSpec::reasoning(), DelimiterSpec::tool_code()]).unwrap();
        let input = "<think>plan</think>Sure. ```tool_code{\"action\":\"Clock.get_time\"}``` done";

        let mut text = String::new();
        let mut captures = Vec::new();
        for ch in input.chars() {
            for event in chain.feed(&ch.to_string()) {
                match event {
                    SegmentEvent::PassThrough(t) => text.push_str(&t),
                    SegmentEvent::Captured { kind, content, .. } => captures.push((kind, content)),
                }
            }
        }

        assert_eq!(text, "Sure.  done");
        assert_eq!(
            captures,
            vec![
                (GrammarKind::Reasoning, "plan".to_string()),
                (GrammarKind::Tool, "{\"action\":\"Clock.get_time\"}".to_string()),
            ]
        );
        assert_eq!(chain.matches("tool_code").map(<[String]>::len), Some(1));
        assert!(chain.unterminated().is_empty());
    }

    #[test]
    fn test_chain_coalesces_pass_through() {
        let mut chain =
            SegmenterChain::new(&[DelimiterSpec::reasoning(), DelimiterSpec::tool_code()]).unwrap();
        let events = chain.feed("just words");
        assert_eq!(events, vec![SegmentEvent::PassThrough("just words".into())]);
    }

    #[test]
    fn test_overlapping_grammars_rejected() {
        let json = DelimiterSpec::new("json", GrammarKind::Tool, "```json", "```");
        let result = SegmenterChain::new(&[DelimiterSpec::tool_code(), json]);
        assert!(matches!(result, Err(AgentError::InvalidGrammar { .. })));
    }

    #[test]
    fn test_duplicate_grammar_name_rejected() {
        let a = DelimiterSpec::new("x", GrammarKind::Tool, "<a>", "</a>");
        let b = DelimiterSpec::new("x", GrammarKind::Tool, "<b>", "</b>");
        assert!(validate_grammars(&[a, b]).is_err());
    }
}
