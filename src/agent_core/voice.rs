//! Opportunistic speech synthesis for streamed answers.
//!
//! Visible text is buffered until it forms one or more complete sentences of
//! reasonable length, then handed to a [`VoiceSynthesizer`] off the
//! forwarding path.

use async_trait::async_trait;

/// Text-to-speech backend.
#[async_trait]
pub trait VoiceSynthesizer: Send + Sync {
    /// Render `text` with `voice` and return the produced audio file name.
    async fn synthesize(&self, text: &str, voice: &str) -> anyhow::Result<String>;
}

/// Accumulates visible text into sentence-aligned synthesis chunks.
#[derive(Debug, Clone)]
pub struct VoiceBuffer {
    text: String,
    min_chars: usize,
}

impl VoiceBuffer {
    pub fn new(min_chars: usize) -> Self {
        Self {
            text: String::new(),
            min_chars,
        }
    }

    /// Append text; returns a chunk once the buffer ends a sentence and
    /// exceeds the minimum length.
    pub fn push(&mut self, text: &str) -> Option<String> {
        self.text.push_str(text);
        let trimmed = self.text.trim_end();
        let ends_sentence = trimmed.ends_with(['.', '!', '?']);
        if ends_sentence && trimmed.chars().count() > self.min_chars {
            let chunk = trimmed.to_string();
            self.text.clear();
            return Some(chunk);
        }
        None
    }

    /// Whatever is left at the end of a round.
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.text);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }
}

/// Reduce markdown to speakable text.
///
/// Links become their label; emphasis and code markers (`_`, `*`, `` ` ``)
/// are removed.
pub fn strip_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(open) = rest.find('[') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match link_parts(after) {
            Some((label, consumed)) => {
                out.push_str(label);
                rest = &after[consumed..];
            }
            None => {
                out.push('[');
                rest = after;
            }
        }
    }
    out.push_str(rest);

    out.retain(|c| !matches!(c, '_' | '*' | '`'));
    out
}

/// Parse `label](url)` and return the label plus bytes consumed.
///
/// Label and url must both be non-empty; `[](x)` and `[a]()` stay as text.
fn link_parts(after_bracket: &str) -> Option<(&str, usize)> {
    let close = after_bracket.find(']')?;
    let label = &after_bracket[..close];
    if label.is_empty() || label.contains('[') {
        return None;
    }
    let tail = after_bracket[close + 1..].strip_prefix('(')?;
    let url_end = tail.find(')')?;
    if url_end == 0 {
        return None;
    }
    Some((label, close + 2 + url_end + 1))
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_waits_for_sentence_end() {
        let mut buf = VoiceBuffer::new(10);
        assert!(buf.push("This is a long clause").is_none());
        assert!(buf.push(", still going").is_none());
        assert_eq!(
            buf.push(" and done.").as_deref(),
            Some("This is a long clause, still going and done.")
        );
        assert!(buf.flush().is_none());
    }

    #[test]
    fn test_buffer_respects_min_chars() {
        let mut buf = VoiceBuffer::new(128);
        assert!(buf.push("Short. ").is_none());
        assert!(buf.push("Also short!").is_none());
        assert_eq!(buf.flush().as_deref(), Some("Short. Also short!"));
    }

    #[test]
    fn test_question_and_ellipsis_end_sentences() {
        let mut buf = VoiceBuffer::new(3);
        assert!(buf.push("Really?").is_some());
        assert!(buf.push("Well...").is_some());
    }

    #[test]
    fn test_strip_markdown() {
        assert_eq!(
            strip_markdown("See **[the docs](https://x.y/z)** and `code`_now_"),
            "See the docs and codenow"
        );
    }

    #[test]
    fn test_strip_markdown_keeps_plain_brackets() {
        assert_eq!(strip_markdown("a [b] c [d](e"), "a [b] c [d](e");
    }

    #[test]
    fn test_strip_markdown_leaves_empty_links() {
        assert_eq!(strip_markdown("see [](x) here"), "see [](x) here");
        assert_eq!(strip_markdown("see [a]() here"), "see [a]() here");
        assert_eq!(strip_markdown("[](x) then [ok](y)"), "[](x) then ok");
    }
}
