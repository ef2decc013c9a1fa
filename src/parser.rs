use std::sync::LazyLock;

use regex::Regex;

/// Fence tags treated as code the preview can render.
pub const CODE_TAGS: &[&str] = &["html", "css", "js", "javascript"];

const FENCE: &str = "```";

static CODE_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    let pattern = format!(r"(?is)```(?:{})\r?\n(.*?)```", CODE_TAGS.join("|"));
    Regex::new(&pattern).expect("code block pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReply {
    pub code_fragment: String,
    pub explanation_text: String,
}

pub fn fallback_explanation(prompt: &str) -> String {
    format!(
        "Here's the HTML code I generated based on your request: \"{prompt}\". Let me know if you need any modifications!"
    )
}

/// Splits a raw model reply into the first tagged code block and the prose after the last fence.
///
/// A reply with no fence at all, or with nothing after its last fence, gets the templated
/// explanation so callers always have something to show. A fenced block with an unknown or
/// missing tag yields no code but keeps the model's trailing prose.
pub fn parse_reply(raw: &str, prompt: &str) -> ParsedReply {
    let code_fragment = CODE_BLOCK
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default();

    let trailing = match raw.rfind(FENCE) {
        Some(at) => raw[at + FENCE.len()..].trim(),
        None => "",
    };
    let explanation_text = if trailing.is_empty() {
        fallback_explanation(prompt)
    } else {
        trailing.to_string()
    };

    ParsedReply { code_fragment, explanation_text }
}
