//! Deterministic token counting and truncation (cl100k_base BPE).

use once_cell::sync::Lazy;
use tiktoken_rs::CoreBPE;

static BPE: Lazy<CoreBPE> =
    Lazy::new(|| tiktoken_rs::cl100k_base().expect("cl100k_base tables are bundled"));

/// Count tokens in a text.
pub fn count_tokens(text: &str) -> usize {
    BPE.encode_with_special_tokens(text).len()
}

/// Truncate a text to `max_tokens` tokens. Deterministic: the same input
/// always yields the same prefix. Returns the input unchanged when it fits.
pub fn truncate_tokens(text: &str, max_tokens: usize) -> String {
    let tokens = BPE.encode_with_special_tokens(text);
    if tokens.len() <= max_tokens {
        return text.to_string();
    }
    let truncated: Vec<_> = tokens.into_iter().take(max_tokens).collect();
    // Decoding a token prefix is always valid UTF-8 for cl100k_base prefixes
    // produced by our own encode; fall back to the original on the off chance.
    BPE.decode(truncated).unwrap_or_else(|_| text.to_string())
}
