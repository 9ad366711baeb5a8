use once_cell::sync::Lazy;
use regex::Regex;

/// Light entities pulled out of a message with regexes: memory keys/values
/// and candidate graph node labels. Best-effort; the orchestrator treats a
/// miss as "no hint".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedEntities {
    pub memory_key: Option<String>,
    pub memory_value: Option<String>,
    pub node_labels: Vec<String>,
}

impl ExtractedEntities {
    pub fn is_empty(&self) -> bool {
        self.memory_key.is_none() && self.memory_value.is_none() && self.node_labels.is_empty()
    }
}

static STORE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)remember\s+(?:that\s+)?my\s+([a-z0-9_ ]+?)\s+is\s+(.+?)\s*$")
        .expect("store pattern compiles")
});

static RETRIEVE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)what(?:'s|\s+is)\s+my\s+([a-z0-9_ ]+?)\s*\??\s*$")
        .expect("retrieve pattern compiles")
});

static FORGET_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)forget\s+(?:about\s+)?my\s+([a-z0-9_ ]+?)\s*$")
        .expect("forget pattern compiles")
});

static QUOTED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""([^"]+)""#).expect("quoted pattern compiles"));

static CAPITALIZED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Z][A-Za-z0-9_-]{2,}\b").expect("capitalized pattern compiles")
});

/// Run the regex pass over a message.
pub fn extract(text: &str) -> ExtractedEntities {
    let mut entities = ExtractedEntities::default();

    if let Some(caps) = STORE_RE.captures(text) {
        entities.memory_key = Some(normalize_key(&caps[1]));
        entities.memory_value = Some(caps[2].trim().to_string());
    } else if let Some(caps) = RETRIEVE_RE.captures(text) {
        entities.memory_key = Some(normalize_key(&caps[1]));
    } else if let Some(caps) = FORGET_RE.captures(text) {
        entities.memory_key = Some(normalize_key(&caps[1]));
    }

    for caps in QUOTED_RE.captures_iter(text) {
        entities.node_labels.push(caps[1].to_string());
    }
    // Capitalized spans only matter when nothing was quoted; skip the first
    // word of the message, which is capitalized for grammatical reasons.
    if entities.node_labels.is_empty() {
        for m in CAPITALIZED_RE.find_iter(text) {
            if m.start() == 0 {
                continue;
            }
            entities.node_labels.push(m.as_str().to_string());
        }
    }
    entities.node_labels.dedup();

    entities
}

/// Keys are stored snake_cased: trimmed, lowercased, spaces collapsed to
/// underscores.
fn normalize_key(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_store_key_and_value() {
        let e = extract("remember that my timezone is America/Sao_Paulo");
        assert_eq!(e.memory_key.as_deref(), Some("timezone"));
        assert_eq!(e.memory_value.as_deref(), Some("America/Sao_Paulo"));
    }

    #[test]
    fn extracts_store_without_that() {
        let e = extract("remember my favorite color is teal");
        assert_eq!(e.memory_key.as_deref(), Some("favorite_color"));
        assert_eq!(e.memory_value.as_deref(), Some("teal"));
    }

    #[test]
    fn extracts_retrieve_key() {
        let e = extract("what's my timezone?");
        assert_eq!(e.memory_key.as_deref(), Some("timezone"));
        assert_eq!(e.memory_value, None);

        let e = extract("What is my favorite color");
        assert_eq!(e.memory_key.as_deref(), Some("favorite_color"));
    }

    #[test]
    fn extracts_forget_key() {
        let e = extract("forget my timezone");
        assert_eq!(e.memory_key.as_deref(), Some("timezone"));
    }

    #[test]
    fn extracts_quoted_node_labels() {
        let e = extract("how is \"Go\" related to \"Discord\"?");
        assert_eq!(e.node_labels, vec!["Go".to_string(), "Discord".to_string()]);
    }

    #[test]
    fn capitalized_labels_skip_sentence_start() {
        let e = extract("Tell me about Rust and Tokio");
        assert_eq!(e.node_labels, vec!["Rust".to_string(), "Tokio".to_string()]);
    }

    #[test]
    fn plain_chitchat_extracts_nothing() {
        assert!(extract("how are you today?").is_empty());
    }
}
