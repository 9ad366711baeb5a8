use serde::{Deserialize, Serialize};

/// Output token cap shared by all variants.
const MAX_OUTPUT_TOKENS: u32 = 1024;

/// The agent pool is a sum type over one shared contract, not an
/// inheritance chain; per-variant behavior lives in these methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentVariant {
    Conversational,
    Knowledge,
    Memory,
    Graph,
    /// Deterministic, citation-validated retrieval QA.
    Study,
}

impl AgentVariant {
    pub fn temperature(&self) -> f32 {
        match self {
            Self::Conversational => 0.7,
            Self::Knowledge => 0.3,
            Self::Memory => 0.2,
            Self::Graph => 0.3,
            Self::Study => 0.0,
        }
    }

    pub fn max_tokens(&self) -> u32 {
        MAX_OUTPUT_TOKENS
    }

    /// Whether responses must stream chunk-by-chunk. Study answers are
    /// validated as a whole before anything is emitted.
    pub fn streams(&self) -> bool {
        !matches!(self, Self::Study)
    }

    pub fn instructions(&self) -> &'static str {
        match self {
            Self::Conversational => {
                "You are a friendly chat assistant. Answer naturally and concisely. \
                 Use the provided memory context when it is relevant."
            }
            Self::Knowledge => {
                "You answer factual questions precisely. Prefer the provided context \
                 and say so when you are unsure."
            }
            Self::Memory => {
                "You help the user manage what the assistant remembers about them. \
                 Confirm stored facts back to the user, quoting the stored value exactly."
            }
            Self::Graph => {
                "You answer questions about how the user's topics relate to each \
                 other, using the provided graph neighborhood."
            }
            Self::Study => {
                "You answer strictly from the numbered sources provided. Cite every \
                 factual assertion as [n]. If the sources do not support an answer, \
                 say so instead of guessing."
            }
        }
    }
}

impl std::fmt::Display for AgentVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Conversational => "conversational",
            Self::Knowledge => "knowledge",
            Self::Memory => "memory",
            Self::Graph => "graph",
            Self::Study => "study",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temperatures_match_contract() {
        assert_eq!(AgentVariant::Conversational.temperature(), 0.7);
        assert!(AgentVariant::Memory.temperature() <= 0.4);
        assert!(AgentVariant::Knowledge.temperature() >= 0.2);
        assert_eq!(AgentVariant::Study.temperature(), 0.0);
    }

    #[test]
    fn only_study_buffers_output() {
        assert!(AgentVariant::Conversational.streams());
        assert!(!AgentVariant::Study.streams());
    }
}
