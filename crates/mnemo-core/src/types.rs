use serde::{Deserialize, Serialize};

/// Inbound message event pushed by the chat-platform adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Opaque stable identity of the author on the chat platform.
    pub author_id: String,
    pub channel_id: String,
    pub is_dm: bool,
    pub text: String,
    /// True when the author is a bot (including ourselves).
    pub is_bot: bool,
}

/// Closed set of intent labels assigned by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentCategory {
    Greeting,
    Farewell,
    Thanks,
    Help,
    Status,
    KnowledgeQuery,
    MemoryStore,
    MemoryRetrieve,
    GraphQuery,
    Chitchat,
    OutOfScope,
    Unknown,
}

impl IntentCategory {
    /// Every category the classifier can emit, in declaration order.
    pub fn all() -> &'static [IntentCategory] {
        use IntentCategory::*;
        &[
            Greeting,
            Farewell,
            Thanks,
            Help,
            Status,
            KnowledgeQuery,
            MemoryStore,
            MemoryRetrieve,
            GraphQuery,
            Chitchat,
            OutOfScope,
            Unknown,
        ]
    }
}

impl std::fmt::Display for IntentCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Greeting => "greeting",
            Self::Farewell => "farewell",
            Self::Thanks => "thanks",
            Self::Help => "help",
            Self::Status => "status",
            Self::KnowledgeQuery => "knowledge_query",
            Self::MemoryStore => "memory_store",
            Self::MemoryRetrieve => "memory_retrieve",
            Self::GraphQuery => "graph_query",
            Self::Chitchat => "chitchat",
            Self::OutOfScope => "out_of_scope",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}
