/// A retrieved source a Study answer may cite.
#[derive(Debug, Clone)]
pub struct SourceRef {
    pub title: String,
    pub content: String,
}

/// Memory retrieved for one turn, injected into the agent's system prompt.
/// Enrichment failures degrade to an empty hint set, never to an error.
#[derive(Debug, Clone, Default)]
pub struct MemoryHints {
    /// Core facts as (key, value).
    pub core_facts: Vec<(String, String)>,
    /// Recall snippets with their similarity.
    pub recall: Vec<(String, f32)>,
    /// Graph neighborhood labels.
    pub graph_labels: Vec<String>,
    /// Numbered sources for citation-validated answers.
    pub sources: Vec<SourceRef>,
}

impl MemoryHints {
    pub fn is_empty(&self) -> bool {
        self.core_facts.is_empty()
            && self.recall.is_empty()
            && self.graph_labels.is_empty()
            && self.sources.is_empty()
    }

    /// Total number of retrieved items (for turn metrics).
    pub fn sources_count(&self) -> usize {
        self.core_facts.len() + self.recall.len() + self.graph_labels.len() + self.sources.len()
    }

    /// Render as a prompt block appended to the agent instructions.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.core_facts.is_empty() {
            out.push_str("\n\nKnown facts about the user:\n");
            for (key, value) in &self.core_facts {
                out.push_str(&format!("- {key}: {value}\n"));
            }
        }
        if !self.recall.is_empty() {
            out.push_str("\nRelevant past conversation:\n");
            for (content, similarity) in &self.recall {
                out.push_str(&format!("- ({similarity:.2}) {content}\n"));
            }
        }
        if !self.graph_labels.is_empty() {
            out.push_str("\nRelated topics: ");
            out.push_str(&self.graph_labels.join(", "));
            out.push('\n');
        }
        if !self.sources.is_empty() {
            out.push_str("\nSources:\n");
            for (i, source) in self.sources.iter().enumerate() {
                out.push_str(&format!("[{}] {}: {}\n", i + 1, source.title, source.content));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_hints_render_nothing() {
        assert_eq!(MemoryHints::default().render(), "");
        assert!(MemoryHints::default().is_empty());
    }

    #[test]
    fn sources_are_numbered_from_one() {
        let hints = MemoryHints {
            sources: vec![
                SourceRef {
                    title: "a".to_string(),
                    content: "first".to_string(),
                },
                SourceRef {
                    title: "b".to_string(),
                    content: "second".to_string(),
                },
            ],
            ..Default::default()
        };
        let rendered = hints.render();
        assert!(rendered.contains("[1] a: first"));
        assert!(rendered.contains("[2] b: second"));
        assert_eq!(hints.sources_count(), 2);
    }
}
