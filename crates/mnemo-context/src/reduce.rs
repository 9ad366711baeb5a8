//! Pure reduction algorithms over a session's message log.
//!
//! Each function returns the kept messages plus the dropped ones (for
//! offloading). Token counts on kept messages are recomputed whenever the
//! content changed, so the session invariant
//! `token_count == sum(count_tokens(m))` re-holds after every reduction.

use mnemo_llm::tokens::truncate_tokens;
use mnemo_llm::Role;

use crate::types::{ContentPart, MessageContent, ReductionMode, SessionMessage};

pub struct Reduced {
    pub kept: Vec<SessionMessage>,
    pub dropped: Vec<SessionMessage>,
}

pub fn reduce(messages: Vec<SessionMessage>, mode: ReductionMode, budget: u32) -> Reduced {
    match mode {
        ReductionMode::Full => reduce_full(messages, budget),
        ReductionMode::Compact => reduce_compact(messages),
        ReductionMode::Summary => reduce_summary(messages, budget),
    }
}

/// Keep the most recent messages up to the budget, preserving order: walk
/// backwards appending into a reversed buffer, then reverse once.
fn reduce_full(messages: Vec<SessionMessage>, budget: u32) -> Reduced {
    let mut kept_rev: Vec<SessionMessage> = Vec::new();
    let mut dropped: Vec<SessionMessage> = Vec::new();
    let mut used: u32 = 0;

    for msg in messages.into_iter().rev() {
        if used + msg.tokens <= budget {
            used += msg.tokens;
            kept_rev.push(msg);
        } else {
            dropped.push(msg);
        }
    }

    kept_rev.reverse();
    dropped.reverse();
    Reduced {
        kept: kept_rev,
        dropped,
    }
}

/// Keep all messages but collapse runs of whitespace in every text part,
/// including the text parts of multimodal content.
fn reduce_compact(messages: Vec<SessionMessage>) -> Reduced {
    let kept = messages
        .into_iter()
        .map(|mut msg| {
            msg.content = match msg.content {
                MessageContent::Text(text) => MessageContent::Text(collapse_whitespace(&text)),
                MessageContent::Parts(parts) => MessageContent::Parts(
                    parts
                        .into_iter()
                        .map(|part| match part {
                            ContentPart::Text { text } => ContentPart::Text {
                                text: collapse_whitespace(&text),
                            },
                            other => other,
                        })
                        .collect(),
                ),
            };
            msg.tokens = msg.content.count_tokens();
            msg
        })
        .collect();
    Reduced {
        kept,
        dropped: Vec::new(),
    }
}

/// Preserve system messages (trimmed when their combined tokens exceed half
/// the budget) plus the latest conversational messages that fit in the rest.
fn reduce_summary(messages: Vec<SessionMessage>, budget: u32) -> Reduced {
    let (mut system, conversational): (Vec<_>, Vec<_>) = messages
        .into_iter()
        .partition(|m| m.role == Role::System);

    let system_budget = budget / 2;
    let system_total: u32 = system.iter().map(|m| m.tokens).sum();
    if system_total > system_budget && !system.is_empty() {
        let per_message = (system_budget / system.len() as u32).max(1);
        for msg in &mut system {
            if msg.tokens > per_message {
                let trimmed = truncate_tokens(&msg.content.as_text(), per_message as usize);
                msg.content = MessageContent::Text(trimmed);
                msg.tokens = msg.content.count_tokens();
            }
        }
    }

    let used: u32 = system.iter().map(|m| m.tokens).sum();
    let remaining = budget.saturating_sub(used);
    let tail = reduce_full(conversational, remaining);

    let mut kept = system;
    kept.extend(tail.kept);
    kept.sort_by_key(|m| m.seq);
    Reduced {
        kept,
        dropped: tail.dropped,
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(seq: u64, role: Role, text: &str) -> SessionMessage {
        let content = MessageContent::Text(text.to_string());
        let tokens = content.count_tokens();
        SessionMessage {
            seq,
            role,
            content,
            tokens,
        }
    }

    fn total(messages: &[SessionMessage]) -> u32 {
        messages.iter().map(|m| m.tokens).sum()
    }

    #[test]
    fn full_keeps_most_recent_in_order() {
        let messages: Vec<_> = (0..20)
            .map(|i| msg(i, Role::User, &format!("message number {i} with some padding text")))
            .collect();
        let per_msg = messages[0].tokens;
        let budget = per_msg * 3;

        let reduced = reduce(messages, ReductionMode::Full, budget);
        assert_eq!(reduced.kept.len(), 3);
        assert_eq!(
            reduced.kept.iter().map(|m| m.seq).collect::<Vec<_>>(),
            vec![17, 18, 19],
            "latest messages survive in original order"
        );
        assert!(total(&reduced.kept) <= budget);
        assert_eq!(reduced.dropped.len(), 17);
        assert!(reduced.dropped.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[test]
    fn compact_collapses_whitespace_everywhere() {
        let parts = MessageContent::Parts(vec![
            ContentPart::Text {
                text: "hello    \n\n   world".to_string(),
            },
            ContentPart::Image {
                url: "https://example.com/i.png".to_string(),
            },
        ]);
        let tokens = parts.count_tokens();
        let messages = vec![
            msg(0, Role::User, "too   many\t\tspaces   here"),
            SessionMessage {
                seq: 1,
                role: Role::User,
                content: parts,
                tokens,
            },
        ];

        let reduced = reduce(messages, ReductionMode::Compact, 0);
        assert_eq!(reduced.dropped.len(), 0, "compact never drops");
        assert_eq!(
            reduced.kept[0].content.as_text(),
            "too many spaces here"
        );
        assert_eq!(reduced.kept[1].content.as_text(), "hello world");
        // Token counts match the new content.
        for m in &reduced.kept {
            assert_eq!(m.tokens, m.content.count_tokens());
        }
    }

    #[test]
    fn summary_preserves_system_messages() {
        let mut messages = vec![msg(0, Role::System, "you are a helpful assistant")];
        for i in 1..30 {
            messages.push(msg(i, Role::User, &format!("conversational filler number {i}")));
        }
        let budget = 60;

        let reduced = reduce(messages, ReductionMode::Summary, budget);
        assert_eq!(reduced.kept[0].role, Role::System, "system message survives first");
        assert!(total(&reduced.kept) <= budget);
        assert!(!reduced.dropped.is_empty());
        // Order by seq throughout.
        assert!(reduced.kept.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[test]
    fn summary_trims_oversized_system_messages() {
        let long_system = "system directive ".repeat(100);
        let messages = vec![
            msg(0, Role::System, &long_system),
            msg(1, Role::User, "hi"),
        ];
        let budget = 40;

        let reduced = reduce(messages, ReductionMode::Summary, budget);
        let system = &reduced.kept[0];
        assert_eq!(system.role, Role::System);
        assert!(system.tokens <= budget / 2, "system trimmed to its share");
    }

    #[test]
    fn token_invariant_re_holds_after_every_mode() {
        let messages: Vec<_> = (0..10)
            .map(|i| msg(i, Role::User, "some    spaced   out    content here"))
            .collect();

        for mode in [ReductionMode::Full, ReductionMode::Compact, ReductionMode::Summary] {
            let reduced = reduce(messages.clone(), mode, 50);
            let recounted: u32 = reduced.kept.iter().map(|m| m.content.count_tokens()).sum();
            assert_eq!(total(&reduced.kept), recounted, "mode {mode:?}");
        }
    }
}
