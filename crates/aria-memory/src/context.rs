//! Prompt-context composition under a token budget.
//!
//! Pure functions — the store gathers candidate rows, this module decides
//! what fits. Filling is greedy from the end of the conversation (newest
//! turns first), then facts are inserted until the budget is exhausted.

use crate::types::{ContextBundle, ConversationTurn, Fact};

/// Compose a context bundle from candidates.
///
/// `tail` must be ordered oldest → newest; the returned bundle preserves
/// that order. `long_term` should arrive ranked best-first, `day_facts`
/// newest-first. Facts that don't fit the remaining budget are dropped.
pub fn compose(
    tail: Vec<ConversationTurn>,
    long_term: Vec<Fact>,
    day_facts: Vec<Fact>,
    budget_tokens: u32,
) -> ContextBundle {
    let mut remaining = budget_tokens;
    let mut turns_rev: Vec<ConversationTurn> = Vec::new();

    // Most-recent turns first.
    for turn in tail.into_iter().rev() {
        let cost = turn_cost(&turn);
        if cost > remaining {
            break;
        }
        remaining -= cost;
        turns_rev.push(turn);
    }
    turns_rev.reverse();

    // Long-term facts (already ranked), then today's extracted facts.
    let mut facts: Vec<Fact> = Vec::new();
    let mut seen: Vec<i64> = Vec::new();
    for fact in long_term.into_iter().chain(day_facts) {
        if seen.contains(&fact.id) {
            continue;
        }
        let cost = crate::types::estimate_tokens(&fact.text);
        if cost > remaining {
            continue;
        }
        remaining -= cost;
        seen.push(fact.id);
        facts.push(fact);
    }

    ContextBundle {
        facts,
        turns: turns_rev,
        token_total: budget_tokens - remaining,
    }
}

fn turn_cost(turn: &ConversationTurn) -> u32 {
    if turn.token_count > 0 {
        turn.token_count
    } else {
        crate::types::estimate_tokens(&turn.content)
    }
}

/// Extract loose keywords from a query for substring fact matching.
/// Short stop-ish words are skipped; the rest are lowercased.
pub fn query_keywords(query: &str) -> Vec<String> {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 3)
        .map(|w| w.to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use aria_core::types::TurnRole;

    fn turn(content: &str, tokens: u32) -> ConversationTurn {
        let mut t = ConversationTurn::new("u1", "s1", TurnRole::User, content);
        t.token_count = tokens;
        t
    }

    fn fact(id: i64, text: &str) -> Fact {
        Fact {
            id,
            user_id: "u1".to_string(),
            source_turn_id: None,
            text: text.to_string(),
            importance: 0.5,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn newest_turns_win_when_budget_is_tight() {
        let tail = vec![turn("oldest", 50), turn("middle", 50), turn("newest", 50)];
        let bundle = compose(tail, vec![], vec![], 100);

        assert_eq!(bundle.turns.len(), 2);
        assert_eq!(bundle.turns[0].content, "middle");
        assert_eq!(bundle.turns[1].content, "newest");
        assert_eq!(bundle.token_total, 100);
    }

    #[test]
    fn budget_is_never_exceeded() {
        let tail = vec![turn("a", 30), turn("b", 30), turn("c", 30)];
        let facts = vec![fact(1, "user lives in Warsaw"), fact(2, "user codes in Python")];
        let bundle = compose(tail, facts, vec![], 100);
        assert!(bundle.token_total <= 100);
    }

    #[test]
    fn facts_that_do_not_fit_are_dropped() {
        let tail = vec![turn("recent message", 95)];
        let big = fact(1, &"x".repeat(400)); // ~100 tokens
        let small = fact(2, "tiny"); // 1 token
        let bundle = compose(tail, vec![big, small], vec![], 100);

        assert_eq!(bundle.facts.len(), 1);
        assert_eq!(bundle.facts[0].id, 2);
    }

    #[test]
    fn duplicate_fact_ids_are_inserted_once() {
        let f = fact(7, "user is vegetarian");
        let bundle = compose(vec![], vec![f.clone()], vec![f], 1000);
        assert_eq!(bundle.facts.len(), 1);
    }

    #[test]
    fn order_preserved_oldest_to_newest() {
        let tail = vec![turn("one", 10), turn("two", 10), turn("three", 10)];
        let bundle = compose(tail, vec![], vec![], 1000);
        let contents: Vec<_> = bundle.turns.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two", "three"]);
    }

    #[test]
    fn keywords_skip_short_words() {
        let words = query_keywords("What is the weather in Warsaw?");
        assert!(words.contains(&"weather".to_string()));
        assert!(words.contains(&"warsaw".to_string()));
        assert!(!words.contains(&"the".to_string()));
    }
}
