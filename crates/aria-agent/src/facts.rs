//! Lightweight fact mining from user turns.
//!
//! Sentences carrying a first-person self-description ("my name is …",
//! "nazywam się …") are stored as mid/long-term facts so later sessions
//! can recall them without replaying the whole conversation. Deliberately
//! heuristic — no extra model call, deterministic under test.

/// First-person markers, lowercase. English and Polish, matching the
/// client languages the overlay ships with.
const MARKERS: &[&str] = &[
    "my name is",
    "i am ",
    "i'm ",
    "i live",
    "i work",
    "i like",
    "i love",
    "i use",
    "i prefer",
    "nazywam się",
    "mam na imię",
    "jestem",
    "mieszkam",
    "pracuję",
    "programuję",
    "lubię",
    "wolę",
];

const MAX_FACT_CHARS: usize = 200;

/// Extract fact-worthy sentences from a user message.
pub fn mine_facts(text: &str) -> Vec<String> {
    text.split(['.', '!', '?', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty() && s.len() <= MAX_FACT_CHARS)
        .filter(|s| {
            let lower = s.to_lowercase();
            MARKERS.iter().any(|m| lower.contains(m))
        })
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn english_self_descriptions_are_mined() {
        let facts = mine_facts("My name is Ada. The weather is nice today. I live in London.");
        assert_eq!(facts.len(), 2);
        assert!(facts[0].contains("Ada"));
        assert!(facts[1].contains("London"));
    }

    #[test]
    fn polish_self_descriptions_are_mined() {
        let facts = mine_facts("Nazywam się Marcin i jestem programistą");
        assert_eq!(facts.len(), 1);
        assert!(facts[0].contains("Marcin"));
    }

    #[test]
    fn questions_without_markers_yield_nothing() {
        assert!(mine_facts("What's the weather in Warsaw?").is_empty());
    }

    #[test]
    fn oversized_sentences_are_skipped() {
        let long = format!("I am {}", "x".repeat(300));
        assert!(mine_facts(&long).is_empty());
    }
}
