//! Routing-query aggregation for fragmented user turns.
//!
//! People split one request over several quick messages ("can you",
//! "check the deploy", "the one from friday"). Routing on the last fragment
//! alone picks the wrong skill, so the aggregator looks at the recent user
//! messages and joins a contiguous fragment run into one query.

use marvin_sessions::{Message, Role};

/// How many trailing user messages are considered.
const WINDOW: usize = 5;

/// Two messages closer than this are treated as one typing burst.
const BURST_SECS: i64 = 60;

/// At least this many signals must hold for a message to count as a fragment.
const SIGNAL_THRESHOLD: usize = 2;

const BACK_REFERENCES: &[&str] = &[
    "it", "that", "this", "those", "these", "them", "they", "he", "she", "him", "her", "its",
    "there",
];

const CONTINUATION_MARKERS: &[&str] = &[
    "and", "also", "but", "then", "or", "plus", "so", "because", "with", "without",
];

/// What the detector saw — kept for logs.
#[derive(Debug, Clone, Default)]
pub struct AggregationAnalysis {
    pub fragmented: bool,
    /// Names of the signals that held for the latest message.
    pub signals: Vec<&'static str>,
    /// How many user messages were joined.
    pub joined: usize,
}

/// The query handed to the skill router.
#[derive(Debug, Clone)]
pub struct RoutingQuery {
    pub text: String,
    pub analysis: AggregationAnalysis,
}

/// Build the routing query from the working message list.
///
/// The latest user message is either standalone (returned as-is) or a
/// fragment, in which case the contiguous burst of recent user messages is
/// joined with single spaces, oldest first.
pub fn build_routing_query(messages: &[Message]) -> RoutingQuery {
    let users: Vec<&Message> = messages
        .iter()
        .filter(|m| m.role == Role::User)
        .rev()
        .take(WINDOW)
        .collect();

    let Some(&latest) = users.first() else {
        return RoutingQuery {
            text: String::new(),
            analysis: AggregationAnalysis::default(),
        };
    };

    let previous = users.get(1).copied();
    let signals = fragment_signals(latest, previous);
    let fragmented = signals.len() >= SIGNAL_THRESHOLD && previous.is_some();

    if !fragmented {
        return RoutingQuery {
            text: latest.text().to_string(),
            analysis: AggregationAnalysis {
                fragmented: false,
                signals,
                joined: 1,
            },
        };
    }

    // Walk back through the window while consecutive messages stay linked —
    // either by burst timing or by a dangling suffix on the older message.
    let mut run: Vec<&Message> = vec![latest];
    for pair in users.windows(2) {
        let (newer, older) = (pair[0], pair[1]);
        if within_burst(older, newer) || has_dangling_suffix(older) {
            run.push(older);
        } else {
            break;
        }
    }

    let joined = run.len();
    let text = run
        .iter()
        .rev()
        .map(|m| m.text().trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    RoutingQuery {
        text,
        analysis: AggregationAnalysis {
            fragmented: true,
            signals,
            joined,
        },
    }
}

/// Evaluate all fragment signals for the latest user message.
fn fragment_signals(latest: &Message, previous: Option<&Message>) -> Vec<&'static str> {
    let text = latest.text().trim();
    let mut signals = Vec::new();

    if text.split_whitespace().count() < 4 {
        signals.push("short");
    }

    let lower = text.to_lowercase();
    if lower
        .split(|c: char| !c.is_alphanumeric())
        .any(|w| BACK_REFERENCES.contains(&w))
    {
        signals.push("back_reference");
    }

    if let Some(first_word) = lower.split_whitespace().next() {
        if CONTINUATION_MARKERS.contains(&first_word) {
            signals.push("continuation_marker");
        }
    }

    if text.chars().next().is_some_and(|c| c.is_lowercase()) {
        signals.push("lowercase_start");
    }

    if let Some(prev) = previous {
        if has_dangling_suffix(prev) {
            signals.push("dangling_previous");
        }
        if within_burst(prev, latest) {
            signals.push("burst_timing");
        }
    }

    signals
}

/// True when the message trails off with continuation punctuation.
fn has_dangling_suffix(msg: &Message) -> bool {
    let text = msg.text().trim_end();
    ["...", ":", "-", "—"]
        .iter()
        .any(|suffix| text.ends_with(suffix))
}

/// True when `newer` follows `older` within the burst window.
fn within_burst(older: &Message, newer: &Message) -> bool {
    let parse = |m: &Message| chrono::DateTime::parse_from_rfc3339(&m.created_at).ok();
    match (parse(older), parse(newer)) {
        (Some(a), Some(b)) => (b - a).num_seconds().abs() <= BURST_SECS,
        // Unparseable timestamps: assume the same burst rather than splitting.
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_at(text: &str, secs: i64) -> Message {
        let ts = chrono::DateTime::from_timestamp(1_767_225_600 + secs, 0)
            .unwrap()
            .to_rfc3339();
        Message::user(text, ts)
    }

    fn assistant_at(text: &str, secs: i64) -> Message {
        let ts = chrono::DateTime::from_timestamp(1_767_225_600 + secs, 0)
            .unwrap()
            .to_rfc3339();
        Message::assistant_text(text, ts)
    }

    #[test]
    fn standalone_question_is_not_fragmented() {
        let messages = vec![user_at("What's the weather like in Berlin today?", 0)];
        let query = build_routing_query(&messages);
        assert!(!query.analysis.fragmented);
        assert_eq!(query.text, "What's the weather like in Berlin today?");
    }

    #[test]
    fn short_burst_continuation_is_joined() {
        let messages = vec![
            user_at("Can you check the deploy pipeline", 0),
            user_at("and fix it", 10),
        ];
        let query = build_routing_query(&messages);
        assert!(query.analysis.fragmented);
        assert_eq!(query.text, "Can you check the deploy pipeline and fix it");
        assert_eq!(query.analysis.joined, 2);
    }

    #[test]
    fn slow_followup_is_standalone() {
        // Capitalized, 4+ words, far apart in time: one weak signal at most.
        let messages = vec![
            user_at("Can you check the deploy pipeline", 0),
            user_at("Show me the database schema instead", 600),
        ];
        let query = build_routing_query(&messages);
        assert!(!query.analysis.fragmented);
        assert_eq!(query.text, "Show me the database schema instead");
    }

    #[test]
    fn dangling_previous_plus_short_triggers() {
        let messages = vec![
            user_at("Here is what I need:", 0),
            user_at("Weekly report", 3000),
        ];
        let query = build_routing_query(&messages);
        // "short" + "dangling_previous" — burst timing does not hold.
        assert!(query.analysis.fragmented);
        assert_eq!(query.text, "Here is what I need: Weekly report");
    }

    #[test]
    fn assistant_messages_do_not_join() {
        let messages = vec![
            user_at("summarize the readme", 0),
            assistant_at("Sure — which repo?", 5),
            user_at("the main one", 10),
        ];
        let query = build_routing_query(&messages);
        assert!(query.analysis.fragmented);
        // Only user texts are joined.
        assert_eq!(query.text, "summarize the readme the main one");
    }

    #[test]
    fn window_caps_at_five_user_messages() {
        let mut messages = Vec::new();
        for i in 0..8 {
            messages.push(user_at(&format!("part {i}"), i * 5));
        }
        let query = build_routing_query(&messages);
        assert!(query.analysis.fragmented);
        assert_eq!(query.analysis.joined, 5);
        assert_eq!(query.text, "part 3 part 4 part 5 part 6 part 7");
    }

    #[test]
    fn empty_history_yields_empty_query() {
        let query = build_routing_query(&[]);
        assert_eq!(query.text, "");
        assert!(!query.analysis.fragmented);
    }
}
