//! System prompt selection.
//!
//! A pure decision over a closed set of variants. Precedence:
//!
//! 1. An explicit tool intent supplied by the caller
//! 2. Keyword signals from the query and the window's last user turn,
//!    counted once when they are the same text; the family with the most
//!    matches wins, ties go calendar, then search, then tasks
//! 3. [`PromptVariant::General`]

use serde::{Deserialize, Serialize};

use crate::context::ContextWindow;

const CALENDAR_KEYWORDS: &[&str] = &[
    "calendar",
    "schedule",
    "meeting",
    "appointment",
    "event",
    "booking",
    "agenda",
    "time slot",
    "availability",
    "reservation",
    "conference",
    "call",
    "interview",
];

const SEARCH_KEYWORDS: &[&str] = &[
    "news",
    "weather",
    "forecast",
    "temperature",
    "current",
    "latest",
    "today",
    "recent",
    "breaking",
    "live",
    "search",
    "look up",
    "price",
    "stock",
    "score",
    "election",
    "what is",
    "going on",
];

const TASK_KEYWORDS: &[&str] = &[
    "task",
    "todo",
    "to do",
    "priority",
    "due",
    "deadline",
    "remind",
    "reminder",
    "ticket",
    "backlog",
    "project",
];

/// The closed set of system prompt variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptVariant {
    General,
    Calendar,
    Search,
    TaskFocused,
}

impl PromptVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Calendar => "calendar",
            Self::Search => "search",
            Self::TaskFocused => "task_focused",
        }
    }

    /// The fixed system prompt for this variant.
    pub fn system_prompt(&self) -> &'static str {
        match self {
            Self::General => {
                "You are TaskMind, a concise personal assistant. Answer directly, use the \
                 conversation and any notes from earlier conversations when they are relevant, \
                 and say so when you do not know something."
            }
            Self::Calendar => {
                "You are TaskMind, a scheduling assistant. Help the user plan meetings, \
                 appointments and events. Always state dates, times and time zones explicitly, \
                 point out conflicts with what you know of their schedule, and confirm before \
                 committing to anything."
            }
            Self::Search => {
                "You are TaskMind, a research assistant for time-sensitive questions. Be clear \
                 about how current your information is, separate facts from estimates, and \
                 recommend checking a live source when freshness matters."
            }
            Self::TaskFocused => {
                "You are TaskMind, a task management assistant. Help the user capture, \
                 prioritise and track their tasks. Be specific about titles, due dates and \
                 priorities, and suggest the next concrete action."
            }
        }
    }
}

impl std::fmt::Display for PromptVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tool the caller has already decided to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolIntent {
    Calendar,
    Search,
    Tasks,
}

/// Inputs to [`select`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signals {
    pub tool_intent: Option<ToolIntent>,
    pub calendar: usize,
    pub search: usize,
    pub task: usize,
    /// Normalized text the counts were read from
    pub source: Option<String>,
}

impl Signals {
    /// Count keyword hits in `text`.
    pub fn detect(text: &str) -> Self {
        let normalized = normalize(text);
        Self {
            tool_intent: None,
            calendar: count_hits(&normalized, CALENDAR_KEYWORDS),
            search: count_hits(&normalized, SEARCH_KEYWORDS),
            task: count_hits(&normalized, TASK_KEYWORDS),
            source: Some(normalized),
        }
    }

    pub fn with_tool_intent(mut self, intent: ToolIntent) -> Self {
        self.tool_intent = Some(intent);
        self
    }

    /// Add the keywords of the window's last user turn unless these
    /// signals were already read from it.
    pub fn with_window(&self, window: &ContextWindow) -> Signals {
        let Some(text) = window.last_user_text() else {
            return self.clone();
        };
        let turn = Signals::detect(text);
        if self.source == turn.source {
            return self.clone();
        }
        Signals {
            tool_intent: self.tool_intent,
            calendar: self.calendar + turn.calendar,
            search: self.search + turn.search,
            task: self.task + turn.task,
            source: self.source.clone(),
        }
    }
}

/// Choose the prompt variant for a window.
pub fn select(window: &ContextWindow, signals: &Signals) -> PromptVariant {
    if let Some(intent) = signals.tool_intent {
        return match intent {
            ToolIntent::Calendar => PromptVariant::Calendar,
            ToolIntent::Search => PromptVariant::Search,
            ToolIntent::Tasks => PromptVariant::TaskFocused,
        };
    }

    let signals = signals.with_window(window);

    // Fixed order: an earlier family wins a tie
    let ranked = [
        (signals.calendar, PromptVariant::Calendar),
        (signals.search, PromptVariant::Search),
        (signals.task, PromptVariant::TaskFocused),
    ];
    let mut best = (0, PromptVariant::General);
    for (hits, variant) in ranked {
        if hits > best.0 {
            best = (hits, variant);
        }
    }
    best.1
}

/// Lowercase, keep alphanumerics, collapse everything else to single spaces,
/// and pad with spaces so phrases can be matched on word boundaries.
fn normalize(text: &str) -> String {
    let words: Vec<String> = text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect();
    format!(" {} ", words.join(" "))
}

/// Whole-word (or whole-phrase) matches, counting a trailing plural `s`.
fn count_hits(normalized: &str, keywords: &[&str]) -> usize {
    keywords
        .iter()
        .map(|kw| {
            normalized.matches(&format!(" {kw} ")).count()
                + normalized.matches(&format!(" {kw}s ")).count()
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextItem, Origin};
    use chrono::Utc;
    use taskmind_core::message::Role;

    fn window_with_user_turn(text: &str) -> ContextWindow {
        ContextWindow {
            items: vec![ContextItem {
                role: Role::User,
                text: text.into(),
                origin: Origin::Session,
                score: None,
                tokens: 10,
                timestamp: Utc::now(),
                source_id: "t1".into(),
            }],
            total_tokens: 10,
            budget: 100,
            degradation: None,
        }
    }

    fn empty_window() -> ContextWindow {
        ContextWindow {
            items: vec![],
            total_tokens: 0,
            budget: 100,
            degradation: None,
        }
    }

    fn pick(text: &str) -> PromptVariant {
        select(&empty_window(), &Signals::detect(text))
    }

    #[test]
    fn keywords_select_variants() {
        assert_eq!(pick("Can you schedule a meeting with Dana?"), PromptVariant::Calendar);
        assert_eq!(pick("What's the latest news on the election?"), PromptVariant::Search);
        assert_eq!(pick("Add a task: the deadline is Monday"), PromptVariant::TaskFocused);
        assert_eq!(pick("Tell me a joke"), PromptVariant::General);
    }

    #[test]
    fn matches_whole_words_and_plurals() {
        assert_eq!(Signals::detect("two meetings and one call").calendar, 2);
        // "recalled" must not match "call"
        assert_eq!(Signals::detect("she recalled it").calendar, 0);
        assert_eq!(Signals::detect("please look up the score").search, 2);
    }

    #[test]
    fn highest_count_wins() {
        // one calendar hit, two task hits
        assert_eq!(
            pick("meeting about the task backlog"),
            PromptVariant::TaskFocused
        );
    }

    #[test]
    fn ties_follow_fixed_order() {
        // one calendar, one search, one task
        assert_eq!(pick("meeting news task"), PromptVariant::Calendar);
        // one search, one task
        assert_eq!(pick("weather deadline"), PromptVariant::Search);
    }

    #[test]
    fn query_that_is_the_last_turn_counts_once() {
        let window = window_with_user_turn("Schedule a meeting");
        let combined = Signals::detect("schedule a meeting").with_window(&window);
        assert_eq!(combined.calendar, 2);
    }

    #[test]
    fn distinct_last_turn_adds_its_keywords() {
        // The query alone leans calendar; the earlier turn tips it to tasks
        let window = window_with_user_turn("put it on the task backlog");
        let combined = Signals::detect("after the meeting").with_window(&window);
        assert_eq!((combined.calendar, combined.task), (1, 2));
        assert_eq!(
            select(&window, &Signals::detect("after the meeting")),
            PromptVariant::TaskFocused
        );
        assert_eq!(select(&window, &Signals::default()), PromptVariant::TaskFocused);
    }

    #[test]
    fn tool_intent_overrides_keywords() {
        let signals = Signals::detect("schedule a meeting").with_tool_intent(ToolIntent::Tasks);
        assert_eq!(select(&empty_window(), &signals), PromptVariant::TaskFocused);
    }

    #[test]
    fn every_variant_has_a_distinct_prompt() {
        let variants = [
            PromptVariant::General,
            PromptVariant::Calendar,
            PromptVariant::Search,
            PromptVariant::TaskFocused,
        ];
        let prompts: std::collections::HashSet<_> =
            variants.iter().map(|v| v.system_prompt()).collect();
        assert_eq!(prompts.len(), variants.len());
    }
}
