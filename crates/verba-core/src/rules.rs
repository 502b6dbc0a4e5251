//! Behavioral rule detection and injection.
//!
//! Transcripts of user turns are matched against a static table of command
//! patterns (language-mode switches, speech-pace changes). A detected command
//! becomes an [`ActiveRule`] — one per kind per student, updated in place on
//! re-detection — persisted through the [`RuleStore`] and turned into an
//! injection message for the live conversation. Every few quiet turns the
//! engine also emits a compact reminder of the rules still in force, because
//! silently adopted rules were observed to drift back within a few turns.

use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::store::RuleStore;

/// A reminder fires after this many user turns without any injection.
pub const REMINDER_TURN_INTERVAL: u32 = 8;
/// A reminder lists at most this many rules, highest priority first.
pub const REMINDER_RULE_CAP: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum RuleKind {
    #[serde(rename = "language-mode")]
    LanguageMode,
    #[serde(rename = "speech-pace")]
    SpeechPace,
}

impl RuleKind {
    /// Fixed per kind: language-mode outranks speech-pace.
    pub fn priority(self) -> i32 {
        match self {
            RuleKind::LanguageMode => 100,
            RuleKind::SpeechPace => 50,
        }
    }
}

/// A behavioral directive currently in force for a student.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ActiveRule {
    pub student_id: String,
    pub kind: RuleKind,
    pub value: String,
    pub priority: i32,
    /// Fully formatted injection text, rebuilt on every (re-)detection.
    pub content: String,
    /// Pattern id that produced the rule.
    pub source: String,
    pub active: bool,
    pub created_at: SystemTime,
}

/// A detected instruction candidate. Consumed immediately after detection.
#[derive(Debug, Clone)]
pub struct RuleCommand {
    pub pattern_id: &'static str,
    pub kind: RuleKind,
    pub value: &'static str,
}

struct CommandPattern {
    id: &'static str,
    kind: RuleKind,
    value: &'static str,
    regex: Regex,
}

/// Ordered table of detectable commands, in the student's language and the
/// target language. First match per kind wins; the detection loop itself is
/// pattern-agnostic so rows can be added without touching control flow.
static COMMAND_PATTERNS: Lazy<Vec<CommandPattern>> = Lazy::new(|| {
    let row = |id, kind, value, pattern: &str| CommandPattern {
        id,
        kind,
        value,
        regex: Regex::new(pattern).expect("command pattern must compile"),
    };
    vec![
        row(
            "lang-ru-en",
            RuleKind::LanguageMode,
            "RU_ONLY",
            r"(?i)\b(?:speak|talk|switch\s+to|let'?s\s+speak)\b.{0,24}\brussian\b",
        ),
        row(
            "lang-ru-ru",
            RuleKind::LanguageMode,
            "RU_ONLY",
            r"(?i)по[- ]русски|на\s+русск(?:ий|ом)",
        ),
        row(
            "lang-en-en",
            RuleKind::LanguageMode,
            "EN_ONLY",
            r"(?i)\b(?:speak|talk|switch\s+to|let'?s\s+speak)\b.{0,24}\benglish\b",
        ),
        row(
            "lang-en-ru",
            RuleKind::LanguageMode,
            "EN_ONLY",
            r"(?i)по[- ]английски|на\s+английск(?:ий|ом)",
        ),
        row(
            "pace-slow-en",
            RuleKind::SpeechPace,
            "SLOWER",
            r"(?i)\bslow\s+down\b|\bmore\s+slowly\b|\b(?:speak|talk|go)\s+(?:a\s+(?:bit|little)\s+)?slower\b",
        ),
        row(
            "pace-slow-ru",
            RuleKind::SpeechPace,
            "SLOWER",
            r"(?i)помедленнее|говори(?:те)?\s+медленнее",
        ),
        row(
            "pace-fast-en",
            RuleKind::SpeechPace,
            "FASTER",
            r"(?i)\b(?:speak|talk)\s+faster\b|\bspeed\s+up\b",
        ),
        row(
            "pace-fast-ru",
            RuleKind::SpeechPace,
            "FASTER",
            r"(?i)побыстрее|говори(?:те)?\s+быстрее",
        ),
    ]
});

/// Match a transcript against the command table. First match per kind wins,
/// but different kinds may fire from one transcript.
pub fn detect_commands(transcript: &str) -> Vec<RuleCommand> {
    let mut commands: Vec<RuleCommand> = Vec::new();
    for pattern in COMMAND_PATTERNS.iter() {
        if commands.iter().any(|c| c.kind == pattern.kind) {
            continue;
        }
        if pattern.regex.is_match(transcript) {
            commands.push(RuleCommand {
                pattern_id: pattern.id,
                kind: pattern.kind,
                value: pattern.value,
            });
        }
    }
    commands
}

/// Short imperative restating a rule, used in reminders and the initial
/// injection.
fn rule_summary(kind: RuleKind, value: &str) -> String {
    match (kind, value) {
        (RuleKind::LanguageMode, "RU_ONLY") => "speak only Russian".to_string(),
        (RuleKind::LanguageMode, "EN_ONLY") => "speak only English".to_string(),
        (RuleKind::SpeechPace, "SLOWER") => "speak noticeably slower".to_string(),
        (RuleKind::SpeechPace, "FASTER") => "speak a little faster".to_string(),
        (kind, value) => format!("follow the {kind:?} rule ({value})"),
    }
}

/// The mandatory spoken acknowledgment, in the language the rule (or the
/// lesson) calls for. Skipping it lets the model drift back to its previous
/// behavior within a few turns.
fn acknowledgment(kind: RuleKind, value: &str, target_language: &str) -> String {
    match (kind, value) {
        (RuleKind::LanguageMode, "RU_ONLY") => {
            "You MUST acknowledge this rule out loud right now, in Russian, for example: \
             «Хорошо, с этого момента говорим только по-русски!»"
                .to_string()
        }
        (RuleKind::LanguageMode, _) => {
            "You MUST acknowledge this rule out loud right now, in English, for example: \
             \"Okay, from now on we speak English only!\""
                .to_string()
        }
        (RuleKind::SpeechPace, _) if target_language == "ru" => {
            "You MUST acknowledge this rule out loud right now, in Russian, for example: \
             «Хорошо, буду говорить в другом темпе.»"
                .to_string()
        }
        (RuleKind::SpeechPace, _) => {
            "You MUST acknowledge this rule out loud right now, for example: \
             \"Okay, I'll adjust my pace.\""
                .to_string()
        }
    }
}

fn injection_content(kind: RuleKind, value: &str, target_language: &str) -> String {
    format!(
        "[IMPORTANT — NEW RULE] The student just asked you to {summary}. \
         From this turn on you must {summary}, regardless of any earlier instruction. \
         {ack}",
        summary = rule_summary(kind, value),
        ack = acknowledgment(kind, value, target_language),
    )
}

/// Per-student rule state: the active rules keyed by kind, plus the turn
/// counter that drives periodic reminders.
pub struct RuleEngine {
    store: Arc<dyn RuleStore>,
    student_id: String,
    target_language: String,
    rules: Vec<ActiveRule>,
    turns_since_injection: u32,
}

impl RuleEngine {
    /// Load persisted rules for the student and start counting turns.
    pub async fn load(
        store: Arc<dyn RuleStore>,
        student_id: &str,
        target_language: &str,
    ) -> Result<Self> {
        let mut rules = store.load_active(student_id).await?;
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(Self {
            store,
            student_id: student_id.to_string(),
            target_language: target_language.to_string(),
            rules,
            turns_since_injection: 0,
        })
    }

    pub fn active_rules(&self) -> &[ActiveRule] {
        &self.rules
    }

    /// One-time injection at session start covering every persisted rule,
    /// highest priority first. `None` when the student has no rules.
    pub fn initial_injection(&self) -> Option<String> {
        if self.rules.is_empty() {
            return None;
        }
        let listed = self
            .rules
            .iter()
            .enumerate()
            .map(|(i, r)| format!("{}. {}", i + 1, rule_summary(r.kind, &r.value)))
            .collect::<Vec<_>>()
            .join(" ");
        Some(format!(
            "[IMPORTANT — STANDING RULES] This student has standing rules from \
             earlier lessons. Follow them from your very first reply: {listed}"
        ))
    }

    /// Process one user transcript.
    ///
    /// Returns at most one injection string: a fresh-rule message when a
    /// command was detected (which also persists the rule), otherwise a
    /// periodic reminder when one is due, otherwise `None`. Any returned
    /// injection resets the reminder counter.
    pub async fn process_user_turn(&mut self, transcript: &str) -> Result<Option<String>> {
        let commands = detect_commands(transcript);

        if !commands.is_empty() {
            let mut fresh = Vec::with_capacity(commands.len());
            for command in commands {
                let rule = ActiveRule {
                    student_id: self.student_id.clone(),
                    kind: command.kind,
                    value: command.value.to_string(),
                    priority: command.kind.priority(),
                    content: injection_content(command.kind, command.value, &self.target_language),
                    source: command.pattern_id.to_string(),
                    active: true,
                    created_at: SystemTime::now(),
                };
                self.store.upsert(&rule).await?;
                tracing::info!(
                    student = %self.student_id,
                    kind = ?rule.kind,
                    value = %rule.value,
                    "rule detected"
                );
                fresh.push(rule.content.clone());
                self.remember(rule);
            }
            self.turns_since_injection = 0;
            return Ok(Some(fresh.join("\n")));
        }

        if self.turns_since_injection >= REMINDER_TURN_INTERVAL && !self.rules.is_empty() {
            self.turns_since_injection = 0;
            return Ok(Some(self.reminder()));
        }
        self.turns_since_injection += 1;
        Ok(None)
    }

    /// Replace the rule of the same kind, or append. Keeps the vec sorted by
    /// priority so reminders and the initial injection read in rank order.
    fn remember(&mut self, rule: ActiveRule) {
        match self.rules.iter_mut().find(|r| r.kind == rule.kind) {
            Some(existing) => *existing = rule,
            None => self.rules.push(rule),
        }
        self.rules.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    fn reminder(&self) -> String {
        let listed = self
            .rules
            .iter()
            .take(REMINDER_RULE_CAP)
            .enumerate()
            .map(|(i, r)| format!("{}. {}", i + 1, rule_summary(r.kind, &r.value)))
            .collect::<Vec<_>>()
            .join(" ");
        format!("[REMINDER] Keep following the active session rules: {listed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRuleStore;

    async fn engine(store: Arc<MemoryRuleStore>) -> RuleEngine {
        RuleEngine::load(store, "student-1", "ru").await.unwrap()
    }

    #[tokio::test]
    async fn language_switch_creates_rule_with_russian_acknowledgment() {
        let store = Arc::new(MemoryRuleStore::new());
        let mut engine = engine(store.clone()).await;

        let injection = engine
            .process_user_turn("speak Russian please")
            .await
            .unwrap()
            .expect("language command must produce an injection");

        assert!(injection.contains("по-русски"), "needs a Russian acknowledgment");
        assert!(injection.contains("MUST acknowledge"));

        let persisted = store.load_active("student-1").await.unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].kind, RuleKind::LanguageMode);
        assert_eq!(persisted[0].value, "RU_ONLY");
        assert_eq!(persisted[0].priority, 100);
    }

    #[tokio::test]
    async fn repeated_command_updates_instead_of_duplicating() {
        let store = Arc::new(MemoryRuleStore::new());
        let mut engine = engine(store.clone()).await;

        engine.process_user_turn("speak Russian").await.unwrap();
        let second = engine.process_user_turn("давай по-русски").await.unwrap();

        // Re-detection reinjects rather than going silent.
        assert!(second.is_some());
        let persisted = store.load_active("student-1").await.unwrap();
        assert_eq!(persisted.len(), 1, "same kind must update, not insert");
        assert_eq!(persisted[0].source, "lang-ru-ru");
    }

    #[tokio::test]
    async fn reminder_fires_after_eight_quiet_turns_and_not_before() {
        let store = Arc::new(MemoryRuleStore::new());
        let mut engine = engine(store.clone()).await;
        engine.process_user_turn("speak Russian").await.unwrap();

        for turn in 0..REMINDER_TURN_INTERVAL {
            let out = engine.process_user_turn("как дела?").await.unwrap();
            assert!(out.is_none(), "turn {turn} must be quiet");
        }
        let ninth = engine.process_user_turn("хорошо, спасибо").await.unwrap();
        let reminder = ninth.expect("ninth quiet call must remind");
        assert!(reminder.contains("[REMINDER]"));
        assert!(reminder.contains("speak only Russian"));

        let tenth = engine.process_user_turn("а у тебя?").await.unwrap();
        assert!(tenth.is_none(), "the new window has just started");
    }

    #[tokio::test]
    async fn no_reminder_without_active_rules() {
        let store = Arc::new(MemoryRuleStore::new());
        let mut engine = engine(store).await;
        for _ in 0..30 {
            assert!(engine.process_user_turn("just chatting").await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn one_transcript_may_fire_multiple_kinds() {
        let store = Arc::new(MemoryRuleStore::new());
        let mut engine = engine(store.clone()).await;

        let injection = engine
            .process_user_turn("speak Russian and please slow down")
            .await
            .unwrap()
            .expect("two commands, one injection string");

        assert!(injection.contains("speak only Russian"));
        assert!(injection.contains("slower"));
        assert_eq!(store.load_active("student-1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn first_match_per_kind_wins() {
        let store = Arc::new(MemoryRuleStore::new());
        let mut engine = engine(store.clone()).await;

        engine
            .process_user_turn("speak Russian... actually no, speak English")
            .await
            .unwrap();

        let persisted = store.load_active("student-1").await.unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].value, "RU_ONLY");
    }

    #[tokio::test]
    async fn initial_injection_lists_persisted_rules_by_priority() {
        let store = Arc::new(MemoryRuleStore::new());
        {
            let mut warmup = engine(store.clone()).await;
            warmup.process_user_turn("slow down").await.unwrap();
            warmup.process_user_turn("speak Russian").await.unwrap();
        }

        let fresh = engine(store.clone()).await;
        let injection = fresh.initial_injection().expect("two persisted rules");
        let lang = injection.find("speak only Russian").unwrap();
        let pace = injection.find("slower").unwrap();
        assert!(lang < pace, "higher priority rule listed first");

        let empty = RuleEngine::load(Arc::new(MemoryRuleStore::new()), "other", "ru")
            .await
            .unwrap();
        assert!(empty.initial_injection().is_none());
    }

    #[test]
    fn pace_commands_detected_in_both_languages() {
        for transcript in ["can you slow down a bit", "помедленнее, пожалуйста"] {
            let commands = detect_commands(transcript);
            assert_eq!(commands.len(), 1, "{transcript}");
            assert_eq!(commands[0].kind, RuleKind::SpeechPace);
            assert_eq!(commands[0].value, "SLOWER");
        }
    }

    #[test]
    fn plain_conversation_detects_nothing() {
        assert!(detect_commands("the weather is nice today").is_empty());
        assert!(detect_commands("я вчера читал книгу").is_empty());
    }
}
