//! Seams to the external credential/preference and rule stores.
//!
//! The orchestrator only ever talks to these traits; production wires
//! database-backed implementations, tests and local runs use the in-memory
//! ones below.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::sync::Mutex;

use crate::profile::StudentProfile;
use crate::rules::{ActiveRule, RuleKind};

/// Read-only access to student credentials and preferences, consulted once
/// at session start.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Resolve a connection token to a student profile. `None` means the
    /// token is unknown and the connection must be rejected.
    async fn profile_for_token(&self, token: &str) -> Result<Option<StudentProfile>>;
}

/// Durable behavioral rules per student. The only resource shared across
/// sessions of the same student; writes to the same (student, kind) row are
/// last-writer-wins and must be serialized by the implementation.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn load_active(&self, student_id: &str) -> Result<Vec<ActiveRule>>;

    /// Insert the rule, or update in place when a rule of the same kind
    /// already exists for the student.
    async fn upsert(&self, rule: &ActiveRule) -> Result<()>;
}

/// In-memory rule store. The mutex serializes concurrent writers the way a
/// real table would serialize row updates.
#[derive(Default)]
pub struct MemoryRuleStore {
    rows: Mutex<HashMap<(String, RuleKind), ActiveRule>>,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn load_active(&self, student_id: &str) -> Result<Vec<ActiveRule>> {
        let rows = self.rows.lock().await;
        let mut rules: Vec<ActiveRule> = rows
            .values()
            .filter(|r| r.student_id == student_id && r.active)
            .cloned()
            .collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(rules)
    }

    async fn upsert(&self, rule: &ActiveRule) -> Result<()> {
        let mut rows = self.rows.lock().await;
        rows.insert((rule.student_id.clone(), rule.kind), rule.clone());
        Ok(())
    }
}

/// In-memory profile store keyed by connection token.
#[derive(Default)]
pub struct MemoryProfileStore {
    profiles: HashMap<String, StudentProfile>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(mut self, token: &str, profile: StudentProfile) -> Self {
        self.profiles.insert(token.to_string(), profile);
        self
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn profile_for_token(&self, token: &str) -> Result<Option<StudentProfile>> {
        Ok(self.profiles.get(token).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::VoiceEngine;
    use std::time::SystemTime;

    fn rule(student: &str, kind: RuleKind, value: &str) -> ActiveRule {
        ActiveRule {
            student_id: student.to_string(),
            kind,
            value: value.to_string(),
            priority: kind.priority(),
            content: format!("rule {value}"),
            source: "test".to_string(),
            active: true,
            created_at: SystemTime::now(),
        }
    }

    #[tokio::test]
    async fn upsert_is_keyed_by_student_and_kind() {
        let store = MemoryRuleStore::new();
        store
            .upsert(&rule("s1", RuleKind::LanguageMode, "RU_ONLY"))
            .await
            .unwrap();
        store
            .upsert(&rule("s1", RuleKind::LanguageMode, "EN_ONLY"))
            .await
            .unwrap();
        store
            .upsert(&rule("s2", RuleKind::LanguageMode, "RU_ONLY"))
            .await
            .unwrap();

        let s1 = store.load_active("s1").await.unwrap();
        assert_eq!(s1.len(), 1);
        assert_eq!(s1[0].value, "EN_ONLY", "second write wins");
        assert_eq!(store.load_active("s2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn load_active_sorts_by_priority() {
        let store = MemoryRuleStore::new();
        store
            .upsert(&rule("s1", RuleKind::SpeechPace, "SLOWER"))
            .await
            .unwrap();
        store
            .upsert(&rule("s1", RuleKind::LanguageMode, "RU_ONLY"))
            .await
            .unwrap();

        let rules = store.load_active("s1").await.unwrap();
        assert_eq!(rules[0].kind, RuleKind::LanguageMode);
        assert_eq!(rules[1].kind, RuleKind::SpeechPace);
    }

    #[tokio::test]
    async fn unknown_token_resolves_to_none() {
        let store = MemoryProfileStore::new().with_profile(
            "tok-1",
            StudentProfile {
                student_id: "s1".into(),
                voice_engine: VoiceEngine::HostedRealtime,
                voice: "alloy".into(),
                native_language: "en".into(),
                target_language: "ru".into(),
            },
        );

        assert!(store.profile_for_token("tok-1").await.unwrap().is_some());
        assert!(store.profile_for_token("nope").await.unwrap().is_none());
    }
}
