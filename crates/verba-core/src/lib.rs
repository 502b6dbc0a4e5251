pub mod conversation;
pub mod metrics;
pub mod profile;
pub mod rules;
pub mod store;

pub use conversation::{ConversationLog, ConversationTurn, Role};
pub use metrics::{LatencyRecorder, OperationKind};
pub use profile::{StudentProfile, VoiceEngine};
pub use rules::{ActiveRule, RuleEngine, RuleKind};
pub use store::{MemoryProfileStore, MemoryRuleStore, ProfileStore, RuleStore};
