//! Training rules and the match engine that picks which one drives a reply.
//!
//! The engine is pure: given a connection's rules, a conversation's sticky
//! state, the inbound text and the current time, it returns the next sticky
//! state and the rule (if any) whose content should steer the reply.
//!
//! # Main types
//!
//! - [`TrainingRule`] — Authored ruleset with activation and exit conditions.
//! - [`TrainingMatchEngine`] — Ranked view over a rule set that resolves turns.
//! - [`Resolution`] — Outcome of one turn.

/// Priority-ordered sticky rule resolution.
pub mod engine;
/// Training rule model and keyword matching.
pub mod rule;

pub use engine::{Resolution, TrainingMatchEngine, Transition};
pub use rule::{ActivationMode, KeywordMatchType, TrainingRule};
