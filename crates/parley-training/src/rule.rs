use parley_core::{ParleyError, ParleyResult};
use serde::{Deserialize, Serialize};

/// When a rule may become the sticky rule of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationMode {
    /// Matches every message.
    Always,
    /// Matches when the message contains the rule's keywords.
    Keywords,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeywordMatchType {
    /// At least one keyword present.
    #[default]
    Any,
    /// Every keyword present.
    All,
}

/// An automated-response ruleset authored for one connection.
///
/// Authored through the excluded CRUD surface; the gateway only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRule {
    pub id: String,
    pub connection_id: String,
    pub name: String,
    /// Free-form category set by the author (e.g. "sales", "support").
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Instructions fed to the LLM while this rule is sticky.
    pub content: String,
    pub activation_mode: ActivationMode,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub keyword_match_type: KeywordMatchType,
    #[serde(default)]
    pub exit_keywords: Vec<String>,
    /// Sent when an exit keyword ends the rule.
    #[serde(default)]
    pub exit_message: Option<String>,
    /// Minutes without activity after which the rule lapses. 0 = never.
    #[serde(default)]
    pub inactivity_timeout_minutes: u32,
    /// Higher wins.
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl TrainingRule {
    /// An active `Always` rule with priority 0.
    pub fn always(
        id: impl Into<String>,
        connection_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            connection_id: connection_id.into(),
            kind: String::new(),
            content: content.into(),
            activation_mode: ActivationMode::Always,
            keywords: Vec::new(),
            keyword_match_type: KeywordMatchType::Any,
            exit_keywords: Vec::new(),
            exit_message: None,
            inactivity_timeout_minutes: 0,
            priority: 0,
            is_active: true,
        }
    }

    /// An active `Keywords` rule with priority 0.
    pub fn keywords<S: Into<String>>(
        id: impl Into<String>,
        connection_id: impl Into<String>,
        content: impl Into<String>,
        keywords: impl IntoIterator<Item = S>,
        match_type: KeywordMatchType,
    ) -> Self {
        Self {
            activation_mode: ActivationMode::Keywords,
            keywords: keywords.into_iter().map(Into::into).collect(),
            keyword_match_type: match_type,
            ..Self::always(id, connection_id, content)
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_exit<S: Into<String>>(
        mut self,
        exit_keywords: impl IntoIterator<Item = S>,
        exit_message: Option<&str>,
    ) -> Self {
        self.exit_keywords = exit_keywords.into_iter().map(Into::into).collect();
        self.exit_message = exit_message.map(str::to_string);
        self
    }

    pub fn with_timeout_minutes(mut self, minutes: u32) -> Self {
        self.inactivity_timeout_minutes = minutes;
        self
    }

    /// Authoring-time check. A `Keywords` rule needs at least one keyword.
    pub fn validate(&self) -> ParleyResult<()> {
        if self.id.trim().is_empty() {
            return Err(ParleyError::InvalidInput("training rule id is empty".into()));
        }
        if self.activation_mode == ActivationMode::Keywords && normalized(&self.keywords).is_empty()
        {
            return Err(ParleyError::InvalidInput(format!(
                "training rule '{}' uses keyword activation but has no keywords",
                self.id
            )));
        }
        Ok(())
    }

    /// Whether this rule activates on `lowered` (already lowercased text).
    ///
    /// A `Keywords` rule without usable keywords never matches.
    pub(crate) fn activates_on(&self, lowered: &str) -> bool {
        match self.activation_mode {
            ActivationMode::Always => true,
            ActivationMode::Keywords => {
                let keywords = normalized(&self.keywords);
                if keywords.is_empty() {
                    return false;
                }
                match self.keyword_match_type {
                    KeywordMatchType::Any => keywords.iter().any(|k| lowered.contains(k.as_str())),
                    KeywordMatchType::All => keywords.iter().all(|k| lowered.contains(k.as_str())),
                }
            }
        }
    }

    pub(crate) fn exits_on(&self, lowered: &str) -> bool {
        normalized(&self.exit_keywords)
            .iter()
            .any(|k| lowered.contains(k.as_str()))
    }
}

/// Trimmed, lowercased, non-empty keywords.
fn normalized(keywords: &[String]) -> Vec<String> {
    keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect()
}
