use crate::rule::TrainingRule;
use chrono::{DateTime, Duration, Utc};
use parley_core::ActiveTraining;

/// What happened to the sticky rule on this turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// No rule is sticky and none matched.
    Idle,
    /// A rule matched and became sticky.
    Activated,
    /// The sticky rule stays in charge.
    Continued,
    /// An exit keyword ended the sticky rule.
    Exited,
}

/// Outcome of resolving one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution<'a> {
    /// Sticky state to store on the conversation.
    pub state: Option<ActiveTraining>,
    /// Rule whose content drives this turn's reply.
    pub rule: Option<&'a TrainingRule>,
    pub transition: Transition,
    /// Rule that ended this turn, by exit keyword.
    pub exited: Option<&'a TrainingRule>,
    /// Id of a sticky rule that lapsed (timeout, deactivated or deleted)
    /// before this turn was evaluated.
    pub expired: Option<String>,
}

impl Resolution<'_> {
    /// Exit message to send, if the rule ended with a non-blank one.
    pub fn exit_reply(&self) -> Option<&str> {
        self.exited
            .and_then(|r| r.exit_message.as_deref())
            .filter(|m| !m.trim().is_empty())
    }

    /// Whether the sticky state differs from `previous`.
    pub fn state_changed(&self, previous: Option<&ActiveTraining>) -> bool {
        self.state.as_ref() != previous
    }
}

/// Ranked view over one connection's rules.
///
/// Inactive rules are dropped. The rest are ordered by priority (highest
/// first), then by rule id, then by input order.
pub struct TrainingMatchEngine<'a> {
    ranked: Vec<&'a TrainingRule>,
}

impl<'a> TrainingMatchEngine<'a> {
    pub fn new(rules: &'a [TrainingRule]) -> Self {
        let mut ranked: Vec<&TrainingRule> = rules.iter().filter(|r| r.is_active).collect();
        ranked.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        Self { ranked }
    }

    /// Active rules in evaluation order.
    pub fn ranked(&self) -> &[&'a TrainingRule] {
        &self.ranked
    }

    /// Whether any active rule activates unconditionally.
    pub fn has_always_rule(&self) -> bool {
        self.ranked
            .iter()
            .any(|r| r.activation_mode == crate::ActivationMode::Always)
    }

    /// Resolve one inbound message against the sticky `state`.
    pub fn resolve(
        &self,
        state: Option<&ActiveTraining>,
        inbound: &str,
        now: DateTime<Utc>,
    ) -> Resolution<'a> {
        let lowered = inbound.to_lowercase();
        let mut expired = None;

        if let Some(active) = state {
            match self.find(&active.training_id) {
                Some(rule) if Self::lapsed(rule, active, now) => {
                    expired = Some(active.training_id.clone());
                }
                Some(rule) => {
                    if rule.exits_on(&lowered) {
                        return Resolution {
                            state: None,
                            rule: None,
                            transition: Transition::Exited,
                            exited: Some(rule),
                            expired: None,
                        };
                    }
                    let mut next = active.clone();
                    next.last_activity_at = now;
                    return Resolution {
                        state: Some(next),
                        rule: Some(rule),
                        transition: Transition::Continued,
                        exited: None,
                        expired: None,
                    };
                }
                // Deleted or deactivated since it became sticky.
                None => expired = Some(active.training_id.clone()),
            }
        }

        match self.ranked.iter().copied().find(|r| r.activates_on(&lowered)) {
            Some(rule) => Resolution {
                state: Some(ActiveTraining::start(rule.id.clone(), now)),
                rule: Some(rule),
                transition: Transition::Activated,
                exited: None,
                expired,
            },
            None => Resolution {
                state: None,
                rule: None,
                transition: Transition::Idle,
                exited: None,
                expired,
            },
        }
    }

    fn find(&self, id: &str) -> Option<&'a TrainingRule> {
        self.ranked.iter().copied().find(|r| r.id == id)
    }

    fn lapsed(rule: &TrainingRule, active: &ActiveTraining, now: DateTime<Utc>) -> bool {
        if rule.inactivity_timeout_minutes == 0 {
            return false;
        }
        let last = active.last_activity_at.max(active.started_at);
        now - last > Duration::minutes(i64::from(rule.inactivity_timeout_minutes))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::rule::KeywordMatchType;

    fn pricing() -> TrainingRule {
        TrainingRule::keywords(
            "rule-a",
            "shop1",
            "Talk about prices.",
            ["preço", "valor"],
            KeywordMatchType::Any,
        )
        .with_priority(10)
        .with_exit(["tchau"], Some("Até logo!"))
    }

    fn fallback() -> TrainingRule {
        TrainingRule::always("rule-b", "shop1", "General help.").with_priority(5)
    }

    #[test]
    fn test_higher_priority_keyword_rule_beats_always() {
        let rules = vec![fallback(), pricing()];
        let engine = TrainingMatchEngine::new(&rules);
        let res = engine.resolve(None, "qual o preço?", Utc::now());
        assert_eq!(res.transition, Transition::Activated);
        assert_eq!(res.rule.unwrap().id, "rule-a");
        assert_eq!(res.state.unwrap().training_id, "rule-a");
    }

    #[test]
    fn test_exit_clears_then_next_message_falls_through() {
        let rules = vec![pricing(), fallback()];
        let engine = TrainingMatchEngine::new(&rules);
        let t0 = Utc::now();

        let first = engine.resolve(None, "qual o preço?", t0);
        let exit = engine.resolve(first.state.as_ref(), "tchau", t0 + Duration::seconds(5));
        assert_eq!(exit.transition, Transition::Exited);
        assert!(exit.state.is_none());
        assert!(exit.rule.is_none());
        assert_eq!(exit.exit_reply(), Some("Até logo!"));

        let next = engine.resolve(exit.state.as_ref(), "bom dia", t0 + Duration::seconds(9));
        assert_eq!(next.transition, Transition::Activated);
        assert_eq!(next.rule.unwrap().id, "rule-b");
    }

    #[test]
    fn test_sticky_rule_continues_without_keyword() {
        let rules = vec![pricing(), fallback()];
        let engine = TrainingMatchEngine::new(&rules);
        let t0 = Utc::now();
        let first = engine.resolve(None, "o valor?", t0);
        let later = t0 + Duration::minutes(3);
        let second = engine.resolve(first.state.as_ref(), "e o frete?", later);
        assert_eq!(second.transition, Transition::Continued);
        assert_eq!(second.rule.unwrap().id, "rule-a");
        let state = second.state.unwrap();
        assert_eq!(state.started_at, t0);
        assert_eq!(state.last_activity_at, later);
    }

    #[test]
    fn test_inactivity_expires_and_rescans() {
        let rules = vec![pricing().with_timeout_minutes(30), fallback()];
        let engine = TrainingMatchEngine::new(&rules);
        let t0 = Utc::now();
        let first = engine.resolve(None, "preço", t0);

        let res = engine.resolve(first.state.as_ref(), "oi", t0 + Duration::minutes(31));
        assert_eq!(res.expired.as_deref(), Some("rule-a"));
        assert_eq!(res.transition, Transition::Activated);
        assert_eq!(res.rule.unwrap().id, "rule-b");
    }

    #[test]
    fn test_expiry_counts_from_last_activity() {
        let rules = vec![pricing().with_timeout_minutes(30)];
        let engine = TrainingMatchEngine::new(&rules);
        let t0 = Utc::now();
        let s1 = engine.resolve(None, "preço", t0).state;
        let s2 = engine
            .resolve(s1.as_ref(), "hmm", t0 + Duration::minutes(20))
            .state;
        let res = engine.resolve(s2.as_ref(), "ok", t0 + Duration::minutes(45));
        assert_eq!(res.transition, Transition::Continued);
    }

    #[test]
    fn test_expired_rule_can_reactivate_by_keyword() {
        let rules = vec![pricing().with_timeout_minutes(1)];
        let engine = TrainingMatchEngine::new(&rules);
        let t0 = Utc::now();
        let s1 = engine.resolve(None, "preço", t0).state;
        let res = engine.resolve(s1.as_ref(), "e o valor?", t0 + Duration::minutes(5));
        assert_eq!(res.expired.as_deref(), Some("rule-a"));
        assert_eq!(res.transition, Transition::Activated);
        assert_eq!(res.state.unwrap().started_at, t0 + Duration::minutes(5));
    }

    #[test]
    fn test_zero_timeout_never_expires() {
        let rules = vec![pricing()];
        let engine = TrainingMatchEngine::new(&rules);
        let t0 = Utc::now();
        let s1 = engine.resolve(None, "preço", t0).state;
        let res = engine.resolve(s1.as_ref(), "oi", t0 + Duration::days(400));
        assert_eq!(res.transition, Transition::Continued);
    }

    #[test]
    fn test_no_match_leaves_state_empty() {
        let rules = vec![pricing()];
        let engine = TrainingMatchEngine::new(&rules);
        let res = engine.resolve(None, "bom dia", Utc::now());
        assert_eq!(res.transition, Transition::Idle);
        assert!(res.state.is_none());
        assert!(res.rule.is_none());
        assert!(!res.state_changed(None));
    }

    #[test]
    fn test_inactive_rules_are_ignored() {
        let mut a = pricing();
        a.is_active = false;
        let rules = vec![a, fallback()];
        let engine = TrainingMatchEngine::new(&rules);
        let res = engine.resolve(None, "preço", Utc::now());
        assert_eq!(res.rule.unwrap().id, "rule-b");
    }

    #[test]
    fn test_sticky_rule_deactivated_is_cleared() {
        let t0 = Utc::now();
        let stale = ActiveTraining::start("rule-a", t0);
        let mut a = pricing();
        a.is_active = false;
        let rules = vec![a];
        let engine = TrainingMatchEngine::new(&rules);
        let res = engine.resolve(Some(&stale), "preço", t0);
        assert_eq!(res.expired.as_deref(), Some("rule-a"));
        assert_eq!(res.transition, Transition::Idle);
        assert!(res.state_changed(Some(&stale)));
    }

    #[test]
    fn test_equal_priority_breaks_ties_by_id() {
        let rules = vec![
            TrainingRule::always("zeta", "shop1", "z").with_priority(3),
            TrainingRule::always("alpha", "shop1", "a").with_priority(3),
        ];
        let engine = TrainingMatchEngine::new(&rules);
        let res = engine.resolve(None, "hello", Utc::now());
        assert_eq!(res.rule.unwrap().id, "alpha");
    }

    #[test]
    fn test_always_rule_honours_exit_keywords() {
        let rules = vec![fallback().with_exit(["sair"], None)];
        let engine = TrainingMatchEngine::new(&rules);
        let t0 = Utc::now();
        let s1 = engine.resolve(None, "oi", t0).state;
        let res = engine.resolve(s1.as_ref(), "quero SAIR", t0);
        assert_eq!(res.transition, Transition::Exited);
        assert!(res.exit_reply().is_none());
    }

    #[test]
    fn test_exit_keyword_without_sticky_rule_is_not_an_exit() {
        let rules = vec![pricing(), fallback()];
        let engine = TrainingMatchEngine::new(&rules);
        let res = engine.resolve(None, "tchau", Utc::now());
        assert_eq!(res.transition, Transition::Activated);
        assert_eq!(res.rule.unwrap().id, "rule-b");
    }

    #[test]
    fn test_has_always_rule() {
        let rules = vec![pricing()];
        assert!(!TrainingMatchEngine::new(&rules).has_always_rule());
        let rules = vec![pricing(), fallback()];
        assert!(TrainingMatchEngine::new(&rules).has_always_rule());
    }
}
