//! Policy aggregation
//!
//! Combines independently produced [`PolicyEvaluation`]s into one
//! authoritative decision. Every method is deterministic for a given ordered
//! input, and an empty input is an error rather than an implicit `allow`.

use crate::error::PolicyError;
use crate::evaluation::PolicyEvaluation;
use cabin_artifact::{MetaMap, MetaValue};
use cabin_protocol::Decision;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Debug, Display, Formatter};
use std::sync::Arc;

/// How evaluations combine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMethod {
    /// Highest severity wins; ties go to the first listed
    #[default]
    MostRestrictive,
    /// Any deny decides; otherwise most restrictive
    AnyDeny,
    /// Allow only if every policy allows; otherwise most restrictive
    AllAllow,
    /// The shared decision if all agree; otherwise most restrictive
    Unanimous,
    /// Strict majority decides; otherwise most restrictive
    Majority,
    /// A registered [`CustomRule`] decides
    Custom,
}

impl AggregationMethod {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MostRestrictive => "most_restrictive",
            Self::AnyDeny => "any_deny",
            Self::AllAllow => "all_allow",
            Self::Unanimous => "unanimous",
            Self::Majority => "majority",
            Self::Custom => "custom",
        }
    }
}

impl Display for AggregationMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision picked by a custom rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CustomVerdict {
    pub decision: Decision,
    /// Evaluation that decided, if one did
    pub deciding_index: Option<usize>,
}

/// Site-specific aggregation rule
///
/// Implementations must be pure: the same evaluations always give the same
/// verdict.
pub trait CustomRule: Send + Sync + Debug {
    /// Name recorded in the aggregate's evidence
    fn name(&self) -> &str;

    /// Decide over a non-empty, consistency-checked list
    ///
    /// # Errors
    /// Implementation-defined
    fn decide(&self, evaluations: &[PolicyEvaluation]) -> Result<CustomVerdict, PolicyError>;
}

/// Result of aggregation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateDecision {
    pub decision: Decision,
    pub method: AggregationMethod,
    /// Index into `evaluations` of the deciding policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deciding_index: Option<usize>,
    pub evidence: MetaMap,
    pub violations: Vec<String>,
    pub warnings: Vec<String>,
    pub evaluations: Vec<PolicyEvaluation>,
}

impl AggregateDecision {
    /// The evaluation that decided
    #[must_use]
    pub fn deciding(&self) -> Option<&PolicyEvaluation> {
        self.deciding_index.and_then(|i| self.evaluations.get(i))
    }
}

/// Combines evaluations under a configured method
#[derive(Debug, Clone, Default)]
pub struct PolicyAggregator {
    method: AggregationMethod,
    rules: HashMap<String, Arc<dyn CustomRule>>,
    active_rule: Option<String>,
}

impl PolicyAggregator {
    #[must_use]
    pub fn new(method: AggregationMethod) -> Self {
        Self {
            method,
            rules: HashMap::new(),
            active_rule: None,
        }
    }

    #[must_use]
    pub fn method(&self) -> AggregationMethod {
        self.method
    }

    /// Register a custom rule
    pub fn register_rule(&mut self, rule: Arc<dyn CustomRule>) {
        self.rules.insert(rule.name().to_string(), rule);
    }

    /// Register `rule` and make it the active `custom` method
    #[must_use]
    pub fn with_custom_rule(mut self, rule: Arc<dyn CustomRule>) -> Self {
        self.active_rule = Some(rule.name().to_string());
        self.method = AggregationMethod::Custom;
        self.register_rule(rule);
        self
    }

    /// Select a registered rule by name
    #[must_use]
    pub fn using_rule(mut self, name: impl Into<String>) -> Self {
        self.active_rule = Some(name.into());
        self.method = AggregationMethod::Custom;
        self
    }

    /// Registered rule names, sorted
    #[must_use]
    pub fn rule_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.rules.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Aggregate under the configured method
    ///
    /// # Errors
    /// - [`PolicyError::NoPoliciesEvaluated`] for an empty list
    /// - [`PolicyError::InconsistentSeverity`] for a malformed evaluation
    /// - [`PolicyError::MissingCustomRule`] if `custom` has no rule
    pub fn aggregate(
        &self,
        evaluations: Vec<PolicyEvaluation>,
    ) -> Result<AggregateDecision, PolicyError> {
        if evaluations.is_empty() {
            return Err(PolicyError::NoPoliciesEvaluated);
        }
        for evaluation in &evaluations {
            evaluation.check_consistent()?;
        }

        let mut evidence = MetaMap::new();
        let (decision, deciding_index) = match self.method {
            AggregationMethod::MostRestrictive => most_restrictive(&evaluations),
            AggregationMethod::AnyDeny => any_deny(&evaluations),
            AggregationMethod::AllAllow => all_allow(&evaluations),
            AggregationMethod::Unanimous => unanimous(&evaluations),
            AggregationMethod::Majority => majority(&evaluations),
            AggregationMethod::Custom => {
                let name = self
                    .active_rule
                    .clone()
                    .unwrap_or_else(|| "<unset>".to_string());
                let rule = self
                    .rules
                    .get(&name)
                    .ok_or_else(|| PolicyError::MissingCustomRule(name.clone()))?;
                let verdict = rule.decide(&evaluations)?;
                if let Some(index) = verdict.deciding_index {
                    if index >= evaluations.len() {
                        return Err(PolicyError::CustomRuleIndex {
                            rule: name,
                            index,
                            len: evaluations.len(),
                        });
                    }
                }
                evidence.insert("custom_rule".into(), MetaValue::String(name));
                (verdict.decision, verdict.deciding_index)
            }
        };

        evidence.insert("method".into(), self.method.as_str().into());
        evidence.insert(
            "evaluations".into(),
            MetaValue::Int(i64::try_from(evaluations.len()).unwrap_or(i64::MAX)),
        );
        if let Some(deciding) = deciding_index.and_then(|i| evaluations.get(i)) {
            evidence.insert(
                "deciding_policy".into(),
                deciding.policy_id.as_str().into(),
            );
        }

        let mut violations = Vec::new();
        let mut warnings = Vec::new();
        for e in &evaluations {
            let note = match &e.reason {
                Some(reason) => format!("{}: {reason}", e.policy_id),
                None => format!("{}: {}", e.policy_id, e.decision),
            };
            match e.decision {
                Decision::Deny => violations.push(note),
                Decision::Warn | Decision::RequireApproval => warnings.push(note),
                Decision::Allow => {}
            }
        }

        tracing::debug!(
            method = %self.method,
            decision = %decision,
            evaluations = evaluations.len(),
            "aggregated policy decision"
        );

        Ok(AggregateDecision {
            decision,
            method: self.method,
            deciding_index,
            evidence,
            violations,
            warnings,
            evaluations,
        })
    }
}

/// Highest severity; first listed wins ties
fn most_restrictive(evaluations: &[PolicyEvaluation]) -> (Decision, Option<usize>) {
    let mut best = 0;
    for (i, e) in evaluations.iter().enumerate().skip(1) {
        if e.severity > evaluations[best].severity {
            best = i;
        }
    }
    (evaluations[best].decision, Some(best))
}

fn any_deny(evaluations: &[PolicyEvaluation]) -> (Decision, Option<usize>) {
    match evaluations
        .iter()
        .position(|e| e.decision == Decision::Deny)
    {
        Some(i) => (Decision::Deny, Some(i)),
        None => most_restrictive(evaluations),
    }
}

fn all_allow(evaluations: &[PolicyEvaluation]) -> (Decision, Option<usize>) {
    if evaluations.iter().all(|e| e.decision == Decision::Allow) {
        (Decision::Allow, None)
    } else {
        most_restrictive(evaluations)
    }
}

fn unanimous(evaluations: &[PolicyEvaluation]) -> (Decision, Option<usize>) {
    let first = evaluations[0].decision;
    if evaluations.iter().all(|e| e.decision == first) {
        (first, None)
    } else {
        most_restrictive(evaluations)
    }
}

fn majority(evaluations: &[PolicyEvaluation]) -> (Decision, Option<usize>) {
    let mut counts = [0usize; 4];
    for e in evaluations {
        counts[usize::from(e.decision.severity())] += 1;
    }
    for decision in Decision::ALL {
        if counts[usize::from(decision.severity())] * 2 > evaluations.len() {
            let index = evaluations.iter().position(|e| e.decision == decision);
            return (decision, index);
        }
    }
    most_restrictive(evaluations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::PolicySource;
    use chrono::{DateTime, Utc};

    fn at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn eval(id: &str, decision: Decision) -> PolicyEvaluation {
        PolicyEvaluation::new(PolicySource::Opa, id, decision, at())
    }

    fn decide(method: AggregationMethod, evals: Vec<PolicyEvaluation>) -> AggregateDecision {
        PolicyAggregator::new(method).aggregate(evals).unwrap()
    }

    #[test]
    fn empty_list_fails_closed() {
        for method in [
            AggregationMethod::MostRestrictive,
            AggregationMethod::AnyDeny,
            AggregationMethod::AllAllow,
            AggregationMethod::Unanimous,
            AggregationMethod::Majority,
        ] {
            assert_eq!(
                PolicyAggregator::new(method).aggregate(Vec::new()),
                Err(PolicyError::NoPoliciesEvaluated)
            );
        }
    }

    #[test]
    fn most_restrictive_is_order_independent() {
        let a = decide(
            AggregationMethod::MostRestrictive,
            vec![eval("p1", Decision::Deny), eval("p2", Decision::Warn)],
        );
        let b = decide(
            AggregationMethod::MostRestrictive,
            vec![eval("p2", Decision::Warn), eval("p1", Decision::Deny)],
        );
        assert_eq!(a.decision, Decision::Deny);
        assert_eq!(b.decision, Decision::Deny);
        assert_eq!(a.deciding().unwrap().policy_id, "p1");
        assert_eq!(b.deciding().unwrap().policy_id, "p1");
    }

    #[test]
    fn most_restrictive_tie_goes_to_first_listed() {
        let agg = decide(
            AggregationMethod::MostRestrictive,
            vec![
                eval("a", Decision::Allow),
                eval("first", Decision::RequireApproval),
                eval("second", Decision::RequireApproval),
            ],
        );
        assert_eq!(agg.deciding_index, Some(1));
        assert_eq!(agg.evidence["deciding_policy"], MetaValue::from("first"));
    }

    #[test]
    fn any_deny_picks_first_deny() {
        let agg = decide(
            AggregationMethod::AnyDeny,
            vec![
                eval("w", Decision::Warn),
                eval("d1", Decision::Deny),
                eval("d2", Decision::Deny),
            ],
        );
        assert_eq!(agg.decision, Decision::Deny);
        assert_eq!(agg.deciding_index, Some(1));
    }

    #[test]
    fn all_allow_requires_every_allow() {
        let all = decide(
            AggregationMethod::AllAllow,
            vec![eval("a", Decision::Allow), eval("b", Decision::Allow)],
        );
        assert_eq!(all.decision, Decision::Allow);

        let mixed = decide(
            AggregationMethod::AllAllow,
            vec![eval("a", Decision::Allow), eval("b", Decision::Warn)],
        );
        assert_eq!(mixed.decision, Decision::Warn);
        assert_eq!(mixed.warnings, vec!["b: warn".to_string()]);
    }

    #[test]
    fn unanimous_falls_back_on_disagreement() {
        let agree = decide(
            AggregationMethod::Unanimous,
            vec![eval("a", Decision::Warn), eval("b", Decision::Warn)],
        );
        assert_eq!(agree.decision, Decision::Warn);

        let split = decide(
            AggregationMethod::Unanimous,
            vec![eval("a", Decision::Allow), eval("b", Decision::RequireApproval)],
        );
        assert_eq!(split.decision, Decision::RequireApproval);
    }

    #[test]
    fn majority_needs_strict_majority() {
        let clear = decide(
            AggregationMethod::Majority,
            vec![
                eval("a", Decision::Allow),
                eval("b", Decision::Allow),
                eval("c", Decision::Deny),
            ],
        );
        assert_eq!(clear.decision, Decision::Allow);
        assert_eq!(clear.violations, vec!["c: deny".to_string()]);

        let tie = decide(
            AggregationMethod::Majority,
            vec![eval("a", Decision::Allow), eval("b", Decision::Deny)],
        );
        assert_eq!(tie.decision, Decision::Deny);
    }

    #[test]
    fn inconsistent_severity_rejected() {
        let mut bad = eval("p", Decision::Allow);
        bad.severity = 3;
        assert!(matches!(
            PolicyAggregator::default().aggregate(vec![bad]),
            Err(PolicyError::InconsistentSeverity { .. })
        ));
    }

    #[derive(Debug)]
    struct LastWins;

    impl CustomRule for LastWins {
        fn name(&self) -> &str {
            "last_wins"
        }

        fn decide(&self, evaluations: &[PolicyEvaluation]) -> Result<CustomVerdict, PolicyError> {
            let last = evaluations.len() - 1;
            Ok(CustomVerdict {
                decision: evaluations[last].decision,
                deciding_index: Some(last),
            })
        }
    }

    #[test]
    fn custom_rule_decides_and_is_recorded() {
        let aggregator = PolicyAggregator::default().with_custom_rule(Arc::new(LastWins));
        let agg = aggregator
            .aggregate(vec![eval("a", Decision::Deny), eval("b", Decision::Allow)])
            .unwrap();
        assert_eq!(agg.decision, Decision::Allow);
        assert_eq!(agg.method, AggregationMethod::Custom);
        assert_eq!(agg.evidence["custom_rule"], MetaValue::from("last_wins"));
    }

    #[test]
    fn custom_without_rule_is_configuration_error() {
        let aggregator = PolicyAggregator::new(AggregationMethod::Custom);
        assert!(matches!(
            aggregator.aggregate(vec![eval("a", Decision::Allow)]),
            Err(PolicyError::MissingCustomRule(_))
        ));
        let aggregator = PolicyAggregator::default().using_rule("nope");
        assert_eq!(
            aggregator.aggregate(vec![eval("a", Decision::Allow)]),
            Err(PolicyError::MissingCustomRule("nope".into()))
        );
    }

    #[test]
    fn method_wire_names() {
        let m: AggregationMethod = serde_json::from_str("\"any_deny\"").unwrap();
        assert_eq!(m, AggregationMethod::AnyDeny);
        assert_eq!(AggregationMethod::default(), AggregationMethod::MostRestrictive);
    }
}
