use async_trait::async_trait;
use chrono::{FixedOffset, NaiveTime, Utc};
use common_http_errors::ApiError;
use regex::Regex;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::rules::{
    AutoTransformConfig, AutoTransformRule, CompareOp, EngineOutcome, MessageContext,
    RuleError, TransformationIntent, Trigger,
};

/// Sentiment is the one trigger that needs the analyze backend; the engine
/// reaches it through this seam so evaluation stays deterministic (and
/// testable) for a fixed set of scores.
#[async_trait]
pub trait SentimentSource: Send + Sync {
    async fn polarity(&self, tenant_id: Uuid, text: &str) -> Result<f64, ApiError>;
}

enum CompiledTrigger {
    Keyword { terms: Vec<String> },
    Pattern { regex: Regex },
    Sentiment { threshold: f64, op: CompareOp },
    Recipient { roles: Vec<String> },
    Channel { ids: Vec<String>, kinds: Vec<String> },
    Time { offset: FixedOffset, start: NaiveTime, end: NaiveTime },
}

/// A rule with its trigger lowered into matchable form; regexes compile once
/// at load, not per message.
pub struct CompiledRule {
    pub rule: AutoTransformRule,
    trigger: CompiledTrigger,
}

impl CompiledRule {
    pub fn compile(rule: AutoTransformRule) -> Result<Self, RuleError> {
        let trigger = match &rule.trigger {
            Trigger::Keyword { terms } => CompiledTrigger::Keyword {
                terms: terms.iter().map(|t| t.to_lowercase()).collect(),
            },
            Trigger::Pattern { pattern } => CompiledTrigger::Pattern {
                regex: Regex::new(pattern).map_err(|err| RuleError::InvalidRegex(err.to_string()))?,
            },
            Trigger::Sentiment { threshold, op } => {
                CompiledTrigger::Sentiment { threshold: *threshold, op: *op }
            }
            Trigger::Recipient { roles } => CompiledTrigger::Recipient { roles: roles.clone() },
            Trigger::Channel { ids, kinds } => {
                CompiledTrigger::Channel { ids: ids.clone(), kinds: kinds.clone() }
            }
            Trigger::Time { tz, start, end } => CompiledTrigger::Time {
                offset: tz.parse().map_err(|_| RuleError::InvalidTimezone(tz.clone()))?,
                start: *start,
                end: *end,
            },
        };
        Ok(Self { rule, trigger })
    }

    fn scope_matches(&self, ctx: &MessageContext) -> bool {
        let rule = &self.rule;
        if !rule.scope_platforms.is_empty() && !rule.scope_platforms.contains(&ctx.platform) {
            return false;
        }
        if !rule.scope_channels.is_empty() && !rule.scope_channels.contains(&ctx.channel) {
            return false;
        }
        if !rule.scope_roles.is_empty() {
            let any_recipient = ctx.recipients.iter().any(|r| {
                r.role.as_ref().is_some_and(|role| rule.scope_roles.contains(role))
            });
            if !any_recipient {
                return false;
            }
        }
        true
    }

    /// Confidence when the trigger fires, `None` otherwise. Formulas are
    /// fixed per kind so identical inputs always score identically.
    async fn trigger_confidence(
        &self,
        ctx: &MessageContext,
        sentiment: &dyn SentimentSource,
    ) -> Result<Option<f64>, ApiError> {
        let matched = match &self.trigger {
            CompiledTrigger::Keyword { terms } => {
                let lowered = ctx.text.to_lowercase();
                terms.iter().any(|term| lowered.contains(term)).then_some(1.0)
            }
            CompiledTrigger::Pattern { regex } => regex.is_match(&ctx.text).then_some(0.9),
            CompiledTrigger::Sentiment { threshold, op } => {
                let score = sentiment.polarity(ctx.tenant_id, &ctx.text).await?;
                op.matches(score, *threshold)
                    .then(|| 0.5 + (score - threshold).abs().min(0.5))
            }
            CompiledTrigger::Recipient { roles } => ctx
                .recipients
                .iter()
                .any(|r| r.role.as_ref().is_some_and(|role| roles.contains(role)))
                .then_some(0.95),
            CompiledTrigger::Channel { ids, kinds } => {
                let id_match = ids.contains(&ctx.channel);
                let kind_match = ctx
                    .metadata
                    .get("channel_kind")
                    .and_then(|v| v.as_str())
                    .map(|kind| kinds.iter().any(|k| k == kind))
                    .unwrap_or(false);
                (id_match || kind_match).then_some(0.9)
            }
            CompiledTrigger::Time { offset, start, end } => {
                let local = Utc::now().with_timezone(offset).time();
                in_window(local, *start, *end).then_some(0.8)
            }
        };
        Ok(matched)
    }
}

fn in_window(now: NaiveTime, start: NaiveTime, end: NaiveTime) -> bool {
    if start <= end {
        now >= start && now < end
    } else {
        // Window wraps midnight, e.g. 22:00-06:30.
        now >= start || now < end
    }
}

/// Walks the tenant's rules in `(priority desc, id asc)` order; the first
/// rule whose scope and trigger both match wins.
pub async fn evaluate(
    ctx: &MessageContext,
    config: &AutoTransformConfig,
    rules: &[CompiledRule],
    sentiment: &dyn SentimentSource,
) -> Result<EngineOutcome, ApiError> {
    if !config.enabled {
        return Ok(EngineOutcome::NoAction { reason: "disabled" });
    }
    if ctx.text.chars().count() < config.min_message_length {
        return Ok(EngineOutcome::NoAction { reason: "below_min_length" });
    }

    for compiled in rules {
        if !compiled.rule.enabled || !compiled.scope_matches(ctx) {
            continue;
        }
        if let Some(confidence) = compiled.trigger_confidence(ctx, sentiment).await? {
            debug!(rule_id = %compiled.rule.id, confidence, "auto-transform rule matched");
            return Ok(EngineOutcome::Transform {
                intent: TransformationIntent {
                    rule_id: compiled.rule.id,
                    transformation_kind: compiled.rule.transformation_kind,
                    intensity: compiled.rule.intensity,
                    options: compiled.rule.options.clone(),
                    confidence,
                },
            });
        }
    }
    Ok(EngineOutcome::NoAction { reason: "no_rule_matched" })
}

#[derive(Debug, Serialize)]
pub struct RuleTestResult {
    pub would_trigger: bool,
    pub confidence: f64,
    pub reason: String,
}

/// Side-effect-free dry run of a single rule against sample text. Scope
/// filters are skipped; context-dependent triggers evaluate against an empty
/// context and report that in `reason`.
pub async fn test_rule(
    rule: AutoTransformRule,
    sample_text: &str,
    sentiment: &dyn SentimentSource,
) -> Result<RuleTestResult, ApiError> {
    let tenant_id = rule.tenant_id;
    let compiled = CompiledRule::compile(rule)
        .map_err(|err| ApiError::invalid(err.to_string()))?;
    let ctx = MessageContext {
        text: sample_text.to_string(),
        user_id: None,
        tenant_id,
        platform: String::new(),
        channel: String::new(),
        recipients: Vec::new(),
        metadata: serde_json::Value::Null,
    };
    let kind = compiled.rule.trigger.kind();
    match compiled.trigger_confidence(&ctx, sentiment).await? {
        Some(confidence) => Ok(RuleTestResult {
            would_trigger: true,
            confidence,
            reason: format!("{kind} trigger matched sample text"),
        }),
        None => Ok(RuleTestResult {
            would_trigger: false,
            confidence: 0.0,
            reason: match kind {
                "recipient" | "channel" => format!("{kind} trigger needs message context"),
                _ => format!("{kind} trigger did not match sample text"),
            },
        }),
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// Fixed-score source for deterministic engine tests.
    pub struct FixedSentiment(pub f64);

    #[async_trait]
    impl SentimentSource for FixedSentiment {
        async fn polarity(&self, _tenant_id: Uuid, _text: &str) -> Result<f64, ApiError> {
            Ok(self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FixedSentiment;
    use super::*;
    use crate::worker::TransformationKind;
    use serde_json::json;

    fn rule(priority: i32, trigger: Trigger, kind: TransformationKind) -> AutoTransformRule {
        AutoTransformRule {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            name: format!("rule-{priority}"),
            enabled: true,
            priority,
            trigger,
            transformation_kind: kind,
            intensity: 2,
            options: json!({}),
            scope_platforms: Vec::new(),
            scope_channels: Vec::new(),
            scope_roles: Vec::new(),
        }
    }

    fn compile_sorted(mut rules: Vec<AutoTransformRule>) -> Vec<CompiledRule> {
        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        rules.into_iter().map(|r| CompiledRule::compile(r).unwrap()).collect()
    }

    fn ctx(text: &str) -> MessageContext {
        MessageContext {
            text: text.to_string(),
            user_id: None,
            tenant_id: Uuid::new_v4(),
            platform: "slack".into(),
            channel: "general".into(),
            recipients: Vec::new(),
            metadata: json!({}),
        }
    }

    fn config() -> AutoTransformConfig {
        AutoTransformConfig { enabled: true, min_message_length: 5, ..Default::default() }
    }

    #[tokio::test]
    async fn higher_priority_rule_wins_when_both_match() {
        let keyword = rule(
            10,
            Trigger::Keyword { terms: vec!["urgent".into()] },
            TransformationKind::Structure,
        );
        let keyword_id = keyword.id;
        let catch_all = rule(
            5,
            Trigger::Pattern { pattern: ".*".into() },
            TransformationKind::Soften,
        );
        let rules = compile_sorted(vec![catch_all, keyword]);

        let outcome = evaluate(&ctx("This is urgent"), &config(), &rules, &FixedSentiment(0.0))
            .await
            .unwrap();
        match outcome {
            EngineOutcome::Transform { intent } => {
                assert_eq!(intent.rule_id, keyword_id);
                assert_eq!(intent.transformation_kind, TransformationKind::Structure);
                assert_eq!(intent.confidence, 1.0);
            }
            other => panic!("expected transform intent, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn disabled_config_short_circuits() {
        let rules = compile_sorted(vec![rule(
            1,
            Trigger::Pattern { pattern: ".*".into() },
            TransformationKind::Soften,
        )]);
        let mut cfg = config();
        cfg.enabled = false;
        let outcome = evaluate(&ctx("long enough text"), &cfg, &rules, &FixedSentiment(0.0))
            .await
            .unwrap();
        assert!(matches!(outcome, EngineOutcome::NoAction { reason: "disabled" }));
    }

    #[tokio::test]
    async fn short_messages_are_skipped() {
        let rules = compile_sorted(vec![rule(
            1,
            Trigger::Pattern { pattern: ".*".into() },
            TransformationKind::Soften,
        )]);
        let outcome = evaluate(&ctx("hey"), &config(), &rules, &FixedSentiment(0.0))
            .await
            .unwrap();
        assert!(matches!(outcome, EngineOutcome::NoAction { reason: "below_min_length" }));
    }

    #[tokio::test]
    async fn sentiment_trigger_compares_against_threshold() {
        let negative = rule(
            1,
            Trigger::Sentiment { threshold: -0.3, op: CompareOp::Lte },
            TransformationKind::Soften,
        );
        let rules = compile_sorted(vec![negative]);

        let fired = evaluate(&ctx("quite an angry message"), &config(), &rules, &FixedSentiment(-0.8))
            .await
            .unwrap();
        assert!(matches!(fired, EngineOutcome::Transform { .. }));

        let skipped = evaluate(&ctx("quite a cheery message"), &config(), &rules, &FixedSentiment(0.6))
            .await
            .unwrap();
        assert!(matches!(skipped, EngineOutcome::NoAction { reason: "no_rule_matched" }));
    }

    #[tokio::test]
    async fn sentiment_confidence_grows_with_distance_from_threshold() {
        let rule = rule(
            1,
            Trigger::Sentiment { threshold: -0.2, op: CompareOp::Lte },
            TransformationKind::Soften,
        );
        let rules = compile_sorted(vec![rule]);
        let near = evaluate(&ctx("borderline message"), &config(), &rules, &FixedSentiment(-0.21))
            .await
            .unwrap();
        let far = evaluate(&ctx("borderline message"), &config(), &rules, &FixedSentiment(-0.9))
            .await
            .unwrap();
        let (EngineOutcome::Transform { intent: near }, EngineOutcome::Transform { intent: far }) =
            (near, far)
        else {
            panic!("both should fire");
        };
        assert!(far.confidence > near.confidence);
    }

    #[tokio::test]
    async fn scope_platform_filters_rules() {
        let mut scoped = rule(
            9,
            Trigger::Keyword { terms: vec!["urgent".into()] },
            TransformationKind::Structure,
        );
        scoped.scope_platforms = vec!["teams".into()];
        let rules = compile_sorted(vec![scoped]);
        let outcome = evaluate(&ctx("urgent thing"), &config(), &rules, &FixedSentiment(0.0))
            .await
            .unwrap();
        assert!(matches!(outcome, EngineOutcome::NoAction { reason: "no_rule_matched" }));
    }

    #[tokio::test]
    async fn evaluation_is_deterministic_for_fixed_sentiment() {
        let rules = compile_sorted(vec![
            rule(3, Trigger::Keyword { terms: vec!["deadline".into()] }, TransformationKind::Structure),
            rule(2, Trigger::Sentiment { threshold: 0.0, op: CompareOp::Lt }, TransformationKind::Soften),
        ]);
        let context = ctx("the deadline slipped again");
        let first = evaluate(&context, &config(), &rules, &FixedSentiment(-0.4)).await.unwrap();
        let second = evaluate(&context, &config(), &rules, &FixedSentiment(-0.4)).await.unwrap();
        let (EngineOutcome::Transform { intent: a }, EngineOutcome::Transform { intent: b }) = (first, second)
        else {
            panic!("both evaluations should produce an intent");
        };
        assert_eq!(a.rule_id, b.rule_id);
        assert_eq!(a.confidence, b.confidence);
    }

    #[tokio::test]
    async fn wrapping_time_window() {
        assert!(in_window(
            NaiveTime::from_hms_opt(23, 30, 0).unwrap(),
            NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(6, 30, 0).unwrap()
        ));
        assert!(in_window(
            NaiveTime::from_hms_opt(3, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(6, 30, 0).unwrap()
        ));
        assert!(!in_window(
            NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(6, 30, 0).unwrap()
        ));
    }

    #[tokio::test]
    async fn test_rule_reports_reason_without_side_effects() {
        let keyword = rule(
            1,
            Trigger::Keyword { terms: vec!["invoice".into()] },
            TransformationKind::Clarify,
        );
        let hit = test_rule(keyword.clone(), "please check the invoice", &FixedSentiment(0.0))
            .await
            .unwrap();
        assert!(hit.would_trigger);
        assert_eq!(hit.confidence, 1.0);

        let miss = test_rule(keyword, "nothing relevant", &FixedSentiment(0.0)).await.unwrap();
        assert!(!miss.would_trigger);
        assert!(miss.reason.contains("did not match"));
    }
}
