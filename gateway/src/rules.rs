use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::worker::TransformationKind;

pub const MAX_INTENSITY: u8 = 3;

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("unknown trigger kind '{0}'")]
    UnknownTriggerKind(String),
    #[error("invalid trigger payload: {0}")]
    InvalidPayload(String),
    #[error("invalid regex: {0}")]
    InvalidRegex(String),
    #[error("intensity {0} out of range 0..=3")]
    InvalidIntensity(i64),
    #[error("invalid timezone offset '{0}'")]
    InvalidTimezone(String),
    #[error("invalid time '{0}', expected HH:MM")]
    InvalidTime(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    Lt,
    Lte,
    Gt,
    Gte,
}

impl CompareOp {
    pub fn matches(&self, value: f64, threshold: f64) -> bool {
        match self {
            CompareOp::Lt => value < threshold,
            CompareOp::Lte => value <= threshold,
            CompareOp::Gt => value > threshold,
            CompareOp::Gte => value >= threshold,
        }
    }
}

/// Trigger payloads arrive as open JSON; they are validated into this tagged
/// variant on ingest and unknown shapes are rejected there.
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    Keyword { terms: Vec<String> },
    Pattern { pattern: String },
    Sentiment { threshold: f64, op: CompareOp },
    Recipient { roles: Vec<String> },
    Channel { ids: Vec<String>, kinds: Vec<String> },
    Time { tz: String, start: NaiveTime, end: NaiveTime },
}

fn string_list(payload: &Value, field: &str) -> Result<Vec<String>, RuleError> {
    match payload.get(field) {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(|s| s.to_string())
                    .ok_or_else(|| RuleError::InvalidPayload(format!("'{field}' must contain strings")))
            })
            .collect(),
        Some(_) => Err(RuleError::InvalidPayload(format!("'{field}' must be an array"))),
        None => Ok(Vec::new()),
    }
}

fn parse_hhmm(payload: &Value, field: &str) -> Result<NaiveTime, RuleError> {
    let raw = payload
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| RuleError::InvalidPayload(format!("'{field}' is required")))?;
    NaiveTime::parse_from_str(raw, "%H:%M").map_err(|_| RuleError::InvalidTime(raw.to_string()))
}

impl Trigger {
    pub fn kind(&self) -> &'static str {
        match self {
            Trigger::Keyword { .. } => "keyword",
            Trigger::Pattern { .. } => "pattern",
            Trigger::Sentiment { .. } => "sentiment",
            Trigger::Recipient { .. } => "recipient",
            Trigger::Channel { .. } => "channel",
            Trigger::Time { .. } => "time",
        }
    }

    pub fn from_parts(kind: &str, payload: &Value) -> Result<Self, RuleError> {
        match kind {
            "keyword" => {
                let terms = string_list(payload, "terms")?;
                if terms.is_empty() {
                    return Err(RuleError::InvalidPayload("'terms' must be non-empty".into()));
                }
                Ok(Trigger::Keyword { terms })
            }
            "pattern" => {
                let pattern = payload
                    .get("pattern")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| RuleError::InvalidPayload("'pattern' is required".into()))?;
                regex::Regex::new(pattern).map_err(|err| RuleError::InvalidRegex(err.to_string()))?;
                Ok(Trigger::Pattern { pattern: pattern.to_string() })
            }
            "sentiment" => {
                let threshold = payload
                    .get("threshold")
                    .and_then(|v| v.as_f64())
                    .ok_or_else(|| RuleError::InvalidPayload("'threshold' is required".into()))?;
                if !(-1.0..=1.0).contains(&threshold) {
                    return Err(RuleError::InvalidPayload("'threshold' must be in -1.0..=1.0".into()));
                }
                let op: CompareOp = payload
                    .get("op")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|_| RuleError::InvalidPayload("'op' must be one of lt/lte/gt/gte".into()))?
                    .ok_or_else(|| RuleError::InvalidPayload("'op' is required".into()))?;
                Ok(Trigger::Sentiment { threshold, op })
            }
            "recipient" => {
                let roles = string_list(payload, "roles")?;
                if roles.is_empty() {
                    return Err(RuleError::InvalidPayload("'roles' must be non-empty".into()));
                }
                Ok(Trigger::Recipient { roles })
            }
            "channel" => {
                let ids = string_list(payload, "ids")?;
                let kinds = string_list(payload, "kinds")?;
                if ids.is_empty() && kinds.is_empty() {
                    return Err(RuleError::InvalidPayload("one of 'ids' or 'kinds' is required".into()));
                }
                Ok(Trigger::Channel { ids, kinds })
            }
            "time" => {
                let tz = payload
                    .get("tz")
                    .and_then(|v| v.as_str())
                    .unwrap_or("+00:00")
                    .to_string();
                tz.parse::<chrono::FixedOffset>()
                    .map_err(|_| RuleError::InvalidTimezone(tz.clone()))?;
                let start = parse_hhmm(payload, "start")?;
                let end = parse_hhmm(payload, "end")?;
                Ok(Trigger::Time { tz, start, end })
            }
            other => Err(RuleError::UnknownTriggerKind(other.to_string())),
        }
    }

    /// Storage/export representation, the inverse of `from_parts`.
    pub fn payload(&self) -> Value {
        match self {
            Trigger::Keyword { terms } => json!({ "terms": terms }),
            Trigger::Pattern { pattern } => json!({ "pattern": pattern }),
            Trigger::Sentiment { threshold, op } => json!({ "threshold": threshold, "op": op }),
            Trigger::Recipient { roles } => json!({ "roles": roles }),
            Trigger::Channel { ids, kinds } => json!({ "ids": ids, "kinds": kinds }),
            Trigger::Time { tz, start, end } => json!({
                "tz": tz,
                "start": start.format("%H:%M").to_string(),
                "end": end.format("%H:%M").to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AutoTransformRule {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub enabled: bool,
    pub priority: i32,
    pub trigger: Trigger,
    pub transformation_kind: TransformationKind,
    pub intensity: u8,
    pub options: Value,
    pub scope_platforms: Vec<String>,
    pub scope_channels: Vec<String>,
    pub scope_roles: Vec<String>,
}

pub fn validate_intensity(raw: i64) -> Result<u8, RuleError> {
    if (0..=MAX_INTENSITY as i64).contains(&raw) {
        Ok(raw as u8)
    } else {
        Err(RuleError::InvalidIntensity(raw))
    }
}

/// Per-tenant switches for the auto-transform subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoTransformConfig {
    pub enabled: bool,
    pub default_transformation: TransformationKind,
    pub default_intensity: u8,
    pub min_message_length: usize,
    pub max_processing_delay_ms: u64,
    pub require_confirmation: bool,
    pub show_preview: bool,
    pub preserve_original: bool,
}

impl Default for AutoTransformConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_transformation: TransformationKind::Soften,
            default_intensity: 1,
            min_message_length: 10,
            max_processing_delay_ms: 3000,
            require_confirmation: true,
            show_preview: true,
            preserve_original: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Recipient {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

/// Everything the rule engine may consult about an incoming message.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageContext {
    pub text: String,
    #[serde(default)]
    pub user_id: Option<Uuid>,
    #[serde(skip)]
    pub tenant_id: Uuid,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub recipients: Vec<Recipient>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransformationIntent {
    pub rule_id: Uuid,
    pub transformation_kind: TransformationKind,
    pub intensity: u8,
    pub options: Value,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum EngineOutcome {
    NoAction { reason: &'static str },
    Transform { intent: TransformationIntent },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_payload_round_trips() {
        let trigger = Trigger::from_parts("keyword", &json!({ "terms": ["urgent", "asap"] })).unwrap();
        let back = Trigger::from_parts(trigger.kind(), &trigger.payload()).unwrap();
        assert_eq!(trigger, back);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = Trigger::from_parts("emoji", &json!({})).unwrap_err();
        assert!(matches!(err, RuleError::UnknownTriggerKind(_)));
    }

    #[test]
    fn bad_regex_is_rejected_on_ingest() {
        let err = Trigger::from_parts("pattern", &json!({ "pattern": "([" })).unwrap_err();
        assert!(matches!(err, RuleError::InvalidRegex(_)));
    }

    #[test]
    fn sentiment_payload_validates_threshold_and_op() {
        assert!(Trigger::from_parts("sentiment", &json!({ "threshold": -0.5, "op": "lt" })).is_ok());
        assert!(Trigger::from_parts("sentiment", &json!({ "threshold": -3.0, "op": "lt" })).is_err());
        assert!(Trigger::from_parts("sentiment", &json!({ "threshold": 0.1, "op": "near" })).is_err());
    }

    #[test]
    fn time_payload_validates_offset_and_clock() {
        let ok = json!({ "tz": "+09:00", "start": "22:00", "end": "06:30" });
        assert!(Trigger::from_parts("time", &ok).is_ok());
        let bad_tz = json!({ "tz": "Asia/Tokyo", "start": "22:00", "end": "06:30" });
        assert!(matches!(Trigger::from_parts("time", &bad_tz), Err(RuleError::InvalidTimezone(_))));
        let bad_time = json!({ "tz": "+09:00", "start": "25:00", "end": "06:30" });
        assert!(matches!(Trigger::from_parts("time", &bad_time), Err(RuleError::InvalidTime(_))));
    }

    #[test]
    fn intensity_bounds() {
        assert_eq!(validate_intensity(0).unwrap(), 0);
        assert_eq!(validate_intensity(3).unwrap(), 3);
        assert!(validate_intensity(-1).is_err());
        assert!(validate_intensity(4).is_err());
    }
}
