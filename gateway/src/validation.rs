use common_http_errors::ApiError;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::rules::validate_intensity;
use crate::worker::{TransformationKind, ANALYSIS_TYPES};

pub const TARGET_TONES: &[&str] = &["formal", "casual", "friendly", "neutral", "assertive", "empathetic"];

#[derive(Debug, Clone, Deserialize)]
pub struct TransformPayload {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub transformation_type: String,
    #[serde(default = "default_intensity")]
    pub intensity_level: i64,
    #[serde(default)]
    pub target_tone: Option<String>,
    #[serde(default)]
    pub options: Option<Value>,
}

fn default_intensity() -> i64 {
    1
}

#[derive(Debug, Clone)]
pub struct ValidTransform {
    pub text: String,
    pub kind: TransformationKind,
    pub intensity: u8,
    pub target_tone: Option<String>,
    pub options: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzePayload {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub analysis_types: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ValidAnalyze {
    pub text: String,
    pub analysis_types: Vec<String>,
}

struct FieldErrors(Vec<Value>);

impl FieldErrors {
    fn new() -> Self {
        Self(Vec::new())
    }

    fn push(&mut self, field: &str, reason: impl Into<String>) {
        self.0.push(json!({ "field": field, "reason": reason.into() }));
    }

    fn finish(self) -> Result<(), ApiError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(ApiError::validation(json!({ "fields": self.0 })))
        }
    }
}

fn check_text(errors: &mut FieldErrors, text: &str, max_len: usize) {
    if text.is_empty() {
        errors.push("text", "must not be empty");
    } else if text.chars().count() > max_len {
        errors.push("text", format!("must be at most {max_len} characters"));
    }
}

/// Field-level validation; everything wrong with the payload is reported in
/// one `validation_failed` response.
pub fn validate_transform(
    payload: TransformPayload,
    max_len: usize,
    preview: bool,
) -> Result<ValidTransform, ApiError> {
    let mut errors = FieldErrors::new();

    check_text(&mut errors, &payload.text, max_len);

    let kind = match payload.transformation_type.parse::<TransformationKind>() {
        Ok(kind) if preview && !kind.preview_allowed() => {
            errors.push("transformation_type", "not available in preview mode");
            None
        }
        Ok(kind) => Some(kind),
        Err(_) => {
            errors.push("transformation_type", "unrecognized transformation");
            None
        }
    };

    let intensity = match validate_intensity(payload.intensity_level) {
        Ok(value) => Some(value),
        Err(_) => {
            errors.push("intensity_level", "must be between 0 and 3");
            None
        }
    };

    if let Some(tone) = payload.target_tone.as_deref() {
        if !TARGET_TONES.contains(&tone) {
            errors.push("target_tone", "unrecognized tone");
        }
    }

    if let Some(options) = &payload.options {
        if !options.is_object() {
            errors.push("options", "must be an object");
        }
    }

    errors.finish()?;
    Ok(ValidTransform {
        text: payload.text,
        kind: kind.expect("validated"),
        intensity: intensity.expect("validated"),
        target_tone: payload.target_tone,
        options: payload.options,
    })
}

pub fn validate_analyze(payload: AnalyzePayload, max_len: usize) -> Result<ValidAnalyze, ApiError> {
    let mut errors = FieldErrors::new();
    check_text(&mut errors, &payload.text, max_len);

    let mut analysis_types = payload.analysis_types;
    if analysis_types.is_empty() {
        analysis_types = ANALYSIS_TYPES.iter().map(|s| s.to_string()).collect();
    } else {
        analysis_types.sort();
        analysis_types.dedup();
        for kind in &analysis_types {
            if !ANALYSIS_TYPES.contains(&kind.as_str()) {
                errors.push("analysis_types", format!("unrecognized analysis '{kind}'"));
            }
        }
    }

    errors.finish()?;
    Ok(ValidAnalyze { text: payload.text, analysis_types })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(text: &str, kind: &str, intensity: i64) -> TransformPayload {
        TransformPayload {
            text: text.into(),
            transformation_type: kind.into(),
            intensity_level: intensity,
            target_tone: None,
            options: None,
        }
    }

    #[test]
    fn text_at_max_is_accepted_and_max_plus_one_rejected() {
        let max = 100;
        let at_max = "a".repeat(max);
        assert!(validate_transform(payload(&at_max, "soften", 1), max, false).is_ok());
        let over = "a".repeat(max + 1);
        assert!(validate_transform(payload(&over, "soften", 1), max, false).is_err());
    }

    #[test]
    fn intensity_bounds_are_inclusive() {
        assert!(validate_transform(payload("hello", "soften", 0), 100, false).is_ok());
        assert!(validate_transform(payload("hello", "soften", 3), 100, false).is_ok());
        assert!(validate_transform(payload("hello", "soften", -1), 100, false).is_err());
        assert!(validate_transform(payload("hello", "soften", 4), 100, false).is_err());
    }

    #[test]
    fn preview_restricts_operations() {
        assert!(validate_transform(payload("hello", "terminology", 1), 100, true).is_err());
        assert!(validate_transform(payload("hello", "soften", 1), 100, true).is_ok());
    }

    #[test]
    fn unknown_tone_is_a_field_error() {
        let mut p = payload("hello", "soften", 1);
        p.target_tone = Some("sarcastic".into());
        let err = validate_transform(p, 100, false).unwrap_err();
        assert_eq!(err.code(), "validation_failed");
    }

    #[test]
    fn analyze_defaults_to_all_types() {
        let valid = validate_analyze(
            AnalyzePayload { text: "hello".into(), analysis_types: Vec::new() },
            100,
        )
        .unwrap();
        assert_eq!(valid.analysis_types.len(), ANALYSIS_TYPES.len());
    }

    #[test]
    fn analyze_rejects_unknown_types() {
        let err = validate_analyze(
            AnalyzePayload { text: "hello".into(), analysis_types: vec!["mood".into()] },
            100,
        )
        .unwrap_err();
        assert_eq!(err.code(), "validation_failed");
    }
}
