//! Preference profiles and their content fingerprint.
//!
//! A profile is an arbitrary JSON object owned by the quiz flow. The
//! orchestrator never looks inside it except to render it into the prompt
//! and to compute its [`ProfileVersion`], which partitions the analysis cache.

use crate::error::AnalysisError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;

/// Number of hex characters kept from the SHA-256 digest (64 bits).
pub const VERSION_HEX_LEN: usize = 16;

/// Keys rendered first, in this order, with fixed labels.
const KNOWN_KEYS: [(&str, &str); 6] = [
    ("fit_preferences", "Preferred Fits"),
    ("color_palette", "Color Preferences"),
    ("style_goals", "Style Goals"),
    ("body_type", "Body Type"),
    ("priorities", "Priorities"),
    ("avoidances", "Avoid"),
];

/// A user's preference document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Profile(Map<String, Value>);

impl Profile {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Accepts only JSON objects.
    pub fn from_value(value: Value) -> Result<Self, AnalysisError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(AnalysisError::Validation(format!(
                "profile must be a JSON object, got {}",
                json_type_name(&other)
            ))),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Content fingerprint; see [`version`].
    pub fn version(&self) -> ProfileVersion {
        version(self)
    }

    /// Render the profile as the personalization prompt segment.
    pub fn prompt_text(&self) -> String {
        let mut lines = Vec::new();
        for (key, label) in KNOWN_KEYS {
            if let Some(value) = self.0.get(key) {
                lines.push(format!("{}: {}", label, render_value(value)));
            }
        }

        let mut extra: Vec<(&String, &Value)> = self
            .0
            .iter()
            .filter(|(k, _)| !KNOWN_KEYS.iter().any(|(known, _)| known == k))
            .collect();
        extra.sort_by(|a, b| a.0.cmp(b.0));
        for (key, value) in extra {
            lines.push(format!("{}: {}", title_case(key), render_value(value)));
        }

        format!(
            "USER STYLE PROFILE:\n\n{}\n\nUse this profile to personalize your analysis and \
             recommendations. Focus on how well the product aligns with these preferences.",
            lines.join("\n")
        )
    }
}

/// 16 lowercase hex characters identifying a profile's normalized content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileVersion(String);

impl ProfileVersion {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse a previously issued version string.
    pub fn parse(raw: &str) -> Result<Self, AnalysisError> {
        let valid = raw.len() == VERSION_HEX_LEN
            && raw.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(AnalysisError::Validation(format!(
                "profile version must be {} lowercase hex characters",
                VERSION_HEX_LEN
            )))
        }
    }
}

impl fmt::Display for ProfileVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deterministic fingerprint of a profile: SHA-256 over the canonical JSON
/// form, truncated to 64 bits. Key order never affects the result.
pub fn version(profile: &Profile) -> ProfileVersion {
    let mut canonical = String::new();
    write_canonical_map(&profile.0, &mut canonical);
    let digest = Sha256::digest(canonical.as_bytes());
    let hex: String = digest
        .iter()
        .take(VERSION_HEX_LEN / 2)
        .map(|b| format!("{:02x}", b))
        .collect();
    ProfileVersion(hex)
}

/// Compact JSON with every object's keys sorted, at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => write_canonical_map(map, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        // Display for scalars is already compact JSON (strings are escaped)
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn write_canonical_map(map: &Map<String, Value>, out: &mut String) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    out.push('{');
    for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&Value::from(key.as_str()).to_string());
        out.push(':');
        if let Some(value) = map.get(key) {
            write_canonical(value, out);
        }
    }
    out.push('}');
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(render_value)
            .collect::<Vec<_>>()
            .join(", "),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn title_case(key: &str) -> String {
    key.split('_')
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(|c| c.to_lowercase()))
                    .collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn profile(value: Value) -> Profile {
        Profile::from_value(value).unwrap()
    }

    #[test]
    fn test_version_ignores_key_order() {
        let a = profile(json!({
            "fit_preferences": ["relaxed", "oversized"],
            "body_type": "athletic",
            "nested": {"b": 1, "a": [ {"y": true, "x": null} ]}
        }));
        let b = profile(json!({
            "nested": {"a": [ {"x": null, "y": true} ], "b": 1},
            "body_type": "athletic",
            "fit_preferences": ["relaxed", "oversized"]
        }));
        assert_eq!(version(&a), version(&b));
    }

    #[test]
    fn test_version_changes_with_content() {
        let a = profile(json!({"color_palette": ["navy", "olive"]}));
        let b = profile(json!({"color_palette": ["navy", "black"]}));
        let c = profile(json!({"color_palette": ["olive", "navy"]}));
        assert_ne!(version(&a), version(&b));
        // list order is content, not formatting
        assert_ne!(version(&a), version(&c));
    }

    #[test]
    fn test_version_shape() {
        let v = version(&profile(json!({"style_goals": "minimal"})));
        assert_eq!(v.as_str().len(), VERSION_HEX_LEN);
        assert!(ProfileVersion::parse(v.as_str()).is_ok());
        assert!(ProfileVersion::parse("ABCDEF0123456789").is_err());
        assert!(ProfileVersion::parse("abc").is_err());
    }

    #[test]
    fn test_version_matches_known_digest() {
        let canonical = canonical_json(&json!({"b": [1, 2], "a": 1}));
        assert_eq!(canonical, r#"{"a":1,"b":[1,2]}"#);
        let digest = Sha256::digest(canonical.as_bytes());
        let expected: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
        assert_eq!(version(&profile(json!({"a": 1, "b": [1, 2]}))).as_str(), expected);
    }

    #[test]
    fn test_canonical_json_escapes_strings() {
        let canonical = canonical_json(&json!({"q": "say \"hi\"\n"}));
        assert_eq!(canonical, r#"{"q":"say \"hi\"\n"}"#);
    }

    #[test]
    fn test_from_value_rejects_non_objects() {
        let err = Profile::from_value(json!(["a"])).unwrap_err();
        assert!(matches!(err, AnalysisError::Validation(_)));
    }

    #[test]
    fn test_prompt_text_orders_known_keys_first() {
        let p = profile(json!({
            "shopping_budget": "mid_range",
            "avoidances": ["neon"],
            "fit_preferences": ["slim", "tailored"],
            "body_type": "tall",
        }));
        let text = p.prompt_text();
        let fits = text.find("Preferred Fits: slim, tailored").unwrap();
        let body = text.find("Body Type: tall").unwrap();
        let avoid = text.find("Avoid: neon").unwrap();
        let extra = text.find("Shopping Budget: mid_range").unwrap();
        assert!(fits < body && body < avoid && avoid < extra);
        assert!(text.starts_with("USER STYLE PROFILE:"));
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("preferred_brands"), "Preferred Brands");
        assert_eq!(title_case("LOUD_key"), "Loud Key");
    }
}
