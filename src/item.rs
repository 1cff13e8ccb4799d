//! Items under analysis and their stable identity.

use crate::error::AnalysisError;
use crate::models::Mode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use url::Url;

/// Normalized item URL. Fragment dropped, scheme and host lower-cased,
/// trailing slash removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn from_url(raw: &str) -> Result<Self, AnalysisError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(AnalysisError::Validation("item URL is empty".to_string()));
        }
        let mut url = Url::parse(trimmed)
            .map_err(|e| AnalysisError::Validation(format!("invalid item URL '{}': {}", trimmed, e)))?;
        url.set_fragment(None);

        let mut normalized = url.to_string();
        if url.query().is_none() {
            while normalized.ends_with('/') && normalized.len() > url.scheme().len() + 3 {
                normalized.pop();
            }
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Descriptive payload of an item as supplied by the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub materials: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub colors: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sizes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    /// Free-form fields the caller extracted; carried but not rendered.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Item {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn id(&self) -> Result<ItemId, AnalysisError> {
        ItemId::from_url(&self.url)
    }

    /// An item with neither a title nor a description cannot be analyzed.
    pub fn has_usable_data(&self) -> bool {
        non_blank(&self.title) || non_blank(&self.description)
    }

    /// Render the per-request (never cached) prompt segment.
    pub fn prompt_text(&self, mode: Mode) -> String {
        let mut lines = Vec::new();
        if let Some(title) = self.title.as_deref().filter(|s| !s.trim().is_empty()) {
            lines.push(format!("Product: {}", title));
        }
        if let Some(price) = self.price {
            let currency = self.currency.as_deref().unwrap_or("USD");
            lines.push(format!("Price: {} {}", currency, price));
        }
        if let Some(category) = self.category.as_deref().filter(|s| !s.is_empty()) {
            lines.push(format!("Category: {}", category));
        }
        if let Some(description) = self.description.as_deref().filter(|s| !s.is_empty()) {
            lines.push(format!("Description: {}", description));
        }
        if let Some(materials) = self.materials.as_deref().filter(|s| !s.is_empty()) {
            lines.push(format!("Materials: {}", materials));
        }
        if !self.colors.is_empty() {
            lines.push(format!("Available Colors: {}", self.colors.join(", ")));
        }
        if !self.sizes.is_empty() {
            lines.push(format!("Available Sizes: {}", self.sizes.join(", ")));
        }
        let product = lines.join("\n");

        match mode {
            Mode::Basic => format!(
                "Analyze this product and provide a basic style assessment:\n\n{}\n\n\
                 Provide a general analysis suitable for any user, focusing on:\n\
                 - Overall style and aesthetic\n\
                 - Versatility and styling potential\n\
                 - Quality and value considerations\n\
                 - General fit characteristics\n\n\
                 Return your analysis in the specified JSON format.",
                product
            ),
            Mode::Full => format!(
                "Analyze this product based on the user's style profile:\n\n{}\n\n\
                 Provide a detailed, personalized analysis addressing:\n\
                 - How well this matches the user's preferences\n\
                 - Specific styling suggestions aligned with their goals\n\
                 - Fit considerations for their body type\n\
                 - How this integrates into their existing wardrobe\n\n\
                 Return your analysis in the specified JSON format.",
                product
            ),
        }
    }
}

fn non_blank(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|s| !s.trim().is_empty())
}
