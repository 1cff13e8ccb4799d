//! Client-reported diagnostic entries and the query filter over them.

use crate::error::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Only this many of the newest entries are ever returned.
pub const MAX_DIAGNOSTICS: usize = 1000;
const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticEntry {
    pub level: DiagnosticLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl DiagnosticEntry {
    pub fn new(level: DiagnosticLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            component: None,
            message: message.into(),
            kind: None,
            detail: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = Some(kind);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsFilter {
    #[serde(default)]
    pub level: Option<DiagnosticLevel>,
    #[serde(default)]
    pub component: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl DiagnosticsFilter {
    fn matches(&self, entry: &DiagnosticEntry) -> bool {
        self.level.is_none_or(|level| entry.level == level)
            && self
                .component
                .as_deref()
                .is_none_or(|c| entry.component.as_deref() == Some(c))
    }

    /// Newest first, restricted to the retained window.
    pub fn apply<'a>(&self, entries: impl DoubleEndedIterator<Item = &'a DiagnosticEntry>) -> DiagnosticsPage {
        let matching: Vec<&DiagnosticEntry> = entries
            .rev()
            .take(MAX_DIAGNOSTICS)
            .filter(|e| self.matches(e))
            .collect();
        let total = matching.len();
        let limit = self.limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_DIAGNOSTICS);
        let page: Vec<DiagnosticEntry> = matching
            .into_iter()
            .skip(self.offset)
            .take(limit)
            .cloned()
            .collect();
        DiagnosticsPage {
            has_more: self.offset + page.len() < total,
            entries: page,
            total,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsPage {
    pub entries: Vec<DiagnosticEntry>,
    pub total: usize,
    pub has_more: bool,
}
