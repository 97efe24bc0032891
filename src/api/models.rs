//! Request and response types of the content API.

use super::filters::build_filter_expression;
use crate::rate_limit::RateLimitHeaders;
use crate::searches::{Search, SearchFilter};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::Value;

/// One page of full-text results for a search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub query: String,
    pub filters: Vec<SearchFilter>,
    pub top: i64,
    pub skip: i64,
}

impl DownloadRequest {
    /// Next page of `search`, starting at its pagination cursor.
    pub fn for_search(search: &Search, page_size: i64) -> Self {
        Self {
            query: search.query.clone(),
            filters: search.filters.clone(),
            top: page_size,
            skip: search.skip_value,
        }
    }

    pub fn query_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("$search", self.query.clone()),
            ("$expand", "Document".to_string()),
            ("$top", self.top.to_string()),
            ("$skip", self.skip.to_string()),
        ];
        let filter = build_filter_expression(&self.filters);
        if !filter.is_empty() {
            params.push(("$filter", filter));
        }
        params
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ResultPage {
    /// Results available for the whole search.
    #[serde(rename = "@odata.count", default)]
    pub total: i64,
    #[serde(default)]
    pub value: Vec<Value>,
}

impl ResultPage {
    pub fn returned(&self) -> i64 {
        self.value.len() as i64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub request_url: String,
    pub status: u16,
    pub page: ResultPage,
    /// Absent when the API sent no quota headers at all.
    pub rate_limits: Option<RateLimitHeaders>,
}

/// The parts of a result item that get written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedDocument {
    pub result_id: String,
    pub content: String,
}

impl DownloadedDocument {
    /// None when the item lacks `ResultId` or `Document.Content`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let result_id = match value.get("ResultId")? {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        let content = value.pointer("/Document/Content")?.as_str()?.to_string();
        Some(Self { result_id, content })
    }
}

/// A searchable source as listed by the `Sources` resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    pub id: String,
    pub name: String,
}

impl SourceEntry {
    const MAX_NAME_CHARS: usize = 250;

    /// None when the item lacks `Id` or `Name`. Long names are cut short.
    pub fn from_value(value: &Value) -> Option<Self> {
        let id = match value.get("Id")? {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        let name = value.get("Name")?.as_str()?;
        Some(Self {
            id,
            name: name.chars().take(Self::MAX_NAME_CHARS).collect(),
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct AccessToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    /// Seconds, sent as a number or a string.
    pub expires_in: Value,
}

impl TokenResponse {
    pub fn into_token(self, now: DateTime<Utc>) -> Option<AccessToken> {
        let secs = match &self.expires_in {
            Value::Number(n) => n.as_i64()?,
            Value::String(s) => s.trim().parse().ok()?,
            _ => return None,
        };
        Some(AccessToken {
            value: self.access_token,
            expires_at: now + Duration::seconds(secs),
        })
    }
}
