//! Row models returned by repository queries.
//!
//! JSON columns stay as text here; `into_request` decodes them.

use crate::model::PendingRequest;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct PendingRow {
    pub id: i64,
    pub url: String,
    pub method: String,
    pub headers: String,
    pub body: Option<String>,
    pub synced: bool,
    pub created_at: DateTime<Utc>,
}

impl PendingRow {
    pub fn into_request(self) -> Result<PendingRequest, serde_json::Error> {
        let headers: BTreeMap<String, String> = if self.headers.trim().is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_str(&self.headers)?
        };
        let body = match self.body {
            Some(raw) => Some(serde_json::from_str::<Value>(&raw)?),
            None => None,
        };
        Ok(PendingRequest {
            id: self.id,
            url: self.url,
            method: self.method,
            headers,
            body,
            synced: self.synced,
            created_at: self.created_at,
        })
    }
}
