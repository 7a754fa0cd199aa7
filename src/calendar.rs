//! Calendar provider collaborator.
//!
//! A fetch failure for one account never fails a search: that account is
//! treated as fully free.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono_tz::Tz;
use futures::future::join_all;
use thiserror::Error;
use tracing::warn;

use crate::model::{BusyInterval, Span};
use crate::normalize::{RawEvent, normalize};

#[derive(Debug, Error)]
pub enum CalendarError {
    #[error("no calendar connected for {0}")]
    NotConnected(String),

    #[error("calendar provider unavailable: {0}")]
    Unavailable(String),

    #[error("calendar I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed calendar payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Supplies raw event records for one account over a window.
#[async_trait]
pub trait CalendarSource: Send + Sync {
    async fn fetch_events(&self, account: &str, window: Span) -> Result<Vec<RawEvent>, CalendarError>;
}

/// Fetch and normalize every account concurrently. Output order matches
/// `accounts`; intervals not overlapping `window` are dropped.
pub async fn fetch_busy(
    source: &dyn CalendarSource,
    accounts: &[String],
    window: Span,
    tz: &Tz,
) -> Vec<Vec<BusyInterval>> {
    let fetches = accounts
        .iter()
        .map(|account| source.fetch_events(account, window));
    let results = join_all(fetches).await;

    accounts
        .iter()
        .zip(results)
        .map(|(account, result)| match result {
            Ok(events) => {
                let mut busy = normalize(&events, tz);
                busy.retain(|span| span.overlaps(&window));
                busy
            }
            Err(e) => {
                warn!("calendar fetch for {account} failed, treating as free: {e}");
                metrics::counter!(crate::observability::CALENDAR_FETCH_FAILURES_TOTAL).increment(1);
                Vec::new()
            }
        })
        .collect()
}

/// Reads `<dir>/<account>.json`, a JSON array of raw provider events.
/// A missing file means no calendar is connected.
pub struct JsonDirCalendarSource {
    dir: PathBuf,
}

impl JsonDirCalendarSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, account: &str) -> Option<PathBuf> {
        // Keep account names from escaping the directory.
        let safe: String = account
            .chars()
            .filter(|c| c.is_alphanumeric() || matches!(c, '@' | '.' | '_' | '-' | '+'))
            .collect();
        if safe.is_empty() || safe.starts_with('.') {
            return None;
        }
        Some(self.dir.join(format!("{safe}.json")))
    }
}

#[async_trait]
impl CalendarSource for JsonDirCalendarSource {
    async fn fetch_events(&self, account: &str, _window: Span) -> Result<Vec<RawEvent>, CalendarError> {
        let path = self
            .path_for(account)
            .ok_or_else(|| CalendarError::NotConnected(account.to_string()))?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CalendarError::NotConnected(account.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Source used when no calendar backend is configured: every account is free.
pub struct NoCalendars;

#[async_trait]
impl CalendarSource for NoCalendars {
    async fn fetch_events(&self, _account: &str, _window: Span) -> Result<Vec<RawEvent>, CalendarError> {
        Ok(Vec::new())
    }
}
