//! HTTP record store.
//!
//! Pages through the consultation backend's record listing:
//! `GET {base}/records?start=YYYY-MM-DD&end=YYYY-MM-DD&page=N&page_size=M`
//! answering `{"results": [...], "pagination": {"has_next": bool}}`.

use super::{select_rows, GeoScope, RawRecord, RecordBatch, RecordStore, SourceRow};
use crate::error::{EpiError, Result};
use crate::period::Period;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Default page cap per fetch. Reaching it with `has_next` still set fails
/// the fetch rather than returning a partial period.
const MAX_PAGES: usize = 10_000;

#[derive(Debug, Deserialize)]
struct RecordPage {
    #[serde(default)]
    results: Vec<Value>,
    #[serde(default)]
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    #[serde(default)]
    has_next: bool,
}

/// Record store backed by the consultation REST API.
pub struct HttpRecordStore {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    page_size: usize,
    max_pages: usize,
}

impl HttpRecordStore {
    pub fn new(base_url: &str, timeout: Duration, page_size: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EpiError::IngestionUnavailable(format!("HTTP client: {}", e)))?;
        Ok(Self::with_client(client, base_url, timeout, page_size))
    }

    pub fn with_client(
        client: reqwest::Client,
        base_url: &str,
        timeout: Duration,
        page_size: usize,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            page_size: page_size.max(1),
            max_pages: MAX_PAGES,
        }
    }

    /// Lower the page cap; a fetch that reaches it with pages left fails.
    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    fn classify(&self, err: reqwest::Error) -> EpiError {
        if err.is_timeout() {
            EpiError::IngestionTimeout(self.timeout)
        } else {
            EpiError::IngestionUnavailable(err.to_string())
        }
    }

    async fn fetch_page(&self, period: &Period, page: usize) -> Result<RecordPage> {
        let url = format!("{}/records", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("start", period.start().to_string()),
                ("end", period.end().to_string()),
                ("page", page.to_string()),
                ("page_size", self.page_size.to_string()),
            ])
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EpiError::IngestionUnavailable(format!(
                "{} answered {}",
                url, status
            )));
        }

        response.json::<RecordPage>().await.map_err(|e| self.classify(e))
    }
}

impl RecordStore for HttpRecordStore {
    fn name(&self) -> &str {
        "http"
    }

    async fn fetch(&self, period: &Period, scope: &GeoScope) -> Result<RecordBatch> {
        let mut rows = Vec::new();

        let mut page = 1;
        loop {
            let body = self.fetch_page(period, page).await?;
            let has_next = body.pagination.as_ref().is_some_and(|p| p.has_next);
            debug!("Page {} of {}: {} rows", page, period, body.results.len());

            rows.extend(body.results.into_iter().map(|value| {
                match serde_json::from_value::<RawRecord>(value) {
                    Ok(raw) => SourceRow::Parsed(raw),
                    Err(e) => SourceRow::Unreadable(format!("page {}: {}", page, e)),
                }
            }));

            if !has_next {
                break;
            }
            if page >= self.max_pages {
                return Err(EpiError::IngestionUnavailable(format!(
                    "{} still reports more records after {} pages",
                    self.base_url, page
                )));
            }
            page += 1;
        }

        Ok(select_rows(rows, period, scope, self.name()))
    }
}
