use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::client::ArchiveClient;
use crate::config::PagerOptions;
use crate::domain::{Granularity, SeriesUid};
use crate::error::NbiaError;
use crate::normalize::{fill_context, normalize_page};
use crate::query::{Endpoint, FilterKey, PageCursor, QueryBuilder, Request, SearchCriteria};
use crate::results::ResultSet;

const RECORD_KEYS: &[&str] = &["results", "resultSet", "data", "items"];
const HAS_MORE_KEYS: &[&str] = &["hasMore", "has_more"];
const CURSOR_KEYS: &[&str] = &["cursor", "nextCursor", "next_cursor"];
const TOTAL_KEYS: &[&str] = &["total", "totalCount", "totalPatients"];

/// One decoded response of a search endpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub records: Vec<Value>,
    pub has_more: Option<bool>,
    pub next_cursor: Option<String>,
    pub total: Option<u64>,
}

impl Page {
    /// Accepts a bare array of records or an envelope object carrying the
    /// records plus optional `hasMore`, cursor, and total signals.
    pub fn from_json(value: Value) -> Result<Self, NbiaError> {
        match value {
            Value::Array(records) => Ok(Self {
                records,
                ..Self::default()
            }),
            Value::Object(mut object) => {
                let records = RECORD_KEYS
                    .iter()
                    .find_map(|key| match object.remove(*key) {
                        Some(Value::Array(records)) => Some(records),
                        Some(Value::Null) => Some(Vec::new()),
                        _ => None,
                    })
                    .ok_or_else(|| {
                        NbiaError::UnexpectedResponse(
                            "response object carries no result array".to_string(),
                        )
                    })?;
                Ok(Self {
                    records,
                    has_more: first_of(&object, HAS_MORE_KEYS, Value::as_bool),
                    next_cursor: first_of(&object, CURSOR_KEYS, |value| {
                        value
                            .as_str()
                            .filter(|cursor| !cursor.is_empty())
                            .map(str::to_string)
                    }),
                    total: first_of(&object, TOTAL_KEYS, Value::as_u64),
                })
            }
            Value::Null => Ok(Self::default()),
            other => Err(NbiaError::UnexpectedResponse(format!(
                "expected a JSON array or object, got {other}"
            ))),
        }
    }
}

fn first_of<T>(
    object: &Map<String, Value>,
    keys: &[&str],
    extract: impl Fn(&Value) -> Option<T>,
) -> Option<T> {
    keys.iter()
        .filter_map(|key| object.get(*key))
        .find_map(extract)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Completion {
    Complete,
    /// The aggregate stops early; what was fetched is kept. `resume` is the
    /// cursor of the first page not aggregated, for [`Pager::fetch_from`].
    Partial {
        reason: String,
        resume: Option<PageCursor>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct PagedResult {
    pub results: ResultSet,
    pub completion: Completion,
    pub pages_fetched: usize,
    /// Records dropped for lacking their natural key.
    pub dropped: usize,
}

impl PagedResult {
    pub fn is_complete(&self) -> bool {
        self.completion == Completion::Complete
    }

    pub fn resume_cursor(&self) -> Option<&PageCursor> {
        match &self.completion {
            Completion::Partial { resume, .. } => resume.as_ref(),
            Completion::Complete => None,
        }
    }
}

/// Drives one request through every page, strictly in cursor order.
pub struct Pager<'a, C: ArchiveClient + ?Sized> {
    client: &'a C,
    options: PagerOptions,
}

impl<'a, C: ArchiveClient + ?Sized> Pager<'a, C> {
    pub fn new(client: &'a C, options: PagerOptions) -> Self {
        Self { client, options }
    }

    pub fn fetch_all(
        &self,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Result<PagedResult, NbiaError> {
        self.fetch_from(request, PageCursor::Offset(0), cancel)
    }

    /// Pages `request` starting at `cursor`, e.g. the resume cursor of an
    /// earlier partial result. Merge the two result sets to continue it.
    pub fn fetch_from(
        &self,
        request: &Request,
        mut cursor: PageCursor,
        cancel: &CancellationToken,
    ) -> Result<PagedResult, NbiaError> {
        let granularity = request.granularity();
        let context = request.context();
        let mut results = ResultSet::new(granularity, request.filters().clone());
        let mut offset = match &cursor {
            PageCursor::Offset(offset) => *offset,
            PageCursor::Token(_) => 0,
        };
        let mut pages_fetched = 0usize;
        let mut dropped = 0usize;

        let completion = loop {
            if pages_fetched >= self.options.max_pages {
                warn!(
                    endpoint = %request.endpoint(),
                    max_pages = self.options.max_pages,
                    "page ceiling reached"
                );
                break Completion::Partial {
                    reason: format!("page ceiling of {} reached", self.options.max_pages),
                    resume: Some(cursor.clone()),
                };
            }
            if cancel.is_cancelled() {
                break Completion::Partial {
                    reason: "cancelled".to_string(),
                    resume: Some(cursor.clone()),
                };
            }

            let raw = match self.fetch_page_with_retry(request, &cursor, cancel) {
                Ok(raw) => raw,
                Err(err) if err.is_transient() => {
                    warn!(endpoint = %request.endpoint(), page = pages_fetched, %err, "giving up on page");
                    break Completion::Partial {
                        reason: format!("page {} failed after retries: {err}", pages_fetched),
                        resume: Some(cursor.clone()),
                    };
                }
                Err(err) => return Err(err),
            };
            pages_fetched += 1;

            let mut page = Page::from_json(raw)?;
            let fetched = page.records.len();
            if !context.is_empty() {
                for record in &mut page.records {
                    fill_context(record, &context);
                }
            }
            let normalized = normalize_page(granularity, &page.records);
            dropped += normalized.dropped;
            let mut added = 0usize;
            for record in normalized.records {
                if results.insert(record) {
                    added += 1;
                }
            }
            debug!(
                endpoint = %request.endpoint(),
                page = pages_fetched,
                fetched,
                added,
                "page aggregated"
            );

            if !request.is_paged() || fetched == 0 || page.has_more == Some(false) {
                break Completion::Complete;
            }
            offset += fetched;
            if page.has_more.is_none() {
                if let Some(total) = page.total {
                    if offset as u64 >= total {
                        break Completion::Complete;
                    }
                }
            }
            cursor = match page.next_cursor {
                Some(token) => PageCursor::Token(token),
                None => PageCursor::Offset(offset),
            };
        };

        if let Some(sort) = request.sort() {
            results.sort(sort);
        }
        info!(
            endpoint = %request.endpoint(),
            records = results.len(),
            pages = pages_fetched,
            complete = matches!(completion, Completion::Complete),
            "query finished"
        );

        Ok(PagedResult {
            results,
            completion,
            pages_fetched,
            dropped,
        })
    }

    /// Series metadata for each UID, one request per series, merged in input
    /// order. Any partial or cancelled fetch makes the whole result partial.
    pub fn fetch_series_metadata(
        &self,
        uids: &[SeriesUid],
        cancel: &CancellationToken,
    ) -> Result<PagedResult, NbiaError> {
        let mut combined = PagedResult {
            results: ResultSet::new(Granularity::Series, SearchCriteria::new()),
            completion: Completion::Complete,
            pages_fetched: 0,
            dropped: 0,
        };
        for uid in uids {
            if cancel.is_cancelled() {
                combined.completion = Completion::Partial {
                    reason: "cancelled".to_string(),
                    resume: None,
                };
                break;
            }
            let criteria = SearchCriteria::new().with(FilterKey::SeriesInstanceUid, uid.as_str())?;
            let request = QueryBuilder::build(
                Endpoint::SeriesMetadata,
                &criteria,
                self.options.page_size,
                None,
            )?;
            let fetched = self.fetch_all(&request, cancel)?;
            combined.results.merge(fetched.results);
            combined.pages_fetched += fetched.pages_fetched;
            combined.dropped += fetched.dropped;
            if let Completion::Partial { reason, .. } = fetched.completion {
                warn!(series = %uid, %reason, "series metadata incomplete");
                combined.completion = Completion::Partial {
                    reason: format!("metadata for {uid} incomplete: {reason}"),
                    resume: None,
                };
                break;
            }
        }
        Ok(combined)
    }

    fn fetch_page_with_retry(
        &self,
        request: &Request,
        cursor: &PageCursor,
        cancel: &CancellationToken,
    ) -> Result<Value, NbiaError> {
        let retry = self.options.retry;
        let mut attempt = 0u32;
        loop {
            match self.client.fetch_page(request, cursor) {
                Ok(value) => return Ok(value),
                Err(err)
                    if err.is_transient()
                        && attempt < retry.max_retries
                        && !cancel.is_cancelled() =>
                {
                    let delay = retry.delay_for(attempt);
                    warn!(%err, attempt = attempt + 1, ?delay, "retrying page");
                    if !cancel.wait(delay) {
                        return Err(err);
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
