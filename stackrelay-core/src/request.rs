//! Logical request types and fingerprint derivation

use crate::error::ValidationError;
use crate::Fingerprint;
use serde::{Deserialize, Serialize};

/// Sort order for search-style operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SearchSort {
    Relevance,
    Activity,
    Votes,
    Creation,
}

impl SearchSort {
    /// Wire value understood by the upstream API.
    pub fn as_param(self) -> &'static str {
        match self {
            Self::Relevance => "relevance",
            Self::Activity => "activity",
            Self::Votes => "votes",
            Self::Creation => "creation",
        }
    }
}

/// One logical upstream operation, before dispatch.
///
/// Fingerprints are computed over the operation kind and normalized
/// parameters only; two requests differing in priority or access mode share
/// a fingerprint and therefore a cache slot and an in-flight call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiRequest {
    /// Free-text question search.
    Search {
        query: String,
        page: u32,
        page_size: u32,
        sort: SearchSort,
    },
    /// Search by one or more tags.
    TagSearch {
        tags: Vec<String>,
        page: u32,
        page_size: u32,
        sort: SearchSort,
    },
    /// Fetch one question, optionally with its answers and bodies.
    Question {
        id: u64,
        with_answers: bool,
        with_body: bool,
    },
}

impl ApiRequest {
    /// Keyword search with the upstream defaults (page 1, 10 results,
    /// relevance order).
    pub fn search(query: impl Into<String>) -> Self {
        Self::Search {
            query: query.into(),
            page: 1,
            page_size: 10,
            sort: SearchSort::Relevance,
        }
    }

    /// Tag search with the upstream defaults (page 1, 10 results, activity
    /// order).
    pub fn tag_search(tags: Vec<String>) -> Self {
        Self::TagSearch {
            tags,
            page: 1,
            page_size: 10,
            sort: SearchSort::Activity,
        }
    }

    /// Question fetch including answers and bodies.
    pub fn question(id: u64) -> Self {
        Self::Question {
            id,
            with_answers: true,
            with_body: true,
        }
    }

    /// Stable operation name, used in fingerprints and logs.
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Search { .. } => "search",
            Self::TagSearch { .. } => "tag_search",
            Self::Question { .. } => "question",
        }
    }

    /// Check the request parameters before it is admitted to the queue.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Search {
                query,
                page,
                page_size,
                ..
            } => {
                if query.trim().is_empty() {
                    return Err(ValidationError::RequiredFieldMissing {
                        field: "query".to_string(),
                    });
                }
                validate_paging(*page, *page_size)
            }
            Self::TagSearch {
                tags,
                page,
                page_size,
                ..
            } => {
                if normalize_tags(tags).is_empty() {
                    return Err(ValidationError::RequiredFieldMissing {
                        field: "tags".to_string(),
                    });
                }
                validate_paging(*page, *page_size)
            }
            Self::Question { id, .. } => {
                if *id == 0 {
                    return Err(ValidationError::InvalidValue {
                        field: "id".to_string(),
                        reason: "question ids start at 1".to_string(),
                    });
                }
                Ok(())
            }
        }
    }

    /// Normalized parameter list, sorted by key.
    ///
    /// Query text is whitespace-trimmed; tags are trimmed, lowercased,
    /// sorted, and deduplicated, so `["Rust", "async"]` and
    /// `["async", "rust"]` name the same logical request.
    pub fn normalized_params(&self) -> Vec<(String, String)> {
        let mut params = match self {
            Self::Search {
                query,
                page,
                page_size,
                sort,
            } => vec![
                ("page".to_string(), page.to_string()),
                ("pagesize".to_string(), page_size.to_string()),
                ("q".to_string(), query.trim().to_string()),
                ("sort".to_string(), sort.as_param().to_string()),
            ],
            Self::TagSearch {
                tags,
                page,
                page_size,
                sort,
            } => vec![
                ("page".to_string(), page.to_string()),
                ("pagesize".to_string(), page_size.to_string()),
                ("sort".to_string(), sort.as_param().to_string()),
                ("tagged".to_string(), normalize_tags(tags).join(";")),
            ],
            Self::Question {
                id,
                with_answers,
                with_body,
            } => vec![
                ("answers".to_string(), with_answers.to_string()),
                ("body".to_string(), with_body.to_string()),
                ("id".to_string(), id.to_string()),
            ],
        };
        params.sort();
        params
    }

    /// Deterministic identity for caching and deduplication.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::compute(self.operation(), &self.normalized_params())
    }
}

fn validate_paging(page: u32, page_size: u32) -> Result<(), ValidationError> {
    if page < 1 {
        return Err(ValidationError::InvalidValue {
            field: "page".to_string(),
            reason: "must be a positive integer".to_string(),
        });
    }
    if !(1..=100).contains(&page_size) {
        return Err(ValidationError::InvalidValue {
            field: "page_size".to_string(),
            reason: "must be between 1 and 100".to_string(),
        });
    }
    Ok(())
}

fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut cleaned: Vec<String> = tags
        .iter()
        .map(|tag| tag.trim().to_lowercase())
        .filter(|tag| !tag.is_empty())
        .collect();
    cleaned.sort();
    cleaned.dedup();
    cleaned
}

// =============================================================================
// TESTS
// =============================================================================
