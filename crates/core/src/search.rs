use crate::error::SearchError;
use crate::generation::{with_retry, TextEmbedder};
use crate::models::{
    Citation, RetryPolicy, SearchHit, SearchOptions, SearchSource, TextPage, VisualRegion,
};
use crate::traits::{DocumentStore, VectorIndex};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

const ELLIPSIS: &str = "...";

pub struct SearchRanker {
    documents: Arc<dyn DocumentStore>,
    vectors: Arc<dyn VectorIndex>,
    embedder: Arc<dyn TextEmbedder>,
    options: SearchOptions,
    retry: RetryPolicy,
}

impl SearchRanker {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        vectors: Arc<dyn VectorIndex>,
        embedder: Arc<dyn TextEmbedder>,
        options: SearchOptions,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            documents,
            vectors,
            embedder,
            options,
            retry,
        }
    }

    pub async fn search(&self, document_id: &str, query: &str, limit: Option<usize>) -> Vec<SearchHit> {
        if query.trim().is_empty() {
            return Vec::new();
        }

        match self.try_search(document_id, query, self.options.clamp_limit(limit)).await {
            Ok(hits) => hits,
            Err(error) => {
                warn!(document_id, error = %error, "search degraded to an empty result");
                Vec::new()
            }
        }
    }

    async fn try_search(
        &self,
        document_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, SearchError> {
        let pages = self.documents.find_text_pages(document_id).await?;

        let literal = pages
            .iter()
            .filter(|page| page.text.contains(query))
            .take(limit)
            .map(|page| (page, 1.0, SearchSource::Literal))
            .collect::<Vec<_>>();

        let ranked = if literal.is_empty() {
            match self.semantic_pages(document_id, query, limit, &pages).await {
                Ok(ranked) if !ranked.is_empty() => ranked,
                Ok(_) => {
                    debug!(document_id, "no semantic candidates");
                    literal
                }
                Err(error) => {
                    warn!(document_id, error = %error, "semantic search unavailable, keeping keyword hits");
                    literal
                }
            }
        } else {
            literal
        };

        let mut hits = Vec::with_capacity(ranked.len());
        for (page, score, source) in ranked {
            let region_ids = match self.documents.find_regions(document_id, page.page_number).await {
                Ok(regions) => map_regions(&page.text, query, &regions),
                Err(error) => {
                    warn!(document_id, page = page.page_number, error = %error, "regions unavailable");
                    Vec::new()
                }
            };

            hits.push(SearchHit {
                page_number: page.page_number,
                snippet: build_snippet(&page.text, query, &self.options),
                region_ids,
                score,
                source,
            });
        }

        Ok(hits)
    }

    async fn semantic_pages<'p>(
        &self,
        document_id: &str,
        query: &str,
        limit: usize,
        pages: &'p [TextPage],
    ) -> Result<Vec<(&'p TextPage, f64, SearchSource)>, SearchError> {
        let vector = with_retry(&self.retry, "embed_query", || self.embedder.embed_text(query)).await?;
        let scores = self.vectors.rank_pages(document_id, &vector, limit).await?;

        let by_number = pages
            .iter()
            .map(|page| (page.page_number, page))
            .collect::<HashMap<_, _>>();

        Ok(scores
            .into_iter()
            .filter_map(|scored| {
                by_number
                    .get(&scored.page_number)
                    .map(|page| (*page, scored.score, SearchSource::Semantic))
            })
            .collect())
    }

    pub async fn citation_for(
        &self,
        document_id: &str,
        page_number: u32,
        quoted: &str,
    ) -> Result<Citation, SearchError> {
        let page_text = self
            .documents
            .find_text_pages(document_id)
            .await?
            .into_iter()
            .find(|page| page.page_number == page_number)
            .map(|page| page.text)
            .unwrap_or_default();
        let regions = self.documents.find_regions(document_id, page_number).await?;

        Ok(Citation {
            page_number,
            region_ids: map_regions(&page_text, quoted, &regions),
        })
    }
}

// Picks the regions around the line holding the first occurrence of `query`.
// `regions` must be in reading order. With no occurrence, the middle region is
// returned. Otherwise the window `[line - 1, line + 1]` is clamped to the region list.
pub fn map_regions(text: &str, query: &str, regions: &[VisualRegion]) -> Vec<String> {
    if regions.is_empty() {
        return Vec::new();
    }

    let last = regions.len() - 1;
    let offset = if query.is_empty() { None } else { text.find(query) };
    let (start, end) = match offset {
        None => (regions.len() / 2, regions.len() / 2),
        Some(offset) => {
            let line = text[..offset].matches('\n').count();
            (line.saturating_sub(1).min(last), (line + 1).min(last))
        }
    };

    regions[start..=end]
        .iter()
        .map(|region| region.id.clone())
        .collect()
}

fn find_case_insensitive(haystack: &str, needle: &str) -> Option<(usize, usize)> {
    let needle = needle.chars().flat_map(char::to_lowercase).collect::<Vec<_>>();
    if needle.is_empty() {
        return None;
    }

    for (start, _) in haystack.char_indices() {
        let mut matched = 0usize;
        for (offset, ch) in haystack[start..].char_indices() {
            let fits = ch.to_lowercase().all(|lowered| {
                let hit = needle.get(matched) == Some(&lowered);
                matched += usize::from(hit);
                hit
            });
            if !fits {
                break;
            }
            if matched == needle.len() {
                return Some((start, start + offset + ch.len_utf8()));
            }
        }
    }

    None
}

pub fn build_snippet(text: &str, query: &str, options: &SearchOptions) -> String {
    let Some((start, end)) = find_case_insensitive(text, query) else {
        return text.chars().take(options.snippet_fallback_chars).collect();
    };

    let chars = text.chars().collect::<Vec<_>>();
    let match_start = text[..start].chars().count();
    let match_end = match_start + text[start..end].chars().count();
    let from = match_start.saturating_sub(options.snippet_window_chars);
    let to = (match_end + options.snippet_window_chars).min(chars.len());

    let mut snippet = String::new();
    if from > 0 {
        snippet.push_str(ELLIPSIS);
    }
    snippet.extend(&chars[from..to]);
    if to < chars.len() {
        snippet.push_str(ELLIPSIS);
    }
    snippet
}
