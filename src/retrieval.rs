use std::collections::HashMap;

use chrono::{Local, TimeZone};
use serde::Serialize;

use crate::{
    catalog::{Catalog, ChunkId, RetrievedChunk},
    embedding::Embedder,
    error::{Error, Result},
    vector_store::VectorStore,
};

/// `strftime` pattern for document dates, e.g. `2024, March 05`.
pub const DATE_FORMAT: &str = "%Y, %B %d";

/// One retrieved chunk with the provenance needed to cite it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetrievalResult {
    pub chunk_id: ChunkId,
    /// Modification date of the source document, in local time.
    pub date: String,
    pub text: String,
    pub file: String,
    pub title: String,
    pub author: String,
    pub page: i32,
    pub line_from: i32,
    pub line_to: i32,
}

impl From<RetrievedChunk> for RetrievalResult {
    fn from(chunk: RetrievedChunk) -> Self {
        Self {
            chunk_id: chunk.chunk_id,
            date: format_document_date(chunk.document_time),
            text: chunk.text,
            file: chunk.file,
            title: chunk.title,
            author: chunk.author,
            page: chunk.page,
            line_from: chunk.line_from,
            line_to: chunk.line_to,
        }
    }
}

/// Embed `query`, take the `k` nearest chunks and keep those that belong to
/// one of `collections`, best match first.
///
/// Fails when the vector store is not loaded or the query cannot be
/// embedded. Filtering happens after the nearest-neighbour search, so fewer
/// than `k` results may come back.
pub fn retrieve(
    catalog: &Catalog,
    vectors: &dyn VectorStore,
    embedder: &dyn Embedder,
    collections: &[String],
    query: &str,
    k: usize,
) -> Result<Vec<RetrievalResult>> {
    if !vectors.is_loaded() {
        return Err(Error::VectorStore("vector store is not loaded".into()));
    }
    if k == 0 || collections.is_empty() {
        return Ok(Vec::new());
    }

    let query_vector = embedder.embed_query(query)?;
    let ranked = vectors.search(&query_vector, k)?;
    tracing::debug!(candidates = ranked.len(), k, "Vector search done");

    let rows = catalog.read()?.select_chunks(&ranked, collections)?;
    Ok(in_rank_order(&ranked, rows)
        .into_iter()
        .map(RetrievalResult::from)
        .collect())
}

/// Sort joined rows back into the order the vector search ranked them.
fn in_rank_order(
    ranked: &[ChunkId],
    mut rows: Vec<RetrievedChunk>,
) -> Vec<RetrievedChunk> {
    let rank: HashMap<ChunkId, usize> = ranked
        .iter()
        .enumerate()
        .map(|(position, id)| (*id, position))
        .collect();
    rows.sort_by_key(|row| rank.get(&row.chunk_id).copied().unwrap_or(usize::MAX));
    rows
}

/// Format a millisecond timestamp with [`DATE_FORMAT`] in local time.
pub fn format_document_date(millis: i64) -> String {
    Local
        .timestamp_millis_opt(millis)
        .single()
        .map(|time| time.format(DATE_FORMAT).to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(chunk_id: ChunkId) -> RetrievedChunk {
        RetrievedChunk {
            chunk_id,
            document_time: 0,
            text: format!("chunk {chunk_id}"),
            file: "a.txt".into(),
            title: String::new(),
            author: String::new(),
            page: -1,
            line_from: -1,
            line_to: -1,
        }
    }

    #[test]
    fn restores_rank_order() {
        let ranked = [9, 2, 5];
        let rows = vec![row(2), row(5), row(9)];
        let ids: Vec<_> = in_rank_order(&ranked, rows)
            .iter()
            .map(|r| r.chunk_id)
            .collect();
        assert_eq!(ids, vec![9, 2, 5]);
    }

    #[test]
    fn formats_dates_with_year_and_month_name() {
        // 2024-06-15T12:00:00Z, June 2024 in every time zone.
        let date = format_document_date(1_718_452_800_000);
        assert!(date.starts_with("2024, June "), "got {date}");
    }

    #[test]
    fn result_carries_formatted_date() {
        let result = RetrievalResult::from(row(3));
        assert_eq!(result.chunk_id, 3);
        assert_eq!(result.text, "chunk 3");
        assert!(!result.date.is_empty());
    }
}
