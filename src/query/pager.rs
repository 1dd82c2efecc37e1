use crate::error::{Result, SyncdexError};
use crate::types::{PartitionFailure, PartitionHits, PartitionId, ResultPage, ResultRow};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

/// Descending score, then ascending key.
fn rank(a: &ResultRow, b: &ResultRow) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.key.cmp(&b.key))
}

/// Merge per-partition rows into one ranked list of at most `limit` rows.
///
/// A key reported by two partitions (possible while a partition moves
/// between nodes) is kept once, at its best rank.
pub fn merge(hits: Vec<PartitionHits>, limit: usize) -> (Vec<ResultRow>, usize) {
    let total = hits.iter().map(|h| h.total).sum();
    let mut rows: Vec<ResultRow> = hits.into_iter().flat_map(|h| h.rows).collect();
    rows.sort_by(rank);
    let mut seen = HashSet::with_capacity(rows.len());
    rows.retain(|row| seen.insert(row.key.clone()));
    rows.truncate(limit);
    (rows, total)
}

/// Pages over a result set that was fully materialized when the query ran.
/// Paging never goes back to the partitions.
#[derive(Debug, Clone)]
pub struct PageCursor {
    rows: Arc<Vec<ResultRow>>,
    page_size: usize,
    next_page: usize,
    total_matches: usize,
    contributors: Vec<PartitionId>,
    failures: Vec<PartitionFailure>,
}

impl PageCursor {
    pub fn new(
        rows: Vec<ResultRow>,
        page_size: usize,
        total_matches: usize,
        mut contributors: Vec<PartitionId>,
        failures: Vec<PartitionFailure>,
    ) -> Self {
        contributors.sort();
        contributors.dedup();
        PageCursor {
            rows: Arc::new(rows),
            page_size,
            next_page: 0,
            total_matches,
            contributors,
            failures,
        }
    }

    /// Number of rows in the result, across all pages.
    pub fn size(&self) -> usize {
        self.rows.len()
    }

    /// Matches reported by the partitions before the limit was applied.
    pub fn total_matches(&self) -> usize {
        self.total_matches
    }

    fn page_len(&self) -> usize {
        if self.page_size == 0 {
            self.rows.len().max(1)
        } else {
            self.page_size
        }
    }

    pub fn page_count(&self) -> usize {
        self.rows.len().div_ceil(self.page_len())
    }

    pub fn has_next(&self) -> bool {
        self.next_page < self.page_count()
    }

    /// Page `number` (zero-based) without moving the cursor.
    pub fn page(&self, number: usize) -> Option<ResultPage> {
        if number >= self.page_count() {
            return None;
        }
        let len = self.page_len();
        let start = number * len;
        let end = (start + len).min(self.rows.len());
        Some(ResultPage {
            number,
            rows: self.rows[start..end].to_vec(),
        })
    }

    /// Start again from the first page.
    pub fn rewind(&mut self) {
        self.next_page = 0;
    }

    pub fn rows(&self) -> &[ResultRow] {
        &self.rows
    }

    pub fn keys(&self) -> Vec<String> {
        self.rows.iter().map(|r| r.key.clone()).collect()
    }

    /// Partitions whose rows are in this result.
    pub fn contributors(&self) -> &[PartitionId] {
        &self.contributors
    }

    pub fn failures(&self) -> &[PartitionFailure] {
        &self.failures
    }

    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }

    /// `Err(PartialResult)` if any partition failed to answer.
    pub fn ensure_complete(&self) -> Result<()> {
        if self.failures.is_empty() {
            return Ok(());
        }
        let missing: Vec<PartitionId> = self
            .failures
            .iter()
            .flat_map(|f| f.partitions.iter().copied())
            .collect();
        let detail = self
            .failures
            .iter()
            .map(|f| match &f.node {
                Some(node) => format!("{}: {}", node, f.error),
                None => f.error.clone(),
            })
            .collect::<Vec<_>>()
            .join("; ");
        Err(SyncdexError::PartialResult { missing, detail })
    }
}

impl Iterator for PageCursor {
    type Item = ResultPage;

    fn next(&mut self) -> Option<ResultPage> {
        let page = self.page(self.next_page)?;
        self.next_page += 1;
        Some(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(key: &str, score: f32) -> ResultRow {
        ResultRow {
            key: key.to_string(),
            value: json!({ "k": key }),
            score,
        }
    }

    fn hits(partition: u32, rows: Vec<ResultRow>) -> PartitionHits {
        PartitionHits {
            partition: PartitionId(partition),
            total: rows.len(),
            rows,
        }
    }

    #[test]
    fn merge_orders_by_score_then_key() {
        let (rows, total) = merge(
            vec![
                hits(0, vec![row("b", 1.0), row("d", 0.5)]),
                hits(1, vec![row("a", 1.0), row("c", 2.0)]),
            ],
            10,
        );
        let keys: Vec<_> = rows.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["c", "a", "b", "d"]);
        assert_eq!(total, 4);
    }

    #[test]
    fn merge_dedupes_and_limits() {
        let (rows, _) = merge(
            vec![
                hits(0, vec![row("a", 0.2), row("b", 0.9)]),
                hits(1, vec![row("a", 0.7)]),
            ],
            2,
        );
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].key, "b");
        assert_eq!(rows[1].key, "a");
        assert_eq!(rows[1].score, 0.7);
    }

    #[test]
    fn pages_cover_every_row_once() {
        let rows: Vec<_> = (0..7).map(|i| row(&format!("k{}", i), 1.0)).collect();
        let cursor = PageCursor::new(rows.clone(), 3, 7, vec![PartitionId(0)], Vec::new());
        assert_eq!(cursor.size(), 7);
        assert_eq!(cursor.page_count(), 3);

        let pages: Vec<ResultPage> = cursor.clone().collect();
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[2].rows.len(), 1);
        let flattened: Vec<ResultRow> = pages.into_iter().flat_map(|p| p.rows).collect();
        assert_eq!(flattened, rows);

        // a second walk yields the same pages
        let again: Vec<ResultPage> = cursor.collect();
        assert_eq!(again[0].rows, rows[0..3].to_vec());
    }

    #[test]
    fn zero_page_size_is_one_page() {
        let rows: Vec<_> = (0..5).map(|i| row(&format!("k{}", i), 1.0)).collect();
        let mut cursor = PageCursor::new(rows, 0, 5, Vec::new(), Vec::new());
        assert!(cursor.has_next());
        assert_eq!(cursor.next().unwrap().rows.len(), 5);
        assert!(!cursor.has_next());
        assert!(cursor.next().is_none());
    }

    #[test]
    fn empty_result_has_no_pages() {
        let mut cursor = PageCursor::new(Vec::new(), 0, 0, Vec::new(), Vec::new());
        assert_eq!(cursor.size(), 0);
        assert!(!cursor.has_next());
        assert!(cursor.next().is_none());
    }

    #[test]
    fn failures_make_the_cursor_partial() {
        let cursor = PageCursor::new(
            vec![row("a", 1.0)],
            0,
            1,
            vec![PartitionId(0)],
            vec![PartitionFailure {
                partitions: vec![PartitionId(4), PartitionId(5)],
                node: Some("node-b".to_string()),
                error: "connection refused".to_string(),
            }],
        );
        assert!(cursor.is_partial());
        match cursor.ensure_complete().unwrap_err() {
            SyncdexError::PartialResult { missing, detail } => {
                assert_eq!(missing, vec![PartitionId(4), PartitionId(5)]);
                assert!(detail.contains("node-b"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
