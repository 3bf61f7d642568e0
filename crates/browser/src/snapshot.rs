// Feed Snapshotter
//
// Reads the visible feed rows and normalizes them to (row_id, endpoint)
// pairs. A pure read: it never navigates.

use callrelay_core::format::normalize_digits;
use callrelay_core::{FeedRow, PipelineError, Result, SharedBrowser, SiteConfig};
use regex::Regex;
use tracing::{debug, instrument};

/// Turns row markup into feed rows
#[derive(Debug, Clone)]
pub struct RowParser {
    open_tag: Regex,
    id_attr: Regex,
    cell: Regex,
    row_id_marker: String,
    endpoint_column: usize,
    min_cells: usize,
}

impl RowParser {
    pub fn new(site: &SiteConfig) -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| PipelineError::config(format!("row pattern: {}", e)))
        };
        Ok(Self {
            open_tag: compile(r"(?is)^\s*<[a-z][a-z0-9]*\b([^>]*)>")?,
            id_attr: compile(r#"(?is)(?:^|\s)id\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+))"#)?,
            cell: compile(r"(?is)<td\b[^>]*>(.*?)</td>")?,
            row_id_marker: site.row_id_marker.clone(),
            endpoint_column: site.endpoint_column,
            min_cells: site.min_cells,
        })
    }

    /// Parse one row's outer markup. Rows without a matching id, with too
    /// few cells or without digits in the endpoint cell are skipped.
    pub fn parse_row(&self, markup: &str) -> Option<FeedRow> {
        let attrs = self.open_tag.captures(markup)?.get(1)?.as_str();
        let id_caps = self.id_attr.captures(attrs)?;
        let row_id = id_caps
            .get(1)
            .or_else(|| id_caps.get(2))
            .or_else(|| id_caps.get(3))?
            .as_str()
            .trim();
        if row_id.is_empty() || !row_id.contains(&self.row_id_marker) {
            return None;
        }

        let cells: Vec<&str> = self
            .cell
            .captures_iter(markup)
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect();
        if cells.len() < self.min_cells {
            return None;
        }

        let endpoint = normalize_digits(&strip_tags(cells.get(self.endpoint_column)?));
        if endpoint.is_empty() {
            return None;
        }

        Some(FeedRow::new(row_id, endpoint))
    }

    /// Parse every row, keeping the first occurrence of each row id
    pub fn parse_rows<S: AsRef<str>>(&self, rows: &[S]) -> Vec<FeedRow> {
        let mut seen = std::collections::HashSet::new();
        rows.iter()
            .filter_map(|m| self.parse_row(m.as_ref()))
            .filter(|row| seen.insert(row.row_id.clone()))
            .collect()
    }
}

/// Text content of a markup fragment
fn strip_tags(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .trim()
        .to_string()
}

/// Reads the feed table from the shared session
pub struct FeedSnapshotter {
    browser: SharedBrowser,
    feed_selector: String,
    row_selector: String,
    parser: RowParser,
}

impl FeedSnapshotter {
    pub fn new(browser: SharedBrowser, site: &SiteConfig) -> Result<Self> {
        Ok(Self {
            browser,
            feed_selector: site.feed_selector.clone(),
            row_selector: site.row_selector.clone(),
            parser: RowParser::new(site)?,
        })
    }

    /// Current visible rows. Fails with `SnapshotRead` when the feed table
    /// is missing or the page cannot be read.
    #[instrument(skip(self))]
    pub async fn snapshot(&self) -> Result<Vec<FeedRow>> {
        let browser = self.browser.lock().await;

        let table = browser
            .page_markup(&self.feed_selector)
            .await
            .map_err(|e| PipelineError::snapshot(e.to_string()))?;
        if table.is_empty() {
            return Err(PipelineError::snapshot(format!(
                "feed table {} not found",
                self.feed_selector
            )));
        }

        let markup = browser
            .page_markup(&self.row_selector)
            .await
            .map_err(|e| PipelineError::snapshot(e.to_string()))?;
        let rows = self.parser.parse_rows(&markup);

        debug!(candidates = markup.len(), rows = rows.len(), "Feed snapshot");
        Ok(rows)
    }

    /// Whether the feed table is present on the current page
    pub async fn locate_feed(&self) -> bool {
        let browser = self.browser.lock().await;
        browser.exists(&self.feed_selector).await.unwrap_or(false)
    }
}
