//! Listing extraction
//!
//! Drives the portal's virtualized, infinite-scroll result list. Rows are
//! counted from the pane's visible text, not the DOM; the DOM count drifts
//! with headers and placeholder rows. Three stop conditions: the dataset is
//! exhausted, a requested count is reached, or a target row id shows up.

use crate::driver::Drive;
use crate::error::{ErrorKind, GatewayError};
use crate::portal::listing as sel;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;

/// Consecutive no-progress cycles before a list counts as exhausted.
const NO_PROGRESS_LIMIT: u32 = 6;
/// Pixels per scroll step.
const SCROLL_STEP: i64 = 300;
/// Hard cap; a virtual list that keeps yielding past this is a portal bug.
const MAX_SCROLL_CYCLES: u32 = 400;
/// Per-row selection fallback stops after this many rows.
const ROW_FALLBACK_LIMIT: usize = 40;

const DOWNLOAD_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub enum ScrollMode {
    /// Scroll until no new rows appear.
    Exhaust,
    /// Stop once at least this many rows are rendered.
    Count(usize),
    /// Stop when this row identifier is present on the page.
    Target(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Exhausted,
    CountReached,
    TargetFound,
}

#[derive(Debug, Clone)]
pub struct ListingOutcome {
    pub count: usize,
    pub scroll_cycles: u32,
    pub stop_reason: StopReason,
    pub fast_path: bool,
    pub found_target: Option<String>,
}

pub struct ListingEngine {
    row_re: Regex,
    /// Settle time after a scroll before recounting.
    settle: Duration,
    download_timeout: Duration,
}

impl ListingEngine {
    pub fn new(row_pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            row_re: Regex::new(row_pattern)?,
            settle: Duration::from_millis(700),
            download_timeout: Duration::from_secs(120),
        })
    }

    #[cfg(test)]
    pub fn fast(row_pattern: &str) -> Self {
        let mut engine = Self::new(row_pattern).unwrap();
        engine.settle = Duration::ZERO;
        engine.download_timeout = Duration::from_millis(500);
        engine
    }

    /// Count identifier-bearing lines in the results pane's visible text.
    pub fn count_rows(&self, text: &str) -> usize {
        text.lines().filter(|line| self.row_re.is_match(line)).count()
    }

    async fn rendered_count(&self, driver: &dyn Drive) -> Result<usize, GatewayError> {
        let text = driver.text_of(sel::RESULTS_PANE).await?;
        Ok(self.count_rows(&text))
    }

    async fn scroll_container(&self, driver: &dyn Drive) -> Result<&'static str, GatewayError> {
        for candidate in sel::SCROLL_CONTAINERS {
            if driver.exists(candidate).await? {
                return Ok(candidate);
            }
        }
        Err(GatewayError::new(
            ErrorKind::ElementNotFound,
            "no scrollable results container on page",
        ))
    }

    /// Run the scroll loop until the mode's stop condition is met.
    pub async fn run(
        &self,
        driver: &dyn Drive,
        mode: &ScrollMode,
    ) -> Result<ListingOutcome, GatewayError> {
        let container = self.scroll_container(driver).await?;

        // Pre-scroll fast path: the target may already be rendered.
        if let ScrollMode::Target(target) = mode {
            if driver.scroll_text_into_view(target).await? {
                let count = self.rendered_count(driver).await?;
                return Ok(ListingOutcome {
                    count,
                    scroll_cycles: 0,
                    stop_reason: StopReason::TargetFound,
                    fast_path: true,
                    found_target: Some(target.clone()),
                });
            }
        }

        let mut count = self.rendered_count(driver).await?;
        let mut cycles: u32 = 0;
        let mut no_progress: u32 = 0;

        loop {
            match mode {
                ScrollMode::Count(target_count) if count >= *target_count => {
                    return Ok(ListingOutcome {
                        count,
                        scroll_cycles: cycles,
                        stop_reason: StopReason::CountReached,
                        fast_path: false,
                        found_target: None,
                    });
                }
                ScrollMode::Target(target) if cycles > 0 => {
                    if driver.scroll_text_into_view(target).await? {
                        return Ok(ListingOutcome {
                            count,
                            scroll_cycles: cycles,
                            stop_reason: StopReason::TargetFound,
                            fast_path: true,
                            found_target: Some(target.clone()),
                        });
                    }
                }
                _ => {}
            }

            if no_progress >= NO_PROGRESS_LIMIT || cycles >= MAX_SCROLL_CYCLES {
                return Ok(ListingOutcome {
                    count,
                    scroll_cycles: cycles,
                    stop_reason: StopReason::Exhausted,
                    fast_path: false,
                    found_target: None,
                });
            }

            driver.scroll_by(container, SCROLL_STEP).await?;
            tokio::time::sleep(self.settle).await;
            let mut new_count = self.rendered_count(driver).await?;

            if new_count <= count {
                // Some virtual lists ignore synthetic scrolls; keystrokes
                // are the fallback that reaches their keyboard handlers.
                for key in ["ArrowDown", "ArrowDown", "PageDown"] {
                    let _ = driver.press_key(container, key).await;
                }
                tokio::time::sleep(self.settle).await;
                new_count = self.rendered_count(driver).await?;
            }

            if new_count > count {
                no_progress = 0;
            } else {
                no_progress += 1;
            }
            count = new_count.max(count);
            cycles += 1;
        }
    }

    /// Select every rendered row and trigger the spreadsheet export.
    /// Returns the downloaded filename and how many rows were selected.
    pub async fn export(
        &self,
        driver: &dyn Drive,
        download_dir: &Path,
    ) -> Result<(String, usize), GatewayError> {
        let selected = self.select_all_rows(driver).await?;

        driver.set_download_dir(download_dir).await?;
        let existing = dir_entries(download_dir);
        driver.click(sel::EXPORT_BUTTON).await?;
        let filename = self.await_download(download_dir, &existing).await?;
        Ok((filename, selected))
    }

    /// The master checkbox intercepts clicks inconsistently across
    /// environments; four methods are tried in a documented order before
    /// falling back to clicking rows one by one.
    async fn select_all_rows(&self, driver: &dyn Drive) -> Result<usize, GatewayError> {
        let count = self.rendered_count(driver).await?;

        let attempts: [(&str, bool); 4] = [
            (sel::MASTER_CHECKBOX_INPUT, false),
            (sel::MASTER_CHECKBOX_CELL, false),
            (sel::MASTER_CHECKBOX_INPUT, true),
            (sel::MASTER_CHECKBOX_CELL, true),
        ];
        for (selector, via_js) in attempts {
            let result = if via_js {
                driver.click_js(selector).await
            } else {
                driver.click(selector).await
            };
            if let Err(e) = result {
                tracing::debug!(selector, via_js, error = %e, "master checkbox click failed");
                continue;
            }
            if driver.is_checked(sel::MASTER_CHECKBOX_INPUT).await? {
                return Ok(count);
            }
        }

        tracing::warn!("master checkbox stuck, selecting rows individually");
        let mut clicked = 0;
        for row in 1..=count.min(ROW_FALLBACK_LIMIT) {
            let selector =
                format!("tbody tr:nth-child({row}) mat-checkbox input[type='checkbox']");
            match driver.click(&selector).await {
                Ok(()) => clicked += 1,
                Err(e) => {
                    tracing::debug!(row, error = %e, "row checkbox click failed");
                }
            }
        }

        if clicked == 0 {
            return Err(GatewayError::new(
                ErrorKind::CheckboxStuck,
                "could not select any rows for export",
            ));
        }
        Ok(clicked)
    }

    /// A download is complete once a new file exists with no `.crdownload`
    /// suffix and a non-zero size.
    async fn await_download(
        &self,
        dir: &Path,
        existing: &HashSet<OsString>,
    ) -> Result<String, GatewayError> {
        let deadline = tokio::time::Instant::now() + self.download_timeout;
        loop {
            if let Some(name) = finished_download(dir, existing) {
                return Ok(name);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(GatewayError::new(
                    ErrorKind::DownloadTimeout,
                    "export download never completed",
                ));
            }
            tokio::time::sleep(DOWNLOAD_POLL).await;
        }
    }
}

/// Navigate to a listing page unless the driver is already on it.
pub async fn ensure_on_page(
    driver: &dyn Drive,
    portal_url: &str,
    path: &str,
) -> Result<(), GatewayError> {
    let url = driver.current_url().await?;
    if !url.contains(path) {
        let full = format!("{}{}", portal_url.trim_end_matches('/'), path);
        driver.goto(&full).await?;
    }
    Ok(())
}

fn dir_entries(dir: &Path) -> HashSet<OsString> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name())
                .collect()
        })
        .unwrap_or_default()
}

fn finished_download(dir: &Path, existing: &HashSet<OsString>) -> Option<String> {
    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name();
        if existing.contains(&name) {
            continue;
        }
        let name_str = name.to_string_lossy();
        if name_str.ends_with(".crdownload") {
            continue;
        }
        let non_empty = entry.metadata().map(|m| m.len() > 0).unwrap_or(false);
        if non_empty {
            return Some(name_str.into_owned());
        }
    }
    None
}
