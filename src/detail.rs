//! Container detail extraction
//!
//! Finds a row on the listing page (fast path first), expands its detail
//! card, and reads either the gate-status timeline or the booking number.
//! The bulk variant works through a mixed batch on one session, capturing
//! failures per item.

use crate::auth::wait_exists;
use crate::driver::Drive;
use crate::error::{ErrorKind, GatewayError};
use crate::listing::{ListingEngine, ScrollMode, StopReason};
use crate::portal::detail as sel;
use serde::Serialize;
use std::time::Duration;

/// Pause between bulk entries so the portal is not hammered.
const BULK_PACING: Duration = Duration::from_millis(500);

/// How the pregate decision was made; reported to clients for forensics.
pub const DETECTION_METHOD: &str = "milestone_style_class";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimelineEntry {
    pub milestone: String,
    pub date: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkItemResult {
    pub container_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passed_pregate: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub booking_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkOutcome {
    pub import_results: Vec<BulkItemResult>,
    pub export_results: Vec<BulkItemResult>,
    pub summary: BulkSummary,
}

pub struct DetailEngine {
    listing: ListingEngine,
    pacing: Duration,
}

impl DetailEngine {
    pub fn new(row_pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            listing: ListingEngine::new(row_pattern)?,
            pacing: BULK_PACING,
        })
    }

    #[cfg(test)]
    pub fn fast(row_pattern: &str) -> Self {
        Self {
            listing: ListingEngine::fast(row_pattern),
            pacing: Duration::ZERO,
        }
    }

    /// Locate the row (fast path, then scroll-and-check) and expand its
    /// detail card.
    pub async fn search_and_expand(
        &self,
        driver: &dyn Drive,
        container_id: &str,
    ) -> Result<(), GatewayError> {
        let outcome = self
            .listing
            .run(driver, &ScrollMode::Target(container_id.to_string()))
            .await?;
        if outcome.stop_reason != StopReason::TargetFound {
            return Err(GatewayError::new(
                ErrorKind::ContainerNotFound,
                format!("{container_id} is not in the result list"),
            ));
        }

        if !driver.click_text(container_id).await? {
            return Err(GatewayError::new(
                ErrorKind::ContainerNotFound,
                format!("{container_id} disappeared before it could be expanded"),
            ));
        }
        wait_exists(driver, sel::DETAIL_CARD, Duration::from_secs(10)).await?;
        Ok(())
    }

    /// Read the pregate decision and the full timeline from the expanded
    /// card. The portal marks completion with a style class on the
    /// milestone node; that class is the source of truth here.
    pub async fn check_pregate(
        &self,
        driver: &dyn Drive,
    ) -> Result<(bool, Vec<TimelineEntry>), GatewayError> {
        let class = driver
            .attr(sel::PREGATE_MILESTONE, "class")
            .await?
            .ok_or_else(|| {
                GatewayError::new(
                    ErrorKind::PregateUnknown,
                    "pregate milestone not present on the detail card",
                )
            })?;
        let passed = class.contains(sel::MILESTONE_DONE_CLASS);

        let timeline = self.read_timeline(driver).await?;
        Ok((passed, timeline))
    }

    /// The timeline widget renders newest-first; that order is preserved.
    async fn read_timeline(&self, driver: &dyn Drive) -> Result<Vec<TimelineEntry>, GatewayError> {
        let js = format!(
            r"(() => {{
                const items = Array.from(document.querySelectorAll({items}));
                return items.map(el => {{
                    const name = el.querySelector('.milestone__name');
                    const date = el.querySelector('.milestone__date');
                    return {{
                        milestone: (name || el).innerText.trim(),
                        date: date ? date.innerText.trim() : 'N/A',
                        completed: el.classList.contains({done}),
                    }};
                }});
            }})()",
            items = serde_json::to_string(sel::TIMELINE_ITEMS).unwrap(),
            done = serde_json::to_string(sel::MILESTONE_DONE_CLASS).unwrap(),
        );

        let raw = driver.eval(&js).await?;
        let items = raw.as_array().cloned().unwrap_or_default();
        Ok(items
            .iter()
            .map(|item| TimelineEntry {
                milestone: item
                    .get("milestone")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                date: item
                    .get("date")
                    .and_then(|v| v.as_str())
                    .unwrap_or("N/A")
                    .to_string(),
                status: if item
                    .get("completed")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false)
                {
                    "completed".to_string()
                } else {
                    "pending".to_string()
                },
            })
            .collect())
    }

    /// Read the booking number off the expanded card. A missing field or a
    /// literal "N/A" is a `None`, not an error; import containers simply
    /// have no booking.
    pub async fn booking_number(
        &self,
        driver: &dyn Drive,
    ) -> Result<Option<String>, GatewayError> {
        let js = format!(
            r"(() => {{
                const labels = Array.from(document.querySelectorAll({card} + ' .field__label'));
                const label = labels.find(el => el.innerText.trim().startsWith({label}));
                if (!label) return null;
                const value = label.nextElementSibling;
                return value ? value.innerText.trim() : null;
            }})()",
            card = serde_json::to_string(sel::DETAIL_CARD).unwrap(),
            label = serde_json::to_string(sel::BOOKING_LABEL_TEXT).unwrap(),
        );

        let raw = driver.eval(&js).await?;
        Ok(raw
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty() && *s != "N/A")
            .map(str::to_owned))
    }

    /// Process a mixed batch on one session: pregate for imports, booking
    /// numbers for exports. One bad entry never aborts the rest.
    pub async fn bulk(
        &self,
        driver: &dyn Drive,
        import_containers: &[String],
        export_containers: &[String],
    ) -> BulkOutcome {
        let mut import_results = Vec::with_capacity(import_containers.len());
        for container_id in import_containers {
            let result = match self.pregate_for(driver, container_id).await {
                Ok(passed) => BulkItemResult {
                    container_id: container_id.clone(),
                    success: true,
                    passed_pregate: Some(passed),
                    booking_number: None,
                    error: None,
                },
                Err(e) => failed_item(container_id, &e),
            };
            import_results.push(result);
            tokio::time::sleep(self.pacing).await;
        }

        let mut export_results = Vec::with_capacity(export_containers.len());
        for container_id in export_containers {
            let result = match self.booking_for(driver, container_id).await {
                Ok(booking) => BulkItemResult {
                    container_id: container_id.clone(),
                    success: true,
                    passed_pregate: None,
                    booking_number: booking,
                    error: None,
                },
                Err(e) => failed_item(container_id, &e),
            };
            export_results.push(result);
            tokio::time::sleep(self.pacing).await;
        }

        let total = import_results.len() + export_results.len();
        let succeeded = import_results
            .iter()
            .chain(export_results.iter())
            .filter(|r| r.success)
            .count();
        BulkOutcome {
            import_results,
            export_results,
            summary: BulkSummary {
                total,
                succeeded,
                failed: total - succeeded,
            },
        }
    }

    async fn pregate_for(
        &self,
        driver: &dyn Drive,
        container_id: &str,
    ) -> Result<bool, GatewayError> {
        self.search_and_expand(driver, container_id).await?;
        let (passed, _) = self.check_pregate(driver).await?;
        Ok(passed)
    }

    async fn booking_for(
        &self,
        driver: &dyn Drive,
        container_id: &str,
    ) -> Result<Option<String>, GatewayError> {
        self.search_and_expand(driver, container_id).await?;
        self.booking_number(driver).await
    }
}

fn failed_item(container_id: &str, e: &GatewayError) -> BulkItemResult {
    BulkItemResult {
        container_id: container_id.to_string(),
        success: false,
        passed_pregate: None,
        booking_number: None,
        error: Some(format!("{}: {}", e.kind.as_str(), e.message)),
    }
}
