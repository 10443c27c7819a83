//! Wizard driving
//!
//! Executes phases against the live page. Field values come exclusively
//! from the sub-session's accumulated `PhaseData`, which is what makes the
//! stepper-stuck retry safe: a re-fill replays exactly what was supplied.

use super::{ContainerType, Phase, SubSession};
use crate::artifacts::ArtifactStore;
use crate::driver::Drive;
use crate::error::{ErrorKind, GatewayError};
use crate::portal::{urls, wizard as sel};
use crate::session::BrowserSession;
use std::time::Duration;

const SELECT_PANEL_OPTIONS: &str = ".mat-select-panel mat-option";
const AUTOCOMPLETE_PANEL_OPTIONS: &str = ".mat-autocomplete-panel mat-option";

#[derive(Debug, Clone)]
pub struct AppointmentOutcome {
    /// Import: visible slots in the appointment-time dropdown.
    pub available_times: Option<Vec<String>>,
    /// Export: whether the calendar icon was reachable.
    pub calendar_found: Option<bool>,
    pub submitted: bool,
    pub dropdown_screenshot: Option<String>,
    pub calendar_screenshot: Option<String>,
}

pub struct WizardRunner {
    portal_url: String,
    /// Bound on the stepper advancing after a Next click.
    phase_timeout: Duration,
    /// Pause for panels to render after opening a dropdown.
    settle: Duration,
}

impl WizardRunner {
    pub fn new(portal_url: String) -> Self {
        Self {
            portal_url,
            phase_timeout: Duration::from_secs(15),
            settle: Duration::from_millis(300),
        }
    }

    #[cfg(test)]
    pub fn fast(portal_url: String) -> Self {
        Self {
            portal_url,
            phase_timeout: Duration::from_millis(50),
            settle: Duration::ZERO,
        }
    }

    /// Run the workflow from the sub-session's current phase. With
    /// `submit` false this is the check variant and never touches Submit;
    /// with `submit` true the chosen time is selected and Submit is
    /// clicked exactly once.
    pub async fn run(
        &self,
        session: &BrowserSession,
        store: &ArtifactStore,
        sub: &mut SubSession,
        submit: bool,
    ) -> Result<AppointmentOutcome, GatewayError> {
        let driver = session.driver.as_ref();

        let url = driver.current_url().await?;
        if !url.contains(urls::BOOKING_WIZARD_PATH) {
            if sub.phase != Phase::One {
                // The wizard state this sub-session accumulated is gone.
                return Err(GatewayError::new(
                    ErrorKind::SessionExpired,
                    "browser is no longer on the booking wizard",
                ));
            }
            let wizard_url = format!(
                "{}{}",
                self.portal_url.trim_end_matches('/'),
                urls::BOOKING_WIZARD_PATH
            );
            driver.goto(&wizard_url).await?;
        }

        while sub.phase != Phase::Three {
            if let Some(field) = sub.data.missing_for(sub.phase, sub.container_type) {
                return Err(GatewayError::new(
                    ErrorKind::MissingField,
                    format!("phase {} requires {field}", sub.phase.as_u8()),
                ));
            }
            self.fill_phase(driver, sub).await?;
            self.advance(session, store, sub).await?;
            let done = sub.phase.as_u8();
            sub.phase = sub.phase.next();
            let _ = session
                .capture(store, &format!("phase{done}-complete"))
                .await;
        }

        match sub.container_type {
            ContainerType::Import => self.finish_import(session, store, sub, submit).await,
            ContainerType::Export => self.finish_export(session, store, sub, submit).await,
        }
    }

    async fn finish_import(
        &self,
        session: &BrowserSession,
        store: &ArtifactStore,
        sub: &SubSession,
        submit: bool,
    ) -> Result<AppointmentOutcome, GatewayError> {
        let driver = session.driver.as_ref();

        driver.click(sel::TIME_DROPDOWN).await.map_err(|_| {
            GatewayError::new(
                ErrorKind::DropdownNotFound,
                "appointment-time dropdown is not on the page",
            )
        })?;
        tokio::time::sleep(self.settle).await;

        let available_times: Vec<String> = driver
            .all_texts(sel::TIME_OPTIONS)
            .await?
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        let dropdown_screenshot = session.capture(store, "appointment-times").await;

        let mut submitted = false;
        if submit {
            let chosen = sub
                .data
                .appointment_time
                .clone()
                .filter(|t| !t.is_empty())
                .ok_or_else(|| {
                    GatewayError::new(
                        ErrorKind::MissingField,
                        "phase 3 requires appointment_time",
                    )
                })?;
            if !choose_option(driver, SELECT_PANEL_OPTIONS, &chosen).await? {
                return Err(GatewayError::new(
                    ErrorKind::OptionNotFound,
                    format!("Appointment Time has no option \"{chosen}\""),
                ));
            }
            driver.click(sel::SUBMIT_BUTTON).await.map_err(|e| {
                GatewayError::new(ErrorKind::SubmitFailed, e.to_string())
            })?;
            submitted = true;
        }

        Ok(AppointmentOutcome {
            available_times: Some(available_times),
            calendar_found: None,
            submitted,
            dropdown_screenshot,
            calendar_screenshot: None,
        })
    }

    async fn finish_export(
        &self,
        session: &BrowserSession,
        store: &ArtifactStore,
        _sub: &SubSession,
        submit: bool,
    ) -> Result<AppointmentOutcome, GatewayError> {
        let driver = session.driver.as_ref();

        let calendar_found = driver.exists(sel::CALENDAR_ICON).await?;
        let mut calendar_screenshot = None;
        if calendar_found {
            if let Err(e) = driver.click(sel::CALENDAR_ICON).await {
                tracing::debug!(error = %e, "calendar icon click failed");
            }
            calendar_screenshot = session.capture(store, "calendar").await;
        }

        let mut submitted = false;
        if submit {
            if !calendar_found {
                return Err(GatewayError::new(
                    ErrorKind::SubmitFailed,
                    "calendar never became reachable",
                ));
            }
            driver.click(sel::SUBMIT_BUTTON).await.map_err(|e| {
                GatewayError::new(ErrorKind::SubmitFailed, e.to_string())
            })?;
            submitted = true;
        }

        Ok(AppointmentOutcome {
            available_times: None,
            calendar_found: Some(calendar_found),
            submitted,
            dropdown_screenshot: None,
            calendar_screenshot,
        })
    }

    async fn fill_phase(
        &self,
        driver: &dyn Drive,
        sub: &SubSession,
    ) -> Result<(), GatewayError> {
        let data = &sub.data;
        match sub.phase {
            Phase::One => {
                self.select_dropdown(
                    driver,
                    sel::TRUCKING_COMPANY_LABEL,
                    data.trucking_company.as_deref().unwrap_or_default(),
                )
                .await?;
                self.select_dropdown(
                    driver,
                    sel::TERMINAL_LABEL,
                    data.terminal.as_deref().unwrap_or_default(),
                )
                .await?;
                self.select_dropdown(
                    driver,
                    sel::MOVE_TYPE_LABEL,
                    data.move_type.as_deref().unwrap_or_default(),
                )
                .await?;
                match sub.container_type {
                    ContainerType::Import => {
                        driver
                            .type_text(
                                sel::CONTAINER_ID_INPUT,
                                data.container_id.as_deref().unwrap_or_default(),
                            )
                            .await?;
                    }
                    ContainerType::Export => {
                        driver
                            .type_text(
                                sel::BOOKING_NUMBER_INPUT,
                                data.booking_number.as_deref().unwrap_or_default(),
                            )
                            .await?;
                        driver
                            .type_text(
                                sel::QUANTITY_INPUT,
                                data.quantity.as_deref().unwrap_or("1"),
                            )
                            .await?;
                    }
                }
            }
            Phase::Two => {
                self.ensure_checked(driver, sel::CONTAINER_ROW_CHECKBOX).await?;
                match sub.container_type {
                    ContainerType::Import => {
                        driver
                            .type_text(
                                sel::PIN_INPUT,
                                data.pin_code.as_deref().unwrap_or(super::DEFAULT_PIN),
                            )
                            .await?;
                    }
                    ContainerType::Export => {
                        driver
                            .type_text(
                                sel::UNIT_NUMBER_INPUT,
                                data.unit_number.as_deref().unwrap_or("1"),
                            )
                            .await?;
                        for seal_input in sel::SEAL_INPUTS {
                            driver
                                .type_text(
                                    seal_input,
                                    data.seal_number.as_deref().unwrap_or("1"),
                                )
                                .await?;
                        }
                    }
                }
                self.fill_plate(driver, sub).await?;

                // Toggle reads its state first: a blind click would undo a
                // value that is already right.
                let desired = data.own_chassis.unwrap_or(false);
                if driver.is_checked(sel::OWN_CHASSIS_INPUT).await? != desired {
                    driver.click(sel::OWN_CHASSIS_TOGGLE).await?;
                }
            }
            Phase::Three => {}
        }
        Ok(())
    }

    async fn fill_plate(
        &self,
        driver: &dyn Drive,
        sub: &SubSession,
    ) -> Result<(), GatewayError> {
        if sub.data.plate_is_wildcard() {
            driver.click(sel::TRUCK_PLATE_INPUT).await?;
            tokio::time::sleep(self.settle).await;
            let options = driver.all_texts(sel::AUTOCOMPLETE_OPTIONS).await?;
            let first = options
                .iter()
                .map(|o| o.trim())
                .find(|o| !o.is_empty())
                .map(str::to_owned)
                .ok_or_else(|| {
                    GatewayError::new(
                        ErrorKind::OptionNotFound,
                        "Truck Plate autocomplete offered no options",
                    )
                })?;
            if !choose_option(driver, AUTOCOMPLETE_PANEL_OPTIONS, &first).await? {
                return Err(GatewayError::new(
                    ErrorKind::OptionNotFound,
                    format!("Truck Plate option \"{first}\" vanished"),
                ));
            }
        } else {
            let plate = sub.data.truck_plate.as_deref().unwrap_or_default();
            driver.type_text(sel::TRUCK_PLATE_INPUT, plate).await?;
            tokio::time::sleep(self.settle).await;
            // Select the matching suggestion when one renders; typing alone
            // satisfies forms that accept free text.
            let _ = choose_option(driver, AUTOCOMPLETE_PANEL_OPTIONS, plate).await;
        }
        Ok(())
    }

    /// Click a checkbox until it reports checked: direct click, then the
    /// JS fallback.
    async fn ensure_checked(
        &self,
        driver: &dyn Drive,
        selector: &str,
    ) -> Result<(), GatewayError> {
        if driver.is_checked(selector).await? {
            return Ok(());
        }
        driver.click(selector).await?;
        if driver.is_checked(selector).await? {
            return Ok(());
        }
        driver.click_js(selector).await?;
        if driver.is_checked(selector).await? {
            return Ok(());
        }
        Err(GatewayError::new(
            ErrorKind::CheckboxStuck,
            format!("checkbox {selector} would not check"),
        ))
    }

    /// Click Next and wait for the stepper to advance. A validation toast
    /// fails immediately; a silent non-advance is retried once by
    /// re-filling the phase from accumulated data.
    async fn advance(
        &self,
        session: &BrowserSession,
        store: &ArtifactStore,
        sub: &SubSession,
    ) -> Result<(), GatewayError> {
        let driver = session.driver.as_ref();
        let from = sub.phase.as_u8();

        for attempt in 0..2 {
            driver.click(sel::NEXT_BUTTON).await?;
            if self.wait_phase_past(driver, from).await? {
                return Ok(());
            }

            if driver.exists(sel::TOAST).await? {
                let message = driver.text_of(sel::TOAST).await?;
                let mut err = GatewayError::new(ErrorKind::Validation, message);
                if let Some(shot) = session.capture(store, "validation-toast").await {
                    err = err.with_screenshot(shot);
                }
                return Err(err);
            }

            if attempt == 0 {
                tracing::warn!(phase = from, "stepper did not advance, re-filling phase");
                self.fill_phase(driver, sub).await?;
            }
        }

        let mut err = GatewayError::new(
            ErrorKind::StepperStuck,
            format!("stepper never left phase {from}"),
        );
        if let Some(shot) = session.capture(store, "stepper-stuck").await {
            err = err.with_screenshot(shot);
        }
        Err(err)
    }

    async fn wait_phase_past(
        &self,
        driver: &dyn Drive,
        from: u8,
    ) -> Result<bool, GatewayError> {
        let deadline = tokio::time::Instant::now() + self.phase_timeout;
        loop {
            let phase = driver
                .attr(sel::ACTIVE_STEP, "aria-posinset")
                .await?
                .and_then(|p| p.parse::<u8>().ok());
            if matches!(phase, Some(p) if p > from) {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn select_dropdown(
        &self,
        driver: &dyn Drive,
        label: &str,
        value: &str,
    ) -> Result<(), GatewayError> {
        let open_js = format!(
            r"(() => {{
                const wanted = {label};
                const labels = Array.from(document.querySelectorAll('mat-form-field label'));
                const target = labels.find(el => el.innerText.trim() === wanted);
                if (!target) return false;
                const field = target.closest('mat-form-field');
                const select = field && field.querySelector('mat-select');
                if (!select) return false;
                select.click();
                return true;
            }})()",
            label = serde_json::to_string(label).unwrap()
        );
        let opened = driver
            .eval(&open_js)
            .await?
            .as_bool()
            .unwrap_or(false);
        if !opened {
            return Err(GatewayError::new(
                ErrorKind::DropdownNotFound,
                format!("no dropdown labelled \"{label}\""),
            ));
        }
        tokio::time::sleep(self.settle).await;

        if !choose_option(driver, SELECT_PANEL_OPTIONS, value).await? {
            return Err(GatewayError::new(
                ErrorKind::OptionNotFound,
                format!("{label} has no option \"{value}\""),
            ));
        }
        Ok(())
    }
}

/// Click the option whose displayed text matches `value` exactly.
async fn choose_option(
    driver: &dyn Drive,
    panel_selector: &str,
    value: &str,
) -> Result<bool, GatewayError> {
    let js = format!(
        r"(() => {{
            const wanted = {value};
            const options = Array.from(document.querySelectorAll({panel}));
            const hit = options.find(el => el.innerText.trim() === wanted);
            if (!hit) return false;
            hit.click();
            return true;
        }})()",
        value = serde_json::to_string(value).unwrap(),
        panel = serde_json::to_string(panel_selector).unwrap(),
    );
    Ok(driver.eval(&js).await?.as_bool().unwrap_or(false))
}
