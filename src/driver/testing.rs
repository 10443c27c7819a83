//! Scripted fakes for testing without Chrome
//!
//! `FakeDriver` interprets the selectors in `crate::portal` against a small
//! in-memory model of the portal, so login, pool, listing, detail, and
//! wizard logic all run deterministically in unit tests. `FakeLogin` stands
//! in for the real `LoginFlow`.

use super::{Drive, DriverError, DriverResult};
use crate::artifacts::ArtifactStore;
use crate::auth::LoginFlow;
use crate::error::{ErrorKind, GatewayError};
use crate::portal::{detail, listing, login, urls, wizard};
use crate::session::{BrowserSession, Credentials};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const BASE: &str = "https://portal.example.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptchaMode {
    /// No challenge rendered at all.
    Absent,
    /// Checkbox resolves on the first click.
    Instant,
    /// Checkbox offers the audio challenge.
    Audio,
    /// Portal serves the unsolvable image grid.
    ImageGrid,
    /// Spinner swallows this many clicks before resolving.
    StuckThenSolve(u32),
}

/// One scripted portal state. Construct via the scenario helpers, tweak
/// fields directly where a test needs something specific.
pub struct PageScript {
    pub url: String,
    pub alive: bool,
    pub valid_login: bool,
    pub captcha: CaptchaMode,
    pub captcha_solved: bool,
    pub audio_offered: bool,
    pub audio_rendered: bool,
    pub grid_visible: bool,
    pub audio_src: String,

    /// Full dataset behind the virtual list.
    pub rows: Vec<String>,
    /// How many rows are currently rendered.
    pub rendered: usize,
    /// Rows revealed per scroll cycle (0 simulates a dataset that is done).
    pub rows_per_scroll: usize,

    /// Which master-checkbox method (1-4) actually works; None = none do.
    pub master_checkbox_method: Option<u8>,
    pub master_checked: bool,
    pub rows_selected: usize,
    /// File dropped into the download dir when export is clicked.
    pub export_file: Option<String>,
    pub download_dir: Option<PathBuf>,

    pub detail_expanded: Option<String>,
    pub pregate_done: bool,
    /// (milestone, date, completed), newest first as the portal renders it.
    pub timeline: Vec<(String, Option<String>, bool)>,
    pub booking_number: Option<String>,

    pub phase: u8,
    pub dropdowns: HashMap<String, Vec<String>>,
    pub selected: HashMap<String, String>,
    pub open_dropdown: Option<String>,
    /// Next clicks swallowed before the stepper advances.
    pub stuck_next_clicks: u32,
    /// When set, Next never advances and this toast appears instead.
    pub validation_toast: Option<String>,
    pub toast_visible: bool,
    pub own_chassis_checked: bool,
    pub container_checked: bool,
    pub time_options: Vec<String>,
    pub time_panel_open: bool,
    pub plate_options: Vec<String>,
    pub plate_panel_open: bool,
    pub calendar_present: bool,
    pub submit_clicks: u32,

    pub clicks: Vec<String>,
    pub js_clicks: Vec<String>,
    pub typed: HashMap<String, String>,
    pub keys: Vec<(String, String)>,
}

impl Default for PageScript {
    fn default() -> Self {
        Self {
            url: "about:blank".to_string(),
            alive: true,
            valid_login: true,
            captcha: CaptchaMode::Absent,
            captcha_solved: false,
            audio_offered: false,
            audio_rendered: false,
            grid_visible: false,
            audio_src: "https://challenge.example.com/audio.mp3".to_string(),
            rows: Vec::new(),
            rendered: 0,
            rows_per_scroll: 5,
            master_checkbox_method: Some(1),
            master_checked: false,
            rows_selected: 0,
            export_file: None,
            download_dir: None,
            detail_expanded: None,
            pregate_done: false,
            timeline: Vec::new(),
            booking_number: None,
            phase: 1,
            dropdowns: HashMap::new(),
            selected: HashMap::new(),
            open_dropdown: None,
            stuck_next_clicks: 0,
            validation_toast: None,
            toast_visible: false,
            own_chassis_checked: false,
            container_checked: false,
            time_options: Vec::new(),
            time_panel_open: false,
            plate_options: Vec::new(),
            plate_panel_open: false,
            calendar_present: false,
            submit_clicks: 0,
            clicks: Vec::new(),
            js_clicks: Vec::new(),
            typed: HashMap::new(),
            keys: Vec::new(),
        }
    }
}

impl PageScript {
    pub fn login_immediate_captcha_success() -> Self {
        Self {
            captcha: CaptchaMode::Instant,
            ..Self::default()
        }
    }

    pub fn login_audio_captcha() -> Self {
        Self {
            captcha: CaptchaMode::Audio,
            ..Self::default()
        }
    }

    pub fn login_image_grid_captcha() -> Self {
        Self {
            captcha: CaptchaMode::ImageGrid,
            ..Self::default()
        }
    }

    pub fn login_invalid_credentials() -> Self {
        Self {
            captcha: CaptchaMode::Instant,
            valid_login: false,
            ..Self::default()
        }
    }

    /// An already-authenticated session parked on the container listing.
    pub fn logged_in_with_rows(rows: Vec<String>) -> Self {
        let rendered = rows.len().min(8);
        Self {
            url: format!("{BASE}{}", urls::CONTAINERS_PATH),
            rows,
            rendered,
            ..Self::default()
        }
    }

    /// The booking wizard with sane dropdown inventories.
    pub fn wizard() -> Self {
        let mut dropdowns = HashMap::new();
        dropdowns.insert(
            wizard::TRUCKING_COMPANY_LABEL.to_string(),
            vec!["Fast Freight LLC".to_string(), "Harbor Carriers".to_string()],
        );
        dropdowns.insert(
            wizard::TERMINAL_LABEL.to_string(),
            vec!["APM Terminal".to_string(), "TraPac".to_string()],
        );
        dropdowns.insert(
            wizard::MOVE_TYPE_LABEL.to_string(),
            vec!["Pick Full".to_string(), "Drop Empty".to_string()],
        );
        Self {
            url: format!("{BASE}{}", urls::BOOKING_WIZARD_PATH),
            dropdowns,
            time_options: vec![
                "07:00 - 08:00".to_string(),
                "08:00 - 09:00".to_string(),
                "13:00 - 14:00".to_string(),
            ],
            plate_options: vec!["CA-4821".to_string(), "NV-0057".to_string()],
            calendar_present: true,
            ..Self::default()
        }
    }

    fn on_listing_page(&self) -> bool {
        self.url.contains(urls::CONTAINERS_PATH) || self.url.contains(urls::APPOINTMENTS_PATH)
    }

    fn on_login_page(&self) -> bool {
        self.url.contains("login")
    }

    fn results_text(&self) -> String {
        let mut lines = vec!["Container  Size  Status  Last Free Day".to_string()];
        for row in &self.rows[..self.rendered.min(self.rows.len())] {
            lines.push(format!("{row}  40HC  In Yard  N/A"));
        }
        lines.join("\n")
    }
}

/// Clones share state, so a test can keep a handle for assertions after
/// boxing one copy into a `BrowserSession`.
#[derive(Clone)]
pub struct FakeDriver {
    sim: Arc<Mutex<PageScript>>,
}

impl FakeDriver {
    pub fn new(script: PageScript) -> Self {
        Self {
            sim: Arc::new(Mutex::new(script)),
        }
    }

    pub fn typed_into(&self, selector: &str) -> String {
        self.sim
            .lock()
            .unwrap()
            .typed
            .get(selector)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clicked(&self, selector: &str) -> bool {
        let sim = self.sim.lock().unwrap();
        sim.clicks.iter().any(|c| c == selector) || sim.js_clicks.iter().any(|c| c == selector)
    }

    pub fn submit_clicks(&self) -> u32 {
        self.sim.lock().unwrap().submit_clicks
    }

    pub fn selected(&self, label: &str) -> Option<String> {
        self.sim.lock().unwrap().selected.get(label).cloned()
    }

    pub fn rows_selected(&self) -> usize {
        self.sim.lock().unwrap().rows_selected
    }

    fn master_checkbox_click(sim: &mut PageScript, method: u8) {
        if sim.master_checkbox_method == Some(method) {
            sim.master_checked = true;
        }
    }

    fn apply_click(sim: &mut PageScript, selector: &str, via_js: bool) {
        match selector {
            login::CAPTCHA_CHECKBOX => match sim.captcha {
                CaptchaMode::Instant => sim.captcha_solved = true,
                CaptchaMode::Audio => sim.audio_offered = true,
                CaptchaMode::ImageGrid => sim.grid_visible = true,
                CaptchaMode::StuckThenSolve(0) => sim.captcha_solved = true,
                CaptchaMode::StuckThenSolve(n) => {
                    sim.captcha = CaptchaMode::StuckThenSolve(n - 1);
                }
                CaptchaMode::Absent => {}
            },
            login::CAPTCHA_AUDIO_BUTTON => sim.audio_rendered = true,
            login::CAPTCHA_VERIFY_BUTTON => {
                let answer = sim
                    .typed
                    .get(login::CAPTCHA_AUDIO_INPUT)
                    .map(String::as_str)
                    .unwrap_or("");
                sim.captcha_solved = !answer.is_empty();
            }
            login::SUBMIT_BUTTON if sim.on_login_page() => {
                sim.url = if sim.valid_login {
                    format!("{BASE}{}", urls::CONTAINERS_PATH)
                } else {
                    format!("{BASE}/account/login?error=invalid")
                };
            }
            listing::MASTER_CHECKBOX_INPUT => {
                Self::master_checkbox_click(sim, if via_js { 3 } else { 1 });
            }
            listing::MASTER_CHECKBOX_CELL => {
                Self::master_checkbox_click(sim, if via_js { 4 } else { 2 });
            }
            listing::EXPORT_BUTTON => {
                if let (Some(dir), Some(name)) = (&sim.download_dir, &sim.export_file) {
                    let _ = std::fs::write(dir.join(name), b"exported-rows");
                }
            }
            wizard::NEXT_BUTTON => {
                if sim.validation_toast.is_some() {
                    sim.toast_visible = true;
                } else if sim.stuck_next_clicks > 0 {
                    sim.stuck_next_clicks -= 1;
                } else if sim.phase < 3 {
                    sim.phase += 1;
                }
            }
            wizard::SUBMIT_BUTTON => sim.submit_clicks += 1,
            wizard::TIME_DROPDOWN => sim.time_panel_open = true,
            wizard::TRUCK_PLATE_INPUT => sim.plate_panel_open = true,
            wizard::OWN_CHASSIS_TOGGLE | wizard::OWN_CHASSIS_INPUT => {
                sim.own_chassis_checked = !sim.own_chassis_checked;
            }
            wizard::CONTAINER_ROW_CHECKBOX => {
                sim.container_checked = !sim.container_checked;
            }
            other => {
                // Individual row checkboxes from the per-row fallback.
                if other.starts_with("tbody tr:nth-child(") {
                    sim.rows_selected += 1;
                }
            }
        }
    }
}

#[async_trait]
impl Drive for FakeDriver {
    async fn goto(&self, url: &str) -> DriverResult<()> {
        let mut sim = self.sim.lock().unwrap();
        if !sim.alive {
            return Err(DriverError::Operation("browser gone".to_string()));
        }
        sim.url = url.to_string();
        Ok(())
    }

    async fn current_url(&self) -> DriverResult<String> {
        let sim = self.sim.lock().unwrap();
        if !sim.alive {
            return Err(DriverError::Operation("browser gone".to_string()));
        }
        Ok(sim.url.clone())
    }

    async fn exists(&self, selector: &str) -> DriverResult<bool> {
        let sim = self.sim.lock().unwrap();
        Ok(match selector {
            login::USERNAME_INPUT | login::PASSWORD_INPUT => sim.on_login_page(),
            login::SUBMIT_BUTTON => sim.on_login_page(),
            login::CAPTCHA_CHECKBOX => {
                sim.on_login_page() && sim.captcha != CaptchaMode::Absent
            }
            login::CAPTCHA_SUCCESS => sim.captcha_solved,
            login::CAPTCHA_AUDIO_SOURCE => sim.audio_rendered,
            listing::MASTER_CHECKBOX_INPUT
            | listing::MASTER_CHECKBOX_CELL
            | listing::EXPORT_BUTTON
            | listing::RESULTS_PANE => sim.on_listing_page(),
            detail::DETAIL_CARD => sim.detail_expanded.is_some(),
            detail::PREGATE_MILESTONE => sim.detail_expanded.is_some(),
            wizard::TOAST => sim.toast_visible,
            wizard::CALENDAR_ICON => sim.calendar_present && sim.phase == 3,
            wizard::TIME_DROPDOWN => sim.phase == 3,
            wizard::ACTIVE_STEP => !sim.dropdowns.is_empty(),
            other => {
                other == listing::SCROLL_CONTAINERS[0] && sim.on_listing_page()
            }
        })
    }

    async fn is_visible(&self, selector: &str) -> DriverResult<bool> {
        {
            let sim = self.sim.lock().unwrap();
            match selector {
                login::CAPTCHA_AUDIO_BUTTON => return Ok(sim.audio_offered),
                login::CAPTCHA_IMAGE_GRID => return Ok(sim.grid_visible),
                login::CAPTCHA_SPINNER => {
                    return Ok(matches!(sim.captcha, CaptchaMode::StuckThenSolve(_)))
                }
                _ => {}
            }
        }
        self.exists(selector).await
    }

    async fn click(&self, selector: &str) -> DriverResult<()> {
        let mut sim = self.sim.lock().unwrap();
        sim.clicks.push(selector.to_string());
        Self::apply_click(&mut sim, selector, false);
        Ok(())
    }

    async fn click_js(&self, selector: &str) -> DriverResult<()> {
        let mut sim = self.sim.lock().unwrap();
        sim.js_clicks.push(selector.to_string());
        Self::apply_click(&mut sim, selector, true);
        Ok(())
    }

    async fn type_text(&self, selector: &str, text: &str) -> DriverResult<()> {
        let mut sim = self.sim.lock().unwrap();
        sim.typed
            .entry(selector.to_string())
            .or_default()
            .push_str(text);
        if selector == wizard::TRUCK_PLATE_INPUT {
            sim.plate_panel_open = true;
        }
        Ok(())
    }

    async fn type_human(&self, selector: &str, text: &str) -> DriverResult<()> {
        self.type_text(selector, text).await
    }

    async fn press_key(&self, selector: &str, key: &str) -> DriverResult<()> {
        let mut sim = self.sim.lock().unwrap();
        sim.keys.push((selector.to_string(), key.to_string()));
        Ok(())
    }

    async fn text_of(&self, selector: &str) -> DriverResult<String> {
        let sim = self.sim.lock().unwrap();
        match selector {
            listing::RESULTS_PANE => Ok(sim.results_text()),
            wizard::TOAST if sim.toast_visible => Ok(sim
                .validation_toast
                .clone()
                .unwrap_or_else(|| "validation failed".to_string())),
            _ => Ok(String::new()),
        }
    }

    async fn attr(&self, selector: &str, name: &str) -> DriverResult<Option<String>> {
        let sim = self.sim.lock().unwrap();
        match (selector, name) {
            (wizard::ACTIVE_STEP, "aria-posinset") => Ok(Some(sim.phase.to_string())),
            (detail::PREGATE_MILESTONE, "class") => {
                if sim.detail_expanded.is_none() {
                    return Ok(None);
                }
                Ok(Some(if sim.pregate_done {
                    format!("timeline__milestone {}", detail::MILESTONE_DONE_CLASS)
                } else {
                    "timeline__milestone".to_string()
                }))
            }
            _ => Ok(None),
        }
    }

    async fn is_checked(&self, selector: &str) -> DriverResult<bool> {
        let sim = self.sim.lock().unwrap();
        Ok(match selector {
            listing::MASTER_CHECKBOX_INPUT => sim.master_checked,
            wizard::OWN_CHASSIS_INPUT => sim.own_chassis_checked,
            wizard::CONTAINER_ROW_CHECKBOX => sim.container_checked,
            _ => false,
        })
    }

    async fn all_texts(&self, selector: &str) -> DriverResult<Vec<String>> {
        let sim = self.sim.lock().unwrap();
        Ok(match selector {
            wizard::TIME_OPTIONS if sim.time_panel_open => sim.time_options.clone(),
            wizard::AUTOCOMPLETE_OPTIONS if sim.plate_panel_open => sim.plate_options.clone(),
            _ => Vec::new(),
        })
    }

    async fn find_text(&self, needle: &str) -> DriverResult<bool> {
        let sim = self.sim.lock().unwrap();
        Ok(sim.results_text().contains(needle))
    }

    async fn scroll_text_into_view(&self, needle: &str) -> DriverResult<bool> {
        self.find_text(needle).await
    }

    async fn click_text(&self, needle: &str) -> DriverResult<bool> {
        let mut sim = self.sim.lock().unwrap();
        let found = sim.results_text().contains(needle);
        if found {
            sim.detail_expanded = Some(needle.to_string());
        }
        Ok(found)
    }

    async fn scroll_by(&self, selector: &str, _dy: i64) -> DriverResult<()> {
        let mut sim = self.sim.lock().unwrap();
        if !sim.on_listing_page() {
            return Err(DriverError::ElementNotFound(selector.to_string()));
        }
        sim.rendered = (sim.rendered + sim.rows_per_scroll).min(sim.rows.len());
        Ok(())
    }

    async fn eval(&self, js: &str) -> DriverResult<Value> {
        let mut sim = self.sim.lock().unwrap();

        if js.contains("getAttribute('src')") || js.contains("#audio-source") {
            return Ok(Value::String(sim.audio_src.clone()));
        }

        if js.contains("timeline__milestone") {
            let items: Vec<Value> = sim
                .timeline
                .iter()
                .map(|(milestone, date, completed)| {
                    json!({
                        "milestone": milestone,
                        "date": date.clone().unwrap_or_else(|| "N/A".to_string()),
                        "completed": completed,
                    })
                })
                .collect();
            return Ok(Value::Array(items));
        }

        if js.contains(detail::BOOKING_LABEL_TEXT) {
            return Ok(match &sim.booking_number {
                Some(n) => Value::String(n.clone()),
                None => Value::Null,
            });
        }

        // Open a labelled dropdown.
        if js.contains("closest('mat-form-field')") {
            let label = sim
                .dropdowns
                .keys()
                .find(|label| js.contains(label.as_str()))
                .cloned();
            sim.open_dropdown = label.clone();
            return Ok(Value::Bool(label.is_some()));
        }

        // Choose an option from whichever panel is open.
        if js.contains("mat-option") {
            let mut candidates: Vec<(String, String)> = Vec::new();
            if let Some(label) = &sim.open_dropdown {
                if let Some(options) = sim.dropdowns.get(label) {
                    for option in options {
                        candidates.push((label.clone(), option.clone()));
                    }
                }
            }
            if sim.time_panel_open {
                for option in &sim.time_options {
                    candidates.push(("Appointment Time".to_string(), option.clone()));
                }
            }
            if sim.plate_panel_open && js.contains("mat-autocomplete-panel") {
                for option in &sim.plate_options {
                    candidates.push(("Truck Plate".to_string(), option.clone()));
                }
            }
            for (label, option) in candidates {
                if js.contains(&format!("\"{option}\"")) {
                    sim.selected.insert(label, option);
                    sim.open_dropdown = None;
                    return Ok(Value::Bool(true));
                }
            }
            return Ok(Value::Bool(false));
        }

        Ok(Value::Null)
    }

    async fn screenshot_to(&self, path: &Path) -> DriverResult<()> {
        std::fs::write(path, b"\x89PNG\r\n")
            .map_err(|e| DriverError::Operation(e.to_string()))?;
        Ok(())
    }

    async fn set_download_dir(&self, dir: &Path) -> DriverResult<()> {
        self.sim.lock().unwrap().download_dir = Some(dir.to_path_buf());
        Ok(())
    }

    async fn close(&mut self) -> DriverResult<()> {
        self.sim.lock().unwrap().alive = false;
        Ok(())
    }
}

/// Build a `BrowserSession` around a fake driver, returning a shared
/// handle for assertions.
pub fn fake_session(
    session_id: &str,
    store: &ArtifactStore,
    script: PageScript,
) -> (BrowserSession, FakeDriver) {
    let driver = FakeDriver::new(script);
    let session = BrowserSession {
        session_id: session_id.to_string(),
        credentials_hash: "test-hash".to_string(),
        username: "tester".to_string(),
        driver: Box::new(driver.clone()),
        download_dir: store.download_dir(session_id).unwrap(),
        screenshot_dir: store.screenshot_dir(session_id).unwrap(),
    };
    (session, driver)
}

/// Stand-in login flow: vends sessions backed by `FakeDriver`.
pub struct FakeLogin {
    store: ArtifactStore,
    script: Box<dyn Fn() -> PageScript + Send + Sync>,
    fail_with: Mutex<Option<ErrorKind>>,
    pub login_count: AtomicUsize,
    /// Handle to the most recently vended driver.
    pub last_driver: Mutex<Option<FakeDriver>>,
}

impl FakeLogin {
    pub fn new(store: ArtifactStore) -> Self {
        Self::with_script(store, || {
            PageScript::logged_in_with_rows(vec!["MSDU5772413".to_string()])
        })
    }

    pub fn with_script(
        store: ArtifactStore,
        script: impl Fn() -> PageScript + Send + Sync + 'static,
    ) -> Self {
        Self {
            store,
            script: Box::new(script),
            fail_with: Mutex::new(None),
            login_count: AtomicUsize::new(0),
            last_driver: Mutex::new(None),
        }
    }

    /// Make the next login fail with the given kind.
    pub fn fail_next(&self, kind: ErrorKind) {
        *self.fail_with.lock().unwrap() = Some(kind);
    }

    pub fn logins(&self) -> usize {
        self.login_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LoginFlow for FakeLogin {
    async fn login(
        &self,
        credentials: &Credentials,
        session_id: &str,
    ) -> Result<BrowserSession, GatewayError> {
        if let Some(kind) = self.fail_with.lock().unwrap().take() {
            return Err(GatewayError::new(kind, "scripted login failure"));
        }
        self.login_count.fetch_add(1, Ordering::SeqCst);
        let download_dir = self
            .store
            .download_dir(session_id)
            .map_err(|e| GatewayError::internal(e.to_string()))?;
        let screenshot_dir = self
            .store
            .screenshot_dir(session_id)
            .map_err(|e| GatewayError::internal(e.to_string()))?;
        let driver = FakeDriver::new((self.script)());
        *self.last_driver.lock().unwrap() = Some(driver.clone());
        Ok(BrowserSession {
            session_id: session_id.to_string(),
            credentials_hash: credentials.pool_key(),
            username: credentials.username.clone(),
            driver: Box::new(driver),
            download_dir,
            screenshot_dir,
        })
    }
}
