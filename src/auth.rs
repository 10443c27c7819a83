//! Portal authentication
//!
//! Turns credentials into an authenticated `BrowserSession` parked on the
//! landing page: stealth launch, human-paced form fill, the captcha dance,
//! post-login verification, popup dismissal.

use crate::artifacts::ArtifactStore;
use crate::captcha::CaptchaSolver;
use crate::config::ProxyConfig;
use crate::driver::{CdpDriver, Drive, LaunchOpts};
use crate::error::{ErrorKind, GatewayError};
use crate::portal::{login as sel, urls};
use crate::session::{BrowserSession, Credentials};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Bound on any single page navigation.
const NAV_TIMEOUT: Duration = Duration::from_secs(45);
/// Window in which the captcha widget must reach one of its three outcomes.
const CAPTCHA_OUTCOME_WINDOW: Duration = Duration::from_secs(20);
/// Stuck-spinner recovery: re-click the checkbox this many times, spaced out.
const CHECKBOX_RETRIES: u32 = 3;
const CHECKBOX_RETRY_SPACING: Duration = Duration::from_secs(2);
const POLL: Duration = Duration::from_millis(200);

#[async_trait]
pub trait LoginFlow: Send + Sync {
    /// Produce an authenticated session with its per-session dirs in place.
    async fn login(
        &self,
        credentials: &Credentials,
        session_id: &str,
    ) -> Result<BrowserSession, GatewayError>;
}

pub struct PortalLogin {
    portal_url: String,
    solver: Arc<dyn CaptchaSolver>,
    store: ArtifactStore,
    proxy: Option<ProxyConfig>,
    extension_dir: Option<PathBuf>,
}

impl PortalLogin {
    pub fn new(
        portal_url: String,
        solver: Arc<dyn CaptchaSolver>,
        store: ArtifactStore,
        proxy: Option<ProxyConfig>,
        extension_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            portal_url,
            solver,
            store,
            proxy,
            extension_dir,
        }
    }

    fn portal(&self, path: &str) -> String {
        format!("{}{}", self.portal_url.trim_end_matches('/'), path)
    }

    async fn drive_login(
        &self,
        driver: &dyn Drive,
        credentials: &Credentials,
    ) -> Result<(), GatewayError> {
        let login_url = self.portal(urls::LOGIN_PATH);
        tokio::time::timeout(NAV_TIMEOUT, driver.goto(&login_url))
            .await
            .map_err(|_| GatewayError::new(ErrorKind::LoginTimeout, "login page did not load"))?
            .map_err(GatewayError::from)?;

        wait_visible(driver, sel::USERNAME_INPUT, Duration::from_secs(15))
            .await
            .map_err(|_| {
                GatewayError::new(ErrorKind::LoginTimeout, "login form never rendered")
            })?;

        driver
            .type_human(sel::USERNAME_INPUT, &credentials.username)
            .await?;
        pause_between_fields().await;
        driver
            .type_human(sel::PASSWORD_INPUT, &credentials.password)
            .await?;
        pause_between_fields().await;

        self.solve_captcha(driver, &credentials.captcha_key).await?;

        driver.click(sel::SUBMIT_BUTTON).await?;

        self.verify_logged_in(driver).await?;
        dismiss_popups(driver).await;
        Ok(())
    }

    /// Click the challenge checkbox and wait for one of three outcomes:
    /// solved, audio affordance, or a wedged spinner. The visual image grid
    /// is out of contract and fails the login.
    async fn solve_captcha(
        &self,
        driver: &dyn Drive,
        api_key: &str,
    ) -> Result<(), GatewayError> {
        if !driver.exists(sel::CAPTCHA_CHECKBOX).await? {
            // Some accounts skip the challenge entirely.
            return Ok(());
        }

        let mut clicks = 0;
        loop {
            driver.click(sel::CAPTCHA_CHECKBOX).await?;
            clicks += 1;

            let deadline = tokio::time::Instant::now() + CAPTCHA_OUTCOME_WINDOW;
            while tokio::time::Instant::now() < deadline {
                if driver.exists(sel::CAPTCHA_SUCCESS).await? {
                    return Ok(());
                }
                if driver.is_visible(sel::CAPTCHA_IMAGE_GRID).await? {
                    return Err(GatewayError::new(
                        ErrorKind::CaptchaFailed,
                        "portal served the image-grid challenge",
                    ));
                }
                if driver.is_visible(sel::CAPTCHA_AUDIO_BUTTON).await? {
                    return self.solve_audio(driver, api_key).await;
                }
                tokio::time::sleep(POLL).await;
            }

            // No outcome inside the window: the spinner is stuck.
            if clicks >= CHECKBOX_RETRIES {
                return Err(GatewayError::new(
                    ErrorKind::CaptchaFailed,
                    "challenge spinner never resolved",
                ));
            }
            tracing::debug!(clicks, "captcha spinner stuck, re-clicking checkbox");
            tokio::time::sleep(CHECKBOX_RETRY_SPACING).await;
        }
    }

    async fn solve_audio(&self, driver: &dyn Drive, api_key: &str) -> Result<(), GatewayError> {
        driver.click(sel::CAPTCHA_AUDIO_BUTTON).await?;
        wait_exists(driver, sel::CAPTCHA_AUDIO_SOURCE, Duration::from_secs(10))
            .await
            .map_err(|_| {
                GatewayError::new(ErrorKind::CaptchaFailed, "audio challenge did not appear")
            })?;

        let audio_url = driver
            .eval(&format!(
                "document.querySelector({}).getAttribute('src')",
                serde_json::to_string(sel::CAPTCHA_AUDIO_SOURCE).unwrap()
            ))
            .await?
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| {
                GatewayError::new(ErrorKind::CaptchaFailed, "audio challenge has no source URL")
            })?;

        let transcription = self.solver.transcribe(&audio_url, api_key).await?;
        driver
            .type_human(sel::CAPTCHA_AUDIO_INPUT, &transcription)
            .await?;
        driver.click(sel::CAPTCHA_VERIFY_BUTTON).await?;

        wait_exists(driver, sel::CAPTCHA_SUCCESS, Duration::from_secs(15))
            .await
            .map_err(|_| {
                GatewayError::new(ErrorKind::CaptchaFailed, "transcription was not accepted")
            })
    }

    async fn verify_logged_in(&self, driver: &dyn Drive) -> Result<(), GatewayError> {
        let deadline = tokio::time::Instant::now() + NAV_TIMEOUT;
        loop {
            let url = driver.current_url().await?;
            if url.contains(urls::INVALID_LOGIN_MARKER) {
                return Err(GatewayError::new(
                    ErrorKind::InvalidCredentials,
                    "portal rejected the credentials",
                ));
            }
            if url.contains(urls::LANDING_MARKER) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(GatewayError::new(
                    ErrorKind::LoginTimeout,
                    format!("post-login landing never reached (at {url})"),
                ));
            }
            tokio::time::sleep(POLL).await;
        }
    }
}

#[async_trait]
impl LoginFlow for PortalLogin {
    async fn login(
        &self,
        credentials: &Credentials,
        session_id: &str,
    ) -> Result<BrowserSession, GatewayError> {
        let profile_dir = self
            .store
            .profile_dir(session_id)
            .map_err(|e| GatewayError::new(ErrorKind::DriverStartup, e.to_string()))?;
        let download_dir = self
            .store
            .download_dir(session_id)
            .map_err(|e| GatewayError::new(ErrorKind::DriverStartup, e.to_string()))?;
        let screenshot_dir = self
            .store
            .screenshot_dir(session_id)
            .map_err(|e| GatewayError::new(ErrorKind::DriverStartup, e.to_string()))?;

        let driver = CdpDriver::launch(LaunchOpts {
            profile_dir,
            proxy: self.proxy.clone(),
            extension_dir: self.extension_dir.clone(),
        })
        .await
        .map_err(|e| GatewayError::new(ErrorKind::DriverStartup, e.to_string()))?;

        let mut session = BrowserSession {
            session_id: session_id.to_string(),
            credentials_hash: credentials.pool_key(),
            username: credentials.username.clone(),
            driver: Box::new(driver),
            download_dir,
            screenshot_dir,
        };

        match self.drive_login(session.driver.as_ref(), credentials).await {
            Ok(()) => {
                tracing::info!(session_id, username = %credentials.username, "login complete");
                Ok(session)
            }
            Err(e) => {
                let shot = session.capture(&self.store, "login-failed").await;
                session.close().await;
                self.store.remove_session(session_id);
                tracing::warn!(session_id, error = %e, "login failed");
                match shot {
                    Some(name) => Err(e.with_screenshot(name)),
                    None => Err(e),
                }
            }
        }
    }
}

async fn pause_between_fields() {
    let ms = {
        use rand::Rng;
        rand::thread_rng().gen_range(300..=800)
    };
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

async fn dismiss_popups(driver: &dyn Drive) {
    for selector in sel::POPUP_DISMISSALS {
        match driver.is_visible(selector).await {
            Ok(true) => {
                if let Err(e) = driver.click_js(selector).await {
                    tracing::debug!(selector, error = %e, "popup dismissal failed");
                }
            }
            _ => continue,
        }
    }
}

pub(crate) async fn wait_exists(
    driver: &dyn Drive,
    selector: &str,
    timeout: Duration,
) -> Result<(), GatewayError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if driver.exists(selector).await? {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(GatewayError::new(
                ErrorKind::ElementNotFound,
                format!("timed out waiting for {selector}"),
            ));
        }
        tokio::time::sleep(POLL).await;
    }
}

pub(crate) async fn wait_visible(
    driver: &dyn Drive,
    selector: &str,
    timeout: Duration,
) -> Result<(), GatewayError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if driver.is_visible(selector).await? {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(GatewayError::new(
                ErrorKind::ElementNotFound,
                format!("timed out waiting for visible {selector}"),
            ));
        }
        tokio::time::sleep(POLL).await;
    }
}
