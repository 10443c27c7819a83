//! Browser driving
//!
//! `Drive` is the seam between the page engines and the actual browser.
//! The production implementation (`CdpDriver`) wraps a chromiumoxide
//! `Browser` + `Page`; tests substitute a scripted fake so pool invariants
//! and engine logic run without Chrome.

pub mod proxy_ext;

#[cfg(test)]
pub mod testing;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::browser::{
    SetDownloadBehaviorBehavior, SetDownloadBehaviorParams,
};
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures::StreamExt;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::ProxyConfig;
use crate::error::{ErrorKind, GatewayError};

/// Default viewport dimensions
const VIEWPORT_WIDTH: u32 = 1440;
const VIEWPORT_HEIGHT: u32 = 900;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("failed to launch browser: {0}")]
    Launch(String),

    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("browser operation failed: {0}")]
    Operation(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

impl From<chromiumoxide::error::CdpError> for DriverError {
    fn from(e: chromiumoxide::error::CdpError) -> Self {
        DriverError::Operation(e.to_string())
    }
}

impl From<DriverError> for GatewayError {
    fn from(e: DriverError) -> Self {
        let kind = match &e {
            DriverError::Launch(_) => ErrorKind::DriverStartup,
            DriverError::ElementNotFound(_) => ErrorKind::ElementNotFound,
            DriverError::Timeout(_) => ErrorKind::NavTimeout,
            DriverError::Operation(_) => ErrorKind::Internal,
        };
        GatewayError::new(kind, e.to_string())
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Everything the engines need from a browser. Selector-addressed so the
/// trait stays object-safe; element handles never cross this boundary.
#[async_trait]
pub trait Drive: Send + Sync {
    async fn goto(&self, url: &str) -> DriverResult<()>;

    async fn current_url(&self) -> DriverResult<String>;

    async fn exists(&self, selector: &str) -> DriverResult<bool>;

    /// Present in the DOM and not hidden by display/visibility/opacity.
    async fn is_visible(&self, selector: &str) -> DriverResult<bool>;

    /// CDP-level click; fires the mouse events frameworks listen for.
    async fn click(&self, selector: &str) -> DriverResult<()>;

    /// JS `el.click()` fallback for elements that intercept CDP clicks.
    async fn click_js(&self, selector: &str) -> DriverResult<()>;

    async fn type_text(&self, selector: &str, text: &str) -> DriverResult<()>;

    /// Types with per-keystroke jitter so the input paces like a person.
    async fn type_human(&self, selector: &str, text: &str) -> DriverResult<()>;

    async fn press_key(&self, selector: &str, key: &str) -> DriverResult<()>;

    /// `innerText` of the first match.
    async fn text_of(&self, selector: &str) -> DriverResult<String>;

    /// Attribute of the first match, `None` when absent.
    async fn attr(&self, selector: &str, name: &str) -> DriverResult<Option<String>>;

    /// Checked state of a checkbox/toggle input. Reads the DOM property,
    /// not the attribute; material inputs never update the attribute.
    async fn is_checked(&self, selector: &str) -> DriverResult<bool>;

    /// `innerText` of every match, in document order.
    async fn all_texts(&self, selector: &str) -> DriverResult<Vec<String>>;

    /// Whether any rendered text node contains `needle`.
    async fn find_text(&self, needle: &str) -> DriverResult<bool>;

    /// Center-scroll the first text node containing `needle` into view.
    /// Returns whether it was found.
    async fn scroll_text_into_view(&self, needle: &str) -> DriverResult<bool>;

    /// Click the element owning the first text node containing `needle`.
    /// Returns whether it was found.
    async fn click_text(&self, needle: &str) -> DriverResult<bool>;

    /// Scroll a container by `dy` pixels, dispatching the synthetic
    /// `scroll` and `wheel` events virtual-list libraries listen for.
    async fn scroll_by(&self, selector: &str, dy: i64) -> DriverResult<()>;

    async fn eval(&self, js: &str) -> DriverResult<Value>;

    async fn screenshot_to(&self, path: &Path) -> DriverResult<()>;

    async fn set_download_dir(&self, dir: &Path) -> DriverResult<()>;

    async fn close(&mut self) -> DriverResult<()>;
}

/// JSON-escape a selector for embedding in an eval expression.
fn js_str(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

/// Options for launching a portal browser.
#[derive(Debug, Clone)]
pub struct LaunchOpts {
    /// Unique per-session profile dir; concurrent Chrome processes must not
    /// share one or they collide on the profile lock.
    pub profile_dir: PathBuf,
    pub proxy: Option<ProxyConfig>,
    /// Unpacked extension that answers proxy-auth challenges.
    pub extension_dir: Option<PathBuf>,
}

/// Production driver over chromiumoxide.
pub struct CdpDriver {
    browser: Browser,
    handler_task: JoinHandle<()>,
    page: Page,
}

impl CdpDriver {
    pub async fn launch(opts: LaunchOpts) -> DriverResult<Self> {
        let mut builder = BrowserConfig::builder()
            .new_headless_mode() // --headless=new; the only mode that loads extensions
            .no_sandbox() // Required for running as root / in containers
            .arg("--disable-gpu")
            .arg("--disable-software-rasterizer")
            // Stealth: suppress the automation banner and webdriver flag
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-infobars")
            // Popup / notification suppression
            .arg("--disable-notifications")
            .arg("--disable-popup-blocking")
            .arg("--disable-save-password-bubble")
            .user_data_dir(&opts.profile_dir)
            .viewport(chromiumoxide::handler::viewport::Viewport {
                width: VIEWPORT_WIDTH,
                height: VIEWPORT_HEIGHT,
                device_scale_factor: Some(1.0),
                emulating_mobile: false,
                is_landscape: true,
                has_touch: false,
            });

        if let Some(proxy) = &opts.proxy {
            builder = builder.arg(format!("--proxy-server={}:{}", proxy.host, proxy.port));
        }
        if let Some(ext) = &opts.extension_dir {
            let ext = ext.display();
            builder = builder
                .arg(format!("--disable-extensions-except={ext}"))
                .arg(format!("--load-extension={ext}"));
        }

        let config = builder.build().map_err(DriverError::Launch)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| DriverError::Launch(e.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::warn!(error = %e, "CDP handler error");
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| DriverError::Launch(e.to_string()))?;

        Ok(Self {
            browser,
            handler_task,
            page,
        })
    }
}

#[async_trait]
impl Drive for CdpDriver {
    async fn goto(&self, url: &str) -> DriverResult<()> {
        self.page.goto(url).await?;
        Ok(())
    }

    async fn current_url(&self) -> DriverResult<String> {
        Ok(self
            .page
            .url()
            .await?
            .unwrap_or_else(|| "about:blank".to_string()))
    }

    async fn exists(&self, selector: &str) -> DriverResult<bool> {
        let js = format!("document.querySelector({}) !== null", js_str(selector));
        let result = self.page.evaluate(js).await?;
        Ok(result.into_value::<bool>().unwrap_or(false))
    }

    async fn is_visible(&self, selector: &str) -> DriverResult<bool> {
        let js = format!(
            r"(() => {{
                const el = document.querySelector({sel});
                if (!el) return false;
                const style = window.getComputedStyle(el);
                return style.display !== 'none' &&
                       style.visibility !== 'hidden' &&
                       style.opacity !== '0' &&
                       el.offsetParent !== null;
            }})()",
            sel = js_str(selector)
        );
        let result = self.page.evaluate(js).await?;
        Ok(result.into_value::<bool>().unwrap_or(false))
    }

    async fn click(&self, selector: &str) -> DriverResult<()> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|_| DriverError::ElementNotFound(selector.to_string()))?;
        element.click().await?;
        Ok(())
    }

    async fn click_js(&self, selector: &str) -> DriverResult<()> {
        if !self.exists(selector).await? {
            return Err(DriverError::ElementNotFound(selector.to_string()));
        }
        let js = format!("document.querySelector({}).click()", js_str(selector));
        self.page.evaluate(js).await?;
        Ok(())
    }

    async fn type_text(&self, selector: &str, text: &str) -> DriverResult<()> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|_| DriverError::ElementNotFound(selector.to_string()))?;
        element.click().await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        element.type_str(text).await?;
        Ok(())
    }

    async fn type_human(&self, selector: &str, text: &str) -> DriverResult<()> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|_| DriverError::ElementNotFound(selector.to_string()))?;
        element.click().await?;
        tokio::time::sleep(Duration::from_millis(120)).await;

        for ch in text.chars() {
            element.type_str(ch.to_string()).await?;
            let jitter_ms = {
                use rand::Rng;
                rand::thread_rng().gen_range(50..=250)
            };
            tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
        }
        Ok(())
    }

    async fn press_key(&self, selector: &str, key: &str) -> DriverResult<()> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|_| DriverError::ElementNotFound(selector.to_string()))?;
        element.press_key(key).await?;
        Ok(())
    }

    async fn text_of(&self, selector: &str) -> DriverResult<String> {
        let js = format!(
            r"(() => {{
                const el = document.querySelector({sel});
                return el ? el.innerText : null;
            }})()",
            sel = js_str(selector)
        );
        let result = self.page.evaluate(js).await?;
        match result.value() {
            Some(Value::String(s)) => Ok(s.clone()),
            _ => Err(DriverError::ElementNotFound(selector.to_string())),
        }
    }

    async fn attr(&self, selector: &str, name: &str) -> DriverResult<Option<String>> {
        let js = format!(
            r"(() => {{
                const el = document.querySelector({sel});
                return el ? el.getAttribute({name}) : null;
            }})()",
            sel = js_str(selector),
            name = js_str(name)
        );
        let result = self.page.evaluate(js).await?;
        Ok(result
            .value()
            .and_then(|v| v.as_str())
            .map(str::to_owned))
    }

    async fn is_checked(&self, selector: &str) -> DriverResult<bool> {
        let js = format!(
            "(() => {{ const el = document.querySelector({}); return !!(el && el.checked); }})()",
            js_str(selector)
        );
        let result = self.page.evaluate(js).await?;
        Ok(result.into_value::<bool>().unwrap_or(false))
    }

    async fn all_texts(&self, selector: &str) -> DriverResult<Vec<String>> {
        let js = format!(
            "Array.from(document.querySelectorAll({})).map(el => el.innerText)",
            js_str(selector)
        );
        let result = self.page.evaluate(js).await?;
        Ok(result.into_value::<Vec<String>>().unwrap_or_default())
    }

    async fn find_text(&self, needle: &str) -> DriverResult<bool> {
        let js = format!(
            r"(() => {{
                const needle = {needle};
                const walker = document.createTreeWalker(document.body, NodeFilter.SHOW_TEXT);
                let node;
                while ((node = walker.nextNode())) {{
                    if (node.textContent.includes(needle)) return true;
                }}
                return false;
            }})()",
            needle = js_str(needle)
        );
        let result = self.page.evaluate(js).await?;
        Ok(result.into_value::<bool>().unwrap_or(false))
    }

    async fn scroll_text_into_view(&self, needle: &str) -> DriverResult<bool> {
        let js = format!(
            r"(() => {{
                const needle = {needle};
                const walker = document.createTreeWalker(document.body, NodeFilter.SHOW_TEXT);
                let node;
                while ((node = walker.nextNode())) {{
                    if (node.textContent.includes(needle)) {{
                        node.parentElement.scrollIntoView({{ block: 'center' }});
                        return true;
                    }}
                }}
                return false;
            }})()",
            needle = js_str(needle)
        );
        let result = self.page.evaluate(js).await?;
        Ok(result.into_value::<bool>().unwrap_or(false))
    }

    async fn click_text(&self, needle: &str) -> DriverResult<bool> {
        let js = format!(
            r"(() => {{
                const needle = {needle};
                const walker = document.createTreeWalker(document.body, NodeFilter.SHOW_TEXT);
                let node;
                while ((node = walker.nextNode())) {{
                    if (node.textContent.includes(needle)) {{
                        node.parentElement.scrollIntoView({{ block: 'center' }});
                        node.parentElement.click();
                        return true;
                    }}
                }}
                return false;
            }})()",
            needle = js_str(needle)
        );
        let result = self.page.evaluate(js).await?;
        Ok(result.into_value::<bool>().unwrap_or(false))
    }

    async fn scroll_by(&self, selector: &str, dy: i64) -> DriverResult<()> {
        if !self.exists(selector).await? {
            return Err(DriverError::ElementNotFound(selector.to_string()));
        }
        let js = format!(
            r"(() => {{
                const el = document.querySelector({sel});
                el.scrollTop += {dy};
                el.dispatchEvent(new Event('scroll', {{ bubbles: true }}));
                el.dispatchEvent(new WheelEvent('wheel', {{ deltaY: {dy}, bubbles: true }}));
            }})()",
            sel = js_str(selector),
            dy = dy
        );
        self.page.evaluate(js).await?;
        Ok(())
    }

    async fn eval(&self, js: &str) -> DriverResult<Value> {
        let result = self.page.evaluate(js.to_string()).await?;
        Ok(result.value().cloned().unwrap_or(Value::Null))
    }

    async fn screenshot_to(&self, path: &Path) -> DriverResult<()> {
        let params = ScreenshotParams::builder().build();
        let png = self.page.screenshot(params).await?;
        tokio::fs::write(path, &png)
            .await
            .map_err(|e| DriverError::Operation(format!("write screenshot: {e}")))?;
        Ok(())
    }

    async fn set_download_dir(&self, dir: &Path) -> DriverResult<()> {
        let params = SetDownloadBehaviorParams::builder()
            .behavior(SetDownloadBehaviorBehavior::Allow)
            .download_path(dir.display().to_string())
            .build()
            .map_err(DriverError::Operation)?;
        self.page.execute(params).await?;
        Ok(())
    }

    async fn close(&mut self) -> DriverResult<()> {
        // Best effort; dropping the Browser kills the process either way.
        let _ = self.browser.close().await;
        self.handler_task.abort();
        Ok(())
    }
}
