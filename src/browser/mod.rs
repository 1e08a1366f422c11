//! Browser driver adapter
//!
//! One Chrome process per batch worker, driven over CDP. The adapter owns
//! launch configuration (fixed window, certificate tolerance, optional
//! authenticated proxy), the page-open discipline (navigate, poll the tag
//! count until the page has actually rendered, detect failed loads), and
//! the click protocol the pagination handler relies on.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chromiumoxide::Page;
use chromiumoxide::browser::{Browser, BrowserConfigBuilder, HeadlessMode};
use chromiumoxide::cdp::browser_protocol::fetch::{
    AuthChallengeResponse, AuthChallengeResponseResponse, ContinueRequestParams,
    ContinueWithAuthParams, EnableParams as FetchEnableParams, EventAuthRequired,
    EventRequestPaused,
};
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, CaptureScreenshotParams,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::settings::task::Proxy;

/// Driver tuning, loaded from the webscraper settings group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub headless: bool,
    /// Attempts for page readiness and driver startup.
    pub retry_count: usize,
    /// Seconds between readiness polls.
    pub retry_interval: f64,
    /// A page with fewer tags than this has not finished rendering.
    pub tag_count_cutoff: usize,
    /// Seconds to let the in-page translation settle.
    pub translation_delay: f64,
    /// Text markers identifying browser error pages.
    pub failed_load_keys: Vec<String>,
    pub page_load_timeout_secs: u64,
    pub navigation_timeout_secs: u64,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            retry_count: 3,
            retry_interval: 5.0,
            tag_count_cutoff: 50,
            translation_delay: 2.0,
            failed_load_keys: vec![
                "ERR_NAME_NOT_RESOLVED".into(),
                "ERR_CONNECTION".into(),
                "ERR_TIMED_OUT".into(),
                "502 Bad Gateway".into(),
                "504 Gateway".into(),
            ],
            page_load_timeout_secs: 30,
            navigation_timeout_secs: 30,
        }
    }
}

/// Wrap a page operation with an explicit timeout so a wedged renderer
/// cannot hang a worker.
async fn with_page_timeout<F, T>(operation: F, timeout_secs: u64, operation_name: &str) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(Duration::from_secs(timeout_secs), operation).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("{operation_name} timeout after {timeout_secs} seconds")),
    }
}

/// A launched Chrome with its CDP handler task.
pub struct Driver {
    browser: Browser,
    handler: JoinHandle<()>,
    user_data_dir: PathBuf,
    proxy: Option<Proxy>,
}

impl Driver {
    /// Launch Chrome with the fixed scraping profile. The window size is
    /// pinned so local runs render identically to production.
    pub async fn launch(proxy: Option<Proxy>, settings: &BrowserSettings) -> Result<Self> {
        let user_data_dir =
            std::env::temp_dir().join(format!("lotcrawl_chrome_{}_{}", std::process::id(), rand_suffix()));
        std::fs::create_dir_all(&user_data_dir).context("creating browser profile directory")?;

        let mut config_builder = BrowserConfigBuilder::default()
            .request_timeout(Duration::from_secs(30))
            .window_size(1028, 648)
            .user_data_dir(user_data_dir.clone())
            .arg("--ignore-certificate-errors")
            .arg("--ignore-ssl-errors")
            .arg("--lang=en-US")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-notifications")
            .arg("--disable-popup-blocking")
            .arg("--mute-audio");

        if settings.headless {
            config_builder = config_builder.headless_mode(HeadlessMode::default());
        } else {
            config_builder = config_builder.with_head();
        }

        if let Some(proxy) = &proxy {
            config_builder =
                config_builder.arg(format!("--proxy-server=http://{}:{}", proxy.host, proxy.port));
        }

        let config = config_builder
            .build()
            .map_err(|e| anyhow!("failed to build browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("failed to launch browser")?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    let message = e.to_string();
                    // Chrome emits CDP events chromiumoxide does not model;
                    // those deserialization misses are not actionable.
                    if message.contains("data did not match any variant") {
                        trace!("suppressed benign CDP serialization error: {message}");
                    } else {
                        error!("browser handler error: {message}");
                    }
                }
            }
            debug!("browser handler task completed");
        });

        Ok(Self {
            browser,
            handler: handler_task,
            user_data_dir,
            proxy,
        })
    }

    /// Probe whether the browser process still answers CDP commands.
    pub async fn is_alive(&self) -> bool {
        self.browser.version().await.is_ok()
    }

    /// The user agent this browser presents; image downloads reuse it so
    /// sites serve the same bytes they rendered.
    pub async fn user_agent(&self) -> Option<String> {
        self.browser.version().await.ok().map(|v| v.user_agent)
    }

    /// Open a URL in a fresh page and wait for it to actually render:
    /// navigate, then poll the tag count until it clears the cutoff, then
    /// check for browser error markers. One retry on a failed load.
    pub async fn open_page(&self, url: &str, settings: &BrowserSettings) -> Result<PageHandle> {
        let mut last_error = anyhow!("page never opened");

        for attempt in 0..2 {
            let page = match self.new_authenticated_page().await {
                Ok(page) => page,
                Err(e) => {
                    last_error = e;
                    continue;
                }
            };
            let handle = PageHandle { page };

            let navigation = with_page_timeout(
                async {
                    handle.page.goto(url).await.map_err(|e| anyhow!("{e}"))?;
                    Ok(())
                },
                settings.page_load_timeout_secs,
                "page navigation",
            )
            .await;
            if let Err(e) = navigation {
                warn!("navigation failed for {url}: {e}");
                handle.close().await;
                last_error = e;
                continue;
            }

            let loaded = with_page_timeout(
                async {
                    handle
                        .page
                        .wait_for_navigation()
                        .await
                        .map_err(|e| anyhow!("{e}"))?;
                    Ok(())
                },
                settings.navigation_timeout_secs,
                "page load",
            )
            .await;
            if let Err(e) = loaded {
                warn!("page load wait failed for {url}: {e}");
            }

            handle.await_page_ready(url, settings).await;

            if handle.is_failed_load(settings).await {
                warn!("failed to load page {url} (attempt {})", attempt + 1);
                handle.close().await;
                last_error = anyhow!("failed to load page {url}");
                continue;
            }

            return Ok(handle);
        }

        Err(last_error)
    }

    /// New page, with CDP Fetch-domain authentication wired up when the
    /// driver runs behind a credentialed proxy.
    async fn new_authenticated_page(&self) -> Result<Page> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .context("creating page")?;

        if let Some(proxy) = &self.proxy {
            if let Err(e) = enable_proxy_auth(&page, proxy.clone()).await {
                warn!("failed to enable proxy authentication: {e}");
            }
        }

        Ok(page)
    }

    /// Shut the browser down and reap the Chrome process tree. Close is
    /// attempted gracefully first; `wait` reaps the child so no zombie
    /// outlives the run.
    pub async fn quit(mut self) {
        if let Err(e) = self.browser.close().await {
            warn!("failed to close browser gracefully: {e}");
            if let Some(Err(e)) = self.browser.kill().await {
                warn!("failed to kill browser process: {e}");
            }
        }
        if let Err(e) = self.browser.wait().await {
            warn!("failed to reap browser process: {e}");
        }
        self.handler.abort();

        if let Err(e) = std::fs::remove_dir_all(&self.user_data_dir) {
            debug!(
                "failed to remove browser profile {}: {e}",
                self.user_data_dir.display()
            );
        }
    }
}

fn rand_suffix() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
}

/// Answer proxy auth challenges with the configured credentials and let
/// every other intercepted request straight through.
async fn enable_proxy_auth(page: &Page, proxy: Proxy) -> Result<()> {
    page.execute(FetchEnableParams {
        patterns: None,
        handle_auth_requests: Some(true),
    })
    .await
    .context("enabling fetch interception")?;

    let mut auth_events = page
        .event_listener::<EventAuthRequired>()
        .await
        .context("listening for auth challenges")?;
    let mut paused_events = page
        .event_listener::<EventRequestPaused>()
        .await
        .context("listening for paused requests")?;

    let responder = page.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = auth_events.next() => {
                    let Some(event) = event else { break };
                    let params = ContinueWithAuthParams {
                        request_id: event.request_id.clone(),
                        auth_challenge_response: AuthChallengeResponse {
                            response: AuthChallengeResponseResponse::ProvideCredentials,
                            username: Some(proxy.username.clone()),
                            password: Some(proxy.password.clone()),
                        },
                    };
                    if let Err(e) = responder.execute(params).await {
                        debug!("proxy auth response failed: {e}");
                    }
                }
                event = paused_events.next() => {
                    let Some(event) = event else { break };
                    let params = match ContinueRequestParams::builder()
                        .request_id(event.request_id.clone())
                        .build()
                    {
                        Ok(params) => params,
                        Err(_) => continue,
                    };
                    if let Err(e) = responder.execute(params).await {
                        debug!("continuing intercepted request failed: {e}");
                    }
                }
            }
        }
    });

    Ok(())
}

/// One open page of a driver.
pub struct PageHandle {
    page: Page,
}

impl PageHandle {
    /// Serialized page HTML.
    pub async fn html(&self) -> Result<String> {
        self.page.content().await.map_err(|e| anyhow!("{e}"))
    }

    /// Number of elements currently in the page.
    pub async fn count_tags(&self) -> Result<usize> {
        let result = self
            .page
            .evaluate("document.getElementsByTagName('*').length")
            .await
            .map_err(|e| anyhow!("{e}"))?;
        result.into_value::<usize>().map_err(|e| anyhow!("{e}"))
    }

    pub async fn current_url(&self) -> Result<String> {
        let url = self.page.url().await.map_err(|e| anyhow!("{e}"))?;
        url.ok_or_else(|| anyhow!("page has no url"))
    }

    pub async fn user_agent(&self) -> Option<String> {
        self.page
            .evaluate("navigator.userAgent")
            .await
            .ok()
            .and_then(|r| r.into_value::<String>().ok())
    }

    pub async fn screenshot_png(&self) -> Result<Vec<u8>> {
        let params = CaptureScreenshotParams {
            format: Some(CaptureScreenshotFormat::Png),
            capture_beyond_viewport: Some(true),
            ..Default::default()
        };
        self.page
            .screenshot(params)
            .await
            .map_err(|e| anyhow!("failed to capture screenshot: {e}"))
    }

    /// Poll the tag count until the page looks rendered; some sites hand
    /// back a near-empty shell long before their content arrives.
    async fn await_page_ready(&self, url: &str, settings: &BrowserSettings) {
        let mut tag_count = self.count_tags().await.unwrap_or(0);
        for _ in 0..settings.retry_count {
            if tag_count > settings.tag_count_cutoff {
                break;
            }
            info!(
                "page source for {url} has only {tag_count} tags, retrying after {}s...",
                settings.retry_interval
            );
            tokio::time::sleep(Duration::from_secs_f64(settings.retry_interval)).await;
            tag_count = self.count_tags().await.unwrap_or(tag_count);
        }
        info!("found {tag_count} tags for {url}");
    }

    async fn is_failed_load(&self, settings: &BrowserSettings) -> bool {
        let Ok(html) = self.html().await else {
            return true;
        };
        settings.failed_load_keys.iter().any(|key| html.contains(key))
    }

    /// Rewrite relative `href`/`src` attributes to absolute URLs in-page,
    /// so the snapshot carries resolvable links.
    pub async fn absolutize_links(&self, include_images: bool) {
        self.rewrite_links("a", "href").await;
        if include_images {
            self.rewrite_links("img", "src").await;
        }
    }

    async fn rewrite_links(&self, tag_name: &str, attribute: &str) {
        let script = format!(
            r#"
            (function() {{
                let links = document.getElementsByTagName("{tag_name}");
                for (let i = 0; i < links.length; i++) {{
                    try {{
                        links[i].setAttribute("{attribute}", links[i].{attribute});
                    }} catch (e) {{}}
                }}
            }})()
            "#
        );
        if let Err(e) = self.page.evaluate(script).await {
            debug!("failed to absolutize {attribute} on {tag_name}: {e}");
        }
    }

    /// Translate the page in place by injecting the hosted translate
    /// widget, waiting for it to rewrite the DOM, then removing its
    /// scaffolding so it cannot leak into extraction.
    pub async fn translate_page(&self, locale: &str, settings: &BrowserSettings) {
        let source_language = if !locale.is_empty() && locale.len() < 4 {
            locale
        } else {
            "auto"
        };

        let inject = format!(
            r##"
            (function() {{
                let body = document.getElementsByTagName("body")[0];
                body.innerHTML += '<div id="google_translate_element"></div>';

                let translateFunctionScript = document.createElement('script');
                translateFunctionScript.id = 'translateFunctionScript';
                translateFunctionScript.innerHTML = `
                    function googleTranslateElementInit() {{
                        new google.translate.TranslateElement({{
                            pageLanguage: '{source_language}',
                            includedLanguages: 'en',
                            autoDisplay: false,
                            multilanguagePage: false
                        }}, 'google_translate_element');
                        var a = document.querySelector("#google_translate_element select");
                        a.selectedIndex = 0;
                        a.dispatchEvent(new Event('change'));
                    }}
                `;
                body.appendChild(translateFunctionScript);

                let linkScript = document.createElement('script');
                linkScript.src = '//translate.google.com/translate_a/element.js?cb=googleTranslateElementInit';
                linkScript.id = 'linkScript';
                body.appendChild(linkScript);
            }})()
            "##
        );
        if let Err(e) = self.page.evaluate(inject).await {
            warn!("failed to inject translation script: {e}");
            return;
        }

        for attempt in 0..50 {
            match self.page.evaluate("googleTranslateElementInit();").await {
                Ok(_) => {
                    tokio::time::sleep(Duration::from_secs_f64(settings.translation_delay)).await;
                    break;
                }
                Err(_) if attempt == 49 => info!("failed to translate page"),
                Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
            }
        }

        let cleanup = r#"
            (function() {
                let cleanupList = [
                    document.getElementById('google_translate_element'),
                    document.getElementById('translateFunctionScript'),
                    document.getElementById('goog-gt-tt'),
                    document.getElementById('linkScript'),
                    ...document.getElementsByClassName('skiptranslate')
                ];
                for (let i = 0; i < cleanupList.length; i++) {
                    if (cleanupList[i] !== null) {
                        try { cleanupList[i].parentNode.removeChild(cleanupList[i]); } catch (e) {}
                    }
                }
            })()
        "#;
        if let Err(e) = self.page.evaluate(cleanup).await {
            debug!("failed to clean up translation elements: {e}");
        }
    }

    /// Scroll to the bottom of the page, then back up by a small offset so
    /// lazy loaders near the fold still trigger.
    pub async fn scroll_to_bottom(&self, offset: i64) -> Result<()> {
        self.page
            .evaluate(format!(
                "window.scrollTo(0, document.body.scrollHeight); window.scrollBy(0, -{offset});"
            ))
            .await
            .map_err(|e| anyhow!("{e}"))?;
        Ok(())
    }

    /// Click protocol: resolve the selector, scroll it into view, pause,
    /// send Enter. A non-interactable element gets one round of
    /// interaction buttons (overlay dismissal) before the retry; a missing
    /// element is searched for through same-origin iframes. Attempts are
    /// spaced one second apart.
    pub async fn click_selector(
        &self,
        selector: &str,
        interaction_buttons: &[String],
        attempts: usize,
    ) -> bool {
        for attempt in 0..attempts.max(1) {
            if self.try_click(selector, interaction_buttons, 0).await {
                return true;
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        false
    }

    async fn try_click(&self, selector: &str, interaction_buttons: &[String], depth: usize) -> bool {
        match self.page.find_element(selector).await {
            Ok(element) => {
                let _ = element.scroll_into_view().await;
                tokio::time::sleep(Duration::from_millis(500)).await;

                let pressed = match element.focus().await {
                    Ok(focused) => focused.press_key("Enter").await.is_ok(),
                    Err(_) => false,
                };
                if pressed {
                    debug!("clicked {selector}");
                    return true;
                }

                // Probably covered by an overlay; dismiss and retry once.
                if depth == 0 {
                    self.try_interaction_buttons(interaction_buttons).await;
                    return Box::pin(self.try_click(selector, interaction_buttons, depth + 1)).await;
                }
                element.click().await.is_ok()
            }
            Err(_) => {
                // Not in the top document; search same-origin iframes.
                self.click_through_iframes(selector).await
            }
        }
    }

    async fn click_through_iframes(&self, selector: &str) -> bool {
        let Ok(encoded) = serde_json::to_string(selector) else {
            return false;
        };
        let script = format!(
            r#"
            (function() {{
                const sel = {encoded};
                function search(doc) {{
                    let el = doc.querySelector(sel);
                    if (el) {{
                        el.scrollIntoView();
                        el.click();
                        return true;
                    }}
                    for (const frame of doc.querySelectorAll('iframe')) {{
                        try {{
                            if (frame.contentDocument && search(frame.contentDocument)) return true;
                        }} catch (e) {{}}
                    }}
                    return false;
                }}
                return search(document);
            }})()
            "#
        );
        match self.page.evaluate(script).await {
            Ok(result) => result.into_value::<bool>().unwrap_or(false),
            Err(e) => {
                debug!("iframe click for {selector} failed: {e}");
                false
            }
        }
    }

    /// Fire each configured interaction button once; used to clear consent
    /// dialogs and other overlays.
    pub async fn try_interaction_buttons(&self, interaction_buttons: &[String]) -> bool {
        for selector in interaction_buttons {
            debug!("trying interaction button {selector}");
            if let Ok(element) = self.page.find_element(selector.as_str()).await {
                let _ = element.scroll_into_view().await;
                if element.click().await.is_ok() {
                    return true;
                }
            }
        }
        false
    }

    /// Close the page's target; the browser stays up for the next task.
    pub async fn close(&self) {
        if let Err(e) = self.page.clone().close().await {
            debug!("failed to close page: {e}");
        }
    }
}
