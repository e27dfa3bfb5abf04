//! Minimal W3C WebDriver client
//!
//! Just the verbs the code monitor needs: session create, navigate, find
//! element by CSS selector, read text/attribute/property. Speaks plain
//! HTTP+JSON to a chromedriver-compatible endpoint; no protocol extensions.

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

/// Key under which the WebDriver protocol nests element ids.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

#[derive(Debug, Clone)]
pub struct ElementRef(String);

#[derive(Debug, Deserialize)]
struct WireValue {
    value: Value,
}

pub struct WebDriverClient {
    http: Client,
    base: String,
    session: Option<String>,
}

impl std::fmt::Debug for WebDriverClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebDriverClient")
            .field("base", &self.base)
            .field("session", &self.session)
            .finish()
    }
}

impl WebDriverClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build WebDriver HTTP client")?;
        Ok(Self {
            http,
            base: base_url.trim_end_matches('/').to_string(),
            session: None,
        })
    }

    fn session_id(&self) -> Result<&str> {
        self.session
            .as_deref()
            .context("WebDriver session not started")
    }

    /// Create a headless browser session.
    pub async fn start_session(&mut self) -> Result<()> {
        let body = json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": {
                        "args": [
                            "--headless=new",
                            "--no-sandbox",
                            "--disable-gpu",
                            "--window-size=1920,1080",
                            "--disable-notifications",
                        ]
                    }
                }
            }
        });
        let response: WireValue = self
            .http
            .post(format!("{}/session", self.base))
            .json(&body)
            .send()
            .await
            .context("WebDriver session create failed")?
            .error_for_status()?
            .json()
            .await?;

        let session_id = response.value["sessionId"]
            .as_str()
            .context("WebDriver response missing sessionId")?
            .to_string();
        tracing::info!(session_id = %session_id, "WebDriver session started");
        self.session = Some(session_id);
        Ok(())
    }

    pub async fn navigate(&self, url: &str) -> Result<()> {
        let sid = self.session_id()?;
        self.http
            .post(format!("{}/session/{sid}/url", self.base))
            .json(&json!({ "url": url }))
            .send()
            .await
            .with_context(|| format!("WebDriver navigate to {url} failed"))?
            .error_for_status()?;
        Ok(())
    }

    /// Find one element by CSS selector. `Ok(None)` on a selector miss.
    pub async fn find_element(&self, css: &str) -> Result<Option<ElementRef>> {
        let sid = self.session_id()?;
        let response = self
            .http
            .post(format!("{}/session/{sid}/element", self.base))
            .json(&json!({ "using": "css selector", "value": css }))
            .send()
            .await
            .with_context(|| format!("WebDriver find element {css} failed"))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let parsed: WireValue = response.error_for_status()?.json().await?;
        match parsed.value.get(ELEMENT_KEY).and_then(|v| v.as_str()) {
            Some(id) => Ok(Some(ElementRef(id.to_string()))),
            None => Ok(None),
        }
    }

    pub async fn element_text(&self, element: &ElementRef) -> Result<String> {
        let sid = self.session_id()?;
        let parsed: WireValue = self
            .http
            .get(format!(
                "{}/session/{sid}/element/{}/text",
                self.base, element.0
            ))
            .send()
            .await
            .context("WebDriver element text failed")?
            .error_for_status()?
            .json()
            .await?;
        Ok(parsed.value.as_str().unwrap_or_default().to_string())
    }

    /// DOM property (`value` for textareas — attributes lag user input).
    pub async fn element_property(&self, element: &ElementRef, name: &str) -> Result<String> {
        let sid = self.session_id()?;
        let parsed: WireValue = self
            .http
            .get(format!(
                "{}/session/{sid}/element/{}/property/{name}",
                self.base, element.0
            ))
            .send()
            .await
            .context("WebDriver element property failed")?
            .error_for_status()?
            .json()
            .await?;
        Ok(parsed.value.as_str().unwrap_or_default().to_string())
    }

    pub async fn element_attribute(
        &self,
        element: &ElementRef,
        name: &str,
    ) -> Result<Option<String>> {
        let sid = self.session_id()?;
        let parsed: WireValue = self
            .http
            .get(format!(
                "{}/session/{sid}/element/{}/attribute/{name}",
                self.base, element.0
            ))
            .send()
            .await
            .context("WebDriver element attribute failed")?
            .error_for_status()?
            .json()
            .await?;
        Ok(parsed.value.as_str().map(str::to_string))
    }

    pub async fn quit(&mut self) -> Result<()> {
        if let Some(sid) = self.session.take() {
            let _ = self
                .http
                .delete(format!("{}/session/{sid}", self.base))
                .send()
                .await;
            tracing::debug!("WebDriver session closed");
        }
        Ok(())
    }
}
