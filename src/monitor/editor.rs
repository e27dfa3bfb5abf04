//! Remote editor surface
//!
//! The monitor observes the editor through this trait so tests can script
//! editor states. The production implementation drives a browser via
//! WebDriver and reads three configured selectors: the editor textarea,
//! the submit button, and the test result region. It never manipulates the
//! editor beyond the initial navigation.

use super::webdriver::WebDriverClient;
use crate::config::EditorConfig;
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// One observation of the editor surface. `None` fields are selector
/// misses — the monitor treats those as "unchanged" and counts them.
#[derive(Debug, Clone, Default)]
pub struct EditorProbe {
    pub editor_text: Option<String>,
    pub submit_in_flight: Option<bool>,
    pub test_region: Option<String>,
    pub language: Option<String>,
}

#[async_trait]
pub trait EditorSurface: Send {
    /// Navigate the remote session to the editor URL. Called once at
    /// start, and once more on a reconnect attempt.
    async fn navigate(&mut self, url: &str) -> Result<()>;

    /// Read the three configured selectors.
    async fn probe(&mut self) -> Result<EditorProbe>;

    async fn close(&mut self) -> Result<()>;
}

/// WebDriver-backed editor surface.
pub struct WebDriverEditor {
    client: WebDriverClient,
    selectors: EditorConfig,
}

impl WebDriverEditor {
    pub fn new(selectors: EditorConfig, timeout: Duration) -> Result<Self> {
        let client = WebDriverClient::new(&selectors.webdriver_url, timeout)?;
        Ok(Self { client, selectors })
    }
}

#[async_trait]
impl EditorSurface for WebDriverEditor {
    async fn navigate(&mut self, url: &str) -> Result<()> {
        self.client.start_session().await?;
        self.client.navigate(url).await?;
        tracing::info!(%url, "Editor surface navigated");
        Ok(())
    }

    async fn probe(&mut self) -> Result<EditorProbe> {
        let mut result = EditorProbe::default();

        if let Some(editor) = self.client.find_element(&self.selectors.editor_selector).await? {
            result.editor_text = Some(self.client.element_property(&editor, "value").await?);
            result.language = self
                .client
                .element_attribute(&editor, "data-language")
                .await?;
        }

        if let Some(button) = self.client.find_element(&self.selectors.submit_selector).await? {
            // The submit button reflects an in-flight run by disabling
            // itself and swapping its label to "Running...".
            let disabled = self
                .client
                .element_attribute(&button, "disabled")
                .await?
                .is_some();
            let label = self.client.element_text(&button).await?;
            result.submit_in_flight = Some(disabled || label.contains("Running"));
        }

        if let Some(region) = self
            .client
            .find_element(&self.selectors.test_result_selector)
            .await?
        {
            result.test_region = Some(self.client.element_text(&region).await?);
        }

        Ok(result)
    }

    async fn close(&mut self) -> Result<()> {
        self.client.quit().await
    }
}
