//! Client configuration.
//!
//! Every knob lives in [`ClientConfig`], built via [`ClientConfig::builder()`].
//! The CLI maps its flags and `HANDDOC_*` environment variables onto the
//! builder; library users set only what they need.

use crate::error::HandDocError;
use crate::progress::LifecycleObserver;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for a [`crate::JobController`] and its [`crate::HttpBackend`].
///
/// # Example
/// ```rust
/// use handdoc::ClientConfig;
///
/// let config = ClientConfig::builder()
///     .api_base("https://convert.example.com")
///     .poll_interval_ms(1000)
///     .max_polls(60)
///     .build()
///     .unwrap();
/// assert_eq!(config.max_polls, 60);
/// ```
#[derive(Clone)]
pub struct ClientConfig {
    /// Base URL of the application backend. Default: `http://localhost:3000`.
    pub api_base: String,
    /// Sent as `x-api-key` on every request when set.
    pub api_key: Option<String>,
    /// Separate base URL for the export service; falls back to `api_base`.
    pub export_url: Option<String>,
    /// Delay between status polls in milliseconds. Default: 2000.
    pub poll_interval_ms: u64,
    /// Hard ceiling on status polls per job. Default: 150 (five minutes at 2 s).
    pub max_polls: u32,
    /// Budget for starting OCR in seconds. Default: 90.
    pub ocr_timeout_secs: u64,
    /// Budget for one export in seconds. Default: 60.
    pub export_timeout_secs: u64,
    /// Budget for upload, status, checkout and capture calls in seconds. Default: 30.
    pub request_timeout_secs: u64,
    /// Largest accepted upload in bytes. Default: 10 MiB.
    pub max_upload_bytes: u64,
    /// Default OCR mode for new jobs. Default: true.
    pub strict: bool,
    /// Where the job record is kept. `None` uses the platform data directory.
    pub state_dir: Option<PathBuf>,
    /// Receives lifecycle notifications.
    pub observer: Option<Arc<dyn LifecycleObserver>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:3000".to_string(),
            api_key: None,
            export_url: None,
            poll_interval_ms: 2000,
            max_polls: 150,
            ocr_timeout_secs: 90,
            export_timeout_secs: 60,
            request_timeout_secs: 30,
            max_upload_bytes: 10 * 1024 * 1024,
            strict: true,
            state_dir: None,
            observer: None,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("api_base", &self.api_base)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("export_url", &self.export_url)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("max_polls", &self.max_polls)
            .field("ocr_timeout_secs", &self.ocr_timeout_secs)
            .field("export_timeout_secs", &self.export_timeout_secs)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("max_upload_bytes", &self.max_upload_bytes)
            .field("strict", &self.strict)
            .field("state_dir", &self.state_dir)
            .field(
                "observer",
                &self.observer.as_ref().map(|_| "<dyn LifecycleObserver>"),
            )
            .finish()
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn ocr_timeout(&self) -> Duration {
        Duration::from_secs(self.ocr_timeout_secs)
    }

    pub fn export_timeout(&self) -> Duration {
        Duration::from_secs(self.export_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn api_base(mut self, url: impl Into<String>) -> Self {
        self.config.api_base = url.into();
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn export_url(mut self, url: impl Into<String>) -> Self {
        self.config.export_url = Some(url.into());
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn max_polls(mut self, n: u32) -> Self {
        self.config.max_polls = n;
        self
    }

    pub fn ocr_timeout_secs(mut self, secs: u64) -> Self {
        self.config.ocr_timeout_secs = secs;
        self
    }

    pub fn export_timeout_secs(mut self, secs: u64) -> Self {
        self.config.export_timeout_secs = secs;
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = secs;
        self
    }

    pub fn max_upload_bytes(mut self, bytes: u64) -> Self {
        self.config.max_upload_bytes = bytes;
        self
    }

    pub fn strict(mut self, v: bool) -> Self {
        self.config.strict = v;
        self
    }

    pub fn state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.state_dir = Some(dir.into());
        self
    }

    pub fn observer(mut self, observer: Arc<dyn LifecycleObserver>) -> Self {
        self.config.observer = Some(observer);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ClientConfig, HandDocError> {
        let c = &self.config;
        for (name, url) in [("api_base", Some(&c.api_base)), ("export_url", c.export_url.as_ref())] {
            if let Some(url) = url {
                reqwest::Url::parse(url).map_err(|e| {
                    HandDocError::InvalidConfig(format!("{} '{}' is not a URL: {}", name, url, e))
                })?;
            }
        }
        if c.poll_interval_ms == 0 {
            return Err(HandDocError::InvalidConfig(
                "Poll interval must be > 0 ms".into(),
            ));
        }
        if c.max_polls == 0 {
            return Err(HandDocError::InvalidConfig("Max polls must be ≥ 1".into()));
        }
        if c.ocr_timeout_secs == 0 || c.export_timeout_secs == 0 || c.request_timeout_secs == 0 {
            return Err(HandDocError::InvalidConfig(
                "Timeouts must be ≥ 1 second".into(),
            ));
        }
        if c.max_upload_bytes == 0 {
            return Err(HandDocError::InvalidConfig(
                "Max upload size must be > 0 bytes".into(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = ClientConfig::default();
        assert_eq!(c.poll_interval(), Duration::from_secs(2));
        assert_eq!(c.max_upload_bytes, 10 * 1024 * 1024);
        assert!(c.strict);
    }

    #[test]
    fn build_rejects_bad_values() {
        assert!(ClientConfig::builder().max_polls(0).build().is_err());
        assert!(ClientConfig::builder().poll_interval_ms(0).build().is_err());
        assert!(ClientConfig::builder().api_base("not a url").build().is_err());
        assert!(ClientConfig::builder().export_timeout_secs(0).build().is_err());
    }

    #[test]
    fn debug_redacts_api_key() {
        let c = ClientConfig::builder().api_key("secret").build().unwrap();
        let s = format!("{:?}", c);
        assert!(!s.contains("secret"));
    }
}
