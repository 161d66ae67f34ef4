//! Subscription sources -> flat, deduplicated descriptor strings.

use crate::config::FetchConfig;
use crate::error::{DecodeError, FetchError};
use anyhow::{Context, Result};
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const LENIENT: GeneralPurposeConfig = GeneralPurposeConfig::new()
    .with_decode_padding_mode(DecodePaddingMode::Indifferent)
    .with_decode_allow_trailing_bits(true);
const STANDARD_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, LENIENT);
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, LENIENT);

/// One line of the subscription list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// `http(s)://` document fetched at run time.
    Remote(String),
    /// Base64 blob, or a bare descriptor.
    Inline(String),
}

impl Source {
    pub fn classify(line: &str) -> Self {
        let line = line.trim();
        if line.starts_with("http") {
            Source::Remote(line.to_string())
        } else {
            Source::Inline(line.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Source::Remote(s) | Source::Inline(s) => s,
        }
    }
}

/// Per-source outcome, kept for reporting which sources still work.
#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub source: String,
    pub descriptors: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DecodedSources {
    /// Unique descriptors in first-seen order.
    pub descriptors: Vec<String>,
    pub reports: Vec<SourceReport>,
}

impl DecodedSources {
    /// Sources that produced at least one descriptor.
    pub fn valid_sources(&self) -> impl Iterator<Item = &str> {
        self.reports
            .iter()
            .filter(|r| r.error.is_none() && r.descriptors > 0)
            .map(|r| r.source.as_str())
    }

    /// Sources that errored or decoded to nothing.
    pub fn failed_sources(&self) -> impl Iterator<Item = &SourceReport> {
        self.reports
            .iter()
            .filter(|r| r.error.is_some() || r.descriptors == 0)
    }
}

/// Retrieves a remote subscription body.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<String, FetchError>> + Send;
}

/// `reqwest`-backed fetcher.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(cfg: &FetchConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout())
            .user_agent(cfg.user_agent.clone())
            .build()?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        Ok(resp.text().await?)
    }
}

/// Split a subscription list into sources. Blank lines and `#` comments are
/// skipped; order is preserved.
pub fn parse_source_list(s: &str) -> Vec<Source> {
    s.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(Source::classify)
        .collect()
}

/// Load a subscription list from a file path.
pub fn load_source_list(path: impl AsRef<Path>) -> Result<Vec<Source>> {
    let content = fs::read_to_string(path.as_ref()).with_context(|| {
        format!("failed to read subscription file: {}", path.as_ref().display())
    })?;
    Ok(parse_source_list(&content))
}

/// Decode base64 text, accepting either alphabet, missing padding and
/// embedded whitespace.
pub fn decode_base64_text(s: &str) -> Result<String, DecodeError> {
    let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    let mut padded = compact.trim_end_matches('=').to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }
    let bytes = STANDARD_LENIENT
        .decode(&padded)
        .or_else(|_| URL_SAFE_LENIENT.decode(&padded))?;
    Ok(String::from_utf8(bytes)?)
}

/// Turn a subscription body into descriptor lines: base64 first, plain
/// newline-delimited text when that fails or yields nothing.
pub fn decode_body(body: &str) -> Vec<String> {
    if let Ok(decoded) = decode_base64_text(body) {
        let lines = descriptor_lines(&decoded);
        if !lines.is_empty() {
            return lines;
        }
    }
    descriptor_lines(body)
}

fn descriptor_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Fetch with up to `cfg.retries` attempts, doubling the delay between them.
/// Gives up with `FetchError::Cancelled` as soon as `cancel` fires.
pub async fn fetch_with_retry<F: Fetcher>(
    fetcher: &F,
    url: &str,
    cfg: &FetchConfig,
    cancel: &CancellationToken,
) -> Result<String, FetchError> {
    let attempts = cfg.retries.max(1);
    let mut delay = cfg.base_delay();
    let mut last = String::new();

    for attempt in 1..=attempts {
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            fetched = fetcher.fetch(url) => fetched,
        };
        match fetched {
            Ok(body) => return Ok(body),
            Err(e) => {
                debug!(url, attempt, error = %e, "subscription fetch failed");
                last = e.to_string();
                if attempt < attempts {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = delay.saturating_mul(2).min(Duration::from_secs(60));
                }
            }
        }
    }

    Err(FetchError::Exhausted {
        url: url.to_string(),
        attempts,
        last,
    })
}

/// Resolve every source into one deduplicated descriptor list. A failing
/// source is reported and skipped; it never aborts the others.
pub async fn collect_descriptors<F: Fetcher>(
    sources: &[Source],
    fetcher: &F,
    cfg: &FetchConfig,
    cancel: &CancellationToken,
) -> DecodedSources {
    let mut out = DecodedSources::default();
    let mut seen = HashSet::new();

    for (idx, source) in sources.iter().enumerate() {
        if cancel.is_cancelled() {
            warn!("stopped before source {}/{}", idx + 1, sources.len());
            break;
        }
        let lines = match source {
            Source::Remote(url) => match fetch_with_retry(fetcher, url, cfg, cancel).await {
                Ok(body) => Ok(decode_body(&body)),
                Err(e) => Err(e),
            },
            Source::Inline(blob) => Ok(decode_body(blob)),
        };

        match lines {
            Ok(lines) => {
                info!(
                    "source {}/{} yielded {} descriptor(s)",
                    idx + 1,
                    sources.len(),
                    lines.len()
                );
                out.reports.push(SourceReport {
                    source: source.as_str().to_string(),
                    descriptors: lines.len(),
                    error: None,
                });
                for line in lines {
                    if seen.insert(line.clone()) {
                        out.descriptors.push(line);
                    }
                }
            }
            Err(e) => {
                warn!("source {}/{} skipped: {e}", idx + 1, sources.len());
                out.reports.push(SourceReport {
                    source: source.as_str().to_string(),
                    descriptors: 0,
                    error: Some(e.to_string()),
                });
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_body_decodes_before_plain_fallback() {
        assert_eq!(decode_body("aHR0cDovL2V4YW1wbGUuY29t"), vec!["http://example.com"]);
    }

    #[test]
    fn plain_body_falls_back_to_lines() {
        let body = "vless://a@1.1.1.1:443#x\n\n# note\n  trojan://b@2.2.2.2:443  \n";
        assert_eq!(
            decode_body(body),
            vec!["vless://a@1.1.1.1:443#x", "trojan://b@2.2.2.2:443"]
        );
    }

    #[test]
    fn base64_tolerates_wrapping_missing_padding_and_url_safe() {
        // "hello?>" -> standard "aGVsbG8/Pg==", url-safe "aGVsbG8_Pg"
        assert_eq!(decode_base64_text("aGVs\nbG8/Pg").unwrap(), "hello?>");
        assert_eq!(decode_base64_text("aGVsbG8_Pg").unwrap(), "hello?>");
        assert!(decode_base64_text("vless://x@y").is_err());
    }

    #[test]
    fn source_list_skips_comments_and_blanks() {
        let input = r#"
            # feeds
            https://sub.example/a

            dmxlc3M6Ly9hQGI6NDQz
            # trailing comment
        "#;
        let sources = parse_source_list(input);
        assert_eq!(
            sources,
            vec![
                Source::Remote("https://sub.example/a".into()),
                Source::Inline("dmxlc3M6Ly9hQGI6NDQz".into()),
            ]
        );
    }

    #[test]
    fn decoding_is_idempotent() {
        let body = "dmxlc3M6Ly9hQGI6NDQzCnRyb2phbjovL2NAZDo0NDM=";
        assert_eq!(decode_body(body), decode_body(body));
        assert_eq!(decode_body(body), vec!["vless://a@b:443", "trojan://c@d:443"]);
    }
}
