use std::time::Duration;

use anyhow::Context as _;
use url::Url;

use crate::normalize::RefusalPolicy;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Backend connection settings and flow policies.
#[derive(Debug, Clone)]
pub struct Config {
    /// Always ends with `/` so endpoint names join underneath it.
    pub base_url: Url,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub timeout: Duration,
    pub refusal: RefusalPolicy,
    pub regen_broken_images: bool,
}

impl Config {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        Ok(Self {
            base_url: parse_base_url(base_url)?,
            user: None,
            pass: None,
            timeout: DEFAULT_TIMEOUT,
            refusal: RefusalPolicy::default(),
            regen_broken_images: true,
        })
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let base_url = lookup("STORYFORGE_BASE_URL")
            .context("STORYFORGE_BASE_URL is required to reach the story backend")?;
        let mut config = Self::new(&base_url)
            .with_context(|| format!("invalid STORYFORGE_BASE_URL={base_url:?}"))?;

        config.user = lookup("STORYFORGE_USER").filter(|s| !s.is_empty());
        config.pass = lookup("STORYFORGE_PASS").filter(|s| !s.is_empty());

        if let Some(raw) = lookup("STORYFORGE_TIMEOUT_SECS") {
            let secs: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("invalid STORYFORGE_TIMEOUT_SECS={raw:?}"))?;
            if secs == 0 {
                anyhow::bail!("STORYFORGE_TIMEOUT_SECS must be positive");
            }
            config.timeout = Duration::from_secs(secs);
        }

        if let Some(raw) = lookup("STORYFORGE_REFUSAL_PHRASES") {
            let policy = RefusalPolicy::new(raw.split(',').map(str::to_owned));
            if policy.phrases().is_empty() {
                anyhow::bail!("STORYFORGE_REFUSAL_PHRASES has no phrases");
            }
            config.refusal = policy;
        }

        if let Some(raw) = lookup("STORYFORGE_REGEN_BROKEN_IMAGES") {
            config.regen_broken_images = parse_flag(&raw).with_context(|| {
                format!("invalid STORYFORGE_REGEN_BROKEN_IMAGES={raw:?}. expected true or false")
            })?;
        }

        Ok(config)
    }
}

fn parse_base_url(raw: &str) -> anyhow::Result<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        anyhow::bail!("base url is empty");
    }
    let mut url = Url::parse(trimmed).context("parse base url")?;
    if !matches!(url.scheme(), "http" | "https") {
        anyhow::bail!("unsupported base url scheme: {}", url.scheme());
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn parse_flag(raw: &str) -> anyhow::Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("unsupported flag value: {other}"),
    }
}
