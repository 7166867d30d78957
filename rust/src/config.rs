//! Host-wide configuration from `/etc/vztt/vztt.conf` and the URL map.

// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::HashMap;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use ini::Ini;

/// Location of the global configuration file.
pub const VZTT_CONF: &str = "/etc/vztt/vztt.conf";
/// Default location of the repository URL map.
pub const URL_MAP: &str = "/etc/vztt/url.map";
/// Default template root.
pub const DEFAULT_TEMPLATE_ROOT: &str = "/vz/template";
/// Metadata older than this (in seconds) is refreshed.
pub const DEFAULT_METADATA_EXPIRE: u64 = 86400;
/// Template-area lock timeout in seconds.
pub const DEFAULT_LOCK_TIMEOUT: u64 = 600;

/// Proxy used by all backends for metadata and package downloads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Proxy {
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalConfig {
    pub template_root: Utf8PathBuf,
    pub cache_dir: Utf8PathBuf,
    pub proxy: Option<Proxy>,
    pub exclude: Vec<String>,
    pub metadata_expire: u64,
    pub app_autodetect: bool,
    pub lock_timeout: u64,
    pub url_map: HashMap<String, String>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        let template_root = Utf8PathBuf::from(DEFAULT_TEMPLATE_ROOT);
        Self {
            cache_dir: template_root.join("cache"),
            template_root,
            proxy: None,
            exclude: Vec::new(),
            metadata_expire: DEFAULT_METADATA_EXPIRE,
            app_autodetect: true,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            url_map: HashMap::new(),
        }
    }
}

/// Shell-style booleans as found in vz configuration files.
pub(crate) fn is_true(s: &str) -> bool {
    matches!(s, "1" | "yes" | "true" | "on")
}

impl GlobalConfig {
    /// Load the configuration from the default location; a missing file
    /// yields the defaults.
    pub fn load_default() -> Result<Self> {
        let path = Utf8Path::new(VZTT_CONF);
        if !path.try_exists()? {
            tracing::debug!("{VZTT_CONF} not found, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    #[context("Loading {path}")]
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&contents)?;
        let map_path = Ini::load_from_str(&contents)?
            .general_section()
            .get("URL_MAP")
            .map(Utf8PathBuf::from)
            .unwrap_or_else(|| Utf8PathBuf::from(URL_MAP));
        if map_path.try_exists()? {
            let map = std::fs::read_to_string(&map_path)
                .with_context(|| format!("Reading {map_path}"))?;
            config.url_map = parse_url_map(&map);
        }
        Ok(config)
    }

    /// Parse `KEY=VALUE` configuration text.
    pub fn parse(contents: &str) -> Result<Self> {
        let i = Ini::load_from_str(contents).context("Parsing vztt.conf")?;
        let general = i.general_section();
        let mut config = Self::default();
        if let Some(root) = general.get("TEMPLATE") {
            config.template_root = root.into();
            config.cache_dir = config.template_root.join("cache");
        }
        if let Some(cache) = general.get("CACHE") {
            config.cache_dir = cache.into();
        }
        if let Some(url) = general.get("VZTT_PROXY").filter(|s| !s.is_empty()) {
            config.proxy = Some(Proxy {
                url: url.to_string(),
                user: general.get("PROXY_USER").map(ToOwned::to_owned),
                password: general.get("PROXY_PASSWORD").map(ToOwned::to_owned),
            });
        }
        if let Some(exclude) = general.get("EXCLUDE") {
            config.exclude = exclude.split_whitespace().map(ToOwned::to_owned).collect();
        }
        if let Some(v) = general.get("METADATA_EXPIRE") {
            config.metadata_expire = v
                .parse()
                .with_context(|| format!("Invalid METADATA_EXPIRE: {v}"))?;
        }
        if let Some(v) = general.get("APP_TEMPLATE_AUTODETECTION") {
            config.app_autodetect = is_true(v);
        }
        if let Some(v) = general.get("LOCK_TIMEOUT") {
            config.lock_timeout = v
                .parse()
                .with_context(|| format!("Invalid LOCK_TIMEOUT: {v}"))?;
        }
        Ok(config)
    }

    /// Substitute `${KEY}` references from the URL map in a repository line.
    pub fn expand_url(&self, line: &str) -> Result<String> {
        if !line.contains("${") {
            return Ok(line.to_string());
        }
        envsubst::substitute(line, &self.url_map)
            .map_err(|e| anyhow::anyhow!("Expanding {line}: {e}"))
    }
}

fn parse_url_map(contents: &str) -> HashMap<String, String> {
    contents
        .lines()
        .map(|l| l.split('#').next().unwrap_or_default().trim())
        .filter_map(|l| l.split_once(char::is_whitespace))
        .map(|(k, v)| (k.trim_start_matches('$').to_string(), v.trim().to_string()))
        .collect()
}
