//! OS template names: `<os>-<version>-<arch>[-<variant>]`.

// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fmt;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};

use crate::errors::VzttError;

/// Architectures recognized in template names.
pub const ARCHES: &[&str] = &["x86", "i386", "x86_64", "ia64", "aarch64", "ppc64le"];

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TemplateName {
    pub os: String,
    pub version: String,
    pub arch: String,
    /// Non-default OS variant, e.g. `minimal`.
    pub variant: Option<String>,
}

impl TemplateName {
    /// Name of the base template, i.e. without variant.
    pub fn base_name(&self) -> String {
        format!("{}-{}-{}", self.os, self.version, self.arch)
    }

    /// Same base, other variant.
    pub fn with_variant(&self, variant: Option<&str>) -> Self {
        Self {
            variant: variant.map(ToOwned::to_owned),
            ..self.clone()
        }
    }

    /// Same OS and arch, other version.
    pub fn with_version(&self, version: &str) -> Self {
        Self {
            version: version.to_string(),
            variant: None,
            ..self.clone()
        }
    }

    /// `<root>/<os>/<version>/<arch>`
    pub fn base_dir(&self, root: &Utf8Path) -> Utf8PathBuf {
        root.join(&self.os).join(&self.version).join(&self.arch)
    }
}

impl fmt::Display for TemplateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.variant {
            Some(v) => write!(f, "{}-{v}", self.base_name()),
            None => f.write_str(&self.base_name()),
        }
    }
}

impl FromStr for TemplateName {
    type Err = VzttError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || VzttError::InvalidName(s.to_string());
        let parts: Vec<&str> = s.split('-').collect();
        // The first (leftmost) token after os+version which is an arch.
        let arch_idx = parts
            .iter()
            .enumerate()
            .skip(2)
            .find(|(_, p)| ARCHES.contains(p))
            .map(|(i, _)| i)
            .ok_or_else(invalid)?;
        let os = parts[..arch_idx - 1].join("-");
        let version = parts[arch_idx - 1];
        if os.is_empty() || version.is_empty() {
            return Err(invalid());
        }
        let variant = parts[arch_idx + 1..].join("-");
        if arch_idx + 1 < parts.len() && variant.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            os,
            version: version.to_string(),
            arch: parts[arch_idx].to_string(),
            variant: (!variant.is_empty()).then_some(variant),
        })
    }
}
