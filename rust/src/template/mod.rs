//! Template records and their loading from a template's config directory.
//!
//! There are three kinds of template: the base OS template identifying
//! a distribution, the OS variants refining it, and application
//! templates layered on top.  All of them embed a [`TemplateAttrs`]
//! and are accessed through the [`Describable`] and [`RepositoryHolder`]
//! traits.  Which files get read is controlled by a [`LoadMask`].

// SPDX-License-Identifier: Apache-2.0 OR MIT

use anyhow::{Context, Result};
use bitflags::bitflags;
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::cache::CacheFormat;
use crate::errors::VzttError;
use crate::names::TemplateName;
use crate::pm::BackendKind;

pub mod set;
pub use set::*;

/// Name of the default OS variant directory.
pub const DEFAULT_VARIANT: &str = "default";
/// Marker file disabling package operations for a template.
pub const NO_PKG_ACTIONS: &str = "no_pkgs_actions";

bitflags! {
    /// Selects which files get loaded, and for template sets whether
    /// variants and application templates are discovered.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LoadMask: u32 {
        const PACKAGES = 1 << 0;
        const REPOSITORIES = 1 << 1;
        const DESCRIPTION = 1 << 2;
        const GOLDEN_IMAGE = 1 << 3;
        const ENVIRONMENT = 1 << 4;
        const ARCH_PACKAGES = 1 << 5;
        const DISTRIBUTION = 1 << 6;
        const TECHNOLOGIES = 1 << 7;
        const UPGRADABLE = 1 << 8;
        const CACHE_TYPE = 1 << 9;
        /// Discover all OS variants of the base.
        const OS_LIST = 1 << 16;
        /// Discover the application templates of the base.
        const APP_LIST = 1 << 17;
        /// What nearly every package operation needs.
        const MINIMAL = Self::PACKAGES.bits() | Self::REPOSITORIES.bits()
            | Self::TECHNOLOGIES.bits();
        const FIELDS = 0xffff;
    }
}

bitflags! {
    /// Container technologies a template requires.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Technologies: u32 {
        const X86 = 1 << 0;
        const X86_64 = 1 << 1;
        const IA64 = 1 << 2;
        const NPTL = 1 << 3;
        const SYSFS = 1 << 4;
        const NFS = 1 << 5;
        const FUSE = 1 << 6;
        const VE0 = 1 << 7;
    }
}

const TECHNOLOGY_NAMES: &[(&str, Technologies)] = &[
    ("x86", Technologies::X86),
    ("x86_64", Technologies::X86_64),
    ("ia64", Technologies::IA64),
    ("nptl", Technologies::NPTL),
    ("sysfs", Technologies::SYSFS),
    ("nfs", Technologies::NFS),
    ("fuse", Technologies::FUSE),
    ("ve0", Technologies::VE0),
];

impl Technologies {
    /// Parse whitespace-separated technology names; an unknown name is fatal.
    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        names.into_iter().try_fold(Self::empty(), |acc, name| {
            TECHNOLOGY_NAMES
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, t)| acc | *t)
                .ok_or_else(|| VzttError::UnknownTechnology(name.to_string()).into())
        })
    }

    pub fn names(&self) -> Vec<&'static str> {
        TECHNOLOGY_NAMES
            .iter()
            .filter(|(_, t)| self.contains(*t))
            .map(|(n, _)| *n)
            .collect()
    }
}

/// Attributes shared by every kind of template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateAttrs {
    pub name: String,
    pub confdir: Utf8PathBuf,
    pub summary: String,
    pub description: String,
    pub packages: Vec<String>,
    pub repositories: Vec<String>,
    pub zypp_repositories: Vec<String>,
    pub mirrorlist: Vec<String>,
    /// Template that scripts and attributes fall back to; `None` for a base.
    pub parent: Option<String>,
    pub golden_image: bool,
    pub no_pkg_actions: bool,
}

/// Attributes of OS templates (base and variants).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsAttrs {
    pub environment: Vec<(String, String)>,
    /// Extra packages for 32-bit containers.
    pub packages_0: Vec<String>,
    /// Extra packages for 64-bit containers.
    pub packages_1: Vec<String>,
}

impl OsAttrs {
    /// The architecture-conditional package list for `tech`.
    pub fn arch_packages(&self, tech: Technologies) -> &[String] {
        if tech.contains(Technologies::X86_64) {
            &self.packages_1
        } else {
            &self.packages_0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseTemplate {
    pub attrs: TemplateAttrs,
    pub os: OsAttrs,
    pub tname: TemplateName,
    pub basedir: Utf8PathBuf,
    pub package_manager: String,
    pub backend: BackendKind,
    pub distribution: Option<String>,
    pub osrelease: Option<String>,
    pub technologies: Technologies,
    pub upgradable_versions: Vec<String>,
    pub cache_type: CacheFormat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsTemplate {
    pub attrs: TemplateAttrs,
    pub os: OsAttrs,
    pub variant: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppTemplate {
    pub attrs: TemplateAttrs,
}

/// Name, description and config directory of a template.
pub trait Describable {
    fn attrs(&self) -> &TemplateAttrs;

    fn name(&self) -> &str {
        &self.attrs().name
    }

    fn summary(&self) -> &str {
        &self.attrs().summary
    }

    fn description(&self) -> &str {
        &self.attrs().description
    }

    fn confdir(&self) -> &Utf8Path {
        &self.attrs().confdir
    }

    fn packages(&self) -> &[String] {
        &self.attrs().packages
    }
}

/// The repository collections of a template.
pub trait RepositoryHolder: Describable {
    fn repositories(&self) -> &[String] {
        &self.attrs().repositories
    }

    fn zypp_repositories(&self) -> &[String] {
        &self.attrs().zypp_repositories
    }

    fn mirrorlist(&self) -> &[String] {
        &self.attrs().mirrorlist
    }

    /// Templates without any repository have no metadata of their own.
    fn has_repositories(&self) -> bool {
        !(self.repositories().is_empty()
            && self.zypp_repositories().is_empty()
            && self.mirrorlist().is_empty())
    }

    /// Order-independent identity of the repository and mirror-list set.
    fn repository_key(&self) -> RepositoryKey {
        let sorted = |v: &[String]| {
            let mut v = v.to_vec();
            v.sort();
            v
        };
        RepositoryKey {
            repositories: sorted(self.repositories()),
            zypp_repositories: sorted(self.zypp_repositories()),
            mirrorlist: sorted(self.mirrorlist()),
        }
    }
}

/// Sorted repository collections; equal keys mean equal multisets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepositoryKey {
    pub repositories: Vec<String>,
    pub zypp_repositories: Vec<String>,
    pub mirrorlist: Vec<String>,
}

macro_rules! impl_template {
    ($t:ty) => {
        impl Describable for $t {
            fn attrs(&self) -> &TemplateAttrs {
                &self.attrs
            }
        }
        impl RepositoryHolder for $t {}
    };
}
impl_template!(BaseTemplate);
impl_template!(OsTemplate);
impl_template!(AppTemplate);

/// Read a line-oriented template file: `#` comments are stripped, lines
/// trimmed and blank lines dropped.  A missing file is `None`.
pub(crate) fn read_list(dir: &Utf8Path, file: &str) -> Result<Option<Vec<String>>> {
    let path = dir.join(file);
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Reading {path}")),
    };
    Ok(Some(
        contents
            .lines()
            .map(|l| l.split('#').next().unwrap_or_default().trim())
            .filter(|l| !l.is_empty())
            .map(ToOwned::to_owned)
            .collect(),
    ))
}

/// Like [`read_list`] but drops duplicates, keeping first occurrences.
fn read_unique(dir: &Utf8Path, file: &str) -> Result<Vec<String>> {
    let mut seen = std::collections::HashSet::new();
    Ok(read_list(dir, file)?
        .unwrap_or_default()
        .into_iter()
        .filter(|l| seen.insert(l.clone()))
        .collect())
}

fn read_text(dir: &Utf8Path, file: &str) -> Result<String> {
    Ok(read_list(dir, file)?.unwrap_or_default().join("\n"))
}

fn read_first(dir: &Utf8Path, file: &str) -> Result<Option<String>> {
    Ok(read_list(dir, file)?.and_then(|l| l.into_iter().next()))
}

fn broken(name: &str, reason: impl Into<String>) -> anyhow::Error {
    let reason = reason.into();
    tracing::error!("Broken template {name}: {reason}");
    VzttError::BrokenTemplate {
        name: name.to_string(),
        reason,
    }
    .into()
}

impl TemplateAttrs {
    #[context("Loading template {name} from {confdir}")]
    fn load(
        name: &str,
        confdir: &Utf8Path,
        parent: Option<&str>,
        mask: LoadMask,
    ) -> Result<Self> {
        if !confdir.try_exists()? {
            return Err(VzttError::TemplateNotFound(name.to_string()).into());
        }
        let packages = read_list(confdir, "packages")?
            .ok_or_else(|| broken(name, format!("{confdir}/packages is missing")))?;
        let mut attrs = TemplateAttrs {
            name: name.to_string(),
            confdir: confdir.to_owned(),
            packages,
            parent: parent.map(ToOwned::to_owned),
            no_pkg_actions: confdir.join(NO_PKG_ACTIONS).try_exists()?,
            golden_image: true,
            ..Default::default()
        };
        if mask.contains(LoadMask::REPOSITORIES) {
            attrs.repositories = read_unique(confdir, "repositories")?;
            attrs.zypp_repositories = read_unique(confdir, "zypp_repositories")?;
            attrs.mirrorlist = read_unique(confdir, "mirrorlist")?;
        }
        if mask.contains(LoadMask::DESCRIPTION) {
            attrs.summary = read_text(confdir, "summary")?;
            attrs.description = read_text(confdir, "description")?;
        }
        if mask.contains(LoadMask::GOLDEN_IMAGE) {
            // Golden image is opt-out
            attrs.golden_image = read_first(confdir, "golden_image")?
                .map(|v| !matches!(v.as_str(), "no" | "0" | "false" | "off"))
                .unwrap_or(true);
        }
        Ok(attrs)
    }

    /// Path of lifecycle script `name` if this template ships one.
    pub fn script(&self, name: &str) -> Option<Utf8PathBuf> {
        let p = self.confdir.join(name);
        p.is_file().then_some(p)
    }
}

impl OsAttrs {
    fn load(confdir: &Utf8Path, mask: LoadMask) -> Result<Self> {
        let mut os = OsAttrs::default();
        if mask.contains(LoadMask::ENVIRONMENT) {
            os.environment = read_list(confdir, "environment")?
                .unwrap_or_default()
                .into_iter()
                .filter_map(|l| {
                    l.split_once('=')
                        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                })
                .collect();
        }
        if mask.contains(LoadMask::ARCH_PACKAGES) {
            os.packages_0 = read_list(confdir, "packages_0")?.unwrap_or_default();
            os.packages_1 = read_list(confdir, "packages_1")?.unwrap_or_default();
        }
        Ok(os)
    }
}

/// `<basedir>/config/os/<variant>`
pub fn os_confdir(basedir: &Utf8Path, variant: &str) -> Utf8PathBuf {
    basedir.join("config/os").join(variant)
}

/// `<basedir>/config/app/<name>`
pub fn app_confdir(basedir: &Utf8Path, app: &str) -> Utf8PathBuf {
    basedir.join("config/app").join(app)
}

impl BaseTemplate {
    /// Load the base template for `tname` (any variant is ignored).
    #[context("Loading base template {tname}")]
    pub fn load(root: &Utf8Path, tname: &TemplateName, mask: LoadMask) -> Result<Self> {
        let tname = tname.with_variant(None);
        let name = tname.to_string();
        let basedir = tname.base_dir(root);
        let confdir = os_confdir(&basedir, DEFAULT_VARIANT);
        let attrs = TemplateAttrs::load(&name, &confdir, None, mask)?;
        let os = OsAttrs::load(&confdir, mask)?;
        let package_manager = read_first(&confdir, "package_manager")?
            .ok_or_else(|| broken(&name, format!("{confdir}/package_manager is missing")))?;
        let backend: BackendKind = package_manager
            .parse()
            .map_err(|e: anyhow::Error| broken(&name, e.to_string()))?;
        let mut base = BaseTemplate {
            attrs,
            os,
            tname,
            basedir,
            backend,
            distribution: None,
            osrelease: None,
            technologies: Technologies::empty(),
            upgradable_versions: Vec::new(),
            cache_type: CacheFormat::empty(),
            package_manager,
        };
        if mask.contains(LoadMask::DISTRIBUTION) {
            base.distribution = read_first(&confdir, "distribution")?;
            base.osrelease = read_first(&confdir, "osrelease")?;
        }
        if mask.contains(LoadMask::TECHNOLOGIES) {
            let declared = read_list(&confdir, "technologies")?.unwrap_or_default();
            let declared = Technologies::from_names(
                declared.iter().flat_map(|l| l.split_whitespace()),
            )
            .with_context(|| format!("Parsing {confdir}/technologies"))?;
            base.technologies = declared | BackendKind::technologies(&base.package_manager);
        }
        if mask.contains(LoadMask::UPGRADABLE) {
            base.upgradable_versions = read_list(&confdir, "upgradable_versions")?
                .unwrap_or_default()
                .iter()
                .flat_map(|l| l.split_whitespace())
                .map(ToOwned::to_owned)
                .collect();
        }
        if mask.contains(LoadMask::CACHE_TYPE) {
            let names = read_list(&confdir, "cache_type")?.unwrap_or_default();
            base.cache_type =
                CacheFormat::from_names(names.iter().flat_map(|l| l.split_whitespace()))?;
        }
        Ok(base)
    }
}

impl OsTemplate {
    #[context("Loading OS variant {variant} of {}", base.attrs.name)]
    pub fn load(base: &BaseTemplate, variant: &str, mask: LoadMask) -> Result<Self> {
        let name = base.tname.with_variant(Some(variant)).to_string();
        let confdir = os_confdir(&base.basedir, variant);
        Ok(OsTemplate {
            attrs: TemplateAttrs::load(&name, &confdir, Some(base.name()), mask)?,
            os: OsAttrs::load(&confdir, mask)?,
            variant: variant.to_string(),
        })
    }
}

impl AppTemplate {
    #[context("Loading application template {app} of {}", base.attrs.name)]
    pub fn load(base: &BaseTemplate, app: &str, mask: LoadMask) -> Result<Self> {
        let confdir = app_confdir(&base.basedir, app);
        Ok(AppTemplate {
            attrs: TemplateAttrs::load(app, &confdir, Some(base.name()), mask)?,
        })
    }
}
