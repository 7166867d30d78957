//! Package-manager transactions.
//!
//! A [`Transaction`] is a session against one package-manager backend,
//! bound to the repositories of the marked members of a template set and
//! to a target root directory.  The backend family is picked once, from
//! the base template's `package_manager` file.

// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::cmp::Ordering;
use std::process::Command;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::config::{GlobalConfig, Proxy};
use crate::errors::VzttError;
use crate::packages::{Package, PackageChanges};
use crate::template::{Technologies, TemplateSet};

pub mod dpkg;
pub mod evr;
pub mod rpm;
pub mod zypper;

/// Directory below a template base dir holding backend side files.
pub const CACHE_DIR: &str = ".cache";

/// Package-manager family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Yum,
    Dnf,
    Zypper,
    Dpkg,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.contains("dpkg") {
            Ok(BackendKind::Dpkg)
        } else if s.contains("zypp") {
            Ok(BackendKind::Zypper)
        } else if s.contains("dnf") {
            Ok(BackendKind::Dnf)
        } else if s.starts_with("rpm") {
            Ok(BackendKind::Yum)
        } else {
            Err(anyhow!("Unknown package manager: {s}"))
        }
    }
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Yum => "yum",
            BackendKind::Dnf => "dnf",
            BackendKind::Zypper => "zypper",
            BackendKind::Dpkg => "apt-get",
        }
    }

    /// Technologies implied by a `package_manager` identifier.
    pub fn technologies(package_manager: &str) -> Technologies {
        if package_manager.contains("x64") || package_manager.contains("x86_64") {
            Technologies::X86_64
        } else if package_manager.contains("x86") {
            Technologies::X86
        } else if package_manager.contains("ia64") {
            Technologies::IA64
        } else {
            Technologies::empty()
        }
    }

    pub fn compare_versions(&self, a: &str, b: &str) -> Ordering {
        match self {
            BackendKind::Dpkg => evr::deb_compare(a, b),
            _ => evr::rpm_compare(a, b),
        }
    }
}

/// Package operations a backend carries out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Install,
    Update,
    Remove,
    /// Update everything, allowing obsoletes and downgrades across releases.
    Upgrade,
    GroupInstall,
    GroupUpdate,
    GroupRemove,
    LocalInstall,
    LocalUpdate,
}

impl Action {
    pub fn is_group(&self) -> bool {
        matches!(
            self,
            Action::GroupInstall | Action::GroupUpdate | Action::GroupRemove
        )
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Action::LocalInstall | Action::LocalUpdate)
    }

    /// Base name of the lifecycle scripts run around this action.
    pub fn script_stem(&self) -> &'static str {
        match self {
            Action::Install | Action::GroupInstall | Action::LocalInstall => "install",
            Action::Update | Action::GroupUpdate | Action::LocalUpdate => "update",
            Action::Remove | Action::GroupRemove => "remove",
            Action::Upgrade => "upgrade",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepositoryKind {
    /// A plain base URL (or a sources.list line for dpkg).
    Base,
    /// An entry for zypper-style repository handling.
    Zypp,
    /// A mirror list URL.
    Mirror,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    pub id: String,
    pub kind: RepositoryKind,
    pub url: String,
}

/// Repositories of one template, for fetching that template's metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataSource {
    pub template: String,
    pub repositories: Vec<Repository>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct GroupInfo {
    pub name: String,
    pub description: String,
    pub mandatory: Vec<String>,
    pub default: Vec<String>,
    pub optional: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionOptions {
    /// Carry out the operation in the backend's test mode.
    pub test: bool,
}

/// State shared by every backend implementation.
#[derive(Debug)]
pub struct BackendEnv {
    pub kind: BackendKind,
    pub basedir: Utf8PathBuf,
    pub base_name: String,
    pub repositories: Vec<Repository>,
    pub proxy: Option<Proxy>,
    exclusions: Vec<String>,
    excluded: Vec<glob::Pattern>,
    pub test: bool,
    root: Option<Utf8PathBuf>,
    tmproot: Option<tempfile::TempDir>,
    workdir: tempfile::TempDir,
}

impl BackendEnv {
    pub fn new(
        kind: BackendKind,
        config: &GlobalConfig,
        set: &TemplateSet,
        opts: &TransactionOptions,
    ) -> Result<Self> {
        let repositories = set
            .marked_repositories()
            .into_iter()
            .map(|r| {
                Ok(Repository {
                    url: config.expand_url(&r.url)?,
                    ..r
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let mut env = Self {
            kind,
            basedir: set.base.basedir.clone(),
            base_name: set.base.attrs.name.clone(),
            repositories,
            proxy: config.proxy.clone(),
            exclusions: Vec::new(),
            excluded: Vec::new(),
            test: opts.test,
            root: None,
            tmproot: None,
            workdir: tempfile::tempdir().context("Creating backend work directory")?,
        };
        for p in &config.exclude {
            env.exclude(p)?;
        }
        Ok(env)
    }

    /// An environment with one base repository under `basedir`.
    #[cfg(test)]
    pub(crate) fn for_tests(kind: BackendKind, basedir: &Utf8Path) -> Result<Self> {
        Ok(Self {
            kind,
            basedir: basedir.to_owned(),
            base_name: "base".into(),
            repositories: vec![Repository {
                id: "base-0".into(),
                kind: RepositoryKind::Base,
                url: "http://mirror/os".into(),
            }],
            proxy: None,
            exclusions: Vec::new(),
            excluded: Vec::new(),
            test: false,
            root: None,
            tmproot: None,
            workdir: tempfile::tempdir()?,
        })
    }

    /// Scratch directory for generated configuration; removed on drop.
    pub fn workdir(&self) -> &Utf8Path {
        Utf8Path::from_path(self.workdir.path()).unwrap_or(Utf8Path::new("/tmp"))
    }

    pub fn root(&self) -> Result<&Utf8Path> {
        self.root
            .as_deref()
            .ok_or_else(|| anyhow!("No root directory set for {} transaction", self.kind.name()))
    }

    pub fn set_root(&mut self, root: &Utf8Path) {
        tracing::debug!("{} transaction root: {root}", self.kind.name());
        self.root = Some(root.to_owned());
    }

    /// Backend side files for `template`'s metadata.
    pub fn cache_dir(&self, template: &str) -> Utf8PathBuf {
        self.basedir
            .join(CACHE_DIR)
            .join(self.kind.name())
            .join(template)
    }

    /// Cache used by operations on a root, shared by the whole template set.
    pub fn transaction_cache_dir(&self) -> Utf8PathBuf {
        self.cache_dir(&self.base_name)
    }

    pub fn apply_proxy(&self, cmd: &mut Command) {
        if let Some(proxy) = &self.proxy {
            cmd.env("http_proxy", &proxy.url);
            cmd.env("https_proxy", &proxy.url);
            cmd.env("ftp_proxy", &proxy.url);
        }
    }

    /// Package name patterns kept out of installs and updates.
    pub fn exclusions(&self) -> &[String] {
        &self.exclusions
    }

    /// Add a shell-style package name pattern to the exclusions.
    pub fn exclude(&mut self, pattern: &str) -> Result<()> {
        if self.exclusions.iter().any(|p| p == pattern) {
            return Ok(());
        }
        let compiled = glob::Pattern::new(pattern)
            .with_context(|| format!("Invalid exclusion pattern {pattern}"))?;
        self.exclusions.push(pattern.to_string());
        self.excluded.push(compiled);
        Ok(())
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        self.excluded.iter().any(|p| p.matches(name))
    }
}

/// Targets of `action` minus excluded package names, for backends
/// without a native exclude option.
pub(crate) fn filter_excluded<'a>(
    env: &BackendEnv,
    action: Action,
    targets: &'a [String],
) -> Vec<&'a String> {
    if action == Action::Remove || action.is_group() || action.is_local() {
        return targets.iter().collect();
    }
    targets
        .iter()
        .filter(|t| {
            let excluded = env.is_excluded(t);
            if excluded {
                tracing::info!("Skipping excluded package {t}");
            }
            !excluded
        })
        .collect()
}

/// Recursively copy a directory tree.
pub(crate) fn copy_tree(src: &Utf8Path, dest: &Utf8Path) -> Result<()> {
    std::fs::create_dir_all(dest).with_context(|| format!("Creating {dest}"))?;
    for entry in src.read_dir_utf8().with_context(|| format!("Reading {src}"))? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        let ft = entry.file_type()?;
        if ft.is_dir() {
            copy_tree(entry.path(), &target)?;
        } else if ft.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            match std::fs::remove_file(&target) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("Removing {target}")),
            }
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("Copying {} to {target}", entry.path()))?;
        }
    }
    Ok(())
}

/// A session against one package manager.
pub trait Transaction {
    fn env(&self) -> &BackendEnv;

    fn env_mut(&mut self) -> &mut BackendEnv;

    fn kind(&self) -> BackendKind {
        self.env().kind
    }

    /// Operate on `root` from now on.
    fn set_root_directory(&mut self, root: &Utf8Path) {
        self.env_mut().set_root(root)
    }

    /// Operate on a fresh scratch root which is removed with the transaction.
    fn create_temporary_root(&mut self) -> Result<Utf8PathBuf> {
        let env = self.env_mut();
        let td = tempfile::Builder::new()
            .prefix(".root.")
            .tempdir_in(&env.basedir)
            .with_context(|| format!("Creating temporary root in {}", env.basedir))?;
        let path = Utf8Path::from_path(td.path())
            .ok_or_else(|| anyhow!("Non-UTF-8 temporary root"))?
            .to_owned();
        env.tmproot = Some(td);
        env.set_root(&path);
        Ok(path)
    }

    fn set_exclusions(&mut self, patterns: &[String]) -> Result<()> {
        let env = self.env_mut();
        for p in patterns {
            env.exclude(p)?;
        }
        Ok(())
    }

    fn compare_versions(&self, a: &str, b: &str) -> Ordering {
        self.kind().compare_versions(a, b)
    }

    /// Make a copy of `from`'s backend side files for `to`.
    fn clone_metadata(&mut self, from: &str, to: &str) -> Result<()> {
        let env = self.env();
        let src = env.cache_dir(from);
        if !src.try_exists()? {
            return Ok(());
        }
        let dest = env.cache_dir(to);
        if dest.try_exists()? {
            std::fs::remove_dir_all(&dest).with_context(|| format!("Removing {dest}"))?;
        }
        copy_tree(&src, &dest)
    }

    /// Download the repository metadata of one template, returning the
    /// packages it makes available.
    fn fetch_metadata(&mut self, source: &MetadataSource) -> Result<Vec<Package>>;

    /// Run `action` on `targets` (names, group names or local files).
    fn run(&mut self, action: Action, targets: &[String]) -> Result<PackageChanges>;

    fn list_installed(&mut self) -> Result<Vec<Package>>;

    /// Packages available from the bound repositories, optionally only
    /// those named `name`.
    fn list_available(&mut self, name: Option<&str>) -> Result<Vec<Package>>;

    fn group_info(&mut self, name: &str) -> Result<GroupInfo>;

    /// Download `targets` into the backend's local cache.
    fn download(&mut self, targets: &[String]) -> Result<()>;

    fn clean_local_cache(&mut self) -> Result<()>;

    /// Repair the backend's package index after external edits.
    fn fix_package_database(&mut self) -> Result<()>;
}

/// Run `f`, returning the difference it made to the installed packages.
pub(crate) fn run_with_diff<T: Transaction + ?Sized>(
    tx: &mut T,
    f: impl FnOnce(&mut T) -> Result<()>,
) -> Result<PackageChanges> {
    let before = tx.list_installed()?;
    f(tx)?;
    if tx.env().test {
        return Ok(PackageChanges::default());
    }
    let after = tx.list_installed()?;
    Ok(PackageChanges::between(&before, &after))
}

/// Chooses and constructs the backend for a template set.
pub trait Backends {
    fn open(
        &self,
        kind: BackendKind,
        config: &GlobalConfig,
        set: &TemplateSet,
        opts: &TransactionOptions,
    ) -> Result<Box<dyn Transaction>>;
}

/// The real package managers installed on the host.
#[derive(Debug, Default)]
pub struct HostBackends;

impl Backends for HostBackends {
    fn open(
        &self,
        kind: BackendKind,
        config: &GlobalConfig,
        set: &TemplateSet,
        opts: &TransactionOptions,
    ) -> Result<Box<dyn Transaction>> {
        open(kind, config, set, opts)
    }
}

/// Open a transaction of backend family `kind` over the marked members of `set`.
#[context("Opening {} transaction for {}", kind.name(), set.base.attrs.name)]
pub fn open(
    kind: BackendKind,
    config: &GlobalConfig,
    set: &TemplateSet,
    opts: &TransactionOptions,
) -> Result<Box<dyn Transaction>> {
    let env = BackendEnv::new(kind, config, set, opts)?;
    Ok(match kind {
        BackendKind::Yum | BackendKind::Dnf => Box::new(rpm::RpmTransaction::new(env)),
        BackendKind::Zypper => Box::new(zypper::ZypperTransaction::new(env)),
        BackendKind::Dpkg => Box::new(dpkg::DpkgTransaction::new(env)),
    })
}

/// Shared error for operations a backend family cannot express.
pub(crate) fn unsupported(what: &'static str) -> anyhow::Error {
    VzttError::Unsupported(what).into()
}
