//! Template sets: one base template with its OS variants and application
//! templates, and the marking that scopes an operation to a subset.

// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::{BTreeSet, HashSet};

use anyhow::{Context, Result};
use bitflags::bitflags;
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use super::{
    AppTemplate, BaseTemplate, Describable, LoadMask, OsTemplate, RepositoryHolder,
    DEFAULT_VARIANT,
};
use crate::errors::VzttError;
use crate::names::TemplateName;
use crate::packages::Package;
use crate::pm::{MetadataSource, Repository, RepositoryKind};

bitflags! {
    /// Selects the members of a set [`TemplateSet::mark`] flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MarkMask: u32 {
        /// The resolved OS template (the variant if one was named, else the base).
        const OS = 1 << 0;
        /// Every OS variant.
        const OS_LIST = 1 << 1;
        /// The application templates named by the caller.
        const APPS = 1 << 2;
        /// Every available application template.
        const APP_LIST = 1 << 3;
        /// Application templates the container currently uses.
        const USED_APP_LIST = 1 << 4;
    }
}

/// Index of a member within its [`TemplateSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TemplateRef {
    Base,
    Os(usize),
    App(usize),
}

#[derive(Debug, Clone)]
pub struct TemplateSet {
    pub base: BaseTemplate,
    pub os_variants: Vec<OsTemplate>,
    /// Application templates available for this base.
    pub apps: Vec<AppTemplate>,
    /// Names of the application templates the container uses.
    pub used_apps: Vec<String>,
    /// When set, variants and applications do not inherit the base's
    /// repositories.
    pub separate_repo: bool,
    os: Option<usize>,
    marks: BTreeSet<TemplateRef>,
}

/// Sorted names of the subdirectories of `dir`; a missing dir is empty.
fn subdirs(dir: &Utf8Path) -> Result<Vec<String>> {
    if !dir.try_exists()? {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in dir.read_dir_utf8().with_context(|| format!("Reading {dir}"))? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            names.push(entry.file_name().to_string());
        }
    }
    names.sort();
    Ok(names)
}

impl TemplateSet {
    /// Load the set rooted at the base of `ostemplate`.  A non-default
    /// variant in the name is always loaded.  With `apps` given only those
    /// application templates are loaded (missing ones are an error);
    /// otherwise [`LoadMask::APP_LIST`] loads all of them.
    #[context("Loading template set {ostemplate}")]
    pub fn load(
        root: &Utf8Path,
        ostemplate: &str,
        apps: Option<&[String]>,
        mask: LoadMask,
    ) -> Result<Self> {
        let tname: TemplateName = ostemplate.parse()?;
        let base = BaseTemplate::load(root, &tname, mask)?;
        let requested = tname.variant.as_deref().filter(|v| *v != DEFAULT_VARIANT);

        let mut os_variants = Vec::new();
        if mask.contains(LoadMask::OS_LIST) {
            for v in subdirs(&base.basedir.join("config/os"))? {
                if v == DEFAULT_VARIANT {
                    continue;
                }
                match OsTemplate::load(&base, &v, mask) {
                    Ok(t) => os_variants.push(t),
                    // a broken sibling must not break the requested template
                    Err(e) if Some(v.as_str()) != requested => {
                        tracing::warn!("Skipping OS variant {v}: {e:#}")
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        let os = match requested {
            Some(v) => match os_variants.iter().position(|t| t.variant == v) {
                Some(i) => Some(i),
                None => {
                    os_variants.push(OsTemplate::load(&base, v, mask)?);
                    Some(os_variants.len() - 1)
                }
            },
            None => None,
        };

        let mut app_templates = Vec::new();
        match apps {
            Some(names) => {
                for name in names {
                    app_templates.push(AppTemplate::load(&base, name, mask)?);
                }
            }
            None if mask.contains(LoadMask::APP_LIST) => {
                for name in subdirs(&base.basedir.join("config/app"))? {
                    match AppTemplate::load(&base, &name, mask) {
                        Ok(t) => app_templates.push(t),
                        Err(e) => tracing::warn!("Skipping application template {name}: {e:#}"),
                    }
                }
            }
            None => {}
        }
        tracing::debug!(
            "Loaded {} with {} variants and {} application templates",
            base.attrs.name,
            os_variants.len(),
            app_templates.len()
        );
        Ok(Self {
            base,
            os_variants,
            apps: app_templates,
            used_apps: Vec::new(),
            separate_repo: false,
            os,
            marks: BTreeSet::new(),
        })
    }

    pub fn with_used_apps(mut self, used: &[String]) -> Self {
        self.used_apps = used.to_vec();
        self
    }

    /// The resolved OS template: the requested variant or the base.
    pub fn os(&self) -> TemplateRef {
        self.os.map(TemplateRef::Os).unwrap_or(TemplateRef::Base)
    }

    /// Full name of the resolved OS template.
    pub fn os_name(&self) -> &str {
        self.get(self.os()).name()
    }

    pub fn get(&self, r: TemplateRef) -> &dyn RepositoryHolder {
        match r {
            TemplateRef::Base => &self.base,
            TemplateRef::Os(i) => &self.os_variants[i],
            TemplateRef::App(i) => &self.apps[i],
        }
    }

    pub fn app(&self, name: &str) -> Option<TemplateRef> {
        self.apps
            .iter()
            .position(|a| a.name() == name)
            .map(TemplateRef::App)
    }

    /// Every member: base, variants, then applications.
    pub fn members(&self) -> Vec<TemplateRef> {
        std::iter::once(TemplateRef::Base)
            .chain((0..self.os_variants.len()).map(TemplateRef::Os))
            .chain((0..self.apps.len()).map(TemplateRef::App))
            .collect()
    }

    /// Flag the members selected by `mask`; `names` feeds [`MarkMask::APPS`].
    /// Naming an application template the set does not hold is an error.
    pub fn mark(&mut self, names: Option<&[String]>, mask: MarkMask) -> Result<()> {
        if mask.contains(MarkMask::OS) {
            self.marks.insert(self.os());
        }
        if mask.contains(MarkMask::OS_LIST) {
            self.marks
                .extend((0..self.os_variants.len()).map(TemplateRef::Os));
        }
        if mask.contains(MarkMask::APPS) {
            for name in names.unwrap_or_default() {
                let r = self
                    .app(name)
                    .ok_or_else(|| VzttError::TemplateNotFound(name.clone()))?;
                self.marks.insert(r);
            }
        }
        if mask.contains(MarkMask::APP_LIST) {
            self.marks.extend((0..self.apps.len()).map(TemplateRef::App));
        }
        if mask.contains(MarkMask::USED_APP_LIST) {
            for name in &self.used_apps {
                match self.app(name) {
                    Some(r) => {
                        self.marks.insert(r);
                    }
                    None => tracing::debug!("Used application template {name} is not loaded"),
                }
            }
        }
        Ok(())
    }

    pub fn unmark_all(&mut self) {
        self.marks.clear();
    }

    pub fn is_marked(&self, r: TemplateRef) -> bool {
        self.marks.contains(&r)
    }

    pub fn marked(&self) -> Vec<TemplateRef> {
        self.marks.iter().copied().collect()
    }

    /// Union of the package lists of the marked members.  OS templates
    /// contribute their architecture-conditional packages too.
    pub fn marked_packages(&self) -> BTreeSet<String> {
        let tech = self.base.technologies;
        let mut pkgs = BTreeSet::new();
        for &r in &self.marks {
            pkgs.extend(self.get(r).packages().iter().cloned());
            let os = match r {
                TemplateRef::Base => Some(&self.base.os),
                TemplateRef::Os(i) => Some(&self.os_variants[i].os),
                TemplateRef::App(_) => None,
            };
            if let Some(os) = os {
                pkgs.extend(os.arch_packages(tech).iter().cloned());
            }
        }
        pkgs
    }

    fn own_repositories(&self, r: TemplateRef) -> Vec<Repository> {
        let t = self.get(r);
        let collections = [
            (RepositoryKind::Base, "", t.repositories()),
            (RepositoryKind::Zypp, "-zypp", t.zypp_repositories()),
            (RepositoryKind::Mirror, "-mirror", t.mirrorlist()),
        ];
        collections
            .into_iter()
            .flat_map(|(kind, infix, urls)| {
                urls.iter().enumerate().map(move |(n, url)| Repository {
                    id: format!("{}{infix}-{n}", t.name()),
                    kind,
                    url: url.clone(),
                })
            })
            .collect()
    }

    /// Repositories a member effectively uses: its own followed by the
    /// base's, unless the set is in separate-repo mode.
    pub fn repositories_of(&self, r: TemplateRef) -> Vec<Repository> {
        let mut repos = self.own_repositories(r);
        if r != TemplateRef::Base && !self.separate_repo {
            repos.extend(self.own_repositories(TemplateRef::Base));
        }
        repos
    }

    /// Effective repositories of all marked members, each URL once.
    pub fn marked_repositories(&self) -> Vec<Repository> {
        let mut seen = HashSet::new();
        self.marks
            .iter()
            .flat_map(|&r| self.repositories_of(r))
            .filter(|repo| seen.insert((repo.kind, repo.url.clone())))
            .collect()
    }

    /// What to fetch to refresh `r`'s own metadata.
    pub fn metadata_source(&self, r: TemplateRef) -> MetadataSource {
        MetadataSource {
            template: self.get(r).name().to_string(),
            repositories: self.own_repositories(r),
        }
    }

    /// A base with variants or application templates can only be removed
    /// with `force`.
    pub fn check_removable(&self, force: bool) -> Result<()> {
        let dependents: Vec<String> = self
            .os_variants
            .iter()
            .map(|t| t.name().to_string())
            .chain(self.apps.iter().map(|t| t.name().to_string()))
            .collect();
        if dependents.is_empty() || force {
            return Ok(());
        }
        tracing::error!(
            "{} has dependent templates: {}",
            self.base.attrs.name,
            dependents.join(" ")
        );
        Err(VzttError::HasDependents {
            name: self.base.attrs.name.clone(),
            dependents: dependents.join(" "),
        }
        .into())
    }

    /// Refuse package operations if a marked member disallows them.
    pub fn check_pkg_actions(&self) -> Result<()> {
        match self
            .marks
            .iter()
            .map(|&r| self.get(r))
            .find(|t| t.attrs().no_pkg_actions)
        {
            Some(t) => {
                tracing::error!("Package operations are not permitted for {}", t.name());
                Err(VzttError::NotPermitted(t.name().to_string()).into())
            }
            None => Ok(()),
        }
    }

    /// Lifecycle script `name` of `r`, falling back to its parent's.
    pub fn script(&self, r: TemplateRef, name: &str) -> Option<Utf8PathBuf> {
        let t = self.get(r);
        t.attrs().script(name).or_else(|| match t.attrs().parent {
            Some(_) => self.base.attrs.script(name),
            None => None,
        })
    }

    /// Application templates whose packages are all installed.
    pub fn detect_apps(&self, installed: &[Package]) -> Vec<String> {
        let names: HashSet<&str> = installed.iter().map(|p| p.name.as_str()).collect();
        self.apps
            .iter()
            .filter(|a| {
                !a.packages().is_empty() && a.packages().iter().all(|p| names.contains(p.as_str()))
            })
            .map(|a| a.name().to_string())
            .collect()
    }
}
