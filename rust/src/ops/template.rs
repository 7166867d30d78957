//! Operations on templates that do not touch a container: metadata
//! refresh, package prefetch, cleanup, queries and removal.

// SPDX-License-Identifier: Apache-2.0 OR MIT

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use serde::Serialize;

use super::Vztt;
use crate::cache::{artifact_path, CacheFormat};
use crate::errors::VzttError;
use crate::lock::{LockMode, DIR_LOCK_NAME};
use crate::metadata::{metadata_path, MetadataReport};
use crate::names::TemplateName;
use crate::packages::Package;
use crate::pm::{GroupInfo, CACHE_DIR};
use crate::template::{
    AppTemplate, Describable, LoadMask, MarkMask, OsTemplate, RepositoryHolder, TemplateRef,
    TemplateSet, DEFAULT_VARIANT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateKind {
    Os,
    App,
}

/// What `info` and `list` report about a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateInfo {
    pub name: String,
    pub kind: TemplateKind,
    /// The base OS template this one belongs to.
    pub base: String,
    pub summary: String,
    pub description: String,
    pub packages: Vec<String>,
    pub repositories: Vec<String>,
    pub zypp_repositories: Vec<String>,
    pub mirrorlist: Vec<String>,
    pub package_manager: String,
    pub technologies: Vec<&'static str>,
    pub distribution: Option<String>,
    pub osrelease: Option<String>,
    pub upgradable_versions: Vec<String>,
    pub cache_type: Vec<&'static str>,
    pub golden_image: bool,
    pub no_pkg_actions: bool,
}

impl TemplateInfo {
    fn of(set: &TemplateSet, r: TemplateRef) -> Self {
        let t = set.get(r);
        let base = &set.base;
        let kind = match r {
            TemplateRef::App(_) => TemplateKind::App,
            _ => TemplateKind::Os,
        };
        Self {
            name: t.name().to_string(),
            kind,
            base: base.attrs.name.clone(),
            summary: t.summary().to_string(),
            description: t.description().to_string(),
            packages: t.packages().to_vec(),
            repositories: t.repositories().to_vec(),
            zypp_repositories: t.zypp_repositories().to_vec(),
            mirrorlist: t.mirrorlist().to_vec(),
            package_manager: base.package_manager.clone(),
            technologies: base.technologies.names(),
            distribution: base.distribution.clone(),
            osrelease: base.osrelease.clone(),
            upgradable_versions: base.upgradable_versions.clone(),
            cache_type: base.cache_type.names(),
            golden_image: t.attrs().golden_image,
            no_pkg_actions: t.attrs().no_pkg_actions,
        }
    }
}

/// Names of the subdirectories of `dir`, sorted; a missing dir is empty.
fn dirnames(dir: &Utf8Path) -> Result<Vec<String>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in dir.read_dir_utf8().with_context(|| format!("Reading {dir}"))? {
        let entry = entry?;
        if entry.file_type()?.is_dir() && !entry.file_name().starts_with('.') {
            names.push(entry.file_name().to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// Remove a file, symlink or directory tree if it exists.
fn remove_path(path: &Utf8Path) -> Result<()> {
    let meta = match path.symlink_metadata() {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("Querying {path}")),
    };
    tracing::debug!("Removing {path}");
    if meta.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
    .with_context(|| format!("Removing {path}"))
}

impl Vztt {
    /// Refresh the metadata of an OS template, its variants and all its
    /// application templates.
    #[context("Updating metadata of {ostemplate}")]
    pub fn update_metadata(&self, ostemplate: &str) -> Result<MetadataReport> {
        let mut set = self.load_set(
            ostemplate,
            None,
            LoadMask::MINIMAL | LoadMask::OS_LIST | LoadMask::APP_LIST,
        )?;
        set.mark(None, MarkMask::OS | MarkMask::OS_LIST | MarkMask::APP_LIST)?;
        let mut tx = self.open(&set)?;
        let report = self.refresh(tx.as_mut(), &set)?;
        for name in &report.failed {
            tracing::warn!("Metadata of {name} is not up to date");
        }
        Ok(report)
    }

    /// Download the packages of an OS template, or of some of its
    /// application templates, into the local package cache.
    #[context("Fetching packages of {ostemplate}")]
    pub fn fetch(&self, ostemplate: &str, apps: &[String]) -> Result<Vec<String>> {
        let selected = (!apps.is_empty()).then_some(apps);
        let mut set = self.load_set(
            ostemplate,
            selected,
            LoadMask::MINIMAL | LoadMask::ARCH_PACKAGES,
        )?;
        match selected {
            Some(apps) => set.mark(Some(apps), MarkMask::APPS)?,
            None => set.mark(None, MarkMask::OS)?,
        }
        let targets: Vec<String> = set.marked_packages().into_iter().collect();
        set.mark(None, MarkMask::OS)?;
        let mut tx = self.open(&set)?;
        self.refresh(tx.as_mut(), &set)?;
        let _tl = self.template_lock(&set, LockMode::Read)?;
        tx.download(&targets)?;
        tracing::info!("Fetched {} packages for {}", targets.len(), set.os_name());
        Ok(targets)
    }

    /// Drop the package managers' local caches for an OS template.
    #[context("Cleaning local caches of {ostemplate}")]
    pub fn clean(&self, ostemplate: &str) -> Result<()> {
        let mut set = self.load_set(
            ostemplate,
            None,
            LoadMask::MINIMAL | LoadMask::OS_LIST | LoadMask::APP_LIST,
        )?;
        set.mark(None, MarkMask::OS | MarkMask::OS_LIST | MarkMask::APP_LIST)?;
        let mut tx = self.open(&set)?;
        let _tl = self.template_lock(&set, LockMode::Write)?;
        tx.clean_local_cache()
    }

    /// Packages offered by the repositories of an OS template, all of
    /// them or only those called `name`.
    #[context("Querying available packages of {ostemplate}")]
    pub fn list_available(&self, ostemplate: &str, name: Option<&str>) -> Result<Vec<Package>> {
        let mut set = self.load_set(ostemplate, None, LoadMask::MINIMAL)?;
        set.mark(None, MarkMask::OS)?;
        let mut tx = self.open(&set)?;
        self.refresh(tx.as_mut(), &set)?;
        let _tl = self.template_lock(&set, LockMode::Read)?;
        let mut pkgs = tx.list_available(name)?;
        pkgs.sort();
        Ok(pkgs)
    }

    #[context("Querying group {group} of {ostemplate}")]
    pub fn group_info(&self, ostemplate: &str, group: &str) -> Result<GroupInfo> {
        let mut set = self.load_set(ostemplate, None, LoadMask::MINIMAL)?;
        set.mark(None, MarkMask::OS)?;
        let mut tx = self.open(&set)?;
        self.refresh(tx.as_mut(), &set)?;
        let _tl = self.template_lock(&set, LockMode::Read)?;
        tx.group_info(group)
    }

    /// Every OS and application template under the template root.
    #[context("Listing templates")]
    pub fn list_templates(&self) -> Result<Vec<TemplateInfo>> {
        let root = &self.config.template_root;
        let mut found = Vec::new();
        for os in dirnames(root)? {
            for version in dirnames(&root.join(&os))? {
                for arch in dirnames(&root.join(&os).join(&version))? {
                    let name = format!("{os}-{version}-{arch}");
                    let Ok(tname) = name.parse::<TemplateName>() else {
                        continue;
                    };
                    let confdir = tname.base_dir(root).join("config/os").join(DEFAULT_VARIANT);
                    if !confdir.is_dir() {
                        continue;
                    }
                    let mask = LoadMask::FIELDS | LoadMask::OS_LIST | LoadMask::APP_LIST;
                    match self.load_set(&name, None, mask) {
                        Ok(set) => found.extend(
                            set.members().into_iter().map(|r| TemplateInfo::of(&set, r)),
                        ),
                        Err(e) => tracing::warn!("Skipping {name}: {e:#}"),
                    }
                }
            }
        }
        Ok(found)
    }

    /// Details of an OS template, or of one of its application templates.
    #[context("Querying template {ostemplate}")]
    pub fn template_info(&self, ostemplate: &str, app: Option<&str>) -> Result<TemplateInfo> {
        let apps: Vec<String> = app.into_iter().map(ToOwned::to_owned).collect();
        let selected = app.is_some().then_some(apps.as_slice());
        let set = self.load_set(ostemplate, selected, LoadMask::FIELDS)?;
        let r = match app {
            Some(app) => set
                .app(app)
                .ok_or_else(|| VzttError::TemplateNotFound(app.to_string()))?,
            None => set.os(),
        };
        Ok(TemplateInfo::of(&set, r))
    }

    /// Containers whose configuration uses the template.
    fn template_users(&self, tname: &TemplateName, app: Option<&str>) -> Result<Vec<String>> {
        let mut users = Vec::new();
        for ctid in self.containers().list()? {
            let cfg = match self.containers().config(&ctid) {
                Ok(cfg) => cfg,
                Err(e) => {
                    tracing::warn!("Skipping container {ctid}: {e:#}");
                    continue;
                }
            };
            let Ok(used) = cfg.ostemplate.parse::<TemplateName>() else {
                continue;
            };
            let uses = match (app, &tname.variant) {
                (Some(app), _) => {
                    used.base_name() == tname.base_name() && cfg.templates.iter().any(|t| t == app)
                }
                (None, Some(_)) => used == *tname,
                (None, None) => used.base_name() == tname.base_name(),
            };
            if uses {
                users.push(ctid);
            }
        }
        Ok(users)
    }

    /// Remove an OS template (with `app`, one of its application
    /// templates).  Removing a base removes its variants, application
    /// templates, metadata and caches too, and needs `force` when there
    /// are any variants or application templates.
    #[context("Removing template {ostemplate}")]
    pub fn remove_template(&self, ostemplate: &str, app: Option<&str>) -> Result<()> {
        let tname: TemplateName = ostemplate.parse()?;
        let shown = app.unwrap_or(ostemplate);
        let users = self.template_users(&tname, app)?;
        if !users.is_empty() {
            let msg = format!("{shown} is used by containers {}", users.join(" "));
            if !self.opts.force {
                tracing::error!("{msg}");
                return Err(VzttError::TemplateInstalled(shown.to_string())).context(msg);
            }
            tracing::warn!("{msg}, removing anyway");
        }

        let variant = tname.variant.as_deref().filter(|v| *v != DEFAULT_VARIANT);
        let mask = match (app, variant) {
            (None, None) => LoadMask::MINIMAL | LoadMask::OS_LIST | LoadMask::APP_LIST,
            _ => LoadMask::MINIMAL,
        };
        let apps: Vec<String> = app.into_iter().map(ToOwned::to_owned).collect();
        let set = self.load_set(ostemplate, app.is_some().then_some(apps.as_slice()), mask)?;
        let basedir = set.base.basedir.clone();
        let backend_cache = basedir.join(CACHE_DIR).join(set.base.backend.name());
        let _tl = self.template_lock(&set, LockMode::Write)?;

        match (app, variant) {
            (Some(app), _) => {
                let t: &AppTemplate = set
                    .apps
                    .iter()
                    .find(|t| t.name() == app)
                    .ok_or_else(|| VzttError::TemplateNotFound(app.to_string()))?;
                remove_path(t.confdir())?;
                remove_path(&metadata_path(&basedir, app))?;
                remove_path(&backend_cache.join(app))?;
            }
            (None, Some(_)) => {
                let t: &OsTemplate = match set.os() {
                    TemplateRef::Os(i) => &set.os_variants[i],
                    _ => return Err(VzttError::TemplateNotFound(ostemplate.to_string()).into()),
                };
                remove_path(t.confdir())?;
                remove_path(&metadata_path(&basedir, t.name()))?;
                remove_path(&backend_cache.join(t.name()))?;
            }
            (None, None) => {
                set.check_removable(self.opts.force)?;
                let base = set.base.attrs.name.as_str();
                for format in CacheFormat::all().formats() {
                    let artifact = artifact_path(&self.config.cache_dir, base, format);
                    if artifact.try_exists()? {
                        let _al = self.locks.lock_artifact(&artifact, LockMode::Write)?;
                        remove_path(&artifact)?;
                    }
                }
                // everything but the lock file we hold
                for entry in basedir
                    .read_dir_utf8()
                    .with_context(|| format!("Reading {basedir}"))?
                {
                    let entry = entry?;
                    if entry.file_name() != DIR_LOCK_NAME {
                        remove_path(entry.path())?;
                    }
                }
            }
        }
        tracing::info!("Removed template {shown}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{pkg, Host, OS};
    use super::super::Options;
    use super::*;
    use crate::errors::{error_code, ErrorCode};
    use crate::metadata::is_stale;
    use crate::metadata::DataSource;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn metadata_fetch_and_clean() -> Result<()> {
        let host = Host::new();
        host.tree.app(OS, "web", &["nginx"], &["http://mirror/web"]);
        host.tree.app(OS, "php", &["php"], &["http://mirror/web"]);
        host.tree.app(OS, "db", &["mariadb-server"], &[]);
        host.backends.state_mut().available = vec![pkg("nginx", "1.20.1-10.el7")];
        let vz = host.vztt(Options::default());

        let report = vz.update_metadata(OS)?;
        assert_eq!(report.fetched, strings(&[OS, "php"]));
        assert_eq!(report.aliased, vec![("web".to_string(), "php".to_string())]);
        let basedir = host.tree.root().join("centos/7/x86_64");
        assert!(!is_stale(&basedir, "web", 3600, DataSource::Default)?);

        // fresh metadata is not fetched again
        let fetched = vz.fetch(OS, &strings(&["web"]))?;
        assert_eq!(fetched, strings(&["nginx"]));
        assert_eq!(host.backends.state().fetches, 2);
        assert_eq!(host.backends.state().downloads, strings(&["nginx"]));

        vz.fetch(OS, &[])?;
        assert_eq!(host.backends.state().downloads, strings(&["nginx", "bash", "coreutils"]));

        vz.clean(OS)?;
        assert_eq!(host.backends.state().cleaned, 1);
        Ok(())
    }

    #[test]
    fn available_and_groups() -> Result<()> {
        let host = Host::new();
        {
            let mut st = host.backends.state_mut();
            st.available = vec![pkg("zsh", "5.0.2-34.el7"), pkg("bash", "4.2.46-34.el7")];
            st.groups.insert(
                "core".into(),
                GroupInfo {
                    name: "core".into(),
                    mandatory: vec!["bash".into()],
                    ..Default::default()
                },
            );
        }
        let vz = host.vztt(Options::default());
        let all = vz.list_available(OS, None)?;
        assert_eq!(all, vec![pkg("bash", "4.2.46-34.el7"), pkg("zsh", "5.0.2-34.el7")]);
        assert_eq!(vz.list_available(OS, Some("zsh"))?, vec![pkg("zsh", "5.0.2-34.el7")]);
        assert_eq!(vz.group_info(OS, "core")?.mandatory, vec!["bash".to_string()]);
        assert!(vz.group_info(OS, "nosuch").is_err());
        Ok(())
    }

    #[test]
    fn list_and_info() -> Result<()> {
        let host = Host::new();
        host.tree.os_file(OS, "default", "summary", "CentOS 7\n");
        host.tree.os_file(OS, "default", "technologies", "nptl sysfs\n");
        host.tree.os_file(OS, "minimal", "packages", "bash\n");
        host.tree.app(OS, "web", &["nginx"], &[]);
        host.tree.base("debian-11-x86_64", &["dpkg"], &[]);
        std::fs::create_dir_all(host.tree.root().join("cache"))?;
        let vz = host.vztt(Options::default());

        let names: Vec<(String, TemplateKind)> = vz
            .list_templates()?
            .into_iter()
            .map(|t| (t.name, t.kind))
            .collect();
        assert_eq!(
            names,
            vec![
                (OS.to_string(), TemplateKind::Os),
                ("centos-7-x86_64-minimal".to_string(), TemplateKind::Os),
                ("web".to_string(), TemplateKind::App),
                ("debian-11-x86_64".to_string(), TemplateKind::Os),
            ]
        );

        let info = vz.template_info(OS, None)?;
        assert_eq!(info.summary, "CentOS 7");
        assert_eq!(info.technologies, vec!["x86_64", "nptl", "sysfs"]);
        assert_eq!(info.package_manager, "rpm49x64");
        let info = vz.template_info(OS, Some("web"))?;
        assert_eq!(info.kind, TemplateKind::App);
        assert_eq!(info.base, OS);
        let e = vz.template_info(OS, Some("mail")).unwrap_err();
        assert_eq!(error_code(&e), ErrorCode::TemplateNotFound);
        Ok(())
    }

    #[test]
    fn removal() -> Result<()> {
        let host = Host::new();
        host.tree.app(OS, "web", &["nginx"], &[]);
        host.tree.app(OS, "db", &["mariadb-server"], &[]);
        host.containers.add("102", OS, &["web"]);
        let basedir = host.tree.root().join("centos/7/x86_64");
        let vz = host.vztt(Options::default());

        let e = vz.remove_template(OS, Some("web")).unwrap_err();
        assert_eq!(error_code(&e), ErrorCode::TemplateInstalled);
        vz.remove_template(OS, Some("db"))?;
        assert!(!host.tree.app_dir(OS, "db").exists());
        assert!(host.tree.app_dir(OS, "web").exists());

        let e = vz.remove_template(OS, None).unwrap_err();
        assert_eq!(error_code(&e), ErrorCode::TemplateInstalled);

        let forced = host.vztt(Options {
            force: true,
            ..Default::default()
        });
        let cache = host.tree.root().join("cache");
        std::fs::create_dir_all(&cache)?;
        std::fs::write(cache.join("centos-7-x86_64.tar.gz"), "")?;
        forced.remove_template(OS, None)?;
        assert!(!cache.join("centos-7-x86_64.tar.gz").exists());
        assert!(!basedir.join("config").exists());
        Ok(())
    }

    #[test]
    fn base_with_dependents() {
        let host = Host::new();
        host.tree.app(OS, "web", &["nginx"], &[]);
        // no container uses the template any more
        host.containers.add("101", "debian-11-x86_64", &[]);
        let vz = host.vztt(Options::default());
        let e = vz.remove_template(OS, None).unwrap_err();
        assert_eq!(error_code(&e), ErrorCode::HasDependents);
        assert!(host.tree.app_dir(OS, "web").exists());
    }
}
