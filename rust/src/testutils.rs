//! # Test fixtures
//!
//! A template tree builder plus in-memory stand-ins for the container
//! collaborator and the package-manager backends.

// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::cell::{Ref, RefCell, RefMut};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;

use anyhow::{anyhow, Result};
use camino::{Utf8Path, Utf8PathBuf};

use crate::config::GlobalConfig;
use crate::container::{
    ContainerConfig, ContainerLifecycle, ContainerLock, ContainerLockState, ContainerStatus,
};
use crate::errors::VzttError;
use crate::lock::{LockManager, LockMode};
use crate::names::TemplateName;
use crate::packages::{Package, PackageChanges};
use crate::pm::{
    run_with_diff, Action, BackendEnv, BackendKind, Backends, GroupInfo, MetadataSource,
    Transaction, TransactionOptions,
};
use crate::template::{app_confdir, os_confdir, Technologies, TemplateSet};

fn utf8_tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
    let td = tempfile::tempdir().unwrap();
    let path = Utf8Path::from_path(td.path()).unwrap().to_owned();
    (td, path)
}

/// A template root in a temporary directory.
pub(crate) struct TemplateTree {
    _td: tempfile::TempDir,
    root: Utf8PathBuf,
}

impl TemplateTree {
    pub(crate) fn new() -> Self {
        let (_td, root) = utf8_tempdir();
        Self { _td, root }
    }

    pub(crate) fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn basedir(&self, base: &str) -> Utf8PathBuf {
        let tname: TemplateName = base.parse().unwrap();
        tname.base_dir(&self.root)
    }

    pub(crate) fn os_dir(&self, base: &str, variant: &str) -> Utf8PathBuf {
        os_confdir(&self.basedir(base), variant)
    }

    pub(crate) fn app_dir(&self, base: &str, app: &str) -> Utf8PathBuf {
        app_confdir(&self.basedir(base), app)
    }

    pub(crate) fn os_file(&self, base: &str, variant: &str, file: &str, contents: &str) {
        let dir = self.os_dir(base, variant);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(file), contents).unwrap();
    }

    /// (Re)write the default OS template of `base`, an rpm/yum x86_64 one.
    pub(crate) fn base(&self, base: &str, packages: &[&str], repositories: &[&str]) {
        self.os_file(base, "default", "packages", &lines(packages));
        self.os_file(base, "default", "repositories", &lines(repositories));
        self.os_file(base, "default", "package_manager", "rpm49x64\n");
    }

    pub(crate) fn app(&self, base: &str, app: &str, packages: &[&str], repositories: &[&str]) {
        let dir = self.app_dir(base, app);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("packages"), lines(packages)).unwrap();
        std::fs::write(dir.join("repositories"), lines(repositories)).unwrap();
    }
}

fn lines(items: &[&str]) -> String {
    items.iter().map(|s| format!("{s}\n")).collect()
}

#[derive(Debug, Clone)]
struct FakeContainer {
    config: ContainerConfig,
    status: ContainerStatus,
}

#[derive(Debug, Default)]
struct FakeContainersState {
    containers: BTreeMap<String, FakeContainer>,
    events: Vec<String>,
    /// Operations (by event verb) that fail.
    failing: HashSet<String>,
}

/// In-memory containers; private areas live in a temporary directory.
/// Clones share state.
#[derive(Debug, Clone)]
pub(crate) struct FakeContainers {
    dir: Rc<tempfile::TempDir>,
    state: Rc<RefCell<FakeContainersState>>,
    locks: LockManager,
}

impl Default for FakeContainers {
    fn default() -> Self {
        Self {
            dir: Rc::new(tempfile::tempdir().unwrap()),
            state: Default::default(),
            locks: LockManager::new(false),
        }
    }
}

impl FakeContainers {
    fn path(&self) -> &Utf8Path {
        Utf8Path::from_path(self.dir.path()).unwrap()
    }

    /// A running container using `ostemplate` and application templates `apps`.
    pub(crate) fn add(&self, ctid: &str, ostemplate: &str, apps: &[&str]) -> ContainerConfig {
        let private = self.path().join("private").join(ctid);
        let root = self.path().join("root").join(ctid);
        std::fs::create_dir_all(&private).unwrap();
        std::fs::create_dir_all(&root).unwrap();
        let config = ContainerConfig {
            ctid: ctid.to_string(),
            ostemplate: ostemplate.to_string(),
            templates: apps.iter().map(|s| s.to_string()).collect(),
            technologies: Technologies::X86_64,
            private,
            root,
            exclude: Vec::new(),
        };
        self.state.borrow_mut().containers.insert(
            ctid.to_string(),
            FakeContainer {
                config: config.clone(),
                status: ContainerStatus {
                    exists: true,
                    mounted: true,
                    running: true,
                },
            },
        );
        config
    }

    pub(crate) fn set_status(&self, ctid: &str, status: ContainerStatus) {
        if let Some(c) = self.state.borrow_mut().containers.get_mut(ctid) {
            c.status = status;
        }
    }

    pub(crate) fn set_exclude(&self, ctid: &str, exclude: &[&str]) {
        if let Some(c) = self.state.borrow_mut().containers.get_mut(ctid) {
            c.config.exclude = exclude.iter().map(|s| s.to_string()).collect();
        }
    }

    pub(crate) fn fail(&self, verb: &str) {
        self.state.borrow_mut().failing.insert(verb.to_string());
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.state.borrow().events.clone()
    }

    pub(crate) fn current(&self, ctid: &str) -> ContainerConfig {
        self.state.borrow().containers[ctid].config.clone()
    }

    pub(crate) fn current_status(&self, ctid: &str) -> ContainerStatus {
        self.state.borrow().containers[ctid].status
    }

    fn event(&self, verb: &str, ctid: &str, detail: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if !state.containers.contains_key(ctid) {
            return Err(anyhow!("No container {ctid}"));
        }
        let mut e = format!("{verb} {ctid}");
        if !detail.is_empty() {
            e.push(' ');
            e.push_str(detail);
        }
        state.events.push(e);
        if state.failing.contains(verb) {
            return Err(anyhow!("{verb} of {ctid} failed"));
        }
        Ok(())
    }

    fn update(&self, ctid: &str, f: impl FnOnce(&mut FakeContainer)) {
        if let Some(c) = self.state.borrow_mut().containers.get_mut(ctid) {
            f(c)
        }
    }
}

impl ContainerLifecycle for FakeContainers {
    fn config(&self, ctid: &str) -> Result<ContainerConfig> {
        self.state
            .borrow()
            .containers
            .get(ctid)
            .map(|c| c.config.clone())
            .ok_or_else(|| anyhow!("No container {ctid}"))
    }

    fn status(&self, ctid: &str) -> Result<ContainerStatus> {
        Ok(self
            .state
            .borrow()
            .containers
            .get(ctid)
            .map(|c| c.status)
            .unwrap_or_default())
    }

    fn lock(&self, ctid: &str, state: ContainerLockState) -> Result<ContainerLock> {
        let path = self.path().join(format!("{ctid}.lck"));
        let handle = self.locks.try_acquire(&path, LockMode::Write)?;
        Ok(ContainerLock::new(ctid, state, Some(handle)))
    }

    fn mount(&self, ctid: &str) -> Result<()> {
        self.event("mount", ctid, "")?;
        self.update(ctid, |c| c.status.mounted = true);
        Ok(())
    }

    fn umount(&self, ctid: &str) -> Result<()> {
        self.event("umount", ctid, "")?;
        self.update(ctid, |c| c.status.mounted = false);
        Ok(())
    }

    fn start(&self, ctid: &str) -> Result<()> {
        self.event("start", ctid, "")?;
        self.update(ctid, |c| {
            c.status.running = true;
            c.status.mounted = true;
        });
        Ok(())
    }

    fn stop(&self, ctid: &str) -> Result<()> {
        self.event("stop", ctid, "")?;
        self.update(ctid, |c| {
            c.status.running = false;
            c.status.mounted = false;
        });
        Ok(())
    }

    fn save_templates(&self, ctid: &str, templates: &[String]) -> Result<()> {
        self.event("save_templates", ctid, &templates.join(" "))?;
        self.update(ctid, |c| c.config.templates = templates.to_vec());
        Ok(())
    }

    fn set_os_template(&self, ctid: &str, ostemplate: &str, tech: Technologies) -> Result<()> {
        self.event("set_os_template", ctid, ostemplate)?;
        self.update(ctid, |c| {
            c.config.ostemplate = ostemplate.to_string();
            c.config.technologies = tech;
        });
        Ok(())
    }

    fn run_script(&self, ctid: &str, script: &Utf8Path) -> Result<()> {
        self.event("script", ctid, script.as_str())
    }

    fn list(&self) -> Result<Vec<String>> {
        Ok(self.state.borrow().containers.keys().cloned().collect())
    }
}

/// Shared state of all transactions opened by one [`FakeBackends`].
#[derive(Debug, Default)]
pub(crate) struct FakeState {
    /// Installed packages per root directory.
    pub(crate) installed: HashMap<Utf8PathBuf, Vec<Package>>,
    /// What the repositories offer.
    pub(crate) available: Vec<Package>,
    pub(crate) groups: HashMap<String, GroupInfo>,
    pub(crate) fetches: usize,
    /// Templates whose metadata fetch fails.
    pub(crate) fail_fetch: HashSet<String>,
    /// Actions whose execution fails.
    pub(crate) fail_action: Option<Action>,
    pub(crate) actions: Vec<(Action, Vec<String>)>,
    pub(crate) downloads: Vec<String>,
    pub(crate) cleaned: usize,
    pub(crate) fixed: usize,
    /// Repository URLs of the last opened transaction.
    pub(crate) repositories: Vec<String>,
    pub(crate) exclusions: Vec<String>,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct FakeBackends {
    state: Rc<RefCell<FakeState>>,
}

impl FakeBackends {
    pub(crate) fn state(&self) -> Ref<'_, FakeState> {
        self.state.borrow()
    }

    pub(crate) fn state_mut(&self) -> RefMut<'_, FakeState> {
        self.state.borrow_mut()
    }

    pub(crate) fn install(&self, root: &Utf8Path, packages: &[Package]) {
        self.state_mut()
            .installed
            .insert(root.to_owned(), packages.to_vec());
    }

    pub(crate) fn installed(&self, root: &Utf8Path) -> Vec<Package> {
        let mut v = self
            .state()
            .installed
            .get(root)
            .cloned()
            .unwrap_or_default();
        v.sort();
        v
    }
}

impl Backends for FakeBackends {
    fn open(
        &self,
        kind: BackendKind,
        config: &GlobalConfig,
        set: &TemplateSet,
        opts: &TransactionOptions,
    ) -> Result<Box<dyn Transaction>> {
        let env = BackendEnv::new(kind, config, set, opts)?;
        self.state_mut().repositories = env.repositories.iter().map(|r| r.url.clone()).collect();
        Ok(Box::new(FakeBackend {
            env,
            state: self.state.clone(),
        }))
    }
}

/// Transaction over [`FakeState`].  Installing picks the highest
/// available build of a name; upgrading replaces every installed package
/// that is available in another build.
#[derive(Debug)]
pub(crate) struct FakeBackend {
    env: BackendEnv,
    state: Rc<RefCell<FakeState>>,
}

impl FakeBackend {
    fn best(&self, name: &str) -> Option<Package> {
        let state = self.state.borrow();
        state
            .available
            .iter()
            .filter(|p| p.name == name)
            .max_by(|a, b| self.env.kind.compare_versions(&a.evr, &b.evr))
            .cloned()
    }

    fn apply(&mut self, action: Action, targets: &[String]) -> Result<()> {
        let root = self.env.root()?.to_owned();
        {
            let mut state = self.state.borrow_mut();
            state.actions.push((action, targets.to_vec()));
            if state.fail_action == Some(action) {
                return Err(VzttError::Backend {
                    backend: "fake".into(),
                    message: format!("{action:?} failed"),
                }
                .into());
            }
        }
        if self.env.test {
            return Ok(());
        }
        let mut installed = self
            .state
            .borrow()
            .installed
            .get(&root)
            .cloned()
            .unwrap_or_default();
        let names: Vec<String> = if action.is_group() {
            let state = self.state.borrow();
            targets
                .iter()
                .filter_map(|g| state.groups.get(g))
                .flat_map(|g| g.mandatory.iter().chain(g.default.iter()).cloned())
                .collect()
        } else {
            targets
                .iter()
                .filter(|t| !self.env.is_excluded(t))
                .cloned()
                .collect()
        };
        match action {
            Action::Remove | Action::GroupRemove => {
                installed.retain(|p| !names.contains(&p.name));
            }
            Action::Upgrade | Action::Update | Action::GroupUpdate | Action::LocalUpdate => {
                let all = (names.is_empty() && action == Action::Update) || action == Action::Upgrade;
                for p in installed.iter_mut() {
                    if !(all || names.contains(&p.name)) || self.env.is_excluded(&p.name) {
                        continue;
                    }
                    if let Some(best) = self.best(&p.name) {
                        if self.env.kind.compare_versions(&best.evr, &p.evr)
                            == std::cmp::Ordering::Greater
                        {
                            *p = best;
                        }
                    }
                }
            }
            _ => {
                for name in &names {
                    if installed.iter().any(|p| &p.name == name) {
                        continue;
                    }
                    let p = self
                        .best(name)
                        .ok_or_else(|| VzttError::Backend {
                            backend: "fake".into(),
                            message: format!("No package {name} available"),
                        })?;
                    installed.push(p);
                }
            }
        }
        self.state.borrow_mut().installed.insert(root, installed);
        Ok(())
    }
}

impl Transaction for FakeBackend {
    fn env(&self) -> &BackendEnv {
        &self.env
    }

    fn env_mut(&mut self) -> &mut BackendEnv {
        &mut self.env
    }

    fn set_exclusions(&mut self, patterns: &[String]) -> Result<()> {
        self.state.borrow_mut().exclusions.extend(patterns.iter().cloned());
        for p in patterns {
            self.env.exclude(p)?;
        }
        Ok(())
    }

    fn fetch_metadata(&mut self, source: &MetadataSource) -> Result<Vec<Package>> {
        let mut state = self.state.borrow_mut();
        if state.fail_fetch.contains(&source.template) {
            return Err(VzttError::Backend {
                backend: "fake".into(),
                message: format!("Cannot fetch {}", source.template),
            }
            .into());
        }
        state.fetches += 1;
        let cache = self.env.cache_dir(&source.template);
        std::fs::create_dir_all(&cache)?;
        let urls: Vec<&str> = source.repositories.iter().map(|r| r.url.as_str()).collect();
        std::fs::write(cache.join("repomd"), urls.join("\n"))?;
        Ok(state.available.clone())
    }

    fn run(&mut self, action: Action, targets: &[String]) -> Result<PackageChanges> {
        run_with_diff(self, |tx| tx.apply(action, targets))
    }

    fn list_installed(&mut self) -> Result<Vec<Package>> {
        let root = self.env.root()?;
        Ok(self
            .state
            .borrow()
            .installed
            .get(root)
            .cloned()
            .unwrap_or_default())
    }

    fn list_available(&mut self, name: Option<&str>) -> Result<Vec<Package>> {
        Ok(self
            .state
            .borrow()
            .available
            .iter()
            .filter(|p| name.map_or(true, |n| p.name == n))
            .cloned()
            .collect())
    }

    fn group_info(&mut self, name: &str) -> Result<GroupInfo> {
        self.state
            .borrow()
            .groups
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("No group {name}"))
    }

    fn download(&mut self, targets: &[String]) -> Result<()> {
        self.state.borrow_mut().downloads.extend(targets.iter().cloned());
        Ok(())
    }

    fn clean_local_cache(&mut self) -> Result<()> {
        self.state.borrow_mut().cleaned += 1;
        Ok(())
    }

    fn fix_package_database(&mut self) -> Result<()> {
        self.state.borrow_mut().fixed += 1;
        Ok(())
    }
}
