//! Operations on containers and templates.
//!
//! Every operation runs against a [`Vztt`], which bundles the host
//! configuration, the invocation options, the lock manager and the two
//! collaborators: the container lifecycle and the package-manager
//! backends.

// SPDX-License-Identifier: Apache-2.0 OR MIT

use anyhow::Result;
use fn_error_context::context;

use crate::config::GlobalConfig;
use crate::container::{
    ContainerConfig, ContainerLifecycle, ContainerLock, ContainerLockState, Vzctl,
};
use crate::errors::VzttError;
use crate::lock::{LockHandle, LockManager, LockMode};
use crate::metadata::{DataSource, MetadataReport, MetadataUpdate};
use crate::packages::{read_record, write_record, Package};
use crate::pm::{Backends, HostBackends, Transaction, TransactionOptions};
use crate::template::{LoadMask, MarkMask, TemplateSet};

pub mod cache;
pub mod package;
pub mod template;
pub mod upgrade;

pub use package::ActionReport;
pub use template::{TemplateInfo, TemplateKind};
pub use upgrade::{
    default_policy, DeclaredVersions, FirstOf, NextVersion, UpgradeCandidate, UpgradeOutcome,
    UpgradePolicy,
};

/// Per-invocation options.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Dry run: the backend runs in test mode and nothing is persisted.
    pub test: bool,
    pub force: bool,
    /// Targets are package names rather than application templates.
    pub packages: bool,
    pub data_source: DataSource,
    pub skip_lock: bool,
    /// Do not inherit base repositories in variants and applications.
    pub separate_repo: bool,
}

pub struct Vztt {
    pub config: GlobalConfig,
    pub opts: Options,
    pub locks: LockManager,
    containers: Box<dyn ContainerLifecycle>,
    backends: Box<dyn Backends>,
}

/// Keeps a container mounted for the duration of an operation, if it
/// had to be mounted for it.
pub(crate) struct MountGuard<'a> {
    containers: &'a dyn ContainerLifecycle,
    ctid: String,
    mounted_here: bool,
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        if self.mounted_here {
            if let Err(e) = self.containers.umount(&self.ctid) {
                tracing::warn!("Unmounting container {}: {e:#}", self.ctid);
            }
        }
    }
}

impl Vztt {
    pub fn new(
        config: GlobalConfig,
        opts: Options,
        containers: Box<dyn ContainerLifecycle>,
        backends: Box<dyn Backends>,
    ) -> Self {
        let locks = LockManager::new(opts.skip_lock);
        Self {
            config,
            opts,
            locks,
            containers,
            backends,
        }
    }

    /// Operate on the containers and package managers of this host.
    pub fn host(config: GlobalConfig, opts: Options) -> Self {
        let containers = Box::new(Vzctl::new(LockManager::new(opts.skip_lock)));
        Self::new(config, opts, containers, Box::new(HostBackends))
    }

    pub(crate) fn containers(&self) -> &dyn ContainerLifecycle {
        self.containers.as_ref()
    }

    pub(crate) fn load_set(
        &self,
        ostemplate: &str,
        apps: Option<&[String]>,
        mask: LoadMask,
    ) -> Result<TemplateSet> {
        let mut set = TemplateSet::load(&self.config.template_root, ostemplate, apps, mask)?;
        set.separate_repo = self.opts.separate_repo;
        Ok(set)
    }

    /// Open a transaction over the marked members of `set`.
    pub(crate) fn open(&self, set: &TemplateSet) -> Result<Box<dyn Transaction>> {
        let opts = TransactionOptions {
            test: self.opts.test,
        };
        self.backends
            .open(set.base.backend, &self.config, set, &opts)
    }

    /// Refresh stale metadata of the marked members of `set`.
    pub(crate) fn refresh(
        &self,
        tx: &mut dyn Transaction,
        set: &TemplateSet,
    ) -> Result<MetadataReport> {
        MetadataUpdate {
            locks: &self.locks,
            lock_timeout: self.config.lock_timeout,
            expire: self.config.metadata_expire,
            source: self.opts.data_source,
        }
        .run(tx, set)
    }

    pub(crate) fn template_lock(&self, set: &TemplateSet, mode: LockMode) -> Result<LockHandle> {
        self.locks
            .lock_dir(&set.base.basedir, mode, self.config.lock_timeout)
    }

    pub(crate) fn container_lock(&self, ctid: &str) -> Result<ContainerLock> {
        let state = if self.opts.test {
            ContainerLockState::CheckUpdating
        } else {
            ContainerLockState::Updating
        };
        self.containers.lock(ctid, state)
    }

    /// Make sure the private area of `cfg`'s container is reachable.
    pub(crate) fn ensure_mounted(&self, cfg: &ContainerConfig) -> Result<MountGuard<'_>> {
        let status = self.containers.status(&cfg.ctid)?;
        if !status.exists {
            tracing::error!("Container {} does not exist", cfg.ctid);
            return Err(VzttError::BadContainerState {
                ctid: cfg.ctid.clone(),
                reason: "does not exist".into(),
            }
            .into());
        }
        let mounted_here = !(status.mounted || status.running);
        if mounted_here {
            self.containers.mount(&cfg.ctid)?;
        }
        Ok(MountGuard {
            containers: self.containers.as_ref(),
            ctid: cfg.ctid.clone(),
            mounted_here,
        })
    }

    /// Host-wide exclusions followed by the container's own.
    pub(crate) fn exclusions(&self, cfg: &ContainerConfig) -> Vec<String> {
        let mut v = self.config.exclude.clone();
        v.extend(cfg.exclude.iter().cloned());
        v
    }

    /// The package record of a container.
    #[context("Listing packages of container {ctid}")]
    pub fn list_packages(&self, ctid: &str) -> Result<Vec<Package>> {
        let cfg = self.containers.config(ctid)?;
        read_record(&cfg.private)
    }

    /// Repair the backend's package database inside a container and
    /// rebuild the package record from what is actually installed.
    #[context("Fixing package database of container {ctid}")]
    pub fn fix_package_db(&self, ctid: &str) -> Result<Vec<Package>> {
        let cfg = self.containers.config(ctid)?;
        let _mount = self.ensure_mounted(&cfg)?;
        let mut set = self.load_set(&cfg.ostemplate, None, LoadMask::MINIMAL)?;
        set.mark(None, MarkMask::OS)?;
        let mut tx = self.open(&set)?;
        tx.set_root_directory(&cfg.root);
        let _ct = self.container_lock(ctid)?;
        tx.fix_package_database()?;
        let mut installed = tx.list_installed()?;
        installed.sort();
        if !self.opts.test {
            write_record(&cfg.private, &installed)?;
        }
        Ok(installed)
    }

    /// Linking container files to template files is not supported.
    pub fn link(&self, _ctid: &str) -> Result<()> {
        Err(VzttError::Unsupported("link").into())
    }

    /// Conversion of VZFS containers is not supported.
    pub fn vzfs_upgrade(&self, _ctid: &str) -> Result<()> {
        Err(VzttError::Unsupported("vzfs upgrade").into())
    }
}
