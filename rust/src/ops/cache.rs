//! Building, querying and dropping OS template caches.

// SPDX-License-Identifier: Apache-2.0 OR MIT

use anyhow::{anyhow, Context, Result};
use camino::Utf8PathBuf;
use fn_error_context::context;

use super::Vztt;
use crate::cache::{self, artifact_path, CacheFormat, CacheStatus};
use crate::container::{ContainerLock, ContainerLockState};
use crate::errors::VzttError;
use crate::lock::LockMode;
use crate::pm::Action;
use crate::template::{Describable, LoadMask, MarkMask};

/// Container ids reserved for building caches, tried in order.
pub const TEMPORARY_CTIDS: [&str; 2] = ["2147483647", "2147483646"];

impl Vztt {
    /// Status of every format's cache of `ostemplate`.
    pub fn cache_status(&self, ostemplate: &str) -> Result<Vec<CacheStatus>> {
        let set = self.load_set(ostemplate, None, LoadMask::PACKAGES)?;
        cache::status(
            &self.config.cache_dir,
            &set.base.basedir,
            set.get(set.os()).confdir(),
            set.os_name(),
        )
    }

    /// Remove the caches of `ostemplate` in `formats`, returning the
    /// artifacts that existed.
    #[context("Removing caches of {ostemplate}")]
    pub fn remove_cache(&self, ostemplate: &str, formats: CacheFormat) -> Result<Vec<Utf8PathBuf>> {
        let set = self.load_set(ostemplate, None, LoadMask::PACKAGES | LoadMask::CACHE_TYPE)?;
        let name = set.os_name();
        let mut removed = Vec::new();
        for format in formats.formats() {
            let artifact = artifact_path(&self.config.cache_dir, name, format);
            let _al = self.locks.lock_artifact(&artifact, LockMode::Write)?;
            match std::fs::remove_file(&artifact) {
                Ok(()) => {
                    tracing::info!("Removed {artifact}");
                    removed.push(artifact);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("Removing {artifact}")),
            }
        }
        let remaining = set.base.cache_type.difference(formats);
        if remaining != set.base.cache_type {
            cache::record_cache_type(set.base.confdir(), remaining)?;
        }
        Ok(removed)
    }

    /// Lock one of the reserved container ids for building a cache.
    pub(crate) fn temporary_container(&self) -> Result<ContainerLock> {
        for ctid in TEMPORARY_CTIDS {
            match self.containers().lock(ctid, ContainerLockState::Updating) {
                Ok(lock) => {
                    tracing::debug!("Using temporary container {ctid}");
                    return Ok(lock);
                }
                Err(e) => tracing::debug!("Temporary container {ctid}: {e:#}"),
            }
        }
        tracing::error!("All temporary container ids are in use");
        Err(VzttError::AlreadyLocked(format!("containers {}", TEMPORARY_CTIDS.join(" "))).into())
    }

    /// Build the `format` cache of `ostemplate`: install the OS template's
    /// packages into a scratch root and pack it.
    #[context("Creating cache of {ostemplate}")]
    pub fn create_cache(&self, ostemplate: &str, format: CacheFormat) -> Result<Utf8PathBuf> {
        if format.bits().count_ones() != 1 {
            return Err(anyhow!("Exactly one cache format is required, not {:?}", format.names()));
        }
        let mut set = self.load_set(
            ostemplate,
            None,
            LoadMask::MINIMAL | LoadMask::ARCH_PACKAGES | LoadMask::CACHE_TYPE,
        )?;
        set.mark(None, MarkMask::OS)?;
        set.check_pkg_actions()?;
        let targets: Vec<String> = set.marked_packages().into_iter().collect();

        std::fs::create_dir_all(&self.config.cache_dir)
            .with_context(|| format!("Creating {}", self.config.cache_dir))?;
        let artifact = artifact_path(&self.config.cache_dir, set.os_name(), format);
        let _al = self.locks.lock_artifact(&artifact, LockMode::Write)?;
        let _ct = self.temporary_container()?;

        let mut tx = self.open(&set)?;
        self.refresh(tx.as_mut(), &set)?;
        let root = tx.create_temporary_root()?;
        {
            let _tl = self.template_lock(&set, LockMode::Read)?;
            tx.run(Action::Install, &targets)?;
        }
        if self.opts.test {
            tracing::info!("Test mode, not packing {artifact}");
            return Ok(artifact);
        }
        cache::pack(&root, &artifact)?;
        cache::record_cache_type(set.base.confdir(), set.base.cache_type | format)?;
        tracing::info!("Created {artifact}");
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{Host, OS};
    use super::super::Options;
    use super::*;
    use crate::container::ContainerLifecycle;
    use crate::errors::{error_code, ErrorCode};

    #[test]
    fn temporary_ctid_fallback() -> Result<()> {
        let host = Host::new();
        let vz = host.vztt(Options::default());
        let held = host.containers.lock(TEMPORARY_CTIDS[0], ContainerLockState::Updating)?;
        let second = vz.temporary_container()?;
        assert_eq!(second.ctid, TEMPORARY_CTIDS[1]);
        let e = vz.temporary_container().unwrap_err();
        assert_eq!(error_code(&e), ErrorCode::AlreadyLocked);
        drop(held);
        assert_eq!(vz.temporary_container()?.ctid, TEMPORARY_CTIDS[0]);
        Ok(())
    }

    #[test]
    fn create_in_test_mode() -> Result<()> {
        let host = Host::new();
        let vz = host.vztt(Options {
            test: true,
            ..Default::default()
        });
        let artifact = vz.create_cache(OS, CacheFormat::PLOOP)?;
        assert_eq!(artifact.file_name(), Some("centos-7-x86_64-ploop.tar.gz"));
        assert!(!artifact.exists());
        let actions = host.backends.state().actions.clone();
        assert_eq!(
            actions,
            vec![(Action::Install, vec!["bash".to_string(), "coreutils".to_string()])]
        );
        assert!(vz
            .create_cache(OS, CacheFormat::PLOOP | CacheFormat::SIMFS)
            .is_err());
        Ok(())
    }

    #[test]
    fn status_and_removal() -> Result<()> {
        let host = Host::new();
        host.tree.os_file(OS, "default", "cache_type", "simfs ploop\n");
        let vz = host.vztt(Options::default());
        let cache = host.tree.root().join("cache");
        std::fs::create_dir_all(&cache)?;
        std::fs::write(cache.join("centos-7-x86_64.tar.gz"), "")?;

        let st = vz.cache_status(OS)?;
        let simfs = st.iter().find(|s| s.format == "simfs").unwrap();
        assert!(simfs.exists && simfs.up_to_date);
        assert!(!st.iter().find(|s| s.format == "ploop").unwrap().exists);

        let removed = vz.remove_cache(OS, CacheFormat::SIMFS | CacheFormat::VZFS)?;
        assert_eq!(removed, vec![cache.join("centos-7-x86_64.tar.gz")]);
        assert_eq!(
            std::fs::read_to_string(host.tree.os_dir(OS, "default").join("cache_type"))?,
            "ploop\n"
        );
        Ok(())
    }
}
