//! Repository metadata freshness and refresh.
//!
//! The metadata of template `T` with base directory `B` is the list of
//! packages its repositories offer, kept in `B/.metadata/T`.  The file's
//! modification time is what freshness is judged by.  Application
//! templates with identical repository sets share metadata: the later
//! one becomes a symlink to the earlier one's file and gets a copy of
//! the backend's side files.

// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::str::FromStr;
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::Dir;
use cap_std_ext::cap_std;
use cap_std_ext::prelude::CapStdExtDirExt;
use fn_error_context::context;

use crate::lock::{LockHandle, LockManager, LockMode};
use crate::packages::Package;
use crate::pm::Transaction;
use crate::template::{Describable, RepositoryHolder, RepositoryKey, TemplateRef, TemplateSet};

/// Directory below a base dir holding metadata files.
pub const METADATA_DIR: &str = ".metadata";

/// Where package metadata may come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DataSource {
    /// Refresh when older than the configured expiry.
    #[default]
    Default,
    /// Use whatever is cached, however old.
    Local,
    /// Always refresh.
    Remote,
}

impl FromStr for DataSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "default" => Ok(DataSource::Default),
            "local" | "cache" => Ok(DataSource::Local),
            "remote" => Ok(DataSource::Remote),
            o => Err(anyhow!("Unknown data source: {o}")),
        }
    }
}

pub fn metadata_path(basedir: &Utf8Path, template: &str) -> Utf8PathBuf {
    basedir.join(METADATA_DIR).join(template)
}

/// Whether the metadata of `template` needs a refresh.
pub fn is_stale(
    basedir: &Utf8Path,
    template: &str,
    expire: u64,
    source: DataSource,
) -> Result<bool> {
    if source == DataSource::Remote {
        return Ok(true);
    }
    let path = metadata_path(basedir, template);
    let mtime = match std::fs::metadata(&path) {
        Ok(m) => m.modified()?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e).with_context(|| format!("Querying {path}")),
    };
    if source == DataSource::Local {
        return Ok(false);
    }
    // a timestamp in the future counts as fresh
    let age = SystemTime::now()
        .duration_since(mtime)
        .unwrap_or(Duration::ZERO);
    Ok(age > Duration::from_secs(expire))
}

#[context("Writing metadata of {template}")]
pub fn write_metadata(basedir: &Utf8Path, template: &str, packages: &[Package]) -> Result<()> {
    let base = Dir::open_ambient_dir(basedir, cap_std::ambient_authority())?;
    base.create_dir_all(METADATA_DIR)?;
    let dir = base.open_dir(METADATA_DIR)?;
    // replace an alias rather than writing through it
    if dir.symlink_metadata_optional(template)?.is_some_and(|m| m.file_type().is_symlink()) {
        dir.remove_file(template)?;
    }
    let mut contents = String::new();
    for p in packages {
        contents.push_str(&format!("{} {} {}\n", p.name, p.arch, p.evr));
    }
    dir.atomic_write(template, contents.as_bytes())?;
    Ok(())
}

/// Packages recorded for `template`; absent metadata is empty.
#[context("Reading metadata of {template}")]
pub fn read_metadata(basedir: &Utf8Path, template: &str) -> Result<Vec<Package>> {
    let path = metadata_path(basedir, template);
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Reading {path}")),
    };
    contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| match l.split_whitespace().collect::<Vec<_>>().as_slice() {
            [name, arch, evr] => Ok(Package::new(name, arch, evr)),
            _ => Err(anyhow!("Malformed metadata line in {path}: {l}")),
        })
        .collect()
}

/// Make `template`'s metadata an alias of `existing`'s.
#[context("Sharing metadata of {existing} with {template}")]
fn alias_metadata(
    tx: &mut dyn Transaction,
    basedir: &Utf8Path,
    existing: &str,
    template: &str,
) -> Result<()> {
    let dir = basedir.join(METADATA_DIR);
    let link = dir.join(template);
    if link.symlink_metadata().is_ok() {
        std::fs::remove_file(&link).with_context(|| format!("Removing {link}"))?;
    }
    std::os::unix::fs::symlink(existing, &link).with_context(|| format!("Creating {link}"))?;
    tx.clone_metadata(existing, template)
}

/// What [`MetadataUpdate::run`] did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MetadataReport {
    pub fetched: Vec<String>,
    /// `(template, shared-with)` pairs.
    pub aliased: Vec<(String, String)>,
    pub failed: Vec<String>,
}

pub struct MetadataUpdate<'a> {
    pub locks: &'a LockManager,
    pub lock_timeout: u64,
    pub expire: u64,
    pub source: DataSource,
}

impl MetadataUpdate<'_> {
    fn fetch(
        &self,
        tx: &mut dyn Transaction,
        set: &TemplateSet,
        r: TemplateRef,
    ) -> Result<()> {
        let source = set.metadata_source(r);
        let packages = tx.fetch_metadata(&source)?;
        write_metadata(&set.base.basedir, &source.template, &packages)
    }

    /// Take the write lock of `basedir` unless already held.
    fn lock(&self, held: &mut Option<LockHandle>, basedir: &Utf8Path) -> Result<()> {
        if held.is_none() {
            *held = Some(self.locks.lock_dir(basedir, LockMode::Write, self.lock_timeout)?);
        }
        Ok(())
    }

    /// Refresh stale metadata of the base and of the marked variants and
    /// application templates that have repositories of their own.  The
    /// base must succeed; other failures are logged and skipped.
    #[context("Updating metadata of {}", set.base.attrs.name)]
    pub fn run(&self, tx: &mut dyn Transaction, set: &TemplateSet) -> Result<MetadataReport> {
        let basedir = &set.base.basedir;
        let mut report = MetadataReport::default();
        let mut held: Option<LockHandle> = None;

        let base = set.base.name();
        if set.base.has_repositories() && is_stale(basedir, base, self.expire, self.source)? {
            self.lock(&mut held, basedir)?;
            tracing::info!("Updating metadata of {base}");
            if let Err(e) = self.fetch(tx, set, TemplateRef::Base) {
                tracing::error!("Cannot update metadata of {base}: {e:#}");
                return Err(e);
            }
            report.fetched.push(base.to_string());
        }

        let mut fresh: Vec<(RepositoryKey, String)> = Vec::new();
        for r in set.marked() {
            if r == TemplateRef::Base {
                continue;
            }
            let t = set.get(r);
            let name = t.name().to_string();
            if !t.has_repositories() || !is_stale(basedir, &name, self.expire, self.source)? {
                continue;
            }
            if let Err(e) = self.lock(&mut held, basedir) {
                tracing::warn!("Skipping metadata of {name}: {e:#}");
                report.failed.push(name);
                continue;
            }
            let key = t.repository_key();
            let shared = match r {
                TemplateRef::App(_) => fresh.iter().find(|(k, _)| *k == key).map(|(_, n)| n.clone()),
                _ => None,
            };
            let result = match &shared {
                Some(existing) => {
                    tracing::info!("Sharing metadata of {existing} with {name}");
                    alias_metadata(tx, basedir, existing, &name)
                }
                None => {
                    tracing::info!("Updating metadata of {name}");
                    self.fetch(tx, set, r)
                }
            };
            match (result, shared) {
                (Err(e), _) => {
                    tracing::warn!("Cannot update metadata of {name}: {e:#}");
                    report.failed.push(name);
                }
                (Ok(()), Some(existing)) => report.aliased.push((name, existing)),
                (Ok(()), None) => {
                    if matches!(r, TemplateRef::App(_)) {
                        fresh.push((key, name.clone()));
                    }
                    report.fetched.push(name);
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobalConfig;
    use crate::errors::{error_code, ErrorCode};
    use crate::pm::{Backends, TransactionOptions};
    use crate::template::{LoadMask, MarkMask};
    use crate::testutils::{FakeBackends, TemplateTree};

    const OS: &str = "centos-7-x86_64";

    fn backdate(path: &Utf8Path, secs: u64) {
        let f = std::fs::File::options().write(true).open(path).unwrap();
        f.set_modified(SystemTime::now() - Duration::from_secs(secs))
            .unwrap();
    }

    #[test]
    fn freshness() -> Result<()> {
        let tree = TemplateTree::new();
        tree.base(OS, &["bash"], &["http://base"]);
        let basedir = tree.root().join("centos/7/x86_64");
        assert!(is_stale(&basedir, OS, 3600, DataSource::Default)?);
        assert!(is_stale(&basedir, OS, 3600, DataSource::Local)?);

        write_metadata(&basedir, OS, &[Package::new("bash", "x86_64", "4.2.46-34.el7")])?;
        assert!(!is_stale(&basedir, OS, 3600, DataSource::Default)?);
        assert!(is_stale(&basedir, OS, 3600, DataSource::Remote)?);

        backdate(&metadata_path(&basedir, OS), 7200);
        assert!(is_stale(&basedir, OS, 3600, DataSource::Default)?);
        assert!(!is_stale(&basedir, OS, 3600, DataSource::Local)?);
        assert!(!is_stale(&basedir, OS, 86400, DataSource::Default)?);

        assert_eq!(
            read_metadata(&basedir, OS)?,
            vec![Package::new("bash", "x86_64", "4.2.46-34.el7")]
        );
        Ok(())
    }

    fn setup() -> (TemplateTree, TemplateSet, FakeBackends) {
        let tree = TemplateTree::new();
        tree.base(OS, &["bash"], &["http://base"]);
        tree.app(OS, "php", &["php"], &["http://b", "http://a"]);
        tree.app(OS, "web", &["nginx"], &["http://a", "http://b"]);
        tree.app(OS, "zabbix", &["zabbix"], &["http://z"]);
        tree.app(OS, "local", &["tool"], &[]);
        let mut set = TemplateSet::load(
            tree.root(),
            OS,
            None,
            LoadMask::MINIMAL | LoadMask::APP_LIST,
        )
        .unwrap();
        set.mark(None, MarkMask::OS | MarkMask::APP_LIST).unwrap();
        (tree, set, FakeBackends::default())
    }

    #[test]
    fn identical_repositories_share_metadata() -> Result<()> {
        let (_tree, set, backends) = setup();
        let mut tx = backends.open(
            set.base.backend,
            &GlobalConfig::default(),
            &set,
            &TransactionOptions::default(),
        )?;
        let locks = LockManager::new(false);
        let update = MetadataUpdate {
            locks: &locks,
            lock_timeout: 5,
            expire: 3600,
            source: DataSource::Default,
        };
        let report = update.run(tx.as_mut(), &set)?;
        assert_eq!(report.fetched, vec![OS, "php", "zabbix"]);
        assert_eq!(report.aliased, vec![("web".to_string(), "php".to_string())]);
        assert!(report.failed.is_empty());
        // base, php and zabbix; web is shared and local has nothing to fetch
        assert_eq!(backends.state().fetches, 3);

        let basedir = &set.base.basedir;
        assert!(metadata_path(basedir, "web").is_symlink());
        assert_eq!(read_metadata(basedir, "web")?, read_metadata(basedir, "php")?);
        let cache = tx.env().cache_dir("web");
        assert!(cache.join("repomd").exists());

        // everything is fresh now
        let report = update.run(tx.as_mut(), &set)?;
        assert_eq!(report, MetadataReport::default());
        assert_eq!(backends.state().fetches, 3);
        Ok(())
    }

    #[test]
    fn secondary_failures_are_skipped() -> Result<()> {
        let (_tree, set, backends) = setup();
        backends.state_mut().fail_fetch.insert("zabbix".into());
        let mut tx = backends.open(
            set.base.backend,
            &GlobalConfig::default(),
            &set,
            &TransactionOptions::default(),
        )?;
        let locks = LockManager::new(false);
        let update = MetadataUpdate {
            locks: &locks,
            lock_timeout: 5,
            expire: 3600,
            source: DataSource::Remote,
        };
        let report = update.run(tx.as_mut(), &set)?;
        assert_eq!(report.failed, vec!["zabbix"]);
        assert!(report.fetched.contains(&"php".to_string()));

        backends.state_mut().fail_fetch.insert(OS.into());
        let e = update.run(tx.as_mut(), &set).unwrap_err();
        assert_eq!(error_code(&e), ErrorCode::Backend);
        Ok(())
    }

    #[test]
    fn base_lock_contention_is_fatal() -> Result<()> {
        let (_tree, set, backends) = setup();
        let mut tx = backends.open(
            set.base.backend,
            &GlobalConfig::default(),
            &set,
            &TransactionOptions::default(),
        )?;
        let locks = LockManager::new(false);
        let _held = locks.lock_dir(&set.base.basedir, LockMode::Read, 0)?;
        let update = MetadataUpdate {
            locks: &locks,
            lock_timeout: 1,
            expire: 3600,
            source: DataSource::Default,
        };
        let e = update.run(tx.as_mut(), &set).unwrap_err();
        assert_eq!(error_code(&e), ErrorCode::LockTimeout);
        assert_eq!(backends.state().fetches, 0);
        Ok(())
    }
}
