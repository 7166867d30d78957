//! Packages, package-set arithmetic, and the per-container package record.
//!
//! The record lives at `<private>/templates/vzpackages` and holds one
//! package per line in the form `name:arch evr summary`.  It is the
//! durable view of what the template system installed into a container
//! and is only rewritten after a backend operation fully succeeded.

// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::Dir;
use cap_std_ext::cap_std;
use cap_std_ext::prelude::CapStdExtDirExt;
use fn_error_context::context;
use serde::Serialize;

/// Directory below the private area holding template records.
pub const RECORD_DIR: &str = "templates";
/// Name of the package record inside [`RECORD_DIR`].
pub const RECORD_NAME: &str = "vzpackages";

/// How a package took part in the last operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PackageMark {
    #[default]
    Unchanged,
    Added,
    Removed,
    Updated,
    Converted,
}

/// A package identified by name, architecture and epoch-version-release.
/// Equality and ordering ignore the description and the mark.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Package {
    pub name: String,
    pub arch: String,
    pub evr: String,
    pub description: String,
    pub mark: PackageMark,
}

impl Package {
    pub fn new(name: &str, arch: &str, evr: &str) -> Self {
        Self {
            name: name.to_string(),
            arch: arch.to_string(),
            evr: evr.to_string(),
            ..Default::default()
        }
    }

    /// `name:arch`, the key a package keeps across updates.
    pub fn key(&self) -> (&str, &str) {
        (&self.name, &self.arch)
    }

    fn ident(&self) -> (&str, &str, &str) {
        (&self.name, &self.arch, &self.evr)
    }

    /// Parse one record line: `name:arch evr [summary]`.
    pub fn parse_record_line(line: &str) -> Result<Self> {
        let mut it = line.splitn(3, char::is_whitespace);
        let namearch = it.next().unwrap_or_default();
        let (name, arch) = namearch
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("Malformed package entry: {line}"))?;
        let evr = it
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("Malformed package entry: {line}"))?;
        Ok(Self {
            description: it.next().unwrap_or_default().trim().to_string(),
            ..Self::new(name, arch, evr)
        })
    }

    pub fn to_record_line(&self) -> String {
        let mut s = format!("{}:{} {}", self.name, self.arch, self.evr);
        if !self.description.is_empty() {
            s.push(' ');
            s.push_str(&self.description);
        }
        s
    }
}

impl std::fmt::Display for Package {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}.{}", self.name, self.evr, self.arch)
    }
}

impl PartialEq for Package {
    fn eq(&self, other: &Self) -> bool {
        self.ident() == other.ident()
    }
}
impl Eq for Package {}

impl Hash for Package {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ident().hash(state)
    }
}

impl PartialOrd for Package {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Package {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ident().cmp(&other.ident())
    }
}

/// What a backend operation changed.  An updated package shows up as the
/// old build in `removed` and the new one in `added`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageChanges {
    pub added: Vec<Package>,
    pub removed: Vec<Package>,
}

impl PackageChanges {
    /// Compute the changes between two listings of installed packages.
    pub fn between(before: &[Package], after: &[Package]) -> Self {
        let before_set: BTreeSet<&Package> = before.iter().collect();
        let after_set: BTreeSet<&Package> = after.iter().collect();
        Self {
            added: after_set.difference(&before_set).map(|p| (*p).clone()).collect(),
            removed: before_set.difference(&after_set).map(|p| (*p).clone()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// New builds of packages that were present before, keyed by `name:arch`.
    pub fn updated(&self) -> Vec<Package> {
        let removed: BTreeSet<_> = self.removed.iter().map(Package::key).collect();
        self.added
            .iter()
            .filter(|p| removed.contains(&p.key()))
            .cloned()
            .map(|p| Package {
                mark: PackageMark::Updated,
                ..p
            })
            .collect()
    }

    /// Packages that are new, not new builds.
    pub fn newly_added(&self) -> Vec<Package> {
        let removed: BTreeSet<_> = self.removed.iter().map(Package::key).collect();
        self.added
            .iter()
            .filter(|p| !removed.contains(&p.key()))
            .cloned()
            .map(|p| Package {
                mark: PackageMark::Added,
                ..p
            })
            .collect()
    }

    /// Packages that are gone entirely, not replaced by a new build.
    pub fn gone(&self) -> Vec<Package> {
        let added: BTreeSet<_> = self.added.iter().map(Package::key).collect();
        self.removed
            .iter()
            .filter(|p| !added.contains(&p.key()))
            .cloned()
            .map(|p| Package {
                mark: PackageMark::Removed,
                ..p
            })
            .collect()
    }

    pub fn extend(&mut self, other: PackageChanges) {
        self.added.extend(other.added);
        self.removed.extend(other.removed);
    }
}

/// Apply `changes` to `snapshot`: drop removed packages, add new ones.
/// The result is sorted and free of duplicates.
pub fn merge_changes(snapshot: &[Package], changes: &PackageChanges) -> Vec<Package> {
    let removed: BTreeSet<&Package> = changes.removed.iter().collect();
    let mut result: BTreeSet<Package> = snapshot
        .iter()
        .filter(|p| !removed.contains(p))
        .cloned()
        .collect();
    result.extend(changes.added.iter().cloned());
    result.into_iter().collect()
}

/// Path of the package record for a private area.
pub fn record_path(private: &Utf8Path) -> Utf8PathBuf {
    private.join(RECORD_DIR).join(RECORD_NAME)
}

/// Read a container's package record; a missing record is empty.
#[context("Reading package record of {private}")]
pub fn read_record(private: &Utf8Path) -> Result<Vec<Package>> {
    let path = record_path(private);
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Reading {path}")),
    };
    contents
        .lines()
        .map(str::trim)
        .filter(|l| !(l.is_empty() || l.starts_with('#')))
        .map(Package::parse_record_line)
        .collect()
}

/// Atomically replace a container's package record.
#[context("Writing package record of {private}")]
pub fn write_record(private: &Utf8Path, packages: &[Package]) -> Result<()> {
    let privdir = Dir::open_ambient_dir(private, cap_std::ambient_authority())?;
    privdir.create_dir_all(RECORD_DIR)?;
    let dir = privdir.open_dir(RECORD_DIR)?;
    let mut sorted: Vec<&Package> = packages.iter().collect();
    sorted.sort();
    sorted.dedup();
    let mut contents = String::new();
    for p in sorted {
        contents.push_str(&p.to_record_line());
        contents.push('\n');
    }
    dir.atomic_write(RECORD_NAME, contents.as_bytes())?;
    tracing::debug!("Wrote {} with {} packages", record_path(private), packages.len());
    Ok(())
}
