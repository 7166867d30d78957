//! Upgrading a container to a newer release of its OS template.
//!
//! Which release a template may be upgraded to is decided by an
//! [`UpgradePolicy`].  Templates announce the releases they replace in
//! their `upgradable_versions` file and [`DeclaredVersions`] follows those
//! declarations; when forced, [`NextVersion`] also accepts the release
//! whose major version directly follows the current one.

// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::cmp::Ordering;
use std::collections::BTreeSet;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use serde::Serialize;

use super::package::missing_packages;
use super::Vztt;
use crate::errors::VzttError;
use crate::lock::LockMode;
use crate::metadata::read_metadata;
use crate::names::TemplateName;
use crate::packages::{merge_changes, read_record, write_record, Package, PackageMark};
use crate::pm::evr::rpmvercmp;
use crate::pm::Action;
use crate::scripts::{self, Phase};
use crate::sigint::SigintGuard;
use crate::template::{BaseTemplate, LoadMask, MarkMask, DEFAULT_VARIANT};

/// A base template the current one could be upgraded to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeCandidate {
    pub name: TemplateName,
    /// Versions this template declares it can replace.
    pub upgradable_versions: Vec<String>,
}

/// Picks the upgrade target of `source` among `candidates`.
pub trait UpgradePolicy {
    fn select(&self, source: &TemplateName, candidates: &[UpgradeCandidate])
        -> Option<TemplateName>;
}

fn same_line<'a>(
    source: &'a TemplateName,
    candidates: &'a [UpgradeCandidate],
) -> impl Iterator<Item = &'a UpgradeCandidate> {
    candidates.iter().filter(move |c| {
        c.name.os == source.os && c.name.arch == source.arch && c.name.version != source.version
    })
}

fn newest<'a>(it: impl Iterator<Item = &'a UpgradeCandidate>) -> Option<TemplateName> {
    it.max_by(|a, b| rpmvercmp(&a.name.version, &b.name.version))
        .map(|c| c.name.clone())
}

/// Upgrade to the newest template declaring the current version upgradable.
#[derive(Debug, Default)]
pub struct DeclaredVersions;

impl UpgradePolicy for DeclaredVersions {
    fn select(
        &self,
        source: &TemplateName,
        candidates: &[UpgradeCandidate],
    ) -> Option<TemplateName> {
        newest(
            same_line(source, candidates)
                .filter(|c| c.upgradable_versions.contains(&source.version)),
        )
    }
}

/// Upgrade to the newest template of the next major version.
#[derive(Debug, Default)]
pub struct NextVersion;

fn major(version: &str) -> Option<u64> {
    let digits: String = version.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

impl UpgradePolicy for NextVersion {
    fn select(
        &self,
        source: &TemplateName,
        candidates: &[UpgradeCandidate],
    ) -> Option<TemplateName> {
        let next = major(&source.version)?.checked_add(1)?;
        newest(same_line(source, candidates).filter(|c| major(&c.name.version) == Some(next)))
    }
}

/// The first policy with an answer wins.
pub struct FirstOf(pub Vec<Box<dyn UpgradePolicy>>);

impl UpgradePolicy for FirstOf {
    fn select(
        &self,
        source: &TemplateName,
        candidates: &[UpgradeCandidate],
    ) -> Option<TemplateName> {
        self.0.iter().find_map(|p| p.select(source, candidates))
    }
}

pub fn default_policy(force: bool) -> Box<dyn UpgradePolicy> {
    if force {
        Box::new(FirstOf(vec![Box::new(DeclaredVersions), Box::new(NextVersion)]))
    } else {
        Box::new(DeclaredVersions)
    }
}

/// Other installed releases of `source`'s OS and architecture.
#[context("Looking for upgrades of {source}")]
pub fn upgrade_candidates(root: &Utf8Path, source: &TemplateName) -> Result<Vec<UpgradeCandidate>> {
    let osdir = root.join(&source.os);
    if !osdir.try_exists()? {
        return Ok(Vec::new());
    }
    let mut candidates = Vec::new();
    for entry in osdir.read_dir_utf8().with_context(|| format!("Reading {osdir}"))? {
        let entry = entry?;
        let version = entry.file_name();
        if version == source.version || !entry.file_type()?.is_dir() {
            continue;
        }
        let name = source.with_version(version);
        if !name.base_dir(root).join("config/os").join(DEFAULT_VARIANT).is_dir() {
            continue;
        }
        match BaseTemplate::load(root, &name, LoadMask::UPGRADABLE) {
            Ok(base) => candidates.push(UpgradeCandidate {
                name,
                upgradable_versions: base.upgradable_versions,
            }),
            Err(e) => tracing::warn!("Skipping {name}: {e:#}"),
        }
    }
    candidates.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(candidates)
}

/// How the packages of a container fared in an upgrade.  Every package of
/// the new record is in exactly one of `updated`, `added`, `converted` and
/// `unchanged`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpgradeOutcome {
    pub from: String,
    pub to: String,
    pub updated: Vec<Package>,
    pub added: Vec<Package>,
    pub removed: Vec<Package>,
    /// Untouched packages re-resolved against the new template's metadata.
    pub converted: Vec<Package>,
    pub unchanged: Vec<Package>,
}

fn with_mark(mut pkgs: Vec<Package>, mark: PackageMark) -> Vec<Package> {
    for p in pkgs.iter_mut() {
        p.mark = mark;
    }
    pkgs
}

impl Vztt {
    /// Upgrade container `ctid` following the default policy.
    pub fn upgrade(&self, ctid: &str) -> Result<UpgradeOutcome> {
        self.upgrade_with(ctid, default_policy(self.opts.force).as_ref())
    }

    #[context("Upgrading container {ctid}")]
    pub fn upgrade_with(&self, ctid: &str, policy: &dyn UpgradePolicy) -> Result<UpgradeOutcome> {
        let cfg = self.containers().config(ctid)?;
        let _mount = self.ensure_mounted(&cfg)?;

        let source: TemplateName = cfg.ostemplate.parse()?;
        let candidates = upgrade_candidates(&self.config.template_root, &source)?;
        let target = policy
            .select(&source, &candidates)
            .map(|t| t.with_variant(source.variant.as_deref()))
            .ok_or_else(|| {
                tracing::error!("No upgrade of {source} found");
                VzttError::UpgradeTarget(source.to_string())
            })?;
        tracing::info!("Upgrading {ctid} from {source} to {target}");

        let mut set = self
            .load_set(
                &target.to_string(),
                None,
                LoadMask::MINIMAL | LoadMask::ARCH_PACKAGES | LoadMask::APP_LIST,
            )?
            .with_used_apps(&cfg.templates);
        set.mark(None, MarkMask::OS | MarkMask::USED_APP_LIST)?;
        set.check_pkg_actions()?;
        let mut tx = self.open(&set)?;
        self.refresh(tx.as_mut(), &set)?;
        tx.set_root_directory(&cfg.root);
        tx.set_exclusions(&self.exclusions(&cfg))?;

        let _ct = self.container_lock(ctid)?;
        let snapshot = read_record(&cfg.private)?;
        let os = [set.os()];
        let changes = {
            let _sigint = SigintGuard::block()?;
            let _tl = self.template_lock(&set, LockMode::Read)?;
            let test = self.opts.test;
            let containers = self.containers();
            scripts::run(containers, ctid, &set, &os, Phase::Pre, Action::Upgrade, test)?;
            let mut changes = tx.run(Action::Upgrade, &[])?;
            let missing = missing_packages(&set, &tx.list_installed()?);
            if !missing.is_empty() {
                tracing::info!("Installing {} packages of {target}", missing.len());
                changes.extend(tx.run(Action::Install, &missing)?);
            }
            if let Err(e) =
                scripts::run(containers, ctid, &set, &os, Phase::Post, Action::Upgrade, test)
            {
                tracing::warn!("{e:#}");
            }
            changes
        };

        let merged = merge_changes(&snapshot, &changes);
        let updated = changes.updated();
        let added = changes.newly_added();
        let touched: BTreeSet<&Package> = updated.iter().chain(added.iter()).collect();
        let provided = read_metadata(&set.base.basedir, set.base.attrs.name.as_str())?;
        // Untouched packages the target also ships in the same version are
        // re-resolved against its metadata; the rest stay as recorded.
        let mut record = Vec::with_capacity(merged.len());
        let (mut converted, mut unchanged) = (Vec::new(), Vec::new());
        for p in merged {
            if touched.contains(&p) {
                record.push(p);
                continue;
            }
            let same = provided.iter().find(|m| {
                m.name == p.name
                    && m.arch == p.arch
                    && tx.compare_versions(&m.evr, &p.evr) == Ordering::Equal
            });
            match same {
                Some(m) => {
                    let p = Package {
                        evr: m.evr.clone(),
                        ..p
                    };
                    converted.push(p.clone());
                    record.push(p);
                }
                None => {
                    unchanged.push(p.clone());
                    record.push(p);
                }
            }
        }
        record.sort();
        let outcome = UpgradeOutcome {
            from: source.to_string(),
            to: target.to_string(),
            updated,
            added,
            removed: changes.gone(),
            converted: with_mark(converted, PackageMark::Converted),
            unchanged,
        };

        if self.opts.test {
            tracing::info!("Test mode, not switching {ctid} to {target}");
            return Ok(outcome);
        }
        let running = self.containers().status(ctid)?.running;
        if running {
            self.containers().stop(ctid)?;
        }
        self.containers()
            .set_os_template(ctid, &outcome.to, set.base.technologies)?;
        write_record(&cfg.private, &record)?;
        let templates: Vec<String> = cfg
            .templates
            .iter()
            .filter(|t| set.app(t).is_some())
            .cloned()
            .collect();
        if templates != cfg.templates {
            self.containers().save_templates(ctid, &templates)?;
        }
        if running {
            self.containers().start(ctid)?;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{pkg, Host, OS};
    use super::super::Options;
    use super::*;
    use crate::errors::{error_code, ErrorCode};

    fn name(s: &str) -> TemplateName {
        s.parse().unwrap()
    }

    fn candidate(s: &str, versions: &[&str]) -> UpgradeCandidate {
        UpgradeCandidate {
            name: name(s),
            upgradable_versions: versions.iter().map(|v| v.to_string()).collect(),
        }
    }

    // Eligibility is an assumption encoded by the policies: declared
    // predecessor versions first, the next major version only when forced.
    #[test]
    fn policies() {
        let source = name("centos-7-x86_64");
        let candidates = [
            candidate("centos-8-x86_64", &["7"]),
            candidate("centos-9-x86_64", &["8"]),
            candidate("centos-10-x86_64", &["7", "8", "9"]),
            candidate("centos-11-x86", &["7"]),
        ];
        assert_eq!(
            DeclaredVersions.select(&source, &candidates),
            Some(name("centos-10-x86_64"))
        );
        assert_eq!(
            NextVersion.select(&source, &candidates),
            Some(name("centos-8-x86_64"))
        );

        let undeclared = [candidate("centos-8-x86_64", &["6"])];
        assert_eq!(DeclaredVersions.select(&source, &undeclared), None);
        assert_eq!(default_policy(false).select(&source, &undeclared), None);
        assert_eq!(
            default_policy(true).select(&source, &undeclared),
            Some(name("centos-8-x86_64"))
        );
        assert_eq!(NextVersion.select(&name("debian-sid-x86_64"), &undeclared), None);
    }

    fn upgradable_host() -> Host {
        let host = Host::new();
        host.tree.base(
            "centos-8-x86_64",
            &["bash", "coreutils", "dnf"],
            &["http://mirror/centos/8/os"],
        );
        host.tree
            .os_file("centos-8-x86_64", "default", "upgradable_versions", "6 7\n");
        host.backends.state_mut().available = vec![
            pkg("bash", "4.4.19-14.el8"),
            pkg("coreutils", "0:8.22-24.el7"),
            pkg("dnf", "4.7.0-4.el8"),
        ];
        let cfg = host.containers.current("101");
        let installed = [
            pkg("bash", "4.2.46-34.el7"),
            pkg("coreutils", "8.22-24.el7"),
            pkg("vim-minimal", "7.4.629-8.el7"),
        ];
        host.backends.install(&cfg.root, &installed);
        write_record(&cfg.private, &installed).unwrap();
        host
    }

    #[test]
    fn candidates_on_disk() -> Result<()> {
        let host = upgradable_host();
        host.tree.base("centos-9-x86_64", &["bash"], &[]);
        std::fs::create_dir_all(host.tree.root().join("centos/6/x86_64"))?;
        let found = upgrade_candidates(host.tree.root(), &name(OS))?;
        assert_eq!(
            found,
            vec![
                candidate("centos-8-x86_64", &["6", "7"]),
                candidate("centos-9-x86_64", &[])
            ]
        );
        Ok(())
    }

    #[test]
    fn upgrade_partitions_packages() -> Result<()> {
        let host = upgradable_host();
        let vz = host.vztt(Options::default());
        let before = vz.list_packages("101")?;
        let out = vz.upgrade("101")?;
        assert_eq!(out.from, "centos-7-x86_64");
        assert_eq!(out.to, "centos-8-x86_64");
        assert_eq!(out.updated, vec![pkg("bash", "4.4.19-14.el8")]);
        assert_eq!(out.added, vec![pkg("dnf", "4.7.0-4.el8")]);
        assert!(out.removed.is_empty());
        assert_eq!(out.converted, vec![pkg("coreutils", "0:8.22-24.el7")]);
        assert_eq!(out.converted[0].mark, PackageMark::Converted);
        assert_eq!(out.unchanged, vec![pkg("vim-minimal", "7.4.629-8.el7")]);

        // the new record is the old one, minus removed, replaced and
        // converted builds, plus updated, added and converted; no package
        // in two categories
        let after = vz.list_packages("101")?;
        assert!(after.contains(&pkg("coreutils", "0:8.22-24.el7")));
        assert!(!after.contains(&pkg("coreutils", "8.22-24.el7")));
        let mut expected: Vec<Package> = before
            .iter()
            .filter(|p| {
                !out.removed.contains(*p)
                    && !out
                        .updated
                        .iter()
                        .chain(&out.converted)
                        .any(|u| u.key() == p.key())
            })
            .cloned()
            .chain(out.updated.iter().cloned())
            .chain(out.added.iter().cloned())
            .chain(out.converted.iter().cloned())
            .collect();
        expected.sort();
        expected.dedup();
        assert_eq!(after, expected);
        let mut all: Vec<&Package> = out
            .updated
            .iter()
            .chain(&out.added)
            .chain(&out.removed)
            .chain(&out.converted)
            .chain(&out.unchanged)
            .collect();
        let n = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), n);
        assert_eq!(n - out.removed.len(), after.len());

        assert_eq!(
            host.containers.events(),
            vec!["stop 101", "set_os_template 101 centos-8-x86_64", "start 101"]
        );
        assert_eq!(host.containers.current("101").ostemplate, "centos-8-x86_64");
        let actions = host.backends.state().actions.clone();
        assert_eq!(actions[0], (Action::Upgrade, vec![]));
        assert_eq!(actions[1], (Action::Install, vec!["dnf".to_string()]));
        Ok(())
    }

    #[test]
    fn dry_run_keeps_container() -> Result<()> {
        let host = upgradable_host();
        let vz = host.vztt(Options {
            test: true,
            ..Default::default()
        });
        let before = vz.list_packages("101")?;
        let out = vz.upgrade("101")?;
        assert_eq!(out.to, "centos-8-x86_64");
        assert!(out.updated.is_empty());
        assert_eq!(vz.list_packages("101")?, before);
        assert!(host.containers.events().is_empty());
        assert_eq!(host.containers.current("101").ostemplate, OS);
        Ok(())
    }

    #[test]
    fn stop_failure_aborts() {
        let host = upgradable_host();
        host.containers.fail("stop");
        let vz = host.vztt(Options::default());
        assert!(vz.upgrade("101").is_err());
        assert_eq!(host.containers.current("101").ostemplate, OS);
        assert_eq!(host.containers.events(), vec!["stop 101"]);
    }

    #[test]
    fn no_target() {
        let host = Host::new();
        let vz = host.vztt(Options {
            force: true,
            ..Default::default()
        });
        let e = vz.upgrade("101").unwrap_err();
        assert_eq!(error_code(&e), ErrorCode::UpgradeTarget);
    }
}
