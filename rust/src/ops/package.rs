//! Package and application-template actions on a container.

// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::BTreeSet;

use anyhow::Result;
use fn_error_context::context;
use serde::Serialize;

use super::Vztt;
use crate::container::ContainerConfig;
use crate::errors::VzttError;
use crate::lock::LockMode;
use crate::packages::{merge_changes, read_record, write_record, Package, PackageChanges};
use crate::pm::Action;
use crate::scripts::{self, Phase};
use crate::sigint::SigintGuard;
use crate::template::{LoadMask, MarkMask, RepositoryHolder, TemplateRef, TemplateSet};

/// Result of a package action.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ActionReport {
    /// Packages the action added, removed or updated.
    pub packages: Vec<Package>,
    /// Application templates of the container afterwards.
    pub templates: Vec<String>,
}

impl ActionReport {
    fn new(changes: &PackageChanges, templates: Vec<String>) -> Self {
        let mut packages = changes.updated();
        packages.extend(changes.newly_added());
        packages.extend(changes.gone());
        packages.sort();
        Self {
            packages,
            templates,
        }
    }
}

/// What a package action operates on, once targets are resolved.
struct Plan {
    /// Package (or group, or file) names handed to the backend.
    targets: Vec<String>,
    /// Application templates named by the caller, if any.
    apps: Vec<String>,
    /// Members whose lifecycle scripts run around the action.
    scripted: Vec<TemplateRef>,
}

impl Vztt {
    pub fn install(&self, ctid: &str, targets: &[String]) -> Result<ActionReport> {
        self.package_action(ctid, Action::Install, targets)
    }

    /// Update `targets`, or everything when none are given.
    pub fn update(&self, ctid: &str, targets: &[String]) -> Result<ActionReport> {
        self.package_action(ctid, Action::Update, targets)
    }

    pub fn remove(&self, ctid: &str, targets: &[String]) -> Result<ActionReport> {
        self.package_action(ctid, Action::Remove, targets)
    }

    pub fn group_install(&self, ctid: &str, groups: &[String]) -> Result<ActionReport> {
        self.package_action(ctid, Action::GroupInstall, groups)
    }

    pub fn group_update(&self, ctid: &str, groups: &[String]) -> Result<ActionReport> {
        self.package_action(ctid, Action::GroupUpdate, groups)
    }

    pub fn group_remove(&self, ctid: &str, groups: &[String]) -> Result<ActionReport> {
        self.package_action(ctid, Action::GroupRemove, groups)
    }

    /// Install package files from the host filesystem.
    pub fn local_install(&self, ctid: &str, files: &[String]) -> Result<ActionReport> {
        self.package_action(ctid, Action::LocalInstall, files)
    }

    pub fn local_update(&self, ctid: &str, files: &[String]) -> Result<ActionReport> {
        self.package_action(ctid, Action::LocalUpdate, files)
    }

    /// Whether `targets` name application templates rather than packages.
    fn templates_mode(&self, action: Action, targets: &[String]) -> bool {
        !self.opts.packages
            && !targets.is_empty()
            && matches!(action, Action::Install | Action::Update | Action::Remove)
    }

    /// Resolve `targets` of `action` against the set and the container's
    /// current application templates.
    fn plan(
        &self,
        cfg: &ContainerConfig,
        set: &mut TemplateSet,
        action: Action,
        targets: &[String],
    ) -> Result<Plan> {
        if !self.templates_mode(action, targets) {
            set.mark(None, MarkMask::OS)?;
            set.check_pkg_actions()?;
            set.unmark_all();
            return Ok(Plan {
                targets: targets.to_vec(),
                apps: Vec::new(),
                scripted: vec![set.os()],
            });
        }

        for app in targets {
            let used = cfg.templates.contains(app);
            let err = match action {
                Action::Install if used => Some(VzttError::TemplateInstalled(app.clone())),
                Action::Update | Action::Remove if !used => {
                    Some(VzttError::TemplateNotInstalled(app.clone()))
                }
                _ => None,
            };
            match err {
                Some(e) if !self.opts.force => {
                    tracing::error!("{e}");
                    return Err(e.into());
                }
                Some(e) => tracing::warn!("{e}, continuing"),
                None => {}
            }
        }
        set.mark(Some(targets), MarkMask::APPS)?;
        set.check_pkg_actions()?;
        let scripted = set.marked();
        let mut packages = set.marked_packages();
        set.unmark_all();

        if action == Action::Remove {
            // keep what the OS and the remaining applications need
            let others: Vec<String> = cfg
                .templates
                .iter()
                .filter(|t| !targets.contains(*t) && set.app(t).is_some())
                .cloned()
                .collect();
            set.mark(Some(others.as_slice()), MarkMask::OS | MarkMask::APPS)?;
            let keep = set.marked_packages();
            packages.retain(|p| !keep.contains(p));
            set.unmark_all();
        }
        Ok(Plan {
            targets: packages.into_iter().collect(),
            apps: targets.to_vec(),
            scripted,
        })
    }

    /// Application templates of the container after a successful action.
    fn adjust_templates(
        &self,
        cfg: &ContainerConfig,
        set: &TemplateSet,
        action: Action,
        apps: &[String],
        installed: &[Package],
    ) -> Vec<String> {
        let mut templates: Vec<String> = cfg.templates.clone();
        match action {
            Action::Install => {
                for app in apps {
                    if !templates.contains(app) {
                        templates.push(app.clone());
                    }
                }
            }
            Action::Remove => templates.retain(|t| !apps.contains(t)),
            _ => {}
        }
        if self.config.app_autodetect {
            for app in set.detect_apps(installed) {
                if !templates.contains(&app) && !(action == Action::Remove && apps.contains(&app)) {
                    tracing::info!("Detected application template {app}");
                    templates.push(app);
                }
            }
        }
        templates
    }

    /// Run `action` on `targets` inside container `ctid`.
    #[context("{action:?} in container {ctid}")]
    pub(crate) fn package_action(
        &self,
        ctid: &str,
        action: Action,
        targets: &[String],
    ) -> Result<ActionReport> {
        let cfg = self.containers().config(ctid)?;
        let _mount = self.ensure_mounted(&cfg)?;

        let mut set = self
            .load_set(
                &cfg.ostemplate,
                None,
                LoadMask::MINIMAL | LoadMask::ARCH_PACKAGES | LoadMask::APP_LIST,
            )?
            .with_used_apps(&cfg.templates);
        let plan = self.plan(&cfg, &mut set, action, targets)?;

        set.mark(
            Some(plan.apps.as_slice()),
            MarkMask::OS | MarkMask::USED_APP_LIST | MarkMask::APPS,
        )?;
        // Templates whose packages are all shared or absent need no backend run,
        // but their membership still changes.
        let mut tx = if plan.targets.is_empty() && !targets.is_empty() {
            tracing::info!("No packages to change for {}", plan.apps.join(" "));
            None
        } else {
            let mut tx = self.open(&set)?;
            self.refresh(tx.as_mut(), &set)?;
            tx.set_root_directory(&cfg.root);
            tx.set_exclusions(&self.exclusions(&cfg))?;
            Some(tx)
        };

        let _ct = self.container_lock(ctid)?;
        let snapshot = read_record(&cfg.private)?;
        let changes = {
            let _sigint = SigintGuard::block()?;
            let _tl = self.template_lock(&set, LockMode::Read)?;
            let test = self.opts.test;
            let containers = self.containers();
            scripts::run(containers, ctid, &set, &plan.scripted, Phase::Pre, action, test)?;
            let changes = match tx.as_mut() {
                Some(tx) => tx.run(action, &plan.targets)?,
                None => PackageChanges::default(),
            };
            if let Err(e) =
                scripts::run(containers, ctid, &set, &plan.scripted, Phase::Post, action, test)
            {
                tracing::warn!("{e:#}");
            }
            changes
        };

        if self.opts.test {
            tracing::info!("Test mode, not recording changes");
            return Ok(ActionReport::new(&changes, cfg.templates));
        }
        let merged = merge_changes(&snapshot, &changes);
        write_record(&cfg.private, &merged)?;
        let templates = self.adjust_templates(&cfg, &set, action, &plan.apps, &merged);
        if templates != cfg.templates {
            self.containers().save_templates(ctid, &templates)?;
        }
        tracing::info!(
            "{action:?} in {ctid}: {} added, {} removed",
            changes.added.len(),
            changes.removed.len()
        );
        Ok(ActionReport::new(&changes, templates))
    }
}

/// Names of the packages in `set`'s marked members that are not installed.
pub(crate) fn missing_packages(set: &TemplateSet, installed: &[Package]) -> Vec<String> {
    let have: BTreeSet<&str> = installed.iter().map(|p| p.name.as_str()).collect();
    set.marked_packages()
        .into_iter()
        .filter(|p| !have.contains(p.as_str()))
        .collect()
}

/// Whether any marked member of `set` has repositories to install from.
pub(crate) fn has_sources(set: &TemplateSet) -> bool {
    set.marked().into_iter().any(|r| set.get(r).has_repositories())
}
