//! Pre/post lifecycle scripts shipped in template config directories.

// SPDX-License-Identifier: Apache-2.0 OR MIT

use anyhow::{Context, Result};
use camino::Utf8PathBuf;

use crate::container::ContainerLifecycle;
use crate::pm::Action;
use crate::template::{Describable, TemplateRef, TemplateSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pre,
    Post,
}

/// `pre-install`, `post-upgrade` and so on.
pub fn script_name(phase: Phase, action: Action) -> String {
    let prefix = match phase {
        Phase::Pre => "pre",
        Phase::Post => "post",
    };
    format!("{prefix}-{}", action.script_stem())
}

/// Scripts of `members` for `phase` of `action`, each path once, in
/// member order.
pub fn collect(
    set: &TemplateSet,
    members: &[TemplateRef],
    phase: Phase,
    action: Action,
) -> Vec<(String, Utf8PathBuf)> {
    let name = script_name(phase, action);
    let mut scripts: Vec<(String, Utf8PathBuf)> = Vec::new();
    for &r in members {
        if let Some(path) = set.script(r, &name) {
            if !scripts.iter().any(|(_, p)| *p == path) {
                scripts.push((set.get(r).name().to_string(), path));
            }
        }
    }
    scripts
}

/// Run the scripts of `members` inside container `ctid`.  Nothing runs in
/// test mode.
pub fn run(
    containers: &dyn ContainerLifecycle,
    ctid: &str,
    set: &TemplateSet,
    members: &[TemplateRef],
    phase: Phase,
    action: Action,
    test: bool,
) -> Result<()> {
    for (template, path) in collect(set, members, phase, action) {
        if test {
            tracing::debug!("Skipping {path} of {template} in test mode");
            continue;
        }
        tracing::info!("Running {} script of {template}", script_name(phase, action));
        containers
            .run_script(ctid, &path)
            .with_context(|| format!("{} script of {template} failed", script_name(phase, action)))?;
    }
    Ok(())
}
