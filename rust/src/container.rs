//! The container-lifecycle collaborator.
//!
//! Orchestrators never touch container state directly; they go through a
//! [`ContainerLifecycle`].  [`Vzctl`] is the host implementation backed by
//! `/etc/vz/conf/<ctid>.conf` and the `vzctl` tool.

// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::process::Command;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::Dir;
use cap_std_ext::cap_std;
use cap_std_ext::prelude::CapStdExtDirExt;
use fn_error_context::context;
use ini::Ini;

use crate::cmdutils::CommandRunExt;
use crate::errors::VzttError;
use crate::lock::{LockHandle, LockManager, LockMode};
use crate::template::Technologies;

/// Per-container configuration directory.
pub const VZ_CONF_DIR: &str = "/etc/vz/conf";
/// Directory holding container lock files.
pub const VZ_LOCK_DIR: &str = "/vz/lock";

/// Per-container configuration, as far as templates are concerned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerConfig {
    pub ctid: String,
    pub ostemplate: String,
    /// Application templates recorded for the container.
    pub templates: Vec<String>,
    pub technologies: Technologies,
    pub private: Utf8PathBuf,
    pub root: Utf8PathBuf,
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContainerStatus {
    pub exists: bool,
    pub mounted: bool,
    pub running: bool,
}

/// What a container lock announces to other tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerLockState {
    Updating,
    /// Held by dry-run operations.
    CheckUpdating,
}

impl ContainerLockState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerLockState::Updating => "updating",
            ContainerLockState::CheckUpdating => "check-updating",
        }
    }
}

/// A held container lock; released on drop.
#[derive(Debug)]
#[must_use = "the container is unlocked when the lock is dropped"]
pub struct ContainerLock {
    pub ctid: String,
    pub state: ContainerLockState,
    handle: Option<LockHandle>,
}

impl ContainerLock {
    pub fn new(ctid: &str, state: ContainerLockState, handle: Option<LockHandle>) -> Self {
        Self {
            ctid: ctid.to_string(),
            state,
            handle,
        }
    }
}

impl Drop for ContainerLock {
    fn drop(&mut self) {
        if self.handle.take().is_some() {
            tracing::debug!("Container {} unlocked", self.ctid);
        }
    }
}

pub trait ContainerLifecycle {
    fn config(&self, ctid: &str) -> Result<ContainerConfig>;

    fn status(&self, ctid: &str) -> Result<ContainerStatus>;

    /// Lock a container without waiting.  Contention is
    /// [`VzttError::AlreadyLocked`].
    fn lock(&self, ctid: &str, state: ContainerLockState) -> Result<ContainerLock>;

    fn mount(&self, ctid: &str) -> Result<()>;

    fn umount(&self, ctid: &str) -> Result<()>;

    fn start(&self, ctid: &str) -> Result<()>;

    fn stop(&self, ctid: &str) -> Result<()>;

    /// Persist the application template membership.
    fn save_templates(&self, ctid: &str, templates: &[String]) -> Result<()>;

    /// Persist a new OS template and its technologies.
    fn set_os_template(&self, ctid: &str, ostemplate: &str, tech: Technologies) -> Result<()>;

    /// Run a lifecycle script inside the container.
    fn run_script(&self, ctid: &str, script: &Utf8Path) -> Result<()>;

    /// Identifiers of all containers with a private area on this host.
    fn list(&self) -> Result<Vec<String>>;
}

/// Strip shell quoting from a config value.
fn unquote(v: &str) -> &str {
    let v = v.trim();
    v.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(v)
}

/// Parse a container config file.
pub(crate) fn parse_config(ctid: &str, contents: &str) -> Result<ContainerConfig> {
    let i = Ini::load_from_str(contents).context("Parsing container config")?;
    let general = i.general_section();
    let get = |k: &str| {
        general
            .get(k)
            .map(|v| unquote(v).replace("${VEID}", ctid).replace("$VEID", ctid))
    };
    let words = |k: &str| -> Result<Vec<String>> {
        let v = get(k).unwrap_or_default();
        shlex::split(&v).ok_or_else(|| anyhow!("Invalid syntax in {k}: {v}"))
    };
    let ostemplate = get("OSTEMPLATE")
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("OSTEMPLATE is not set for container {ctid}"))?;
    // OSTEMPLATE may carry a leading '.' marking an OS template
    let ostemplate = ostemplate.trim_start_matches('.').to_string();
    let technologies = words("TECHNOLOGIES")?;
    let technologies = Technologies::from_names(technologies.iter().map(|s| s.as_str()))?;
    Ok(ContainerConfig {
        ctid: ctid.to_string(),
        ostemplate,
        templates: words("TEMPLATES")?
            .into_iter()
            .map(|t| t.trim_start_matches('.').to_string())
            .collect(),
        technologies,
        private: get("VE_PRIVATE").unwrap_or_default().into(),
        root: get("VE_ROOT").unwrap_or_default().into(),
        exclude: words("EXCLUDE")?,
    })
}

/// Set `key` in shell-style config text, replacing an existing
/// assignment or appending one.
pub(crate) fn set_config_value(contents: &str, key: &str, value: &str) -> String {
    let assignment = format!("{key}=\"{value}\"");
    let prefix = format!("{key}=");
    let mut found = false;
    let mut out: Vec<String> = contents
        .lines()
        .map(|l| {
            if l.trim_start().starts_with(&prefix) {
                found = true;
                assignment.clone()
            } else {
                l.to_string()
            }
        })
        .collect();
    if !found {
        out.push(assignment);
    }
    let mut s = out.join("\n");
    s.push('\n');
    s
}

/// Parse `vzctl status` output: `CTID 101 exist mounted running`.
pub(crate) fn parse_status(output: &str) -> ContainerStatus {
    let words: Vec<&str> = output.split_whitespace().collect();
    ContainerStatus {
        exists: words.contains(&"exist"),
        mounted: words.contains(&"mounted"),
        running: words.contains(&"running"),
    }
}

/// Containers managed by `vzctl` on this host.
#[derive(Debug, Clone)]
pub struct Vzctl {
    confdir: Utf8PathBuf,
    lockdir: Utf8PathBuf,
    locks: LockManager,
}

impl Vzctl {
    pub fn new(locks: LockManager) -> Self {
        Self {
            confdir: VZ_CONF_DIR.into(),
            lockdir: VZ_LOCK_DIR.into(),
            locks,
        }
    }

    fn conf_path(&self, ctid: &str) -> Utf8PathBuf {
        self.confdir.join(format!("{ctid}.conf"))
    }

    fn vzctl(&self, verb: &str, ctid: &str) -> Result<()> {
        Command::new("vzctl")
            .args(["--quiet", verb, ctid])
            .log_debug()
            .run_backend("vzctl")
            .with_context(|| format!("vzctl {verb} {ctid}"))
    }

    #[context("Updating config of container {ctid}")]
    fn update_config(&self, ctid: &str, values: &[(&str, String)]) -> Result<()> {
        let path = self.conf_path(ctid);
        let mut contents =
            std::fs::read_to_string(&path).with_context(|| format!("Reading {path}"))?;
        for (k, v) in values {
            contents = set_config_value(&contents, k, v);
        }
        let dir = Dir::open_ambient_dir(&self.confdir, cap_std::ambient_authority())?;
        dir.atomic_write(format!("{ctid}.conf"), contents.as_bytes())?;
        Ok(())
    }
}

impl ContainerLifecycle for Vzctl {
    #[context("Loading config of container {ctid}")]
    fn config(&self, ctid: &str) -> Result<ContainerConfig> {
        let path = self.conf_path(ctid);
        let contents = std::fs::read_to_string(&path).with_context(|| format!("Reading {path}"))?;
        parse_config(ctid, &contents)
    }

    fn status(&self, ctid: &str) -> Result<ContainerStatus> {
        let out = Command::new("vzctl")
            .args(["status", ctid])
            .log_debug()
            .run_get_string()?;
        Ok(parse_status(&out))
    }

    fn lock(&self, ctid: &str, state: ContainerLockState) -> Result<ContainerLock> {
        let path = self.lockdir.join(format!("{ctid}.lck"));
        let handle = match self.locks.try_acquire(&path, LockMode::Write) {
            Ok(h) => h,
            Err(e) => {
                tracing::error!("Cannot lock container {ctid}: {e}");
                return Err(e);
            }
        };
        if handle.is_held() {
            std::fs::write(&path, format!("{}\n{}\n", std::process::id(), state.as_str()))
                .with_context(|| format!("Writing {path}"))
                .context(VzttError::CannotLock(format!("container {ctid}")))?;
        }
        tracing::debug!("Container {ctid} locked ({})", state.as_str());
        Ok(ContainerLock::new(ctid, state, Some(handle)))
    }

    fn mount(&self, ctid: &str) -> Result<()> {
        self.vzctl("mount", ctid)
    }

    fn umount(&self, ctid: &str) -> Result<()> {
        self.vzctl("umount", ctid)
    }

    fn start(&self, ctid: &str) -> Result<()> {
        self.vzctl("start", ctid)
    }

    fn stop(&self, ctid: &str) -> Result<()> {
        self.vzctl("stop", ctid)
    }

    fn save_templates(&self, ctid: &str, templates: &[String]) -> Result<()> {
        self.update_config(ctid, &[("TEMPLATES", templates.join(" "))])
    }

    fn set_os_template(&self, ctid: &str, ostemplate: &str, tech: Technologies) -> Result<()> {
        self.update_config(
            ctid,
            &[
                ("OSTEMPLATE", ostemplate.to_string()),
                ("TECHNOLOGIES", tech.names().join(" ")),
            ],
        )
    }

    fn run_script(&self, ctid: &str, script: &Utf8Path) -> Result<()> {
        Command::new("vzctl")
            .args(["--quiet", "runscript", ctid])
            .arg(script)
            .log_debug()
            .run_backend("vzctl")
            .with_context(|| format!("Running {script} in container {ctid}"))
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in self
            .confdir
            .read_dir_utf8()
            .with_context(|| format!("Reading {}", self.confdir))?
        {
            let entry = entry?;
            if let Some(id) = entry.file_name().strip_suffix(".conf") {
                if !(id.is_empty() || id.starts_with("ve-") || id == "0") {
                    ids.push(id.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn config() {
        let c = parse_config(
            "101",
            indoc! {r#"
                # comment
                OSTEMPLATE=".centos-7-x86_64"
                TEMPLATES="web db"
                TECHNOLOGIES="x86_64 nptl"
                VE_ROOT="/vz/root/$VEID"
                VE_PRIVATE="/vz/private/${VEID}"
                EXCLUDE="kernel*"
            "#},
        )
        .unwrap();
        similar_asserts::assert_eq!(
            c,
            ContainerConfig {
                ctid: "101".into(),
                ostemplate: "centos-7-x86_64".into(),
                templates: vec!["web".into(), "db".into()],
                technologies: Technologies::X86_64 | Technologies::NPTL,
                private: "/vz/private/101".into(),
                root: "/vz/root/101".into(),
                exclude: vec!["kernel*".into()],
            }
        );
        assert!(parse_config("101", "VE_ROOT=/x\n").is_err());
    }

    #[test]
    fn set_value() {
        let s = set_config_value("A=\"1\"\nTEMPLATES=\"web\"\n", "TEMPLATES", "web db");
        assert_eq!(s, "A=\"1\"\nTEMPLATES=\"web db\"\n");
        let s = set_config_value("A=\"1\"\n", "OSTEMPLATE", "centos-8-x86_64");
        assert_eq!(s, "A=\"1\"\nOSTEMPLATE=\"centos-8-x86_64\"\n");
    }

    #[test]
    fn status() {
        assert_eq!(
            parse_status("CTID 101 exist mounted running\n"),
            ContainerStatus {
                exists: true,
                mounted: true,
                running: true
            }
        );
        assert_eq!(
            parse_status("CTID 102 deleted unmounted down\n"),
            ContainerStatus::default()
        );
    }

    #[test]
    fn container_lock_contention() -> Result<()> {
        let td = tempfile::tempdir()?;
        let mut vz = Vzctl::new(LockManager::new(false));
        vz.lockdir = Utf8Path::from_path(td.path()).unwrap().to_owned();
        let held = vz.lock("101", ContainerLockState::Updating)?;
        let e = vz.lock("101", ContainerLockState::CheckUpdating).unwrap_err();
        assert_eq!(
            crate::errors::error_code(&e),
            crate::errors::ErrorCode::AlreadyLocked
        );
        let contents = std::fs::read_to_string(vz.lockdir.join("101.lck"))?;
        assert!(contents.ends_with("updating\n"));
        drop(held);
        let _again = vz.lock("101", ContainerLockState::CheckUpdating)?;
        Ok(())
    }
}
