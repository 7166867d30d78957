//! The dpkg family driven through apt-get.

// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use super::{
    filter_excluded, run_with_diff, unsupported, Action, BackendEnv, GroupInfo, MetadataSource,
    Repository, RepositoryKind, Transaction,
};
use crate::cmdutils::CommandRunExt;
use crate::packages::{Package, PackageChanges};

const DPKG_QUERYFORMAT: &str =
    "${db:Status-Abbrev}|${Package}|${Architecture}|${Version}|${binary:Summary}\\n";

/// Render a sources.list for `repositories`.
pub(crate) fn render_sources_list(repositories: &[Repository]) -> String {
    repositories
        .iter()
        .map(|r| match r.kind {
            RepositoryKind::Mirror => format!("deb [trusted=yes] mirror+{}\n", r.url),
            _ => format!("deb [trusted=yes] {}\n", r.url),
        })
        .collect()
}

/// Parse `dpkg-query -W` output; only fully installed packages count.
pub(crate) fn parse_dpkg_query(output: &str) -> Vec<Package> {
    output
        .lines()
        .filter_map(|l| {
            let mut cols = l.splitn(5, '|');
            let status = cols.next()?;
            if status.trim() != "ii" {
                return None;
            }
            let (name, arch, version) = (cols.next()?, cols.next()?, cols.next()?);
            Some(Package {
                description: cols.next().unwrap_or_default().trim().to_string(),
                ..Package::new(name, arch, version)
            })
        })
        .collect()
}

/// Parse `apt-cache dumpavail` stanzas.
pub(crate) fn parse_dumpavail(output: &str) -> Vec<Package> {
    let mut pkgs = Vec::new();
    for stanza in output.split("\n\n") {
        let mut p = Package::default();
        for line in stanza.lines() {
            if let Some((k, v)) = line.split_once(": ") {
                match k {
                    "Package" => p.name = v.trim().to_string(),
                    "Architecture" => p.arch = v.trim().to_string(),
                    "Version" => p.evr = v.trim().to_string(),
                    "Description" => p.description = v.trim().to_string(),
                    _ => {}
                }
            }
        }
        if !(p.name.is_empty() || p.evr.is_empty()) {
            pkgs.push(p);
        }
    }
    pkgs
}

#[derive(Debug)]
pub struct DpkgTransaction {
    env: BackendEnv,
}

impl DpkgTransaction {
    pub fn new(env: BackendEnv) -> Self {
        Self { env }
    }

    /// `apt-get` bound to `repositories` and `cachedir`.
    fn apt(
        &self,
        program: &str,
        name: &str,
        repositories: &[Repository],
        cachedir: &Utf8Path,
    ) -> Result<Command> {
        let sources = self.env.workdir().join(format!("{name}.sources.list"));
        std::fs::write(&sources, render_sources_list(repositories))
            .with_context(|| format!("Writing {sources}"))?;
        let lists = cachedir.join("lists");
        std::fs::create_dir_all(lists.join("partial"))
            .with_context(|| format!("Creating {lists}"))?;
        let mut cmd = Command::new(program);
        cmd.args(["-o", "Debug::NoLocking=1"])
            .arg("-o")
            .arg(format!("Dir::Etc::SourceList={sources}"))
            .args(["-o", "Dir::Etc::SourceParts=-"])
            .arg("-o")
            .arg(format!("Dir::Cache={cachedir}"))
            .arg("-o")
            .arg(format!("Dir::State::Lists={lists}"));
        if let Ok(root) = self.env.root() {
            cmd.arg("-o")
                .arg(format!("DPkg::Options::=--root={root}"))
                .arg("-o")
                .arg(format!("Dir::State::status={root}/var/lib/dpkg/status"));
        }
        if let Some(proxy) = &self.env.proxy {
            cmd.arg("-o")
                .arg(format!("Acquire::http::Proxy={}", proxy.url));
        }
        self.env.apply_proxy(&mut cmd);
        Ok(cmd)
    }

    fn transaction_apt(&self, program: &str) -> Result<Command> {
        self.apt(
            program,
            "transaction",
            &self.env.repositories,
            &self.env.transaction_cache_dir(),
        )
    }

    /// The command carrying out `action` on `targets` in the root.
    fn action_command(&self, action: Action, targets: &[String]) -> Result<Command> {
        let root = self.env.root()?;
        let mut cmd = match action {
            Action::LocalInstall | Action::LocalUpdate => {
                let mut c = Command::new("dpkg");
                c.arg(format!("--root={root}"));
                if self.env.test {
                    c.arg("--dry-run");
                }
                c.arg("-i");
                c
            }
            Action::GroupInstall | Action::GroupUpdate | Action::GroupRemove => {
                return Err(unsupported("package groups with dpkg"))
            }
            _ => {
                let mut c = self.transaction_apt("apt-get")?;
                c.arg("-y");
                if self.env.test {
                    c.arg("-s");
                }
                match action {
                    Action::Install => c.arg("install"),
                    // nothing named: bring every installed package up to date
                    Action::Update if targets.is_empty() => c.arg("upgrade"),
                    Action::Update => c.args(["install", "--only-upgrade"]),
                    Action::Remove => c.arg("purge"),
                    _ => c.arg("dist-upgrade"),
                };
                c
            }
        };
        cmd.args(filter_excluded(&self.env, action, targets))
            .env("DEBIAN_FRONTEND", "noninteractive");
        Ok(cmd)
    }

    fn admindir(&self) -> Result<Utf8PathBuf> {
        Ok(self.env.root()?.join("var/lib/dpkg"))
    }
}

impl Transaction for DpkgTransaction {
    fn env(&self) -> &BackendEnv {
        &self.env
    }

    fn env_mut(&mut self) -> &mut BackendEnv {
        &mut self.env
    }

    #[context("Fetching metadata for {}", source.template)]
    fn fetch_metadata(&mut self, source: &MetadataSource) -> Result<Vec<Package>> {
        let cachedir = self.env.cache_dir(&source.template);
        std::fs::create_dir_all(&cachedir).with_context(|| format!("Creating {cachedir}"))?;
        self.apt("apt-get", &source.template, &source.repositories, &cachedir)?
            .arg("update")
            .log_debug()
            .run_backend("apt-get")?;
        let out = self
            .apt("apt-cache", &source.template, &source.repositories, &cachedir)?
            .arg("dumpavail")
            .log_debug()
            .run_get_string()?;
        Ok(parse_dumpavail(&out))
    }

    #[context("Running {action:?}")]
    fn run(&mut self, action: Action, targets: &[String]) -> Result<PackageChanges> {
        let mut cmd = self.action_command(action, targets)?;
        run_with_diff(self, |_| cmd.log_debug().run_backend("apt-get"))
    }

    fn list_installed(&mut self) -> Result<Vec<Package>> {
        let out = Command::new("dpkg-query")
            .arg(format!("--admindir={}", self.admindir()?))
            .args(["-W", "-f", DPKG_QUERYFORMAT])
            .log_debug()
            .run_get_string()?;
        Ok(parse_dpkg_query(&out))
    }

    fn list_available(&mut self, name: Option<&str>) -> Result<Vec<Package>> {
        let out = self
            .transaction_apt("apt-cache")?
            .arg("dumpavail")
            .log_debug()
            .run_get_string()?;
        let mut pkgs = parse_dumpavail(&out);
        if let Some(n) = name {
            pkgs.retain(|p| p.name == n);
        }
        Ok(pkgs)
    }

    fn group_info(&mut self, _name: &str) -> Result<GroupInfo> {
        Err(unsupported("package groups with dpkg"))
    }

    fn download(&mut self, targets: &[String]) -> Result<()> {
        self.transaction_apt("apt-get")?
            .args(["-y", "--download-only", "install"])
            .args(targets)
            .env("DEBIAN_FRONTEND", "noninteractive")
            .log_debug()
            .run_backend("apt-get")
    }

    fn clean_local_cache(&mut self) -> Result<()> {
        self.transaction_apt("apt-get")?
            .arg("clean")
            .log_debug()
            .run_backend("apt-get")
    }

    fn fix_package_database(&mut self) -> Result<()> {
        Command::new("dpkg")
            .arg(format!("--root={}", self.env.root()?))
            .args(["--configure", "-a"])
            .env("DEBIAN_FRONTEND", "noninteractive")
            .log_debug()
            .run_backend("dpkg")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn dpkg_query() {
        let pkgs = parse_dpkg_query(indoc! {"
            ii |bash|amd64|5.1-2+deb11u1|GNU Bourne Again SHell
            rc |oldpkg|amd64|1.0-1|removed, config left
            ii |libc6|amd64|2.31-13+deb11u5|GNU C Library: Shared libraries
        "});
        assert_eq!(
            pkgs,
            vec![
                Package::new("bash", "amd64", "5.1-2+deb11u1"),
                Package::new("libc6", "amd64", "2.31-13+deb11u5"),
            ]
        );
        assert_eq!(pkgs[1].description, "GNU C Library: Shared libraries");
    }

    #[test]
    fn dumpavail() {
        let pkgs = parse_dumpavail(indoc! {"
            Package: nginx
            Version: 1.18.0-6.1+deb11u3
            Architecture: amd64
            Description: small, powerful, scalable web/proxy server

            Package: tzdata
            Architecture: all
            Version: 2024a-0+deb11u1
        "});
        assert_eq!(
            pkgs,
            vec![
                Package::new("nginx", "amd64", "1.18.0-6.1+deb11u3"),
                Package::new("tzdata", "all", "2024a-0+deb11u1"),
            ]
        );
    }

    #[test]
    fn sources_list() {
        let repos = vec![
            Repository {
                id: "debian-11-x86_64-0".into(),
                kind: RepositoryKind::Base,
                url: "http://deb.debian.org/debian bullseye main".into(),
            },
            Repository {
                id: "debian-11-x86_64-mirror-0".into(),
                kind: RepositoryKind::Mirror,
                url: "http://mirrors/list.txt bullseye main".into(),
            },
        ];
        similar_asserts::assert_eq!(
            render_sources_list(&repos),
            "deb [trusted=yes] http://deb.debian.org/debian bullseye main\n\
             deb [trusted=yes] mirror+http://mirrors/list.txt bullseye main\n"
        );
    }

    fn args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn action_commands() -> Result<()> {
        let td = tempfile::tempdir()?;
        let base = Utf8Path::from_path(td.path()).unwrap();
        let mut env = BackendEnv::for_tests(super::super::BackendKind::Dpkg, base)?;
        env.set_root(&base.join("root"));
        env.exclude("vim*")?;
        let tx = DpkgTransaction::new(env);

        let all = args(&tx.action_command(Action::Update, &[])?);
        assert!(all.ends_with(&strings(&["-y", "upgrade"])), "{all:?}");
        assert!(!all.contains(&"--only-upgrade".to_string()));

        let some = args(&tx.action_command(Action::Update, &strings(&["bash"]))?);
        assert!(some.ends_with(&strings(&["install", "--only-upgrade", "bash"])));

        let install = args(&tx.action_command(Action::Install, &strings(&["vim-tiny", "bash"]))?);
        assert!(install.ends_with(&strings(&["install", "bash"])), "{install:?}");

        let remove = args(&tx.action_command(Action::Remove, &strings(&["vim-tiny"]))?);
        assert!(remove.ends_with(&strings(&["purge", "vim-tiny"])));

        let local = args(&tx.action_command(Action::LocalInstall, &strings(&["/tmp/a.deb"]))?);
        assert_eq!(local, strings(&[&format!("--root={base}/root"), "-i", "/tmp/a.deb"]));

        let e = tx.action_command(Action::GroupInstall, &strings(&["web"])).unwrap_err();
        assert_eq!(crate::errors::error_code(&e), crate::errors::ErrorCode::Unsupported);
        Ok(())
    }
}
