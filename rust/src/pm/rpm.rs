//! The rpm family driven through yum or dnf.

// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fmt::Write as _;
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use super::{
    evr, run_with_diff, Action, BackendEnv, BackendKind, GroupInfo, MetadataSource, Repository,
    RepositoryKind, Transaction,
};
use crate::cmdutils::CommandRunExt;
use crate::packages::{Package, PackageChanges};

/// Query format producing `name arch evr summary` lines; the epoch is
/// only printed when set.
pub(crate) const RPM_QUERYFORMAT: &str =
    "%{NAME} %{ARCH} %|EPOCH?{%{EPOCH}:}:{}|%{VERSION}-%{RELEASE} %{SUMMARY}\\n";
/// The same for `repoquery`, which always prints the epoch.
const REPOQUERY_FORMAT: &str = "%{name} %{arch} %{epoch}:%{version}-%{release} %{summary}";

/// Parse lines of `name arch evr [summary]`.
pub(crate) fn parse_package_lines(output: &str) -> Result<Vec<Package>> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| {
            let mut it = l.splitn(4, ' ');
            match (it.next(), it.next(), it.next()) {
                (Some(name), Some(arch), Some(v)) if !v.is_empty() => Ok(Package {
                    description: it.next().unwrap_or_default().trim().to_string(),
                    ..Package::new(name, arch, &evr::normalize(v))
                }),
                _ => Err(anyhow!("Unexpected package line: {l}")),
            }
        })
        .collect()
}

/// List packages in the rpm database below `root`.
#[context("Listing installed packages in {root}")]
pub(crate) fn rpm_list_installed(root: &Utf8Path) -> Result<Vec<Package>> {
    let out = Command::new("rpm")
        .arg("--root")
        .arg(root)
        .args(["-qa", "--qf", RPM_QUERYFORMAT])
        .log_debug()
        .run_get_string()?;
    let mut pkgs = parse_package_lines(&out)?;
    // gpg-pubkey entries are keys, not packages
    pkgs.retain(|p| p.name != "gpg-pubkey");
    Ok(pkgs)
}

#[context("Rebuilding rpm database in {root}")]
pub(crate) fn rpm_rebuilddb(root: &Utf8Path) -> Result<()> {
    Command::new("rpm")
        .arg("--root")
        .arg(root)
        .arg("--rebuilddb")
        .log_debug()
        .run_backend("rpm")
}

/// Render a yum/dnf configuration with `repositories` and `cachedir`.
pub(crate) fn render_yum_conf(
    env: &BackendEnv,
    repositories: &[Repository],
    cachedir: &Utf8Path,
) -> Result<String> {
    let mut s = String::new();
    writeln!(s, "[main]")?;
    writeln!(s, "cachedir={cachedir}")?;
    writeln!(s, "keepcache=1")?;
    writeln!(s, "reposdir=")?;
    writeln!(s, "gpgcheck=0")?;
    writeln!(s, "plugins=0")?;
    if !env.exclusions().is_empty() {
        writeln!(s, "exclude={}", env.exclusions().join(" "))?;
    }
    if let Some(proxy) = &env.proxy {
        writeln!(s, "proxy={}", proxy.url)?;
        if let Some(user) = &proxy.user {
            writeln!(s, "proxy_username={user}")?;
        }
        if let Some(password) = &proxy.password {
            writeln!(s, "proxy_password={password}")?;
        }
    }
    for repo in repositories {
        let key = match repo.kind {
            RepositoryKind::Base => "baseurl",
            RepositoryKind::Mirror => "mirrorlist",
            // handled by zypper only
            RepositoryKind::Zypp => continue,
        };
        writeln!(s)?;
        writeln!(s, "[{}]", repo.id)?;
        writeln!(s, "name={}", repo.id)?;
        writeln!(s, "{key}={}", repo.url)?;
        writeln!(s, "enabled=1")?;
    }
    Ok(s)
}

/// Parse `yum groupinfo` / `dnf group info` output.
pub(crate) fn parse_group_info(name: &str, output: &str) -> GroupInfo {
    #[derive(Clone, Copy)]
    enum Section {
        None,
        Mandatory,
        Default,
        Optional,
    }
    let mut info = GroupInfo {
        name: name.to_string(),
        ..Default::default()
    };
    let mut section = Section::None;
    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(d) = trimmed.strip_prefix("Description:") {
            info.description = d.trim().to_string();
            continue;
        }
        match trimmed {
            "Mandatory Packages:" => section = Section::Mandatory,
            "Default Packages:" => section = Section::Default,
            "Optional Packages:" => section = Section::Optional,
            "" => {}
            l if l.ends_with(':') => section = Section::None,
            l => {
                // yum prefixes install state markers such as `=`, `+`, `-`
                let pkg = l.trim_start_matches(['=', '+', '-']).trim().to_string();
                match section {
                    Section::Mandatory => info.mandatory.push(pkg),
                    Section::Default => info.default.push(pkg),
                    Section::Optional => info.optional.push(pkg),
                    Section::None => {}
                }
            }
        }
    }
    info
}

#[derive(Debug)]
pub struct RpmTransaction {
    env: BackendEnv,
}

impl RpmTransaction {
    pub fn new(env: BackendEnv) -> Self {
        Self { env }
    }

    fn is_dnf(&self) -> bool {
        self.env.kind == BackendKind::Dnf
    }

    fn write_conf(
        &self,
        name: &str,
        repositories: &[Repository],
        cachedir: &Utf8Path,
    ) -> Result<Utf8PathBuf> {
        let path = self.env.workdir().join(format!("{name}.conf"));
        std::fs::write(&path, render_yum_conf(&self.env, repositories, cachedir)?)
            .with_context(|| format!("Writing {path}"))?;
        Ok(path)
    }

    /// `yum -c <conf> -y [--installroot <root>] ...` for the whole set.
    fn command(&self, with_root: bool) -> Result<Command> {
        let conf = self.write_conf(
            "transaction",
            &self.env.repositories,
            &self.env.transaction_cache_dir(),
        )?;
        let mut cmd = Command::new(self.env.kind.name());
        cmd.arg("-c").arg(conf).arg("-y");
        if with_root {
            cmd.arg(format!("--installroot={}", self.env.root()?));
        }
        if self.env.test {
            cmd.arg("--setopt=tsflags=test");
        }
        self.env.apply_proxy(&mut cmd);
        Ok(cmd)
    }

    fn verb(&self, action: Action) -> &'static [&'static str] {
        match (action, self.is_dnf()) {
            (Action::Install, _) => &["install"],
            (Action::Update, _) => &["update"],
            (Action::Remove, _) => &["remove"],
            (Action::Upgrade, false) => &["upgrade"],
            (Action::Upgrade, true) => &["distro-sync"],
            (Action::GroupInstall, false) => &["groupinstall"],
            (Action::GroupUpdate, false) => &["groupupdate"],
            (Action::GroupRemove, false) => &["groupremove"],
            (Action::GroupInstall, true) => &["group", "install"],
            (Action::GroupUpdate, true) => &["group", "upgrade"],
            (Action::GroupRemove, true) => &["group", "remove"],
            (Action::LocalInstall, false) => &["localinstall"],
            (Action::LocalUpdate, false) => &["localupdate"],
            (Action::LocalInstall, true) => &["install"],
            (Action::LocalUpdate, true) => &["upgrade"],
        }
    }

    fn repoquery(&self, conf: &Utf8Path, name: Option<&str>) -> Result<Vec<Package>> {
        let mut cmd = if self.is_dnf() {
            let mut c = Command::new("dnf");
            c.arg("-c").arg(conf).arg("repoquery");
            c
        } else {
            let mut c = Command::new("repoquery");
            c.arg("-c").arg(conf);
            c
        };
        cmd.args(["--qf", REPOQUERY_FORMAT]);
        match name {
            Some(n) => cmd.arg(n),
            None => cmd.arg("-a"),
        };
        self.env.apply_proxy(&mut cmd);
        let out = cmd.log_debug().run_get_string()?;
        parse_package_lines(&out)
    }
}

impl Transaction for RpmTransaction {
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
        let conf = self.write_conf(&source.template, &source.repositories, &cachedir)?;
        let mut cmd = Command::new(self.env.kind.name());
        cmd.arg("-c").arg(&conf).args(["-y", "makecache"]);
        self.env.apply_proxy(&mut cmd);
        cmd.log_debug().run_backend(self.env.kind.name())?;
        self.repoquery(&conf, None)
    }

    #[context("Running {action:?}")]
    fn run(&mut self, action: Action, targets: &[String]) -> Result<PackageChanges> {
        let mut cmd = self.command(true)?;
        cmd.args(self.verb(action)).args(targets);
        let backend = self.env.kind.name();
        run_with_diff(self, |_| cmd.log_debug().run_backend(backend))
    }

    fn list_installed(&mut self) -> Result<Vec<Package>> {
        rpm_list_installed(self.env.root()?)
    }

    fn list_available(&mut self, name: Option<&str>) -> Result<Vec<Package>> {
        let conf = self.write_conf(
            "transaction",
            &self.env.repositories,
            &self.env.transaction_cache_dir(),
        )?;
        self.repoquery(&conf, name)
    }

    #[context("Querying group {name}")]
    fn group_info(&mut self, name: &str) -> Result<GroupInfo> {
        let mut cmd = self.command(false)?;
        if self.is_dnf() {
            cmd.args(["group", "info"]);
        } else {
            cmd.arg("groupinfo");
        }
        let out = cmd.arg(name).log_debug().run_get_string()?;
        Ok(parse_group_info(name, &out))
    }

    fn download(&mut self, targets: &[String]) -> Result<()> {
        // Resolve against the bound root if there is one, else an empty one
        let root = match self.env.root() {
            Ok(r) => r.to_owned(),
            Err(_) => self.env.workdir().join("root"),
        };
        let mut cmd = self.command(false)?;
        cmd.arg("--downloadonly")
            .arg(format!("--installroot={root}"))
            .arg("install")
            .args(targets);
        cmd.log_debug().run_backend(self.env.kind.name())
    }

    fn clean_local_cache(&mut self) -> Result<()> {
        let mut cmd = self.command(false)?;
        cmd.args(["clean", "all"]);
        cmd.log_debug().run_backend(self.env.kind.name())
    }

    fn fix_package_database(&mut self) -> Result<()> {
        rpm_rebuilddb(self.env.root()?)
    }
}
