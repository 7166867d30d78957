//! The rpm family driven through zypper.

// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fmt::Write as _;
use std::process::Command;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

use super::rpm::{rpm_list_installed, rpm_rebuilddb};
use super::{
    evr, run_with_diff, Action, BackendEnv, GroupInfo, MetadataSource, Repository,
    RepositoryKind, Transaction,
};
use crate::cmdutils::CommandRunExt;
use crate::packages::{Package, PackageChanges};

/// Write one `.repo` file per repository into `dir`.
fn write_repos(dir: &Utf8Path, repositories: &[Repository]) -> Result<()> {
    if dir.try_exists()? {
        std::fs::remove_dir_all(dir).with_context(|| format!("Removing {dir}"))?;
    }
    std::fs::create_dir_all(dir).with_context(|| format!("Creating {dir}"))?;
    for repo in repositories {
        // zypp entries are `url [alias]`
        let url = match repo.kind {
            RepositoryKind::Zypp => repo.url.split_whitespace().next().unwrap_or_default(),
            _ => repo.url.as_str(),
        };
        let key = match repo.kind {
            RepositoryKind::Mirror => "mirrorlist",
            _ => "baseurl",
        };
        let mut s = String::new();
        writeln!(s, "[{}]", repo.id)?;
        writeln!(s, "name={}", repo.id)?;
        writeln!(s, "{key}={url}")?;
        writeln!(s, "enabled=1")?;
        writeln!(s, "autorefresh=0")?;
        writeln!(s, "gpgcheck=0")?;
        let path = dir.join(format!("{}.repo", repo.id));
        std::fs::write(&path, s).with_context(|| format!("Writing {path}"))?;
    }
    Ok(())
}

/// Parse the table printed by `zypper search -s`:
/// `S | Name | Type | Version | Arch | Repository`.
pub(crate) fn parse_search_table(output: &str) -> Vec<Package> {
    let mut pkgs: Vec<Package> = output
        .lines()
        .filter(|l| l.contains('|'))
        .filter_map(|l| {
            let cols: Vec<&str> = l.split('|').map(str::trim).collect();
            match cols.as_slice() {
                [_, name, kind, version, arch, ..] if *kind == "package" => {
                    Some(Package::new(name, arch, &evr::normalize(version)))
                }
                _ => None,
            }
        })
        .collect();
    pkgs.sort();
    pkgs.dedup();
    pkgs
}

/// Parse `zypper info -t pattern` contents:
/// `S | Name | Type | Dependency` rows.
pub(crate) fn parse_pattern_info(name: &str, output: &str) -> GroupInfo {
    let mut info = GroupInfo {
        name: name.to_string(),
        ..Default::default()
    };
    for line in output.lines() {
        if let Some(d) = line.strip_prefix("Summary").and_then(|s| s.trim().strip_prefix(':')) {
            info.description = d.trim().to_string();
            continue;
        }
        let cols: Vec<&str> = line.split('|').map(str::trim).collect();
        if let [_, pkg, "package", dep] = cols.as_slice() {
            let pkg = pkg.to_string();
            match *dep {
                "Required" => info.mandatory.push(pkg),
                "Recommended" => info.default.push(pkg),
                "Suggested" => info.optional.push(pkg),
                _ => {}
            }
        }
    }
    info
}

#[derive(Debug)]
pub struct ZypperTransaction {
    env: BackendEnv,
}

impl ZypperTransaction {
    pub fn new(env: BackendEnv) -> Self {
        Self { env }
    }

    /// `zypper --non-interactive` bound to `repositories` and `cachedir`.
    fn command(
        &self,
        name: &str,
        repositories: &[Repository],
        cachedir: &Utf8Path,
    ) -> Result<Command> {
        let reposd = self.env.workdir().join(format!("{name}.repos.d"));
        write_repos(&reposd, repositories)?;
        let mut cmd = Command::new("zypper");
        cmd.args(["--non-interactive", "--no-gpg-checks"])
            .arg("--reposd-dir")
            .arg(&reposd)
            .arg("--cache-dir")
            .arg(cachedir);
        if let Ok(root) = self.env.root() {
            cmd.arg("--root").arg(root);
        }
        self.env.apply_proxy(&mut cmd);
        Ok(cmd)
    }

    fn transaction_command(&self) -> Result<Command> {
        self.command(
            "transaction",
            &self.env.repositories,
            &self.env.transaction_cache_dir(),
        )
    }

    fn action_command(&self, action: Action, targets: &[String]) -> Result<Command> {
        self.env.root()?;
        let mut cmd = self.transaction_command()?;
        cmd.args(Self::verb(action));
        if self.env.test {
            cmd.arg("--dry-run");
        }
        // zypper has no exclude option; drop excluded targets instead
        cmd.args(super::filter_excluded(&self.env, action, targets));
        Ok(cmd)
    }

    fn verb(action: Action) -> &'static [&'static str] {
        match action {
            Action::Install | Action::LocalInstall => &["install"],
            Action::Update | Action::LocalUpdate => &["update"],
            Action::Remove => &["remove"],
            Action::Upgrade => &["dist-upgrade"],
            Action::GroupInstall => &["install", "-t", "pattern"],
            Action::GroupUpdate => &["update", "-t", "pattern"],
            Action::GroupRemove => &["remove", "-t", "pattern"],
        }
    }
}

impl Transaction for ZypperTransaction {
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
        self.command(&source.template, &source.repositories, &cachedir)?
            .arg("refresh")
            .log_debug()
            .run_backend("zypper")?;
        let out = self
            .command(&source.template, &source.repositories, &cachedir)?
            .args(["--no-refresh", "-q", "search", "-s", "-t", "package"])
            .log_debug()
            .run_get_string()?;
        Ok(parse_search_table(&out))
    }

    #[context("Running {action:?}")]
    fn run(&mut self, action: Action, targets: &[String]) -> Result<PackageChanges> {
        let mut cmd = self.action_command(action, targets)?;
        run_with_diff(self, |_| cmd.log_debug().run_backend("zypper"))
    }

    fn list_installed(&mut self) -> Result<Vec<Package>> {
        rpm_list_installed(self.env.root()?)
    }

    fn list_available(&mut self, name: Option<&str>) -> Result<Vec<Package>> {
        let mut cmd = self.transaction_command()?;
        cmd.args(["--no-refresh", "-q", "search", "-s", "-t", "package"]);
        if let Some(n) = name {
            cmd.args(["--match-exact", n]);
        }
        Ok(parse_search_table(&cmd.log_debug().run_get_string()?))
    }

    #[context("Querying pattern {name}")]
    fn group_info(&mut self, name: &str) -> Result<GroupInfo> {
        let out = self
            .transaction_command()?
            .args(["--no-refresh", "info", "-t", "pattern", name])
            .log_debug()
            .run_get_string()?;
        Ok(parse_pattern_info(name, &out))
    }

    fn download(&mut self, targets: &[String]) -> Result<()> {
        self.transaction_command()?
            .arg("download")
            .args(targets)
            .log_debug()
            .run_backend("zypper")
    }

    fn clean_local_cache(&mut self) -> Result<()> {
        self.transaction_command()?
            .args(["clean", "--all"])
            .log_debug()
            .run_backend("zypper")
    }

    fn fix_package_database(&mut self) -> Result<()> {
        rpm_rebuilddb(self.env.root()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn search_table() {
        let pkgs = parse_search_table(indoc! {"
            S | Name      | Type    | Version        | Arch   | Repository
            --+-----------+---------+----------------+--------+-----------
              | bash      | package | 4.4-19.6.1     | x86_64 | sles-15-0
              | bash      | package | 4.4-19.6.1     | x86_64 | sles-15-1
            i | aaa_base  | package | 84.87-3.3      | x86_64 | sles-15-0
              | patterns  | pattern | 15-1           | x86_64 | sles-15-0
        "});
        assert_eq!(
            pkgs,
            vec![
                Package::new("aaa_base", "x86_64", "84.87-3.3"),
                Package::new("bash", "x86_64", "4.4-19.6.1"),
            ]
        );
    }

    #[test]
    fn pattern_info() {
        let info = parse_pattern_info(
            "base",
            indoc! {"
                Information for pattern base:
                Name           : base
                Summary        : Minimal Base System
                Contents       :
                  S | Name        | Type    | Dependency
                  --+-------------+---------+-----------
                  i | bash        | package | Required
                    | vim         | package | Recommended
                    | emacs       | package | Suggested
            "},
        );
        assert_eq!(info.description, "Minimal Base System");
        assert_eq!(info.mandatory, vec!["bash"]);
        assert_eq!(info.default, vec!["vim"]);
        assert_eq!(info.optional, vec!["emacs"]);
    }

    #[test]
    fn repo_files() -> Result<()> {
        let td = tempfile::tempdir()?;
        let dir = Utf8Path::from_path(td.path()).unwrap().join("repos.d");
        let repos = vec![
            Repository {
                id: "sles-15-x86_64-0".into(),
                kind: RepositoryKind::Base,
                url: "http://download/sles15".into(),
            },
            Repository {
                id: "sles-15-x86_64-zypp-0".into(),
                kind: RepositoryKind::Zypp,
                url: "http://download/updates updates".into(),
            },
        ];
        write_repos(&dir, &repos)?;
        let s = std::fs::read_to_string(dir.join("sles-15-x86_64-zypp-0.repo"))?;
        assert!(s.contains("baseurl=http://download/updates\n"));
        assert!(dir.join("sles-15-x86_64-0.repo").exists());
        Ok(())
    }

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn action_commands() -> Result<()> {
        use super::super::BackendKind;
        let td = tempfile::tempdir()?;
        let base = Utf8Path::from_path(td.path()).unwrap();
        let unrooted = ZypperTransaction::new(BackendEnv::for_tests(BackendKind::Zypper, base)?);
        assert!(unrooted.action_command(Action::Install, &[]).is_err());

        let mut env = BackendEnv::for_tests(BackendKind::Zypper, base)?;
        env.set_root(&base.join("root"));
        env.exclude("vim*")?;
        env.test = true;
        let tx = ZypperTransaction::new(env);
        let args = |action, targets: &[&str]| -> Result<Vec<String>> {
            Ok(tx
                .action_command(action, &strings(targets))?
                .get_args()
                .map(|a| a.to_string_lossy().into_owned())
                .collect())
        };

        let group = args(Action::GroupInstall, &["base"])?;
        assert!(group.ends_with(&strings(&["install", "-t", "pattern", "--dry-run", "base"])));
        let group = args(Action::GroupRemove, &["base"])?;
        assert!(group.ends_with(&strings(&["remove", "-t", "pattern", "--dry-run", "base"])));
        let update = args(Action::Update, &[])?;
        assert!(update.ends_with(&strings(&["update", "--dry-run"])));
        let install = args(Action::Install, &["vim", "bash"])?;
        assert!(install.ends_with(&strings(&["install", "--dry-run", "bash"])));
        // removal ignores exclusions
        let remove = args(Action::Remove, &["vim"])?;
        assert!(remove.ends_with(&strings(&["remove", "--dry-run", "vim"])));
        assert!(remove.contains(&format!("{base}/root")));
        Ok(())
    }
}
