//! OS template caches: compressed root filesystems in one of several
//! container backing formats.

// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::process::Command;
use std::time::SystemTime;

use anyhow::{anyhow, Context, Result};
use bitflags::bitflags;
use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::Dir;
use cap_std_ext::cap_std;
use cap_std_ext::prelude::CapStdExtDirExt;
use fn_error_context::context;
use serde::Serialize;

use crate::cmdutils::CommandRunExt;
use crate::metadata::metadata_path;

bitflags! {
    /// Backing formats of template caches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CacheFormat: u32 {
        const SIMFS = 1 << 0;
        const PLOOP = 1 << 1;
        const PLOOP_V2 = 1 << 2;
        const VZFS = 1 << 3;
    }
}

const FORMATS: &[(&str, &str, CacheFormat)] = &[
    ("simfs", "", CacheFormat::SIMFS),
    ("ploop", "-ploop", CacheFormat::PLOOP),
    ("ploop_v2", "-ploop-v2", CacheFormat::PLOOP_V2),
    ("vzfs", "-vzfs", CacheFormat::VZFS),
];

impl CacheFormat {
    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        names.into_iter().try_fold(Self::empty(), |acc, name| {
            FORMATS
                .iter()
                .find(|(n, _, _)| *n == name)
                .map(|(_, _, f)| acc | *f)
                .ok_or_else(|| anyhow!("Unknown cache type: {name}"))
        })
    }

    pub fn names(&self) -> Vec<&'static str> {
        FORMATS
            .iter()
            .filter(|(_, _, f)| self.contains(*f))
            .map(|(n, _, _)| *n)
            .collect()
    }

    /// The single formats contained in `self`.
    pub fn formats(&self) -> Vec<CacheFormat> {
        FORMATS
            .iter()
            .filter(|(_, _, f)| self.contains(*f))
            .map(|(_, _, f)| *f)
            .collect()
    }

    fn suffix(&self) -> &'static str {
        FORMATS
            .iter()
            .find(|(_, _, f)| f == self)
            .map(|(_, s, _)| *s)
            .unwrap_or_default()
    }
}

/// `<cache>/<ostemplate>[-<format>].tar.gz` for a single format.
pub fn artifact_path(cache_dir: &Utf8Path, ostemplate: &str, format: CacheFormat) -> Utf8PathBuf {
    cache_dir.join(format!("{ostemplate}{}.tar.gz", format.suffix()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStatus {
    pub format: &'static str,
    pub path: Utf8PathBuf,
    pub exists: bool,
    pub up_to_date: bool,
}

fn mtime(path: &Utf8Path) -> Result<Option<SystemTime>> {
    match std::fs::metadata(path) {
        Ok(m) => Ok(Some(m.modified()?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Querying {path}")),
    }
}

/// Status of every format's cache of `ostemplate`.  A cache is up to
/// date when it is newer than the template's package list and metadata.
#[context("Checking caches of {ostemplate}")]
pub fn status(
    cache_dir: &Utf8Path,
    basedir: &Utf8Path,
    confdir: &Utf8Path,
    ostemplate: &str,
) -> Result<Vec<CacheStatus>> {
    let inputs = [
        mtime(&confdir.join("packages"))?,
        mtime(&metadata_path(basedir, ostemplate))?,
    ];
    let newest_input = inputs.into_iter().flatten().max();
    CacheFormat::all()
        .formats()
        .into_iter()
        .map(|format| {
            let path = artifact_path(cache_dir, ostemplate, format);
            let built = mtime(&path)?;
            Ok(CacheStatus {
                format: format.names().first().copied().unwrap_or_default(),
                exists: built.is_some(),
                up_to_date: match (built, newest_input) {
                    (Some(b), Some(i)) => b >= i,
                    (Some(_), None) => true,
                    (None, _) => false,
                },
                path,
            })
        })
        .collect()
}

/// Rewrite the `cache_type` file of an OS template config dir.
#[context("Recording cache types in {confdir}")]
pub fn record_cache_type(confdir: &Utf8Path, formats: CacheFormat) -> Result<()> {
    let dir = Dir::open_ambient_dir(confdir, cap_std::ambient_authority())?;
    let mut contents = formats.names().join(" ");
    contents.push('\n');
    dir.atomic_write("cache_type", contents.as_bytes())?;
    Ok(())
}

/// Pack `root` into the gzip'ed tarball `artifact`, replacing it atomically.
#[context("Packing {root} into {artifact}")]
pub fn pack(root: &Utf8Path, artifact: &Utf8Path) -> Result<()> {
    let tmp = Utf8PathBuf::from(format!("{artifact}.tmp"));
    Command::new("tar")
        .args(["--numeric-owner", "--xattrs", "-czf"])
        .arg(&tmp)
        .arg("-C")
        .arg(root)
        .arg(".")
        .log_debug()
        .run_backend("tar")?;
    std::fs::rename(&tmp, artifact).with_context(|| format!("Renaming {tmp}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_and_paths() {
        let f = CacheFormat::from_names(["ploop", "simfs"]).unwrap();
        assert_eq!(f, CacheFormat::SIMFS | CacheFormat::PLOOP);
        assert_eq!(f.names(), vec!["simfs", "ploop"]);
        assert!(CacheFormat::from_names(["zfs"]).is_err());
        let dir = Utf8Path::new("/vz/template/cache");
        assert_eq!(
            artifact_path(dir, "centos-7-x86_64", CacheFormat::SIMFS),
            "/vz/template/cache/centos-7-x86_64.tar.gz"
        );
        assert_eq!(
            artifact_path(dir, "centos-7-x86_64", CacheFormat::PLOOP_V2),
            "/vz/template/cache/centos-7-x86_64-ploop-v2.tar.gz"
        );
    }

    #[test]
    fn staleness_per_format() -> Result<()> {
        let td = tempfile::tempdir()?;
        let base = Utf8Path::from_path(td.path()).unwrap();
        let confdir = base.join("config/os/default");
        let cache = base.join("cache");
        std::fs::create_dir_all(&confdir)?;
        std::fs::create_dir_all(&cache)?;
        std::fs::write(confdir.join("packages"), "bash\n")?;
        let ploop = artifact_path(&cache, "centos-7-x86_64", CacheFormat::PLOOP);
        std::fs::write(&ploop, "")?;
        let simfs = artifact_path(&cache, "centos-7-x86_64", CacheFormat::SIMFS);
        std::fs::write(&simfs, "")?;
        // the package list changed after the simfs cache was built
        let old = SystemTime::now() - std::time::Duration::from_secs(3600);
        std::fs::File::options().write(true).open(&simfs)?.set_modified(old)?;

        let st = status(&cache, base, &confdir, "centos-7-x86_64")?;
        let by = |name: &str| st.iter().find(|s| s.format == name).unwrap().clone();
        assert!(by("ploop").exists && by("ploop").up_to_date);
        assert!(by("simfs").exists && !by("simfs").up_to_date);
        assert!(!by("vzfs").exists && !by("vzfs").up_to_date);

        record_cache_type(&confdir, CacheFormat::PLOOP | CacheFormat::VZFS)?;
        assert_eq!(std::fs::read_to_string(confdir.join("cache_type"))?, "ploop vzfs\n");
        Ok(())
    }
}
