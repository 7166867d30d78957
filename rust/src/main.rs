//! The `vzpkg` command line.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use anyhow::Result;
use clap::Parser;
use serde::Serialize;
use std::io::Write;
use termcolor::WriteColor;

use vztt::cache::CacheFormat;
use vztt::config::GlobalConfig;
use vztt::metadata::DataSource;
use vztt::ops::ActionReport;
use vztt::packages::Package;
use vztt::{error_code, Options, Vztt};

#[derive(Debug, Parser)]
#[clap(name = "vzpkg", rename_all = "kebab-case", version)]
/// Manage OS and application templates and the packages of containers
struct Cli {
    #[clap(flatten)]
    global: GlobalOpts,
    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, clap::Args)]
struct GlobalOpts {
    /// Dry run: ask the package manager what would happen, change nothing
    #[clap(long, global = true)]
    test: bool,
    /// Proceed despite installed or dependent templates
    #[clap(short, long, global = true)]
    force: bool,
    /// Arguments are package names rather than application templates
    #[clap(short, long, global = true)]
    packages: bool,
    /// Where metadata comes from: default, local (or cache), remote
    #[clap(long, global = true, default_value = "default")]
    data_source: DataSource,
    /// Do not take template locks
    #[clap(long, global = true)]
    skip_lock: bool,
    /// Do not use base repositories for variants and application templates
    #[clap(long, global = true)]
    separate_repo: bool,
    /// Print results as JSON
    #[clap(long, global = true)]
    json: bool,
    #[clap(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    #[clap(short, long, global = true)]
    quiet: bool,
}

#[derive(Debug, clap::Subcommand)]
#[clap(rename_all = "kebab-case")]
enum Cmd {
    /// Install application templates or packages into a container
    Install {
        ctid: String,
        #[clap(required = true)]
        targets: Vec<String>,
    },
    /// Update application templates or packages; everything if none given
    Update { ctid: String, targets: Vec<String> },
    /// Remove application templates or packages from a container
    Remove {
        ctid: String,
        #[clap(required = true)]
        targets: Vec<String>,
    },
    /// Upgrade a container to a newer release of its OS template
    Upgrade { ctid: String },
    /// Install package files into a container
    Localinstall {
        ctid: String,
        #[clap(required = true)]
        files: Vec<String>,
    },
    /// Update a container from package files
    Localupdate {
        ctid: String,
        #[clap(required = true)]
        files: Vec<String>,
    },
    Groupinstall {
        ctid: String,
        #[clap(required = true)]
        groups: Vec<String>,
    },
    Groupupdate {
        ctid: String,
        #[clap(required = true)]
        groups: Vec<String>,
    },
    Groupremove {
        ctid: String,
        #[clap(required = true)]
        groups: Vec<String>,
    },
    /// List the packages of a container, or all templates
    List { ctid: Option<String> },
    /// Download the packages of an OS template or some of its applications
    Fetch { ostemplate: String, apps: Vec<String> },
    /// Refresh repository metadata of OS templates
    UpdateMetadata {
        #[clap(required = true)]
        ostemplates: Vec<String>,
    },
    /// Drop package manager caches of OS templates
    Clean {
        #[clap(required = true)]
        ostemplates: Vec<String>,
    },
    /// List packages offered by the repositories of an OS template
    Available { ostemplate: String, name: Option<String> },
    /// Show a package group of an OS template's repositories
    GroupInfo { ostemplate: String, group: String },
    /// Show an OS template or one of its application templates
    Info { ostemplate: String, app: Option<String> },
    /// Remove an OS template or one of its application templates
    RemoveTemplate { ostemplate: String, app: Option<String> },
    /// Rebuild the package record of a container from its package database
    #[clap(hide = true)]
    FixDb { ctid: String },
    CacheStatus { ostemplate: String },
    /// Build a template cache
    CreateCache {
        ostemplate: String,
        #[clap(long, default_value = "simfs")]
        format: String,
    },
    RemoveCache {
        ostemplate: String,
        /// Formats to remove; all when omitted
        #[clap(long)]
        format: Vec<String>,
    },
    Link { ctid: String },
    VzfsUpgrade { ctid: String },
}

fn print_json<T: Serialize>(v: &T) -> Result<()> {
    let stdout = std::io::stdout();
    let mut stdout = stdout.lock();
    serde_json::to_writer_pretty(&mut stdout, v)?;
    writeln!(stdout)?;
    Ok(())
}

fn print_packages(packages: &[Package]) {
    for p in packages {
        println!("{:<40} {:<30} {}", format!("{}.{}", p.name, p.arch), p.evr, p.description);
    }
}

fn print_report(r: &ActionReport) {
    for p in &r.packages {
        println!("{:<10} {p}", format!("{:?}", p.mark).to_lowercase());
    }
}

impl Cmd {
    fn run(self, vz: &Vztt, json: bool) -> Result<()> {
        let report = match self {
            Cmd::Install { ctid, targets } => vz.install(&ctid, &targets)?,
            Cmd::Update { ctid, targets } => vz.update(&ctid, &targets)?,
            Cmd::Remove { ctid, targets } => vz.remove(&ctid, &targets)?,
            Cmd::Localinstall { ctid, files } => vz.local_install(&ctid, &files)?,
            Cmd::Localupdate { ctid, files } => vz.local_update(&ctid, &files)?,
            Cmd::Groupinstall { ctid, groups } => vz.group_install(&ctid, &groups)?,
            Cmd::Groupupdate { ctid, groups } => vz.group_update(&ctid, &groups)?,
            Cmd::Groupremove { ctid, groups } => vz.group_remove(&ctid, &groups)?,
            Cmd::Upgrade { ctid } => {
                let outcome = vz.upgrade(&ctid)?;
                if json {
                    return print_json(&outcome);
                }
                println!("{ctid}: {} -> {}", outcome.from, outcome.to);
                for (label, pkgs) in [
                    ("updated", &outcome.updated),
                    ("added", &outcome.added),
                    ("removed", &outcome.removed),
                    ("converted", &outcome.converted),
                ] {
                    for p in pkgs {
                        println!("{label:<10} {p}");
                    }
                }
                return Ok(());
            }
            Cmd::List { ctid: Some(ctid) } => {
                let pkgs = vz.list_packages(&ctid)?;
                return if json {
                    print_json(&pkgs)
                } else {
                    print_packages(&pkgs);
                    Ok(())
                };
            }
            Cmd::List { ctid: None } => {
                let templates = vz.list_templates()?;
                if json {
                    return print_json(&templates);
                }
                for t in templates {
                    let name = match t.kind {
                        vztt::ops::TemplateKind::Os => t.name,
                        vztt::ops::TemplateKind::App => format!("{}/{}", t.base, t.name),
                    };
                    println!("{name:<50} {}", t.summary);
                }
                return Ok(());
            }
            Cmd::Fetch { ostemplate, apps } => {
                let fetched = vz.fetch(&ostemplate, &apps)?;
                return if json { print_json(&fetched) } else { Ok(()) };
            }
            Cmd::UpdateMetadata { ostemplates } => {
                let mut failed = false;
                for t in ostemplates {
                    let r = vz.update_metadata(&t)?;
                    failed |= !r.failed.is_empty();
                }
                if failed {
                    tracing::warn!("Some metadata could not be updated");
                }
                return Ok(());
            }
            Cmd::Clean { ostemplates } => {
                for t in ostemplates {
                    vz.clean(&t)?;
                }
                return Ok(());
            }
            Cmd::Available { ostemplate, name } => {
                let pkgs = vz.list_available(&ostemplate, name.as_deref())?;
                return if json {
                    print_json(&pkgs)
                } else {
                    print_packages(&pkgs);
                    Ok(())
                };
            }
            Cmd::GroupInfo { ostemplate, group } => {
                let info = vz.group_info(&ostemplate, &group)?;
                if json {
                    return print_json(&info);
                }
                println!("Group: {}", info.name);
                if !info.description.is_empty() {
                    println!(" {}", info.description);
                }
                for (label, pkgs) in [
                    ("Mandatory", &info.mandatory),
                    ("Default", &info.default),
                    ("Optional", &info.optional),
                ] {
                    if !pkgs.is_empty() {
                        println!(" {label} packages:");
                        for p in pkgs {
                            println!("   {p}");
                        }
                    }
                }
                return Ok(());
            }
            Cmd::Info { ostemplate, app } => {
                let info = vz.template_info(&ostemplate, app.as_deref())?;
                if json {
                    return print_json(&info);
                }
                println!("Name:          {}", info.name);
                println!("Summary:       {}", info.summary);
                println!("Package manager: {}", info.package_manager);
                println!("Technologies:  {}", info.technologies.join(" "));
                println!("Packages:      {}", info.packages.join(" "));
                println!("Repositories:  {}", info.repositories.join(" "));
                if !info.description.is_empty() {
                    println!("\n{}", info.description);
                }
                return Ok(());
            }
            Cmd::RemoveTemplate { ostemplate, app } => {
                return vz.remove_template(&ostemplate, app.as_deref())
            }
            Cmd::FixDb { ctid } => {
                let pkgs = vz.fix_package_db(&ctid)?;
                return if json {
                    print_json(&pkgs)
                } else {
                    print_packages(&pkgs);
                    Ok(())
                };
            }
            Cmd::CacheStatus { ostemplate } => {
                let status = vz.cache_status(&ostemplate)?;
                if json {
                    return print_json(&status);
                }
                for s in status.iter().filter(|s| s.exists) {
                    let state = if s.up_to_date { "up to date" } else { "outdated" };
                    println!("{:<10} {state:<12} {}", s.format, s.path);
                }
                return match status.iter().find(|s| s.exists && !s.up_to_date) {
                    Some(s) => Err(vztt::VzttError::NotUpToDate(s.path.to_string()).into()),
                    None => Ok(()),
                };
            }
            Cmd::CreateCache { ostemplate, format } => {
                let format = CacheFormat::from_names([format.as_str()])?;
                let artifact = vz.create_cache(&ostemplate, format)?;
                println!("{artifact}");
                return Ok(());
            }
            Cmd::RemoveCache { ostemplate, format } => {
                let formats = if format.is_empty() {
                    CacheFormat::all()
                } else {
                    CacheFormat::from_names(format.iter().map(|s| s.as_str()))?
                };
                for p in vz.remove_cache(&ostemplate, formats)? {
                    println!("{p}");
                }
                return Ok(());
            }
            Cmd::Link { ctid } => return vz.link(&ctid),
            Cmd::VzfsUpgrade { ctid } => return vz.vzfs_upgrade(&ctid),
        };
        if json {
            print_json(&report)
        } else {
            print_report(&report);
            Ok(())
        }
    }
}

/// The real main function returns a `Result<>`.
fn inner_main() -> Result<i32> {
    let cli = Cli::parse();
    let g = cli.global;
    let level = if g.verbose {
        "debug"
    } else if g.quiet {
        "error"
    } else {
        "info"
    };
    // We need to write to stderr, because some of our commands write JSON to stdout
    tracing_subscriber::fmt::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();
    tracing::trace!("starting");

    let config = GlobalConfig::load_default()?;
    let opts = Options {
        test: g.test,
        force: g.force,
        packages: g.packages,
        data_source: g.data_source,
        skip_lock: g.skip_lock,
        separate_repo: g.separate_repo,
    };
    let vz = Vztt::host(config, opts);
    cli.cmd.run(&vz, g.json)?;
    Ok(0)
}

fn print_error(e: &anyhow::Error) {
    let msg = format!("{:#}", e);
    // Print the error: prefix in red if we're on a tty
    let stderr = termcolor::BufferWriter::stderr(termcolor::ColorChoice::Auto);
    let stderrbuf = {
        let mut stderrbuf = stderr.buffer();
        let _ =
            stderrbuf.set_color(termcolor::ColorSpec::new().set_fg(Some(termcolor::Color::Red)));
        let _ = write!(&mut stderrbuf, "error: ");
        let _ = stderrbuf.reset();
        let _ = writeln!(&mut stderrbuf, "{}", msg);
        stderrbuf
    };
    let _ = stderr.print(&stderrbuf);
}

fn main() {
    match inner_main() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            print_error(&e);
            std::process::exit(error_code(&e).as_exit_code())
        }
    }
}
