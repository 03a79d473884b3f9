use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use pybuild_panel::cleanup::{self, CleanupEvent};
use pybuild_panel::logging::{self, LogOptions};
use pybuild_panel::matcher::{self, ToolchainFlavor};
use pybuild_panel::project::{BuildAction, Project};
use pybuild_panel::session::{Controller, SessionSink, StdoutSink};
use pybuild_panel::{Error, ErrorKind, Result};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Project directory (default: search upward from the current directory)
    #[arg(long, global = true)]
    project: Option<PathBuf>,
    /// Format log lines as JSON
    #[arg(long, global = true)]
    log_json: bool,
    /// Append log lines to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build extension modules in place (`setup.py build_ext -i` by default)
    Build {
        /// Print the outcome and error records as JSON on stdout
        #[arg(long)]
        json: bool,
    },
    /// Clean build products (`setup.py clean -a`), then sweep leftover artifacts
    Clean {
        #[arg(long)]
        json: bool,
    },
    /// Run setup.py with arbitrary arguments
    Run {
        #[arg(long)]
        json: bool,
        /// Arguments passed to setup.py, after `--`
        #[arg(last = true, required = true)]
        args: Vec<String>,
    },
    /// Harvest error records from a saved build log
    Parse {
        file: PathBuf,
        #[arg(long, value_enum, default_value_t = FlavorArg::Auto)]
        flavor: FlavorArg,
        #[arg(long)]
        json: bool,
    },
    /// Find (and remove) compiled artifacts and Cython-generated sources
    Scan {
        /// Only list what would be removed
        #[arg(long)]
        dry_run: bool,
    },
    /// Terminal panel (build/clean/terminate, errors and log tabs)
    Tui,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FlavorArg {
    /// Detect from the log text
    Auto,
    /// GCC, Clang and Cython `file:line:column: message`
    Gcc,
    /// MSVC `file(line) : message`
    Msvc,
}

fn main() {
    let args = Args::parse();
    let code = match dispatch(args) {
        Ok(code) => code,
        // The session sink has already printed start failures.
        Err(e) if e.kind() == ErrorKind::StartFailure => 1,
        Err(e) if e.is_config() => {
            eprintln!("error: {e}");
            2
        }
        Err(e) => {
            eprintln!("error: {e}");
            1
        }
    };
    std::process::exit(code);
}

fn dispatch(args: Args) -> Result<i32> {
    let is_tui = matches!(args.cmd, Command::Tui);
    // The panel owns the terminal: it only logs when given a file.
    if !is_tui || args.log_file.is_some() {
        logging::init(LogOptions {
            json: args.log_json,
            file: args.log_file.as_deref(),
        })?;
    }

    let project = args.project.as_deref();
    match args.cmd {
        Command::Build { json } => cmd_session(project, BuildAction::BuildInPlace, json),
        Command::Clean { json } => cmd_session(project, BuildAction::CleanAll, json),
        Command::Run { json, args } => cmd_session(project, BuildAction::Custom(args), json),
        Command::Parse { file, flavor, json } => cmd_parse(&file, flavor, json),
        Command::Scan { dry_run } => cmd_scan(project, dry_run),
        Command::Tui => {
            let dir = match project {
                Some(dir) => dir.to_path_buf(),
                None => {
                    let cwd = std::env::current_dir()?;
                    Project::discover(&cwd).map(|p| p.dir).unwrap_or(cwd)
                }
            };
            pybuild_panel::ui::run_tui(&dir)?;
            Ok(0)
        }
    }
}

fn open_project(dir: Option<&Path>) -> Result<Project> {
    match dir {
        Some(dir) => Project::open(dir),
        None => Project::discover(&std::env::current_dir()?),
    }
}

fn cmd_session(dir: Option<&Path>, action: BuildAction, json: bool) -> Result<i32> {
    let project = open_project(dir)?;
    let sink: Arc<dyn SessionSink> = if json {
        Arc::new(StdoutSink::stderr())
    } else {
        Arc::new(StdoutSink::default())
    };
    let controller = Controller::new(sink);
    let outcome = controller.run(&project, &action)?.wait()?;
    if json {
        let s = serde_json::to_string_pretty(&outcome)
            .map_err(|e| Error::msg(format!("failed to encode outcome: {e}")))?;
        println!("{s}");
    }
    Ok(outcome.exit_code)
}

fn cmd_parse(file: &Path, flavor: FlavorArg, json: bool) -> Result<i32> {
    let bytes = std::fs::read(file)
        .map_err(|e| Error::msg(format!("failed to read {}: {e}", file.display())))?;
    let text = String::from_utf8_lossy(&bytes);
    let hint = match flavor {
        FlavorArg::Auto => matcher::detect_flavor(&text),
        FlavorArg::Gcc => ToolchainFlavor::GccClangCython,
        FlavorArg::Msvc => ToolchainFlavor::Msvc,
    };
    let records = matcher::match_errors(&text, hint);

    if json {
        let s = serde_json::to_string_pretty(&records)
            .map_err(|e| Error::msg(format!("failed to encode records: {e}")))?;
        println!("{s}");
        return Ok(0);
    }
    for r in &records {
        println!("{}:{}:{}: {}", r.file, r.line, r.column, r.message);
    }
    eprintln!("{} errors ({})", records.len(), hint.label());
    Ok(0)
}

fn cmd_scan(dir: Option<&Path>, dry_run: bool) -> Result<i32> {
    let project = open_project(dir)?;
    let root = project.dir.as_path();

    if dry_run {
        for path in cleanup::scan(root)? {
            println!("{}", path.strip_prefix(root).unwrap_or(&path).display());
        }
        return Ok(0);
    }

    let report = cleanup::scan_and_remove(root, |ev| match ev {
        CleanupEvent::Removing(rel) => println!("Removing {}", rel.display()),
        CleanupEvent::Failed { path, error } => {
            eprintln!("Failed to remove {}: {error}", path.display())
        }
    })?;
    eprintln!(
        "removed {} files, {} failures",
        report.removed.len(),
        report.failures.len()
    );
    Ok(if report.failures.is_empty() { 0 } else { 1 })
}
