use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread::JoinHandle;

use crate::error::{Error, Result};
use crate::matcher::ErrorRecord;

/// Where an editor should land for a harvested error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditorTarget {
    pub path: PathBuf,
    /// Zero-based line to scroll to and select.
    pub line_index: u32,
    pub column: u32,
}

impl EditorTarget {
    /// Record paths are taken relative to the project directory unless already absolute.
    pub fn for_record(project_dir: &Path, record: &ErrorRecord) -> Self {
        Self {
            path: project_dir.join(&record.file),
            line_index: record.line.saturating_sub(1),
            column: record.column,
        }
    }

    /// One-based line, as editors take it on the command line.
    pub fn line(&self) -> u32 {
        self.line_index + 1
    }

    pub fn location(&self) -> String {
        format!("{}:{}:{}", self.path.display(), self.line(), self.column)
    }
}

/// Expands `{file}`, `{line}`, `{line0}` and `{column}` in each template argument.
pub fn render_command(template: &[String], target: &EditorTarget) -> Vec<String> {
    let file = target.path.display().to_string();
    template
        .iter()
        .map(|arg| {
            arg.replace("{file}", &file)
                .replace("{line0}", &target.line_index.to_string())
                .replace("{line}", &target.line().to_string())
                .replace("{column}", &target.column.to_string())
        })
        .collect()
}

/// Launches the configured editor without waiting for it.
pub fn open(template: &[String], target: &EditorTarget) -> Result<()> {
    let argv = render_command(template, target);
    let Some((program, args)) = argv.split_first() else {
        return Err(Error::config(
            "no editor configured; set [editor].command in pybuild.toml",
        ));
    };
    tracing::debug!(program = %program, location = %target.location(), "opening editor");
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    spawn_reaped(cmd)
        .map_err(|e| Error::start_failure(format!("failed to start editor '{program}': {e}")))?;
    Ok(())
}

// Waits on the editor from a detached thread so it is reaped once it exits.
fn spawn_reaped(mut cmd: Command) -> io::Result<JoinHandle<io::Result<ExitStatus>>> {
    let mut child = cmd.spawn()?;
    std::thread::Builder::new()
        .name("pybuild-editor".into())
        .spawn(move || child.wait())
}
