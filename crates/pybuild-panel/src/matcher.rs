//! Error harvesting over raw build output.
//!
//! Three grammars are recognised: Python tracebacks (always tried), GCC/Clang/Cython
//! `file:line:col: message` lines, and MSVC `file(line) : message` lines. Only one of the
//! compiler grammars runs per pass, chosen by [`detect_flavor`].

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::Serialize;

/// Substring whose presence in the output switches the compiler grammar to MSVC.
pub const MSVC_MARKER: &str = "Microsoft Visual Studio";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolchainFlavor {
    PythonTraceback,
    GccClangCython,
    Msvc,
}

impl ToolchainFlavor {
    pub fn label(self) -> &'static str {
        match self {
            ToolchainFlavor::PythonTraceback => "python",
            ToolchainFlavor::GccClangCython => "gcc",
            ToolchainFlavor::Msvc => "msvc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    /// Path exactly as printed by the tool; usually relative to the project directory.
    pub file: String,
    pub line: u32,
    /// 0 when the grammar carries no column.
    pub column: u32,
    pub message: String,
    /// Grammar that produced this record.
    pub flavor: ToolchainFlavor,
}

/// Picks the compiler grammar for `text`. Anything that is not recognisably MSVC output is
/// treated as GCC/Clang/Cython.
pub fn detect_flavor(text: &str) -> ToolchainFlavor {
    if text.contains(MSVC_MARKER) {
        ToolchainFlavor::Msvc
    } else {
        ToolchainFlavor::GccClangCython
    }
}

/// Harvests error records from `text`.
///
/// Traceback records come first, then records of the compiler grammar selected by
/// `flavor_hint`, each group in text order. A `PythonTraceback` hint behaves like the
/// default compiler grammar since tracebacks are always scanned.
pub fn match_errors(text: &str, flavor_hint: ToolchainFlavor) -> Vec<ErrorRecord> {
    let mut out = Vec::new();

    for caps in python_traceback_re().captures_iter(text) {
        push_record(&mut out, &caps, ToolchainFlavor::PythonTraceback);
    }

    match flavor_hint {
        ToolchainFlavor::Msvc => {
            for caps in msvc_re().captures_iter(text) {
                push_record(&mut out, &caps, ToolchainFlavor::Msvc);
            }
        }
        ToolchainFlavor::GccClangCython | ToolchainFlavor::PythonTraceback => {
            for caps in gcc_clang_cython_re().captures_iter(text) {
                push_record(&mut out, &caps, ToolchainFlavor::GccClangCython);
            }
        }
    }

    out
}

/// [`match_errors`] with the flavor detected from `text` itself.
pub fn harvest(text: &str) -> Vec<ErrorRecord> {
    match_errors(text, detect_flavor(text))
}

fn push_record(out: &mut Vec<ErrorRecord>, caps: &Captures<'_>, flavor: ToolchainFlavor) {
    let (Some(file), Some(line), Some(message)) =
        (caps.name("filename"), caps.name("line"), caps.name("message"))
    else {
        return;
    };
    let Ok(line) = line.as_str().parse::<u32>() else {
        return;
    };
    // Lines are one-based; a zero is not a location.
    if line == 0 {
        return;
    }
    let column = match caps.name("column") {
        Some(c) => match c.as_str().parse::<u32>() {
            Ok(c) => c,
            Err(_) => return,
        },
        None => 0,
    };
    out.push(ErrorRecord {
        file: file.as_str().to_string(),
        line,
        column,
        message: message.as_str().to_string(),
        flavor,
    });
}

// All patterns run with multi-line anchors, dot-matches-newline and CRLF-aware line ends.
// Quantifiers between anchors are lazy so one record never absorbs the next.

fn python_traceback_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?xmsR)
            ^Traceback .*? File \s+ " (?P<filename>[^"\r\n]+?) " , \s+
            line \s+ (?P<line>\d+) .*?
            ^(?P<message> \w+Error: .+?)$
            "#,
        )
        .expect("python traceback pattern must compile")
    })
}

fn gcc_clang_cython_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?xmsR)
            ^(?P<filename>[^:\r\n]+?) : (?P<line>\d+) : (?P<column>\d+)
            :\x20 (?P<message>.+?)$
            ",
        )
        .expect("gcc/clang/cython pattern must compile")
    })
}

fn msvc_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?xmsR)
            ^(?:\.\\)?
            (?P<filename>[^(\r\n]+?) \( (?P<line>\d+) \)
            \s* : \s*
            (?P<message>.+?)$
            ",
        )
        .expect("msvc pattern must compile")
    })
}
