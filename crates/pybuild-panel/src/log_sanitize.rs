use std::collections::VecDeque;

const MAX_LINE_CHARS: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EscapeMode {
    Esc,
    Csi,
    Osc,
    OscEsc,
    StTerminated,
    StEsc,
}

/// Incremental terminal-escape stripper. State survives between `feed` calls so a sequence
/// split across two output chunks is still removed.
#[derive(Debug, Default, Clone)]
pub struct EscapeFilter {
    mode: Option<EscapeMode>,
}

impl EscapeFilter {
    /// Returns `true` when `c` is printable payload, `false` when it belongs to an escape
    /// sequence.
    pub fn feed(&mut self, c: char) -> bool {
        let Some(mode) = self.mode else {
            if c == '\x1b' {
                self.mode = Some(EscapeMode::Esc);
                return false;
            }
            return true;
        };
        self.mode = match mode {
            EscapeMode::Esc => match c {
                '[' => Some(EscapeMode::Csi),
                ']' => Some(EscapeMode::Osc),
                'P' | 'X' | '^' | '_' => Some(EscapeMode::StTerminated),
                _ => None,
            },
            EscapeMode::Csi if ('@'..='~').contains(&c) => None,
            EscapeMode::Csi => Some(EscapeMode::Csi),
            EscapeMode::Osc => match c {
                '\x07' => None,
                '\x1b' => Some(EscapeMode::OscEsc),
                _ => Some(EscapeMode::Osc),
            },
            EscapeMode::OscEsc => match c {
                '\\' => None,
                '\x1b' => Some(EscapeMode::OscEsc),
                _ => Some(EscapeMode::Osc),
            },
            EscapeMode::StTerminated => {
                if c == '\x1b' {
                    Some(EscapeMode::StEsc)
                } else {
                    Some(EscapeMode::StTerminated)
                }
            }
            EscapeMode::StEsc => match c {
                '\\' => None,
                '\x1b' => Some(EscapeMode::StEsc),
                _ => Some(EscapeMode::StTerminated),
            },
        };
        false
    }
}

/// Makes a single line safe to draw: escapes and control characters removed, tabs turned
/// into spaces, line breaks dropped, overlong lines truncated.
pub fn sanitize_log_line(input: &str) -> String {
    let mut filter = EscapeFilter::default();
    let mut out = String::with_capacity(input.len().min(MAX_LINE_CHARS));
    let mut count = 0usize;
    for c in input.chars() {
        if !filter.feed(c) || c == '\r' || c == '\n' {
            continue;
        }
        if !push_visible(&mut out, c) {
            continue;
        }
        count += 1;
        if count >= MAX_LINE_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
    }
    out
}

fn push_visible(out: &mut String, c: char) -> bool {
    if c == '\t' {
        out.push(' ');
        true
    } else if c.is_control() || is_format_control(c) {
        false
    } else {
        out.push(c);
        true
    }
}

fn is_format_control(c: char) -> bool {
    c == '\u{061C}'
        || c == '\u{200E}'
        || c == '\u{200F}'
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}

/// Bounded, display-ready view of a raw output stream. Raw chunks go in; sanitized
/// complete lines come out. A trailing partial line is kept visible until its newline
/// arrives.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    lines: VecDeque<String>,
    partial: String,
    partial_chars: usize,
    filter: EscapeFilter,
    max_lines: usize,
}

impl LogBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            partial: String::new(),
            partial_chars: 0,
            filter: EscapeFilter::default(),
            max_lines: max_lines.max(1),
        }
    }

    pub fn push(&mut self, chunk: &str) {
        for c in chunk.chars() {
            if !self.filter.feed(c) {
                continue;
            }
            match c {
                '\n' => self.finish_line(),
                // A bare CR is a progress-bar rewrite; keep only what follows it.
                '\r' => {
                    self.partial.clear();
                    self.partial_chars = 0;
                }
                _ => {
                    if self.partial_chars >= MAX_LINE_CHARS {
                        continue;
                    }
                    if push_visible(&mut self.partial, c) {
                        self.partial_chars += 1;
                    }
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.partial.clear();
        self.partial_chars = 0;
        self.filter = EscapeFilter::default();
    }

    /// Number of lines including a non-empty partial line.
    pub fn len(&self) -> usize {
        self.lines.len() + usize::from(!self.partial.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines
            .iter()
            .map(String::as_str)
            .chain((!self.partial.is_empty()).then_some(self.partial.as_str()))
    }

    fn finish_line(&mut self) {
        while self.lines.len() >= self.max_lines {
            self.lines.pop_front();
        }
        self.lines.push_back(std::mem::take(&mut self.partial));
        self.partial_chars = 0;
    }
}
