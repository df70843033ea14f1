use std::time::SystemTime;

use crate::protocol::StreamKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Stdout,
    Stderr,
    System,
    Input,
}

impl From<StreamKind> for LineKind {
    fn from(stream: StreamKind) -> Self {
        match stream {
            StreamKind::Stdout => LineKind::Stdout,
            StreamKind::Stderr => LineKind::Stderr,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutputLine {
    pub kind: LineKind,
    pub content: String,
    pub timestamp: SystemTime,
}

/// Append-only log of typed output fragments in arrival order.
///
/// Fragments are stored discretely, never coalesced; rendering decides
/// whether the last fragment continues an open line by checking for a
/// trailing newline.
#[derive(Debug, Default)]
pub struct OutputLog {
    lines: Vec<OutputLine>,
}

impl OutputLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, kind: LineKind, content: impl Into<String>) {
        self.lines.push(OutputLine {
            kind,
            content: content.into(),
            timestamp: SystemTime::now(),
        });
    }

    /// True iff the most recent fragment has not been terminated by a
    /// newline, i.e. the cursor should render inline.
    pub fn last_line_open(&self) -> bool {
        self.lines
            .last()
            .map(|line| !line.content.ends_with('\n'))
            .unwrap_or(false)
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn lines(&self) -> &[OutputLine] {
        &self.lines
    }

    pub fn snapshot(&self) -> Vec<OutputLine> {
        self.lines.clone()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
