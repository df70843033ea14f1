/// Navigable list of previously submitted input lines.
///
/// The cursor is `None` when not browsing; `previous` enters browse
/// mode at the newest entry and walks toward older ones (clamped at
/// the oldest), `next` walks back toward newer ones and falls off the
/// newest entry into the not-browsing state.
#[derive(Debug, Default)]
pub struct InputHistory {
    entries: Vec<String>,
    cursor: Option<usize>,
}

impl InputHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, text: impl Into<String>) {
        self.entries.push(text.into());
        self.cursor = None;
    }

    pub fn previous(&mut self) -> Option<&str> {
        if self.entries.is_empty() {
            return None;
        }
        let index = match self.cursor {
            None => self.entries.len() - 1,
            Some(0) => 0,
            Some(index) => index - 1,
        };
        self.cursor = Some(index);
        Some(self.entries[index].as_str())
    }

    pub fn next(&mut self) -> Option<&str> {
        let index = self.cursor? + 1;
        if index >= self.entries.len() {
            self.cursor = None;
            return None;
        }
        self.cursor = Some(index);
        Some(self.entries[index].as_str())
    }

    pub fn reset_cursor(&mut self) {
        self.cursor = None;
    }

    pub fn is_browsing(&self) -> bool {
        self.cursor.is_some()
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }
}
