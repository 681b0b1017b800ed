use std::{fmt, sync::Arc};

/// A region of script source text, used for error messages and debug info.
///
/// Line and column numbers are 1-based. A default-constructed location is
/// "unset" and prints nothing; the compiler and evaluators pass unset
/// locations through unchanged so that the innermost site with a real
/// location wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceLocation {
    start_line: u32,
    start_column: u32,
    end_line: u32,
    end_column: u32,
    /// Shared file name, one allocation per parsed file.
    file: Option<Arc<str>>,
    /// Optional copy of the relevant source line for pretty error output.
    source_line: Option<String>,
}

impl SourceLocation {
    /// Creates a location starting at the given 1-based line/column.
    #[must_use]
    pub fn at(start_line: u32, start_column: u32) -> Self {
        Self {
            start_line,
            start_column,
            end_line: start_line,
            end_column: start_column,
            file: None,
            source_line: None,
        }
    }

    /// Creates a location covering a whole line.
    #[must_use]
    pub fn line(line: u32) -> Self {
        Self::at(line, 1)
    }

    #[must_use]
    pub fn with_file(mut self, file: Arc<str>) -> Self {
        self.file = Some(file);
        self
    }

    #[must_use]
    pub fn with_end(mut self, end_line: u32, end_column: u32) -> Self {
        self.end_line = end_line.max(self.start_line);
        self.end_column = end_column;
        self
    }

    #[must_use]
    pub fn with_source_line(mut self, text: impl Into<String>) -> Self {
        self.source_line = Some(text.into());
        self
    }

    /// Whether this location carries real position information.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.start_line != 0
    }

    #[must_use]
    pub fn start_line(&self) -> u32 {
        self.start_line
    }

    #[must_use]
    pub fn start_column(&self) -> u32 {
        self.start_column
    }

    #[must_use]
    pub fn end_line(&self) -> u32 {
        self.end_line
    }

    #[must_use]
    pub fn end_column(&self) -> u32 {
        self.end_column
    }

    #[must_use]
    pub fn file(&self) -> Option<&str> {
        self.file.as_deref()
    }

    #[must_use]
    pub fn source_line(&self) -> Option<&str> {
        self.source_line.as_deref()
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_set() {
            return Ok(());
        }
        if let Some(file) = &self.file {
            write!(f, "{file}:")?;
        }
        write!(f, "{}:{}", self.start_line, self.start_column)
    }
}
