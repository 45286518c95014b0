// File: src/errors.rs
//
// Error handling and reporting for the Ember scripting language.
// Provides structured error values with source location information,
// optional call-stack snapshots, and pretty-printed diagnostics.

use colored::Colorize;
use std::fmt;

/// Source location information for tracking where code appears in a file
#[derive(Debug, Clone, PartialEq)]
pub struct SourceLocation {
    pub line: usize,
    pub column: usize,
    pub file: Option<String>,
}

impl SourceLocation {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column, file: None }
    }

    pub fn with_file(line: usize, column: usize, file: String) -> Self {
        Self { line, column, file: Some(file) }
    }

    pub fn unknown() -> Self {
        Self { line: 0, column: 0, file: None }
    }

    pub fn is_known(&self) -> bool {
        self.line > 0
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(ref file) = self.file {
            write!(f, "{}:{}:{}", file, self.line, self.column)
        } else {
            write!(f, "{}:{}", self.line, self.column)
        }
    }
}

/// The closed set of error kinds the VM can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Syntax,
    Runtime,
    Type,
    Bounds,
    Memory,
    Security,
    Io,
    Import,
}

impl ErrorKind {
    /// Script-visible kind name, as returned by the `kind` accessor
    /// on caught error objects.
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::Syntax => "syntax",
            ErrorKind::Runtime => "runtime",
            ErrorKind::Type => "type",
            ErrorKind::Bounds => "bounds",
            ErrorKind::Memory => "memory",
            ErrorKind::Security => "security",
            ErrorKind::Io => "io",
            ErrorKind::Import => "import",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::Syntax => write!(f, "Syntax Error"),
            ErrorKind::Runtime => write!(f, "Runtime Error"),
            ErrorKind::Type => write!(f, "Type Error"),
            ErrorKind::Bounds => write!(f, "Bounds Error"),
            ErrorKind::Memory => write!(f, "Memory Error"),
            ErrorKind::Security => write!(f, "Security Error"),
            ErrorKind::Io => write!(f, "IO Error"),
            ErrorKind::Import => write!(f, "Import Error"),
        }
    }
}

/// One entry of a captured call stack: function name plus the source line
/// of the active instruction in that frame.
#[derive(Debug, Clone, PartialEq)]
pub struct StackEntry {
    pub function_name: String,
    pub line: usize,
}

/// A structured error with location information
#[derive(Debug, Clone)]
pub struct EmberError {
    pub kind: ErrorKind,
    pub message: String,
    pub location: SourceLocation,
    pub source_line: Option<String>,
    pub call_stack: Vec<StackEntry>,
}

impl EmberError {
    pub fn new(kind: ErrorKind, message: String, location: SourceLocation) -> Self {
        Self { kind, message, location, source_line: None, call_stack: Vec::new() }
    }

    pub fn with_source(mut self, source_line: String) -> Self {
        self.source_line = Some(source_line);
        self
    }

    pub fn with_call_stack(mut self, call_stack: Vec<StackEntry>) -> Self {
        self.call_stack = call_stack;
        self
    }

    /// Create a syntax error
    pub fn syntax(message: impl Into<String>, location: SourceLocation) -> Self {
        Self::new(ErrorKind::Syntax, message.into(), location)
    }

    /// Create a runtime error
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, message.into(), SourceLocation::unknown())
    }

    /// Create a type error
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Type, message.into(), SourceLocation::unknown())
    }

    /// Create a bounds error
    pub fn bounds(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Bounds, message.into(), SourceLocation::unknown())
    }

    /// Create a memory error
    pub fn memory(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Memory, message.into(), SourceLocation::unknown())
    }

    /// Create a security error. Security errors unwind like any other,
    /// but carry a distinguishing kind so tooling can tell a sandbox
    /// violation from an ordinary runtime failure.
    pub fn security(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Security, message.into(), SourceLocation::unknown())
    }

    /// Create an I/O error
    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message.into(), SourceLocation::unknown())
    }

    /// Create an import error
    pub fn import(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Import, message.into(), SourceLocation::unknown())
    }

    pub fn at(mut self, location: SourceLocation) -> Self {
        self.location = location;
        self
    }

    /// One-line form used by the CLI: `file:line:col: Kind: message`.
    pub fn one_line(&self) -> String {
        if self.location.is_known() {
            format!("{}: {}: {}", self.location, self.kind, self.message)
        } else {
            format!("{}: {}", self.kind, self.message)
        }
    }
}

impl fmt::Display for EmberError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind_str = format!("{}", self.kind);
        writeln!(f, "{}: {}", kind_str.red().bold(), self.message.bold())?;

        if self.location.is_known() {
            let location_str = format!("  --> {}", self.location);
            writeln!(f, "{}", location_str.bright_blue())?;
        }

        if let Some(ref source) = self.source_line {
            let line_num = self.location.line;
            let col_num = self.location.column;

            writeln!(f, "   {}", "|".bright_blue())?;
            writeln!(
                f,
                "{} {} {}",
                format!("{:3}", line_num).bright_blue(),
                "|".bright_blue(),
                source
            )?;
            writeln!(
                f,
                "   {} {}{}",
                "|".bright_blue(),
                " ".repeat(col_num.saturating_sub(1)),
                "^".red().bold()
            )?;
        }

        if !self.call_stack.is_empty() {
            writeln!(f, "   {}", "call stack (most recent first):".bright_cyan())?;
            for entry in self.call_stack.iter().rev() {
                writeln!(f, "     {} {} (line {})", "at".dimmed(), entry.function_name, entry.line)?;
            }
        }

        Ok(())
    }
}

impl std::error::Error for EmberError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_line_with_location() {
        let err = EmberError::syntax(
            "unexpected token",
            SourceLocation::with_file(3, 7, "main.ember".to_string()),
        );
        assert_eq!(err.one_line(), "main.ember:3:7: Syntax Error: unexpected token");
    }

    #[test]
    fn test_one_line_without_location() {
        let err = EmberError::runtime("Division by zero");
        assert_eq!(err.one_line(), "Runtime Error: Division by zero");
    }

    #[test]
    fn test_kind_names_are_stable() {
        assert_eq!(ErrorKind::Security.name(), "security");
        assert_eq!(ErrorKind::Bounds.name(), "bounds");
        assert_eq!(ErrorKind::Import.name(), "import");
    }

    #[test]
    fn test_call_stack_round_trip() {
        let err = EmberError::runtime("boom").with_call_stack(vec![
            StackEntry { function_name: "<script>".to_string(), line: 1 },
            StackEntry { function_name: "inner".to_string(), line: 4 },
        ]);
        assert_eq!(err.call_stack.len(), 2);
        assert_eq!(err.call_stack[1].function_name, "inner");
    }
}
