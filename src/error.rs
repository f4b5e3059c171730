//! Error types for the compiler
//!
//! Every failure carries the 1-based source line it was detected on.
//! Compilation stops at the first error; there is no recovery and no
//! partial bytecode.

/// Result type for compiler operations
pub type Result<T> = std::result::Result<T, CompileError>;

/// Errors that can occur while compiling a chunk
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    /// Malformed token (bad number, unterminated string, illegal character)
    #[error("lua: lexical error at line {line}:{column}: {message}")]
    Lex {
        message: String,
        line: u32,
        column: u32,
    },

    /// Syntax violation
    #[error("lua: syntax error at line {line}:{column}: {message}")]
    Parse {
        message: String,
        line: u32,
        column: u32,
    },

    /// Semantically invalid program (break outside a loop, too many
    /// locals/upvalues/constants/registers for the encoded fields)
    #[error("lua: code generation error at line {line}: {message}")]
    CodeGen { message: String, line: u32 },
}

impl CompileError {
    /// The source line the error was detected on
    pub fn line(&self) -> u32 {
        match self {
            CompileError::Lex { line, .. } => *line,
            CompileError::Parse { line, .. } => *line,
            CompileError::CodeGen { line, .. } => *line,
        }
    }
}

/// Build a lexical error
pub fn lex_error(message: impl Into<String>, line: u32, column: u32) -> CompileError {
    CompileError::Lex {
        message: message.into(),
        line,
        column,
    }
}

/// Build a syntax error
pub fn parse_error(message: impl Into<String>, line: u32, column: u32) -> CompileError {
    CompileError::Parse {
        message: message.into(),
        line,
        column,
    }
}

/// Build a code generation error
pub fn codegen_error(message: impl Into<String>, line: u32) -> CompileError {
    CompileError::CodeGen {
        message: message.into(),
        line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = lex_error("unfinished string", 3, 14);
        assert_eq!(
            err.to_string(),
            "lua: lexical error at line 3:14: unfinished string"
        );
        assert_eq!(err.line(), 3);
    }
}
