//! Lunac library
//!
//! A Lua 5.1 compiler: translates Lua source text into a binary chunk
//! that the unmodified reference Lua 5.1 VM (`loadstring`,
//! `luaL_loadbuffer`) can load and execute.
//!
//! The pipeline is strictly linear — tokenizer, parser, code generator,
//! binary emitter — and each stage can be driven separately:
//!
//! ```
//! let chunk = lunac::compile(b"return 1 + 2").unwrap();
//! assert_eq!(&chunk[..4], b"\x1bLua");
//! ```

pub mod ast;
pub mod codegen;
pub mod emitter;
pub mod error;
pub mod lexer;
pub mod opcode;
pub mod parser;
pub mod proto;

// Re-export commonly used types
pub use ast::{Block, Expression, Node, Statement};
pub use codegen::generate;
pub use emitter::{emit, emit_with_options, write_chunk, EmitOptions};
pub use error::{CompileError, Result};
pub use lexer::{tokenize, Token, TokenWithLocation};
pub use opcode::{Instruction, OpCode};
pub use parser::parse;
pub use proto::{Constant, Prototype};

/// Default chunk name used when the caller does not supply one
const DEFAULT_CHUNK_NAME: &str = "chunk";

/// Compile a source buffer into a binary chunk
pub fn compile(source: &[u8]) -> Result<Vec<u8>> {
    compile_named(source, DEFAULT_CHUNK_NAME)
}

/// Compile a source buffer into a binary chunk, recording `chunk_name`
/// (typically the file name) in the chunk's debug information
pub fn compile_named(source: &[u8], chunk_name: &str) -> Result<Vec<u8>> {
    let tokens = tokenize(source)?;
    let block = parse(tokens)?;
    let proto = generate(&block, chunk_name)?;
    Ok(emit(&proto))
}
