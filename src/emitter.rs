//! Binary chunk serialization
//!
//! Writes a prototype tree in the Lua 5.1 binary chunk layout accepted by
//! the reference loader: the 12-byte header, then the recursive function
//! block (code, constants, nested prototypes, debug info). All integers
//! are little-endian, matching the header's endianness byte; numbers are
//! the raw IEEE-754 bit pattern, never formatted text.

use std::io::{self, Write};

use byteorder::{LittleEndian, WriteBytesExt};

use crate::proto::{Constant, Prototype};

/// `\x1bLua`
const SIGNATURE: &[u8] = b"\x1bLua";
/// Binary chunk version for Lua 5.1
const VERSION: u8 = 0x51;
/// Official format
const FORMAT: u8 = 0x00;
/// Little-endian flag
const ENDIANNESS: u8 = 0x01;
/// `sizeof(int)` in the target loader
const INT_BYTES: u8 = 4;
/// `sizeof(Instruction)`
const INSTRUCTION_BYTES: u8 = 4;
/// `sizeof(lua_Number)`
const NUMBER_BYTES: u8 = 8;
/// Numbers are doubles, not integers
const INTEGRAL_FLAG: u8 = 0x00;

/// Constant type tags
const TAG_NIL: u8 = 0;
const TAG_BOOLEAN: u8 = 1;
const TAG_NUMBER: u8 = 3;
const TAG_STRING: u8 = 4;

/// The reference `VARARG_ISVARARG` flag bit
const VARARG_ISVARARG: u8 = 2;

/// Emitter configuration
#[derive(Debug, Clone)]
pub struct EmitOptions {
    /// Width of `size_t` in the target loader's header: 4 or 8. Most
    /// 32-bit builds (and this crate's default) use 4; 64-bit-default
    /// loaders want 8.
    pub size_t_bytes: u8,
}

impl Default for EmitOptions {
    fn default() -> Self {
        EmitOptions { size_t_bytes: 4 }
    }
}

/// Serialize a prototype tree into a binary chunk
pub fn emit(proto: &Prototype) -> Vec<u8> {
    emit_with_options(proto, &EmitOptions::default())
}

/// Serialize with explicit options
pub fn emit_with_options(proto: &Prototype, options: &EmitOptions) -> Vec<u8> {
    let mut buf = Vec::new();
    write_chunk(&mut buf, proto, options).expect("writing to a Vec cannot fail");
    buf
}

/// Write a complete binary chunk to any sink
pub fn write_chunk<W: Write>(out: W, proto: &Prototype, options: &EmitOptions) -> io::Result<()> {
    let mut writer = ChunkWriter {
        out,
        size_t_bytes: options.size_t_bytes,
    };
    writer.write_header()?;
    writer.write_function(proto, true)
}

struct ChunkWriter<W: Write> {
    out: W,
    size_t_bytes: u8,
}

impl<W: Write> ChunkWriter<W> {
    fn write_header(&mut self) -> io::Result<()> {
        self.out.write_all(SIGNATURE)?;
        self.out.write_u8(VERSION)?;
        self.out.write_u8(FORMAT)?;
        self.out.write_u8(ENDIANNESS)?;
        self.out.write_u8(INT_BYTES)?;
        self.out.write_u8(self.size_t_bytes)?;
        self.out.write_u8(INSTRUCTION_BYTES)?;
        self.out.write_u8(NUMBER_BYTES)?;
        self.out.write_u8(INTEGRAL_FLAG)?;
        Ok(())
    }

    fn write_function(&mut self, proto: &Prototype, is_root: bool) -> io::Result<()> {
        // Nested functions inherit the source from their parent; only the
        // root carries the chunk name
        if is_root {
            self.write_string(Some(format!("@{}", proto.source).as_bytes()))?;
        } else {
            self.write_string(None)?;
        }
        self.out.write_u32::<LittleEndian>(proto.line_defined)?;
        self.out
            .write_u32::<LittleEndian>(proto.last_line_defined)?;
        self.out.write_u8(proto.upvalues.len() as u8)?;
        self.out.write_u8(proto.num_params)?;
        self.out
            .write_u8(if proto.is_vararg { VARARG_ISVARARG } else { 0 })?;
        self.out.write_u8(proto.max_stack_size)?;

        // Code
        self.out.write_u32::<LittleEndian>(proto.code.len() as u32)?;
        for &insn in &proto.code {
            self.out.write_u32::<LittleEndian>(insn)?;
        }

        // Constants
        self.out
            .write_u32::<LittleEndian>(proto.constants.len() as u32)?;
        for constant in &proto.constants {
            match constant {
                Constant::Nil => self.out.write_u8(TAG_NIL)?,
                Constant::Boolean(b) => {
                    self.out.write_u8(TAG_BOOLEAN)?;
                    self.out.write_u8(u8::from(*b))?;
                }
                Constant::Number(n) => {
                    self.out.write_u8(TAG_NUMBER)?;
                    // The reference loader reads the raw double bit pattern
                    self.out.write_all(&n.to_le_bytes())?;
                }
                Constant::String(s) => {
                    self.out.write_u8(TAG_STRING)?;
                    self.write_string(Some(s.as_slice()))?;
                }
            }
        }

        // Nested prototypes
        self.out
            .write_u32::<LittleEndian>(proto.children.len() as u32)?;
        for child in &proto.children {
            self.write_function(child, false)?;
        }

        // Debug: line info, locals, upvalue names
        self.out.write_u32::<LittleEndian>(proto.lines.len() as u32)?;
        for &line in &proto.lines {
            self.out.write_u32::<LittleEndian>(line)?;
        }
        self.out
            .write_u32::<LittleEndian>(proto.locals.len() as u32)?;
        for local in &proto.locals {
            self.write_string(Some(local.name.as_bytes()))?;
            self.out.write_u32::<LittleEndian>(local.start_pc)?;
            self.out.write_u32::<LittleEndian>(local.end_pc)?;
        }
        self.out
            .write_u32::<LittleEndian>(proto.upvalues.len() as u32)?;
        for upvalue in &proto.upvalues {
            self.write_string(Some(upvalue.name.as_bytes()))?;
        }
        Ok(())
    }

    /// A Lua string: size_t length including the trailing NUL, then the
    /// bytes, then the NUL. `None` (the absent string) is length 0 with no
    /// bytes at all.
    fn write_string(&mut self, s: Option<&[u8]>) -> io::Result<()> {
        match s {
            None => self.write_size(0),
            Some(bytes) => {
                self.write_size(bytes.len() as u64 + 1)?;
                self.out.write_all(bytes)?;
                self.out.write_u8(0)
            }
        }
    }

    fn write_size(&mut self, size: u64) -> io::Result<()> {
        if self.size_t_bytes == 8 {
            self.out.write_u64::<LittleEndian>(size)
        } else {
            self.out.write_u32::<LittleEndian>(size as u32)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trivial_proto() -> Prototype {
        let mut proto = Prototype::new("test", 0, true);
        // RETURN 0 1
        proto.code.push(0x0080001E);
        proto.lines.push(1);
        proto
    }

    #[test]
    fn test_header_bytes() {
        let chunk = emit(&trivial_proto());
        assert_eq!(
            &chunk[..12],
            &[0x1B, b'L', b'u', b'a', 0x51, 0x00, 0x01, 4, 4, 4, 8, 0x00]
        );
    }

    #[test]
    fn test_size_t_option_changes_header() {
        let options = EmitOptions { size_t_bytes: 8 };
        let chunk = emit_with_options(&trivial_proto(), &options);
        assert_eq!(chunk[8], 8);
        // Source name length is now a u64
        assert_eq!(&chunk[12..20], &[6, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_source_name_has_at_prefix_and_nul() {
        let chunk = emit(&trivial_proto());
        // size_t(6) then "@test\0"
        assert_eq!(&chunk[12..16], &[6, 0, 0, 0]);
        assert_eq!(&chunk[16..22], b"@test\x00");
    }

    #[test]
    fn test_number_constant_is_le_double() {
        let mut proto = trivial_proto();
        proto.constants.push(Constant::Number(1.0));
        let chunk = emit(&proto);
        // 1.0 is 0x3FF0000000000000; little-endian puts 0x3F last
        let pattern = [0u8, 0, 0, 0, 0, 0, 0xF0, 0x3F];
        assert!(chunk
            .windows(pattern.len())
            .any(|window| window == pattern));
    }

    #[test]
    fn test_string_constant_with_embedded_nul() {
        let mut proto = trivial_proto();
        proto
            .constants
            .push(Constant::String(bstr::BString::from(&b"a\x00b"[..])));
        let chunk = emit(&proto);
        // tag, size_t(4), bytes, trailing NUL
        let pattern = [4u8, 4, 0, 0, 0, b'a', 0, b'b', 0];
        assert!(chunk
            .windows(pattern.len())
            .any(|window| window == pattern));
    }

    #[test]
    fn test_vararg_flag() {
        let chunk = emit(&trivial_proto());
        // source string "@test\0" ends at offset 22; then two u32 line
        // fields, nups, numparams, then the vararg byte
        assert_eq!(chunk[22 + 8 + 2], VARARG_ISVARARG);
    }

    #[test]
    fn test_deterministic_output() {
        let proto = trivial_proto();
        assert_eq!(emit(&proto), emit(&proto));
    }
}
