//! Command-line compiler driver
//!
//! Reads Lua source from a file or stdin, compiles it, and writes the
//! binary chunk to stdout or a file. `-l` prints a human-readable
//! instruction listing to stderr.

use std::env;
use std::fs;
use std::io::{self, Read, Write};
use std::process;

use lunac::emitter::{write_chunk, EmitOptions};
use lunac::opcode::{Instruction, OpCode};
use lunac::proto::{Constant, Prototype};

fn usage() -> ! {
    eprintln!("usage: lunac [-o output] [-l] [--size-t 4|8] [file | -]");
    process::exit(1);
}

fn main() {
    let mut input: Option<String> = None;
    let mut output: Option<String> = None;
    let mut list = false;
    let mut options = EmitOptions::default();

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-o" => match args.next() {
                Some(path) => output = Some(path),
                None => usage(),
            },
            "-l" => list = true,
            "--size-t" => match args.next().as_deref() {
                Some("4") => options.size_t_bytes = 4,
                Some("8") => options.size_t_bytes = 8,
                _ => usage(),
            },
            "-h" | "--help" => usage(),
            _ if input.is_none() => input = Some(arg),
            _ => usage(),
        }
    }

    let (source, chunk_name) = match input.as_deref() {
        None | Some("-") => {
            let mut buf = Vec::new();
            if let Err(err) = io::stdin().read_to_end(&mut buf) {
                eprintln!("lunac: error reading stdin: {}", err);
                process::exit(1);
            }
            (buf, "stdin".to_string())
        }
        Some(path) => match fs::read(path) {
            Ok(buf) => (buf, path.to_string()),
            Err(err) => {
                eprintln!("lunac: cannot read {}: {}", path, err);
                process::exit(1);
            }
        },
    };

    let tokens = lunac::tokenize(&source).unwrap_or_else(|err| fail(err));
    let block = lunac::parse(tokens).unwrap_or_else(|err| fail(err));
    let proto = lunac::generate(&block, &chunk_name).unwrap_or_else(|err| fail(err));

    if list {
        print_listing(&proto, 0);
    }

    let result = match output {
        Some(path) => fs::File::create(&path)
            .and_then(|file| write_chunk(file, &proto, &options))
            .map_err(|err| format!("cannot write {}: {}", path, err)),
        None => {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            write_chunk(&mut handle, &proto, &options)
                .and_then(|_| handle.flush())
                .map_err(|err| format!("cannot write chunk: {}", err))
        }
    };
    if let Err(err) = result {
        eprintln!("lunac: {}", err);
        process::exit(1);
    }
}

fn fail(err: lunac::CompileError) -> ! {
    eprintln!("lunac: {}", err);
    process::exit(1)
}

fn print_listing(proto: &Prototype, depth: usize) {
    let indent = "  ".repeat(depth);
    eprintln!(
        "{}function <{}:{}> ({} instructions, {} params, {} upvalues, {} stack)",
        indent,
        proto.source,
        proto.line_defined,
        proto.code.len(),
        proto.num_params,
        proto.upvalues.len(),
        proto.max_stack_size,
    );
    for (pc, &word) in proto.code.iter().enumerate() {
        let insn = Instruction(word);
        let op = insn.opcode();
        let operands = match op {
            OpCode::LoadK | OpCode::GetGlobal | OpCode::SetGlobal | OpCode::Closure => {
                format!("{} {}", insn.a(), insn.bx())
            }
            OpCode::Jmp | OpCode::ForLoop | OpCode::ForPrep => {
                format!("{} {}", insn.a(), insn.sbx())
            }
            _ => format!("{} {} {}", insn.a(), insn.b(), insn.c()),
        };
        eprintln!(
            "{}  [{:>4}] {:<10} {:<12} ; line {}",
            indent,
            pc + 1,
            op.name(),
            operands,
            proto.lines.get(pc).copied().unwrap_or(0),
        );
    }
    for (i, constant) in proto.constants.iter().enumerate() {
        let rendered = match constant {
            Constant::Nil => "nil".to_string(),
            Constant::Boolean(b) => b.to_string(),
            Constant::Number(n) => n.to_string(),
            Constant::String(s) => format!("{:?}", s),
        };
        eprintln!("{}  const [{}] = {}", indent, i, rendered);
    }
    for child in &proto.children {
        print_listing(child, depth + 1);
    }
}
