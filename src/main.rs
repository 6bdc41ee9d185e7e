//! Compile a Lox script and, on request, dump its bytecode.
//!
//! The VM that would *run* the chunk lives in the embedding runtime; this
//! driver is the compiler's own front door: it reports diagnostics and can
//! show the generated code.

use std::io::Read;
use std::process::ExitCode;
use std::{env, fs, io};

use rox::compiler::compile;
use rox::debug::disassemble_chunk;
use rox::gc::ActiveGC;
use rox::value::Value;

fn main() -> ExitCode {
    let mut path = None;
    let mut disassemble = false;
    for argument in env::args().skip(1) {
        match argument.as_str() {
            "--disassemble" => disassemble = true,
            _ if path.is_none() => path = Some(argument),
            _ => {
                eprintln!("Usage: rox [--disassemble] [script]");
                return ExitCode::from(64); // EX_USAGE
            }
        }
    }

    let source = match read_source(path.as_deref()) {
        Ok(source) => source,
        Err(error) => {
            eprintln!("rox: {}: {error}", path.as_deref().unwrap_or("<stdin>"));
            return ExitCode::from(66); // EX_NOINPUT
        }
    };

    let gc = ActiveGC::install();
    match compile(&source, &gc) {
        Ok(script) => {
            if disassemble {
                disassemble_chunk(&script.chunk, &script.debug_name());
                // Every nested function has a chunk of its own.
                for index in 0..script.chunk.constants().len() {
                    if let Some(Value::Function(function)) = script.chunk.constants().get(index) {
                        disassemble_chunk(&function.chunk, &function.debug_name());
                    }
                }
            }
            ExitCode::SUCCESS
        }
        // The diagnostics already went to stderr as they were found.
        Err(_) => ExitCode::from(65), // EX_DATAERR
    }
}

fn read_source(path: Option<&str>) -> io::Result<String> {
    match path {
        Some(path) => fs::read_to_string(path),
        None => {
            let mut source = String::new();
            io::stdin().read_to_string(&mut source)?;
            Ok(source)
        }
    }
}
