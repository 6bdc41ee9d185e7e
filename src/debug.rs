//! Helpers to print a debug representation of compiled bytecode.
//!
//! The core renderers build a [String] so callers (and tests) can capture the
//! listing; [disassemble_chunk] is the print-to-stdout convenience the driver
//! and the `print_code` feature use.

use std::fmt::{self, Write};

use crate::chunk::{Chunk, OpCode};
use crate::value::Value;

/// Given a chunk, prints its disassembly to `stdout`.
pub fn disassemble_chunk(chunk: &Chunk, name: &str) {
    print!("{}", render_chunk(chunk, name));
}

/// Render the disassembly of an entire chunk.
pub fn render_chunk(chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    write_chunk(&mut out, chunk, name).expect("writing to a String cannot fail");
    out
}

fn write_chunk(out: &mut dyn Write, chunk: &Chunk, name: &str) -> fmt::Result {
    writeln!(out, "== {name} ==")?;

    let mut offset = 0;
    while offset < chunk.len() {
        offset = write_instruction(out, chunk, offset)?;
    }
    Ok(())
}

/// Render one instruction, taking its operands into account.
/// Returns the offset of the next instruction.
fn write_instruction(out: &mut dyn Write, chunk: &Chunk, offset: usize) -> Result<usize, fmt::Error> {
    write!(out, "{offset:04} ")?;

    if offset > 0 && at_same_line_as_previous_offset(chunk, offset) {
        write!(out, "   | ")?;
    } else {
        let line_no = chunk.line_number_for(offset).expect("offset in range");
        write!(out, "{line_no:4} ")?;
    }

    let entry = chunk.get(offset).expect("offset too large");
    let Some(instruction) = entry.as_opcode() else {
        writeln!(out, "OP_UNKNOWN      {:#04x}", entry.as_byte())?;
        return Ok(offset + 1);
    };

    use OpCode::*;
    match instruction {
        Constant | GetGlobal | DefineGlobal | SetGlobal | GetProperty | SetProperty | GetSuper
        | Class | Method => constant_instruction(out, instruction, chunk, offset),
        GetLocal | SetLocal | GetUpvalue | SetUpvalue | Call => {
            byte_instruction(out, instruction, chunk, offset)
        }
        Jump | JumpIfFalse => jump_instruction(out, instruction, 1, chunk, offset),
        Loop => jump_instruction(out, instruction, -1, chunk, offset),
        Invoke | SuperInvoke => invoke_instruction(out, instruction, chunk, offset),
        Closure => closure_instruction(out, chunk, offset),
        Nil | True | False | Pop | Equal | Greater | Less | Add | Subtract | Multiply | Divide
        | Not | Negate | Print | CloseUpvalue | Inherit | Return => {
            writeln!(out, "{}", name_of(instruction))?;
            Ok(offset + 1)
        }
    }
}

/////////////////////////////////////// Instruction formats ///////////////////////////////////////

fn constant_instruction(
    out: &mut dyn Write,
    instruction: OpCode,
    chunk: &Chunk,
    offset: usize,
) -> Result<usize, fmt::Error> {
    let (index, value) = chunk
        .get(offset + 1)
        .expect("ran out of bytes")
        .resolve_constant_with_index()
        .expect("invalid constant index");
    writeln!(out, "{:<16} {index:4} '{value}'", name_of(instruction))?;
    Ok(offset + 2)
}

fn byte_instruction(
    out: &mut dyn Write,
    instruction: OpCode,
    chunk: &Chunk,
    offset: usize,
) -> Result<usize, fmt::Error> {
    let slot = chunk.get(offset + 1).expect("ran out of bytes").as_byte();
    writeln!(out, "{:<16} {slot:4}", name_of(instruction))?;
    Ok(offset + 2)
}

fn jump_instruction(
    out: &mut dyn Write,
    instruction: OpCode,
    sign: isize,
    chunk: &Chunk,
    offset: usize,
) -> Result<usize, fmt::Error> {
    let distance = chunk.read_u16(offset + 1).expect("ran out of bytes") as isize;
    let target = (offset as isize) + 3 + sign * distance;
    writeln!(out, "{:<16} {offset:4} -> {target}", name_of(instruction))?;
    Ok(offset + 3)
}

fn invoke_instruction(
    out: &mut dyn Write,
    instruction: OpCode,
    chunk: &Chunk,
    offset: usize,
) -> Result<usize, fmt::Error> {
    let (index, value) = chunk
        .get(offset + 1)
        .expect("ran out of bytes")
        .resolve_constant_with_index()
        .expect("invalid constant index");
    let arg_count = chunk.get(offset + 2).expect("ran out of bytes").as_byte();
    writeln!(
        out,
        "{:<16} ({arg_count} args) {index:4} '{value}'",
        name_of(instruction)
    )?;
    Ok(offset + 3)
}

fn closure_instruction(
    out: &mut dyn Write,
    chunk: &Chunk,
    offset: usize,
) -> Result<usize, fmt::Error> {
    let (index, value) = chunk
        .get(offset + 1)
        .expect("ran out of bytes")
        .resolve_constant_with_index()
        .expect("invalid constant index");
    writeln!(out, "{:<16} {index:4} {value}", name_of(OpCode::Closure))?;

    // The trailer: one (is_local, index) byte pair per upvalue.
    let upvalue_count = match &value {
        Value::Function(function) => function.upvalue_count,
        _ => 0,
    };
    let mut offset = offset + 2;
    for _ in 0..upvalue_count {
        let is_local = chunk.get(offset).expect("ran out of bytes").as_byte();
        let index = chunk.get(offset + 1).expect("ran out of bytes").as_byte();
        let kind = if is_local == 1 { "local" } else { "upvalue" };
        writeln!(out, "{offset:04}      |                     {kind} {index}")?;
        offset += 2;
    }
    Ok(offset)
}

//////////////////////////////////////////// Utilities ////////////////////////////////////////////

/// The classic `OP_`-prefixed display name.
fn name_of(instruction: OpCode) -> &'static str {
    use OpCode::*;
    match instruction {
        Constant => "OP_CONSTANT",
        Nil => "OP_NIL",
        True => "OP_TRUE",
        False => "OP_FALSE",
        Pop => "OP_POP",
        GetLocal => "OP_GET_LOCAL",
        SetLocal => "OP_SET_LOCAL",
        GetGlobal => "OP_GET_GLOBAL",
        DefineGlobal => "OP_DEFINE_GLOBAL",
        SetGlobal => "OP_SET_GLOBAL",
        GetUpvalue => "OP_GET_UPVALUE",
        SetUpvalue => "OP_SET_UPVALUE",
        GetProperty => "OP_GET_PROPERTY",
        SetProperty => "OP_SET_PROPERTY",
        GetSuper => "OP_GET_SUPER",
        Equal => "OP_EQUAL",
        Greater => "OP_GREATER",
        Less => "OP_LESS",
        Add => "OP_ADD",
        Subtract => "OP_SUBTRACT",
        Multiply => "OP_MULTIPLY",
        Divide => "OP_DIVIDE",
        Not => "OP_NOT",
        Negate => "OP_NEGATE",
        Print => "OP_PRINT",
        Jump => "OP_JUMP",
        JumpIfFalse => "OP_JUMP_IF_FALSE",
        Loop => "OP_LOOP",
        Call => "OP_CALL",
        Invoke => "OP_INVOKE",
        SuperInvoke => "OP_SUPER_INVOKE",
        Closure => "OP_CLOSURE",
        CloseUpvalue => "OP_CLOSE_UPVALUE",
        Return => "OP_RETURN",
        Class => "OP_CLASS",
        Inherit => "OP_INHERIT",
        Method => "OP_METHOD",
    }
}

/// Returns true if the given offset is on the same source line as the byte
/// before it.
fn at_same_line_as_previous_offset(chunk: &Chunk, offset: usize) -> bool {
    assert!(offset > 0);

    chunk
        .line_number_for(offset)
        .zip(chunk.line_number_for(offset - 1))
        .map(|(current_line, previous_line)| current_line == previous_line)
        .unwrap_or(false)
}

////////////////////////////////////////////// Tests //////////////////////////////////////////////
