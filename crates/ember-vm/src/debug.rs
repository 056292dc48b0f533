//! Bytecode disassembler.
//!
//! Produces the four-column listing used by `--dump-bytecode`, execution
//! tracing, and tests: byte offset, source line (`|` when unchanged from
//! the previous instruction), padded opcode name, and the operand —
//! constants rendered through value printing.

use ember_core::{Chunk, Heap, OpCode};

/// Disassemble a whole chunk under a banner with the function's name.
pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str) -> String {
    let mut out = format!("==[{name}]==\n");
    let mut offset = 0;
    while offset < chunk.code.len() {
        let (text, next) = disassemble_instruction(heap, chunk, offset);
        out.push_str(&text);
        out.push('\n');
        offset = next;
    }
    out
}

/// Disassemble the instruction at `offset`; returns its text (without a
/// trailing newline) and the offset of the next instruction.
pub fn disassemble_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut text = format!("{offset:04} ");
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        text.push_str("   | ");
    } else {
        text.push_str(&format!("{:>4} ", chunk.lines[offset]));
    }

    let byte = chunk.code[offset];
    let Some(op) = OpCode::from_byte(byte) else {
        text.push_str(&format!("Unknown opcode {byte}"));
        return (text, offset + 1);
    };

    use OpCode::*;
    match op {
        Constant | GetGlobal | DefineGlobal | SetGlobal | GetProperty | SetProperty | GetSuper
        | Class | Method => constant_instruction(heap, chunk, op, offset, text),
        GetLocal | SetLocal | GetUpvalue | SetUpvalue | Call => {
            byte_instruction(chunk, op, offset, text)
        }
        Jump | JumpIfFalse => jump_instruction(chunk, op, offset, 1, text),
        Loop => jump_instruction(chunk, op, offset, -1, text),
        Invoke | SuperInvoke => invoke_instruction(heap, chunk, op, offset, text),
        Closure => closure_instruction(heap, chunk, op, offset, text),
        _ => {
            text.push_str(op.name());
            (text, offset + 1)
        }
    }
}

fn constant_instruction(
    heap: &Heap,
    chunk: &Chunk,
    op: OpCode,
    offset: usize,
    mut text: String,
) -> (String, usize) {
    let constant = chunk.code[offset + 1] as usize;
    text.push_str(&format!(
        "{:<16} {:4} '{}'",
        op.name(),
        constant,
        heap.format_value(chunk.constants[constant])
    ));
    (text, offset + 2)
}

fn byte_instruction(chunk: &Chunk, op: OpCode, offset: usize, mut text: String) -> (String, usize) {
    let slot = chunk.code[offset + 1];
    text.push_str(&format!("{:<16} {slot:4}", op.name()));
    (text, offset + 2)
}

fn jump_instruction(
    chunk: &Chunk,
    op: OpCode,
    offset: usize,
    sign: i64,
    mut text: String,
) -> (String, usize) {
    let jump = i64::from(u16::from(chunk.code[offset + 1]) << 8 | u16::from(chunk.code[offset + 2]));
    let target = offset as i64 + 3 + sign * jump;
    text.push_str(&format!("{:<16} {offset:4} -> {target}", op.name()));
    (text, offset + 3)
}

fn invoke_instruction(
    heap: &Heap,
    chunk: &Chunk,
    op: OpCode,
    offset: usize,
    mut text: String,
) -> (String, usize) {
    let constant = chunk.code[offset + 1] as usize;
    let arg_count = chunk.code[offset + 2];
    text.push_str(&format!(
        "{:<16} ({arg_count} args) {constant:4} '{}'",
        op.name(),
        heap.format_value(chunk.constants[constant])
    ));
    (text, offset + 3)
}

fn closure_instruction(
    heap: &Heap,
    chunk: &Chunk,
    op: OpCode,
    offset: usize,
    mut text: String,
) -> (String, usize) {
    let constant = chunk.code[offset + 1] as usize;
    let value = chunk.constants[constant];
    text.push_str(&format!(
        "{:<16} {constant:4} '{}'",
        op.name(),
        heap.format_value(value)
    ));

    let mut next = offset + 2;
    let function = value.as_object();
    for _ in 0..heap.function(function).upvalue_count {
        let is_local = chunk.code[next];
        let index = chunk.code[next + 1];
        text.push_str(&format!(
            "\n{next:04}      |                     {} {index}",
            if is_local != 0 { "local" } else { "upvalue" }
        ));
        next += 2;
    }
    (text, next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::{Roots, Value};

    #[test]
    fn simple_instructions_are_one_byte() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::Return, 1);

        let (text, next) = disassemble_instruction(&heap, &chunk, 0);
        assert!(text.starts_with("0000    1 Nil"));
        assert_eq!(next, 1);

        // Same source line renders as a pipe.
        let (text, next) = disassemble_instruction(&heap, &chunk, 1);
        assert!(text.starts_with("0001    | Return"));
        assert_eq!(next, 2);
    }

    #[test]
    fn constant_instructions_render_their_value() {
        let mut heap = Heap::new();
        let mut chunk = Chunk::new();
        let index = chunk.add_constant(Value::number(2.5));
        chunk.write_op(OpCode::Constant, 4);
        chunk.write(index as u8, 4);

        let (text, next) = disassemble_instruction(&heap, &chunk, 0);
        assert!(text.contains("Constant"));
        assert!(text.contains("'2.5'"));
        assert_eq!(next, 2);

        let name = heap.intern("score", Roots::EMPTY);
        let index = chunk.add_constant(Value::object(name));
        chunk.write_op(OpCode::GetGlobal, 4);
        chunk.write(index as u8, 4);
        let (text, _) = disassemble_instruction(&heap, &chunk, 2);
        assert!(text.contains("GetGlobal"));
        assert!(text.contains("'score'"));
    }

    #[test]
    fn jump_instructions_show_their_target() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Jump, 1);
        chunk.write(0x00, 1);
        chunk.write(0x05, 1);

        let (text, next) = disassemble_instruction(&heap, &chunk, 0);
        assert!(text.contains("Jump"));
        assert!(text.contains("0 -> 8"));
        assert_eq!(next, 3);
    }

    #[test]
    fn chunk_listing_covers_every_instruction() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::Print, 1);
        chunk.write_op(OpCode::Nil, 2);
        chunk.write_op(OpCode::Return, 2);

        let listing = disassemble_chunk(&heap, &chunk, "<script>");
        assert!(listing.starts_with("==[<script>]==\n"));
        assert_eq!(listing.lines().count(), 5);
    }
}
