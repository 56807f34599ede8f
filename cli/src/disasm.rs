//! Bytecode disassembler, gated behind `debug-bytecode`. Lives here rather
//! than in `compiler` so the core crate never prints directly.

#[cfg(feature = "debug-bytecode")]
mod enabled {
    use compiler::{compile, Chunk, Gc, GcRef, ObjFunction, OpCode};

    /// Compiles `source` with a throwaway [`Gc`] and disassembles every
    /// function it produced, top-level first. Run only as a side effect
    /// before the real `Vm::interpret` call; compile errors are left for
    /// that call to report.
    pub fn disassemble_source(source: &str) {
        let mut gc = Gc::new();
        if let Ok(function) = compile(source, &mut gc) {
            disassemble_function(function);
        }
    }

    fn disassemble_function(function: GcRef<ObjFunction>) {
        let name = match function.as_ref().name {
            Some(name) => name.as_ref().as_str().to_string(),
            None => "<script>".to_string(),
        };
        disassemble_chunk(&name, &function.as_ref().chunk);
        for constant in &function.as_ref().chunk.constants {
            if let Some(nested) = constant.as_function() {
                disassemble_function(nested);
            }
        }
    }

    fn disassemble_chunk(name: &str, chunk: &Chunk) {
        eprintln!("== {name} ==");
        let mut offset = 0;
        while offset < chunk.len() {
            offset = disassemble_instruction(chunk, offset);
        }
    }

    fn disassemble_instruction(chunk: &Chunk, offset: usize) -> usize {
        eprint!("{offset:04} ");
        if offset > 0 && chunk.line_at(offset) == chunk.line_at(offset - 1) {
            eprint!("   | ");
        } else {
            eprint!("{:4} ", chunk.line_at(offset));
        }

        let op = OpCode::from_byte(chunk.code[offset]);
        match op {
            OpCode::Constant
            | OpCode::GetGlobal
            | OpCode::DefineGlobal
            | OpCode::SetGlobal
            | OpCode::GetProperty
            | OpCode::SetProperty
            | OpCode::GetSuper
            | OpCode::Class
            | OpCode::Method => constant_instruction(&format!("{op:?}"), chunk, offset),
            OpCode::GetLocal | OpCode::SetLocal | OpCode::GetUpvalue | OpCode::SetUpvalue | OpCode::Call => {
                byte_instruction(&format!("{op:?}"), chunk, offset)
            }
            OpCode::Jump | OpCode::JumpIfFalse => jump_instruction(&format!("{op:?}"), 1, chunk, offset),
            OpCode::Loop => jump_instruction(&format!("{op:?}"), -1, chunk, offset),
            OpCode::Invoke | OpCode::SuperInvoke => invoke_instruction(&format!("{op:?}"), chunk, offset),
            OpCode::Closure => closure_instruction(chunk, offset),
            _ => {
                eprintln!("{op:?}");
                offset + 1
            }
        }
    }

    fn constant_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
        let constant = chunk.code[offset + 1];
        eprintln!("{name:<16} {constant:4} '{}'", chunk.constants[constant as usize]);
        offset + 2
    }

    fn byte_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
        let slot = chunk.code[offset + 1];
        eprintln!("{name:<16} {slot:4}");
        offset + 2
    }

    fn jump_instruction(name: &str, sign: i32, chunk: &Chunk, offset: usize) -> usize {
        let jump = u16::from_be_bytes([chunk.code[offset + 1], chunk.code[offset + 2]]) as i32;
        let target = offset as i32 + 3 + sign * jump;
        eprintln!("{name:<16} {offset:4} -> {target}");
        offset + 3
    }

    fn invoke_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
        let constant = chunk.code[offset + 1];
        let argc = chunk.code[offset + 2];
        eprintln!(
            "{name:<16} ({argc} args) {constant:4} '{}'",
            chunk.constants[constant as usize]
        );
        offset + 3
    }

    fn closure_instruction(chunk: &Chunk, mut offset: usize) -> usize {
        offset += 1;
        let constant = chunk.code[offset];
        offset += 1;
        eprintln!("{:<16} {constant:4} '{}'", "Closure", chunk.constants[constant as usize]);
        if let Some(function) = chunk.constants[constant as usize].as_function() {
            let upvalue_count = function.as_ref().upvalue_count;
            for _ in 0..upvalue_count {
                let is_local = chunk.code[offset];
                offset += 1;
                let index = chunk.code[offset];
                offset += 1;
                let kind = if is_local != 0 { "local" } else { "upvalue" };
                eprintln!("{offset:04}      |                     {kind} {index}");
            }
        }
        offset
    }
}

#[cfg(feature = "debug-bytecode")]
pub use enabled::disassemble_source;

#[cfg(not(feature = "debug-bytecode"))]
pub fn disassemble_source(_source: &str) {}
