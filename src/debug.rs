use super::{
    chunk::{Chunk, Instruction},
    heap::Heap,
    value::Value,
};

pub fn disassemble(chunk: &Chunk, constants: &[Value], heap: &Heap, name: &str) -> String {
    let mut buffer = format!("== {} ==\n", name);
    let mut offset = 0;
    while offset < chunk.len() {
        let (rendered, progress) = disassemble_instr_at(chunk, constants, heap, offset);
        buffer += &rendered;
        offset += progress;
    }
    buffer
}

pub fn disassemble_instr_at(
    chunk: &Chunk,
    constants: &[Value],
    heap: &Heap,
    offset: usize,
) -> (String, usize) {
    use Instruction::*;
    let instr = Instruction::from(chunk.byte(offset));
    let mut buffer = format!("{:0>5} {:20}", offset, format!("{:?}", instr));
    match instr {
        CONSTANT | GLOBAL | SET_GLOBAL | GET_GLOBAL | CLASS | METHOD | GET_FIELD | SET_FIELD
        | GET_SUPER => {
            let idx = chunk.byte(offset + 1) as usize;
            buffer += &format!(" {} ({})\n", idx, heap.value_to_string(constants[idx]));
            (buffer, 2)
        }
        SET_LOCAL | GET_LOCAL | SET_UPVALUE | GET_UPVALUE | CALL => {
            buffer += &format!(" {}\n", chunk.byte(offset + 1));
            (buffer, 2)
        }
        JMP | JMP_ON_FALSE => {
            let jump = chunk.read_u16(offset + 1) as usize;
            buffer += &format!(" {} (to {})\n", jump, offset + 3 + jump);
            (buffer, 3)
        }
        JMP_BACK => {
            let jump = chunk.read_u16(offset + 1) as usize;
            buffer += &format!(" {} (to {})\n", jump, offset + 3 - jump);
            (buffer, 3)
        }
        CLOSURE => {
            let idx = chunk.byte(offset + 1) as usize;
            let proto = constants[idx];
            buffer += &format!(" {} ({})\n", idx, heap.value_to_string(proto));
            let count = match proto {
                Value::Object(r) => heap.fun(r).upvalue_count,
                _ => 0,
            };
            for i in 0..count {
                let up_idx = chunk.byte(offset + 2 + i * 2);
                let is_local = chunk.byte(offset + 3 + i * 2) != 0;
                buffer += &format!(
                    "|     {}: {} {}\n",
                    i,
                    if is_local { "local" } else { "upvalue" },
                    up_idx,
                );
            }
            (buffer, 2 + count * 2)
        }
        INVOKE => {
            let argc = chunk.byte(offset + 1);
            let idx = chunk.byte(offset + 2) as usize;
            buffer += &format!(
                " ({} args) {} ({})\n",
                argc,
                idx,
                heap.value_to_string(constants[idx])
            );
            (buffer, 3)
        }
        _ => {
            buffer += "\n";
            (buffer, 1)
        }
    }
}
