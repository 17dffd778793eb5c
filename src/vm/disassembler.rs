//! Bytecode disassembler for debug output.

use super::chunk::{Chunk, Constant, FunctionProto};
use super::opcode::Op;

/// Disassemble a function prototype to a human-readable string.
pub fn disassemble(proto: &FunctionProto) -> String {
    let mut out = String::new();
    let name = proto.name.as_deref().unwrap_or("<script>");
    out.push_str(&format!(
        "== {} (params={}{}, locals={}, captures={}) ==\n",
        name,
        proto.num_params,
        if proto.variadic { "+" } else { "" },
        proto.num_locals,
        proto.captures.len()
    ));
    disassemble_chunk(&proto.chunk, &mut out);

    // Nested functions follow their owner.
    for constant in &proto.chunk.constants {
        if let Constant::Function(nested) = constant {
            out.push('\n');
            out.push_str(&disassemble(nested));
        }
    }
    out
}

fn disassemble_chunk(chunk: &Chunk, out: &mut String) {
    for (offset, op) in chunk.code.iter().enumerate() {
        let line = chunk.span_at(offset).line;
        let line_str = if offset > 0 && chunk.span_at(offset - 1).line == line {
            "   |".to_string()
        } else {
            format!("{:4}", line)
        };
        out.push_str(&format!("{:04} {} ", offset, line_str));
        disassemble_op(op, offset, chunk, out);
        out.push('\n');
    }
}

fn disassemble_op(op: &Op, offset: usize, chunk: &Chunk, out: &mut String) {
    match op {
        Op::Constant(idx) => {
            let constant = chunk.constants.get(*idx as usize);
            out.push_str(&format!("CONSTANT   {:>5} ({})", idx, format_constant(constant)));
        }
        Op::True => out.push_str("TRUE"),
        Op::False => out.push_str("FALSE"),
        Op::Undefined => out.push_str("UNDEFINED"),
        Op::Pop => out.push_str("POP"),
        Op::GetLocal(slot) => out.push_str(&format!("GET_LOCAL  {:>5}", slot)),
        Op::SetLocal(slot) => out.push_str(&format!("SET_LOCAL  {:>5}", slot)),
        Op::GetGlobal(slot) => out.push_str(&format!("GET_GLOBAL {:>5}", slot)),
        Op::SetGlobal(slot) => out.push_str(&format!("SET_GLOBAL {:>5}", slot)),
        Op::GetBuiltin(idx) => out.push_str(&format!("GET_BUILTIN{:>5}", idx)),
        Op::GetFree(idx) => out.push_str(&format!("GET_FREE   {:>5}", idx)),
        Op::SetFree(idx) => out.push_str(&format!("SET_FREE   {:>5}", idx)),
        Op::CloseCell => out.push_str("CLOSE_CELL"),
        Op::Add => out.push_str("ADD"),
        Op::Subtract => out.push_str("SUBTRACT"),
        Op::Multiply => out.push_str("MULTIPLY"),
        Op::Divide => out.push_str("DIVIDE"),
        Op::Remainder => out.push_str("REMAINDER"),
        Op::Negate => out.push_str("NEGATE"),
        Op::Equal => out.push_str("EQUAL"),
        Op::NotEqual => out.push_str("NOT_EQUAL"),
        Op::Less => out.push_str("LESS"),
        Op::LessEqual => out.push_str("LESS_EQUAL"),
        Op::Greater => out.push_str("GREATER"),
        Op::GreaterEqual => out.push_str("GREATER_EQUAL"),
        Op::Not => out.push_str("NOT"),
        Op::Jump(delta) => {
            out.push_str(&format!("JUMP       {:>5} -> {}", delta, offset + 1 + *delta as usize));
        }
        Op::JumpIfFalse(delta) => {
            out.push_str(&format!(
                "JUMP_IF_FALSE {:>2} -> {}",
                delta,
                offset + 1 + *delta as usize
            ));
        }
        Op::JumpIfFalseNoPop(delta) => {
            out.push_str(&format!(
                "JUMP_IF_FALSE_NP {} -> {}",
                delta,
                offset + 1 + *delta as usize
            ));
        }
        Op::JumpIfTrueNoPop(delta) => {
            out.push_str(&format!(
                "JUMP_IF_TRUE_NP {} -> {}",
                delta,
                offset + 1 + *delta as usize
            ));
        }
        Op::Loop(delta) => {
            out.push_str(&format!("LOOP       {:>5} -> {}", delta, offset + 1 - *delta as usize));
        }
        Op::MakeArray(count) => out.push_str(&format!("MAKE_ARRAY {:>5}", count)),
        Op::MakeMap(count) => out.push_str(&format!("MAKE_MAP   {:>5}", count)),
        Op::MakeClosure(idx) => {
            let constant = chunk.constants.get(*idx as usize);
            out.push_str(&format!(
                "MAKE_CLOSURE {:>3} ({})",
                idx,
                format_constant(constant)
            ));
        }
        Op::GetIndex => out.push_str("GET_INDEX"),
        Op::SetIndex => out.push_str("SET_INDEX"),
        Op::Slice => out.push_str("SLICE"),
        Op::IterInit => out.push_str("ITER_INIT"),
        Op::IterNext(delta) => {
            out.push_str(&format!(
                "ITER_NEXT  {:>5} -> {}",
                delta,
                offset + 1 + *delta as usize
            ));
        }
        Op::IterPop => out.push_str("ITER_POP"),
        Op::Call(argc, spread) => {
            out.push_str(&format!(
                "CALL       {:>5}{}",
                argc,
                if *spread { " (spread)" } else { "" }
            ));
        }
        Op::Return => out.push_str("RETURN"),
        Op::Import(idx) => {
            let constant = chunk.constants.get(*idx as usize);
            out.push_str(&format!("IMPORT     {:>5} ({})", idx, format_constant(constant)));
        }
    }
}

fn format_constant(constant: Option<&Constant>) -> String {
    match constant {
        Some(Constant::Int(n)) => n.to_string(),
        Some(Constant::Float(n)) => n.to_string(),
        Some(Constant::Char(c)) => format!("{:?}", c),
        Some(Constant::Str(s)) => format!("{:?}", s),
        Some(Constant::Function(proto)) => match &proto.name {
            Some(name) => format!("<fn {}>", name),
            None => "<fn>".to_string(),
        },
        Some(Constant::Module(value)) => format!("<module {}>", value.type_name()),
        None => "??".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::Span;

    #[test]
    fn test_disassemble_smoke() {
        let mut proto = FunctionProto::new(Some("demo".to_string()));
        let idx = proto.chunk.add_constant(Constant::Int(7));
        proto.chunk.emit(Op::Constant(idx), Span::new(0, 1, 1, 1));
        proto.chunk.emit(Op::Return, Span::new(0, 1, 1, 1));
        let text = disassemble(&proto);
        assert!(text.contains("== demo"));
        assert!(text.contains("CONSTANT"));
        assert!(text.contains("(7)"));
        assert!(text.contains("RETURN"));
    }
}
