/// Debug output for the configuration-gated phase dumps: token stream, AST,
/// symbol tables, and chunk disassembly.

use crate::ast::{Ast, AstId};
use crate::chunk::{Chunk, OpCode};
use crate::heap::Heap;
use crate::lexer::Token;
use crate::object::ObjData;
use crate::symtab::SymbolTables;
use crate::value::Value;

pub fn print_tokens(tokens: &[Token]) {
    println!("=== tokens ===");
    let mut line = 0;
    for token in tokens {
        if token.line != line {
            print!("{:4} ", token.line);
            line = token.line;
        } else {
            print!("   | ");
        }
        println!("{:?} '{}'", token.kind, token.lexeme);
    }
}

pub fn print_ast(ast: &Ast) {
    println!("=== ast ===");
    print_node(ast, ast.root, 0);
}

fn print_node(ast: &Ast, id: AstId, indent: usize) {
    let node = ast.node(id);
    let lexeme = if node.token.lexeme.is_empty() {
        String::new()
    } else {
        format!(" '{}'", node.token.lexeme)
    };
    println!("{}{:?}{}", "  ".repeat(indent), node.kind, lexeme);
    for &child in &node.children {
        print_node(ast, child, indent + 1);
    }
}

pub fn print_symtabs(tables: &SymbolTables) {
    println!("=== symbol tables ===");
    for table in &tables.tables {
        println!(
            "table {} parent={:?} scope={:?} depth={}",
            table.id, table.parent, table.scope, table.depth
        );
        for (name, entry) in &table.entries {
            println!(
                "  {:<16} {:?} {:?} index={} mutable={}",
                name, entry.category, entry.state, entry.index, entry.is_mutable
            );
        }
    }
}

/// Prints every instruction of a chunk with its operands resolved.
pub fn disassemble_chunk(chunk: &Chunk, name: &str, heap: &Heap) {
    println!("== {} ==", name);
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(chunk, offset, heap);
    }
}

fn value_brief(value: Value, heap: &Heap) -> String {
    match value {
        Value::Obj(id) => match heap.data(id) {
            ObjData::Str(s) => format!("\"{}\"", s.chars),
            ObjData::Function(f) => {
                let name = f
                    .name
                    .map(|n| heap.str(n).to_string())
                    .unwrap_or_else(|| "script".to_string());
                format!("<fn {}>", name)
            }
            other => format!("<{}>", other.kind_name()),
        },
        other => other.to_string(),
    }
}

pub fn disassemble_instruction(chunk: &Chunk, offset: usize, heap: &Heap) -> usize {
    print!("{:04} ", offset);
    if offset > 0 && chunk.line_at(offset) == chunk.line_at(offset - 1) {
        print!("   | ");
    } else {
        print!("{:4} ", chunk.line_at(offset));
    }

    let op = OpCode::from_byte(chunk.code[offset]);
    match op {
        OpCode::Constant => {
            let index = chunk.code[offset + 1] as usize;
            println!(
                "{:<22} {:3} {}",
                op.name(),
                index,
                value_brief(chunk.constants[index], heap)
            );
            offset + 2
        }
        OpCode::GetGlobal
        | OpCode::SetGlobal
        | OpCode::DefineGlobalVal
        | OpCode::DefineGlobalVar
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::GetPropertyOptional
        | OpCode::GetSuper
        | OpCode::Class
        | OpCode::Trait
        | OpCode::InstanceMethod
        | OpCode::ClassMethod
        | OpCode::Namespace
        | OpCode::UsingNamespace => {
            let index = chunk.code[offset + 1] as usize;
            println!(
                "{:<22} {:3} {}",
                op.name(),
                index,
                value_brief(chunk.identifiers[index], heap)
            );
            offset + 2
        }
        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call
        | OpCode::OptionalCall
        | OpCode::Array
        | OpCode::Dictionary
        | OpCode::Anonymous
        | OpCode::Implement
        | OpCode::DeclareNamespace
        | OpCode::GetNamespace
        | OpCode::ReturnNonlocal => {
            println!("{:<22} {:3}", op.name(), chunk.code[offset + 1]);
            offset + 2
        }
        OpCode::Invoke | OpCode::SuperInvoke | OpCode::OptionalInvoke => {
            let index = chunk.code[offset + 1] as usize;
            let argc = chunk.code[offset + 2];
            println!(
                "{:<22} {:3} ({} args) {}",
                op.name(),
                index,
                argc,
                value_brief(chunk.identifiers[index], heap)
            );
            offset + 3
        }
        OpCode::Jump | OpCode::JumpIfFalse | OpCode::JumpIfEmpty | OpCode::End => {
            let jump = chunk.read_u16(offset + 1) as usize;
            println!("{:<22} {} -> {}", op.name(), offset, offset + 3 + jump);
            offset + 3
        }
        OpCode::Loop => {
            let jump = chunk.read_u16(offset + 1) as usize;
            println!("{:<22} {} -> {}", op.name(), offset, offset + 3 - jump);
            offset + 3
        }
        OpCode::Try => {
            let ident = chunk.code[offset + 1] as usize;
            let handler = chunk.read_u16(offset + 2);
            let finally = chunk.read_u16(offset + 4);
            println!(
                "{:<22} {} handler={} finally={}",
                op.name(),
                value_brief(chunk.identifiers[ident], heap),
                handler,
                finally
            );
            offset + 6
        }
        OpCode::Closure => {
            let index = chunk.code[offset + 1] as usize;
            let function = chunk.identifiers[index];
            println!(
                "{:<22} {:3} {}",
                op.name(),
                index,
                value_brief(function, heap)
            );
            let upvalues = match function {
                Value::Obj(id) => match heap.data(id) {
                    ObjData::Function(f) => f.upvalue_count,
                    _ => 0,
                },
                _ => 0,
            };
            let mut at = offset + 2;
            for _ in 0..upvalues {
                let is_local = chunk.code[at];
                let slot = chunk.code[at + 1];
                println!(
                    "{:04}    |                        {} {}",
                    at,
                    if is_local == 1 { "local" } else { "upvalue" },
                    slot
                );
                at += 2;
            }
            at
        }
        _ => {
            println!("{}", op.name());
            offset + 1
        }
    }
}
