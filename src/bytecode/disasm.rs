use std::collections::HashMap;
use std::fmt;

use crate::bytecode::ir::Bytecode;
use crate::bytecode::op::{Instructions, Opcode};
use crate::lang::value::Value;

/// One line per instruction: `0000 NAME [operands]`, newline-joined with no
/// trailing newline. Decoding stops at the first malformed instruction,
/// which is reported on its own line.
pub fn disassemble(instructions: &Instructions) -> String {
    let mut lines = Vec::new();

    for item in instructions.iter() {
        match item {
            Ok((offset, op, operands)) => {
                lines.push(format!("{:04} {} {}", offset, op, format_operands(&operands)));
            }
            Err(e) => lines.push(format!("ERROR: {}", e)),
        }
    }

    lines.join("\n")
}

fn format_operands(operands: &[usize]) -> String {
    let inner: Vec<String> = operands.iter().map(|o| o.to_string()).collect();
    format!("[{}]", inner.join(", "))
}

impl fmt::Display for Instructions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", disassemble(self))
    }
}

// =============================================================================
// Program listing (--bc)
// =============================================================================

/// Listing of the main stream followed by the constant pool, with every
/// compiled function disassembled under its own header.
pub fn format_bytecode(bc: &Bytecode) -> String {
    let mut out = String::new();

    push_section(&mut out, "main", &bc.instructions);

    if bc.constants.is_empty() {
        return out;
    }

    out.push_str("════════════════════════════════════════\n");
    out.push_str(&format!(" constants ({})\n", bc.constants.len()));
    out.push_str("════════════════════════════════════════\n");
    for (i, constant) in bc.constants.iter().enumerate() {
        out.push_str(&format!("[{}] {}\n", i, format_constant(constant)));
    }
    out.push('\n');

    for (i, constant) in bc.constants.iter().enumerate() {
        if let Value::CompiledFunction(function) = constant {
            let label = format!(
                "constant[{}]  params={} locals={}",
                i, function.num_parameters, function.num_locals
            );
            push_section(&mut out, &label, &function.instructions);
        }
    }

    out
}

pub fn print_bytecode(bc: &Bytecode) {
    println!("=== BYTECODE PROGRAM ===\n");
    print!("{}", format_bytecode(bc));
}

fn push_section(out: &mut String, label: &str, instructions: &Instructions) {
    out.push_str("════════════════════════════════════════\n");
    out.push_str(&format!(" {}\n", label));
    out.push_str(&format!(" {} bytes\n", instructions.len()));
    out.push_str("════════════════════════════════════════\n");
    if !instructions.is_empty() {
        out.push_str(&disassemble(instructions));
        out.push('\n');
    }
    out.push('\n');
}

fn format_constant(value: &Value) -> String {
    match value {
        Value::String(s) => format!("{:?}", s),
        other => other.to_string(),
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Opcode frequencies over the main stream and every compiled function.
pub fn opcode_counts(bc: &Bytecode) -> Vec<(Opcode, usize)> {
    let mut counts: HashMap<Opcode, usize> = HashMap::new();

    let functions = bc.constants.iter().filter_map(|c| match c {
        Value::CompiledFunction(function) => Some(&function.instructions),
        _ => None,
    });

    for instructions in std::iter::once(&bc.instructions).chain(functions) {
        for (_, op, _) in instructions.iter().flatten() {
            *counts.entry(op).or_insert(0) += 1;
        }
    }

    let mut counts: Vec<(Opcode, usize)> = counts.into_iter().collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1).then((a.0 as u8).cmp(&(b.0 as u8))));
    counts
}

pub fn print_bytecode_stats(bc: &Bytecode) {
    println!("=== BYTECODE STATISTICS ===\n");

    let functions = bc
        .constants
        .iter()
        .filter(|c| matches!(c, Value::CompiledFunction(_)))
        .count();
    let counts = opcode_counts(bc);
    let total: usize = counts.iter().map(|(_, n)| n).sum();

    println!("Constants:        {}", bc.constants.len());
    println!("Functions:        {}", functions);
    println!("Instructions:     {}", total);
    println!();

    println!("Op frequency:");
    for (op, count) in counts.iter().take(10) {
        let pct = (*count as f64 / total as f64) * 100.0;
        println!("  {:<18} {:>4} ({:>5.1}%)", op.name(), count, pct);
    }
}
