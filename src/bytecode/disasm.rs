use std::fmt::Write;

use crate::bytecode::iseq::{InstructionSequence, Word, call_flag};

/// Print disassembly of a compiled scope and all of its children
pub fn print_iseq(iseq: &InstructionSequence) {
    println!("=== INSTRUCTION SEQUENCE ===\n");
    print!("{}", disassemble_to_string(iseq));
}

/// Return disassembly as a String
pub fn disassemble_to_string(iseq: &InstructionSequence) -> String {
    let mut out = String::new();
    write_scope(&mut out, iseq, 0);
    out
}

fn write_scope(out: &mut String, iseq: &InstructionSequence, indent: usize) {
    let prefix = "  ".repeat(indent);

    let _ = writeln!(out, "{}════════════════════════════════════════", prefix);
    let _ = writeln!(
        out,
        "{} {} ({}) {}:{}",
        prefix,
        iseq.name,
        iseq.kind.name(),
        iseq.path,
        iseq.first_line
    );
    let _ = writeln!(
        out,
        "{} {} words, stack_max {}, locals [{}]",
        prefix,
        iseq.code().len(),
        iseq.stack_max,
        iseq.local_table.join(", ")
    );
    if iseq.params.lead_num > 0 || iseq.params.opt_num > 0 || iseq.params.flags.has_rest {
        let _ = writeln!(
            out,
            "{} params: lead {}, opt {}, size {}{}",
            prefix,
            iseq.params.lead_num,
            iseq.params.opt_num,
            iseq.params.size,
            if iseq.params.flags.has_rest { ", rest" } else { "" }
        );
    }
    let _ = writeln!(out, "{}════════════════════════════════════════", prefix);

    if !iseq.catch_table.is_empty() {
        let _ = writeln!(out, "{} catch table:", prefix);
        for entry in &iseq.catch_table {
            let child = entry
                .child
                .and_then(|c| iseq.children.get(c as usize))
                .map(|c| format!(" ({})", c.name))
                .unwrap_or_default();
            let _ = writeln!(
                out,
                "{}   {:<7} {:04}..{:04} → {:04} sp {}{}",
                prefix,
                entry.kind.name(),
                entry.start,
                entry.end,
                entry.cont,
                entry.sp,
                child
            );
        }
    }

    disassemble_code(out, iseq, indent);
    let _ = writeln!(out);

    for child in &iseq.children {
        write_scope(out, child, indent + 1);
    }
}

/// Disassemble the code words of one scope with indentation support
fn disassemble_code(out: &mut String, iseq: &InstructionSequence, indent: usize) {
    let jump_targets = collect_jump_targets(iseq);
    let prefix = "  ".repeat(indent);

    for pc in iseq.instruction_boundaries() {
        let Word::Op(op) = iseq.code()[pc] else { continue };

        if jump_targets.contains(&pc) {
            let _ = writeln!(out, "{}      ┌──────────────────────────────────", prefix);
        }

        let _ = write!(out, "{}{:04} ", prefix, pc);
        let _ = write!(out, "{}", if jump_targets.contains(&pc) { "► " } else { "  " });

        let end = pc + op.len();
        let operands: Vec<String> = iseq.code()[pc + 1..end.min(iseq.code().len())]
            .iter()
            .map(|w| format_operand(iseq, *w, end))
            .collect();
        let mut line = format!("{:<26}{}", op.name(), operands.join(", "));

        if let Some(entry) = iseq.line_table.iter().find(|e| e.position as usize == pc) {
            line = format!("{:<60} ({:>4})", line, entry.line);
        }
        if let Some(sc) = iseq.stack_cache.iter().find(|e| e.position as usize == pc) {
            line = format!("{} [{}→{}]", line, sc.entry.name(), sc.exit.name());
        }
        let _ = writeln!(out, "{}", line.trim_end());
    }
}

fn collect_jump_targets(iseq: &InstructionSequence) -> Vec<usize> {
    let mut targets = Vec::new();

    for pc in iseq.instruction_boundaries() {
        let Word::Op(op) = iseq.code()[pc] else { continue };
        let end = pc + op.len();
        for word in iseq.code().get(pc + 1..end).unwrap_or_default() {
            let offsets: Vec<i32> = match word {
                Word::Offset(off) => vec![*off],
                Word::Dispatch(i) => iseq
                    .dispatch_maps
                    .get(*i as usize)
                    .map(|m| m.entries.iter().map(|(_, off)| *off).collect())
                    .unwrap_or_default(),
                _ => continue,
            };
            for off in offsets {
                let target = (end as i64 + i64::from(off)) as usize;
                if !targets.contains(&target) {
                    targets.push(target);
                }
            }
        }
    }

    targets
}

fn format_operand(iseq: &InstructionSequence, word: Word, next_pc: usize) -> String {
    match word {
        Word::Offset(off) => {
            let target = next_pc as i64 + i64::from(off);
            let direction = if off < 0 { "↑" } else { "↓" };
            format!("{:+} {} (→ {:04})", off, direction, target)
        }
        Word::Num(n) => n.to_string(),
        Word::Literal(i) => match iseq.literal(i) {
            Some(v) => v.to_string(),
            None => format!("<literal {}?>", i),
        },
        Word::Id(i) => match iseq.identifier(i) {
            Some(name) => format!(":{}", name),
            None => format!("<id {}?>", i),
        },
        Word::Global(i) => iseq
            .globals
            .get(i as usize)
            .cloned()
            .unwrap_or_else(|| format!("<global {}?>", i)),
        Word::InlineCache(i) => format!("<ic:{}>", i),
        Word::CallInfo(i) => match iseq.call_infos.get(i as usize) {
            Some(ci) => {
                let mut s = format!("<callinfo!mid:{}, argc:{}", ci.mid, ci.argc);
                if ci.flags != 0 {
                    let _ = write!(s, ", {}", call_flag::describe(ci.flags));
                }
                if !ci.kw_arg.is_empty() {
                    let _ = write!(s, ", kw:[{}]", ci.kw_arg.join(", "));
                }
                if let Some(child) = ci.block.and_then(|b| iseq.children.get(b as usize)) {
                    let _ = write!(s, ", block:{}", child.name);
                }
                s.push('>');
                s
            }
            None => format!("<callinfo {}?>", i),
        },
        Word::Dispatch(i) => match iseq.dispatch_maps.get(i as usize) {
            Some(map) => {
                let entries: Vec<String> = map
                    .entries
                    .iter()
                    .map(|(lit, off)| {
                        let key = iseq
                            .literal(*lit)
                            .map(|v| v.to_string())
                            .unwrap_or_else(|| "?".to_string());
                        format!("{} => {:04}", key, next_pc as i64 + i64::from(*off))
                    })
                    .collect();
                format!("<cdhash {{{}}}>", entries.join(", "))
            }
            None => format!("<cdhash {}?>", i),
        },
        Word::Iseq(i) => match iseq.children.get(i as usize) {
            Some(child) => format!("<iseq:{}>", child.name),
            None => format!("<iseq {}?>", i),
        },
        Word::Op(op) => format!("<op {}?>", op),
    }
}
