//! Final NASM text emission.

use std::collections::HashSet;
use std::io::Write;

use ternc_ir::{Datum, Frag, LabelRef};

use crate::error::BackendError;
use crate::x86_64::asm::{AsmFile, AsmFrag, AsmInstrKind, AsmInstruction, AsmOperand};

/// Renders a local label: block labels print `L%zu`, local data frags
/// (string pools, jump tables, float constants) print `.LC%zu`.
fn local_label(id: usize, local_data_ids: &HashSet<usize>) -> String {
    if local_data_ids.contains(&id) {
        format!(".LC{id}")
    } else {
        format!("L{id}")
    }
}

/// Renders a data-like fragment to its final section text.
pub fn render_data_frag(frag: &Frag, local_data_ids: &HashSet<usize>) -> String {
    let (section, name, align, data) = match frag {
        Frag::Bss { name, align, data } => ("bss", name, align, data),
        Frag::RoData { name, align, data } => ("rodata", name, align, data),
        Frag::Data { name, align, data } => ("data", name, align, data),
        Frag::Text { .. } => unreachable!("text frags render through the instruction path"),
    };

    let mut out = format!("section .{section} align={align}\n");
    match name {
        LabelRef::Global(name) => {
            out.push_str(&format!("global {name}:data ({name}.end - {name})\n{name}:\n"));
        }
        LabelRef::Local(id) => {
            out.push_str(&format!("{}:\n", local_label(*id, local_data_ids)));
        }
    }
    for datum in data {
        match datum {
            Datum::Byte(v) => out.push_str(&format!("\tdb {v}\n")),
            Datum::Short(v) => out.push_str(&format!("\tdw {v}\n")),
            Datum::Int(v) => out.push_str(&format!("\tdd {v}\n")),
            Datum::Long(v) => out.push_str(&format!("\tdq {v}\n")),
            Datum::Padding(n) => out.push_str(&format!("\tresb {n}\n")),
            Datum::String(bytes) => {
                for b in bytes {
                    out.push_str(&format!("\tdb {b}\n"));
                }
                out.push_str("\tdb 0\n");
            }
            Datum::WString(chars) => {
                for c in chars {
                    out.push_str(&format!("\tdd {c}\n"));
                }
                out.push_str("\tdd 0\n");
            }
            Datum::Local(id) => {
                out.push_str(&format!("\tdq {}\n", local_label(*id, local_data_ids)));
            }
            Datum::Global(name) => out.push_str(&format!("\tdq {name}\n")),
        }
    }
    if let LabelRef::Global(name) = name {
        out.push_str(&format!("{name}.end:\n"));
    }
    out
}

fn size_keyword(size: u64) -> &'static str {
    match size {
        1 => "byte",
        2 => "word",
        4 => "dword",
        8 => "qword",
        16 => "oword",
        _ => unreachable!("invalid memory access size {size}"),
    }
}

fn render_operand(operand: &AsmOperand, local_data_ids: &HashSet<usize>) -> String {
    match operand {
        AsmOperand::Reg { reg, size } => reg.name(*size).to_string(),
        AsmOperand::Imm { value, .. } => (*value as i64).to_string(),
        AsmOperand::LocalLabel(id) => local_label(*id, local_data_ids),
        AsmOperand::GlobalLabel(name) => name.clone(),
        AsmOperand::Memory {
            base,
            index,
            disp,
            size,
        } => {
            let mut address = render_operand(base, local_data_ids);
            if let Some((index, scale)) = index {
                address.push_str(" + ");
                address.push_str(&render_operand(index, local_data_ids));
                if *scale != 1 {
                    address.push_str(&format!("*{scale}"));
                }
            }
            if *disp > 0 {
                address.push_str(&format!(" + {disp}"));
            } else if *disp < 0 {
                address.push_str(&format!(" - {}", -disp));
            }
            format!("{} [{}]", size_keyword(*size), address)
        }
        AsmOperand::Temp { id, .. } => {
            unreachable!("temp {id} survived register allocation")
        }
    }
}

/// Resolves a skeleton's `%d`/`%u` placeholders against the printable
/// operand list, left to right.
fn render_instruction(inst: &AsmInstruction, local_data_ids: &HashSet<usize>) -> String {
    if let AsmInstrKind::Label { id } = &inst.kind {
        return format!("L{id}:\n");
    }
    let mut out = String::with_capacity(inst.skeleton.len());
    let mut operands = inst.operands.iter();
    let mut chars = inst.skeleton.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('d') | Some('u') => {
                let operand = operands
                    .next()
                    .expect("skeleton names more operands than it has");
                out.push_str(&render_operand(operand, local_data_ids));
            }
            Some('%') => out.push('%'),
            _ => unreachable!("invalid skeleton placeholder"),
        }
    }
    out
}

/// Writes a file's assembly to the sink: every fragment in order, then the
/// GNU stack note.
pub fn emit(asm: &AsmFile, out: &mut dyn Write) -> Result<(), BackendError> {
    for frag in &asm.frags {
        match frag {
            AsmFrag::Data(text) => out.write_all(text.as_bytes())?,
            AsmFrag::Text {
                header,
                footer,
                instructions,
                ..
            } => {
                out.write_all(header.as_bytes())?;
                for inst in instructions {
                    out.write_all(render_instruction(inst, &asm.local_data_ids).as_bytes())?;
                }
                out.write_all(footer.as_bytes())?;
            }
        }
    }
    out.write_all(b"section .note.GNU-stack noalloc noexec nowrite progbits\n")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x86_64::asm::Register;

    #[test]
    fn memory_operands_carry_size_keywords() {
        let ids = HashSet::new();
        let op = AsmOperand::Memory {
            base: Box::new(AsmOperand::reg(Register::Rbp, 8)),
            index: None,
            disp: -24,
            size: 4,
        };
        assert_eq!(render_operand(&op, &ids), "dword [rbp - 24]");
    }

    #[test]
    fn scaled_index_renders_nasm_style() {
        let ids = HashSet::from([5]);
        let op = AsmOperand::Memory {
            base: Box::new(AsmOperand::LocalLabel(5)),
            index: Some((Box::new(AsmOperand::reg(Register::Rax, 8)), 8)),
            disp: 0,
            size: 8,
        };
        assert_eq!(render_operand(&op, &ids), "qword [.LC5 + rax*8]");
    }

    #[test]
    fn skeletons_resolve_placeholders_in_order() {
        let ids = HashSet::new();
        let inst = AsmInstruction::regular("\tmov %d, %u\n")
            .operand(AsmOperand::reg(Register::Rax, 8))
            .operand(AsmOperand::Imm { value: 42, size: 8 });
        assert_eq!(render_instruction(&inst, &ids), "\tmov rax, 42\n");
    }

    #[test]
    fn bss_frags_reserve_bytes() {
        let ids = HashSet::new();
        let frag = Frag::Bss {
            name: LabelRef::Global("_T1a1x".into()),
            align: 4,
            data: vec![Datum::Padding(4)],
        };
        let text = render_data_frag(&frag, &ids);
        assert!(text.starts_with("section .bss align=4\n"));
        assert!(text.contains("global _T1a1x:data (_T1a1x.end - _T1a1x)\n"));
        assert!(text.contains("\tresb 4\n"));
        assert!(text.ends_with("_T1a1x.end:\n"));
    }

    #[test]
    fn string_pools_emit_nul_terminated_bytes() {
        let ids = HashSet::from([3]);
        let frag = Frag::RoData {
            name: LabelRef::Local(3),
            align: 1,
            data: vec![Datum::String(b"hi".to_vec())],
        };
        let text = render_data_frag(&frag, &ids);
        assert!(text.contains(".LC3:\n"));
        assert!(text.contains("\tdb 104\n\tdb 105\n\tdb 0\n"));
    }
}
