use crate::bytecode::irep::{Irep, IrepArena, IrepId};
use crate::bytecode::op::{self, Op};

/// Print a disassembly of every block in the arena.
pub fn print_arena(arena: &IrepArena) {
    for i in 0..arena.block_count() {
        let id = IrepId(i as u32);
        let label = if id == arena.root() {
            format!("block[{}] (root)", i)
        } else {
            format!("block[{}]", i)
        };
        print!("{}", format_block(arena, id, &label));
        println!();
    }
}

/// Render one block: header line, handler table, instruction listing.
pub fn format_block(arena: &IrepArena, id: IrepId, label: &str) -> String {
    let irep = arena.block(id);
    let mut out = String::new();

    out.push_str("════════════════════════════════════════\n");
    out.push_str(&format!(
        " {}  nregs={} nlocals={} pool={} syms={} children={}\n",
        label,
        irep.nregs,
        irep.nlocals,
        irep.pool_offsets.len(),
        irep.syms.len(),
        irep.children.len()
    ));
    out.push_str("════════════════════════════════════════\n");

    for (i, h) in irep.handlers.iter().enumerate() {
        out.push_str(&format!(
            " handler {}: {} [{:04}, {:04}) -> {:04}\n",
            i, h.kind, h.begin, h.end, h.target
        ));
    }

    let mut ip = 0;
    while ip < irep.iseq.len() {
        match op::decode(&irep.iseq, ip) {
            Ok((decoded, next)) => {
                out.push_str(&format!("{:04}   {}\n", ip, format_op(arena, irep, decoded)));
                ip = next;
            }
            Err(e) => {
                out.push_str(&format!("{:04}   <{}>\n", ip, e.detail));
                break;
            }
        }
    }
    out
}

fn format_op(arena: &IrepArena, irep: &Irep, decoded: Op) -> String {
    match decoded {
        Op::Send { a, sym, n } => {
            let name = irep
                .syms
                .get(sym as usize)
                .map(|s| arena.sym_name(*s))
                .unwrap_or("?");
            format!("Send      R{} :{} ({} args)", a, name, n)
        }
        Op::LoadSym { a, idx } => {
            let name = irep
                .syms
                .get(idx as usize)
                .map(|s| arena.sym_name(*s))
                .unwrap_or("?");
            format!("LoadSym   R{} :{}", a, name)
        }
        other => format!("{:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::builder::{BlockDef, encode_image};
    use crate::bytecode::load::load_image;

    #[test]
    fn listing_shows_symbol_names() {
        let mut def = BlockDef::new(3);
        def.code = vec![Op::Send { a: 0, sym: 0, n: 1 }, Op::Stop];
        def.syms = vec!["reverse".to_string()];
        let arena = load_image(&encode_image(&def), 8).unwrap();

        let text = format_block(&arena, arena.root(), "main");
        assert!(text.contains(":reverse"));
        assert!(text.contains("Stop"));
    }
}
