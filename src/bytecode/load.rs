use log::debug;

use crate::bytecode::codec;
use crate::bytecode::irep::{CatchHandler, CatchKind, Irep, IrepArena, IrepId, SymId};
use crate::bytecode::load_error::LoadError;
use crate::bytecode::verify;

// =============================================================================
// LOAD - binary image -> verified arena
// =============================================================================

/// Maximum depth of nested child blocks the loader accepts.
pub const MAX_NESTING: usize = 32;

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], LoadError> {
        if self.pos + n > self.bytes.len() {
            return Err(LoadError::truncated(
                self.pos,
                self.pos + n - self.bytes.len(),
            ));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, LoadError> {
        Ok(codec::read_u16(self.take(2)?))
    }

    fn u32(&mut self) -> Result<u32, LoadError> {
        Ok(codec::read_u32(self.take(4)?))
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }
}

/// Materialize the code-block tree at the start of `bytes`.
///
/// Rejects anything a `max_regs`-slot executor could not run: oversized
/// register windows, truncated regions, trailing garbage, and any block
/// failing structural verification. On error no arena escapes.
pub fn load_image(bytes: &[u8], max_regs: usize) -> Result<IrepArena, LoadError> {
    let mut arena = IrepArena::new();
    let mut cur = Cursor { bytes, pos: 0 };

    let root = parse_block(&mut cur, &mut arena, max_regs, 0)?;
    arena.set_root(root);

    if cur.remaining() != 0 {
        return Err(LoadError::TrailingBytes {
            remaining: cur.remaining(),
        });
    }

    for i in 0..arena.block_count() {
        verify::check_block(arena.block(IrepId(i as u32)))
            .map_err(|e| LoadError::invalid(i, e.message))?;
    }

    debug!(
        "loaded image: {} bytes, {} blocks, root {:?}",
        bytes.len(),
        arena.block_count(),
        arena.root()
    );
    Ok(arena)
}

fn parse_block(
    cur: &mut Cursor<'_>,
    arena: &mut IrepArena,
    max_regs: usize,
    depth: usize,
) -> Result<IrepId, LoadError> {
    if depth > MAX_NESTING {
        return Err(LoadError::NestingTooDeep { limit: MAX_NESTING });
    }

    let nlocals = cur.u16()?;
    let nregs = cur.u16()?;
    let rlen = cur.u16()?;
    let clen = cur.u16()?;
    let ilen = cur.u16()?;
    let plen = cur.u16()?;
    let slen = cur.u16()?;
    let pool_size = cur.u16()?;

    if nregs as usize > max_regs {
        return Err(LoadError::register_overflow(nregs, max_regs));
    }
    if nlocals as usize > max_regs {
        return Err(LoadError::register_overflow(nlocals, max_regs));
    }

    let iseq = cur.take(ilen as usize)?.to_vec();

    let mut handlers = Vec::with_capacity(clen as usize);
    for _ in 0..clen {
        let kind_byte = cur.take(1)?[0];
        let kind = CatchKind::from_byte(kind_byte).ok_or_else(|| {
            LoadError::invalid(
                arena.block_count(),
                format!("unknown catch-handler kind 0x{:02x}", kind_byte),
            )
        })?;
        handlers.push(CatchHandler {
            kind,
            begin: cur.u32()?,
            end: cur.u32()?,
            target: cur.u32()?,
        });
    }

    let mut pool_offsets = Vec::with_capacity(plen as usize);
    for _ in 0..plen {
        pool_offsets.push(cur.u16()?);
    }
    let pool = cur.take(pool_size as usize)?.to_vec();

    let mut syms: Vec<SymId> = Vec::with_capacity(slen as usize);
    for _ in 0..slen {
        let len = cur.u16()? as usize;
        let raw = cur.take(len)?;
        let name = std::str::from_utf8(raw).map_err(|_| {
            LoadError::invalid(arena.block_count(), "symbol name is not valid utf-8")
        })?;
        syms.push(arena.intern(name));
    }

    let mut children = Vec::with_capacity(rlen as usize);
    for _ in 0..rlen {
        children.push(parse_block(cur, arena, max_regs, depth + 1)?);
    }

    Ok(arena.push_block(Irep {
        nlocals,
        nregs,
        iseq,
        handlers,
        pool,
        pool_offsets,
        syms,
        children,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::builder::{BlockDef, HandlerDef, PoolValue, encode_image};
    use crate::bytecode::op::Op;

    fn simple_def() -> BlockDef {
        let mut def = BlockDef::new(4);
        def.nlocals = 1;
        def.code = vec![
            Op::LoadPool { a: 0, idx: 0 },
            Op::LoadSym { a: 1, idx: 0 },
            Op::Stop,
        ];
        def.pool = vec![PoolValue::Int(42)];
        def.syms = vec!["answer".to_string()];
        def
    }

    #[test]
    fn loads_a_single_block() {
        let image = encode_image(&simple_def());
        let arena = load_image(&image, 16).unwrap();
        let root = arena.block(arena.root());
        assert_eq!(root.nregs, 4);
        assert_eq!(root.nlocals, 1);
        assert_eq!(root.pool_offsets.len(), 1);
        assert_eq!(arena.sym_name(root.syms[0]), "answer");
    }

    #[test]
    fn loads_nested_children_in_order() {
        let mut def = simple_def();
        let mut child_a = BlockDef::new(2);
        child_a.code = vec![Op::Return { a: 0 }];
        let mut grandchild = BlockDef::new(1);
        grandchild.code = vec![Op::Return { a: 0 }];
        child_a.children.push(grandchild);
        let mut child_b = BlockDef::new(3);
        child_b.code = vec![Op::Return { a: 0 }];
        def.children = vec![child_a, child_b];

        let image = encode_image(&def);
        let arena = load_image(&image, 16).unwrap();
        assert_eq!(arena.block_count(), 4);
        let root = arena.block(arena.root());
        assert_eq!(root.children.len(), 2);
        assert_eq!(arena.block(root.children[0]).nregs, 2);
        assert_eq!(arena.block(root.children[0]).children.len(), 1);
        assert_eq!(arena.block(root.children[1]).nregs, 3);
    }

    #[test]
    fn preserves_handler_declaration_order() {
        let mut def = BlockDef::new(2);
        def.code = vec![
            Op::LoadNil { a: 0 },
            Op::LoadNil { a: 1 },
            Op::Nop,
            Op::Stop,
        ];
        let mid = def.addr_of(2) as u32;
        let end = def.addr_of(3) as u32;
        // Wider range declared first; order must survive the round trip.
        def.handlers = vec![
            HandlerDef {
                kind: CatchKind::Ensure,
                begin: 0,
                end,
                target: mid,
            },
            HandlerDef {
                kind: CatchKind::Rescue,
                begin: 0,
                end: mid,
                target: mid,
            },
        ];

        let image = encode_image(&def);
        let arena = load_image(&image, 16).unwrap();
        let root = arena.block(arena.root());
        assert_eq!(root.handlers[0].kind, CatchKind::Ensure);
        assert_eq!(root.handlers[1].kind, CatchKind::Rescue);
        assert_eq!(root.handlers[0].end, end);
    }

    #[test]
    fn rejects_oversized_register_window() {
        let mut def = simple_def();
        def.nregs = 200;
        let image = encode_image(&def);
        let err = load_image(&image, 110).unwrap_err();
        assert_eq!(
            err,
            LoadError::RegisterOverflow {
                requested: 200,
                max: 110
            }
        );
    }

    #[test]
    fn rejects_truncated_image() {
        let image = encode_image(&simple_def());
        let err = load_image(&image[..image.len() - 3], 16).unwrap_err();
        assert!(matches!(err, LoadError::Truncated { .. }));
    }

    #[test]
    fn rejects_trailing_garbage() {
        let mut image = encode_image(&simple_def());
        image.extend_from_slice(&[0xaa, 0xbb]);
        let err = load_image(&image, 16).unwrap_err();
        assert_eq!(err, LoadError::TrailingBytes { remaining: 2 });
    }

    #[test]
    fn rejects_invalid_bytecode_via_verification() {
        let mut def = simple_def();
        def.code = vec![Op::Jump { to: 1 }, Op::Stop]; // into operand bytes
        let image = encode_image(&def);
        let err = load_image(&image, 16).unwrap_err();
        assert!(matches!(err, LoadError::Invalid { .. }));
    }

    #[test]
    fn rejects_bad_catch_kind_byte() {
        let mut def = simple_def();
        def.handlers = vec![HandlerDef {
            kind: CatchKind::Rescue,
            begin: 0,
            end: 1,
            target: 0,
        }];
        let mut image = encode_image(&def);
        // The kind byte sits right after the 16-byte header + iseq.
        let kind_at = 16 + def.end_addr() as usize;
        image[kind_at] = 9;
        let err = load_image(&image, 16).unwrap_err();
        assert!(matches!(err, LoadError::Invalid { .. }));
    }
}
