use serde::{Deserialize, Serialize};

use crate::bytecode::codec;
use crate::bytecode::irep::{CatchKind, pool_tag};
use crate::bytecode::op::Op;

// =============================================================================
// BLOCKDEF - portable program description
// =============================================================================
//
// The front-end compiler (an external collaborator) hands programs over in
// this form, typically postcard-encoded; tests assemble them by hand. The
// encoder below turns a definition tree into the fixed-width device image
// the loader consumes.

/// A literal destined for a block's constant pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PoolValue {
    Int(i32),
    Float(f64),
    Str(String),
}

/// Exception-handler descriptor over encoded instruction addresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerDef {
    pub kind: CatchKind,
    pub begin: u32,
    pub end: u32,
    pub target: u32,
}

/// Description of one code block and its nested children.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDef {
    pub nlocals: u16,
    pub nregs: u16,
    pub code: Vec<Op>,
    pub handlers: Vec<HandlerDef>,
    pub pool: Vec<PoolValue>,
    pub syms: Vec<String>,
    pub children: Vec<BlockDef>,
}

impl BlockDef {
    pub fn new(nregs: u16) -> Self {
        BlockDef {
            nlocals: 0,
            nregs,
            code: Vec::new(),
            handlers: Vec::new(),
            pool: Vec::new(),
            syms: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Byte address of instruction `index` in the encoded stream.
    ///
    /// Op sizes do not depend on operand values, so jump and handler
    /// targets can be computed before the targets are filled in.
    pub fn addr_of(&self, index: usize) -> u16 {
        self.code[..index].iter().map(|op| op.size() as u16).sum()
    }

    /// Byte length of the encoded instruction stream.
    pub fn end_addr(&self) -> u16 {
        self.addr_of(self.code.len())
    }
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    let mut buf = [0u8; 2];
    codec::write_u16(v, &mut buf);
    out.extend_from_slice(&buf);
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    let mut buf = [0u8; 4];
    codec::write_u32(v, &mut buf);
    out.extend_from_slice(&buf);
}

/// Encode a definition tree into a binary image.
pub fn encode_image(def: &BlockDef) -> Vec<u8> {
    let mut out = Vec::new();
    encode_block(def, &mut out);
    out
}

fn encode_block(def: &BlockDef, out: &mut Vec<u8>) {
    let mut iseq = Vec::new();
    for op in &def.code {
        op.encode_into(&mut iseq);
    }

    let mut pool_data = Vec::new();
    let mut pool_offsets = Vec::with_capacity(def.pool.len());
    for value in &def.pool {
        pool_offsets.push(pool_data.len() as u16);
        match value {
            PoolValue::Int(v) => {
                pool_data.push(pool_tag::INT);
                put_u32(&mut pool_data, *v as u32);
            }
            PoolValue::Float(v) => {
                pool_data.push(pool_tag::FLOAT);
                let bits = v.to_bits();
                put_u32(&mut pool_data, (bits >> 32) as u32);
                put_u32(&mut pool_data, bits as u32);
            }
            PoolValue::Str(s) => {
                pool_data.push(pool_tag::STR);
                put_u16(&mut pool_data, s.len() as u16);
                pool_data.extend_from_slice(s.as_bytes());
            }
        }
    }

    // header
    put_u16(out, def.nlocals);
    put_u16(out, def.nregs);
    put_u16(out, def.children.len() as u16);
    put_u16(out, def.handlers.len() as u16);
    put_u16(out, iseq.len() as u16);
    put_u16(out, def.pool.len() as u16);
    put_u16(out, def.syms.len() as u16);
    put_u16(out, pool_data.len() as u16);

    out.extend_from_slice(&iseq);

    for h in &def.handlers {
        out.push(h.kind.to_byte());
        put_u32(out, h.begin);
        put_u32(out, h.end);
        put_u32(out, h.target);
    }

    for off in &pool_offsets {
        put_u16(out, *off);
    }
    out.extend_from_slice(&pool_data);

    for name in &def.syms {
        put_u16(out, name.len() as u16);
        out.extend_from_slice(name.as_bytes());
    }

    for child in &def.children {
        encode_block(child, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_of_accumulates_op_sizes() {
        let mut def = BlockDef::new(4);
        def.code = vec![
            Op::LoadInt { a: 0, v: 1 },      // 3 bytes at 0
            Op::Send { a: 0, sym: 0, n: 0 }, // 5 bytes at 3
            Op::Stop,                        // 1 byte at 8
        ];
        assert_eq!(def.addr_of(0), 0);
        assert_eq!(def.addr_of(1), 3);
        assert_eq!(def.addr_of(2), 8);
        assert_eq!(def.end_addr(), 9);
    }

    #[test]
    fn header_fields_are_wire_encoded() {
        let mut def = BlockDef::new(3);
        def.nlocals = 1;
        def.code = vec![Op::Stop];
        let image = encode_image(&def);

        assert_eq!(codec::read_u16(&image[0..]), 1); // nlocals
        assert_eq!(codec::read_u16(&image[2..]), 3); // nregs
        assert_eq!(codec::read_u16(&image[8..]), 1); // ilen
        assert_eq!(image[16], 0x33); // Stop opcode
        assert_eq!(image.len(), 17);
    }

    #[test]
    fn children_follow_parent() {
        let mut def = BlockDef::new(2);
        def.code = vec![Op::Stop];
        let mut child = BlockDef::new(1);
        child.code = vec![Op::Return { a: 0 }];
        def.children.push(child);

        let image = encode_image(&def);
        // parent: 16-byte header + 1-byte iseq, child header starts at 17
        assert_eq!(codec::read_u16(&image[17 + 2..]), 1); // child nregs
    }

    #[test]
    fn postcard_round_trip() {
        let mut def = BlockDef::new(5);
        def.code = vec![Op::LoadPool { a: 0, idx: 0 }, Op::Stop];
        def.pool = vec![PoolValue::Str("hello".to_string())];
        def.syms = vec!["greet".to_string()];

        let bytes = postcard::to_allocvec(&def).unwrap();
        let back: BlockDef = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back.nregs, 5);
        assert_eq!(back.code, def.code);
        assert_eq!(back.pool, def.pool);
        assert_eq!(back.syms, def.syms);
    }
}
