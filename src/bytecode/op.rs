use serde::{Deserialize, Serialize};

use crate::bytecode::codec;

// =============================================================================
// OP - instruction set
// =============================================================================
//
// One opcode byte followed by fixed-width operands: register and argument
// counts are single bytes, pool/symbol/child indices and jump targets are
// big-endian u16 read through the codec. Register operands are relative to
// the executing frame's window.

/// A decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Nop,

    /// `R(a) = R(b)`
    Move { a: u8, b: u8 },

    /// `R(a)` = constant-pool entry `idx`.
    LoadPool { a: u8, idx: u16 },

    /// `R(a)` = small integer literal.
    LoadInt { a: u8, v: i8 },

    /// `R(a)` = block-local symbol `idx`.
    LoadSym { a: u8, idx: u16 },

    LoadNil { a: u8 },
    LoadTrue { a: u8 },
    LoadFalse { a: u8 },

    /// Absolute in-block jump.
    Jump { to: u16 },

    /// Jump if `R(a)` is truthy.
    JumpIf { a: u8, to: u16 },

    /// Jump if `R(a)` is nil or false.
    JumpNot { a: u8, to: u16 },

    // arithmetic and comparison operate on adjacent registers:
    // `R(a) = R(a) <op> R(a+1)`
    Add { a: u8 },
    Sub { a: u8 },
    Mul { a: u8 },
    Eq { a: u8 },
    Lt { a: u8 },
    Gt { a: u8 },

    /// Call method `sym` on receiver `R(a)` with args `R(a+1)..=R(a+n)`.
    /// The callee's register window starts at `R(a)`.
    Send { a: u8, sym: u16, n: u8 },

    /// Invoke nested child block `child` with its window at `R(a)`.
    Exec { a: u8, child: u16 },

    /// Return `R(a)` to the caller's call-site register and pop the frame.
    /// On the outermost frame this completes the session.
    Return { a: u8 },

    /// Normal session completion.
    Stop,

    /// Raise an exception built from `R(a)`.
    Raise { a: u8 },

    /// Handler prologue: move the pending exception into `R(a)` (nil when
    /// the handler was entered on the normal path) and clear it.
    Except { a: u8 },

    /// End of an ensure body: re-raise if `R(a)` holds an exception.
    RaiseIf { a: u8 },
}

const OP_NOP: u8 = 0x00;
const OP_MOVE: u8 = 0x01;
const OP_LOADPOOL: u8 = 0x02;
const OP_LOADINT: u8 = 0x03;
const OP_LOADSYM: u8 = 0x04;
const OP_LOADNIL: u8 = 0x05;
const OP_LOADTRUE: u8 = 0x06;
const OP_LOADFALSE: u8 = 0x07;
const OP_JUMP: u8 = 0x10;
const OP_JUMPIF: u8 = 0x11;
const OP_JUMPNOT: u8 = 0x12;
const OP_ADD: u8 = 0x20;
const OP_SUB: u8 = 0x21;
const OP_MUL: u8 = 0x22;
const OP_EQ: u8 = 0x23;
const OP_LT: u8 = 0x24;
const OP_GT: u8 = 0x25;
const OP_SEND: u8 = 0x30;
const OP_EXEC: u8 = 0x31;
const OP_RETURN: u8 = 0x32;
const OP_STOP: u8 = 0x33;
const OP_RAISE: u8 = 0x40;
const OP_EXCEPT: u8 = 0x41;
const OP_RAISEIF: u8 = 0x42;

/// Instruction decode failure: an unknown opcode byte or a truncated
/// operand. Only reachable on unverified streams; the load-time verifier
/// rejects images containing either.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    pub ip: usize,
    pub detail: String,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "decode error at {:04}: {}", self.ip, self.detail)
    }
}

impl DecodeError {
    fn unknown(ip: usize, byte: u8) -> Self {
        DecodeError {
            ip,
            detail: format!("unknown opcode byte 0x{:02x}", byte),
        }
    }

    fn truncated(ip: usize) -> Self {
        DecodeError {
            ip,
            detail: "instruction truncated".to_string(),
        }
    }
}

impl Op {
    /// Encoded size in bytes.
    pub fn size(&self) -> usize {
        match self {
            Op::Nop | Op::Stop => 1,
            Op::LoadNil { .. }
            | Op::LoadTrue { .. }
            | Op::LoadFalse { .. }
            | Op::Add { .. }
            | Op::Sub { .. }
            | Op::Mul { .. }
            | Op::Eq { .. }
            | Op::Lt { .. }
            | Op::Gt { .. }
            | Op::Return { .. }
            | Op::Raise { .. }
            | Op::Except { .. }
            | Op::RaiseIf { .. } => 2,
            Op::Move { .. } | Op::LoadInt { .. } | Op::Jump { .. } => 3,
            Op::LoadPool { .. } | Op::LoadSym { .. } | Op::Exec { .. } => 4,
            Op::JumpIf { .. } | Op::JumpNot { .. } => 4,
            Op::Send { .. } => 5,
        }
    }

    /// Append the wire encoding of `self` to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        fn put_u16(out: &mut Vec<u8>, v: u16) {
            let mut buf = [0u8; 2];
            codec::write_u16(v, &mut buf);
            out.extend_from_slice(&buf);
        }

        match *self {
            Op::Nop => out.push(OP_NOP),
            Op::Move { a, b } => {
                out.push(OP_MOVE);
                out.push(a);
                out.push(b);
            }
            Op::LoadPool { a, idx } => {
                out.push(OP_LOADPOOL);
                out.push(a);
                put_u16(out, idx);
            }
            Op::LoadInt { a, v } => {
                out.push(OP_LOADINT);
                out.push(a);
                out.push(v as u8);
            }
            Op::LoadSym { a, idx } => {
                out.push(OP_LOADSYM);
                out.push(a);
                put_u16(out, idx);
            }
            Op::LoadNil { a } => {
                out.push(OP_LOADNIL);
                out.push(a);
            }
            Op::LoadTrue { a } => {
                out.push(OP_LOADTRUE);
                out.push(a);
            }
            Op::LoadFalse { a } => {
                out.push(OP_LOADFALSE);
                out.push(a);
            }
            Op::Jump { to } => {
                out.push(OP_JUMP);
                put_u16(out, to);
            }
            Op::JumpIf { a, to } => {
                out.push(OP_JUMPIF);
                out.push(a);
                put_u16(out, to);
            }
            Op::JumpNot { a, to } => {
                out.push(OP_JUMPNOT);
                out.push(a);
                put_u16(out, to);
            }
            Op::Add { a } => {
                out.push(OP_ADD);
                out.push(a);
            }
            Op::Sub { a } => {
                out.push(OP_SUB);
                out.push(a);
            }
            Op::Mul { a } => {
                out.push(OP_MUL);
                out.push(a);
            }
            Op::Eq { a } => {
                out.push(OP_EQ);
                out.push(a);
            }
            Op::Lt { a } => {
                out.push(OP_LT);
                out.push(a);
            }
            Op::Gt { a } => {
                out.push(OP_GT);
                out.push(a);
            }
            Op::Send { a, sym, n } => {
                out.push(OP_SEND);
                out.push(a);
                put_u16(out, sym);
                out.push(n);
            }
            Op::Exec { a, child } => {
                out.push(OP_EXEC);
                out.push(a);
                put_u16(out, child);
            }
            Op::Return { a } => {
                out.push(OP_RETURN);
                out.push(a);
            }
            Op::Stop => out.push(OP_STOP),
            Op::Raise { a } => {
                out.push(OP_RAISE);
                out.push(a);
            }
            Op::Except { a } => {
                out.push(OP_EXCEPT);
                out.push(a);
            }
            Op::RaiseIf { a } => {
                out.push(OP_RAISEIF);
                out.push(a);
            }
        }
    }
}

/// Decode the instruction at `ip`. Returns the op and the address of the
/// next instruction.
pub fn decode(iseq: &[u8], ip: usize) -> Result<(Op, usize), DecodeError> {
    let need = |n: usize| -> Result<(), DecodeError> {
        if ip + n > iseq.len() {
            Err(DecodeError::truncated(ip))
        } else {
            Ok(())
        }
    };

    need(1)?;
    let opcode = iseq[ip];

    let op = match opcode {
        OP_NOP => Op::Nop,
        OP_MOVE => {
            need(3)?;
            Op::Move {
                a: iseq[ip + 1],
                b: iseq[ip + 2],
            }
        }
        OP_LOADPOOL => {
            need(4)?;
            Op::LoadPool {
                a: iseq[ip + 1],
                idx: codec::read_u16(&iseq[ip + 2..]),
            }
        }
        OP_LOADINT => {
            need(3)?;
            Op::LoadInt {
                a: iseq[ip + 1],
                v: iseq[ip + 2] as i8,
            }
        }
        OP_LOADSYM => {
            need(4)?;
            Op::LoadSym {
                a: iseq[ip + 1],
                idx: codec::read_u16(&iseq[ip + 2..]),
            }
        }
        OP_LOADNIL => {
            need(2)?;
            Op::LoadNil { a: iseq[ip + 1] }
        }
        OP_LOADTRUE => {
            need(2)?;
            Op::LoadTrue { a: iseq[ip + 1] }
        }
        OP_LOADFALSE => {
            need(2)?;
            Op::LoadFalse { a: iseq[ip + 1] }
        }
        OP_JUMP => {
            need(3)?;
            Op::Jump {
                to: codec::read_u16(&iseq[ip + 1..]),
            }
        }
        OP_JUMPIF => {
            need(4)?;
            Op::JumpIf {
                a: iseq[ip + 1],
                to: codec::read_u16(&iseq[ip + 2..]),
            }
        }
        OP_JUMPNOT => {
            need(4)?;
            Op::JumpNot {
                a: iseq[ip + 1],
                to: codec::read_u16(&iseq[ip + 2..]),
            }
        }
        OP_ADD => {
            need(2)?;
            Op::Add { a: iseq[ip + 1] }
        }
        OP_SUB => {
            need(2)?;
            Op::Sub { a: iseq[ip + 1] }
        }
        OP_MUL => {
            need(2)?;
            Op::Mul { a: iseq[ip + 1] }
        }
        OP_EQ => {
            need(2)?;
            Op::Eq { a: iseq[ip + 1] }
        }
        OP_LT => {
            need(2)?;
            Op::Lt { a: iseq[ip + 1] }
        }
        OP_GT => {
            need(2)?;
            Op::Gt { a: iseq[ip + 1] }
        }
        OP_SEND => {
            need(5)?;
            Op::Send {
                a: iseq[ip + 1],
                sym: codec::read_u16(&iseq[ip + 2..]),
                n: iseq[ip + 4],
            }
        }
        OP_EXEC => {
            need(4)?;
            Op::Exec {
                a: iseq[ip + 1],
                child: codec::read_u16(&iseq[ip + 2..]),
            }
        }
        OP_RETURN => {
            need(2)?;
            Op::Return { a: iseq[ip + 1] }
        }
        OP_STOP => Op::Stop,
        OP_RAISE => {
            need(2)?;
            Op::Raise { a: iseq[ip + 1] }
        }
        OP_EXCEPT => {
            need(2)?;
            Op::Except { a: iseq[ip + 1] }
        }
        OP_RAISEIF => {
            need(2)?;
            Op::RaiseIf { a: iseq[ip + 1] }
        }
        other => return Err(DecodeError::unknown(ip, other)),
    };

    Ok((op, ip + op.size()))
}
