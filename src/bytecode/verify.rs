use crate::bytecode::codec;
use crate::bytecode::irep::{Irep, pool_tag};
use crate::bytecode::op::{self, Op};

// =============================================================================
// VERIFY - load-time bytecode validation
// =============================================================================
//
// Runs once per block while loading. Everything checked here is a
// precondition the executor relies on without re-checking: instruction
// encodings, jump and handler targets on instruction boundaries, operand
// indices in bounds, pool entries well-formed.

#[derive(Debug)]
pub struct VerifyError {
    pub message: String,
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "verify error: {}", self.message)
    }
}

impl VerifyError {
    fn new(message: impl Into<String>) -> Self {
        VerifyError {
            message: message.into(),
        }
    }
}

/// Validate one block. The block's children must already be parsed (only
/// their count matters here).
pub fn check_block(irep: &Irep) -> Result<(), VerifyError> {
    if irep.iseq.is_empty() {
        return Err(VerifyError::new("empty instruction stream"));
    }
    if irep.nlocals > irep.nregs {
        return Err(VerifyError::new(format!(
            "nlocals {} exceeds nregs {}",
            irep.nlocals, irep.nregs
        )));
    }

    let ilen = irep.iseq.len();
    let mut boundary = vec![false; ilen + 1];
    boundary[0] = true;

    let mut ops = Vec::new();
    let mut ip = 0;
    while ip < ilen {
        let (decoded, next) = op::decode(&irep.iseq, ip)
            .map_err(|e| VerifyError::new(format!("at {:04}: {}", e.ip, e.detail)))?;
        ops.push((ip, decoded));
        ip = next;
        boundary[ip] = true;
    }

    let nregs = irep.nregs as usize;
    let reg = |at: usize, r: usize| -> Result<(), VerifyError> {
        if r < nregs {
            Ok(())
        } else {
            Err(VerifyError::new(format!(
                "at {:04}: register {} out of window ({} regs)",
                at, r, nregs
            )))
        }
    };
    let jump = |at: usize, to: u16| -> Result<(), VerifyError> {
        let t = to as usize;
        if t < ilen && boundary[t] {
            Ok(())
        } else {
            Err(VerifyError::new(format!(
                "at {:04}: jump target {:04} is not an instruction boundary",
                at, to
            )))
        }
    };

    for &(at, decoded) in &ops {
        match decoded {
            Op::Nop | Op::Stop => {}
            Op::Move { a, b } => {
                reg(at, a as usize)?;
                reg(at, b as usize)?;
            }
            Op::LoadPool { a, idx } => {
                reg(at, a as usize)?;
                if idx as usize >= irep.pool_offsets.len() {
                    return Err(VerifyError::new(format!(
                        "at {:04}: pool index {} out of range ({} entries)",
                        at,
                        idx,
                        irep.pool_offsets.len()
                    )));
                }
            }
            Op::LoadSym { a, idx } => {
                reg(at, a as usize)?;
                if idx as usize >= irep.syms.len() {
                    return Err(VerifyError::new(format!(
                        "at {:04}: symbol index {} out of range ({} symbols)",
                        at,
                        idx,
                        irep.syms.len()
                    )));
                }
            }
            Op::LoadInt { a, .. }
            | Op::LoadNil { a }
            | Op::LoadTrue { a }
            | Op::LoadFalse { a }
            | Op::Return { a }
            | Op::Raise { a }
            | Op::Except { a }
            | Op::RaiseIf { a } => reg(at, a as usize)?,
            Op::Add { a } | Op::Sub { a } | Op::Mul { a } | Op::Eq { a } | Op::Lt { a }
            | Op::Gt { a } => {
                reg(at, a as usize)?;
                reg(at, a as usize + 1)?;
            }
            Op::Jump { to } => jump(at, to)?,
            Op::JumpIf { a, to } | Op::JumpNot { a, to } => {
                reg(at, a as usize)?;
                jump(at, to)?;
            }
            Op::Send { a, sym, n } => {
                reg(at, a as usize)?;
                reg(at, a as usize + n as usize)?;
                if sym as usize >= irep.syms.len() {
                    return Err(VerifyError::new(format!(
                        "at {:04}: method symbol {} out of range ({} symbols)",
                        at,
                        sym,
                        irep.syms.len()
                    )));
                }
            }
            Op::Exec { a, child } => {
                reg(at, a as usize)?;
                if child as usize >= irep.children.len() {
                    return Err(VerifyError::new(format!(
                        "at {:04}: child index {} out of range ({} children)",
                        at,
                        child,
                        irep.children.len()
                    )));
                }
            }
        }
    }

    for (i, h) in irep.handlers.iter().enumerate() {
        if h.begin > h.end || h.end as usize > ilen {
            return Err(VerifyError::new(format!(
                "handler {}: range [{}, {}) outside instruction stream",
                i, h.begin, h.end
            )));
        }
        if !boundary[h.begin as usize] || !boundary[h.end as usize] {
            return Err(VerifyError::new(format!(
                "handler {}: range [{}, {}) not on instruction boundaries",
                i, h.begin, h.end
            )));
        }
        if h.target as usize >= ilen || !boundary[h.target as usize] {
            return Err(VerifyError::new(format!(
                "handler {}: target {} is not an instruction boundary",
                i, h.target
            )));
        }
    }

    check_pool(irep)?;
    Ok(())
}

fn check_pool(irep: &Irep) -> Result<(), VerifyError> {
    for (i, &off) in irep.pool_offsets.iter().enumerate() {
        let off = off as usize;
        if off >= irep.pool.len() {
            return Err(VerifyError::new(format!(
                "pool entry {}: offset {} outside pool data",
                i, off
            )));
        }
        let entry = &irep.pool[off..];
        let ok = match entry[0] {
            pool_tag::INT => entry.len() >= 5,
            pool_tag::FLOAT => entry.len() >= 9,
            pool_tag::STR => {
                entry.len() >= 3 && {
                    let len = codec::read_u16(&entry[1..]) as usize;
                    entry.len() >= 3 + len
                        && std::str::from_utf8(&entry[3..3 + len]).is_ok()
                }
            }
            _ => false,
        };
        if !ok {
            return Err(VerifyError::new(format!(
                "pool entry {}: malformed (tag 0x{:02x})",
                i, entry[0]
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::irep::{CatchHandler, CatchKind, SymId};

    fn block_with(code: &[Op], nregs: u16) -> Irep {
        let mut iseq = Vec::new();
        for op in code {
            op.encode_into(&mut iseq);
        }
        Irep {
            nlocals: 0,
            nregs,
            iseq,
            handlers: Vec::new(),
            pool: Vec::new(),
            pool_offsets: Vec::new(),
            syms: Vec::new(),
            children: Vec::new(),
        }
    }

    #[test]
    fn accepts_well_formed_block() {
        let irep = block_with(
            &[
                Op::LoadInt { a: 0, v: 1 },
                Op::LoadInt { a: 1, v: 2 },
                Op::Add { a: 0 },
                Op::Stop,
            ],
            2,
        );
        assert!(check_block(&irep).is_ok());
    }

    #[test]
    fn rejects_register_out_of_window() {
        let irep = block_with(&[Op::LoadNil { a: 5 }, Op::Stop], 2);
        let err = check_block(&irep).unwrap_err();
        assert!(err.message.contains("register 5"));
    }

    #[test]
    fn rejects_arith_spilling_past_window() {
        // Add reads R(1) and R(2); nregs = 2 only covers R(0) and R(1).
        let irep = block_with(&[Op::Add { a: 1 }, Op::Stop], 2);
        assert!(check_block(&irep).is_err());
    }

    #[test]
    fn rejects_jump_into_operand_bytes() {
        // LoadInt occupies [0, 3); address 1 is inside its operands.
        let irep = block_with(&[Op::LoadInt { a: 0, v: 7 }, Op::Jump { to: 1 }], 1);
        let err = check_block(&irep).unwrap_err();
        assert!(err.message.contains("not an instruction boundary"));
    }

    #[test]
    fn rejects_pool_index_out_of_range() {
        let irep = block_with(&[Op::LoadPool { a: 0, idx: 0 }, Op::Stop], 1);
        let err = check_block(&irep).unwrap_err();
        assert!(err.message.contains("pool index 0"));
    }

    #[test]
    fn rejects_handler_target_off_boundary() {
        let mut irep = block_with(&[Op::LoadNil { a: 0 }, Op::Stop], 1);
        irep.handlers.push(CatchHandler {
            kind: CatchKind::Rescue,
            begin: 0,
            end: 2,
            target: 1,
        });
        assert!(check_block(&irep).is_err());
    }

    #[test]
    fn rejects_unknown_send_symbol() {
        let mut irep = block_with(&[Op::Send { a: 0, sym: 3, n: 0 }, Op::Stop], 1);
        irep.syms = vec![SymId(1)];
        let err = check_block(&irep).unwrap_err();
        assert!(err.message.contains("method symbol 3"));
    }

    #[test]
    fn rejects_malformed_pool_entry() {
        let mut irep = block_with(&[Op::LoadPool { a: 0, idx: 0 }, Op::Stop], 1);
        irep.pool = vec![pool_tag::INT, 0, 0]; // int payload truncated
        irep.pool_offsets = vec![0];
        let err = check_block(&irep).unwrap_err();
        assert!(err.message.contains("malformed"));
    }

    #[test]
    fn rejects_empty_stream() {
        let irep = block_with(&[], 1);
        assert!(check_block(&irep).is_err());
    }
}
