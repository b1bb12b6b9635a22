use serde::{Deserialize, Serialize};

// =============================================================================
// IREP - immutable code blocks
// =============================================================================

/// Stable handle of a code block inside its [`IrepArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IrepId(pub u32);

/// Arena-wide interned symbol id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymId(pub u32);

/// Reserved symbol naming anonymous nested blocks invoked via `Exec`.
pub const BLOCK_SYM: SymId = SymId(0);

/// Catch-handler kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CatchKind {
    Rescue,
    Ensure,
}

impl CatchKind {
    pub fn from_byte(b: u8) -> Option<CatchKind> {
        match b {
            0 => Some(CatchKind::Rescue),
            1 => Some(CatchKind::Ensure),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            CatchKind::Rescue => 0,
            CatchKind::Ensure => 1,
        }
    }
}

impl std::fmt::Display for CatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatchKind::Rescue => write!(f, "rescue"),
            CatchKind::Ensure => write!(f, "ensure"),
        }
    }
}

/// One exception-handler descriptor: protects the instruction-address
/// range `[begin, end)` and jumps to `target` on match. Table order is
/// declaration order and is authoritative during handler search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchHandler {
    pub kind: CatchKind,
    pub begin: u32,
    pub end: u32,
    pub target: u32,
}

impl CatchHandler {
    /// Whether `addr` falls inside the protected range.
    pub fn covers(&self, addr: u32) -> bool {
        self.begin <= addr && addr < self.end
    }
}

/// Constant-pool entry tags. An entry is one tag byte followed by its
/// payload; the offset table locates entries, the tag delimits them.
pub mod pool_tag {
    /// i32 payload, 4 bytes.
    pub const INT: u8 = 0;
    /// f64 bit pattern, 8 bytes.
    pub const FLOAT: u8 = 1;
    /// u16 length followed by utf-8 bytes.
    pub const STR: u8 = 2;
}

/// An immutable unit of compiled code: instruction stream, exception
/// handlers, constant pool, symbol references and nested child blocks.
///
/// Never mutated after load; all execution state lives in the executor.
#[derive(Debug, Clone)]
pub struct Irep {
    pub nlocals: u16,
    pub nregs: u16,
    pub iseq: Vec<u8>,
    /// Declaration-ordered handler table.
    pub handlers: Vec<CatchHandler>,
    /// Raw pool data, sliced via `pool_offsets`.
    pub pool: Vec<u8>,
    pub pool_offsets: Vec<u16>,
    /// Block-local symbol index -> arena-wide interned id.
    pub syms: Vec<SymId>,
    /// Exclusively owned nested blocks, reachable only through here.
    pub children: Vec<IrepId>,
}

/// Flat, load-once storage for a tree of code blocks.
///
/// Blocks are addressed by stable [`IrepId`] indices instead of owning
/// pointers, so call frames can reference their resume block without
/// aliasing the tree. The arena is exclusively owned by one executor
/// session; dropping it releases every block exactly once.
#[derive(Debug)]
pub struct IrepArena {
    blocks: Vec<Irep>,
    /// SymId -> interned name. Index 0 is the reserved block symbol.
    names: Vec<String>,
    root: IrepId,
}

impl IrepArena {
    pub(crate) fn new() -> Self {
        IrepArena {
            blocks: Vec::new(),
            names: vec!["<block>".to_string()],
            root: IrepId(0),
        }
    }

    pub(crate) fn push_block(&mut self, irep: Irep) -> IrepId {
        let id = IrepId(self.blocks.len() as u32);
        self.blocks.push(irep);
        id
    }

    pub(crate) fn set_root(&mut self, id: IrepId) {
        self.root = id;
    }

    /// Intern `name`, returning the existing id when already known.
    pub(crate) fn intern(&mut self, name: &str) -> SymId {
        if let Some(pos) = self.names.iter().position(|n| n == name) {
            return SymId(pos as u32);
        }
        let id = SymId(self.names.len() as u32);
        self.names.push(name.to_string());
        id
    }

    pub fn root(&self) -> IrepId {
        self.root
    }

    pub fn block(&self, id: IrepId) -> &Irep {
        &self.blocks[id.0 as usize]
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Resolve an interned symbol to its name.
    pub fn sym_name(&self, sym: SymId) -> &str {
        &self.names[sym.0 as usize]
    }

    /// Look up a symbol by name anywhere in the arena.
    pub fn lookup_sym(&self, name: &str) -> Option<SymId> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| SymId(i as u32))
    }

    /// Byte slice of constant-pool entry `index` of block `id`, from its
    /// offset to the end of the pool region (entries are tag-delimited).
    ///
    /// `index` validity is guaranteed by load-time verification.
    pub fn pool_entry(&self, id: IrepId, index: usize) -> &[u8] {
        let irep = self.block(id);
        let off = irep.pool_offsets[index] as usize;
        &irep.pool[off..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(nregs: u16) -> Irep {
        Irep {
            nlocals: 0,
            nregs,
            iseq: vec![0x33], // Stop
            handlers: Vec::new(),
            pool: Vec::new(),
            pool_offsets: Vec::new(),
            syms: Vec::new(),
            children: Vec::new(),
        }
    }

    #[test]
    fn handler_range_is_half_open() {
        let h = CatchHandler {
            kind: CatchKind::Rescue,
            begin: 5,
            end: 10,
            target: 20,
        };
        assert!(!h.covers(4));
        assert!(h.covers(5));
        assert!(h.covers(9));
        assert!(!h.covers(10));
    }

    #[test]
    fn interning_deduplicates() {
        let mut arena = IrepArena::new();
        let a = arena.intern("add");
        let b = arena.intern("sub");
        let a2 = arena.intern("add");
        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert_eq!(arena.sym_name(a), "add");
        assert_eq!(arena.lookup_sym("sub"), Some(b));
        assert_eq!(arena.lookup_sym("mul"), None);
    }

    #[test]
    fn block_symbol_is_reserved() {
        let mut arena = IrepArena::new();
        assert_eq!(arena.intern("<block>"), BLOCK_SYM);
        assert_eq!(arena.sym_name(BLOCK_SYM), "<block>");
    }

    #[test]
    fn pool_entry_slices_from_offset() {
        let mut arena = IrepArena::new();
        let mut irep = leaf(2);
        irep.pool = vec![0, 0, 0, 0, 7, 0, 0, 0, 0, 9];
        irep.pool_offsets = vec![0, 5];
        let id = arena.push_block(irep);
        assert_eq!(arena.pool_entry(id, 0)[4], 7);
        assert_eq!(arena.pool_entry(id, 1)[4], 9);
    }

    #[test]
    fn arena_ids_are_stable() {
        let mut arena = IrepArena::new();
        let a = arena.push_block(leaf(1));
        let b = arena.push_block(leaf(2));
        arena.set_root(b);
        assert_eq!(arena.block(a).nregs, 1);
        assert_eq!(arena.block(arena.root()).nregs, 2);
        assert_eq!(arena.block_count(), 2);
    }
}
