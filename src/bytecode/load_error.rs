// =============================================================================
// LOAD ERROR - image rejection taxonomy
// =============================================================================
//
// Every variant is fatal to the load: no partial arena is ever returned.

#[derive(Debug, Clone, PartialEq)]
pub enum LoadError {
    /// The image ended before a field or region could be read.
    Truncated { offset: usize, needed: usize },

    /// A block asks for more registers (or locals) than the executor's
    /// register file can hold. Rejected at load time, never at run time.
    RegisterOverflow { requested: u16, max: usize },

    /// Child blocks nest deeper than the loader's fixed limit.
    NestingTooDeep { limit: usize },

    /// Bytes remain after the root block tree was fully parsed.
    TrailingBytes { remaining: usize },

    /// A parsed block failed structural verification.
    Invalid { block: usize, detail: String },
}

impl LoadError {
    pub fn truncated(offset: usize, needed: usize) -> Self {
        LoadError::Truncated { offset, needed }
    }

    pub fn register_overflow(requested: u16, max: usize) -> Self {
        LoadError::RegisterOverflow { requested, max }
    }

    pub fn invalid(block: usize, detail: impl Into<String>) -> Self {
        LoadError::Invalid {
            block,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::Truncated { offset, needed } => {
                write!(
                    f,
                    "load error: image truncated at byte {} ({} more needed)",
                    offset, needed
                )
            }
            LoadError::RegisterOverflow { requested, max } => {
                write!(
                    f,
                    "load error: block needs {} registers, executor capacity is {}",
                    requested, max
                )
            }
            LoadError::NestingTooDeep { limit } => {
                write!(f, "load error: child blocks nest deeper than {}", limit)
            }
            LoadError::TrailingBytes { remaining } => {
                write!(f, "load error: {} trailing bytes after root block", remaining)
            }
            LoadError::Invalid { block, detail } => {
                write!(f, "load error: block {}: {}", block, detail)
            }
        }
    }
}
