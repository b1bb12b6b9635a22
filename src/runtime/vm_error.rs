// =============================================================================
// VM ERROR - fatal session errors
// =============================================================================
//
// Raised language-level exceptions are values travelling through the
// unwind machinery, not `VmError`s; they only become one here when
// propagation exhausts the frame stack.

#[derive(Debug, Clone, PartialEq)]
pub enum VmError {
    /// A fixed resource ran out: call frames, unwind entries, register
    /// file, vm ids. Fatal to the session.
    ResourceExhausted { what: &'static str, limit: usize },

    /// Frame pop with no frames: corrupt or adversarial bytecode.
    FrameUnderflow,

    /// An exception propagated off the outermost frame.
    UnhandledException { class_name: String, message: String },

    /// A state that load-time verification should have made impossible.
    Internal(String),
}

impl VmError {
    pub fn exhausted(what: &'static str, limit: usize) -> Self {
        VmError::ResourceExhausted { what, limit }
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        VmError::Internal(detail.into())
    }

    /// Signed error code recorded on the executor; 0 means no error.
    pub fn code(&self) -> i32 {
        match self {
            VmError::ResourceExhausted { .. } => -2,
            VmError::FrameUnderflow => -3,
            VmError::UnhandledException { .. } => -4,
            VmError::Internal(_) => -5,
        }
    }
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmError::ResourceExhausted { what, limit } => {
                write!(f, "vm error: {} exhausted (limit {})", what, limit)
            }
            VmError::FrameUnderflow => write!(f, "vm error: call-frame stack underflow"),
            VmError::UnhandledException {
                class_name,
                message,
            } => {
                write!(f, "unhandled exception: {} ({})", message, class_name)
            }
            VmError::Internal(detail) => write!(f, "vm internal error: {}", detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_and_nonzero() {
        assert_eq!(VmError::exhausted("call frames", 8).code(), -2);
        assert_eq!(VmError::FrameUnderflow.code(), -3);
        let unhandled = VmError::UnhandledException {
            class_name: "RuntimeError".to_string(),
            message: "boom".to_string(),
        };
        assert_eq!(unhandled.code(), -4);
        assert_eq!(VmError::internal("x").code(), -5);
    }

    #[test]
    fn display_includes_context() {
        let e = VmError::exhausted("unwind stack", 5);
        assert_eq!(e.to_string(), "vm error: unwind stack exhausted (limit 5)");
    }
}
