use crate::bytecode::irep::SymId;

// =============================================================================
// VALUE - register-slot contract
// =============================================================================
//
// The full object model lives upstream; the executor only needs enough of
// a value type to fill register slots, test truthiness, dispatch on a
// receiver's class and carry exceptions.

/// Class handle. Receiver classes key method dispatch; exception classes
/// key nothing yet but travel with the exception for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(pub u32);

/// Built-in class handles. Order matches [`BUILTIN_CLASS_NAMES`].
pub mod class {
    use super::ClassId;

    pub const OBJECT: ClassId = ClassId(0);
    pub const NIL: ClassId = ClassId(1);
    pub const BOOL: ClassId = ClassId(2);
    pub const INTEGER: ClassId = ClassId(3);
    pub const FLOAT: ClassId = ClassId(4);
    pub const SYMBOL: ClassId = ClassId(5);
    pub const STRING: ClassId = ClassId(6);
    pub const EXCEPTION: ClassId = ClassId(7);
    pub const RUNTIME_ERROR: ClassId = ClassId(8);
    pub const TYPE_ERROR: ClassId = ClassId(9);
}

pub const BUILTIN_CLASS_NAMES: &[&str] = &[
    "Object",
    "NilClass",
    "Bool",
    "Integer",
    "Float",
    "Symbol",
    "String",
    "Exception",
    "RuntimeError",
    "TypeError",
];

/// A raised (or caught) exception: class plus message value.
#[derive(Debug, Clone, PartialEq)]
pub struct Exception {
    pub class: ClassId,
    pub message: Box<Value>,
}

/// Runtime value held in one register slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Symbol(SymId),
    String(String),
    Exception(Exception),
}

impl Value {
    /// Everything but nil and false is truthy.
    pub fn truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn class_of(&self) -> ClassId {
        match self {
            Value::Nil => class::NIL,
            Value::Bool(_) => class::BOOL,
            Value::Integer(_) => class::INTEGER,
            Value::Float(_) => class::FLOAT,
            Value::Symbol(_) => class::SYMBOL,
            Value::String(_) => class::STRING,
            Value::Exception(e) => e.class,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Symbol(_) => "symbol",
            Value::String(_) => "string",
            Value::Exception(_) => "exception",
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Integer(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{}", n),
            Value::Symbol(s) => write!(f, ":sym{}", s.0),
            Value::String(s) => write!(f, "{}", s),
            Value::Exception(e) => write!(f, "#<exception {}>", e.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(!Value::Nil.truthy());
        assert!(!Value::Bool(false).truthy());
        assert!(Value::Bool(true).truthy());
        assert!(Value::Integer(0).truthy());
        assert!(Value::String(String::new()).truthy());
    }

    #[test]
    fn class_of_builtin_values() {
        assert_eq!(Value::Nil.class_of(), class::NIL);
        assert_eq!(Value::Integer(1).class_of(), class::INTEGER);
        let exc = Value::Exception(Exception {
            class: class::TYPE_ERROR,
            message: Box::new(Value::Nil),
        });
        assert_eq!(exc.class_of(), class::TYPE_ERROR);
    }

    #[test]
    fn builtin_names_cover_all_ids() {
        assert_eq!(
            BUILTIN_CLASS_NAMES.len(),
            class::TYPE_ERROR.0 as usize + 1
        );
        assert_eq!(BUILTIN_CLASS_NAMES[class::STRING.0 as usize], "String");
    }
}
