//! IR Type System
//!
//! Value kinds, constants, and the class table that describes object layouts.
//! Classes use a flat field list whose prefix is the superclass layout, so a
//! field declared on a superclass has the same offset in every subclass.

use super::ClassId;
use std::fmt;

/// Kind of value a node produces or a field holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValueKind {
    /// No value (control and side-effect nodes)
    Void,
    Bool,
    Int,
    /// Reference to a heap object (or null)
    Object,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::Void => write!(f, "void"),
            ValueKind::Bool => write!(f, "bool"),
            ValueKind::Int => write!(f, "int"),
            ValueKind::Object => write!(f, "object"),
        }
    }
}

/// Static type of an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeRef {
    /// Instance of a declared class
    Class(ClassId),
    /// Array with the given component kind
    Array(ValueKind),
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Class(class) => write!(f, "{}", class),
            TypeRef::Array(component) => write!(f, "{}[]", component),
        }
    }
}

/// Constant values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Constant {
    Int(i64),
    Bool(bool),
    Null,
    /// Type descriptor, the result of a folded hub load
    Type(TypeRef),
}

impl Constant {
    /// Zero value for a field of the given kind.
    pub fn default_for(kind: ValueKind) -> Constant {
        match kind {
            ValueKind::Int => Constant::Int(0),
            ValueKind::Bool => Constant::Bool(false),
            ValueKind::Object | ValueKind::Void => Constant::Null,
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Constant::Int(_) => ValueKind::Int,
            Constant::Bool(_) => ValueKind::Bool,
            Constant::Null | Constant::Type(_) => ValueKind::Object,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Constant::Int(value) => Some(*value),
            _ => None,
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Int(value) => write!(f, "{}", value),
            Constant::Bool(value) => write!(f, "{}", value),
            Constant::Null => write!(f, "null"),
            Constant::Type(ty) => write!(f, "type {}", ty),
        }
    }
}

/// Reference to a declared field: the declaring class and the offset
/// inside that class's flat layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldRef {
    pub class: ClassId,
    pub index: usize,
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.class, self.index)
    }
}

/// Declared field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    pub name: String,
    pub kind: ValueKind,
}

/// Declared class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassInfo {
    pub id: ClassId,
    pub name: String,
    pub superclass: Option<ClassId>,
    /// Flat layout, superclass fields first
    pub fields: Vec<FieldInfo>,
    /// Instances need a finalizer registration
    pub has_finalizer: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticOp {
    Add,
    Sub,
    Mul,
}

impl fmt::Display for ArithmeticOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArithmeticOp::Add => write!(f, "add"),
            ArithmeticOp::Sub => write!(f, "sub"),
            ArithmeticOp::Mul => write!(f, "mul"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompareOp::Eq => write!(f, "eq"),
            CompareOp::Ne => write!(f, "ne"),
            CompareOp::Lt => write!(f, "lt"),
        }
    }
}
