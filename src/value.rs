//! Stack slot and object handle representations.
use std::fmt;

/// One 32 bit stack or local variable slot. Slots are untagged: whether a
/// slot holds an int, an object handle, a return address or frame linkage
/// is implied by the code reading it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Var(u32);

impl Var {
    pub const ZERO: Var = Var(0);

    pub const fn from_raw(raw: u32) -> Self {
        Var(raw)
    }

    pub const fn from_int(value: i32) -> Self {
        Var(value as u32)
    }

    pub const fn from_obj(obj: WObject) -> Self {
        Var(obj.0)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn int(self) -> i32 {
        self.0 as i32
    }

    pub const fn obj(self) -> WObject {
        WObject(self.0)
    }
}

/// Opaque handle to a heap object. Handles stay stable while the object
/// moves during compaction; 0 is the null reference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WObject(pub(crate) u32);

impl WObject {
    pub const NULL: WObject = WObject(0);

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for WObject {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

/// Array element type codes, numbered like the `newarray` operand.
pub mod array_type {
    pub const OBJECT: u8 = 1;
    pub const ARRAY: u8 = 2;
    pub const BOOLEAN: u8 = 4;
    pub const CHAR: u8 = 5;
    pub const FLOAT: u8 = 6;
    pub const DOUBLE: u8 = 7;
    pub const BYTE: u8 = 8;
    pub const SHORT: u8 = 9;
    pub const INT: u8 = 10;
    pub const LONG: u8 = 11;

    /// Element width in bytes, `None` for unsupported element types.
    pub fn element_size(ty: u8) -> Option<usize> {
        match ty {
            OBJECT | ARRAY | INT => Some(4),
            BOOLEAN | BYTE => Some(1),
            CHAR | SHORT => Some(2),
            _ => None,
        }
    }

    /// Element type for a descriptor character such as `I` or `[`.
    pub fn from_descriptor(c: u8) -> Option<u8> {
        match c {
            b'L' => Some(OBJECT),
            b'[' => Some(ARRAY),
            b'Z' => Some(BOOLEAN),
            b'B' => Some(BYTE),
            b'C' => Some(CHAR),
            b'S' => Some(SHORT),
            b'I' => Some(INT),
            b'F' => Some(FLOAT),
            b'D' => Some(DOUBLE),
            b'J' => Some(LONG),
            _ => None,
        }
    }

    pub fn is_reference(ty: u8) -> bool {
        ty == OBJECT || ty == ARRAY
    }
}
