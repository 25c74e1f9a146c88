//! Error codes and the VM error type.
//!
//! Fatal errors carry the classic numeric codes in the `0x8000` range so a
//! host can report them the same way regardless of where they were raised.
//! Program errors (below `0x8000`) are never returned as `Err`: they become
//! exception objects thrown inside the running program.
use std::fmt;

use thiserror::Error;

use crate::arena::ArenaError;
use crate::provider::ProviderError;

pub type Result<T> = std::result::Result<T, VmError>;

/// Numeric VM status codes.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NoError = 0x0000,

    // Catchable program errors.
    NullObjectAccess = 0x001a,
    NullArrayAccess = 0x001b,
    IndexOutOfRange = 0x001c,
    DivideByZero = 0x001d,
    ClassCast = 0x001e,
    NegativeArraySize = 0x001f,
    ArrayStore = 0x0020,
    BadClassCode = 0x0021,

    // Fatal errors.
    Unknown = 0x8000,
    SanityCheckFailed = 0x8001,
    CantAllocateMemory = 0x8002,
    OutOfClassMem = 0x8003,
    OutOfObjectMem = 0x8004,
    NativeStackOverflow = 0x8005,
    NativeStackUnderflow = 0x8006,
    StackOverflow = 0x8007,
    NativeErrorReturn = 0x8008,
    BadOpcode = 0x8009,
    CantFindClass = 0x800a,
    CantFindMethod = 0x800b,
    CantFindField = 0x800c,
    ClassTooLarge = 0x800d,
    LoadConst = 0x800e,
    LoadField = 0x800f,
    LoadMethod = 0x8010,
    ClinitMethodError = 0x8011,
    ConstantToVar = 0x8012,
    BadParamNum = 0x8013,
    ParamError = 0x8014,
    CantCreateObject = 0x8015,
    NotArray = 0x8016,
    BadClassName = 0x8017,
    CantFindNative = 0x8018,
    NotMainClass = 0x8019,
    CondNotSatisfied = 0x801a,
}

impl ErrorCode {
    /// Maps a code returned by a native method back to its enum value.
    pub fn from_u16(code: u16) -> Option<Self> {
        use ErrorCode::*;
        let all = [
            NoError,
            NullObjectAccess,
            NullArrayAccess,
            IndexOutOfRange,
            DivideByZero,
            ClassCast,
            NegativeArraySize,
            ArrayStore,
            BadClassCode,
            Unknown,
            SanityCheckFailed,
            CantAllocateMemory,
            OutOfClassMem,
            OutOfObjectMem,
            NativeStackOverflow,
            NativeStackUnderflow,
            StackOverflow,
            NativeErrorReturn,
            BadOpcode,
            CantFindClass,
            CantFindMethod,
            CantFindField,
            ClassTooLarge,
            LoadConst,
            LoadField,
            LoadMethod,
            ClinitMethodError,
            ConstantToVar,
            BadParamNum,
            ParamError,
            CantCreateObject,
            NotArray,
            BadClassName,
            CantFindNative,
            NotMainClass,
            CondNotSatisfied,
        ];
        all.into_iter().find(|c| *c as u16 == code)
    }

    pub fn is_fatal(self) -> bool {
        (self as u16) & 0x8000 != 0
    }

    pub fn message(self) -> &'static str {
        use ErrorCode::*;
        match self {
            NoError => "no error",
            NullObjectAccess => "null object access",
            NullArrayAccess => "null array access",
            IndexOutOfRange => "index out of range",
            DivideByZero => "divide by zero",
            ClassCast => "class cast",
            NegativeArraySize => "negative array size",
            ArrayStore => "array store",
            BadClassCode => "bad class code",
            Unknown => "unknown error",
            SanityCheckFailed => "sanity check failed",
            CantAllocateMemory => "can't allocate memory",
            OutOfClassMem => "out of class memory",
            OutOfObjectMem => "out of object memory",
            NativeStackOverflow => "native stack overflow",
            NativeStackUnderflow => "native stack underflow",
            StackOverflow => "stack overflow",
            NativeErrorReturn => "native method returned an error",
            BadOpcode => "bad opcode",
            CantFindClass => "can't find class",
            CantFindMethod => "can't find method",
            CantFindField => "can't find field",
            ClassTooLarge => "class too large",
            LoadConst => "can't load constant",
            LoadField => "can't load field",
            LoadMethod => "can't load method",
            ClinitMethodError => "static initializer failed",
            ConstantToVar => "bad constant",
            BadParamNum => "bad parameter count",
            ParamError => "bad parameter",
            CantCreateObject => "can't create object",
            NotArray => "not an array",
            BadClassName => "bad class name",
            CantFindNative => "can't find native method",
            NotMainClass => "not a main class",
            CondNotSatisfied => "condition not satisfied",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:04x} {}", *self as u16, self.message())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Severity {
    #[default]
    NoError,
    RuntimeException,
    Fatal,
}

/// Last error recorded by a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmStatus {
    pub code: ErrorCode,
    pub severity: Severity,
}

impl Default for VmStatus {
    fn default() -> Self {
        Self {
            code: ErrorCode::NoError,
            severity: Severity::NoError,
        }
    }
}

#[derive(Debug, Error)]
pub enum VmError {
    #[error("runtime is already initialized")]
    AlreadyInitialized,
    #[error("can't allocate {0} bytes from the arena")]
    CantAllocateMemory(usize),
    #[error("out of class memory")]
    OutOfClassMemory,
    #[error("out of object memory")]
    OutOfObjectMemory,
    #[error("native stack overflow")]
    NativeStackOverflow,
    #[error("native stack underflow")]
    NativeStackUnderflow,
    #[error("stack overflow")]
    StackOverflow,
    #[error("native method returned error {0}")]
    NativeErrorReturn(i32),
    #[error("bad opcode 0x{0:02x}")]
    BadOpcode(u8),
    #[error("class not found: {0}")]
    ClassNotFound(String),
    #[error("method not found: {class}.{name}{desc}")]
    MethodNotFound {
        class: String,
        name: String,
        desc: String,
    },
    #[error("field not found: {class}.{name} {desc}")]
    FieldNotFound {
        class: String,
        name: String,
        desc: String,
    },
    #[error("class too large: {0}")]
    ClassTooLarge(String),
    #[error("bad magic number in class {0}")]
    BadMagic(String),
    #[error("can't load constant in class {0}")]
    LoadConstant(String),
    #[error("can't load field in class {0}")]
    LoadField(String),
    #[error("can't load method in class {0}")]
    LoadMethod(String),
    #[error("static initializer of {0} failed")]
    ClinitFailed(String),
    #[error("constant #{0} can't be converted to a value")]
    ConstantToVar(u16),
    #[error("bad parameter count in descriptor of {0}")]
    BadParamNum(String),
    #[error("bad parameter: {0}")]
    ParamError(&'static str),
    #[error("can't create object of abstract class or interface {0}")]
    CantCreateObject(String),
    #[error("object is not an array")]
    NotArray,
    #[error("bad class name: {0}")]
    BadClassName(String),
    #[error("native method not found: {class}.{name}{desc}")]
    NativeNotFound {
        class: String,
        name: String,
        desc: String,
    },
    #[error("native methods {first} and {second} share hash {hash}")]
    NativeHashCollision {
        hash: u32,
        first: String,
        second: String,
    },
    #[error("class {0} has no static main method")]
    NotMainClass(String),
    #[error("bad class code: {0}")]
    BadClassCode(String),
    #[error("class {class} is not compatible with {base}")]
    IncompatibleClass { class: String, base: String },
    #[error("uncaught exception {0}")]
    UncaughtException(String),
    /// A fatal error in a nested call that the code above it did not
    /// propagate, such as a failed class initializer behind a native.
    #[error("{message}")]
    Deferred { code: ErrorCode, message: String },
    #[error(transparent)]
    Arena(#[from] ArenaError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl VmError {
    pub fn code(&self) -> ErrorCode {
        use VmError::*;
        match self {
            AlreadyInitialized => ErrorCode::SanityCheckFailed,
            CantAllocateMemory(_) | Arena(_) => ErrorCode::CantAllocateMemory,
            OutOfClassMemory => ErrorCode::OutOfClassMem,
            OutOfObjectMemory => ErrorCode::OutOfObjectMem,
            NativeStackOverflow => ErrorCode::NativeStackOverflow,
            NativeStackUnderflow => ErrorCode::NativeStackUnderflow,
            StackOverflow => ErrorCode::StackOverflow,
            NativeErrorReturn(_) => ErrorCode::NativeErrorReturn,
            BadOpcode(_) => ErrorCode::BadOpcode,
            ClassNotFound(_) | Provider(_) => ErrorCode::CantFindClass,
            MethodNotFound { .. } => ErrorCode::CantFindMethod,
            FieldNotFound { .. } => ErrorCode::CantFindField,
            ClassTooLarge(_) => ErrorCode::ClassTooLarge,
            BadMagic(_) | LoadConstant(_) => ErrorCode::LoadConst,
            LoadField(_) => ErrorCode::LoadField,
            LoadMethod(_) => ErrorCode::LoadMethod,
            ClinitFailed(_) => ErrorCode::ClinitMethodError,
            ConstantToVar(_) => ErrorCode::ConstantToVar,
            BadParamNum(_) => ErrorCode::BadParamNum,
            ParamError(_) | IncompatibleClass { .. } => ErrorCode::ParamError,
            CantCreateObject(_) => ErrorCode::CantCreateObject,
            NotArray => ErrorCode::NotArray,
            BadClassName(_) => ErrorCode::BadClassName,
            NativeNotFound { .. } | NativeHashCollision { .. } => ErrorCode::CantFindNative,
            NotMainClass(_) => ErrorCode::NotMainClass,
            BadClassCode(_) => ErrorCode::BadClassCode,
            UncaughtException(_) => ErrorCode::Unknown,
            Deferred { code, .. } => *code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_u16() {
        for raw in [0x1a, 0x1c, 0x8007, 0x801a] {
            let code = ErrorCode::from_u16(raw).unwrap();
            assert_eq!(code as u16, raw);
        }
        assert_eq!(ErrorCode::from_u16(0x1234), None);
    }

    #[test]
    fn fatal_bit() {
        assert!(ErrorCode::StackOverflow.is_fatal());
        assert!(!ErrorCode::DivideByZero.is_fatal());
        assert_eq!(VmError::StackOverflow.code(), ErrorCode::StackOverflow);
        assert_eq!(
            VmError::ClassNotFound("a/B".into()).code(),
            ErrorCode::CantFindClass
        );
    }

    #[test]
    fn display_includes_code() {
        assert_eq!(
            ErrorCode::OutOfObjectMem.to_string(),
            "0x8004 out of object memory"
        );
    }
}
