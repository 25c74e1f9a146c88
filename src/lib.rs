//! pourover: a small embeddable virtual machine for JVM class files.
//!
//! All VM memory comes out of one arena: the VM stack, the stack of pinned
//! handles, the class metadata budget and a relocating object heap with a
//! mark, sweep and compact collector. Classes are loaded on demand through
//! a `ClassProvider` and methods run on a trampoline interpreter covering
//! the 32 bit integer and reference subset of the instruction set.
pub mod arena;
pub mod bytecode;
pub mod config;
pub mod error;
pub mod heap;
pub mod interpreter;
pub mod jvm;
pub mod loader;
pub mod natives;
pub mod program;
pub mod provider;
pub mod runtime;
pub mod trace;
pub mod value;

#[cfg(test)]
mod test_utils;

pub use config::VmConfig;
pub use error::{ErrorCode, Result, Severity, VmError, VmStatus};
pub use interpreter::MethodResult;
pub use natives::{ClassHook, NativeArgs, NativeFn, NativeMethodDef};
pub use provider::{ClassProvider, DirectoryProvider, MemoryProvider, ProviderChain, RomImage};
pub use runtime::{MemInfo, Runtime, RuntimeBuilder};
pub use value::{Var, WObject};
