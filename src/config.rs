//! Runtime configuration.
//!
//! Sizes are in bytes. The stacks, class budget and object heap are all
//! carved out of the arena, so `arena_bytes` must be able to hold them plus
//! one 8 byte block record each.
use crate::arena::{MAX_ARENA_BYTES, UNIT};
use crate::error::{Result, VmError};

/// VM configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    /// Size of the single backing region
    pub arena_bytes: usize,

    /// Operand and local variable stack
    pub vm_stack_bytes: usize,

    /// Stack of handles pinned by host and native code
    pub native_stack_bytes: usize,

    /// Budget for class metadata
    pub class_heap_bytes: usize,

    /// Object heap, shared by objects and the handle table
    pub object_heap_bytes: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            arena_bytes: 200 * 1024,
            vm_stack_bytes: 1000,
            native_stack_bytes: 1000,
            class_heap_bytes: 20000,
            object_heap_bytes: 76000,
        }
    }
}

impl VmConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects configurations that can never be carved out of the arena.
    pub fn validate(&self) -> Result<()> {
        if self.arena_bytes > MAX_ARENA_BYTES {
            return Err(VmError::ParamError("arena exceeds the addressable maximum"));
        }
        if self.vm_stack_bytes < 4 * 4 {
            return Err(VmError::ParamError("vm stack too small"));
        }
        if self.native_stack_bytes < 4 {
            return Err(VmError::ParamError("native stack too small"));
        }
        if self.object_heap_bytes < 16 {
            return Err(VmError::ParamError("object heap too small"));
        }
        let round = |n: usize| (n + UNIT - 1) / UNIT * UNIT + UNIT;
        let needed = round(self.vm_stack_bytes)
            + round(self.native_stack_bytes)
            + round(self.class_heap_bytes.max(1))
            + round(self.object_heap_bytes)
            + 2 * UNIT;
        if needed > self.arena_bytes {
            return Err(VmError::CantAllocateMemory(needed));
        }
        Ok(())
    }
}
