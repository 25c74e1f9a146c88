//! Stack traces recovered from the VM stack.
//!
//! Nothing but the VM stack itself is needed: starting from the stack
//! pointer, each frame's trailer names its method, the method's frame size
//! leads to the linkage below it, and the linkage to the caller's frame.
use std::fmt;

use crate::interpreter::{LINKAGE, NATIVE_TRAILER, TRAILER};
use crate::program::{ClassId, MethodCode};
use crate::runtime::Runtime;

/// One frame of a stack trace, innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    pub class: String,
    /// Method name followed by its descriptor.
    pub method: String,
    /// Bytecode offset, when known.
    pub pc: Option<usize>,
    pub native: bool,
}

impl fmt::Display for TraceEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "\tat {}.{}", self.class, self.method)?;
        match (self.native, self.pc) {
            (true, _) => write!(f, " (native)"),
            (false, Some(pc)) => write!(f, " (pc {pc})"),
            (false, None) => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackTrace {
    entries: Vec<TraceEntry>,
}

impl StackTrace {
    /// Walks the frames below the current stack pointer.
    pub fn capture(rt: &Runtime) -> Self {
        let mut entries = Vec::new();
        let mut p = rt.vm_stack.ptr;
        // Only the innermost bytecode frame's pc is not saved on the stack.
        let mut pc = rt.fault_pc;

        while p >= LINKAGE {
            let below = p - LINKAGE;
            if rt.entry_links.contains(&below) {
                // Entry linkage with no frame above it yet.
                let next = rt.stack_slot(below + 2).raw() as usize;
                if next >= p {
                    break;
                }
                p = next;
                pc = None;
                continue;
            }
            let Some((entry, start)) = Self::frame_at(rt, p, pc) else {
                break;
            };
            entries.push(entry);
            let Some(link) = start.checked_sub(LINKAGE) else {
                break;
            };
            let next = if rt.entry_links.contains(&link) {
                pc = None;
                rt.stack_slot(link + 2).raw() as usize
            } else {
                pc = Some(rt.stack_slot(link).raw() as usize);
                link
            };
            if next >= p {
                break;
            }
            p = next;
        }
        StackTrace { entries }
    }

    /// Decodes the frame ending at `p`; returns it with the slot where its
    /// locals start.
    fn frame_at(rt: &Runtime, p: usize, pc: Option<usize>) -> Option<(TraceEntry, usize)> {
        let class = ClassId(u16::try_from(rt.stack_slot(p.checked_sub(1)?).raw()).ok()?);
        let method = u16::try_from(rt.stack_slot(p.checked_sub(2)?).raw()).ok()?;
        let c = rt.classes.try_get(class)?;
        let m = c.methods.get(method as usize)?;
        let (start, native) = match m.code {
            MethodCode::Native(_) => {
                let n = rt.stack_slot(p.checked_sub(NATIVE_TRAILER)?).raw() as usize;
                (p.checked_sub(NATIVE_TRAILER + n)?, true)
            }
            MethodCode::Bytecode(code) => {
                let size = TRAILER + code.max_locals as usize + code.max_stack as usize;
                (p.checked_sub(size)?, false)
            }
            MethodCode::None => return None,
        };
        let entry = TraceEntry {
            class: c.name().into_owned(),
            method: format!("{}{}", c.method_name(method), c.method_desc(method)),
            pc: if native { None } else { pc },
            native,
        };
        Some((entry, start))
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{entry}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_render_one_per_line() {
        let trace = StackTrace {
            entries: vec![
                TraceEntry {
                    class: "base/framework/System".into(),
                    method: "printStackTrace()V".into(),
                    pc: None,
                    native: true,
                },
                TraceEntry {
                    class: "test/Main".into(),
                    method: "main([Ljava/lang/String;)V".into(),
                    pc: Some(12),
                    native: false,
                },
            ],
        };
        assert_eq!(
            trace.to_string(),
            "\tat base/framework/System.printStackTrace()V (native)\n\
             \tat test/Main.main([Ljava/lang/String;)V (pc 12)"
        );
        assert_eq!(trace.len(), 2);
        assert!(StackTrace::default().is_empty());
    }

    #[test]
    fn idle_runtime_has_no_frames() {
        let (rt, _) = crate::test_utils::runtime(vec![]);
        assert!(StackTrace::capture(&rt).is_empty());
    }
}
