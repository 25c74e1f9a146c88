//! Interpreter for JVM bytecode.
//!
//! Method calls never recurse on the host stack: every frame lives on the
//! VM stack and a single loop switches between them. A bytecode frame is
//! laid out as
//!
//! +-------------+--------+----------+-------------+
//! | linkage (3) | locals | operands | trailer (3) |
//! +-------------+--------+----------+-------------+
//!
//! where the linkage holds the invoking pc, the caller's locals base and
//! the caller's operand pointer once the arguments were popped, and the
//! trailer holds the operand base, method index and class id. Native
//! frames keep their arguments where the locals would be, followed by a
//! four slot trailer: argument count, argument base, method and class.
//! The stack trace walker relies on this layout.
use std::rc::Rc;

use log::trace;

use crate::bytecode::OPCode;
use crate::error::{ErrorCode, Result, VmError};
use crate::natives::NativeArgs;
use crate::program::{ClassId, FieldVar, MethodCode};
use crate::runtime::Runtime;
use crate::value::{array_type, Var, WObject};

pub(crate) const LINKAGE: usize = 3;
pub(crate) const TRAILER: usize = 3;
pub(crate) const NATIVE_TRAILER: usize = 4;

/// How a method invoked from host code finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodResult {
    Returned(Option<Var>),
    /// An exception no frame of this call handled.
    Exception(WObject),
}

/// Interpreter registers of the executing bytecode method.
struct Frame {
    class: ClassId,
    method: u16,
    code: Rc<[u8]>,
    code_start: usize,
    code_len: usize,
    var_base: usize,
    stack_base: usize,
    stack_limit: usize,
    sp: usize,
    pc: usize,
}

fn bad_code(pc: usize) -> VmError {
    VmError::BadClassCode(format!("pc {pc}"))
}

impl Frame {
    fn byte_at(&self, at: usize) -> Result<u8> {
        if at >= self.code_len {
            return Err(bad_code(self.pc));
        }
        self.code
            .get(self.code_start + at)
            .copied()
            .ok_or_else(|| bad_code(self.pc))
    }

    /// Operand byte `off` bytes after the opcode.
    fn u8(&self, off: usize) -> Result<u8> {
        self.byte_at(self.pc + off)
    }

    fn i8(&self, off: usize) -> Result<i8> {
        Ok(self.u8(off)? as i8)
    }

    fn u16(&self, off: usize) -> Result<u16> {
        Ok(u16::from_be_bytes([self.u8(off)?, self.u8(off + 1)?]))
    }

    fn i16(&self, off: usize) -> Result<i16> {
        Ok(self.u16(off)? as i16)
    }

    fn i32(&self, off: usize) -> Result<i32> {
        self.word_at(self.pc + off)
    }

    /// Big endian word at an absolute code offset.
    fn word_at(&self, at: usize) -> Result<i32> {
        Ok(i32::from_be_bytes([
            self.byte_at(at)?,
            self.byte_at(at + 1)?,
            self.byte_at(at + 2)?,
            self.byte_at(at + 3)?,
        ]))
    }

    fn set_pc(&mut self, target: i64) -> Result<()> {
        if target < 0 || target as usize >= self.code_len {
            return Err(bad_code(self.pc));
        }
        self.pc = target as usize;
        Ok(())
    }

    /// Branches relative to the current instruction.
    fn jump(&mut self, offset: i32) -> Result<()> {
        self.set_pc(self.pc as i64 + offset as i64)
    }

    fn max_locals(&self) -> usize {
        self.stack_base - self.var_base
    }

    /// Length of the invoke instruction at pc.
    fn invoke_len(&self) -> usize {
        match self.byte_at(self.pc) {
            Ok(0xb9) => 5,
            _ => 3,
        }
    }
}

/// What the current frame asks the trampoline to do.
enum Flow {
    Invoke {
        class: ClassId,
        method: u16,
        nargs: usize,
    },
    Return(Option<Var>),
    Throw(WObject),
}

/// A frame to switch to, or the outcome of a native method that already
/// ran and whose frame is gone.
enum Callee {
    Bytecode(Frame),
    Returned(Option<Var>),
    Threw(WObject),
}

impl Runtime {
    /// Runs `method` of `class` to completion on top of the current VM
    /// stack. Nested calls (from natives, class initializers or exception
    /// constructors) stack their frames above the caller's.
    pub(crate) fn execute_method(
        &mut self,
        class: ClassId,
        method: u16,
        params: &[Var],
    ) -> Result<MethodResult> {
        let base = self.vm_stack.ptr;
        let links = self.entry_links.len();
        let result = self.run(class, method, params, base);
        if let Err(e) = &result {
            if !self.reported {
                self.record_fatal(e);
            }
        }
        self.entry_links.truncate(links);
        self.vm_stack.ptr = base;
        result
    }

    fn run(
        &mut self,
        class: ClassId,
        method: u16,
        params: &[Var],
        base: usize,
    ) -> Result<MethodResult> {
        let n = params.len();
        let link = base + n;
        if link + LINKAGE > self.vm_stack.cap {
            return Err(VmError::StackOverflow);
        }
        for (i, p) in params.iter().enumerate() {
            self.set_stack_slot(base + i, *p);
        }
        self.write_linkage(link, 0, 0, base);
        self.vm_stack.set_ptr(link + LINKAGE);
        self.entry_links.push(link);

        let mut frame = match self.push_frame(class, method, base, n, link)? {
            Callee::Bytecode(frame) => frame,
            Callee::Returned(value) => return Ok(MethodResult::Returned(value)),
            Callee::Threw(exc) => return Ok(MethodResult::Exception(exc)),
        };
        // Frames above the entry frame.
        let mut depth = 0usize;

        loop {
            let flow = match self.interpret(&mut frame) {
                Ok(flow) => flow,
                Err(e) => {
                    self.fault_pc = Some(frame.pc);
                    return Err(e);
                }
            };
            match flow {
                Flow::Invoke {
                    class,
                    method,
                    nargs,
                } => {
                    let args_at = frame.sp - nargs;
                    let link = self.vm_stack.ptr;
                    let callee = self
                        .check_link(link)
                        .and_then(|_| {
                            self.write_linkage(link, frame.pc, frame.var_base, args_at);
                            self.push_frame(class, method, args_at, nargs, link)
                        });
                    match callee {
                        Ok(Callee::Bytecode(callee)) => {
                            frame = callee;
                            depth += 1;
                        }
                        Ok(Callee::Returned(value)) => {
                            frame.sp = args_at;
                            if let Some(value) = value {
                                self.push(&mut frame, value)?;
                            }
                            frame.pc += frame.invoke_len();
                        }
                        Ok(Callee::Threw(exc)) => {
                            frame.sp = args_at;
                            if !self.unwind(&mut frame, &mut depth, exc)? {
                                return Ok(MethodResult::Exception(exc));
                            }
                        }
                        Err(e) => {
                            // The callee frame is either not there or a
                            // failed native's, which the trace should show.
                            if self.vm_stack.ptr == link {
                                self.fault_pc = Some(frame.pc);
                            }
                            return Err(e);
                        }
                    }
                }
                Flow::Return(value) => {
                    if depth == 0 {
                        return Ok(MethodResult::Returned(value));
                    }
                    frame = self.pop_frame(&frame)?;
                    depth -= 1;
                    if let Some(value) = value {
                        self.push(&mut frame, value)?;
                    }
                    frame.pc += frame.invoke_len();
                }
                Flow::Throw(exc) => {
                    if !self.unwind(&mut frame, &mut depth, exc)? {
                        return Ok(MethodResult::Exception(exc));
                    }
                }
            }
        }
    }

    fn check_link(&self, link: usize) -> Result<()> {
        if link + LINKAGE > self.vm_stack.cap {
            return Err(VmError::StackOverflow);
        }
        Ok(())
    }

    fn write_linkage(&mut self, link: usize, pc: usize, var_base: usize, caller_sp: usize) {
        self.set_stack_slot(link, Var::from_raw(pc as u32));
        self.set_stack_slot(link + 1, Var::from_raw(var_base as u32));
        self.set_stack_slot(link + 2, Var::from_raw(caller_sp as u32));
    }

    /// Builds the frame of `method` above the linkage at `link`, copying the
    /// `nargs` arguments found at `args_at`. Natives run right away.
    fn push_frame(
        &mut self,
        class: ClassId,
        method: u16,
        args_at: usize,
        nargs: usize,
        link: usize,
    ) -> Result<Callee> {
        let c = self.classes.get(class);
        let m = c
            .methods
            .get(method as usize)
            .ok_or_else(|| VmError::BadClassCode(format!("no method #{method}")))?;
        trace!("-> {}.{}{}", c.name(), c.method_name(method), c.method_desc(method));
        let returns_value = m.returns_value;
        let code = m.code.clone();
        let var_base = link + LINKAGE;

        match code {
            MethodCode::Bytecode(code) => {
                let locals = code.max_locals as usize;
                let stack_base = var_base + locals;
                let stack_limit = stack_base + code.max_stack as usize;
                let top = stack_limit + TRAILER;
                if top > self.vm_stack.cap {
                    return Err(VmError::StackOverflow);
                }
                if nargs > locals {
                    return Err(VmError::BadClassCode(format!(
                        "{} arguments for {} locals",
                        nargs, locals
                    )));
                }
                let bytes = c.pool.bytes().clone();
                for i in 0..nargs {
                    let arg = self.stack_slot(args_at + i);
                    self.set_stack_slot(var_base + i, arg);
                }
                for i in var_base + nargs..stack_limit {
                    self.set_stack_slot(i, Var::ZERO);
                }
                self.set_stack_slot(stack_limit, Var::from_raw(stack_base as u32));
                self.set_stack_slot(stack_limit + 1, Var::from_raw(method as u32));
                self.set_stack_slot(stack_limit + 2, Var::from_raw(class.0 as u32));
                self.vm_stack.set_ptr(top);
                Ok(Callee::Bytecode(Frame {
                    class,
                    method,
                    code: bytes,
                    code_start: code.start,
                    code_len: code.len,
                    var_base,
                    stack_base,
                    stack_limit,
                    sp: stack_base,
                    pc: 0,
                }))
            }
            MethodCode::Native(func) => {
                let top = var_base + nargs + NATIVE_TRAILER;
                if top > self.vm_stack.cap {
                    return Err(VmError::StackOverflow);
                }
                for i in 0..nargs {
                    let arg = self.stack_slot(args_at + i);
                    self.set_stack_slot(var_base + i, arg);
                }
                let trailer = var_base + nargs;
                self.set_stack_slot(trailer, Var::from_raw(nargs as u32));
                self.set_stack_slot(trailer + 1, Var::from_raw(var_base as u32));
                self.set_stack_slot(trailer + 2, Var::from_raw(method as u32));
                self.set_stack_slot(trailer + 3, Var::from_raw(class.0 as u32));
                self.vm_stack.set_ptr(top);

                self.set_native_result(Var::ZERO);
                let ret = func(self, NativeArgs::new(var_base, nargs));
                if ret < 0 {
                    return Err(VmError::NativeErrorReturn(ret));
                }
                let callee = if ret == 0 {
                    let result = self.take_native_result();
                    Callee::Returned(returns_value.then_some(result))
                } else {
                    let code = u16::try_from(ret)
                        .ok()
                        .and_then(ErrorCode::from_u16)
                        .unwrap_or(ErrorCode::Unknown);
                    Callee::Threw(self.create_runtime_exception(code)?)
                };
                self.vm_stack.ptr = link;
                Ok(callee)
            }
            MethodCode::None => Err(VmError::BadClassCode(format!(
                "{}.{}{} has no code",
                c.name(),
                c.method_name(method),
                c.method_desc(method)
            ))),
        }
    }

    /// Drops `frame` and returns its caller, positioned at the invoke.
    fn pop_frame(&mut self, frame: &Frame) -> Result<Frame> {
        let link = frame.var_base - LINKAGE;
        let pc = self.stack_slot(link).raw() as usize;
        let var_base = self.stack_slot(link + 1).raw() as usize;
        let caller_sp = self.stack_slot(link + 2).raw() as usize;
        self.vm_stack.ptr = link;

        let class = ClassId(self.stack_slot(link - 1).raw() as u16);
        let method = self.stack_slot(link - 2).raw() as u16;
        let stack_base = self.stack_slot(link - 3).raw() as usize;
        let c = self.classes.get(class);
        let code = c
            .methods
            .get(method as usize)
            .and_then(|m| m.code_attr())
            .ok_or_else(|| VmError::BadClassCode(format!("no caller frame at {link}")))?;
        trace!("<- {}.{}{}", c.name(), c.method_name(method), c.method_desc(method));
        Ok(Frame {
            class,
            method,
            code: c.pool.bytes().clone(),
            code_start: code.start,
            code_len: code.len,
            var_base,
            stack_base,
            stack_limit: stack_base + code.max_stack as usize,
            sp: caller_sp,
            pc,
        })
    }

    /// Looks for a handler of `exc`, popping frames until one is found.
    /// Returns false when the exception escapes the entry frame.
    fn unwind(&mut self, frame: &mut Frame, depth: &mut usize, exc: WObject) -> Result<bool> {
        self.pinned(exc, |rt| loop {
            if let Some(handler) = rt.find_handler(frame, exc)? {
                frame.sp = frame.stack_base;
                rt.push(frame, Var::from_obj(exc))?;
                frame.pc = handler;
                return Ok(true);
            }
            if *depth == 0 {
                return Ok(false);
            }
            *frame = rt.pop_frame(frame)?;
            *depth -= 1;
        })
    }

    fn find_handler(&mut self, frame: &Frame, exc: WObject) -> Result<Option<usize>> {
        let handlers = self.classes.get(frame.class).methods[frame.method as usize]
            .handlers
            .clone();
        for h in handlers {
            if frame.pc < h.start_pc as usize || frame.pc >= h.end_pc as usize {
                continue;
            }
            if h.catch_type == 0 || self.is_instance(exc, frame.class, h.catch_type)? {
                return Ok(Some(h.handler_pc as usize));
            }
        }
        Ok(None)
    }

    // Operand stack and locals

    fn push(&mut self, frame: &mut Frame, value: Var) -> Result<()> {
        if frame.sp >= frame.stack_limit {
            return Err(VmError::BadClassCode(format!(
                "operand stack overflow at pc {}",
                frame.pc
            )));
        }
        self.set_stack_slot(frame.sp, value);
        frame.sp += 1;
        Ok(())
    }

    fn push_int(&mut self, frame: &mut Frame, value: i32) -> Result<()> {
        self.push(frame, Var::from_int(value))
    }

    fn pop(&self, frame: &mut Frame) -> Result<Var> {
        if frame.sp <= frame.stack_base {
            return Err(VmError::BadClassCode(format!(
                "operand stack underflow at pc {}",
                frame.pc
            )));
        }
        frame.sp -= 1;
        Ok(self.stack_slot(frame.sp))
    }

    fn pop_int(&self, frame: &mut Frame) -> Result<i32> {
        Ok(self.pop(frame)?.int())
    }

    fn pop_obj(&self, frame: &mut Frame) -> Result<WObject> {
        Ok(self.pop(frame)?.obj())
    }

    /// Operand `depth` slots below the top, 0 being the top.
    fn peek(&self, frame: &Frame, depth: usize) -> Result<Var> {
        if frame.sp < frame.stack_base + depth + 1 {
            return Err(VmError::BadClassCode(format!(
                "operand stack underflow at pc {}",
                frame.pc
            )));
        }
        Ok(self.stack_slot(frame.sp - depth - 1))
    }

    fn local(&self, frame: &Frame, i: usize) -> Result<Var> {
        if i >= frame.max_locals() {
            return Err(VmError::BadClassCode(format!("local {i} at pc {}", frame.pc)));
        }
        Ok(self.stack_slot(frame.var_base + i))
    }

    fn set_local(&mut self, frame: &Frame, i: usize, value: Var) -> Result<()> {
        if i >= frame.max_locals() {
            return Err(VmError::BadClassCode(format!("local {i} at pc {}", frame.pc)));
        }
        self.set_stack_slot(frame.var_base + i, value);
        Ok(())
    }

    fn raise(&mut self, code: ErrorCode) -> Result<Flow> {
        Ok(Flow::Throw(self.create_runtime_exception(code)?))
    }

    // Constant pool references

    fn member_ref(&self, class: ClassId, idx: u16) -> (u16, Vec<u8>, Vec<u8>) {
        let (class_idx, name, desc) = self.classes.get(class).pool.member_ref(idx);
        (class_idx, name.to_vec(), desc.to_vec())
    }

    fn resolve_field(&mut self, class: ClassId, idx: u16) -> Result<(ClassId, u16)> {
        let (class_idx, name, desc) = self.member_ref(class, idx);
        let target = self.class_by_index(class, class_idx)?;
        self.classes
            .find_field(target, &name, &desc)
            .ok_or_else(|| VmError::FieldNotFound {
                class: self.classes.get(target).name().into_owned(),
                name: String::from_utf8_lossy(&name).into_owned(),
                desc: String::from_utf8_lossy(&desc).into_owned(),
            })
    }

    fn instance_slot(&self, owner: ClassId, field: u16) -> Result<usize> {
        match self.classes.get(owner).fields[field as usize].var {
            FieldVar::Instance(slot) => Ok(slot as usize),
            FieldVar::Static(_) => Err(VmError::BadClassCode("static field used as instance field".into())),
        }
    }

    fn find_method(&self, class: ClassId, name: &[u8], desc: &[u8]) -> Result<(ClassId, u16)> {
        self.classes
            .find_method(class, name, desc, true)
            .ok_or_else(|| VmError::MethodNotFound {
                class: self.classes.get(class).name().into_owned(),
                name: String::from_utf8_lossy(name).into_owned(),
                desc: String::from_utf8_lossy(desc).into_owned(),
            })
    }

    /// Array operand checks shared by the element loads and stores. Returns
    /// the element type, or the exception to throw.
    fn check_array(&mut self, array: WObject, index: i32) -> Result<std::result::Result<u8, ErrorCode>> {
        if array.is_null() {
            return Ok(Err(ErrorCode::NullArrayAccess));
        }
        let (Some(ty), Some(len)) = (self.array_type(array), self.array_len(array)) else {
            return Err(VmError::NotArray);
        };
        if index < 0 || index >= len {
            return Ok(Err(ErrorCode::IndexOutOfRange));
        }
        Ok(Ok(ty))
    }

    /// Executes instructions of `f` until it calls, returns or throws.
    fn interpret(&mut self, f: &mut Frame) -> Result<Flow> {
        loop {
            let opcode = f.u8(0)?;
            match OPCode::from(opcode) {
                OPCode::NOP => f.pc += 1,
                OPCode::AconstNull => {
                    self.push(f, Var::ZERO)?;
                    f.pc += 1;
                }
                OPCode::IconstM1
                | OPCode::Iconst0
                | OPCode::Iconst1
                | OPCode::Iconst2
                | OPCode::Iconst3
                | OPCode::Iconst4
                | OPCode::Iconst5 => {
                    self.push_int(f, opcode as i32 - 3)?;
                    f.pc += 1;
                }
                OPCode::Bipush => {
                    let value = f.i8(1)? as i32;
                    self.push_int(f, value)?;
                    f.pc += 2;
                }
                OPCode::Sipush => {
                    let value = f.i16(1)? as i32;
                    self.push_int(f, value)?;
                    f.pc += 3;
                }
                OPCode::Ldc | OPCode::LdcW => {
                    let (idx, len) = if opcode == 0x12 {
                        (f.u8(1)? as u16, 2)
                    } else {
                        (f.u16(1)?, 3)
                    };
                    let value = self.constant_to_var(f.class, idx)?;
                    self.push(f, value)?;
                    f.pc += len;
                }
                OPCode::Iload | OPCode::Aload => {
                    let value = self.local(f, f.u8(1)? as usize)?;
                    self.push(f, value)?;
                    f.pc += 2;
                }
                OPCode::Iload0 | OPCode::Iload1 | OPCode::Iload2 | OPCode::Iload3 => {
                    let value = self.local(f, (opcode - 0x1a) as usize)?;
                    self.push(f, value)?;
                    f.pc += 1;
                }
                OPCode::Aload0 | OPCode::Aload1 | OPCode::Aload2 | OPCode::Aload3 => {
                    let value = self.local(f, (opcode - 0x2a) as usize)?;
                    self.push(f, value)?;
                    f.pc += 1;
                }
                OPCode::Istore | OPCode::Astore => {
                    let value = self.pop(f)?;
                    self.set_local(f, f.u8(1)? as usize, value)?;
                    f.pc += 2;
                }
                OPCode::Istore0 | OPCode::Istore1 | OPCode::Istore2 | OPCode::Istore3 => {
                    let value = self.pop(f)?;
                    self.set_local(f, (opcode - 0x3b) as usize, value)?;
                    f.pc += 1;
                }
                OPCode::Astore0 | OPCode::Astore1 | OPCode::Astore2 | OPCode::Astore3 => {
                    let value = self.pop(f)?;
                    self.set_local(f, (opcode - 0x4b) as usize, value)?;
                    f.pc += 1;
                }
                OPCode::Iaload
                | OPCode::Aaload
                | OPCode::Baload
                | OPCode::Caload
                | OPCode::Saload => {
                    let index = self.pop_int(f)?;
                    let array = self.pop_obj(f)?;
                    let ty = match self.check_array(array, index)? {
                        Ok(ty) => ty,
                        Err(code) => return self.raise(code),
                    };
                    let reference = opcode == 0x32;
                    if reference != array_type::is_reference(ty) {
                        return self.raise(ErrorCode::ArrayStore);
                    }
                    let value = self.array_get(array, index).ok_or(VmError::NotArray)?;
                    self.push(f, value)?;
                    f.pc += 1;
                }
                OPCode::Iastore
                | OPCode::Aastore
                | OPCode::Bastore
                | OPCode::Castore
                | OPCode::Sastore => {
                    let value = self.pop(f)?;
                    let index = self.pop_int(f)?;
                    let array = self.pop_obj(f)?;
                    let ty = match self.check_array(array, index)? {
                        Ok(ty) => ty,
                        Err(code) => return self.raise(code),
                    };
                    let reference = opcode == 0x53;
                    if reference != array_type::is_reference(ty) {
                        return self.raise(ErrorCode::ArrayStore);
                    }
                    self.array_set(array, index, value);
                    f.pc += 1;
                }
                OPCode::Pop => {
                    self.pop(f)?;
                    f.pc += 1;
                }
                OPCode::Pop2 => {
                    self.pop(f)?;
                    self.pop(f)?;
                    f.pc += 1;
                }
                OPCode::Dup => {
                    let v1 = self.peek(f, 0)?;
                    self.push(f, v1)?;
                    f.pc += 1;
                }
                OPCode::DupX1 => {
                    let v1 = self.pop(f)?;
                    let v2 = self.pop(f)?;
                    for v in [v1, v2, v1] {
                        self.push(f, v)?;
                    }
                    f.pc += 1;
                }
                OPCode::DupX2 => {
                    let v1 = self.pop(f)?;
                    let v2 = self.pop(f)?;
                    let v3 = self.pop(f)?;
                    for v in [v1, v3, v2, v1] {
                        self.push(f, v)?;
                    }
                    f.pc += 1;
                }
                OPCode::Dup2 => {
                    let v1 = self.pop(f)?;
                    let v2 = self.pop(f)?;
                    for v in [v2, v1, v2, v1] {
                        self.push(f, v)?;
                    }
                    f.pc += 1;
                }
                OPCode::Dup2X1 => {
                    let v1 = self.pop(f)?;
                    let v2 = self.pop(f)?;
                    let v3 = self.pop(f)?;
                    for v in [v2, v1, v3, v2, v1] {
                        self.push(f, v)?;
                    }
                    f.pc += 1;
                }
                OPCode::Dup2X2 => {
                    let v1 = self.pop(f)?;
                    let v2 = self.pop(f)?;
                    let v3 = self.pop(f)?;
                    let v4 = self.pop(f)?;
                    for v in [v2, v1, v4, v3, v2, v1] {
                        self.push(f, v)?;
                    }
                    f.pc += 1;
                }
                OPCode::Swap => {
                    let v1 = self.pop(f)?;
                    let v2 = self.pop(f)?;
                    self.push(f, v1)?;
                    self.push(f, v2)?;
                    f.pc += 1;
                }
                OPCode::Iadd
                | OPCode::Isub
                | OPCode::Imul
                | OPCode::Idiv
                | OPCode::Irem
                | OPCode::Ishl
                | OPCode::Ishr
                | OPCode::Iushr
                | OPCode::Iand
                | OPCode::Ior
                | OPCode::Ixor => {
                    let b = self.pop_int(f)?;
                    let a = self.pop_int(f)?;
                    let value = match OPCode::from(opcode) {
                        OPCode::Iadd => a.wrapping_add(b),
                        OPCode::Isub => a.wrapping_sub(b),
                        OPCode::Imul => a.wrapping_mul(b),
                        OPCode::Idiv | OPCode::Irem if b == 0 => {
                            return self.raise(ErrorCode::DivideByZero);
                        }
                        OPCode::Idiv => a.wrapping_div(b),
                        OPCode::Irem => a.wrapping_rem(b),
                        OPCode::Ishl => a.wrapping_shl(b as u32),
                        OPCode::Ishr => a.wrapping_shr(b as u32),
                        OPCode::Iushr => (a as u32).wrapping_shr(b as u32) as i32,
                        OPCode::Iand => a & b,
                        OPCode::Ior => a | b,
                        _ => a ^ b,
                    };
                    self.push_int(f, value)?;
                    f.pc += 1;
                }
                OPCode::Ineg => {
                    let a = self.pop_int(f)?;
                    self.push_int(f, a.wrapping_neg())?;
                    f.pc += 1;
                }
                OPCode::Iinc => {
                    let i = f.u8(1)? as usize;
                    let delta = f.i8(2)? as i32;
                    let value = self.local(f, i)?.int().wrapping_add(delta);
                    self.set_local(f, i, Var::from_int(value))?;
                    f.pc += 3;
                }
                OPCode::I2b | OPCode::I2c | OPCode::I2s => {
                    let a = self.pop_int(f)?;
                    let value = match opcode {
                        0x91 => a as i8 as i32,
                        0x92 => a as u16 as i32,
                        _ => a as i16 as i32,
                    };
                    self.push_int(f, value)?;
                    f.pc += 1;
                }
                OPCode::Ifeq
                | OPCode::Ifne
                | OPCode::Iflt
                | OPCode::Ifge
                | OPCode::Ifgt
                | OPCode::Ifle => {
                    let a = self.pop_int(f)?;
                    let taken = match opcode {
                        0x99 => a == 0,
                        0x9a => a != 0,
                        0x9b => a < 0,
                        0x9c => a >= 0,
                        0x9d => a > 0,
                        _ => a <= 0,
                    };
                    self.branch(f, taken)?;
                }
                OPCode::IfIcmpeq
                | OPCode::IfIcmpne
                | OPCode::IfIcmplt
                | OPCode::IfIcmpge
                | OPCode::IfIcmpgt
                | OPCode::IfIcmple => {
                    let b = self.pop_int(f)?;
                    let a = self.pop_int(f)?;
                    let taken = match opcode {
                        0x9f => a == b,
                        0xa0 => a != b,
                        0xa1 => a < b,
                        0xa2 => a >= b,
                        0xa3 => a > b,
                        _ => a <= b,
                    };
                    self.branch(f, taken)?;
                }
                OPCode::IfAcmpeq | OPCode::IfAcmpne => {
                    let b = self.pop(f)?;
                    let a = self.pop(f)?;
                    self.branch(f, (a == b) == (opcode == 0xa5))?;
                }
                OPCode::Ifnull | OPCode::Ifnonnull => {
                    let a = self.pop_obj(f)?;
                    self.branch(f, a.is_null() == (opcode == 0xc6))?;
                }
                OPCode::Goto => f.jump(f.i16(1)? as i32)?,
                OPCode::GotoW => f.jump(f.i32(1)?)?,
                OPCode::Jsr => {
                    let next = (f.pc + 3) as i32;
                    self.push_int(f, next)?;
                    f.jump(f.i16(1)? as i32)?;
                }
                OPCode::JsrW => {
                    let next = (f.pc + 5) as i32;
                    self.push_int(f, next)?;
                    f.jump(f.i32(1)?)?;
                }
                OPCode::Ret => {
                    let target = self.local(f, f.u8(1)? as usize)?.int();
                    f.set_pc(target as i64)?;
                }
                OPCode::Tableswitch => {
                    let key = self.pop_int(f)?;
                    let at = (f.pc + 4) & !3;
                    let default = f.word_at(at)?;
                    let low = f.word_at(at + 4)?;
                    let high = f.word_at(at + 8)?;
                    let offset = if key < low || key > high {
                        default
                    } else {
                        f.word_at(at + 12 + (key as i64 - low as i64) as usize * 4)?
                    };
                    f.jump(offset)?;
                }
                OPCode::Lookupswitch => {
                    let key = self.pop_int(f)?;
                    let at = (f.pc + 4) & !3;
                    let default = f.word_at(at)?;
                    let pairs = f.word_at(at + 4)?;
                    if pairs < 0 {
                        return Err(bad_code(f.pc));
                    }
                    let (mut lo, mut hi) = (0usize, pairs as usize);
                    let mut offset = default;
                    while lo < hi {
                        let mid = (lo + hi) / 2;
                        let pair = at + 8 + mid * 8;
                        let matched = f.word_at(pair)?;
                        if key == matched {
                            offset = f.word_at(pair + 4)?;
                            break;
                        } else if key < matched {
                            hi = mid;
                        } else {
                            lo = mid + 1;
                        }
                    }
                    f.jump(offset)?;
                }
                OPCode::Ireturn | OPCode::Areturn => {
                    let value = self.pop(f)?;
                    return Ok(Flow::Return(Some(value)));
                }
                OPCode::Return => return Ok(Flow::Return(None)),
                OPCode::Getstatic | OPCode::Putstatic => {
                    let (owner, field) = self.resolve_field(f.class, f.u16(1)?)?;
                    if opcode == 0xb2 {
                        let value = self.static_var(owner, field).ok_or_else(|| {
                            VmError::BadClassCode("instance field used as static field".into())
                        })?;
                        self.push(f, value)?;
                    } else {
                        let value = self.pop(f)?;
                        if !self.set_static_var(owner, field, value) {
                            return Err(VmError::BadClassCode(
                                "instance field used as static field".into(),
                            ));
                        }
                    }
                    f.pc += 3;
                }
                OPCode::Getfield => {
                    let (owner, field) = self.resolve_field(f.class, f.u16(1)?)?;
                    let slot = self.instance_slot(owner, field)?;
                    let obj = self.pop_obj(f)?;
                    if obj.is_null() {
                        return self.raise(ErrorCode::NullObjectAccess);
                    }
                    let value = self.object_var(obj, slot).ok_or_else(|| bad_code(f.pc))?;
                    self.push(f, value)?;
                    f.pc += 3;
                }
                OPCode::Putfield => {
                    let (owner, field) = self.resolve_field(f.class, f.u16(1)?)?;
                    let slot = self.instance_slot(owner, field)?;
                    let value = self.pop(f)?;
                    let obj = self.pop_obj(f)?;
                    if obj.is_null() {
                        return self.raise(ErrorCode::NullObjectAccess);
                    }
                    if !self.set_object_var(obj, slot, value) {
                        return Err(bad_code(f.pc));
                    }
                    f.pc += 3;
                }
                OPCode::Invokevirtual
                | OPCode::Invokespecial
                | OPCode::Invokestatic
                | OPCode::Invokeinterface => {
                    if let Some(flow) = self.invoke(f, opcode)? {
                        return Ok(flow);
                    }
                }
                OPCode::New => {
                    let class = self.class_by_index(f.class, f.u16(1)?)?;
                    let obj = self.create_object(class)?;
                    self.push(f, Var::from_obj(obj))?;
                    f.pc += 3;
                }
                OPCode::Newarray => {
                    let ty = f.u8(1)?;
                    if array_type::element_size(ty).is_none() {
                        return Err(bad_code(f.pc));
                    }
                    let len = self.pop_int(f)?;
                    if len < 0 {
                        return self.raise(ErrorCode::NegativeArraySize);
                    }
                    let array = self.create_array(ty, len)?;
                    self.push(f, Var::from_obj(array))?;
                    f.pc += 2;
                }
                OPCode::Anewarray => {
                    let idx = f.u16(1)?;
                    let ty = {
                        let pool = &self.classes.get(f.class).pool;
                        if pool.utf8(pool.name_index(idx)).first() == Some(&b'[') {
                            array_type::ARRAY
                        } else {
                            array_type::OBJECT
                        }
                    };
                    let len = self.pop_int(f)?;
                    if len < 0 {
                        return self.raise(ErrorCode::NegativeArraySize);
                    }
                    let array = self.create_array(ty, len)?;
                    self.push(f, Var::from_obj(array))?;
                    f.pc += 3;
                }
                OPCode::Multianewarray => {
                    let idx = f.u16(1)?;
                    let ndim = f.u8(3)? as usize;
                    if ndim == 0 {
                        return Err(bad_code(f.pc));
                    }
                    let desc = {
                        let pool = &self.classes.get(f.class).pool;
                        pool.utf8(pool.name_index(idx)).to_vec()
                    };
                    let mut dims = vec![0; ndim];
                    for dim in dims.iter_mut().rev() {
                        *dim = self.pop_int(f)?;
                    }
                    if dims.iter().any(|d| *d < 0) {
                        return self.raise(ErrorCode::NegativeArraySize);
                    }
                    let array = self.create_multi_array(&desc, &dims)?;
                    self.push(f, Var::from_obj(array))?;
                    f.pc += 4;
                }
                OPCode::Arraylength => {
                    let array = self.pop_obj(f)?;
                    if array.is_null() {
                        return self.raise(ErrorCode::NullArrayAccess);
                    }
                    let len = self.array_len(array).ok_or(VmError::NotArray)?;
                    self.push_int(f, len)?;
                    f.pc += 1;
                }
                OPCode::Athrow => {
                    let exc = self.pop_obj(f)?;
                    if exc.is_null() {
                        return self.raise(ErrorCode::NullObjectAccess);
                    }
                    return Ok(Flow::Throw(exc));
                }
                OPCode::Checkcast => {
                    let obj = self.peek(f, 0)?.obj();
                    if !obj.is_null() && !self.is_instance(obj, f.class, f.u16(1)?)? {
                        return self.raise(ErrorCode::ClassCast);
                    }
                    f.pc += 3;
                }
                OPCode::Instanceof => {
                    let obj = self.pop_obj(f)?;
                    let is = self.is_instance(obj, f.class, f.u16(1)?)?;
                    self.push_int(f, is as i32)?;
                    f.pc += 3;
                }
                OPCode::Monitorenter | OPCode::Monitorexit => {
                    self.pop(f)?;
                    f.pc += 1;
                }
                OPCode::Wide => {
                    let i = f.u16(2)? as usize;
                    match OPCode::from(f.u8(1)?) {
                        OPCode::Iload | OPCode::Aload => {
                            let value = self.local(f, i)?;
                            self.push(f, value)?;
                            f.pc += 4;
                        }
                        OPCode::Istore | OPCode::Astore => {
                            let value = self.pop(f)?;
                            self.set_local(f, i, value)?;
                            f.pc += 4;
                        }
                        OPCode::Iinc => {
                            let delta = f.i16(4)? as i32;
                            let value = self.local(f, i)?.int().wrapping_add(delta);
                            self.set_local(f, i, Var::from_int(value))?;
                            f.pc += 6;
                        }
                        OPCode::Ret => {
                            let target = self.local(f, i)?.int();
                            f.set_pc(target as i64)?;
                        }
                        _ => return Err(VmError::BadOpcode(f.u8(1)?)),
                    }
                }
                _ => return Err(VmError::BadOpcode(opcode)),
            }
        }
    }

    fn branch(&mut self, f: &mut Frame, taken: bool) -> Result<()> {
        if taken {
            f.jump(f.i16(1)? as i32)
        } else {
            f.pc += 3;
            Ok(())
        }
    }

    /// Resolves an invoke instruction. The frame keeps pointing at it until
    /// the callee returns. `None` means the call was elided.
    fn invoke(&mut self, f: &mut Frame, opcode: u8) -> Result<Option<Flow>> {
        let (class_idx, name, desc) = self.member_ref(f.class, f.u16(1)?);
        let target = self.class_by_index(f.class, class_idx)?;
        let op = OPCode::from(opcode);

        let (owner, method, nargs) = if op == OPCode::Invokeinterface {
            (target, 0, f.u8(3)? as usize)
        } else {
            let (owner, method) = self.find_method(target, &name, &desc)?;
            let m = &self.classes.get(owner).methods[method as usize];
            let receiver = usize::from(op != OPCode::Invokestatic);
            if op == OPCode::Invokespecial
                && m.is_init
                && self.classes.get(owner).super_classes.is_empty()
            {
                // The root constructor has nothing to do.
                for _ in 0..m.num_params as usize + receiver {
                    self.pop(f)?;
                }
                f.pc += 3;
                return Ok(None);
            }
            (owner, method, m.num_params as usize + receiver)
        };
        if op == OPCode::Invokestatic {
            if f.sp < f.stack_base + nargs {
                return Err(bad_code(f.pc));
            }
            return Ok(Some(Flow::Invoke {
                class: owner,
                method,
                nargs,
            }));
        }

        let receiver = self.receiver(f, nargs)?;
        if receiver.is_null() {
            return self.raise(ErrorCode::NullObjectAccess).map(Some);
        }
        let (class, method) = match (op, self.class_of(receiver)) {
            (OPCode::Invokespecial, _) => (owner, method),
            (_, Some(class)) => self.find_method(class, &name, &desc)?,
            (OPCode::Invokeinterface, None) => self.find_method(target, &name, &desc)?,
            (_, None) => (owner, method),
        };
        Ok(Some(Flow::Invoke {
            class,
            method,
            nargs,
        }))
    }

    fn receiver(&self, f: &Frame, nargs: usize) -> Result<WObject> {
        if nargs == 0 {
            return Err(bad_code(f.pc));
        }
        Ok(self.peek(f, nargs - 1)?.obj())
    }
}
