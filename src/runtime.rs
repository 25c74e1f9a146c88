//! The VM context.
//!
//! A `Runtime` owns the arena and everything carved out of it: the VM
//! stack, the stack of pinned handles, the class budget and the object
//! heap. There is no global state, so independent runtimes can coexist.
use std::fmt;
use std::io::{self, Write};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error, info, warn};

use crate::arena::{
    Arena, BlockRef, CLASS_HEAP_TAG, NATIVE_STACK_TAG, OBJECT_HEAP_TAG, VM_STACK_TAG,
};
use crate::config::VmConfig;
use crate::error::{ErrorCode, Result, Severity, VmError, VmStatus};
use crate::heap::{self, array_size, GcStats, HeapLayout, ObjectHeap, ARRAY_HEADER};
use crate::interpreter::MethodResult;
use crate::natives::{ClassHook, NativeMethodDef, NativeRegistry};
use crate::program::{ClassId, ClassTable, FieldVar};
use crate::provider::{ClassProvider, ProviderChain};
use crate::trace::StackTrace;
use crate::value::{array_type, Var, WObject};

pub const OBJECT_CLASS: &str = "java/lang/Object";
pub const STRING_CLASS: &str = "java/lang/String";
const EXCEPTION_CLASS: &str = "java/lang/Exception";
const MAIN_DESC: &[u8] = b"([Ljava/lang/String;)V";

/// Exception classes thrown for catchable error codes.
const RUNTIME_EXCEPTIONS: [(ErrorCode, &str); 9] = [
    (ErrorCode::NullObjectAccess, "java/lang/NullPointerException"),
    (ErrorCode::NullArrayAccess, "java/lang/NullPointerException"),
    (ErrorCode::IndexOutOfRange, "java/lang/ArrayIndexOutOfBoundsException"),
    (ErrorCode::DivideByZero, "java/lang/ArithmeticException"),
    (ErrorCode::ClassCast, "java/lang/ClassCastException"),
    (ErrorCode::NegativeArraySize, "java/lang/NegativeArraySizeException"),
    (ErrorCode::ArrayStore, "java/lang/ArrayStoreException"),
    (ErrorCode::CantFindClass, "java/lang/ClassNotFoundException"),
    (ErrorCode::Unknown, "java/lang/RuntimeException"),
];

/// Class of the exception thrown for `code`.
pub fn exception_class(code: ErrorCode) -> &'static str {
    RUNTIME_EXCEPTIONS
        .iter()
        .find(|(c, _)| *c == code)
        .map_or("java/lang/RuntimeException", |(_, name)| name)
}

/// Fixed capacity stack of 32 bit slots inside an arena block.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SlotStack {
    pub(crate) block: BlockRef,
    pub(crate) cap: usize,
    pub(crate) ptr: usize,
    pub(crate) max: usize,
}

impl SlotStack {
    fn new(block: BlockRef, bytes: usize) -> Self {
        Self {
            block,
            cap: bytes / 4,
            ptr: 0,
            max: 0,
        }
    }

    pub(crate) fn set_ptr(&mut self, ptr: usize) {
        self.ptr = ptr;
        self.max = self.max.max(ptr);
    }
}

/// Memory usage snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemInfo {
    pub object_heap_total: usize,
    pub object_heap_unused: usize,
    pub live_objects: usize,
    pub class_heap_total: usize,
    pub class_heap_used: usize,
    pub loaded_classes: usize,
    pub vm_stack_slots: usize,
    pub vm_stack_ptr: usize,
    pub vm_stack_max: usize,
    pub native_stack_slots: usize,
    pub native_stack_ptr: usize,
    pub native_stack_max: usize,
    pub arena_total: usize,
    pub arena_used: usize,
}

impl fmt::Display for MemInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "object heap:  {} bytes, {} unused, {} live objects",
            self.object_heap_total, self.object_heap_unused, self.live_objects
        )?;
        writeln!(
            f,
            "class heap:   {} bytes, {} used by {} classes",
            self.class_heap_total, self.class_heap_used, self.loaded_classes
        )?;
        writeln!(
            f,
            "vm stack:     {} slots, ptr {}, max {}",
            self.vm_stack_slots, self.vm_stack_ptr, self.vm_stack_max
        )?;
        writeln!(
            f,
            "native stack: {} slots, ptr {}, max {}",
            self.native_stack_slots, self.native_stack_ptr, self.native_stack_max
        )?;
        write!(f, "arena:        {} bytes, {} used", self.arena_total, self.arena_used)
    }
}

/// Assembles a `Runtime`.
pub struct RuntimeBuilder {
    config: VmConfig,
    provider: Option<Box<dyn ClassProvider>>,
    natives: Vec<NativeMethodDef>,
    hooks: Vec<ClassHook>,
    output: Option<Box<dyn Write>>,
    inout: Option<Vec<u8>>,
}

impl RuntimeBuilder {
    pub fn new(config: VmConfig) -> Self {
        Self {
            config,
            provider: None,
            natives: Vec::new(),
            hooks: Vec::new(),
            output: None,
            inout: None,
        }
    }

    pub fn provider(mut self, provider: impl ClassProvider + 'static) -> Self {
        self.provider = Some(Box::new(provider));
        self
    }

    /// Adds a native on top of the framework natives, replacing one with
    /// the same signature.
    pub fn native(mut self, def: NativeMethodDef) -> Self {
        self.natives.push(def);
        self
    }

    pub fn hook(mut self, hook: ClassHook) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Where `System.print` and stack traces go. Defaults to stdout.
    pub fn output(mut self, output: impl Write + 'static) -> Self {
        self.output = Some(Box::new(output));
        self
    }

    pub fn inout_buffer(mut self, buffer: Vec<u8>) -> Self {
        self.inout = Some(buffer);
        self
    }

    pub fn build(self) -> Result<Runtime> {
        let config = self.config;
        config.validate()?;

        let mut arena = Arena::new();
        arena.initialize(vec![0; config.arena_bytes])?;
        let mut carve = |size: usize, tag| {
            arena
                .allocate(size, tag)
                .ok_or(VmError::CantAllocateMemory(size))
        };
        let vm_block = carve(config.vm_stack_bytes, VM_STACK_TAG)?;
        let native_block = carve(config.native_stack_bytes, NATIVE_STACK_TAG)?;
        let class_block = carve(config.class_heap_bytes.max(1), CLASS_HEAP_TAG)?;
        let heap_block = carve(config.object_heap_bytes, OBJECT_HEAP_TAG)?;
        let class_heap = arena.block_size(class_block);

        let natives = NativeRegistry::with_framework(self.natives)?;
        let provider = self
            .provider
            .unwrap_or_else(|| Box::new(ProviderChain::new()));
        let output = self.output.unwrap_or_else(|| Box::new(io::stdout()));

        debug!(
            "runtime created: vm stack {} bytes, native stack {} bytes, class heap {} bytes, object heap {} bytes",
            config.vm_stack_bytes,
            config.native_stack_bytes,
            config.class_heap_bytes,
            config.object_heap_bytes
        );
        Ok(Runtime {
            vm_stack: SlotStack::new(vm_block, config.vm_stack_bytes),
            pins: SlotStack::new(native_block, config.native_stack_bytes),
            class_block,
            heap_block,
            heap: ObjectHeap::new(config.object_heap_bytes),
            classes: ClassTable::new(class_heap),
            config,
            arena,
            provider,
            natives,
            hooks: self.hooks,
            output,
            inout: self.inout,
            status: VmStatus::default(),
            reported: false,
            deferred: None,
            fault_pc: None,
            native_result: Var::ZERO,
            entry_links: Vec::new(),
            string_class: None,
            shut_down: false,
        })
    }
}

/// A complete virtual machine.
pub struct Runtime {
    config: VmConfig,
    arena: Arena,
    pub(crate) vm_stack: SlotStack,
    pub(crate) pins: SlotStack,
    class_block: BlockRef,
    heap_block: BlockRef,
    heap: ObjectHeap,
    pub(crate) classes: ClassTable,
    pub(crate) provider: Box<dyn ClassProvider>,
    pub(crate) natives: NativeRegistry,
    pub(crate) hooks: Vec<ClassHook>,
    output: Box<dyn Write>,
    inout: Option<Vec<u8>>,
    status: VmStatus,
    /// Set once the current failure has been logged with its stack trace.
    pub(crate) reported: bool,
    /// First fatal error recorded during the current host call.
    deferred: Option<(ErrorCode, String)>,
    /// Pc of the innermost bytecode frame when an error left it.
    pub(crate) fault_pc: Option<usize>,
    native_result: Var,
    /// Linkage slot of every frame entered from host code, innermost last.
    pub(crate) entry_links: Vec<usize>,
    string_class: Option<ClassId>,
    shut_down: bool,
}

impl Runtime {
    pub fn new(config: VmConfig, provider: impl ClassProvider + 'static) -> Result<Self> {
        RuntimeBuilder::new(config).provider(provider).build()
    }

    pub fn builder(config: VmConfig) -> RuntimeBuilder {
        RuntimeBuilder::new(config)
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn classes(&self) -> &ClassTable {
        &self.classes
    }

    pub fn status(&self) -> VmStatus {
        self.status
    }

    pub fn reset_error(&mut self) {
        self.status = VmStatus::default();
        self.reported = false;
        self.deferred = None;
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Runs `f` as a call from host code. Failures of the outermost call
    /// are recorded in the status unless a nested call already did. A fatal
    /// error recorded by a nested call fails the outermost call even when
    /// the code in between carried on.
    pub(crate) fn host_call<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.shut_down {
            return Err(VmError::ParamError("runtime is shut down"));
        }
        let outermost = self.entry_links.is_empty();
        if !outermost {
            return f(self);
        }
        self.reported = false;
        self.deferred = None;
        let result = f(self);
        if let Err(e) = &result {
            if !self.reported {
                self.record_fatal(e);
            }
        }
        match (result, self.deferred.take()) {
            (Ok(_), Some((code, message))) => Err(VmError::Deferred { code, message }),
            (result, _) => result,
        }
    }

    /// Records a fatal error and logs it with the current stack trace.
    pub(crate) fn record_fatal(&mut self, err: &VmError) {
        self.status = VmStatus {
            code: err.code(),
            severity: Severity::Fatal,
        };
        self.reported = true;
        if self.deferred.is_none() {
            self.deferred = Some((err.code(), err.to_string()));
        }
        error!("{} ({})", err, err.code());
        let trace = self.stack_trace();
        if !trace.is_empty() {
            error!("{}", trace);
        }
        self.fault_pc = None;
    }

    /// Records an exception that reached host code.
    pub(crate) fn uncaught(&mut self, exc: WObject) -> VmError {
        let name = self
            .class_of(exc)
            .map(|c| self.classes.get(c).name().into_owned())
            .unwrap_or_else(|| "?".to_string());
        let code = RUNTIME_EXCEPTIONS
            .iter()
            .find(|(_, class)| *class == name)
            .map_or(ErrorCode::Unknown, |(code, _)| *code);
        self.status = VmStatus {
            code,
            severity: Severity::RuntimeException,
        };
        self.reported = true;
        error!("uncaught exception {}", name);
        VmError::UncaughtException(name)
    }

    pub fn stack_trace(&self) -> StackTrace {
        StackTrace::capture(self)
    }

    /// Writes the current stack trace to the output.
    pub fn print_stack_trace(&mut self) {
        let trace = self.stack_trace();
        self.write_output(&format!("{trace}\n"));
    }

    pub fn write_output(&mut self, text: &str) {
        if let Err(e) = self
            .output
            .write_all(text.as_bytes())
            .and_then(|_| self.output.flush())
        {
            warn!("output failed: {}", e);
        }
    }

    pub fn set_output(&mut self, output: impl Write + 'static) {
        self.output = Box::new(output);
    }

    pub fn set_inout_buffer(&mut self, buffer: Option<Vec<u8>>) {
        self.inout = buffer;
    }

    pub fn inout_buffer(&self) -> Option<&[u8]> {
        self.inout.as_deref()
    }

    pub fn inout_buffer_mut(&mut self) -> Option<&mut [u8]> {
        self.inout.as_deref_mut()
    }

    pub fn take_inout_buffer(&mut self) -> Option<Vec<u8>> {
        self.inout.take()
    }

    pub fn mem_info(&self) -> MemInfo {
        MemInfo {
            object_heap_total: self.heap.total(),
            object_heap_unused: self.heap.unused(),
            live_objects: self.heap.live_handles(),
            class_heap_total: self.classes.heap_size(),
            class_heap_used: self.classes.heap_used(),
            loaded_classes: self.classes.linked().count(),
            vm_stack_slots: self.vm_stack.cap,
            vm_stack_ptr: self.vm_stack.ptr,
            vm_stack_max: self.vm_stack.max,
            native_stack_slots: self.pins.cap,
            native_stack_ptr: self.pins.ptr,
            native_stack_max: self.pins.max,
            arena_total: self.arena.capacity(),
            arena_used: self.arena.used_bytes().unwrap_or(0),
        }
    }

    /// Runs the destroy hook of every live object and releases the arena.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        let mem = self.arena.region(self.heap_block);
        self.heap.destroy_all(mem, &self.classes);
        self.arena.free(self.class_block);
        self.arena.dispose();
        self.shut_down = true;
        info!("runtime shut down");
    }

    // VM stack

    pub fn vm_stack_ptr(&self) -> usize {
        self.vm_stack.ptr
    }

    pub(crate) fn stack_slot(&self, i: usize) -> Var {
        Var::from_raw(self.arena.read_u32(self.vm_stack.block, i * 4).unwrap_or(0))
    }

    pub(crate) fn set_stack_slot(&mut self, i: usize, value: Var) {
        self.arena.write_u32(self.vm_stack.block, i * 4, value.raw());
    }

    pub(crate) fn set_native_result(&mut self, value: Var) {
        self.native_result = value;
    }

    pub(crate) fn take_native_result(&mut self) -> Var {
        std::mem::take(&mut self.native_result)
    }

    // Pinned handles

    /// Keeps `obj` alive across calls that may collect.
    pub fn pin(&mut self, obj: WObject) -> Result<()> {
        if self.pins.ptr >= self.pins.cap {
            return Err(VmError::NativeStackOverflow);
        }
        self.arena
            .write_u32(self.pins.block, self.pins.ptr * 4, obj.raw());
        let ptr = self.pins.ptr + 1;
        self.pins.set_ptr(ptr);
        Ok(())
    }

    pub fn unpin(&mut self) -> Result<WObject> {
        if self.pins.ptr == 0 {
            return Err(VmError::NativeStackUnderflow);
        }
        self.pins.ptr -= 1;
        let raw = self
            .arena
            .read_u32(self.pins.block, self.pins.ptr * 4)
            .unwrap_or(0);
        Ok(Var::from_raw(raw).obj())
    }

    /// Runs `f` with `obj` pinned. The pin stack is restored afterwards even
    /// when `f` fails.
    pub fn pinned<T>(&mut self, obj: WObject, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let mark = self.pins.ptr;
        self.pin(obj)?;
        let result = f(self);
        self.pins.ptr = mark;
        result
    }

    // Object heap

    /// Collects garbage. Roots are the VM stack below its pointer, the pin
    /// stack and the static fields of every loaded class.
    pub fn gc(&mut self) -> GcStats {
        let mut roots: Vec<WObject> = (0..self.vm_stack.ptr)
            .map(|i| self.stack_slot(i).obj())
            .collect();
        roots.extend((0..self.pins.ptr).map(|i| {
            let raw = self.arena.read_u32(self.pins.block, i * 4).unwrap_or(0);
            Var::from_raw(raw).obj()
        }));
        roots.extend(self.classes.static_values().map(Var::obj));
        roots.push(self.native_result.obj());

        let mem = self.arena.region_mut(self.heap_block);
        for root in roots {
            self.heap.mark(mem, root, &self.classes);
        }
        let stats = self.heap.sweep(mem, &self.classes);
        debug!(
            "gc: {} live objects ({} bytes), {} freed ({} bytes)",
            stats.live_objects, stats.live_bytes, stats.freed_objects, stats.freed_bytes
        );
        stats
    }

    fn heap_mem(&self) -> &[u8] {
        self.arena.region(self.heap_block)
    }

    fn word(&self, at: usize) -> u32 {
        heap::read_word(self.heap_mem(), at)
    }

    fn set_word(&mut self, at: usize, value: u32) {
        heap::write_word(self.arena.region_mut(self.heap_block), at, value);
    }

    /// Current offset of an object. Only valid until the next allocation.
    pub(crate) fn object_addr(&self, obj: WObject) -> Option<usize> {
        self.heap.address(self.heap_mem(), obj)
    }

    /// Allocates `size` zeroed bytes, collecting once if the heap is full.
    pub(crate) fn alloc_object(&mut self, size: usize) -> Result<WObject> {
        let mem = self.arena.region_mut(self.heap_block);
        if let Some(obj) = self.heap.allocate(mem, size) {
            return Ok(obj);
        }
        self.gc();
        let mem = self.arena.region_mut(self.heap_block);
        self.heap
            .allocate(mem, size)
            .ok_or(VmError::OutOfObjectMemory)
    }

    pub fn create_object(&mut self, class: ClassId) -> Result<WObject> {
        let c = self.classes.get(class);
        if c.is_abstract() {
            return Err(VmError::CantCreateObject(c.name().into_owned()));
        }
        let size = c.object_size();
        let obj = self.alloc_object(size)?;
        if let Some(at) = self.object_addr(obj) {
            self.set_word(at, class.class_word());
        }
        Ok(obj)
    }

    /// Creates a one dimensional array of an element type from
    /// `value::array_type`.
    pub fn create_array(&mut self, ty: u8, len: i32) -> Result<WObject> {
        let size = array_size(ty, len).ok_or(VmError::ParamError("bad array type or length"))?;
        let obj = self.alloc_object(size)?;
        if let Some(at) = self.object_addr(obj) {
            self.set_word(at + 4, ty as u32);
            self.set_word(at + 8, len as u32);
        }
        Ok(obj)
    }

    /// Creates nested arrays for a descriptor such as `[[I`, one length per
    /// dimension. Dimensions without a length are left null.
    pub fn create_multi_array(&mut self, desc: &[u8], dims: &[i32]) -> Result<WObject> {
        let Some((&len, rest)) = dims.split_first() else {
            return Err(VmError::ParamError("no array dimensions"));
        };
        let ty = desc
            .get(1)
            .copied()
            .and_then(array_type::from_descriptor)
            .ok_or(VmError::ParamError("bad array descriptor"))?;
        let array = self.create_array(ty, len)?;
        if rest.is_empty() {
            return Ok(array);
        }
        self.pinned(array, |rt| {
            for i in 0..len {
                let sub = rt.create_multi_array(&desc[1..], rest)?;
                rt.array_set(array, i, Var::from_obj(sub));
            }
            Ok(array)
        })
    }

    fn string_class(&mut self) -> Result<ClassId> {
        if let Some(id) = self.string_class {
            return Ok(id);
        }
        let id = self.resolve_class_bytes(STRING_CLASS.as_bytes())?;
        self.string_class = Some(id);
        Ok(id)
    }

    /// Creates a `java/lang/String` holding `text` in a `char[]`.
    pub fn create_string(&mut self, text: &str) -> Result<WObject> {
        let class = self.string_class()?;
        let chars: Vec<u16> = text.encode_utf16().collect();
        let len = i32::try_from(chars.len()).map_err(|_| VmError::ParamError("string too long"))?;
        let array = self.create_array(array_type::CHAR, len)?;
        if let Some(bytes) = self.array_bytes_mut(array) {
            for (dst, c) in bytes.chunks_exact_mut(2).zip(&chars) {
                LittleEndian::write_u16(dst, *c);
            }
        }
        self.pinned(array, |rt| {
            let obj = rt.create_object(class)?;
            rt.set_object_var(obj, 0, Var::from_obj(array));
            Ok(obj)
        })
    }

    /// Contents of a `java/lang/String`, `None` for null or non strings.
    pub fn string_to_utf(&self, string: WObject) -> Option<String> {
        let chars = self.object_var(string, 0)?.obj();
        if self.array_type(chars) != Some(array_type::CHAR) {
            return None;
        }
        let units: Vec<u16> = self
            .array_bytes(chars)?
            .chunks_exact(2)
            .map(LittleEndian::read_u16)
            .collect();
        Some(String::from_utf16_lossy(&units))
    }

    /// Class of an instance; `None` for null and arrays.
    pub fn class_of(&self, obj: WObject) -> Option<ClassId> {
        let at = self.object_addr(obj)?;
        ClassId::from_class_word(self.word(at))
    }

    pub fn is_array(&self, obj: WObject) -> bool {
        self.array_header(obj).is_some()
    }

    /// Offset, element type and length of an array.
    fn array_header(&self, array: WObject) -> Option<(usize, u8, i32)> {
        let at = self.object_addr(array)?;
        if self.word(at) != 0 {
            return None;
        }
        Some((at, self.word(at + 4) as u8, self.word(at + 8) as i32))
    }

    /// Offset and byte length of an array's elements.
    fn array_data(&self, array: WObject) -> Option<(usize, usize)> {
        let (at, ty, len) = self.array_header(array)?;
        let width = array_type::element_size(ty)?;
        Some((at + ARRAY_HEADER, width * usize::try_from(len).ok()?))
    }

    pub fn array_type(&self, array: WObject) -> Option<u8> {
        self.array_header(array).map(|(_, ty, _)| ty)
    }

    pub fn array_len(&self, array: WObject) -> Option<i32> {
        self.array_header(array).map(|(_, _, len)| len)
    }

    /// Reads an element, sign extending bytes and shorts and zero extending
    /// chars. `None` when out of bounds or not an array.
    pub fn array_get(&self, array: WObject, index: i32) -> Option<Var> {
        let (at, ty, len) = self.array_header(array)?;
        if index < 0 || index >= len {
            return None;
        }
        let width = array_type::element_size(ty)?;
        let p = at + ARRAY_HEADER + index as usize * width;
        let bytes = self.heap_mem().get(p..p + width)?;
        let value = match ty {
            array_type::BYTE | array_type::BOOLEAN => bytes[0] as i8 as i32,
            array_type::CHAR => LittleEndian::read_u16(bytes) as i32,
            array_type::SHORT => LittleEndian::read_i16(bytes) as i32,
            _ => LittleEndian::read_i32(bytes),
        };
        Some(Var::from_int(value))
    }

    /// Writes an element truncated to the element width.
    pub fn array_set(&mut self, array: WObject, index: i32, value: Var) -> bool {
        let Some((at, ty, len)) = self.array_header(array) else {
            return false;
        };
        if index < 0 || index >= len {
            return false;
        }
        let Some(width) = array_type::element_size(ty) else {
            return false;
        };
        let p = at + ARRAY_HEADER + index as usize * width;
        let Some(bytes) = self.arena.region_mut(self.heap_block).get_mut(p..p + width) else {
            return false;
        };
        match width {
            1 => bytes[0] = value.int() as u8,
            2 => LittleEndian::write_u16(bytes, value.int() as u16),
            _ => LittleEndian::write_u32(bytes, value.raw()),
        }
        true
    }

    /// Element bytes of an array.
    pub fn array_bytes(&self, array: WObject) -> Option<&[u8]> {
        let (start, len) = self.array_data(array)?;
        self.heap_mem().get(start..start + len)
    }

    pub fn array_bytes_mut(&mut self, array: WObject) -> Option<&mut [u8]> {
        let (start, len) = self.array_data(array)?;
        self.arena
            .region_mut(self.heap_block)
            .get_mut(start..start + len)
    }

    /// Copies `n` element bytes between arrays; the ranges may overlap.
    pub fn copy_array_bytes(
        &mut self,
        src: WObject,
        src_off: usize,
        dst: WObject,
        dst_off: usize,
        n: usize,
    ) -> bool {
        let (Some((src_at, src_len)), Some((dst_at, dst_len))) =
            (self.array_data(src), self.array_data(dst))
        else {
            return false;
        };
        if src_off + n > src_len || dst_off + n > dst_len {
            return false;
        }
        let mem = self.arena.region_mut(self.heap_block);
        mem.copy_within(src_at + src_off..src_at + src_off + n, dst_at + dst_off);
        true
    }

    /// Instance variable `i` of an object, inherited variables first.
    pub fn object_var(&self, obj: WObject, i: usize) -> Option<Var> {
        let at = self.object_addr(obj)?;
        let class_word = self.word(at);
        if class_word == 0 || i >= self.classes.instance_vars(class_word) {
            return None;
        }
        Some(Var::from_raw(self.word(at + 4 + i * 4)))
    }

    pub fn set_object_var(&mut self, obj: WObject, i: usize, value: Var) -> bool {
        let Some(at) = self.object_addr(obj) else {
            return false;
        };
        let class_word = self.word(at);
        if class_word == 0 || i >= self.classes.instance_vars(class_word) {
            return false;
        }
        self.set_word(at + 4 + i * 4, value.raw());
        true
    }

    pub(crate) fn static_var(&self, class: ClassId, field: u16) -> Option<Var> {
        match self.classes.get(class).fields.get(field as usize)?.var {
            FieldVar::Static(v) => Some(v),
            FieldVar::Instance(_) => None,
        }
    }

    pub(crate) fn set_static_var(&mut self, class: ClassId, field: u16, value: Var) -> bool {
        match self.classes.get_mut(class).fields.get_mut(field as usize) {
            Some(f) if f.is_static() => {
                f.var = FieldVar::Static(value);
                true
            }
            _ => false,
        }
    }

    /// Reads a static field, loading its class first.
    pub fn get_static(&mut self, class: &str, name: &str, desc: &str) -> Result<Var> {
        self.host_call(|rt| {
            let id = rt.resolve_class_bytes(class.as_bytes())?;
            rt.classes
                .find_field(id, name.as_bytes(), desc.as_bytes())
                .and_then(|(owner, field)| rt.static_var(owner, field))
                .ok_or_else(|| VmError::FieldNotFound {
                    class: class.to_string(),
                    name: name.to_string(),
                    desc: desc.to_string(),
                })
        })
    }

    // Host entry points

    pub fn resolve_class(&mut self, name: &str) -> Result<ClassId> {
        self.host_call(|rt| rt.resolve_class_bytes(name.as_bytes()))
    }

    /// Loads `name`, checks it against `base` and runs its `<init>()V`.
    pub fn new_instance(&mut self, name: &str, base: Option<&str>) -> Result<WObject> {
        self.host_call(|rt| rt.instantiate(name, base))
    }

    pub(crate) fn instantiate(&mut self, name: &str, base: Option<&str>) -> Result<WObject> {
        let class = self.resolve_class_bytes(name.as_bytes())?;
        if let Some(base_name) = base {
            let base = self.resolve_class_bytes(base_name.as_bytes())?;
            if !self.compatible(class, base)? {
                return Err(VmError::IncompatibleClass {
                    class: name.to_string(),
                    base: base_name.to_string(),
                });
            }
        }
        let obj = self.create_object(class)?;
        let Some(init) = self.classes.get(class).declared_method(b"<init>", b"()V") else {
            return Ok(obj);
        };
        self.pinned(obj, |rt| {
            match rt.execute_method(class, init, &[Var::from_obj(obj)])? {
                MethodResult::Returned(_) => Ok(obj),
                MethodResult::Exception(exc) => Err(rt.uncaught(exc)),
            }
        })
    }

    /// Instance of the exception class thrown for `code`.
    pub(crate) fn create_runtime_exception(&mut self, code: ErrorCode) -> Result<WObject> {
        let name = exception_class(code);
        debug!("throwing {} ({})", name, code);
        self.instantiate(name, Some(EXCEPTION_CLASS))
    }

    /// Calls a static method. An exception escaping the method is reported
    /// as `VmError::UncaughtException`.
    pub fn call_static(
        &mut self,
        class: &str,
        name: &str,
        desc: &str,
        args: &[Var],
    ) -> Result<Option<Var>> {
        self.host_call(|rt| {
            let id = rt.resolve_class_bytes(class.as_bytes())?;
            let (owner, method) = rt
                .classes
                .find_method(id, name.as_bytes(), desc.as_bytes(), true)
                .filter(|(c, m)| rt.classes.get(*c).methods[*m as usize].is_static())
                .ok_or_else(|| VmError::MethodNotFound {
                    class: class.to_string(),
                    name: name.to_string(),
                    desc: desc.to_string(),
                })?;
            let expected = rt.classes.get(owner).methods[method as usize].num_params as usize;
            if args.len() != expected {
                return Err(VmError::BadParamNum(format!("{class}.{name}{desc}")));
            }
            match rt.execute_method(owner, method, args)? {
                MethodResult::Returned(value) => Ok(value),
                MethodResult::Exception(exc) => Err(rt.uncaught(exc)),
            }
        })
    }

    /// Runs `static void main(String[])` with zero or one argument.
    pub fn call_static_main(&mut self, class: &str, arg: Option<&str>) -> Result<()> {
        self.host_call(|rt| {
            let id = rt.resolve_class_bytes(class.as_bytes())?;
            let method = rt
                .classes
                .get(id)
                .declared_method(b"main", MAIN_DESC)
                .filter(|m| rt.classes.get(id).methods[*m as usize].is_static())
                .ok_or_else(|| VmError::NotMainClass(class.to_string()))?;
            let args = rt.create_array(array_type::OBJECT, arg.is_some() as i32)?;
            let result = rt.pinned(args, |rt| {
                if let Some(arg) = arg {
                    let s = rt.create_string(arg)?;
                    rt.array_set(args, 0, Var::from_obj(s));
                }
                rt.execute_method(id, method, &[Var::from_obj(args)])
            })?;
            match result {
                MethodResult::Returned(_) => Ok(()),
                MethodResult::Exception(exc) => Err(rt.uncaught(exc)),
            }
        })
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{self, add_default_init, ClassFileBuilder, OBJECT};
    use std::cell::RefCell;

    #[test]
    fn regions_are_carved_from_the_arena() {
        let (rt, _) = test_utils::runtime(vec![]);
        let info = rt.mem_info();
        assert_eq!(info.vm_stack_slots, 250);
        assert_eq!(info.native_stack_slots, 250);
        assert_eq!(info.object_heap_total, 76000);
        assert_eq!(info.object_heap_unused, 76000);
        assert!(info.arena_used >= 1000 + 1000 + 20000 + 76000);
        assert_eq!(info.loaded_classes, 0);
    }

    #[test]
    fn undersized_arena_is_rejected() {
        let config = VmConfig {
            arena_bytes: 4096,
            ..VmConfig::default()
        };
        assert!(matches!(
            Runtime::new(config, ProviderChain::new()),
            Err(VmError::CantAllocateMemory(_))
        ));
    }

    #[test]
    fn strings_round_trip_through_char_arrays() {
        let (mut rt, _) = test_utils::runtime(vec![]);
        let s = rt.create_string("héllo").unwrap();
        assert_eq!(rt.string_to_utf(s).as_deref(), Some("héllo"));
        let chars = rt.object_var(s, 0).unwrap().obj();
        assert_eq!(rt.array_type(chars), Some(array_type::CHAR));
        assert_eq!(rt.array_len(chars), Some(5));
        assert_eq!(rt.string_to_utf(WObject::NULL), None);
        assert_eq!(rt.string_to_utf(chars), None);
    }

    #[test]
    fn array_elements_use_their_own_width() {
        let (mut rt, _) = test_utils::runtime(vec![]);
        let bytes = rt.create_array(array_type::BYTE, 3).unwrap();
        assert!(rt.array_set(bytes, 0, Var::from_int(0xff)));
        assert_eq!(rt.array_get(bytes, 0), Some(Var::from_int(-1)));
        assert!(!rt.array_set(bytes, 3, Var::ZERO));
        assert_eq!(rt.array_get(bytes, -1), None);

        let chars = rt.create_array(array_type::CHAR, 1).unwrap();
        rt.array_set(chars, 0, Var::from_int(-1));
        assert_eq!(rt.array_get(chars, 0), Some(Var::from_int(0xffff)));

        let shorts = rt.create_array(array_type::SHORT, 1).unwrap();
        rt.array_set(shorts, 0, Var::from_int(0x18000));
        assert_eq!(rt.array_get(shorts, 0), Some(Var::from_int(-32768)));

        assert!(matches!(
            rt.create_array(array_type::LONG, 1),
            Err(VmError::ParamError(_))
        ));
    }

    #[test]
    fn multi_arrays_nest() {
        let (mut rt, _) = test_utils::runtime(vec![]);
        let outer = rt.create_multi_array(b"[[I", &[2, 3]).unwrap();
        assert_eq!(rt.array_type(outer), Some(array_type::ARRAY));
        assert_eq!(rt.array_len(outer), Some(2));
        for i in 0..2 {
            let inner = rt.array_get(outer, i).unwrap().obj();
            assert_eq!(rt.array_type(inner), Some(array_type::INT));
            assert_eq!(rt.array_len(inner), Some(3));
        }
        let partial = rt.create_multi_array(b"[[I", &[2]).unwrap();
        assert_eq!(rt.array_get(partial, 1), Some(Var::ZERO));
    }

    #[test]
    fn pins_survive_collection() {
        let (mut rt, _) = test_utils::runtime(vec![]);
        let kept = rt.create_array(array_type::INT, 4).unwrap();
        let lost = rt.create_array(array_type::INT, 4).unwrap();
        rt.pin(kept).unwrap();
        let stats = rt.gc();
        assert_eq!(stats.freed_objects, 1);
        assert!(rt.array_len(kept).is_some());
        assert!(rt.array_len(lost).is_none());
        assert_eq!(rt.unpin().unwrap(), kept);
        assert!(matches!(rt.unpin(), Err(VmError::NativeStackUnderflow)));
    }

    #[test]
    fn pin_stack_overflow_is_fatal() {
        let config = VmConfig {
            native_stack_bytes: 8,
            ..VmConfig::default()
        };
        let (mut rt, _) = test_utils::runtime_with(config, vec![]);
        rt.pin(WObject::NULL).unwrap();
        rt.pin(WObject::NULL).unwrap();
        assert!(matches!(
            rt.pin(WObject::NULL),
            Err(VmError::NativeStackOverflow)
        ));
        let result = rt.pinned(WObject::NULL, |_| Ok(()));
        assert!(matches!(result, Err(VmError::NativeStackOverflow)));
        assert_eq!(rt.mem_info().native_stack_max, 2);
    }

    #[test]
    fn heap_exhaustion_is_reported() {
        let config = VmConfig {
            object_heap_bytes: 256,
            ..VmConfig::default()
        };
        let (mut rt, _) = test_utils::runtime_with(config, vec![]);
        let big = rt.create_array(array_type::BYTE, 200).unwrap();
        rt.pin(big).unwrap();
        assert!(matches!(
            rt.create_array(array_type::BYTE, 100),
            Err(VmError::OutOfObjectMemory)
        ));
        rt.unpin().unwrap();
        assert!(rt.create_array(array_type::BYTE, 100).is_ok());
    }

    #[test]
    fn new_instance_checks_the_base_class() {
        let mut plain = ClassFileBuilder::new("test/Plain", Some(OBJECT));
        add_default_init(&mut plain, OBJECT);
        let (mut rt, _) = test_utils::runtime(vec![("test/Plain", plain.build())]);

        let obj = rt.new_instance("test/Plain", Some(OBJECT)).unwrap();
        let class = rt.class_of(obj).unwrap();
        assert_eq!(rt.classes().get(class).name(), "test/Plain");

        let err = rt
            .new_instance("test/Plain", Some("java/lang/Exception"))
            .unwrap_err();
        assert!(matches!(err, VmError::IncompatibleClass { .. }));
        assert_eq!(rt.status().code, ErrorCode::ParamError);
        assert_eq!(rt.status().severity, Severity::Fatal);

        rt.reset_error();
        assert!(matches!(
            rt.new_instance("test/Missing", None),
            Err(VmError::ClassNotFound(_))
        ));
        assert_eq!(rt.status().code, ErrorCode::CantFindClass);
    }

    #[test]
    fn abstract_classes_cannot_be_instantiated() {
        let (mut rt, _) = test_utils::runtime(vec![]);
        assert!(matches!(
            rt.new_instance("test/Runnable", None),
            Err(VmError::CantCreateObject(_))
        ));
    }

    thread_local! {
        static CLOSED: RefCell<Vec<i32>> = RefCell::new(Vec::new());
    }

    fn close(_: WObject, vars: &[Var]) {
        CLOSED.with(|c| c.borrow_mut().push(vars.len() as i32));
    }

    #[test]
    fn shutdown_runs_destroy_hooks() {
        let mut base = ClassFileBuilder::new("test/Resource", Some(OBJECT));
        base.field(0, "id", "I");
        add_default_init(&mut base, OBJECT);
        let mut sub = ClassFileBuilder::new("test/File", Some("test/Resource"));
        add_default_init(&mut sub, "test/Resource");

        let mut provider = test_utils::library();
        provider.insert("test/Resource", base.build());
        provider.insert("test/File", sub.build());
        let mut rt = RuntimeBuilder::new(VmConfig::default())
            .provider(provider)
            .output(test_utils::SharedOutput::default())
            .hook(ClassHook {
                class_name: "test/Resource",
                destroy: close,
                vars_needed: 2,
            })
            .build()
            .unwrap();

        let file = rt.new_instance("test/File", None).unwrap();
        rt.pin(file).unwrap();
        let class = rt.class_of(file).unwrap();
        // One declared field plus two hidden hook variables.
        assert_eq!(rt.classes().get(class).num_vars, 3);
        assert!(rt.classes().get(class).destroy_hook.is_some());

        rt.shutdown();
        assert!(rt.is_shut_down());
        CLOSED.with(|c| assert_eq!(*c.borrow(), vec![3]));
        assert!(matches!(
            rt.new_instance("test/File", None),
            Err(VmError::ParamError(_))
        ));
    }
}
