//! Native method binding and the framework natives.
//!
//! Natives are bound by a 32 bit hash of their class name, method name and
//! descriptor: the class hash fills the top 16 bits and the sum of the name
//! and descriptor hashes the bottom 16. The registry keeps the entries
//! sorted so binding is a binary search, and refuses two different methods
//! that hash alike.
use std::cmp::Ordering;

use log::{debug, warn};

use crate::error::{ErrorCode, Result, VmError};
use crate::heap::ObjectDestroyFn;
use crate::program::gen_hash;
use crate::runtime::Runtime;
use crate::value::{array_type, Var, WObject};

/// A native method. Returns 0 on success, a positive `ErrorCode` to throw
/// the matching runtime exception, or a negative value for a fatal error.
pub type NativeFn = fn(&mut Runtime, NativeArgs) -> i32;

pub const NATIVE_OK: i32 = 0;

/// Window of VM stack slots holding a native call's arguments. The receiver
/// comes first for instance methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeArgs {
    base: usize,
    count: usize,
}

impl NativeArgs {
    pub(crate) fn new(base: usize, count: usize) -> Self {
        Self { base, count }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn get(&self, rt: &Runtime, i: usize) -> Var {
        if i < self.count {
            rt.stack_slot(self.base + i)
        } else {
            Var::ZERO
        }
    }

    pub fn int(&self, rt: &Runtime, i: usize) -> i32 {
        self.get(rt, i).int()
    }

    pub fn obj(&self, rt: &Runtime, i: usize) -> WObject {
        self.get(rt, i).obj()
    }

    /// Value handed back to the caller when the method returns one.
    pub fn set_result(&self, rt: &mut Runtime, value: Var) {
        rt.set_native_result(value);
    }
}

/// Catalogue entry for one native method.
#[derive(Clone, Copy)]
pub struct NativeMethodDef {
    pub class: &'static str,
    pub name: &'static str,
    pub desc: &'static str,
    pub func: NativeFn,
}

impl NativeMethodDef {
    pub const fn new(class: &'static str, name: &'static str, desc: &'static str, func: NativeFn) -> Self {
        Self {
            class,
            name,
            desc,
            func,
        }
    }

    pub fn hash(&self) -> u32 {
        native_hash(self.class.as_bytes(), self.name.as_bytes(), self.desc.as_bytes())
    }

    fn matches(&self, class: &[u8], name: &[u8], desc: &[u8]) -> bool {
        self.class.as_bytes() == class && self.name.as_bytes() == name && self.desc.as_bytes() == desc
    }

    fn signature(&self) -> String {
        format!("{}.{}{}", self.class, self.name, self.desc)
    }
}

impl std::fmt::Debug for NativeMethodDef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "NativeMethodDef({})", self.signature())
    }
}

pub fn native_hash(class: &[u8], name: &[u8], desc: &[u8]) -> u32 {
    let class_hash = gen_hash(class) % 65536;
    let method_hash = gen_hash(name).wrapping_add(gen_hash(desc)) % 65536;
    (class_hash << 16) + method_hash
}

/// Objects of `class_name` get `vars_needed` hidden instance variables and
/// have `destroy` run before the collector frees them. Subclasses without
/// a hook of their own inherit the nearest superclass hook.
#[derive(Debug, Clone, Copy)]
pub struct ClassHook {
    pub class_name: &'static str,
    pub destroy: ObjectDestroyFn,
    pub vars_needed: u16,
}

#[derive(Debug, Clone)]
pub struct NativeRegistry {
    entries: Vec<(u32, NativeMethodDef)>,
}

impl NativeRegistry {
    /// Builds a registry from a catalogue. A later definition with the same
    /// signature replaces an earlier one; two different signatures with the
    /// same hash are an error.
    pub fn new(defs: impl IntoIterator<Item = NativeMethodDef>) -> Result<Self> {
        let mut entries: Vec<(u32, NativeMethodDef)> = Vec::new();
        for def in defs {
            let hash = def.hash();
            match entries.binary_search_by_key(&hash, |(h, _)| *h) {
                Ok(at) => {
                    let existing = &entries[at].1;
                    if existing.signature() != def.signature() {
                        return Err(VmError::NativeHashCollision {
                            hash,
                            first: existing.signature(),
                            second: def.signature(),
                        });
                    }
                    debug!("native {} overridden", def.signature());
                    entries[at].1 = def;
                }
                Err(at) => entries.insert(at, (hash, def)),
            }
        }
        Ok(Self { entries })
    }

    pub fn framework() -> Self {
        // The framework catalogue is collision free; see the tests.
        Self::new(framework_natives()).unwrap_or(Self {
            entries: Vec::new(),
        })
    }

    /// Framework natives followed by `extra`, which may override them.
    pub fn with_framework(extra: impl IntoIterator<Item = NativeMethodDef>) -> Result<Self> {
        Self::new(framework_natives().into_iter().chain(extra))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, class: &[u8], name: &[u8], desc: &[u8]) -> Option<NativeFn> {
        let hash = native_hash(class, name, desc);
        match self.entries.binary_search_by_key(&hash, |(h, _)| *h) {
            Ok(at) if self.entries[at].1.matches(class, name, desc) => {
                Some(self.entries[at].1.func)
            }
            _ => {
                warn!(
                    "no native for {}.{}{} (hash {})",
                    String::from_utf8_lossy(class),
                    String::from_utf8_lossy(name),
                    String::from_utf8_lossy(desc),
                    hash
                );
                None
            }
        }
    }

    pub fn hashes(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.iter().map(|(h, _)| *h)
    }
}

const SYSTEM: &str = "base/framework/System";
const CONVERT: &str = "base/framework/Convert";
const UTIL: &str = "base/framework/Util";

pub fn framework_natives() -> Vec<NativeMethodDef> {
    vec![
        NativeMethodDef::new(SYSTEM, "gc", "()V", system_gc),
        NativeMethodDef::new(SYSTEM, "print", "(Ljava/lang/String;)V", system_print),
        NativeMethodDef::new(
            SYSTEM,
            "newInstance",
            "(Ljava/lang/String;)Ljava/lang/Object;",
            system_new_instance,
        ),
        NativeMethodDef::new(
            SYSTEM,
            "getClassName",
            "(Ljava/lang/Object;)Ljava/lang/String;",
            system_get_class_name,
        ),
        NativeMethodDef::new(
            SYSTEM,
            "arraycopy",
            "(Ljava/lang/Object;ILjava/lang/Object;II)V",
            system_arraycopy,
        ),
        NativeMethodDef::new(SYSTEM, "hasClass", "(Ljava/lang/String;)Z", system_has_class),
        NativeMethodDef::new(SYSTEM, "printStackTrace", "()V", system_print_stack_trace),
        NativeMethodDef::new(SYSTEM, "getInput", "(I)[Ljava/lang/String;", system_get_input),
        NativeMethodDef::new(SYSTEM, "sleep", "(I)I", system_sleep),
        NativeMethodDef::new(SYSTEM, "setOutput", "([Ljava/lang/String;)V", system_set_output),
        NativeMethodDef::new(CONVERT, "toInt", "(Ljava/lang/String;)I", convert_to_int),
        NativeMethodDef::new(CONVERT, "toString", "(C)Ljava/lang/String;", convert_char_to_string),
        NativeMethodDef::new(CONVERT, "toString", "(I)Ljava/lang/String;", convert_int_to_string),
        NativeMethodDef::new(CONVERT, "toString", "(Z)Ljava/lang/String;", convert_bool_to_string),
        NativeMethodDef::new(UTIL, "byteArrayCopy", "([BI[BII)V", util_byte_array_copy),
        NativeMethodDef::new(UTIL, "byteArrayCompare", "([BI[BII)I", util_byte_array_compare),
        NativeMethodDef::new(UTIL, "byteArrayFill", "([BIIB)V", util_byte_array_fill),
    ]
}

fn code(err: ErrorCode) -> i32 {
    err as i32
}

/// Whether `count` elements starting at `start` lie inside `array`.
fn range_ok(rt: &Runtime, array: WObject, start: i32, count: i32) -> bool {
    if array.is_null() || start < 0 || count < 0 {
        return false;
    }
    match rt.array_len(array) {
        Some(len) => start as i64 + count as i64 <= len as i64,
        None => false,
    }
}

fn is_byte_array(rt: &Runtime, array: WObject) -> bool {
    matches!(
        rt.array_type(array),
        Some(array_type::BYTE) | Some(array_type::BOOLEAN)
    )
}

fn return_string(rt: &mut Runtime, args: NativeArgs, s: &str) -> i32 {
    match rt.create_string(s) {
        Ok(obj) => {
            args.set_result(rt, Var::from_obj(obj));
            NATIVE_OK
        }
        Err(_) => -1,
    }
}

fn system_gc(rt: &mut Runtime, _args: NativeArgs) -> i32 {
    rt.gc();
    NATIVE_OK
}

fn system_print(rt: &mut Runtime, args: NativeArgs) -> i32 {
    let text = rt.string_to_utf(args.obj(rt, 0)).unwrap_or_default();
    rt.write_output(&text);
    NATIVE_OK
}

fn system_new_instance(rt: &mut Runtime, args: NativeArgs) -> i32 {
    let Some(name) = rt.string_to_utf(args.obj(rt, 0)) else {
        return code(ErrorCode::NullObjectAccess);
    };
    match rt.new_instance(&name, None) {
        Ok(obj) => {
            args.set_result(rt, Var::from_obj(obj));
            NATIVE_OK
        }
        Err(VmError::ClassNotFound(_)) => code(ErrorCode::CantFindClass),
        Err(e) => {
            warn!("newInstance({}) failed: {}", name, e);
            -1
        }
    }
}

fn system_get_class_name(rt: &mut Runtime, args: NativeArgs) -> i32 {
    let obj = args.obj(rt, 0);
    if obj.is_null() {
        return code(ErrorCode::NullObjectAccess);
    }
    let name = match rt.class_of(obj) {
        Some(class) => rt.classes().get(class).name().into_owned(),
        None => return code(ErrorCode::NotArray),
    };
    return_string(rt, args, &name)
}

fn system_arraycopy(rt: &mut Runtime, args: NativeArgs) -> i32 {
    let src = args.obj(rt, 0);
    let src_start = args.int(rt, 1);
    let dst = args.obj(rt, 2);
    let dst_start = args.int(rt, 3);
    let len = args.int(rt, 4);
    if src.is_null() || dst.is_null() {
        return code(ErrorCode::NullObjectAccess);
    }
    let (Some(src_type), Some(dst_type)) = (rt.array_type(src), rt.array_type(dst)) else {
        return code(ErrorCode::ArrayStore);
    };
    // Reference arrays of any element class are interchangeable here.
    if src_type != dst_type {
        return code(ErrorCode::ArrayStore);
    }
    if !range_ok(rt, src, src_start, len) || !range_ok(rt, dst, dst_start, len) {
        return code(ErrorCode::IndexOutOfRange);
    }
    let Some(width) = array_type::element_size(src_type) else {
        return code(ErrorCode::ArrayStore);
    };
    let ok = rt.copy_array_bytes(
        src,
        src_start as usize * width,
        dst,
        dst_start as usize * width,
        len as usize * width,
    );
    if ok {
        NATIVE_OK
    } else {
        code(ErrorCode::IndexOutOfRange)
    }
}

fn system_has_class(rt: &mut Runtime, args: NativeArgs) -> i32 {
    let Some(name) = rt.string_to_utf(args.obj(rt, 0)) else {
        return code(ErrorCode::NullObjectAccess);
    };
    let found = rt.resolve_class(&name).is_ok();
    args.set_result(rt, Var::from_int(found as i32));
    NATIVE_OK
}

fn system_print_stack_trace(rt: &mut Runtime, _args: NativeArgs) -> i32 {
    rt.print_stack_trace();
    NATIVE_OK
}

fn system_get_input(rt: &mut Runtime, args: NativeArgs) -> i32 {
    let max = args.int(rt, 0);
    let Some(buffer) = rt.inout_buffer() else {
        return code(ErrorCode::CondNotSatisfied);
    };
    let mut strings = Vec::new();
    let mut count = buffer.first().copied().unwrap_or(0) as usize;
    if max >= 0 && count > max as usize {
        count = max as usize;
    }
    let mut at = 1;
    for _ in 0..count {
        let rest = buffer.get(at..).unwrap_or(&[]);
        let end = rest.iter().position(|b| *b == 0).unwrap_or(rest.len());
        strings.push(String::from_utf8_lossy(&rest[..end]).into_owned());
        at += end + 1;
    }

    let array = match rt.create_array(array_type::OBJECT, strings.len() as i32) {
        Ok(array) => array,
        Err(_) => return code(ErrorCode::OutOfObjectMem),
    };
    let filled = rt.pinned(array, |rt| {
        for (i, s) in strings.iter().enumerate() {
            let obj = rt.create_string(s)?;
            rt.array_set(array, i as i32, Var::from_obj(obj));
        }
        Ok(())
    });
    match filled {
        Ok(()) => {
            args.set_result(rt, Var::from_obj(array));
            NATIVE_OK
        }
        Err(_) => code(ErrorCode::OutOfObjectMem),
    }
}

fn system_sleep(rt: &mut Runtime, args: NativeArgs) -> i32 {
    let millis = args.int(rt, 0);
    if millis > 0 {
        std::thread::sleep(std::time::Duration::from_millis(millis as u64));
    }
    args.set_result(rt, Var::ZERO);
    NATIVE_OK
}

fn system_set_output(rt: &mut Runtime, args: NativeArgs) -> i32 {
    let array = args.obj(rt, 0);
    if array.is_null() || rt.inout_buffer().is_none() {
        return code(ErrorCode::NullObjectAccess);
    }
    let Some(num) = rt.array_len(array) else {
        return code(ErrorCode::NotArray);
    };
    if num > 255 {
        return code(ErrorCode::ParamError);
    }
    let mut strings = Vec::with_capacity(num as usize);
    for i in 0..num {
        let element = rt.array_get(array, i).map_or(WObject::NULL, Var::obj);
        match rt.string_to_utf(element) {
            Some(s) => strings.push(s),
            None => return code(ErrorCode::NullObjectAccess),
        }
    }
    let Some(buffer) = rt.inout_buffer_mut() else {
        return code(ErrorCode::NullObjectAccess);
    };
    let mut at = 1;
    for s in &strings {
        let bytes = s.as_bytes();
        if at + bytes.len() + 1 > buffer.len() {
            return code(ErrorCode::OutOfObjectMem);
        }
        buffer[at..at + bytes.len()].copy_from_slice(bytes);
        buffer[at + bytes.len()] = 0;
        at += bytes.len() + 1;
    }
    if let Some(first) = buffer.first_mut() {
        *first = num as u8;
    }
    NATIVE_OK
}

fn convert_to_int(rt: &mut Runtime, args: NativeArgs) -> i32 {
    let Some(text) = rt.string_to_utf(args.obj(rt, 0)) else {
        return code(ErrorCode::NullObjectAccess);
    };
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.as_str()),
    };
    let mut value = 0i32;
    for c in digits.chars() {
        let Some(d) = c.to_digit(10) else {
            return code(ErrorCode::ParamError);
        };
        value = value.wrapping_mul(10).wrapping_add(d as i32);
    }
    if negative {
        value = value.wrapping_neg();
    }
    args.set_result(rt, Var::from_int(value));
    NATIVE_OK
}

fn convert_int_to_string(rt: &mut Runtime, args: NativeArgs) -> i32 {
    let text = args.int(rt, 0).to_string();
    return_string(rt, args, &text)
}

fn convert_char_to_string(rt: &mut Runtime, args: NativeArgs) -> i32 {
    let c = char::from_u32(args.int(rt, 0) as u32 & 0xffff).unwrap_or('?');
    return_string(rt, args, &c.to_string())
}

fn convert_bool_to_string(rt: &mut Runtime, args: NativeArgs) -> i32 {
    let text = if args.int(rt, 0) == 0 { "false" } else { "true" };
    return_string(rt, args, text)
}

fn util_byte_array_copy(rt: &mut Runtime, args: NativeArgs) -> i32 {
    let src = args.obj(rt, 0);
    let src_start = args.int(rt, 1);
    let dst = args.obj(rt, 2);
    let dst_start = args.int(rt, 3);
    let len = args.int(rt, 4);
    if src.is_null() || dst.is_null() {
        return code(ErrorCode::NullObjectAccess);
    }
    if !is_byte_array(rt, src) || !is_byte_array(rt, dst) {
        return code(ErrorCode::ArrayStore);
    }
    if !range_ok(rt, src, src_start, len) || !range_ok(rt, dst, dst_start, len) {
        return code(ErrorCode::IndexOutOfRange);
    }
    rt.copy_array_bytes(src, src_start as usize, dst, dst_start as usize, len as usize);
    NATIVE_OK
}

fn util_byte_array_fill(rt: &mut Runtime, args: NativeArgs) -> i32 {
    let array = args.obj(rt, 0);
    let start = args.int(rt, 1);
    let len = args.int(rt, 2);
    let value = args.int(rt, 3) as u8;
    if array.is_null() {
        return code(ErrorCode::NullObjectAccess);
    }
    if !is_byte_array(rt, array) {
        return code(ErrorCode::ArrayStore);
    }
    if !range_ok(rt, array, start, len) {
        return code(ErrorCode::IndexOutOfRange);
    }
    if let Some(bytes) = rt.array_bytes_mut(array) {
        bytes[start as usize..(start + len) as usize].fill(value);
    }
    NATIVE_OK
}

fn util_byte_array_compare(rt: &mut Runtime, args: NativeArgs) -> i32 {
    let src = args.obj(rt, 0);
    let src_start = args.int(rt, 1);
    let dst = args.obj(rt, 2);
    let dst_start = args.int(rt, 3);
    let len = args.int(rt, 4);
    if src.is_null() || dst.is_null() {
        return code(ErrorCode::NullObjectAccess);
    }
    if !is_byte_array(rt, src) || !is_byte_array(rt, dst) {
        return code(ErrorCode::ArrayStore);
    }
    if !range_ok(rt, src, src_start, len) || !range_ok(rt, dst, dst_start, len) {
        return code(ErrorCode::IndexOutOfRange);
    }
    let ordering = match (rt.array_bytes(src), rt.array_bytes(dst)) {
        (Some(s), Some(d)) => {
            let s = &s[src_start as usize..(src_start + len) as usize];
            let d = &d[dst_start as usize..(dst_start + len) as usize];
            d.cmp(s)
        }
        _ => return code(ErrorCode::NullArrayAccess),
    };
    let result = match ordering {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    };
    args.set_result(rt, Var::from_int(result));
    NATIVE_OK
}
