//! Runtime class descriptors and the class table.
//!
//! A `WClass` keeps the raw class file bytes alive and refers into them
//! through constant pool offsets instead of materializing constants. All
//! resolved classes live in a `ClassTable` and are addressed by `ClassId`;
//! lookup by name goes through a small hash table of bucket chains.
use std::borrow::Cow;
use std::mem::size_of;
use std::rc::Rc;
use std::sync::OnceLock;

use byteorder::{BigEndian, ByteOrder};
use regex::Regex;

use crate::error::{Result, VmError};
use crate::heap::{HeapLayout, ObjectDestroyFn};
use crate::jvm::{self, ACC_ABSTRACT, ACC_INTERFACE, ACC_NATIVE, ACC_STATIC};
use crate::natives::NativeFn;
use crate::value::Var;

/// Number of class hash buckets.
pub const CLASS_HASH_SIZE: usize = 63;

/// Index of a class in its `ClassTable`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u16);

impl ClassId {
    /// Value stored in word 0 of instances. Zero is reserved for arrays.
    pub fn class_word(self) -> u32 {
        self.0 as u32 + 1
    }

    pub fn from_class_word(word: u32) -> Option<ClassId> {
        match word {
            0 => None,
            w if w <= u16::MAX as u32 => Some(ClassId((w - 1) as u16)),
            _ => None,
        }
    }
}

/// Name hash shared by the class table and native method binding.
pub fn gen_hash(name: &[u8]) -> u32 {
    let sum = name
        .iter()
        .fold(0u32, |acc, b| acc.wrapping_add(*b as u32));
    (sum << 6).wrapping_add(name.len() as u32)
}

/// Constant pool view over class file bytes.
#[derive(Debug, Clone)]
pub struct ConstantPool {
    bytes: Rc<[u8]>,
    offsets: Rc<[u16]>,
}

impl ConstantPool {
    pub fn new(bytes: Rc<[u8]>, offsets: Vec<u16>) -> Self {
        Self {
            bytes,
            offsets: offsets.into(),
        }
    }

    /// Pool holding nothing but `name` as UTF-8 constant 1.
    pub fn name_only(name: &[u8]) -> Self {
        let len = name.len().min(u16::MAX as usize);
        let mut bytes = Vec::with_capacity(len + 3);
        bytes.push(jvm::CONSTANT_UTF8);
        bytes.extend_from_slice(&(len as u16).to_be_bytes());
        bytes.extend_from_slice(&name[..len]);
        Self::new(bytes.into(), vec![0, 0])
    }

    /// Bytes this pool keeps alive: the class file plus the offset table.
    pub fn footprint(&self) -> usize {
        self.bytes.len() + self.offsets.len() * size_of::<u16>()
    }

    pub fn bytes(&self) -> &Rc<[u8]> {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.len() <= 1
    }

    fn offset(&self, idx: u16) -> Option<usize> {
        if idx == 0 {
            return None;
        }
        self.offsets.get(idx as usize).map(|o| *o as usize)
    }

    pub fn tag(&self, idx: u16) -> Option<u8> {
        self.offset(idx).and_then(|o| self.bytes.get(o).copied())
    }

    fn word(&self, idx: u16, at: usize) -> u16 {
        self.offset(idx)
            .and_then(|o| self.bytes.get(o + at..o + at + 2))
            .map(BigEndian::read_u16)
            .unwrap_or(0)
    }

    /// Bytes of a UTF-8 constant; empty for any other kind of constant.
    pub fn utf8(&self, idx: u16) -> &[u8] {
        if self.tag(idx) != Some(jvm::CONSTANT_UTF8) {
            return &[];
        }
        let Some(o) = self.offset(idx) else {
            return &[];
        };
        let len = self.word(idx, 1) as usize;
        self.bytes.get(o + 3..o + 3 + len).unwrap_or(&[])
    }

    pub fn utf8_str(&self, idx: u16) -> Cow<'_, str> {
        String::from_utf8_lossy(self.utf8(idx))
    }

    pub fn integer(&self, idx: u16) -> Option<i32> {
        if self.tag(idx) != Some(jvm::CONSTANT_INTEGER) {
            return None;
        }
        let o = self.offset(idx)?;
        self.bytes.get(o + 1..o + 5).map(BigEndian::read_i32)
    }

    /// Name of a Class or NameAndType constant.
    pub fn name_index(&self, idx: u16) -> u16 {
        self.word(idx, 1)
    }

    /// Class of a field or method reference.
    pub fn class_index(&self, idx: u16) -> u16 {
        self.word(idx, 1)
    }

    pub fn name_and_type_index(&self, idx: u16) -> u16 {
        self.word(idx, 3)
    }

    /// Descriptor of a NameAndType constant.
    pub fn type_index(&self, idx: u16) -> u16 {
        self.word(idx, 3)
    }

    pub fn string_index(&self, idx: u16) -> u16 {
        self.word(idx, 1)
    }

    /// Class name, member name and descriptor of a member reference.
    pub fn member_ref(&self, idx: u16) -> (u16, &[u8], &[u8]) {
        let class = self.class_index(idx);
        let nat = self.name_and_type_index(idx);
        (
            class,
            self.utf8(self.name_index(nat)),
            self.utf8(self.type_index(nat)),
        )
    }
}

/// Where a field's value lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldVar {
    Static(Var),
    /// Index among the object's instance variables.
    Instance(u16),
}

#[derive(Debug, Clone)]
pub struct WClassField {
    pub access_flags: u16,
    pub name_index: u16,
    pub desc_index: u16,
    pub var: FieldVar,
}

impl WClassField {
    pub fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }
}

/// Location of a method's bytecode inside the class file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeAttr {
    pub max_stack: u16,
    pub max_locals: u16,
    pub start: usize,
    pub len: usize,
}

#[derive(Clone)]
pub enum MethodCode {
    /// Abstract and interface methods.
    None,
    Bytecode(CodeAttr),
    Native(NativeFn),
}

impl std::fmt::Debug for MethodCode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Bytecode(code) => write!(f, "Bytecode({code:?})"),
            Self::Native(_) => write!(f, "Native"),
        }
    }
}

/// One exception table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WClassHandler {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: u16,
}

#[derive(Debug, Clone)]
pub struct WClassMethod {
    pub access_flags: u16,
    pub name_index: u16,
    pub desc_index: u16,
    pub code: MethodCode,
    pub num_params: u16,
    pub returns_value: bool,
    pub is_init: bool,
    pub handlers: Vec<WClassHandler>,
}

impl WClassMethod {
    pub fn is_native(&self) -> bool {
        self.access_flags & ACC_NATIVE != 0
    }

    pub fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }

    pub fn code_attr(&self) -> Option<CodeAttr> {
        match self.code {
            MethodCode::Bytecode(code) => Some(code),
            _ => None,
        }
    }
}

/// Resolved runtime class.
#[derive(Debug, Clone)]
pub struct WClass {
    pub pool: ConstantPool,
    pub access_flags: u16,
    pub name_index: u16,
    /// Superclass chain, root first and direct superclass last.
    pub super_classes: Vec<ClassId>,
    /// Class constants of the directly implemented interfaces.
    pub interfaces: Vec<u16>,
    pub fields: Vec<WClassField>,
    pub methods: Vec<WClassMethod>,
    /// Instance variables, inherited ones included.
    pub num_vars: u16,
    pub destroy_hook: Option<ObjectDestroyFn>,
    pub next_class: Option<ClassId>,
}

impl WClass {
    pub fn name_bytes(&self) -> &[u8] {
        self.pool.utf8(self.name_index)
    }

    pub fn name(&self) -> Cow<'_, str> {
        self.pool.utf8_str(self.name_index)
    }

    pub fn is_interface(&self) -> bool {
        self.access_flags & ACC_INTERFACE != 0
    }

    pub fn is_abstract(&self) -> bool {
        self.access_flags & (ACC_INTERFACE | ACC_ABSTRACT) != 0
    }

    pub fn super_class(&self) -> Option<ClassId> {
        self.super_classes.last().copied()
    }

    /// Bytes of an instance: the class word plus one slot per variable.
    pub fn object_size(&self) -> usize {
        (self.num_vars as usize + 1) * 4
    }

    /// Finds a method declared in this class.
    pub fn declared_method(&self, name: &[u8], desc: &[u8]) -> Option<u16> {
        self.methods
            .iter()
            .position(|m| self.pool.utf8(m.name_index) == name && self.pool.utf8(m.desc_index) == desc)
            .map(|i| i as u16)
    }

    pub fn declared_field(&self, name: &[u8], desc: &[u8]) -> Option<u16> {
        self.fields
            .iter()
            .position(|f| self.pool.utf8(f.name_index) == name && self.pool.utf8(f.desc_index) == desc)
            .map(|i| i as u16)
    }

    pub fn method_name(&self, method: u16) -> Cow<'_, str> {
        match self.methods.get(method as usize) {
            Some(m) => self.pool.utf8_str(m.name_index),
            None => Cow::Borrowed("?"),
        }
    }

    pub fn method_desc(&self, method: u16) -> Cow<'_, str> {
        match self.methods.get(method as usize) {
            Some(m) => self.pool.utf8_str(m.desc_index),
            None => Cow::Borrowed("?"),
        }
    }
}

/// Counts the parameter slots of a method descriptor. Longs and doubles are
/// not supported and fail the count.
pub fn count_params(desc: &[u8]) -> Option<u16> {
    static DESCRIPTOR: OnceLock<Option<Regex>> = OnceLock::new();
    let re = DESCRIPTOR
        .get_or_init(|| Regex::new(r"^\(([^\)]*)\)([^$]+)$").ok())
        .as_ref()?;
    let desc = std::str::from_utf8(desc).ok()?;
    let caps = re.captures(desc)?;
    let args = caps.get(1).map_or("", |m| m.as_str()).as_bytes();

    let mut n = 0u16;
    let mut i = 0;
    while i < args.len() {
        match args[i] {
            b'B' | b'C' | b'I' | b'S' | b'Z' | b'F' => {
                n += 1;
                i += 1;
            }
            b'L' => {
                let end = args[i..].iter().position(|c| *c == b';')?;
                n += 1;
                i += end + 1;
            }
            b'[' => i += 1,
            _ => return None,
        }
    }
    Some(n)
}

/// Whether a method descriptor returns a value.
pub fn returns_value(desc: &[u8]) -> bool {
    desc.last().map_or(false, |c| *c != b'V')
}

/// All loaded classes plus the class memory budget they are charged to.
///
/// Every class is charged for what it keeps alive: its descriptor, the class
/// file bytes its constant pool reads from, and each table built from them.
/// The charges are tracked per class so an unlinked class can give back
/// everything but a name-only stub.
#[derive(Debug)]
pub struct ClassTable {
    classes: Vec<WClass>,
    charged: Vec<usize>,
    buckets: [Option<ClassId>; CLASS_HASH_SIZE],
    heap_size: usize,
    heap_used: usize,
}

impl ClassTable {
    pub fn new(heap_size: usize) -> Self {
        Self {
            classes: Vec::new(),
            charged: Vec::new(),
            buckets: [None; CLASS_HASH_SIZE],
            heap_size,
            heap_used: 0,
        }
    }

    pub fn heap_size(&self) -> usize {
        self.heap_size
    }

    pub fn heap_used(&self) -> usize {
        self.heap_used
    }

    /// Charges `size` bytes, aligned to 4, to the class budget and returns
    /// the aligned size.
    pub fn alloc_part(&mut self, size: usize) -> Result<usize> {
        let size = (size + 3) & !3;
        if self.heap_used + size > self.heap_size {
            return Err(VmError::OutOfClassMemory);
        }
        self.heap_used += size;
        Ok(size)
    }

    /// Charges a class before it is inserted: its descriptor and the pool
    /// it reads its constants from.
    pub fn charge_class(&mut self, pool: &ConstantPool) -> Result<usize> {
        let descriptor = self.alloc_part(size_of::<WClass>())?;
        match self.alloc_part(pool.footprint()) {
            Ok(bytes) => Ok(descriptor + bytes),
            Err(e) => {
                self.heap_used -= descriptor;
                Err(e)
            }
        }
    }

    fn charge(&mut self, id: ClassId, size: usize) -> Result<()> {
        let size = self.alloc_part(size)?;
        if let Some(charged) = self.charged.get_mut(id.0 as usize) {
            *charged += size;
        }
        Ok(())
    }

    /// Bytes currently charged to one class.
    pub fn charged(&self, id: ClassId) -> usize {
        self.charged.get(id.0 as usize).copied().unwrap_or(0)
    }

    pub fn charge_supers(&mut self, id: ClassId, count: usize) -> Result<()> {
        self.charge(id, size_of::<ClassId>() * count)
    }

    pub fn charge_interfaces(&mut self, id: ClassId, count: usize) -> Result<()> {
        self.charge(id, size_of::<u16>() * count)
    }

    pub fn charge_fields(&mut self, id: ClassId, count: usize) -> Result<()> {
        self.charge(id, size_of::<WClassField>() * count)
    }

    pub fn charge_methods(&mut self, id: ClassId, count: usize) -> Result<()> {
        self.charge(id, size_of::<WClassMethod>() * count)
    }

    pub fn charge_handlers(&mut self, id: ClassId, count: usize) -> Result<()> {
        self.charge(id, size_of::<WClassHandler>() * count)
    }

    fn bucket(name: &[u8]) -> usize {
        gen_hash(name) as usize % CLASS_HASH_SIZE
    }

    pub fn find(&self, name: &[u8]) -> Option<ClassId> {
        let mut cur = self.buckets[Self::bucket(name)];
        while let Some(id) = cur {
            let class = &self.classes[id.0 as usize];
            if class.name_bytes() == name {
                return Some(id);
            }
            cur = class.next_class;
        }
        None
    }

    /// Adds a class, already charged `charged` bytes, and links it at the
    /// head of its bucket.
    pub fn insert(&mut self, mut class: WClass, charged: usize) -> Result<ClassId> {
        if self.classes.len() >= u16::MAX as usize - 1 {
            return Err(VmError::OutOfClassMemory);
        }
        let id = ClassId(self.classes.len() as u16);
        let bucket = Self::bucket(class.name_bytes());
        class.next_class = self.buckets[bucket];
        self.buckets[bucket] = Some(id);
        self.classes.push(class);
        self.charged.push(charged);
        Ok(id)
    }

    /// Removes a class from name lookup and releases its tables. A stub
    /// with the name, superclass chain, instance layout and destroy hook
    /// stays so that objects created while it was loading keep a layout.
    pub fn unlink(&mut self, id: ClassId) {
        let Some(class) = self.classes.get(id.0 as usize) else {
            return;
        };
        let next = class.next_class;
        let bucket = Self::bucket(class.name_bytes());
        if self.buckets[bucket] == Some(id) {
            self.buckets[bucket] = next;
        } else {
            let mut cur = self.buckets[bucket];
            while let Some(prev) = cur {
                let link = self.classes[prev.0 as usize].next_class;
                if link == Some(id) {
                    self.classes[prev.0 as usize].next_class = next;
                    break;
                }
                cur = link;
            }
        }
        self.release(id);
    }

    fn release(&mut self, id: ClassId) {
        let class = &mut self.classes[id.0 as usize];
        class.pool = ConstantPool::name_only(class.name_bytes());
        class.name_index = 1;
        class.interfaces = Vec::new();
        class.fields = Vec::new();
        class.methods = Vec::new();
        class.next_class = None;
        let kept = ((size_of::<WClass>() + 3) & !3)
            + ((class.pool.footprint() + 3) & !3)
            + ((size_of::<ClassId>() * class.super_classes.len() + 3) & !3);
        let charged = &mut self.charged[id.0 as usize];
        let freed = charged.saturating_sub(kept);
        *charged -= freed;
        self.heap_used -= freed;
    }

    pub fn get(&self, id: ClassId) -> &WClass {
        &self.classes[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: ClassId) -> &mut WClass {
        &mut self.classes[id.0 as usize]
    }

    pub fn try_get(&self, id: ClassId) -> Option<&WClass> {
        self.classes.get(id.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Classes reachable by name, in bucket order.
    pub fn linked(&self) -> impl Iterator<Item = ClassId> + '_ {
        self.buckets.iter().flat_map(move |head| {
            let mut cur = *head;
            std::iter::from_fn(move || {
                let id = cur?;
                cur = self.classes[id.0 as usize].next_class;
                Some(id)
            })
        })
    }

    /// Looks a method up in `id`, then its superclasses nearest first when
    /// `inherited` is set. Returns the declaring class and method index.
    pub fn find_method(
        &self,
        id: ClassId,
        name: &[u8],
        desc: &[u8],
        inherited: bool,
    ) -> Option<(ClassId, u16)> {
        let class = self.get(id);
        if let Some(m) = class.declared_method(name, desc) {
            return Some((id, m));
        }
        if !inherited {
            return None;
        }
        class
            .super_classes
            .iter()
            .rev()
            .find_map(|sup| self.get(*sup).declared_method(name, desc).map(|m| (*sup, m)))
    }

    /// Looks a field up in `id` and then its superclasses.
    pub fn find_field(&self, id: ClassId, name: &[u8], desc: &[u8]) -> Option<(ClassId, u16)> {
        let class = self.get(id);
        if let Some(f) = class.declared_field(name, desc) {
            return Some((id, f));
        }
        class
            .super_classes
            .iter()
            .rev()
            .find_map(|sup| self.get(*sup).declared_field(name, desc).map(|f| (*sup, f)))
    }

    /// Every static field value of every linked class.
    pub fn static_values(&self) -> impl Iterator<Item = Var> + '_ {
        self.linked().flat_map(move |id| {
            self.get(id).fields.iter().filter_map(|f| match f.var {
                FieldVar::Static(v) => Some(v),
                FieldVar::Instance(_) => None,
            })
        })
    }
}

impl HeapLayout for ClassTable {
    fn instance_vars(&self, class_word: u32) -> usize {
        ClassId::from_class_word(class_word)
            .and_then(|id| self.try_get(id))
            .map_or(0, |c| c.num_vars as usize)
    }

    fn destroy_hook(&self, class_word: u32) -> Option<ObjectDestroyFn> {
        ClassId::from_class_word(class_word)
            .and_then(|id| self.try_get(id))
            .and_then(|c| c.destroy_hook)
    }
}
