//! Object heap with relocatable handles and a mark-sweep-compact collector.
//!
//! The heap works on a byte region owned by the arena. Objects are packed
//! upward from offset 0; the handle table grows downward from the end of
//! the region. Each handle table entry is three words:
//!
//! +-----------+-------------+-------------+
//! | ptr (u32) | order (u32) | temp (u32)  |
//! +-----------+-------------+-------------+
//!
//! `ptr` is the object's current offset (or `NULL_PTR` for a free handle).
//! `order` lists handle indices in object address order, live handles
//! first and free handles after them; its top bit doubles as the mark bit
//! of the entry's own handle. `temp` is scratch space for the collector.
use byteorder::{ByteOrder, LittleEndian};

use crate::value::{array_type, Var, WObject};

/// Handles are numbered from just above this value.
pub const FIRST_OBJ: u32 = 2244;

const HOS_SIZE: usize = 12;
const MARK_BIT: u32 = 0x8000_0000;
const NULL_PTR: u32 = u32::MAX;

/// Byte offset of the first array element.
pub const ARRAY_HEADER: usize = 12;

/// Hook run on an instance just before the collector discards it. It sees
/// the handle and the instance variables and must not allocate.
pub type ObjectDestroyFn = fn(WObject, &[Var]);

/// Object layout knowledge the collector needs from the class table.
pub trait HeapLayout {
    /// Number of instance variables for objects with this class word.
    fn instance_vars(&self, class_word: u32) -> usize;
    fn destroy_hook(&self, class_word: u32) -> Option<ObjectDestroyFn>;
}

/// Outcome of one collection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    pub live_objects: usize,
    pub freed_objects: usize,
    pub live_bytes: usize,
    pub freed_bytes: usize,
}

/// Size in bytes of an array object, `None` for unsupported element types
/// or negative lengths.
pub fn array_size(ty: u8, len: i32) -> Option<usize> {
    let elem = array_type::element_size(ty)?;
    let len = usize::try_from(len).ok()?;
    let size = ARRAY_HEADER.checked_add(elem.checked_mul(len)?)?;
    Some((size + 3) & !3)
}

pub fn read_word(mem: &[u8], at: usize) -> u32 {
    mem.get(at..at + 4).map_or(0, LittleEndian::read_u32)
}

pub fn write_word(mem: &mut [u8], at: usize, value: u32) {
    if let Some(bytes) = mem.get_mut(at..at + 4) {
        LittleEndian::write_u32(bytes, value);
    }
}

#[derive(Debug, Clone)]
pub struct ObjectHeap {
    mem_size: usize,
    num_handles: usize,
    num_free_handles: usize,
    object_size: usize,
}

impl ObjectHeap {
    /// Heap over the first `mem_size` bytes (rounded down to 4) of its
    /// region.
    pub fn new(mem_size: usize) -> Self {
        Self {
            mem_size: mem_size & !3,
            num_handles: 0,
            num_free_handles: 0,
            object_size: 0,
        }
    }

    pub fn total(&self) -> usize {
        self.mem_size
    }

    /// Bytes neither used by objects nor by the handle table.
    pub fn unused(&self) -> usize {
        self.mem_size - (self.object_size + self.num_handles * HOS_SIZE)
    }

    pub fn object_bytes(&self) -> usize {
        self.object_size
    }

    pub fn num_handles(&self) -> usize {
        self.num_handles
    }

    pub fn live_handles(&self) -> usize {
        self.num_handles - self.num_free_handles
    }

    fn hos(&self, i: usize) -> usize {
        self.mem_size - (i + 1) * HOS_SIZE
    }

    fn ptr(&self, mem: &[u8], i: usize) -> u32 {
        read_word(mem, self.hos(i))
    }

    fn set_ptr(&self, mem: &mut [u8], i: usize, v: u32) {
        write_word(mem, self.hos(i), v)
    }

    fn order(&self, mem: &[u8], i: usize) -> u32 {
        read_word(mem, self.hos(i) + 4)
    }

    fn set_order(&self, mem: &mut [u8], i: usize, v: u32) {
        write_word(mem, self.hos(i) + 4, v)
    }

    fn temp(&self, mem: &[u8], i: usize) -> u32 {
        read_word(mem, self.hos(i) + 8)
    }

    fn set_temp(&self, mem: &mut [u8], i: usize, v: u32) {
        write_word(mem, self.hos(i) + 8, v)
    }

    /// Whether `obj` is inside the handle range. Stack slots are untagged,
    /// so the collector treats any value in this range as a reference.
    pub fn is_valid(&self, obj: WObject) -> bool {
        obj.0 > FIRST_OBJ && obj.0 as usize <= FIRST_OBJ as usize + self.num_handles
    }

    fn index(obj: WObject) -> usize {
        (obj.0 - FIRST_OBJ - 1) as usize
    }

    /// Current offset of a live object in the region.
    pub fn address(&self, mem: &[u8], obj: WObject) -> Option<usize> {
        if !self.is_valid(obj) {
            return None;
        }
        match self.ptr(mem, Self::index(obj)) {
            NULL_PTR => None,
            p => Some(p as usize),
        }
    }

    /// Whether `size` more bytes fit without collecting.
    pub fn fits(&self, size: usize) -> bool {
        let mut need = size;
        if self.num_free_handles == 0 {
            need += HOS_SIZE;
        }
        need + self.num_handles * HOS_SIZE + self.object_size <= self.mem_size
    }

    /// Carves `size` zeroed bytes at the top of the object area. Callers
    /// collect and retry when this returns `None`.
    pub fn allocate(&mut self, mem: &mut [u8], size: usize) -> Option<WObject> {
        if size == 0 || !self.fits(size) {
            return None;
        }
        let i = if self.num_free_handles > 0 {
            let i = self.order(mem, self.num_handles - self.num_free_handles) as usize;
            self.num_free_handles -= 1;
            i
        } else {
            let i = self.num_handles;
            self.num_handles += 1;
            self.set_order(mem, i, i as u32);
            i
        };
        let at = self.object_size;
        self.set_ptr(mem, i, at as u32);
        mem[at..at + size].fill(0);
        self.object_size += size;
        Some(WObject(FIRST_OBJ + i as u32 + 1))
    }

    fn is_marked(&self, mem: &[u8], obj: WObject) -> bool {
        self.order(mem, Self::index(obj)) & MARK_BIT != 0
    }

    fn set_mark(&self, mem: &mut [u8], obj: WObject) {
        let i = Self::index(obj);
        let order = self.order(mem, i);
        self.set_order(mem, i, order | MARK_BIT);
    }

    fn should_mark(&self, mem: &[u8], obj: WObject) -> bool {
        self.address(mem, obj).is_some() && !self.is_marked(mem, obj)
    }

    /// Marks everything reachable from `root`. The scan stack lives in the
    /// `temp` words, so no host memory is needed however deep the graph.
    pub fn mark<L: HeapLayout + ?Sized>(&self, mem: &mut [u8], root: WObject, layout: &L) {
        if !self.should_mark(mem, root) {
            return;
        }
        self.set_mark(mem, root);
        let mut pending = 0usize;
        let mut obj = root;
        loop {
            let Some(at) = self.address(mem, obj) else {
                break;
            };
            let class_word = read_word(mem, at);
            let (first, count) = if class_word == 0 {
                let ty = read_word(mem, at + 4) as u8;
                if array_type::is_reference(ty) {
                    (at + ARRAY_HEADER, read_word(mem, at + 8) as usize)
                } else {
                    (at, 0)
                }
            } else {
                (at + 4, layout.instance_vars(class_word))
            };
            for k in 0..count {
                let child = WObject(read_word(mem, first + k * 4));
                if self.should_mark(mem, child) {
                    self.set_mark(mem, child);
                    self.set_temp(mem, pending, child.0);
                    pending += 1;
                }
            }
            if pending == 0 {
                break;
            }
            pending -= 1;
            obj = WObject(self.temp(mem, pending));
        }
    }

    fn size_at<L: HeapLayout + ?Sized>(mem: &[u8], at: usize, layout: &L) -> usize {
        let class_word = read_word(mem, at);
        if class_word == 0 {
            let ty = read_word(mem, at + 4) as u8;
            let len = read_word(mem, at + 8) as i32;
            array_size(ty, len).unwrap_or(ARRAY_HEADER)
        } else {
            (layout.instance_vars(class_word) + 1) * 4
        }
    }

    fn destroy<L: HeapLayout + ?Sized>(mem: &[u8], obj: WObject, at: usize, layout: &L) {
        let class_word = read_word(mem, at);
        if class_word == 0 {
            return;
        }
        if let Some(hook) = layout.destroy_hook(class_word) {
            let vars: Vec<Var> = (0..layout.instance_vars(class_word))
                .map(|k| Var::from_raw(read_word(mem, at + 4 + k * 4)))
                .collect();
            hook(obj, &vars);
        }
    }

    /// Frees unmarked objects and slides the survivors down in address
    /// order. Memory above the new top is zeroed.
    pub fn sweep<L: HeapLayout + ?Sized>(&mut self, mem: &mut [u8], layout: &L) -> GcStats {
        let prev_size = self.object_size;
        let mut stats = GcStats::default();
        self.object_size = 0;

        for i in 0..self.num_handles {
            let order = self.order(mem, i);
            if order & MARK_BIT != 0 {
                self.set_order(mem, i, order & !MARK_BIT);
                self.set_temp(mem, i, 1);
            } else {
                self.set_temp(mem, i, 0);
            }
        }

        let mut used = 0usize;
        for i in 0..self.num_handles {
            let h = self.order(mem, i) as usize;
            let obj = WObject(FIRST_OBJ + h as u32 + 1);
            let ptr = self.ptr(mem, h);
            if self.temp(mem, h) == 0 {
                if ptr != NULL_PTR {
                    let at = ptr as usize;
                    stats.freed_objects += 1;
                    stats.freed_bytes += Self::size_at(mem, at, layout);
                    Self::destroy(mem, obj, at, layout);
                    self.set_ptr(mem, h, NULL_PTR);
                }
                continue;
            }
            let src = ptr as usize;
            let size = Self::size_at(mem, src, layout);
            let dst = self.object_size;
            if src != dst {
                mem.copy_within(src..src + size, dst);
            }
            self.set_ptr(mem, h, dst as u32);
            self.set_order(mem, used, h as u32);
            self.object_size += size;
            used += 1;
        }
        stats.live_objects = used;
        stats.live_bytes = self.object_size;

        self.num_free_handles = self.num_handles - used;
        for i in 0..self.num_handles {
            if self.temp(mem, i) == 0 {
                self.set_order(mem, used, i as u32);
                used += 1;
            }
        }
        mem[self.object_size..prev_size].fill(0);
        stats
    }

    /// Runs the destroy hook of every live object, used at teardown.
    pub fn destroy_all<L: HeapLayout + ?Sized>(&mut self, mem: &[u8], layout: &L) {
        for h in 0..self.num_handles {
            let obj = WObject(FIRST_OBJ + h as u32 + 1);
            if let Some(at) = self.address(mem, obj) {
                Self::destroy(mem, obj, at, layout);
            }
        }
        self.num_handles = 0;
        self.num_free_handles = 0;
        self.object_size = 0;
    }
}
