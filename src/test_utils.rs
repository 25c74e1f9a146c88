//! Class file builder and a minimal class library for tests.
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, Write};
use std::rc::Rc;

use crate::config::VmConfig;
use crate::jvm::{self, ACC_ABSTRACT, ACC_INTERFACE, ACC_NATIVE, ACC_PUBLIC, ACC_STATIC};
use crate::program::WClassHandler;
use crate::provider::MemoryProvider;
use crate::runtime::{Runtime, RuntimeBuilder};

/// Assembles class files in memory. Constants are interned, so asking for
/// the same constant twice returns the same index.
#[derive(Debug)]
pub struct ClassFileBuilder {
    pool: Vec<u8>,
    count: u16,
    interned: HashMap<(u8, Vec<u8>), u16>,
    access: u16,
    this_class: u16,
    super_class: u16,
    interfaces: Vec<u16>,
    fields: Vec<u8>,
    field_count: u16,
    methods: Vec<u8>,
    method_count: u16,
}

impl ClassFileBuilder {
    pub fn new(name: &str, super_class: Option<&str>) -> Self {
        let mut builder = Self {
            pool: Vec::new(),
            count: 1,
            interned: HashMap::new(),
            access: ACC_PUBLIC,
            this_class: 0,
            super_class: 0,
            interfaces: Vec::new(),
            fields: Vec::new(),
            field_count: 0,
            methods: Vec::new(),
            method_count: 0,
        };
        builder.this_class = builder.class(name);
        if let Some(sup) = super_class {
            builder.super_class = builder.class(sup);
        }
        builder
    }

    fn intern(&mut self, tag: u8, key: Vec<u8>, body: &[u8]) -> u16 {
        if let Some(idx) = self.interned.get(&(tag, key.clone())) {
            return *idx;
        }
        let idx = self.count;
        self.pool.push(tag);
        self.pool.extend_from_slice(body);
        self.count += 1;
        self.interned.insert((tag, key), idx);
        idx
    }

    pub fn utf8(&mut self, s: &str) -> u16 {
        let mut body = (s.len() as u16).to_be_bytes().to_vec();
        body.extend_from_slice(s.as_bytes());
        self.intern(jvm::CONSTANT_UTF8, s.as_bytes().to_vec(), &body)
    }

    pub fn class(&mut self, name: &str) -> u16 {
        let name_idx = self.utf8(name);
        self.intern(jvm::CONSTANT_CLASS, name.as_bytes().to_vec(), &name_idx.to_be_bytes())
    }

    pub fn string(&mut self, s: &str) -> u16 {
        let idx = self.utf8(s);
        self.intern(jvm::CONSTANT_STRING, s.as_bytes().to_vec(), &idx.to_be_bytes())
    }

    pub fn integer(&mut self, value: i32) -> u16 {
        let bytes = value.to_be_bytes();
        self.intern(jvm::CONSTANT_INTEGER, bytes.to_vec(), &bytes)
    }

    pub fn name_and_type(&mut self, name: &str, desc: &str) -> u16 {
        let n = self.utf8(name);
        let d = self.utf8(desc);
        let mut body = n.to_be_bytes().to_vec();
        body.extend_from_slice(&d.to_be_bytes());
        self.intern(jvm::CONSTANT_NAME_AND_TYPE, body.clone(), &body)
    }

    fn member(&mut self, tag: u8, class: &str, name: &str, desc: &str) -> u16 {
        let c = self.class(class);
        let nt = self.name_and_type(name, desc);
        let mut body = c.to_be_bytes().to_vec();
        body.extend_from_slice(&nt.to_be_bytes());
        self.intern(tag, body.clone(), &body)
    }

    pub fn field_ref(&mut self, class: &str, name: &str, desc: &str) -> u16 {
        self.member(jvm::CONSTANT_FIELDREF, class, name, desc)
    }

    pub fn method_ref(&mut self, class: &str, name: &str, desc: &str) -> u16 {
        self.member(jvm::CONSTANT_METHODREF, class, name, desc)
    }

    pub fn interface_method_ref(&mut self, class: &str, name: &str, desc: &str) -> u16 {
        self.member(jvm::CONSTANT_INTERFACE_METHODREF, class, name, desc)
    }

    pub fn access(&mut self, flags: u16) -> &mut Self {
        self.access = flags;
        self
    }

    pub fn interface(&mut self, name: &str) -> &mut Self {
        let idx = self.class(name);
        self.interfaces.push(idx);
        self
    }

    pub fn field(&mut self, flags: u16, name: &str, desc: &str) -> &mut Self {
        let n = self.utf8(name);
        let d = self.utf8(desc);
        self.fields.extend_from_slice(&flags.to_be_bytes());
        self.fields.extend_from_slice(&n.to_be_bytes());
        self.fields.extend_from_slice(&d.to_be_bytes());
        self.fields.extend_from_slice(&0u16.to_be_bytes());
        self.field_count += 1;
        self
    }

    /// Static field initialized from a `ConstantValue` attribute.
    pub fn static_constant(&mut self, name: &str, desc: &str, constant: u16) -> &mut Self {
        let n = self.utf8(name);
        let d = self.utf8(desc);
        let attr = self.utf8("ConstantValue");
        self.fields.extend_from_slice(&(ACC_PUBLIC | ACC_STATIC).to_be_bytes());
        self.fields.extend_from_slice(&n.to_be_bytes());
        self.fields.extend_from_slice(&d.to_be_bytes());
        self.fields.extend_from_slice(&1u16.to_be_bytes());
        self.fields.extend_from_slice(&attr.to_be_bytes());
        self.fields.extend_from_slice(&2u32.to_be_bytes());
        self.fields.extend_from_slice(&constant.to_be_bytes());
        self.field_count += 1;
        self
    }

    #[allow(clippy::too_many_arguments)]
    pub fn method(
        &mut self,
        flags: u16,
        name: &str,
        desc: &str,
        max_stack: u16,
        max_locals: u16,
        code: &[u8],
        handlers: &[WClassHandler],
    ) -> &mut Self {
        let n = self.utf8(name);
        let d = self.utf8(desc);
        let code_attr = self.utf8("Code");
        // A sub attribute the loader has to skip.
        let lines = self.utf8("LineNumberTable");

        let mut body = Vec::new();
        body.extend_from_slice(&max_stack.to_be_bytes());
        body.extend_from_slice(&max_locals.to_be_bytes());
        body.extend_from_slice(&(code.len() as u32).to_be_bytes());
        body.extend_from_slice(code);
        body.extend_from_slice(&(handlers.len() as u16).to_be_bytes());
        for h in handlers {
            body.extend_from_slice(&h.start_pc.to_be_bytes());
            body.extend_from_slice(&h.end_pc.to_be_bytes());
            body.extend_from_slice(&h.handler_pc.to_be_bytes());
            body.extend_from_slice(&h.catch_type.to_be_bytes());
        }
        body.extend_from_slice(&1u16.to_be_bytes());
        body.extend_from_slice(&lines.to_be_bytes());
        body.extend_from_slice(&6u32.to_be_bytes());
        body.extend_from_slice(&[0, 1, 0, 0, 0, 1]);

        self.methods.extend_from_slice(&flags.to_be_bytes());
        self.methods.extend_from_slice(&n.to_be_bytes());
        self.methods.extend_from_slice(&d.to_be_bytes());
        self.methods.extend_from_slice(&1u16.to_be_bytes());
        self.methods.extend_from_slice(&code_attr.to_be_bytes());
        self.methods.extend_from_slice(&(body.len() as u32).to_be_bytes());
        self.methods.extend_from_slice(&body);
        self.method_count += 1;
        self
    }

    fn bodiless_method(&mut self, flags: u16, name: &str, desc: &str) -> &mut Self {
        let n = self.utf8(name);
        let d = self.utf8(desc);
        self.methods.extend_from_slice(&flags.to_be_bytes());
        self.methods.extend_from_slice(&n.to_be_bytes());
        self.methods.extend_from_slice(&d.to_be_bytes());
        self.methods.extend_from_slice(&0u16.to_be_bytes());
        self.method_count += 1;
        self
    }

    pub fn native_method(&mut self, flags: u16, name: &str, desc: &str) -> &mut Self {
        self.bodiless_method(flags | ACC_NATIVE, name, desc)
    }

    pub fn abstract_method(&mut self, name: &str, desc: &str) -> &mut Self {
        self.bodiless_method(ACC_PUBLIC | ACC_ABSTRACT, name, desc)
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&jvm::MAGIC.to_be_bytes());
        out.extend_from_slice(&[0, 0, 0, 50]);
        out.extend_from_slice(&self.count.to_be_bytes());
        out.extend_from_slice(&self.pool);
        out.extend_from_slice(&self.access.to_be_bytes());
        out.extend_from_slice(&self.this_class.to_be_bytes());
        out.extend_from_slice(&self.super_class.to_be_bytes());
        out.extend_from_slice(&(self.interfaces.len() as u16).to_be_bytes());
        for i in &self.interfaces {
            out.extend_from_slice(&i.to_be_bytes());
        }
        out.extend_from_slice(&self.field_count.to_be_bytes());
        out.extend_from_slice(&self.fields);
        out.extend_from_slice(&self.method_count.to_be_bytes());
        out.extend_from_slice(&self.methods);
        out.extend_from_slice(&0u16.to_be_bytes());
        out
    }
}

pub const OBJECT: &str = "java/lang/Object";

/// Default constructor chaining to `super_class`.
pub fn add_default_init(builder: &mut ClassFileBuilder, super_class: &str) {
    let init = builder.method_ref(super_class, "<init>", "()V");
    let [hi, lo] = init.to_be_bytes();
    builder.method(
        ACC_PUBLIC,
        "<init>",
        "()V",
        1,
        1,
        &[0x2a, 0xb7, hi, lo, 0xb1],
        &[],
    );
}

fn simple_class(name: &str, super_class: &str) -> Vec<u8> {
    let mut b = ClassFileBuilder::new(name, Some(super_class));
    add_default_init(&mut b, super_class);
    b.build()
}

/// Object, String, the exception hierarchy the runtime throws and the
/// framework classes with their native methods.
pub fn library() -> MemoryProvider {
    let mut provider = MemoryProvider::new();

    let mut object = ClassFileBuilder::new(OBJECT, None);
    object.method(ACC_PUBLIC, "<init>", "()V", 0, 1, &[0xb1], &[]);
    provider.insert(OBJECT, object.build());

    let mut string = ClassFileBuilder::new("java/lang/String", Some(OBJECT));
    string.field(0, "chars", "[C");
    add_default_init(&mut string, OBJECT);
    provider.insert("java/lang/String", string.build());

    provider.insert("java/lang/Throwable", simple_class("java/lang/Throwable", OBJECT));
    provider.insert(
        "java/lang/Exception",
        simple_class("java/lang/Exception", "java/lang/Throwable"),
    );
    provider.insert(
        "java/lang/RuntimeException",
        simple_class("java/lang/RuntimeException", "java/lang/Exception"),
    );
    provider.insert(
        "java/lang/ClassNotFoundException",
        simple_class("java/lang/ClassNotFoundException", "java/lang/Exception"),
    );
    for name in [
        "java/lang/NullPointerException",
        "java/lang/ArithmeticException",
        "java/lang/ClassCastException",
        "java/lang/NegativeArraySizeException",
        "java/lang/ArrayStoreException",
        "java/lang/IndexOutOfBoundsException",
    ] {
        provider.insert(name, simple_class(name, "java/lang/RuntimeException"));
    }
    provider.insert(
        "java/lang/ArrayIndexOutOfBoundsException",
        simple_class(
            "java/lang/ArrayIndexOutOfBoundsException",
            "java/lang/IndexOutOfBoundsException",
        ),
    );

    let mut system = ClassFileBuilder::new("base/framework/System", Some(OBJECT));
    let flags = ACC_PUBLIC | ACC_STATIC;
    system
        .native_method(flags, "gc", "()V")
        .native_method(flags, "print", "(Ljava/lang/String;)V")
        .native_method(flags, "newInstance", "(Ljava/lang/String;)Ljava/lang/Object;")
        .native_method(flags, "getClassName", "(Ljava/lang/Object;)Ljava/lang/String;")
        .native_method(flags, "arraycopy", "(Ljava/lang/Object;ILjava/lang/Object;II)V")
        .native_method(flags, "hasClass", "(Ljava/lang/String;)Z")
        .native_method(flags, "printStackTrace", "()V")
        .native_method(flags, "getInput", "(I)[Ljava/lang/String;")
        .native_method(flags, "setOutput", "([Ljava/lang/String;)V")
        .native_method(flags, "sleep", "(I)I");
    provider.insert("base/framework/System", system.build());

    let mut convert = ClassFileBuilder::new("base/framework/Convert", Some(OBJECT));
    convert
        .native_method(flags, "toInt", "(Ljava/lang/String;)I")
        .native_method(flags, "toString", "(I)Ljava/lang/String;")
        .native_method(flags, "toString", "(C)Ljava/lang/String;")
        .native_method(flags, "toString", "(Z)Ljava/lang/String;");
    provider.insert("base/framework/Convert", convert.build());

    let mut util = ClassFileBuilder::new("base/framework/Util", Some(OBJECT));
    util.native_method(flags, "byteArrayCopy", "([BI[BII)V")
        .native_method(flags, "byteArrayFill", "([BIIB)V")
        .native_method(flags, "byteArrayCompare", "([BI[BII)I");
    provider.insert("base/framework/Util", util.build());

    let mut runnable = ClassFileBuilder::new("test/Runnable", Some(OBJECT));
    runnable
        .access(ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT)
        .abstract_method("run", "()I");
    provider.insert("test/Runnable", runnable.build());

    provider
}

/// Output sink that tests can read back.
#[derive(Debug, Clone, Default)]
pub struct SharedOutput(Rc<RefCell<Vec<u8>>>);

impl SharedOutput {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Runtime over the library plus `classes`, with its output captured.
pub fn runtime_with(config: VmConfig, classes: Vec<(&str, Vec<u8>)>) -> (Runtime, SharedOutput) {
    let mut provider = library();
    for (name, bytes) in classes {
        provider.insert(name, bytes);
    }
    let output = SharedOutput::default();
    let runtime = RuntimeBuilder::new(config)
        .provider(provider)
        .output(output.clone())
        .build()
        .unwrap();
    (runtime, output)
}

pub fn runtime(classes: Vec<(&str, Vec<u8>)>) -> (Runtime, SharedOutput) {
    runtime_with(VmConfig::default(), classes)
}

/// Handler entry shorthand.
pub fn handler(start_pc: u16, end_pc: u16, handler_pc: u16, catch_type: u16) -> WClassHandler {
    WClassHandler {
        start_pc,
        end_pc,
        handler_pc,
        catch_type,
    }
}
