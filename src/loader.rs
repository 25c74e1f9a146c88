//! Class loading and class relations.
//!
//! A class is registered in the class table as soon as its header has been
//! read, so that references back to it while its superclass, static
//! initializers or constant strings are being processed resolve to the
//! partially built descriptor. Any later failure unlinks it again.
use log::{debug, trace};

use crate::error::{Result, VmError};
use crate::interpreter::MethodResult;
use crate::jvm::{self, ClassFormatError, ClassReader, ACC_NATIVE, ACC_STATIC};
use crate::program::{
    count_params, returns_value, ClassId, CodeAttr, ConstantPool, FieldVar, MethodCode, WClass,
    WClassField, WClassHandler, WClassMethod,
};
use crate::provider::ProviderError;
use crate::runtime::{Runtime, OBJECT_CLASS};
use crate::value::{array_type, Var, WObject};

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

impl Runtime {
    /// Returns the loaded class called `name`, loading it on first use.
    pub(crate) fn resolve_class_bytes(&mut self, name: &[u8]) -> Result<ClassId> {
        match self.classes.find(name) {
            Some(id) => Ok(id),
            None => self.load_class(name),
        }
    }

    fn load_class(&mut self, name: &[u8]) -> Result<ClassId> {
        let class_name = lossy(name);
        if name.is_empty() || name[0] == b'[' {
            return Err(VmError::BadClassName(class_name));
        }
        let bytes = self
            .provider
            .load_class(&class_name)
            .map_err(|e| match e {
                ProviderError::NotFound(n) => VmError::ClassNotFound(n),
                other => VmError::Provider(other),
            })?;
        let layout = jvm::scan_constant_pool(&bytes).map_err(|e| match e {
            ClassFormatError::BadMagic(_) => VmError::BadMagic(class_name.clone()),
            ClassFormatError::ConstantOffsetTooLarge { .. } => {
                VmError::ClassTooLarge(class_name.clone())
            }
            _ => VmError::LoadConstant(class_name.clone()),
        })?;

        let mut reader = ClassReader::at(&bytes, layout.end);
        let header = (|| -> std::result::Result<_, ClassFormatError> {
            Ok((reader.u16()?, reader.u16()?, reader.u16()?))
        })();
        let (access_flags, this_class, super_class) =
            header.map_err(|_| VmError::LoadConstant(class_name.clone()))?;

        let pool = ConstantPool::new(bytes.clone(), layout.offsets);
        let name_index = pool.name_index(this_class);
        if pool.utf8(name_index) != name {
            return Err(VmError::BadClassName(class_name));
        }
        let charged = self.classes.charge_class(&pool)?;
        let class = WClass {
            pool,
            access_flags,
            name_index,
            super_classes: Vec::new(),
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            num_vars: 0,
            destroy_hook: None,
            next_class: None,
        };
        let id = self.classes.insert(class, charged)?;
        debug!("loading class {}", class_name);

        match self.link_class(id, &bytes, reader.position(), super_class, &class_name) {
            Ok(()) => Ok(id),
            Err(e) => {
                debug!("loading {} failed: {}", class_name, e);
                self.classes.unlink(id);
                Err(e)
            }
        }
    }

    fn link_class(
        &mut self,
        id: ClassId,
        bytes: &[u8],
        at: usize,
        super_index: u16,
        class_name: &str,
    ) -> Result<()> {
        if super_index != 0 {
            let super_name = {
                let pool = &self.classes.get(id).pool;
                pool.utf8(pool.name_index(super_index)).to_vec()
            };
            let sup = self.resolve_class_bytes(&super_name)?;
            let parent = self.classes.get(sup);
            let mut supers = parent.super_classes.clone();
            supers.push(sup);
            let num_vars = parent.num_vars;
            self.classes.charge_supers(id, supers.len())?;
            let class = self.classes.get_mut(id);
            class.super_classes = supers;
            class.num_vars = num_vars;
        }

        let mut reader = ClassReader::at(bytes, at);
        let load_const = |_| VmError::LoadConstant(class_name.to_string());
        let count = reader.u16().map_err(load_const)?;
        self.classes.charge_interfaces(id, count as usize)?;
        let mut interfaces = Vec::with_capacity(count as usize);
        for _ in 0..count {
            interfaces.push(reader.u16().map_err(load_const)?);
        }
        self.classes.get_mut(id).interfaces = interfaces;

        self.read_fields(id, &mut reader, class_name)?;

        let load_method = |_| VmError::LoadMethod(class_name.to_string());
        let count = reader.u16().map_err(load_method)?;
        self.classes.charge_methods(id, count as usize)?;
        for _ in 0..count {
            let method = self.read_method(id, &mut reader, class_name)?;
            self.classes.get_mut(id).methods.push(method);
        }

        self.set_class_hooks(id, class_name)?;
        self.run_clinit(id, class_name)
    }

    /// Static fields are pushed one by one so that strings created for
    /// earlier constants are already reachable from the class.
    fn read_fields(&mut self, id: ClassId, reader: &mut ClassReader, class_name: &str) -> Result<()> {
        let load_field = |_| VmError::LoadField(class_name.to_string());
        let count = reader.u16().map_err(load_field)?;
        self.classes.charge_fields(id, count as usize)?;
        for _ in 0..count {
            let access_flags = reader.u16().map_err(load_field)?;
            let name_index = reader.u16().map_err(load_field)?;
            let desc_index = reader.u16().map_err(load_field)?;
            let attributes = reader.u16().map_err(load_field)?;
            let is_static = access_flags & ACC_STATIC != 0;
            let mut constant = None;
            for _ in 0..attributes {
                let attr_name = reader.u16().map_err(load_field)?;
                let len = reader.u32().map_err(load_field)? as usize;
                let is_constant = is_static
                    && len == 2
                    && self.classes.get(id).pool.utf8(attr_name) == b"ConstantValue";
                if is_constant {
                    constant = Some(reader.u16().map_err(load_field)?);
                } else {
                    reader.skip(len).map_err(load_field)?;
                }
            }

            let var = if is_static {
                let value = match constant {
                    Some(idx) => self.constant_to_var(id, idx)?,
                    None => Var::ZERO,
                };
                FieldVar::Static(value)
            } else {
                let class = self.classes.get_mut(id);
                let slot = class.num_vars;
                class.num_vars = slot
                    .checked_add(1)
                    .ok_or_else(|| VmError::LoadField(class_name.to_string()))?;
                FieldVar::Instance(slot)
            };
            self.classes.get_mut(id).fields.push(WClassField {
                access_flags,
                name_index,
                desc_index,
                var,
            });
        }
        Ok(())
    }

    fn read_method(
        &mut self,
        id: ClassId,
        reader: &mut ClassReader,
        class_name: &str,
    ) -> Result<WClassMethod> {
        let load_method = |_| VmError::LoadMethod(class_name.to_string());
        let access_flags = reader.u16().map_err(load_method)?;
        let name_index = reader.u16().map_err(load_method)?;
        let desc_index = reader.u16().map_err(load_method)?;
        let attributes = reader.u16().map_err(load_method)?;

        let mut code = None;
        let mut handlers = Vec::new();
        for _ in 0..attributes {
            let attr_name = reader.u16().map_err(load_method)?;
            let len = reader.u32().map_err(load_method)? as usize;
            if self.classes.get(id).pool.utf8(attr_name) != b"Code" {
                reader.skip(len).map_err(load_method)?;
                continue;
            }
            let max_stack = reader.u16().map_err(load_method)?;
            let max_locals = reader.u16().map_err(load_method)?;
            let code_len = reader.u32().map_err(load_method)? as usize;
            let start = reader.position();
            reader.skip(code_len).map_err(load_method)?;
            let count = reader.u16().map_err(load_method)?;
            self.classes.charge_handlers(id, count as usize)?;
            for _ in 0..count {
                handlers.push(WClassHandler {
                    start_pc: reader.u16().map_err(load_method)?,
                    end_pc: reader.u16().map_err(load_method)?,
                    handler_pc: reader.u16().map_err(load_method)?,
                    catch_type: reader.u16().map_err(load_method)?,
                });
            }
            reader.skip_attributes().map_err(load_method)?;
            code = Some(CodeAttr {
                max_stack,
                max_locals,
                start,
                len: code_len,
            });
        }

        let class = self.classes.get(id);
        let name = class.pool.utf8(name_index);
        let desc = class.pool.utf8(desc_index);
        let signature = || format!("{}.{}{}", class_name, lossy(name), lossy(desc));
        let num_params = count_params(desc).ok_or_else(|| VmError::BadParamNum(signature()))?;
        let receiver = u16::from(access_flags & ACC_STATIC == 0);

        let code = if access_flags & ACC_NATIVE != 0 {
            let func = self
                .natives
                .lookup(class.name_bytes(), name, desc)
                .ok_or_else(|| VmError::NativeNotFound {
                    class: class_name.to_string(),
                    name: lossy(name),
                    desc: lossy(desc),
                })?;
            MethodCode::Native(func)
        } else if let Some(code) = code {
            if code.max_locals < num_params + receiver {
                return Err(VmError::LoadMethod(signature()));
            }
            MethodCode::Bytecode(code)
        } else {
            MethodCode::None
        };
        trace!("method {}", signature());

        Ok(WClassMethod {
            access_flags,
            name_index,
            desc_index,
            code,
            num_params,
            returns_value: returns_value(desc),
            is_init: name.starts_with(b"<i"),
            handlers,
        })
    }

    /// Applies the hook registered for this class, or inherits the
    /// superclass hook.
    fn set_class_hooks(&mut self, id: ClassId, class_name: &str) -> Result<()> {
        let hook = self
            .hooks
            .iter()
            .find(|h| h.class_name == class_name)
            .copied();
        let super_hook = self
            .classes
            .get(id)
            .super_class()
            .and_then(|sup| self.classes.get(sup).destroy_hook);
        let class = self.classes.get_mut(id);
        match hook {
            Some(hook) => {
                class.destroy_hook = Some(hook.destroy);
                class.num_vars = class
                    .num_vars
                    .checked_add(hook.vars_needed)
                    .ok_or_else(|| VmError::LoadField(class_name.to_string()))?;
            }
            None => class.destroy_hook = super_hook,
        }
        Ok(())
    }

    fn run_clinit(&mut self, id: ClassId, class_name: &str) -> Result<()> {
        let Some(method) = self.classes.get(id).declared_method(b"<clinit>", b"()V") else {
            return Ok(());
        };
        trace!("running {}.<clinit>", class_name);
        match self.execute_method(id, method, &[]) {
            Ok(MethodResult::Returned(None)) => Ok(()),
            outcome => {
                if let Ok(MethodResult::Exception(exc)) = outcome {
                    debug!("{}.<clinit> threw {}", class_name, exc);
                }
                let err = VmError::ClinitFailed(class_name.to_string());
                self.record_fatal(&err);
                Err(err)
            }
        }
    }

    /// Resolves the class named by a Class constant of `class`.
    pub(crate) fn class_by_index(&mut self, class: ClassId, idx: u16) -> Result<ClassId> {
        let name = {
            let pool = &self.classes.get(class).pool;
            if pool.tag(idx) != Some(jvm::CONSTANT_CLASS) {
                return Err(VmError::ConstantToVar(idx));
            }
            pool.utf8(pool.name_index(idx)).to_vec()
        };
        self.resolve_class_bytes(&name)
    }

    /// Value of an Integer or String constant.
    pub(crate) fn constant_to_var(&mut self, class: ClassId, idx: u16) -> Result<Var> {
        let pool = &self.classes.get(class).pool;
        match pool.tag(idx) {
            Some(jvm::CONSTANT_INTEGER) => pool
                .integer(idx)
                .map(Var::from_int)
                .ok_or(VmError::ConstantToVar(idx)),
            Some(jvm::CONSTANT_STRING) => {
                let text = pool.utf8_str(pool.string_index(idx)).into_owned();
                self.create_string(&text).map(Var::from_obj)
            }
            _ => Err(VmError::ConstantToVar(idx)),
        }
    }

    /// Whether instances of `source` can be used as `target`: same class,
    /// a superclass, or an interface implemented anywhere up the chain.
    pub fn compatible(&mut self, source: ClassId, target: ClassId) -> Result<bool> {
        if source == target {
            return Ok(true);
        }
        let class = self.classes.get(source);
        if class.super_classes.contains(&target) {
            return Ok(true);
        }
        if !self.classes.get(target).is_interface() {
            return Ok(false);
        }
        let mut chain = class.super_classes.clone();
        chain.push(source);
        for id in chain {
            let interfaces = self.classes.get(id).interfaces.clone();
            for idx in interfaces {
                let interface = self.class_by_index(id, idx)?;
                if self.compatible(interface, target)? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Whether `obj` is an instance of the type named by Class constant
    /// `idx` of `class`. Null is never an instance.
    pub(crate) fn is_instance(&mut self, obj: WObject, class: ClassId, idx: u16) -> Result<bool> {
        if obj.is_null() {
            return Ok(false);
        }
        let target = {
            let pool = &self.classes.get(class).pool;
            pool.utf8(pool.name_index(idx)).to_vec()
        };
        if let Some(ty) = self.array_type(obj) {
            return Ok(match target.first() {
                Some(b'[') => match target.get(1) {
                    Some(b'L') | Some(b'[') => array_type::is_reference(ty),
                    Some(c) => array_type::from_descriptor(*c) == Some(ty),
                    None => false,
                },
                _ => target == OBJECT_CLASS.as_bytes(),
            });
        }
        if target.first() == Some(&b'[') {
            return Ok(false);
        }
        let Some(source) = self.class_of(obj) else {
            return Ok(false);
        };
        let target = self.resolve_class_bytes(&target)?;
        self.compatible(source, target)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::VmConfig;
    use crate::error::{ErrorCode, Severity, VmError};
    use crate::jvm::{ACC_NATIVE, ACC_PUBLIC, ACC_STATIC};
    use crate::test_utils::{self, add_default_init, ClassFileBuilder, OBJECT};
    use crate::value::Var;

    const STATIC: u16 = ACC_PUBLIC | ACC_STATIC;

    #[test]
    fn static_constants_are_set_at_load() {
        let mut b = ClassFileBuilder::new("test/Consts", Some(OBJECT));
        let seven = b.integer(7);
        let name = b.string("pour");
        b.static_constant("SEVEN", "I", seven)
            .static_constant("NAME", "Ljava/lang/String;", name)
            .field(STATIC, "ZERO", "I");
        let (mut rt, _) = test_utils::runtime(vec![("test/Consts", b.build())]);

        assert_eq!(rt.get_static("test/Consts", "SEVEN", "I").unwrap(), Var::from_int(7));
        assert_eq!(rt.get_static("test/Consts", "ZERO", "I").unwrap(), Var::ZERO);
        // Statics are roots.
        rt.gc();
        let s = rt
            .get_static("test/Consts", "NAME", "Ljava/lang/String;")
            .unwrap()
            .obj();
        assert_eq!(rt.string_to_utf(s).as_deref(), Some("pour"));
        assert!(matches!(
            rt.get_static("test/Consts", "MISSING", "I"),
            Err(VmError::FieldNotFound { .. })
        ));
    }

    #[test]
    fn superclass_chain_and_instance_vars_are_inherited() {
        let mut a = ClassFileBuilder::new("test/A", Some(OBJECT));
        a.field(0, "x", "I").field(STATIC, "count", "I");
        add_default_init(&mut a, OBJECT);
        let mut b = ClassFileBuilder::new("test/B", Some("test/A"));
        b.field(0, "y", "I").field(0, "z", "Ljava/lang/Object;");
        add_default_init(&mut b, "test/A");
        let (mut rt, _) = test_utils::runtime(vec![("test/A", a.build()), ("test/B", b.build())]);

        let b = rt.resolve_class("test/B").unwrap();
        let a = rt.resolve_class("test/A").unwrap();
        let object = rt.resolve_class(OBJECT).unwrap();
        let class = rt.classes().get(b);
        assert_eq!(class.super_classes, vec![object, a]);
        assert_eq!(class.num_vars, 3);
        assert_eq!(rt.classes().get(a).num_vars, 1);
        assert!(rt.compatible(b, a).unwrap());
        assert!(!rt.compatible(a, b).unwrap());
        assert!(rt.classes().heap_used() > 0);
    }

    #[test]
    fn failed_loads_are_unlinked() {
        let orphan = ClassFileBuilder::new("test/Orphan", Some("test/Missing")).build();
        let (mut rt, _) = test_utils::runtime(vec![("test/Orphan", orphan)]);
        assert!(matches!(
            rt.resolve_class("test/Orphan"),
            Err(VmError::ClassNotFound(name)) if name == "test/Missing"
        ));
        assert_eq!(rt.classes().find(b"test/Orphan"), None);
        assert_eq!(rt.status().code, ErrorCode::CantFindClass);
    }

    #[test]
    fn malformed_classes_are_rejected() {
        let mut bad = ClassFileBuilder::new("test/Bad", Some(OBJECT)).build();
        bad[3] = 0;
        let mut big = ClassFileBuilder::new("test/Big", Some(OBJECT));
        for c in ["x", "y", "z"] {
            big.utf8(&c.repeat(0x7000));
        }
        let misnamed = ClassFileBuilder::new("test/Other", Some(OBJECT)).build();
        let (mut rt, _) = test_utils::runtime(vec![
            ("test/Bad", bad),
            ("test/Big", big.build()),
            ("test/Misnamed", misnamed),
        ]);
        assert!(matches!(rt.resolve_class("test/Bad"), Err(VmError::BadMagic(_))));
        assert!(matches!(rt.resolve_class("test/Big"), Err(VmError::ClassTooLarge(_))));
        assert!(matches!(
            rt.resolve_class("test/Misnamed"),
            Err(VmError::BadClassName(_))
        ));
        assert!(matches!(rt.resolve_class("[I"), Err(VmError::BadClassName(_))));
    }

    #[test]
    fn unknown_natives_fail_the_load() {
        let mut b = ClassFileBuilder::new("test/Natives", Some(OBJECT));
        b.native_method(STATIC, "missing", "()V");
        let (mut rt, _) = test_utils::runtime(vec![("test/Natives", b.build())]);
        assert!(matches!(
            rt.resolve_class("test/Natives"),
            Err(VmError::NativeNotFound { .. })
        ));
        assert_eq!(rt.status().code, ErrorCode::CantFindNative);
        assert_eq!(rt.classes().find(b"test/Natives"), None);

        let system = rt.resolve_class("base/framework/System").unwrap();
        let methods = &rt.classes().get(system).methods;
        assert!(methods.iter().all(|m| m.access_flags & ACC_NATIVE != 0));
    }

    #[test]
    fn natives_bind_by_full_signature() {
        // Same class and method hashes as System.gc()V.
        let mut anagram = ClassFileBuilder::new("base/framework/Systme", Some(OBJECT));
        anagram.native_method(STATIC, "gc", "()V");
        let mut swapped = ClassFileBuilder::new("test/Swapped", Some(OBJECT));
        swapped.native_method(STATIC, "cg", "()V");
        let (mut rt, _) = test_utils::runtime(vec![
            ("base/framework/Systme", anagram.build()),
            ("test/Swapped", swapped.build()),
        ]);
        assert!(matches!(
            rt.resolve_class("base/framework/Systme"),
            Err(VmError::NativeNotFound { .. })
        ));
        assert!(matches!(
            rt.resolve_class("test/Swapped"),
            Err(VmError::NativeNotFound { .. })
        ));
        assert_eq!(rt.classes().find(b"base/framework/Systme"), None);
    }

    #[test]
    fn class_memory_is_charged_with_what_classes_keep() {
        let mut wide = ClassFileBuilder::new("test/Wide", Some(OBJECT));
        wide.utf8(&"w".repeat(3000));
        let wide = wide.build();
        let narrow = ClassFileBuilder::new("test/Narrow", Some(OBJECT)).build();
        let wide_len = wide.len();
        let classes = || vec![("test/Wide", wide.clone()), ("test/Narrow", narrow.clone())];

        let (mut rt, _) = test_utils::runtime(classes());
        rt.resolve_class(OBJECT).unwrap();
        let before = rt.classes().heap_used();
        let id = rt.resolve_class("test/Wide").unwrap();
        let grown = rt.classes().heap_used() - before;
        assert!(grown >= wide_len);
        assert_eq!(grown, rt.classes().charged(id));

        // Room for Object and a small class, not for the wide one.
        let config = VmConfig {
            class_heap_bytes: before + 1024,
            ..VmConfig::default()
        };
        let (mut rt, _) = test_utils::runtime_with(config, classes());
        rt.resolve_class("test/Narrow").unwrap();
        let used = rt.classes().heap_used();
        assert!(matches!(
            rt.resolve_class("test/Wide"),
            Err(VmError::OutOfClassMemory)
        ));
        assert_eq!(rt.classes().heap_used(), used);
        assert_eq!(rt.classes().find(b"test/Wide"), None);
        assert_eq!(rt.status().code, ErrorCode::OutOfClassMem);
    }

    #[test]
    fn static_initializers_run_once() {
        let mut b = ClassFileBuilder::new("test/Init", Some(OBJECT));
        b.field(STATIC, "count", "I");
        let count = b.field_ref("test/Init", "count", "I");
        let [hi, lo] = count.to_be_bytes();
        // count = count + 42
        b.method(
            STATIC,
            "<clinit>",
            "()V",
            2,
            0,
            &[0xb2, hi, lo, 0x10, 42, 0x60, 0xb3, hi, lo, 0xb1],
            &[],
        );
        let (mut rt, _) = test_utils::runtime(vec![("test/Init", b.build())]);
        assert_eq!(rt.get_static("test/Init", "count", "I").unwrap(), Var::from_int(42));
        assert_eq!(rt.get_static("test/Init", "count", "I").unwrap(), Var::from_int(42));
        assert_eq!(rt.vm_stack_ptr(), 0);
    }

    #[test]
    fn throwing_static_initializer_fails_the_load() {
        let mut b = ClassFileBuilder::new("test/BadInit", Some(OBJECT));
        // throw null
        b.method(STATIC, "<clinit>", "()V", 1, 0, &[0x01, 0xbf], &[]);
        let (mut rt, _) = test_utils::runtime(vec![("test/BadInit", b.build())]);
        assert!(matches!(
            rt.resolve_class("test/BadInit"),
            Err(VmError::ClinitFailed(_))
        ));
        assert_eq!(rt.status().code, ErrorCode::ClinitMethodError);
        assert_eq!(rt.status().severity, Severity::Fatal);
        assert_eq!(rt.classes().find(b"test/BadInit"), None);
        assert_eq!(rt.vm_stack_ptr(), 0);
    }

    #[test]
    fn initializer_failure_behind_a_native_fails_the_host_call() {
        let mut bad = ClassFileBuilder::new("test/Broken", Some(OBJECT));
        // throw null
        bad.method(STATIC, "<clinit>", "()V", 1, 0, &[0x01, 0xbf], &[]);
        let mut caller = ClassFileBuilder::new("test/Caller", Some(OBJECT));
        let s = caller.string("test/Broken");
        let m = caller.method_ref(
            "base/framework/System",
            "hasClass",
            "(Ljava/lang/String;)Z",
        );
        let [hi, lo] = m.to_be_bytes();
        // ldc "test/Broken"; invokestatic hasClass; ireturn
        let code = [0x12, s as u8, 0xb8, hi, lo, 0xac];
        caller.method(STATIC, "check", "()I", 1, 0, &code, &[]);
        let (mut rt, _) = test_utils::runtime(vec![
            ("test/Broken", bad.build()),
            ("test/Caller", caller.build()),
        ]);
        let result = rt.call_static("test/Caller", "check", "()I", &[]);
        assert!(matches!(
            result,
            Err(VmError::Deferred { code: ErrorCode::ClinitMethodError, .. })
        ));
        assert_eq!(rt.status().code, ErrorCode::ClinitMethodError);
        assert_eq!(rt.status().severity, Severity::Fatal);
        assert_eq!(rt.classes().find(b"test/Broken"), None);
        assert_eq!(rt.vm_stack_ptr(), 0);

        rt.reset_error();
        assert!(rt.resolve_class("test/Caller").is_ok());
    }

    #[test]
    fn interfaces_are_compatible_through_the_chain() {
        let mut task = ClassFileBuilder::new("test/Task", Some(OBJECT));
        task.interface("test/Runnable");
        add_default_init(&mut task, OBJECT);
        let mut sub = ClassFileBuilder::new("test/SubTask", Some("test/Task"));
        add_default_init(&mut sub, "test/Task");
        let (mut rt, _) = test_utils::runtime(vec![
            ("test/Task", task.build()),
            ("test/SubTask", sub.build()),
        ]);
        let sub = rt.resolve_class("test/SubTask").unwrap();
        let runnable = rt.resolve_class("test/Runnable").unwrap();
        let string = rt.resolve_class("java/lang/String").unwrap();
        assert!(rt.compatible(sub, runnable).unwrap());
        assert!(!rt.compatible(string, runnable).unwrap());
    }
}
