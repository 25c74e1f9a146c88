//! JVM opcodes.
//!
//! The interpreter supports the 32 bit integer and reference subset of the
//! instruction set; the remaining opcodes still decode so that they can be
//! reported by name when rejected.

/// JVM bytecode opcodes, one variant per instruction byte.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OPCode {
    NOP = 0x00,
    AconstNull = 0x01,
    IconstM1 = 0x02,
    Iconst0 = 0x03,
    Iconst1 = 0x04,
    Iconst2 = 0x05,
    Iconst3 = 0x06,
    Iconst4 = 0x07,
    Iconst5 = 0x08,
    Lconst0 = 0x09,
    Lconst1 = 0x0a,
    Fconst0 = 0x0b,
    Fconst1 = 0x0c,
    Fconst2 = 0x0d,
    Dconst0 = 0x0e,
    Dconst1 = 0x0f,
    Bipush = 0x10,
    Sipush = 0x11,
    Ldc = 0x12,
    LdcW = 0x13,
    Ldc2W = 0x14,
    Iload = 0x15,
    Lload = 0x16,
    Fload = 0x17,
    Dload = 0x18,
    Aload = 0x19,
    Iload0 = 0x1a,
    Iload1 = 0x1b,
    Iload2 = 0x1c,
    Iload3 = 0x1d,
    Lload0 = 0x1e,
    Lload1 = 0x1f,
    Lload2 = 0x20,
    Lload3 = 0x21,
    Fload0 = 0x22,
    Fload1 = 0x23,
    Fload2 = 0x24,
    Fload3 = 0x25,
    Dload0 = 0x26,
    Dload1 = 0x27,
    Dload2 = 0x28,
    Dload3 = 0x29,
    Aload0 = 0x2a,
    Aload1 = 0x2b,
    Aload2 = 0x2c,
    Aload3 = 0x2d,
    Iaload = 0x2e,
    Laload = 0x2f,
    Faload = 0x30,
    Daload = 0x31,
    Aaload = 0x32,
    Baload = 0x33,
    Caload = 0x34,
    Saload = 0x35,
    Istore = 0x36,
    Lstore = 0x37,
    Fstore = 0x38,
    Dstore = 0x39,
    Astore = 0x3a,
    Istore0 = 0x3b,
    Istore1 = 0x3c,
    Istore2 = 0x3d,
    Istore3 = 0x3e,
    Lstore0 = 0x3f,
    Lstore1 = 0x40,
    Lstore2 = 0x41,
    Lstore3 = 0x42,
    Fstore0 = 0x43,
    Fstore1 = 0x44,
    Fstore2 = 0x45,
    Fstore3 = 0x46,
    Dstore0 = 0x47,
    Dstore1 = 0x48,
    Dstore2 = 0x49,
    Dstore3 = 0x4a,
    Astore0 = 0x4b,
    Astore1 = 0x4c,
    Astore2 = 0x4d,
    Astore3 = 0x4e,
    Iastore = 0x4f,
    Lastore = 0x50,
    Fastore = 0x51,
    Dastore = 0x52,
    Aastore = 0x53,
    Bastore = 0x54,
    Castore = 0x55,
    Sastore = 0x56,
    Pop = 0x57,
    Pop2 = 0x58,
    Dup = 0x59,
    DupX1 = 0x5a,
    DupX2 = 0x5b,
    Dup2 = 0x5c,
    Dup2X1 = 0x5d,
    Dup2X2 = 0x5e,
    Swap = 0x5f,
    Iadd = 0x60,
    Ladd = 0x61,
    Fadd = 0x62,
    Dadd = 0x63,
    Isub = 0x64,
    Lsub = 0x65,
    Fsub = 0x66,
    Dsub = 0x67,
    Imul = 0x68,
    Lmul = 0x69,
    Fmul = 0x6a,
    Dmul = 0x6b,
    Idiv = 0x6c,
    Ldiv = 0x6d,
    Fdiv = 0x6e,
    Ddiv = 0x6f,
    Irem = 0x70,
    Lrem = 0x71,
    Frem = 0x72,
    Drem = 0x73,
    Ineg = 0x74,
    Lneg = 0x75,
    Fneg = 0x76,
    Dneg = 0x77,
    Ishl = 0x78,
    Lshl = 0x79,
    Ishr = 0x7a,
    Lshr = 0x7b,
    Iushr = 0x7c,
    Lushr = 0x7d,
    Iand = 0x7e,
    Land = 0x7f,
    Ior = 0x80,
    Lor = 0x81,
    Ixor = 0x82,
    Lxor = 0x83,
    Iinc = 0x84,
    I2l = 0x85,
    I2f = 0x86,
    I2d = 0x87,
    L2i = 0x88,
    L2f = 0x89,
    L2d = 0x8a,
    F2i = 0x8b,
    F2l = 0x8c,
    F2d = 0x8d,
    D2i = 0x8e,
    D2l = 0x8f,
    D2f = 0x90,
    I2b = 0x91,
    I2c = 0x92,
    I2s = 0x93,
    Lcmp = 0x94,
    Fcmpl = 0x95,
    Fcmpg = 0x96,
    Dcmpl = 0x97,
    Dcmpg = 0x98,
    Ifeq = 0x99,
    Ifne = 0x9a,
    Iflt = 0x9b,
    Ifge = 0x9c,
    Ifgt = 0x9d,
    Ifle = 0x9e,
    IfIcmpeq = 0x9f,
    IfIcmpne = 0xa0,
    IfIcmplt = 0xa1,
    IfIcmpge = 0xa2,
    IfIcmpgt = 0xa3,
    IfIcmple = 0xa4,
    IfAcmpeq = 0xa5,
    IfAcmpne = 0xa6,
    Goto = 0xa7,
    Jsr = 0xa8,
    Ret = 0xa9,
    Tableswitch = 0xaa,
    Lookupswitch = 0xab,
    Ireturn = 0xac,
    Lreturn = 0xad,
    Freturn = 0xae,
    Dreturn = 0xaf,
    Areturn = 0xb0,
    Return = 0xb1,
    Getstatic = 0xb2,
    Putstatic = 0xb3,
    Getfield = 0xb4,
    Putfield = 0xb5,
    Invokevirtual = 0xb6,
    Invokespecial = 0xb7,
    Invokestatic = 0xb8,
    Invokeinterface = 0xb9,
    Invokedynamic = 0xba,
    New = 0xbb,
    Newarray = 0xbc,
    Anewarray = 0xbd,
    Arraylength = 0xbe,
    Athrow = 0xbf,
    Checkcast = 0xc0,
    Instanceof = 0xc1,
    Monitorenter = 0xc2,
    Monitorexit = 0xc3,
    Wide = 0xc4,
    Multianewarray = 0xc5,
    Ifnull = 0xc6,
    Ifnonnull = 0xc7,
    GotoW = 0xc8,
    JsrW = 0xc9,
    /// Any byte outside the defined instruction set.
    Unknown = 0xff,
}

impl From<u8> for OPCode {
    fn from(byte: u8) -> Self {
        match byte {
            0x00 => Self::NOP,
            0x01 => Self::AconstNull,
            0x02 => Self::IconstM1,
            0x03 => Self::Iconst0,
            0x04 => Self::Iconst1,
            0x05 => Self::Iconst2,
            0x06 => Self::Iconst3,
            0x07 => Self::Iconst4,
            0x08 => Self::Iconst5,
            0x09 => Self::Lconst0,
            0x0a => Self::Lconst1,
            0x0b => Self::Fconst0,
            0x0c => Self::Fconst1,
            0x0d => Self::Fconst2,
            0x0e => Self::Dconst0,
            0x0f => Self::Dconst1,
            0x10 => Self::Bipush,
            0x11 => Self::Sipush,
            0x12 => Self::Ldc,
            0x13 => Self::LdcW,
            0x14 => Self::Ldc2W,
            0x15 => Self::Iload,
            0x16 => Self::Lload,
            0x17 => Self::Fload,
            0x18 => Self::Dload,
            0x19 => Self::Aload,
            0x1a => Self::Iload0,
            0x1b => Self::Iload1,
            0x1c => Self::Iload2,
            0x1d => Self::Iload3,
            0x1e => Self::Lload0,
            0x1f => Self::Lload1,
            0x20 => Self::Lload2,
            0x21 => Self::Lload3,
            0x22 => Self::Fload0,
            0x23 => Self::Fload1,
            0x24 => Self::Fload2,
            0x25 => Self::Fload3,
            0x26 => Self::Dload0,
            0x27 => Self::Dload1,
            0x28 => Self::Dload2,
            0x29 => Self::Dload3,
            0x2a => Self::Aload0,
            0x2b => Self::Aload1,
            0x2c => Self::Aload2,
            0x2d => Self::Aload3,
            0x2e => Self::Iaload,
            0x2f => Self::Laload,
            0x30 => Self::Faload,
            0x31 => Self::Daload,
            0x32 => Self::Aaload,
            0x33 => Self::Baload,
            0x34 => Self::Caload,
            0x35 => Self::Saload,
            0x36 => Self::Istore,
            0x37 => Self::Lstore,
            0x38 => Self::Fstore,
            0x39 => Self::Dstore,
            0x3a => Self::Astore,
            0x3b => Self::Istore0,
            0x3c => Self::Istore1,
            0x3d => Self::Istore2,
            0x3e => Self::Istore3,
            0x3f => Self::Lstore0,
            0x40 => Self::Lstore1,
            0x41 => Self::Lstore2,
            0x42 => Self::Lstore3,
            0x43 => Self::Fstore0,
            0x44 => Self::Fstore1,
            0x45 => Self::Fstore2,
            0x46 => Self::Fstore3,
            0x47 => Self::Dstore0,
            0x48 => Self::Dstore1,
            0x49 => Self::Dstore2,
            0x4a => Self::Dstore3,
            0x4b => Self::Astore0,
            0x4c => Self::Astore1,
            0x4d => Self::Astore2,
            0x4e => Self::Astore3,
            0x4f => Self::Iastore,
            0x50 => Self::Lastore,
            0x51 => Self::Fastore,
            0x52 => Self::Dastore,
            0x53 => Self::Aastore,
            0x54 => Self::Bastore,
            0x55 => Self::Castore,
            0x56 => Self::Sastore,
            0x57 => Self::Pop,
            0x58 => Self::Pop2,
            0x59 => Self::Dup,
            0x5a => Self::DupX1,
            0x5b => Self::DupX2,
            0x5c => Self::Dup2,
            0x5d => Self::Dup2X1,
            0x5e => Self::Dup2X2,
            0x5f => Self::Swap,
            0x60 => Self::Iadd,
            0x61 => Self::Ladd,
            0x62 => Self::Fadd,
            0x63 => Self::Dadd,
            0x64 => Self::Isub,
            0x65 => Self::Lsub,
            0x66 => Self::Fsub,
            0x67 => Self::Dsub,
            0x68 => Self::Imul,
            0x69 => Self::Lmul,
            0x6a => Self::Fmul,
            0x6b => Self::Dmul,
            0x6c => Self::Idiv,
            0x6d => Self::Ldiv,
            0x6e => Self::Fdiv,
            0x6f => Self::Ddiv,
            0x70 => Self::Irem,
            0x71 => Self::Lrem,
            0x72 => Self::Frem,
            0x73 => Self::Drem,
            0x74 => Self::Ineg,
            0x75 => Self::Lneg,
            0x76 => Self::Fneg,
            0x77 => Self::Dneg,
            0x78 => Self::Ishl,
            0x79 => Self::Lshl,
            0x7a => Self::Ishr,
            0x7b => Self::Lshr,
            0x7c => Self::Iushr,
            0x7d => Self::Lushr,
            0x7e => Self::Iand,
            0x7f => Self::Land,
            0x80 => Self::Ior,
            0x81 => Self::Lor,
            0x82 => Self::Ixor,
            0x83 => Self::Lxor,
            0x84 => Self::Iinc,
            0x85 => Self::I2l,
            0x86 => Self::I2f,
            0x87 => Self::I2d,
            0x88 => Self::L2i,
            0x89 => Self::L2f,
            0x8a => Self::L2d,
            0x8b => Self::F2i,
            0x8c => Self::F2l,
            0x8d => Self::F2d,
            0x8e => Self::D2i,
            0x8f => Self::D2l,
            0x90 => Self::D2f,
            0x91 => Self::I2b,
            0x92 => Self::I2c,
            0x93 => Self::I2s,
            0x94 => Self::Lcmp,
            0x95 => Self::Fcmpl,
            0x96 => Self::Fcmpg,
            0x97 => Self::Dcmpl,
            0x98 => Self::Dcmpg,
            0x99 => Self::Ifeq,
            0x9a => Self::Ifne,
            0x9b => Self::Iflt,
            0x9c => Self::Ifge,
            0x9d => Self::Ifgt,
            0x9e => Self::Ifle,
            0x9f => Self::IfIcmpeq,
            0xa0 => Self::IfIcmpne,
            0xa1 => Self::IfIcmplt,
            0xa2 => Self::IfIcmpge,
            0xa3 => Self::IfIcmpgt,
            0xa4 => Self::IfIcmple,
            0xa5 => Self::IfAcmpeq,
            0xa6 => Self::IfAcmpne,
            0xa7 => Self::Goto,
            0xa8 => Self::Jsr,
            0xa9 => Self::Ret,
            0xaa => Self::Tableswitch,
            0xab => Self::Lookupswitch,
            0xac => Self::Ireturn,
            0xad => Self::Lreturn,
            0xae => Self::Freturn,
            0xaf => Self::Dreturn,
            0xb0 => Self::Areturn,
            0xb1 => Self::Return,
            0xb2 => Self::Getstatic,
            0xb3 => Self::Putstatic,
            0xb4 => Self::Getfield,
            0xb5 => Self::Putfield,
            0xb6 => Self::Invokevirtual,
            0xb7 => Self::Invokespecial,
            0xb8 => Self::Invokestatic,
            0xb9 => Self::Invokeinterface,
            0xba => Self::Invokedynamic,
            0xbb => Self::New,
            0xbc => Self::Newarray,
            0xbd => Self::Anewarray,
            0xbe => Self::Arraylength,
            0xbf => Self::Athrow,
            0xc0 => Self::Checkcast,
            0xc1 => Self::Instanceof,
            0xc2 => Self::Monitorenter,
            0xc3 => Self::Monitorexit,
            0xc4 => Self::Wide,
            0xc5 => Self::Multianewarray,
            0xc6 => Self::Ifnull,
            0xc7 => Self::Ifnonnull,
            0xc8 => Self::GotoW,
            0xc9 => Self::JsrW,
            _ => Self::Unknown,
        }
    }
}

impl OPCode {
    /// Length in bytes of instructions with a fixed size, operands
    /// included. Switches and `wide` are variable and return `None`.
    pub fn fixed_len(self) -> Option<usize> {
        use OPCode::*;
        match self {
            Tableswitch | Lookupswitch | Wide | Unknown => None,
            Bipush | Ldc | Iload | Lload | Fload | Dload | Aload | Istore | Lstore
            | Fstore | Dstore | Astore | Ret | Newarray => Some(2),
            Sipush | LdcW | Ldc2W | Iinc | Ifeq | Ifne | Iflt | Ifge | Ifgt | Ifle
            | IfIcmpeq | IfIcmpne | IfIcmplt | IfIcmpge | IfIcmpgt | IfIcmple
            | IfAcmpeq | IfAcmpne | Goto | Jsr | Getstatic | Putstatic | Getfield
            | Putfield | Invokevirtual | Invokespecial | Invokestatic | New
            | Anewarray | Checkcast | Instanceof | Ifnull | Ifnonnull => Some(3),
            Multianewarray => Some(4),
            Invokeinterface | Invokedynamic | GotoW | JsrW => Some(5),
            _ => Some(1),
        }
    }
}
