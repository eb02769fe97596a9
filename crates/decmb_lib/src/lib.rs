
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::mem;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use strum::FromRepr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputMode {
    Pseudo,
    Disasm,
}

/// Dialect A is the extended ISA: it adds opcodes 0x42..=0x47 and the
/// variable-length CALL operand encoding. Dialect B is the base ISA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dialect {
    A,
    B,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecompileOptions {
    pub mode: OutputMode,
    pub dialect: Dialect,
    /// Treat BKY/BKN as ordinary jumps when slicing. Debug aid: scripts
    /// that use branch-and-keep then fail the rewrite with a cross-slice
    /// error instead of folding into `&&`/`||`.
    pub split_branch_keeps: bool,
}

impl Default for DecompileOptions {
    fn default() -> Self {
        Self {
            mode: OutputMode::Pseudo,
            dialect: Dialect::A,
            split_branch_keeps: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum DecmbError {
    #[error("container too small ({0} bytes)")]
    ContainerTooSmall(usize),

    #[error("string pool offset is past the end of the container")]
    StringPoolPastEnd,

    #[error("event table offset is past the end of the container")]
    EventTablePastEnd,

    #[error("event table is unterminated")]
    EventTableUnterminated,

    #[error("event record {index} is truncated")]
    TruncatedEventRecord { index: usize },

    #[error("global count {0} is past the suspicion limit")]
    SuspiciousGlobalCount(usize),

    #[error("event record {index} declares {count} parameters, past the suspicion limit")]
    SuspiciousParamCount { index: usize, count: usize },

    #[error("event record {index} declares {count} variables, past the suspicion limit")]
    SuspiciousVarCount { index: usize, count: usize },

    #[error("event record {index} declares more arguments than variables")]
    ArgCountPastVarCount { index: usize },

    #[error("event record index {found} does not match table position {expected}")]
    SceneIndexMismatch { expected: usize, found: usize },

    #[error("event name at offset {0:#x} runs past the end of the container")]
    UnterminatedSceneName(usize),

    #[error("event record {index} script offset is past the end of the container")]
    ScriptPastEnd { index: usize },

    #[error("bad string pool offset {0:#x}")]
    BadStringOffset(usize),

    #[error("invalid opcode {opcode:#04x} at {location:#x}")]
    InvalidOpcode { location: usize, opcode: u8 },

    #[error("opcode {mnemonic} at {location:#x} is not valid in dialect {dialect:?}")]
    WrongDialectOpcode {
        location: usize,
        mnemonic: &'static str,
        dialect: Dialect,
    },

    #[error("truncated operand for {mnemonic} at {location:#x}")]
    TruncatedOperand {
        location: usize,
        mnemonic: &'static str,
    },

    #[error("truncated wide call operand at {location:#x}")]
    TruncatedWideCall { location: usize },

    #[error("jump at {location:#x} targets {target:#x}, outside the script")]
    JumpOutOfRange { location: usize, target: i64 },

    #[error("reached the end of the script without a terminating return")]
    ScriptUnterminated,

    #[error("jump target {0:#x} is not on an instruction boundary")]
    MisalignedJumpTarget(usize),

    #[error("branch-and-keep at {location:#x} targets {target:#x}, outside its slice")]
    CrossSliceBranchKeep { location: usize, target: usize },

    #[error("{mnemonic} at {location:#x} expects {needed} pending pushes, found {found}")]
    ExpectedPush {
        location: usize,
        mnemonic: &'static str,
        needed: usize,
        found: usize,
    },

    #[error("{mnemonic} at {location:#x} references local slot {slot}, but the event has {len}")]
    BadLocalSlot {
        location: usize,
        mnemonic: &'static str,
        slot: i32,
        len: usize,
    },

    #[error("{mnemonic} at {location:#x} references global slot {slot}, but the container has {len}")]
    BadGlobalSlot {
        location: usize,
        mnemonic: &'static str,
        slot: i32,
        len: usize,
    },

    #[error("call at {location:#x} references event {index}, but the container has {len}")]
    BadSceneIndex {
        location: usize,
        index: i32,
        len: usize,
    },

    #[error("unsupported opcode {mnemonic} at {location:#x}")]
    UnsupportedOpcode {
        location: usize,
        mnemonic: &'static str,
    },
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, Serialize, Deserialize)]
pub enum Opcode {
    Nop = 0x00,

    // Memory addressing: value-of and address-of, plus the indexed (x) and
    // indexed-indirect (y) forms, in local and global (g) flavours.
    Val8 = 0x01,
    Val16 = 0x02,
    Valx8 = 0x03,
    Valx16 = 0x04,
    Valy8 = 0x05,
    Valy16 = 0x06,
    Ref8 = 0x07,
    Ref16 = 0x08,
    Refx8 = 0x09,
    Refx16 = 0x0A,
    Refy8 = 0x0B,
    Refy16 = 0x0C,
    Gval8 = 0x0D,
    Gval16 = 0x0E,
    Gvalx8 = 0x0F,
    Gvalx16 = 0x10,
    Gvaly8 = 0x11,
    Gvaly16 = 0x12,
    Gref8 = 0x13,
    Gref16 = 0x14,
    Grefx8 = 0x15,
    Grefx16 = 0x16,
    Grefy8 = 0x17,
    Grefy16 = 0x18,

    // Constant loading
    Number8 = 0x19,
    Number16 = 0x1A,
    Number32 = 0x1B,
    String8 = 0x1C,
    String16 = 0x1D,
    String32 = 0x1E,

    // Operations
    Deref = 0x1F,
    Disc = 0x20,
    Store = 0x21,
    Add = 0x22,
    Sub = 0x23,
    Mul = 0x24,
    Div = 0x25,
    Mod = 0x26,
    Neg = 0x27,
    Mvn = 0x28,
    Not = 0x29,
    Orr = 0x2A,
    And = 0x2B,
    Xor = 0x2C,
    Lsl = 0x2D,
    Lsr = 0x2E,
    Eq = 0x2F,
    Ne = 0x30,
    Lt = 0x31,
    Le = 0x32,
    Gt = 0x33,
    Ge = 0x34,
    EqStr = 0x35,
    NeStr = 0x36,

    // Jumps and calls
    Call = 0x37,
    CallExt = 0x38,
    Return = 0x39,
    B = 0x3A,
    By = 0x3B,
    Bky = 0x3C,
    Bn = 0x3D,
    Bkn = 0x3E,
    Yield = 0x3F,

    // Debug leftovers (dummied out in the VM)
    Unk40 = 0x40,
    Printf = 0x41,

    // Dialect A only
    Inc = 0x42,
    Dec = 0x43,
    Dup = 0x44,
    Retn = 0x45,
    Rety = 0x46,
    Assign = 0x47,

    // Synthetic: produced by the branch-and-keep rewrite, never decoded
    FakeLand = 0x48,
    FakeLorr = 0x49,
}

#[derive(Debug, Clone, Copy)]
pub struct OpInfo {
    pub mnemonic: &'static str,
    pub operand_size: u8,
    /// Net change in pending pushes, `None` for the variadic opcodes.
    pub stack_diff: Option<i8>,
    pub is_jump: bool,
}

static OPCODE_INFO: &[OpInfo] = &[
    OpInfo { mnemonic: "nop", operand_size: 0, stack_diff: Some(0), is_jump: false },
    OpInfo { mnemonic: "val", operand_size: 1, stack_diff: Some(1), is_jump: false },
    OpInfo { mnemonic: "val", operand_size: 2, stack_diff: Some(1), is_jump: false },
    OpInfo { mnemonic: "valx", operand_size: 1, stack_diff: Some(0), is_jump: false },
    OpInfo { mnemonic: "valx", operand_size: 2, stack_diff: Some(0), is_jump: false },
    OpInfo { mnemonic: "valy", operand_size: 1, stack_diff: Some(0), is_jump: false },
    OpInfo { mnemonic: "valy", operand_size: 2, stack_diff: Some(0), is_jump: false },
    OpInfo { mnemonic: "ref", operand_size: 1, stack_diff: Some(1), is_jump: false },
    OpInfo { mnemonic: "ref", operand_size: 2, stack_diff: Some(1), is_jump: false },
    OpInfo { mnemonic: "refx", operand_size: 1, stack_diff: Some(0), is_jump: false },
    OpInfo { mnemonic: "refx", operand_size: 2, stack_diff: Some(0), is_jump: false },
    OpInfo { mnemonic: "refy", operand_size: 1, stack_diff: Some(0), is_jump: false },
    OpInfo { mnemonic: "refy", operand_size: 2, stack_diff: Some(0), is_jump: false },
    OpInfo { mnemonic: "gval", operand_size: 1, stack_diff: Some(1), is_jump: false },
    OpInfo { mnemonic: "gval", operand_size: 2, stack_diff: Some(1), is_jump: false },
    OpInfo { mnemonic: "gvalx", operand_size: 1, stack_diff: Some(0), is_jump: false },
    OpInfo { mnemonic: "gvalx", operand_size: 2, stack_diff: Some(0), is_jump: false },
    OpInfo { mnemonic: "gvaly", operand_size: 1, stack_diff: Some(0), is_jump: false },
    OpInfo { mnemonic: "gvaly", operand_size: 2, stack_diff: Some(0), is_jump: false },
    OpInfo { mnemonic: "gref", operand_size: 1, stack_diff: Some(1), is_jump: false },
    OpInfo { mnemonic: "gref", operand_size: 2, stack_diff: Some(1), is_jump: false },
    OpInfo { mnemonic: "grefx", operand_size: 1, stack_diff: Some(0), is_jump: false },
    OpInfo { mnemonic: "grefx", operand_size: 2, stack_diff: Some(0), is_jump: false },
    OpInfo { mnemonic: "grefy", operand_size: 1, stack_diff: Some(0), is_jump: false },
    OpInfo { mnemonic: "grefy", operand_size: 2, stack_diff: Some(0), is_jump: false },
    OpInfo { mnemonic: "number", operand_size: 1, stack_diff: Some(1), is_jump: false },
    OpInfo { mnemonic: "number", operand_size: 2, stack_diff: Some(1), is_jump: false },
    OpInfo { mnemonic: "number", operand_size: 4, stack_diff: Some(1), is_jump: false },
    OpInfo { mnemonic: "string", operand_size: 1, stack_diff: Some(1), is_jump: false },
    OpInfo { mnemonic: "string", operand_size: 2, stack_diff: Some(1), is_jump: false },
    OpInfo { mnemonic: "string", operand_size: 4, stack_diff: Some(1), is_jump: false },
    OpInfo { mnemonic: "deref", operand_size: 0, stack_diff: Some(1), is_jump: false },
    OpInfo { mnemonic: "disc", operand_size: 0, stack_diff: Some(-1), is_jump: false },
    OpInfo { mnemonic: "store", operand_size: 0, stack_diff: Some(-1), is_jump: false },
    OpInfo { mnemonic: "add", operand_size: 0, stack_diff: Some(-1), is_jump: false },
    OpInfo { mnemonic: "sub", operand_size: 0, stack_diff: Some(-1), is_jump: false },
    OpInfo { mnemonic: "mul", operand_size: 0, stack_diff: Some(-1), is_jump: false },
    OpInfo { mnemonic: "div", operand_size: 0, stack_diff: Some(-1), is_jump: false },
    OpInfo { mnemonic: "mod", operand_size: 0, stack_diff: Some(-1), is_jump: false },
    OpInfo { mnemonic: "neg", operand_size: 0, stack_diff: Some(0), is_jump: false },
    OpInfo { mnemonic: "mvn", operand_size: 0, stack_diff: Some(0), is_jump: false },
    OpInfo { mnemonic: "not", operand_size: 0, stack_diff: Some(0), is_jump: false },
    OpInfo { mnemonic: "orr", operand_size: 0, stack_diff: Some(-1), is_jump: false },
    OpInfo { mnemonic: "and", operand_size: 0, stack_diff: Some(-1), is_jump: false },
    OpInfo { mnemonic: "xor", operand_size: 0, stack_diff: Some(-1), is_jump: false },
    OpInfo { mnemonic: "lsl", operand_size: 0, stack_diff: Some(-1), is_jump: false },
    OpInfo { mnemonic: "lsr", operand_size: 0, stack_diff: Some(-1), is_jump: false },
    OpInfo { mnemonic: "eq", operand_size: 0, stack_diff: Some(-1), is_jump: false },
    OpInfo { mnemonic: "ne", operand_size: 0, stack_diff: Some(-1), is_jump: false },
    OpInfo { mnemonic: "lt?", operand_size: 0, stack_diff: Some(-1), is_jump: false },
    OpInfo { mnemonic: "le", operand_size: 0, stack_diff: Some(-1), is_jump: false },
    OpInfo { mnemonic: "gt?", operand_size: 0, stack_diff: Some(-1), is_jump: false },
    OpInfo { mnemonic: "ge?", operand_size: 0, stack_diff: Some(-1), is_jump: false },
    OpInfo { mnemonic: "eqstr", operand_size: 0, stack_diff: Some(-1), is_jump: false },
    OpInfo { mnemonic: "nestr", operand_size: 0, stack_diff: Some(-1), is_jump: false },
    OpInfo { mnemonic: "call", operand_size: 1, stack_diff: None, is_jump: false },
    OpInfo { mnemonic: "callext", operand_size: 4, stack_diff: None, is_jump: false },
    OpInfo { mnemonic: "ret", operand_size: 0, stack_diff: Some(-1), is_jump: false },
    OpInfo { mnemonic: "b", operand_size: 2, stack_diff: Some(0), is_jump: true },
    OpInfo { mnemonic: "by", operand_size: 2, stack_diff: Some(-1), is_jump: true },
    OpInfo { mnemonic: "bky", operand_size: 2, stack_diff: None, is_jump: true },
    OpInfo { mnemonic: "bn", operand_size: 2, stack_diff: Some(-1), is_jump: true },
    OpInfo { mnemonic: "bkn", operand_size: 2, stack_diff: None, is_jump: true },
    OpInfo { mnemonic: "yield", operand_size: 0, stack_diff: Some(0), is_jump: false },
    OpInfo { mnemonic: "unk", operand_size: 4, stack_diff: Some(0), is_jump: false },
    OpInfo { mnemonic: "printf", operand_size: 1, stack_diff: None, is_jump: false },
    OpInfo { mnemonic: "inc", operand_size: 0, stack_diff: Some(-1), is_jump: false },
    OpInfo { mnemonic: "dec", operand_size: 0, stack_diff: Some(-1), is_jump: false },
    OpInfo { mnemonic: "dup", operand_size: 0, stack_diff: Some(1), is_jump: false },
    OpInfo { mnemonic: "retn", operand_size: 0, stack_diff: Some(0), is_jump: false },
    OpInfo { mnemonic: "rety", operand_size: 0, stack_diff: Some(0), is_jump: false },
    OpInfo { mnemonic: "assign", operand_size: 0, stack_diff: Some(-2), is_jump: false },
    OpInfo { mnemonic: "scand", operand_size: 0, stack_diff: Some(-1), is_jump: false },
    OpInfo { mnemonic: "scorr", operand_size: 0, stack_diff: Some(-1), is_jump: false },
];

impl Opcode {
    pub fn info(self) -> &'static OpInfo {
        &OPCODE_INFO[self as usize]
    }

    pub fn mnemonic(self) -> &'static str {
        self.info().mnemonic
    }

    /// The synthetic opcodes are valid in neither dialect; they only exist
    /// after the branch-and-keep rewrite.
    pub fn valid_in(self, dialect: Dialect) -> bool {
        match dialect {
            Dialect::A => (self as u8) < Opcode::FakeLand as u8,
            Dialect::B => (self as u8) < Opcode::Inc as u8,
        }
    }

    pub fn is_jump(self) -> bool {
        self.info().is_jump
    }

    pub fn is_branch_keep(self) -> bool {
        matches!(self, Opcode::Bky | Opcode::Bkn)
    }

    pub fn is_end(self) -> bool {
        matches!(self, Opcode::Return | Opcode::Retn | Opcode::Rety)
    }
}

/// A decoded instruction. For jump opcodes `operand` holds the absolute
/// target location, not the encoded relative displacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instr {
    pub location: usize,
    pub opcode: Opcode,
    pub operand: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnOp {
    Neg,
    Not,
    BitwiseNot,
    Deref,
    AddrOf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Assign,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Or,
    And,
    Xor,
    Lsl,
    Lsr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    EqStr,
    NeStr,
    LogicalAnd,
    LogicalOr,
}

impl BinOp {
    /// Relational glyphs with a trailing `?` mark comparisons whose exact
    /// VM semantics are uncertain.
    fn glyph(self) -> &'static str {
        match self {
            BinOp::Assign => "=",
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Or => "|",
            BinOp::And => "&",
            BinOp::Xor => "^",
            BinOp::Lsl => "<<",
            BinOp::Lsr => ">>",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<?",
            BinOp::Le => "<=",
            BinOp::Gt => ">?",
            BinOp::Ge => ">=?",
            BinOp::EqStr => "<=>",
            BinOp::NeStr => "<!>",
            BinOp::LogicalAnd => "&&",
            BinOp::LogicalOr => "||",
        }
    }
}

/// An expression tree. Children are uniquely owned; duplication in the
/// evaluator (DUP, DEREF) is always a deep structural copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Expr {
    IntLiteral(i32),
    StrLiteral(String),
    Named(String),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Func(String, Vec<Expr>),
}

impl Expr {
    pub fn unary(op: UnOp, inner: Expr) -> Expr {
        Expr::Unary(op, Box::new(inner))
    }

    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary(op, Box::new(lhs), Box::new(rhs))
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::IntLiteral(v) => write!(f, "{v}"),
            Expr::StrLiteral(s) => write!(f, "\"{s}\""),
            Expr::Named(s) => write!(f, "{s}"),
            Expr::Unary(UnOp::Deref, e) => write!(f, "[{e}]"),
            Expr::Unary(op, e) => {
                let glyph = match op {
                    UnOp::Neg => "-",
                    UnOp::Not => "!",
                    UnOp::BitwiseNot => "~",
                    UnOp::AddrOf => "&",
                    UnOp::Deref => unreachable!(),
                };
                if matches!(**e, Expr::Binary(..)) {
                    write!(f, "{glyph}({e})")
                } else {
                    write!(f, "{glyph}{e}")
                }
            }
            Expr::Binary(BinOp::Assign, lhs, rhs) => write!(f, "[{lhs}] = {rhs}"),
            Expr::Binary(op, lhs, rhs) => write!(f, "{lhs} {} {rhs}", op.glyph()),
            Expr::Func(name, args) => {
                write!(f, "{name}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i != 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stmt {
    Push(Expr),
    Expr(Expr),
    Goto(Expr),
    GotoIf(Expr, Expr),
    Yield,
    Return(Expr),
}

fn label_name(target: i32) -> String {
    format!("label_{target}")
}

impl Stmt {
    fn goto(target: i32) -> Stmt {
        Stmt::Goto(Expr::Named(label_name(target)))
    }

    fn goto_if(target: i32, truth: Expr) -> Stmt {
        Stmt::GotoIf(Expr::Named(label_name(target)), truth)
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stmt::Push(e) => write!(f, "push {e};"),
            Stmt::Expr(e) => write!(f, "{e};"),
            Stmt::Goto(label) => write!(f, "goto {label};"),
            Stmt::GotoIf(label, truth) => write!(f, "goto {label} if {truth};"),
            Stmt::Yield => write!(f, "yield;"),
            Stmt::Return(e) => write!(f, "return {e};"),
        }
    }
}

pub const SCENE_KIND_FUNCTION: u8 = 0;
pub const SCENE_KIND_TURN3: u8 = 3;
pub const SCENE_KIND_AREA: u8 = 4;
pub const SCENE_KIND_TURN6: u8 = 6;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneInfo {
    pub idx: usize,
    pub kind: u8,
    pub name: String,
    pub arg_count: usize,
    pub parameters: Vec<u16>,
    /// One synthetic identifier per local slot, arguments first.
    pub var_names: Vec<String>,
    pub script: Vec<Instr>,
    pub is_global: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptContainer {
    pub scenes: Vec<SceneInfo>,
    pub string_pool: Vec<u8>,
    pub global_names: Vec<String>,
}

impl ScriptContainer {
    /// NUL-terminated string starting at `offset` in the pool. The string
    /// runs to the end of the pool when no terminator is present.
    pub fn get_string(&self, offset: usize) -> Result<String, DecmbError> {
        if offset >= self.string_pool.len() {
            return Err(DecmbError::BadStringOffset(offset));
        }
        let tail = &self.string_pool[offset..];
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        Ok(String::from_utf8_lossy(&tail[..end]).into_owned())
    }
}

pub fn decode_script(data: &[u8], dialect: Dialect) -> Result<Vec<Instr>, DecmbError> {
    let mut result = Vec::new();

    let mut i = 0usize;
    let mut last_jump = 0usize;

    while i < data.len() {
        let location = i;
        let byte = data[i];
        i += 1;

        let opcode = Opcode::from_repr(byte)
            .filter(|op| op.valid_in(Dialect::A))
            .ok_or(DecmbError::InvalidOpcode { location, opcode: byte })?;

        if !opcode.valid_in(dialect) {
            return Err(DecmbError::WrongDialectOpcode {
                location,
                mnemonic: opcode.mnemonic(),
                dialect,
            });
        }

        let width = opcode.info().operand_size as usize;
        let mut operand: i32 = 0;

        if width > 0 {
            if i + width > data.len() {
                return Err(DecmbError::TruncatedOperand {
                    location,
                    mnemonic: opcode.mnemonic(),
                });
            }

            operand = BigEndian::read_int(&data[i..i + width], width) as i32;
            i += width;

            // Dialect A gives call a variable-length operand: when the high
            // bit of the first operand byte is set, the operand is two
            // bytes with that bit cleared.
            if dialect == Dialect::A && opcode == Opcode::Call && (operand & 0x80) != 0 {
                if i >= data.len() {
                    return Err(DecmbError::TruncatedWideCall { location });
                }
                operand = ((operand & 0x7F) << 8) | data[i] as i32;
                i += 1;
            }
        }

        if opcode.is_jump() {
            let target = i as i64 + operand as i64 - width as i64;
            if target < 0 || target > data.len() as i64 {
                return Err(DecmbError::JumpOutOfRange { location, target });
            }
            operand = target as i32;
            last_jump = last_jump.max(target as usize);
        }

        result.push(Instr {
            location,
            opcode,
            operand,
        });

        // A return only terminates decoding when no earlier instruction
        // still jumps forward past it.
        if opcode.is_end() && i > last_jump {
            break;
        }
    }

    if let Some(last) = result.last() {
        if !last.opcode.is_end() {
            return Err(DecmbError::ScriptUnterminated);
        }
    }

    Ok(result)
}

/// Partition a decoded script at jump sources/targets and return points.
/// Slices are keyed by the location of their first instruction.
///
/// By default BKY/BKN do not contribute slice points: they are consumed by
/// the rewrite entirely within a slice, and splitting on them would
/// fragment short-circuit expressions. `split_branch_keeps` treats them as
/// ordinary jumps instead.
pub fn slice_script(
    script: &[Instr],
    split_branch_keeps: bool,
) -> Result<BTreeMap<usize, &[Instr]>, DecmbError> {
    let mut slice_points = BTreeSet::new();

    let locations: BTreeSet<usize> = script.iter().map(|ins| ins.location).collect();
    let end = script
        .last()
        .map_or(0, |ins| ins.location + 1 + ins.opcode.info().operand_size as usize);

    for ins in script {
        if !split_branch_keeps && ins.opcode.is_branch_keep() {
            continue;
        }

        if ins.opcode.is_jump() {
            let target = ins.operand as usize;
            if target != end && !locations.contains(&target) {
                return Err(DecmbError::MisalignedJumpTarget(target));
            }

            // a slice after the jump itself, one before its target
            slice_points.insert(ins.location + 1 + ins.opcode.info().operand_size as usize);
            slice_points.insert(target);
        }

        if ins.opcode.is_end() {
            slice_points.insert(ins.location + 1);
        }
    }

    let mut result: BTreeMap<usize, &[Instr]> = BTreeMap::new();
    let mut points = slice_points.into_iter();
    let mut start = 0usize;

    while start < script.len() {
        let cut = match points.next() {
            Some(offset) => script[start..]
                .iter()
                .position(|ins| ins.location >= offset)
                .map_or(script.len(), |p| start + p),
            None => script.len(),
        };

        result.insert(script[start].location, &script[start..cut]);
        start = cut;
    }

    Ok(result)
}

/// Rewrite BKY/BKN chains into the synthetic logical instructions.
///
/// The branch-and-keep is bubbled right until it sits just before its
/// target: the swept window is exactly the right operand of the
/// short-circuit operator, so the slice keeps its stack effect.
///
/// ```text
/// 0: val a          0: val a
/// 2: bkn 7     =>   5: val b
/// 5: val b          2: scand
/// 7: bn ...         7: bn ...
/// ```
pub fn rewrite_branch_keeps(slice: &[Instr]) -> Result<Vec<Instr>, DecmbError> {
    let mut out = slice.to_vec();

    let mut i = 0usize;
    while i < out.len() {
        let op = out[i].opcode;
        if !op.is_branch_keep() {
            i += 1;
            continue;
        }

        let location = out[i].location;
        let target = out[i].operand as usize;

        let mut j = i + 1;
        while j < out.len() && out[j].location != target {
            out.swap(j - 1, j);
            j += 1;
        }

        if j == out.len() {
            return Err(DecmbError::CrossSliceBranchKeep { location, target });
        }

        out[j - 1].opcode = if op == Opcode::Bkn {
            Opcode::FakeLand
        } else {
            Opcode::FakeLorr
        };
        out[j - 1].operand = 0;

        i += 2;
    }

    Ok(out)
}

/// Folds a post-rewrite slice into a statement list. The list doubles as
/// the symbolic stack: trailing `Push` statements are the pending values,
/// and non-push statements interrupt the stack without consuming it.
struct StmtBuilder<'a> {
    cmb: &'a ScriptContainer,
    scene: &'a SceneInfo,
    stmts: Vec<Stmt>,
}

impl StmtBuilder<'_> {
    fn found_pushes(&self) -> usize {
        self.stmts
            .iter()
            .rev()
            .take_while(|s| matches!(s, Stmt::Push(_)))
            .count()
    }

    fn expected(&self, ins: &Instr, needed: usize) -> DecmbError {
        DecmbError::ExpectedPush {
            location: ins.location,
            mnemonic: ins.opcode.mnemonic(),
            needed,
            found: self.found_pushes(),
        }
    }

    fn expect_pushes(&self, ins: &Instr, needed: usize) -> Result<(), DecmbError> {
        if self.found_pushes() < needed {
            return Err(self.expected(ins, needed));
        }
        Ok(())
    }

    fn pop_push(&mut self, ins: &Instr) -> Result<Expr, DecmbError> {
        match self.stmts.pop() {
            Some(Stmt::Push(e)) => Ok(e),
            Some(other) => {
                self.stmts.push(other);
                Err(self.expected(ins, 1))
            }
            None => Err(self.expected(ins, 1)),
        }
    }

    fn top_push(&mut self, ins: &Instr) -> Result<&mut Expr, DecmbError> {
        let err = self.expected(ins, 1);
        match self.stmts.last_mut() {
            Some(Stmt::Push(e)) => Ok(e),
            _ => Err(err),
        }
    }

    fn map_top(&mut self, ins: &Instr, f: impl FnOnce(Expr) -> Expr) -> Result<(), DecmbError> {
        let top = self.top_push(ins)?;
        let inner = mem::replace(top, Expr::IntLiteral(0));
        *top = f(inner);
        Ok(())
    }

    fn unop(&mut self, ins: &Instr, op: UnOp) -> Result<(), DecmbError> {
        self.map_top(ins, |e| Expr::unary(op, e))
    }

    fn binop(&mut self, ins: &Instr, op: BinOp) -> Result<(), DecmbError> {
        self.expect_pushes(ins, 2)?;
        let rhs = self.pop_push(ins)?;
        let lhs = self.pop_push(ins)?;
        self.stmts.push(Stmt::Push(Expr::binary(op, lhs, rhs)));
        Ok(())
    }

    fn call(&mut self, ins: &Instr, name: String, argc: usize) -> Result<(), DecmbError> {
        self.expect_pushes(ins, argc)?;
        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            args.push(self.pop_push(ins)?);
        }
        args.reverse();
        self.stmts.push(Stmt::Push(Expr::Func(name, args)));
        Ok(())
    }

    /// Reclassify the top push as a bare expression statement.
    fn discard_top(&mut self, ins: &Instr) -> Result<(), DecmbError> {
        let e = self.pop_push(ins)?;
        self.stmts.push(Stmt::Expr(e));
        Ok(())
    }

    fn local_name(&self, ins: &Instr) -> Result<String, DecmbError> {
        self.scene
            .var_names
            .get(ins.operand as usize)
            .cloned()
            .ok_or(DecmbError::BadLocalSlot {
                location: ins.location,
                mnemonic: ins.opcode.mnemonic(),
                slot: ins.operand,
                len: self.scene.var_names.len(),
            })
    }

    fn global_name(&self, ins: &Instr) -> Result<String, DecmbError> {
        self.cmb
            .global_names
            .get(ins.operand as usize)
            .cloned()
            .ok_or(DecmbError::BadGlobalSlot {
                location: ins.location,
                mnemonic: ins.opcode.mnemonic(),
                slot: ins.operand,
                len: self.cmb.global_names.len(),
            })
    }

    fn eval(&mut self, ins: &Instr) -> Result<(), DecmbError> {
        match ins.opcode {
            Opcode::Nop | Opcode::Unk40 => {}

            Opcode::Val8 | Opcode::Val16 => {
                let name = self.local_name(ins)?;
                self.stmts.push(Stmt::Push(Expr::Named(name)));
            }

            Opcode::Valx8 | Opcode::Valx16 => {
                // push a => push [&var + a]
                let name = self.local_name(ins)?;
                self.map_top(ins, |index| {
                    Expr::unary(
                        UnOp::Deref,
                        Expr::binary(
                            BinOp::Add,
                            Expr::unary(UnOp::AddrOf, Expr::Named(name)),
                            index,
                        ),
                    )
                })?;
            }

            Opcode::Valy8 | Opcode::Valy16 => {
                // push a => push [[var] + a]
                let name = self.local_name(ins)?;
                self.map_top(ins, |index| {
                    Expr::unary(
                        UnOp::Deref,
                        Expr::binary(
                            BinOp::Add,
                            Expr::unary(UnOp::Deref, Expr::Named(name)),
                            index,
                        ),
                    )
                })?;
            }

            Opcode::Ref8 | Opcode::Ref16 => {
                let name = self.local_name(ins)?;
                self.stmts
                    .push(Stmt::Push(Expr::unary(UnOp::AddrOf, Expr::Named(name))));
            }

            Opcode::Refx8 | Opcode::Refx16 => {
                // push a => push &var + a
                let name = self.local_name(ins)?;
                self.map_top(ins, |index| {
                    Expr::binary(
                        BinOp::Add,
                        Expr::unary(UnOp::AddrOf, Expr::Named(name)),
                        index,
                    )
                })?;
            }

            Opcode::Refy8 | Opcode::Refy16 => {
                // push a => push [var] + a
                let name = self.local_name(ins)?;
                self.map_top(ins, |index| {
                    Expr::binary(
                        BinOp::Add,
                        Expr::unary(UnOp::Deref, Expr::Named(name)),
                        index,
                    )
                })?;
            }

            Opcode::Gval8 | Opcode::Gval16 => {
                let name = self.global_name(ins)?;
                self.stmts.push(Stmt::Push(Expr::Named(name)));
            }

            Opcode::Gvalx8 | Opcode::Gvalx16 => {
                let name = self.global_name(ins)?;
                self.map_top(ins, |index| {
                    Expr::unary(
                        UnOp::Deref,
                        Expr::binary(
                            BinOp::Add,
                            Expr::unary(UnOp::AddrOf, Expr::Named(name)),
                            index,
                        ),
                    )
                })?;
            }

            Opcode::Gvaly8 | Opcode::Gvaly16 => {
                let name = self.global_name(ins)?;
                self.map_top(ins, |index| {
                    Expr::unary(
                        UnOp::Deref,
                        Expr::binary(
                            BinOp::Add,
                            Expr::unary(UnOp::Deref, Expr::Named(name)),
                            index,
                        ),
                    )
                })?;
            }

            Opcode::Gref8 | Opcode::Gref16 => {
                let name = self.global_name(ins)?;
                self.stmts
                    .push(Stmt::Push(Expr::unary(UnOp::AddrOf, Expr::Named(name))));
            }

            Opcode::Grefx8 | Opcode::Grefx16 => {
                let name = self.global_name(ins)?;
                self.map_top(ins, |index| {
                    Expr::binary(
                        BinOp::Add,
                        Expr::unary(UnOp::AddrOf, Expr::Named(name)),
                        index,
                    )
                })?;
            }

            Opcode::Grefy8 | Opcode::Grefy16 => {
                let name = self.global_name(ins)?;
                self.map_top(ins, |index| {
                    Expr::binary(
                        BinOp::Add,
                        Expr::unary(UnOp::Deref, Expr::Named(name)),
                        index,
                    )
                })?;
            }

            Opcode::Number8 | Opcode::Number16 | Opcode::Number32 => {
                self.stmts.push(Stmt::Push(Expr::IntLiteral(ins.operand)));
            }

            Opcode::String8 | Opcode::String16 | Opcode::String32 => {
                let s = self.cmb.get_string(ins.operand as u32 as usize)?;
                self.stmts.push(Stmt::Push(Expr::StrLiteral(s)));
            }

            Opcode::Deref => {
                // push a => push a, [a] (top not consumed)
                let copy = self.top_push(ins)?.clone();
                self.stmts.push(Stmt::Push(Expr::unary(UnOp::Deref, copy)));
            }

            Opcode::Disc => {
                self.discard_top(ins)?;
            }

            // store leaves the assigned value pending; assign discards it
            Opcode::Store => self.binop(ins, BinOp::Assign)?,

            Opcode::Add => self.binop(ins, BinOp::Add)?,
            Opcode::Sub => self.binop(ins, BinOp::Sub)?,
            Opcode::Mul => self.binop(ins, BinOp::Mul)?,
            Opcode::Div => self.binop(ins, BinOp::Div)?,
            Opcode::Mod => self.binop(ins, BinOp::Mod)?,
            Opcode::Orr => self.binop(ins, BinOp::Or)?,
            Opcode::And => self.binop(ins, BinOp::And)?,
            Opcode::Xor => self.binop(ins, BinOp::Xor)?,
            Opcode::Lsl => self.binop(ins, BinOp::Lsl)?,
            Opcode::Lsr => self.binop(ins, BinOp::Lsr)?,
            Opcode::Eq => self.binop(ins, BinOp::Eq)?,
            Opcode::Ne => self.binop(ins, BinOp::Ne)?,
            Opcode::Lt => self.binop(ins, BinOp::Lt)?,
            Opcode::Le => self.binop(ins, BinOp::Le)?,
            Opcode::Gt => self.binop(ins, BinOp::Gt)?,
            Opcode::Ge => self.binop(ins, BinOp::Ge)?,
            Opcode::EqStr => self.binop(ins, BinOp::EqStr)?,
            Opcode::NeStr => self.binop(ins, BinOp::NeStr)?,

            Opcode::Neg => self.unop(ins, UnOp::Neg)?,
            Opcode::Not => self.unop(ins, UnOp::Not)?,
            Opcode::Mvn => self.unop(ins, UnOp::BitwiseNot)?,

            Opcode::Call => {
                let (name, argc) = match self.cmb.scenes.get(ins.operand as usize) {
                    Some(scene) => (scene.name.clone(), scene.arg_count),
                    None => {
                        return Err(DecmbError::BadSceneIndex {
                            location: ins.location,
                            index: ins.operand,
                            len: self.cmb.scenes.len(),
                        })
                    }
                };
                self.call(ins, name, argc)?;
            }

            Opcode::CallExt => {
                // operand packs the name offset in the high bits, argc low
                let name = self.cmb.get_string((ins.operand as u32 >> 8) as usize)?;
                let argc = (ins.operand as u32 & 0xFF) as usize;
                self.call(ins, name, argc)?;
            }

            Opcode::Printf => {
                let argc = ins.operand as u32 as usize;
                self.call(ins, "__printf".to_string(), argc)?;
                self.discard_top(ins)?;
            }

            Opcode::Return => {
                let e = self.pop_push(ins)?;
                self.stmts.push(Stmt::Return(e));
            }

            Opcode::Retn => self.stmts.push(Stmt::Return(Expr::IntLiteral(0))),
            Opcode::Rety => self.stmts.push(Stmt::Return(Expr::IntLiteral(1))),

            Opcode::B => self.stmts.push(Stmt::goto(ins.operand)),

            Opcode::Bn => {
                let e = self.pop_push(ins)?;
                self.stmts
                    .push(Stmt::goto_if(ins.operand, Expr::unary(UnOp::Not, e)));
            }

            Opcode::By => {
                let e = self.pop_push(ins)?;
                self.stmts.push(Stmt::goto_if(ins.operand, e));
            }

            Opcode::Yield => self.stmts.push(Stmt::Yield),

            Opcode::Inc | Opcode::Dec => {
                // push a => [a] = [a] +/- 1
                let addr = self.pop_push(ins)?;
                let op = if ins.opcode == Opcode::Inc {
                    BinOp::Add
                } else {
                    BinOp::Sub
                };
                let rhs = Expr::binary(
                    op,
                    Expr::unary(UnOp::Deref, addr.clone()),
                    Expr::IntLiteral(1),
                );
                self.stmts
                    .push(Stmt::Expr(Expr::binary(BinOp::Assign, addr, rhs)));
            }

            Opcode::Dup => {
                let copy = self.top_push(ins)?.clone();
                self.stmts.push(Stmt::Push(copy));
            }

            Opcode::Assign => {
                self.binop(ins, BinOp::Assign)?;
                self.discard_top(ins)?;
            }

            Opcode::FakeLand => self.binop(ins, BinOp::LogicalAnd)?,
            Opcode::FakeLorr => self.binop(ins, BinOp::LogicalOr)?,

            // branch-and-keeps must have been rewritten away by now
            Opcode::Bky | Opcode::Bkn => {
                return Err(DecmbError::UnsupportedOpcode {
                    location: ins.location,
                    mnemonic: ins.opcode.mnemonic(),
                })
            }
        }

        Ok(())
    }
}

pub fn make_statements(
    cmb: &ScriptContainer,
    scene: &SceneInfo,
    slice: &[Instr],
) -> Result<Vec<Stmt>, DecmbError> {
    let mut builder = StmtBuilder {
        cmb,
        scene,
        stmts: Vec::with_capacity(slice.len()),
    };

    for ins in slice {
        builder.eval(ins)?;
    }

    Ok(builder.stmts)
}

const GLOBAL_SUSPICION_LIMIT: usize = 1000;
const LOCALS_SUSPICION_LIMIT: usize = 1000;
const PARAMS_SUSPICION_LIMIT: usize = 20;

fn read_name(data: &[u8], offset: usize) -> Result<String, DecmbError> {
    let tail = data
        .get(offset..)
        .ok_or(DecmbError::UnterminatedSceneName(offset))?;
    let end = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or(DecmbError::UnterminatedSceneName(offset))?;
    Ok(String::from_utf8_lossy(&tail[..end]).into_owned())
}

pub fn parse_container(data: &[u8], dialect: Dialect) -> Result<ScriptContainer, DecmbError> {
    if data.len() < 0x2C {
        return Err(DecmbError::ContainerTooSmall(data.len()));
    }

    let global_count = LittleEndian::read_u16(&data[0x22..0x24]) as usize;
    let off_strings = LittleEndian::read_u32(&data[0x24..0x28]) as usize;
    let off_events = LittleEndian::read_u32(&data[0x28..0x2C]) as usize;

    if off_strings >= data.len() {
        return Err(DecmbError::StringPoolPastEnd);
    }
    if off_events >= data.len() {
        return Err(DecmbError::EventTablePastEnd);
    }
    if global_count > GLOBAL_SUSPICION_LIMIT {
        return Err(DecmbError::SuspiciousGlobalCount(global_count));
    }

    // The pool usually sits before the event table; when it comes after,
    // it runs to the end of the file.
    let string_pool = if off_strings > off_events {
        data[off_strings..].to_vec()
    } else {
        data[off_strings..off_events].to_vec()
    };

    let global_names = (0..global_count).map(|i| format!("gvar_{i}")).collect();

    let mut scenes = Vec::new();

    for i in 0usize.. {
        let entry = off_events + 4 * i;
        if entry + 4 > data.len() {
            return Err(DecmbError::EventTableUnterminated);
        }

        let off_event = LittleEndian::read_u32(&data[entry..entry + 4]) as usize;
        if off_event == 0 {
            break;
        }

        if off_event + 0x14 > data.len() {
            return Err(DecmbError::TruncatedEventRecord { index: i });
        }

        let off_name = LittleEndian::read_u32(&data[off_event..off_event + 4]) as usize;
        let off_script = LittleEndian::read_u32(&data[off_event + 4..off_event + 8]) as usize;
        let kind = data[off_event + 0x0C];
        let arg_count = data[off_event + 0x0D] as usize;
        let param_count = data[off_event + 0x0E] as usize;
        let idx = LittleEndian::read_u16(&data[off_event + 0x10..off_event + 0x12]) as usize;
        let var_count = LittleEndian::read_u16(&data[off_event + 0x12..off_event + 0x14]) as usize;

        if param_count > PARAMS_SUSPICION_LIMIT {
            return Err(DecmbError::SuspiciousParamCount {
                index: i,
                count: param_count,
            });
        }
        if var_count > LOCALS_SUSPICION_LIMIT {
            return Err(DecmbError::SuspiciousVarCount {
                index: i,
                count: var_count,
            });
        }
        if arg_count > var_count {
            return Err(DecmbError::ArgCountPastVarCount { index: i });
        }
        if off_event + 0x14 + 2 * param_count > data.len() {
            return Err(DecmbError::TruncatedEventRecord { index: i });
        }
        if idx != i {
            return Err(DecmbError::SceneIndexMismatch {
                expected: i,
                found: idx,
            });
        }

        let name = if off_name == 0 {
            format!("unk_{idx}")
        } else {
            read_name(data, off_name)?
        };

        let parameters = (0..param_count)
            .map(|p| {
                let at = off_event + 0x14 + 2 * p;
                LittleEndian::read_u16(&data[at..at + 2])
            })
            .collect();

        let var_names = (0..var_count)
            .map(|v| {
                if v < arg_count {
                    format!("arg_{v}")
                } else {
                    format!("var_{v}")
                }
            })
            .collect();

        let body = data
            .get(off_script..)
            .ok_or(DecmbError::ScriptPastEnd { index: i })?;
        let script = decode_script(body, dialect)?;

        scenes.push(SceneInfo {
            idx,
            kind,
            name,
            arg_count,
            parameters,
            var_names,
            script,
            is_global: off_name != 0,
        });
    }

    Ok(ScriptContainer {
        scenes,
        string_pool,
        global_names,
    })
}

fn disassemble_scene(scene: &SceneInfo, out: &mut String) {
    out.push_str(&format!(
        "EVENT {} (args={}, vars={}, kind={})\n",
        scene.name,
        scene.arg_count,
        scene.var_names.len(),
        scene.kind
    ));

    for ins in &scene.script {
        let info = ins.opcode.info();
        if info.is_jump {
            out.push_str(&format!(
                "{:05} {:<8} label_{}\n",
                ins.location, info.mnemonic, ins.operand
            ));
        } else if info.operand_size > 0 {
            out.push_str(&format!(
                "{:05} {:<8} {}\n",
                ins.location, info.mnemonic, ins.operand
            ));
        } else {
            out.push_str(&format!("{:05} {}\n", ins.location, info.mnemonic));
        }
    }
}

fn decompile_scene(
    cmb: &ScriptContainer,
    scene: &SceneInfo,
    split_branch_keeps: bool,
    out: &mut String,
) -> Result<(), DecmbError> {
    let slices = slice_script(&scene.script, split_branch_keeps)?;

    let labels: BTreeSet<usize> = scene
        .script
        .iter()
        .filter(|ins| ins.opcode.is_jump() && !ins.opcode.is_branch_keep())
        .map(|ins| ins.operand as usize)
        .collect();

    for (&start, slice) in &slices {
        if slice.is_empty() {
            continue;
        }

        if start != 0 {
            out.push('\n');
        }

        if labels.contains(&start) {
            out.push_str(&format!("label_{start}:\n"));
        }

        let fixed = rewrite_branch_keeps(slice)?;
        for stmt in make_statements(cmb, scene, &fixed)? {
            out.push_str(&format!("  {stmt}\n"));
        }
    }

    Ok(())
}

pub fn decompile_with_options(
    data: &[u8],
    options: DecompileOptions,
) -> Result<String, DecmbError> {
    let cmb = parse_container(data, options.dialect)?;

    let mut out = String::new();

    match options.mode {
        OutputMode::Disasm => {
            for scene in &cmb.scenes {
                if !out.is_empty() {
                    out.push('\n');
                }
                disassemble_scene(scene, &mut out);
            }
        }

        OutputMode::Pseudo => {
            for name in &cmb.global_names {
                out.push_str(&format!("VARIABLE {name};\n"));
            }
            if !cmb.global_names.is_empty() {
                out.push('\n');
            }

            for scene in &cmb.scenes {
                out.push_str(&format!("EVENT {}(", scene.name));
                for (i, arg) in scene.var_names.iter().take(scene.arg_count).enumerate() {
                    if i != 0 {
                        out.push_str(", ");
                    }
                    out.push_str(arg);
                }
                out.push(')');
                if scene.is_global {
                    out.push_str(" global");
                }
                out.push('\n');
                out.push_str("{\n");

                let mut body = String::new();
                if let Err(e) =
                    decompile_scene(&cmb, scene, options.split_branch_keeps, &mut body)
                {
                    body.push_str(&format!("  // decompile error: {e}\n"));
                }
                out.push_str(&body);

                out.push_str("}\n\n");
            }
        }
    }

    Ok(out)
}

pub fn decompile(data: &[u8]) -> Result<String, DecmbError> {
    decompile_with_options(data, DecompileOptions::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ins(location: usize, opcode: Opcode, operand: i32) -> Instr {
        Instr {
            location,
            opcode,
            operand,
        }
    }

    fn empty_container() -> ScriptContainer {
        ScriptContainer {
            scenes: Vec::new(),
            string_pool: Vec::new(),
            global_names: Vec::new(),
        }
    }

    fn container_with_pool(pool: &[u8]) -> ScriptContainer {
        ScriptContainer {
            scenes: Vec::new(),
            string_pool: pool.to_vec(),
            global_names: Vec::new(),
        }
    }

    fn scene_with_vars(names: &[&str], arg_count: usize) -> SceneInfo {
        SceneInfo {
            idx: 0,
            kind: SCENE_KIND_FUNCTION,
            name: "test".into(),
            arg_count,
            parameters: Vec::new(),
            var_names: names.iter().map(|s| s.to_string()).collect(),
            script: Vec::new(),
            is_global: false,
        }
    }

    fn put_u16(data: &mut [u8], offset: usize, value: u16) {
        LittleEndian::write_u16(&mut data[offset..offset + 2], value);
    }

    fn put_u32(data: &mut [u8], offset: usize, value: u32) {
        LittleEndian::write_u32(&mut data[offset..offset + 4], value);
    }

    // One global, one event "main" whose script is a single retn.
    fn sample_container() -> Vec<u8> {
        let mut data = vec![0u8; 0x4E];

        put_u16(&mut data, 0x22, 1); // globals
        put_u32(&mut data, 0x24, 0x41); // string pool
        put_u32(&mut data, 0x28, 0x46); // event table

        put_u32(&mut data, 0x2C, 0x41); // name offset
        put_u32(&mut data, 0x2C + 0x04, 0x40); // script offset
        data[0x2C + 0x0C] = SCENE_KIND_FUNCTION;
        data[0x2C + 0x0D] = 0; // args
        data[0x2C + 0x0E] = 0; // params
        put_u16(&mut data, 0x2C + 0x10, 0); // idx
        put_u16(&mut data, 0x2C + 0x12, 0); // vars

        data[0x40] = Opcode::Retn as u8;
        data[0x41..0x46].copy_from_slice(b"main\0");

        put_u32(&mut data, 0x46, 0x2C); // event 0
        put_u32(&mut data, 0x4A, 0); // terminator

        data
    }

    // Anonymous event with one argument and one local running a
    // short-circuit AND: val 0; bkn 7; val 1; bn 10; retn.
    fn short_circuit_container() -> Vec<u8> {
        let mut data = vec![0u8; 0x54];

        put_u16(&mut data, 0x22, 0);
        put_u32(&mut data, 0x24, 0x4B);
        put_u32(&mut data, 0x28, 0x4C);

        put_u32(&mut data, 0x2C, 0); // anonymous
        put_u32(&mut data, 0x2C + 0x04, 0x40);
        data[0x2C + 0x0C] = SCENE_KIND_FUNCTION;
        data[0x2C + 0x0D] = 1;
        data[0x2C + 0x0E] = 0;
        put_u16(&mut data, 0x2C + 0x10, 0);
        put_u16(&mut data, 0x2C + 0x12, 2);

        data[0x40..0x4B].copy_from_slice(&[
            0x01, 0x00, // val arg_0
            0x3E, 0x00, 0x04, // bkn -> 7
            0x01, 0x01, // val var_1
            0x3D, 0x00, 0x02, // bn -> 10
            0x45, // retn
        ]);

        put_u32(&mut data, 0x4C, 0x2C);
        put_u32(&mut data, 0x50, 0);

        data
    }

    #[test]
    fn table_covers_every_opcode() {
        assert_eq!(OPCODE_INFO.len(), 0x4A);
        for byte in 0x00..=0x49u8 {
            let op = Opcode::from_repr(byte).expect("every table slot is an opcode");
            assert_eq!(op as u8, byte);
            assert!(!op.info().mnemonic.is_empty());
        }
        assert!(Opcode::from_repr(0x4A).is_none());
    }

    #[test]
    fn jump_and_end_flags() {
        let jumps: Vec<Opcode> = (0x00..=0x49u8)
            .filter_map(Opcode::from_repr)
            .filter(|op| op.is_jump())
            .collect();
        assert_eq!(
            jumps,
            [Opcode::B, Opcode::By, Opcode::Bky, Opcode::Bn, Opcode::Bkn]
        );

        assert!(Opcode::Return.is_end());
        assert!(Opcode::Retn.is_end());
        assert!(Opcode::Rety.is_end());
        assert!(!Opcode::B.is_end());
    }

    #[test]
    fn dialect_validity() {
        assert!(Opcode::Retn.valid_in(Dialect::A));
        assert!(!Opcode::Retn.valid_in(Dialect::B));
        assert!(Opcode::Call.valid_in(Dialect::B));
        assert!(!Opcode::FakeLand.valid_in(Dialect::A));
        assert!(!Opcode::FakeLorr.valid_in(Dialect::B));
    }

    #[test]
    fn decode_empty_script() {
        let script = decode_script(&[], Dialect::A).unwrap();
        assert!(script.is_empty());
    }

    #[test]
    fn decode_arithmetic() {
        let script = decode_script(&[0x19, 0x02, 0x19, 0x03, 0x22, 0x39], Dialect::A).unwrap();
        assert_eq!(
            script,
            [
                ins(0, Opcode::Number8, 2),
                ins(2, Opcode::Number8, 3),
                ins(4, Opcode::Add, 0),
                ins(5, Opcode::Return, 0),
            ]
        );
    }

    #[test]
    fn decode_sign_extends_operands() {
        let script = decode_script(&[0x19, 0xFF, 0x45], Dialect::A).unwrap();
        assert_eq!(script[0].operand, -1);
    }

    #[test]
    fn decode_rejects_truncated_operand() {
        let err = decode_script(&[0x19], Dialect::A).unwrap_err();
        assert!(matches!(err, DecmbError::TruncatedOperand { location: 0, .. }));
    }

    #[test]
    fn decode_rejects_unknown_opcode() {
        let err = decode_script(&[0x4A], Dialect::A).unwrap_err();
        assert!(matches!(err, DecmbError::InvalidOpcode { opcode: 0x4A, .. }));

        // the synthetic opcodes are not decodable either
        let err = decode_script(&[0x48], Dialect::A).unwrap_err();
        assert!(matches!(err, DecmbError::InvalidOpcode { opcode: 0x48, .. }));
    }

    #[test]
    fn decode_rejects_wrong_dialect_opcode() {
        let err = decode_script(&[0x45], Dialect::B).unwrap_err();
        assert!(matches!(
            err,
            DecmbError::WrongDialectOpcode {
                dialect: Dialect::B,
                ..
            }
        ));

        assert!(decode_script(&[0x45], Dialect::A).is_ok());
    }

    #[test]
    fn decode_rejects_unterminated_script() {
        let err = decode_script(&[0x00], Dialect::A).unwrap_err();
        assert!(matches!(err, DecmbError::ScriptUnterminated));
    }

    #[test]
    fn wide_call_top_bit_clear_stays_one_byte() {
        let script = decode_script(&[0x37, 0x7F, 0x45], Dialect::A).unwrap();
        assert_eq!(script[0].operand, 0x7F);
        assert_eq!(script[1].location, 2);
    }

    #[test]
    fn wide_call_top_bit_set_extends() {
        let script = decode_script(&[0x37, 0x80, 0x05, 0x45], Dialect::A).unwrap();
        assert_eq!(script[0].operand, 0x0005);
        assert_eq!(script[1].location, 3);
    }

    #[test]
    fn wide_call_clears_top_bit() {
        let script = decode_script(&[0x37, 0xFF, 0x00, 0x45], Dialect::A).unwrap();
        assert_eq!(script[0].operand, 0x7F00);
    }

    #[test]
    fn wide_call_is_dialect_a_only() {
        let script = decode_script(&[0x37, 0x80, 0x39], Dialect::B).unwrap();
        assert_eq!(script[0].operand, -128);
        assert_eq!(script[1].location, 2);
    }

    #[test]
    fn wide_call_rejects_truncation() {
        let err = decode_script(&[0x37, 0x80], Dialect::A).unwrap_err();
        assert!(matches!(err, DecmbError::TruncatedWideCall { location: 0 }));
    }

    #[test]
    fn return_before_forward_target_continues_decoding() {
        // b -> 5; retn; nop; retn
        let script = decode_script(&[0x3A, 0x00, 0x04, 0x45, 0x00, 0x45], Dialect::A).unwrap();
        assert_eq!(script.len(), 4);
        assert_eq!(script[0].operand, 5);
        assert_eq!(script[3].location, 5);
    }

    #[test]
    fn decode_rejects_jump_out_of_range() {
        let err = decode_script(&[0x3A, 0x7F, 0x00, 0x45], Dialect::A).unwrap_err();
        assert!(matches!(err, DecmbError::JumpOutOfRange { location: 0, .. }));
    }

    #[test]
    fn slices_cut_at_jump_boundaries() {
        let script = [
            ins(0, Opcode::B, 4),
            ins(3, Opcode::Nop, 0),
            ins(4, Opcode::Retn, 0),
        ];
        let slices = slice_script(&script, false).unwrap();

        let keys: Vec<usize> = slices.keys().copied().collect();
        assert_eq!(keys, [0, 3, 4]);
        assert!(slices.values().all(|s| s.len() == 1));
    }

    #[test]
    fn branch_keeps_do_not_split_by_default() {
        let script = [
            ins(0, Opcode::Val8, 0),
            ins(2, Opcode::Bkn, 7),
            ins(5, Opcode::Val8, 1),
            ins(7, Opcode::Bn, 10),
            ins(10, Opcode::Retn, 0),
        ];

        let slices = slice_script(&script, false).unwrap();
        let keys: Vec<usize> = slices.keys().copied().collect();
        assert_eq!(keys, [0, 10]);
        assert_eq!(slices[&0].len(), 4);

        let split = slice_script(&script, true).unwrap();
        let keys: Vec<usize> = split.keys().copied().collect();
        assert_eq!(keys, [0, 5, 7, 10]);
    }

    #[test]
    fn slicer_rejects_misaligned_jump_target() {
        let script = [ins(0, Opcode::B, 2), ins(3, Opcode::Retn, 0)];
        let err = slice_script(&script, false).unwrap_err();
        assert!(matches!(err, DecmbError::MisalignedJumpTarget(2)));
    }

    #[test]
    fn empty_script_has_no_slices() {
        assert!(slice_script(&[], false).unwrap().is_empty());
    }

    #[test]
    fn rewrite_single_branch_keep() {
        let slice = [
            ins(0, Opcode::Val8, 0),
            ins(2, Opcode::Bkn, 7),
            ins(5, Opcode::Val8, 1),
            ins(7, Opcode::Bn, 14),
        ];
        let fixed = rewrite_branch_keeps(&slice).unwrap();

        let opcodes: Vec<Opcode> = fixed.iter().map(|i| i.opcode).collect();
        assert_eq!(
            opcodes,
            [Opcode::Val8, Opcode::Val8, Opcode::FakeLand, Opcode::Bn]
        );

        // the rewrite reorders but never relocates
        let locations: Vec<usize> = fixed.iter().map(|i| i.location).collect();
        assert_eq!(locations, [0, 5, 2, 7]);
        assert_eq!(fixed[2].operand, 0);
    }

    #[test]
    fn rewrite_chained_branch_keeps() {
        let slice = [
            ins(0, Opcode::Val8, 0),
            ins(2, Opcode::Bkn, 7),
            ins(5, Opcode::Val8, 1),
            ins(7, Opcode::Bkn, 12),
            ins(10, Opcode::Val8, 2),
            ins(12, Opcode::Bn, 20),
        ];
        let fixed = rewrite_branch_keeps(&slice).unwrap();

        let opcodes: Vec<Opcode> = fixed.iter().map(|i| i.opcode).collect();
        assert_eq!(
            opcodes,
            [
                Opcode::Val8,
                Opcode::Val8,
                Opcode::FakeLand,
                Opcode::Val8,
                Opcode::FakeLand,
                Opcode::Bn,
            ]
        );
    }

    #[test]
    fn rewrite_turns_bky_into_logical_or() {
        let slice = [
            ins(0, Opcode::Val8, 0),
            ins(2, Opcode::Bky, 7),
            ins(5, Opcode::Val8, 1),
            ins(7, Opcode::Bn, 14),
        ];
        let fixed = rewrite_branch_keeps(&slice).unwrap();
        assert_eq!(fixed[2].opcode, Opcode::FakeLorr);
    }

    #[test]
    fn rewrite_rejects_cross_slice_branch_keep() {
        let slice = [
            ins(0, Opcode::Val8, 0),
            ins(2, Opcode::Bky, 9),
            ins(5, Opcode::Val8, 1),
        ];
        let err = rewrite_branch_keeps(&slice).unwrap_err();
        assert!(matches!(
            err,
            DecmbError::CrossSliceBranchKeep {
                location: 2,
                target: 9,
            }
        ));
    }

    #[test]
    fn rewrite_without_branch_keeps_is_identity() {
        let slice = [ins(0, Opcode::Number8, 1), ins(2, Opcode::Retn, 0)];
        assert_eq!(rewrite_branch_keeps(&slice).unwrap(), slice);
    }

    #[test]
    fn eval_arithmetic_folds_to_return() {
        let cmb = empty_container();
        let scene = scene_with_vars(&[], 0);
        let slice = [
            ins(0, Opcode::Number8, 2),
            ins(2, Opcode::Number8, 3),
            ins(4, Opcode::Add, 0),
            ins(5, Opcode::Return, 0),
        ];

        let stmts = make_statements(&cmb, &scene, &slice).unwrap();
        assert_eq!(stmts.len(), 1);
        assert_eq!(stmts[0].to_string(), "return 2 + 3;");
    }

    #[test]
    fn eval_short_circuit_and() {
        let cmb = empty_container();
        let scene = scene_with_vars(&["var_0", "var_1"], 0);
        let slice = [
            ins(0, Opcode::Val8, 0),
            ins(2, Opcode::Bkn, 7),
            ins(5, Opcode::Val8, 1),
            ins(7, Opcode::Bn, 14),
        ];

        let fixed = rewrite_branch_keeps(&slice).unwrap();
        let stmts = make_statements(&cmb, &scene, &fixed).unwrap();

        assert_eq!(stmts.len(), 1);
        assert_eq!(
            stmts[0].to_string(),
            "goto label_14 if !(var_0 && var_1);"
        );
    }

    #[test]
    fn eval_callext_pulls_name_and_argc_from_operand() {
        let cmb = container_with_pool(b"\0\0\0log\0");
        let scene = scene_with_vars(&[], 0);
        let slice = [
            ins(0, Opcode::Number8, 7),
            ins(2, Opcode::Number8, 8),
            ins(4, Opcode::CallExt, (3 << 8) | 2),
        ];

        let stmts = make_statements(&cmb, &scene, &slice).unwrap();
        assert_eq!(stmts.len(), 1);
        assert_eq!(stmts[0].to_string(), "push log(7, 8);");
    }

    #[test]
    fn eval_internal_call_uses_scene_arity() {
        let mut cmb = empty_container();
        let mut callee = scene_with_vars(&["arg_0", "arg_1"], 2);
        callee.name = "OnTurn".into();
        cmb.scenes.push(callee);

        let scene = scene_with_vars(&[], 0);
        let slice = [
            ins(0, Opcode::Number8, 1),
            ins(2, Opcode::Number8, 2),
            ins(4, Opcode::Call, 0),
        ];

        let stmts = make_statements(&cmb, &scene, &slice).unwrap();
        assert_eq!(stmts[0].to_string(), "push OnTurn(1, 2);");
    }

    #[test]
    fn eval_assign_discards_value() {
        let cmb = empty_container();
        let scene = scene_with_vars(&["var_0"], 0);
        let slice = [
            ins(0, Opcode::Ref8, 0),
            ins(2, Opcode::Number8, 5),
            ins(4, Opcode::Assign, 0),
        ];

        let stmts = make_statements(&cmb, &scene, &slice).unwrap();
        assert_eq!(stmts.len(), 1);
        assert!(matches!(stmts[0], Stmt::Expr(_)));
        assert_eq!(stmts[0].to_string(), "[&var_0] = 5;");
    }

    #[test]
    fn eval_store_keeps_value_pending() {
        let cmb = empty_container();
        let scene = scene_with_vars(&["var_0"], 0);
        let slice = [
            ins(0, Opcode::Ref8, 0),
            ins(2, Opcode::Number8, 5),
            ins(4, Opcode::Store, 0),
        ];

        let stmts = make_statements(&cmb, &scene, &slice).unwrap();
        assert_eq!(stmts.len(), 1);
        assert!(matches!(stmts[0], Stmt::Push(_)));
        assert_eq!(stmts[0].to_string(), "push [&var_0] = 5;");
    }

    #[test]
    fn eval_yield_and_retn() {
        let cmb = empty_container();
        let scene = scene_with_vars(&[], 0);
        let slice = [ins(0, Opcode::Yield, 0), ins(1, Opcode::Retn, 0)];

        let stmts = make_statements(&cmb, &scene, &slice).unwrap();
        assert_eq!(stmts, [Stmt::Yield, Stmt::Return(Expr::IntLiteral(0))]);
    }

    #[test]
    fn eval_printf_reclassifies_result() {
        let cmb = empty_container();
        let scene = scene_with_vars(&[], 0);
        let slice = [ins(0, Opcode::Number8, 1), ins(2, Opcode::Printf, 1)];

        let stmts = make_statements(&cmb, &scene, &slice).unwrap();
        assert_eq!(stmts.len(), 1);
        assert!(matches!(stmts[0], Stmt::Expr(_)));
        assert_eq!(stmts[0].to_string(), "__printf(1);");
    }

    #[test]
    fn eval_dup_deep_copies_top() {
        let cmb = empty_container();
        let scene = scene_with_vars(&["var_0"], 0);
        let slice = [ins(0, Opcode::Ref8, 0), ins(2, Opcode::Dup, 0)];

        let stmts = make_statements(&cmb, &scene, &slice).unwrap();
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0], stmts[1]);
    }

    #[test]
    fn eval_deref_does_not_consume_top() {
        let cmb = empty_container();
        let scene = scene_with_vars(&["var_0"], 0);
        let slice = [ins(0, Opcode::Ref8, 0), ins(2, Opcode::Deref, 0)];

        let stmts = make_statements(&cmb, &scene, &slice).unwrap();
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0].to_string(), "push &var_0;");
        assert_eq!(stmts[1].to_string(), "push [&var_0];");
    }

    #[test]
    fn eval_inc_rewrites_as_read_modify_write() {
        let cmb = empty_container();
        let scene = scene_with_vars(&["var_0"], 0);
        let slice = [ins(0, Opcode::Ref8, 0), ins(2, Opcode::Inc, 0)];

        let stmts = make_statements(&cmb, &scene, &slice).unwrap();
        assert_eq!(stmts.len(), 1);
        assert_eq!(stmts[0].to_string(), "[&var_0] = [&var_0] + 1;");
    }

    #[test]
    fn eval_global_slots() {
        let mut cmb = empty_container();
        cmb.global_names = vec!["gvar_0".into()];
        let scene = scene_with_vars(&[], 0);

        let stmts = make_statements(&cmb, &scene, &[ins(0, Opcode::Gval8, 0)]).unwrap();
        assert_eq!(stmts[0].to_string(), "push gvar_0;");

        let err = make_statements(&cmb, &scene, &[ins(0, Opcode::Gval8, 1)]).unwrap_err();
        assert!(matches!(err, DecmbError::BadGlobalSlot { slot: 1, .. }));
    }

    #[test]
    fn eval_rejects_bad_local_slot() {
        let cmb = empty_container();
        let scene = scene_with_vars(&["var_0"], 0);
        let err = make_statements(&cmb, &scene, &[ins(0, Opcode::Val8, 3)]).unwrap_err();
        assert!(matches!(err, DecmbError::BadLocalSlot { slot: 3, .. }));
    }

    #[test]
    fn eval_rejects_consumer_underflow() {
        let cmb = empty_container();
        let scene = scene_with_vars(&[], 0);
        let err = make_statements(&cmb, &scene, &[ins(0, Opcode::Add, 0)]).unwrap_err();
        assert!(matches!(
            err,
            DecmbError::ExpectedPush {
                needed: 2,
                found: 0,
                ..
            }
        ));
    }

    #[test]
    fn eval_rejects_consumer_on_non_push() {
        let cmb = empty_container();
        let scene = scene_with_vars(&[], 0);
        let slice = [ins(0, Opcode::Yield, 0), ins(1, Opcode::Return, 0)];
        let err = make_statements(&cmb, &scene, &slice).unwrap_err();
        assert!(matches!(err, DecmbError::ExpectedPush { needed: 1, .. }));
    }

    #[test]
    fn eval_rejects_unrewritten_branch_keep() {
        let cmb = empty_container();
        let scene = scene_with_vars(&["var_0"], 0);
        let slice = [ins(0, Opcode::Val8, 0), ins(2, Opcode::Bky, 7)];
        let err = make_statements(&cmb, &scene, &slice).unwrap_err();
        assert!(matches!(err, DecmbError::UnsupportedOpcode { .. }));
    }

    #[test]
    fn pending_pushes_match_table_arity() {
        let cmb = empty_container();
        let scene = scene_with_vars(&[], 0);
        let slice = [
            ins(0, Opcode::Number8, 2),
            ins(2, Opcode::Number8, 3),
            ins(4, Opcode::Add, 0),
        ];

        let net: i32 = slice
            .iter()
            .map(|i| i32::from(i.opcode.info().stack_diff.unwrap()))
            .sum();

        let stmts = make_statements(&cmb, &scene, &slice).unwrap();
        let pending = stmts
            .iter()
            .rev()
            .take_while(|s| matches!(s, Stmt::Push(_)))
            .count();

        assert_eq!(pending as i32, net);
    }

    #[test]
    fn deep_copy_is_structural() {
        let expr = Expr::binary(
            BinOp::Add,
            Expr::unary(UnOp::AddrOf, Expr::Named("var_0".into())),
            Expr::IntLiteral(4),
        );
        let copy = expr.clone();
        assert_eq!(expr, copy);

        // mutating the copy leaves the original untouched
        let mut copy = copy;
        if let Expr::Binary(_, lhs, _) = &mut copy {
            **lhs = Expr::IntLiteral(9);
        }
        assert_ne!(expr, copy);
    }

    #[test]
    fn get_string_bounds() {
        let cmb = container_with_pool(b"ab\0c");
        assert_eq!(cmb.get_string(0).unwrap(), "ab");
        assert_eq!(cmb.get_string(3).unwrap(), "c");
        assert!(matches!(
            cmb.get_string(4),
            Err(DecmbError::BadStringOffset(4))
        ));
    }

    #[test]
    fn parse_sample_container() {
        let data = sample_container();
        let cmb = parse_container(&data, Dialect::A).unwrap();

        assert_eq!(cmb.global_names, ["gvar_0"]);
        assert_eq!(cmb.string_pool, b"main\0");
        assert_eq!(cmb.scenes.len(), 1);

        let scene = &cmb.scenes[0];
        assert_eq!(scene.name, "main");
        assert!(scene.is_global);
        assert_eq!(scene.script, [ins(0, Opcode::Retn, 0)]);
    }

    #[test]
    fn parse_rejects_wrong_dialect_script() {
        let data = sample_container();
        let err = parse_container(&data, Dialect::B).unwrap_err();
        assert!(matches!(err, DecmbError::WrongDialectOpcode { .. }));
    }

    #[test]
    fn parse_rejects_short_container() {
        let err = parse_container(&[0u8; 0x10], Dialect::A).unwrap_err();
        assert!(matches!(err, DecmbError::ContainerTooSmall(0x10)));
    }

    #[test]
    fn decompile_sample_listing() {
        let data = sample_container();
        let out = decompile(&data).unwrap();
        assert_eq!(
            out,
            "VARIABLE gvar_0;\n\nEVENT main() global\n{\n  return 0;\n}\n\n"
        );
    }

    #[test]
    fn decompile_short_circuit_listing() {
        let data = short_circuit_container();
        let out = decompile(&data).unwrap();
        assert_eq!(
            out,
            "EVENT unk_0(arg_0)\n{\n  goto label_10 if !(arg_0 && var_1);\n\nlabel_10:\n  return 0;\n}\n\n"
        );
    }

    #[test]
    fn decompile_is_deterministic() {
        let data = short_circuit_container();
        assert_eq!(decompile(&data).unwrap(), decompile(&data).unwrap());
    }

    #[test]
    fn decompile_disasm_mode() {
        let data = sample_container();
        let out = decompile_with_options(
            &data,
            DecompileOptions {
                mode: OutputMode::Disasm,
                ..DecompileOptions::default()
            },
        )
        .unwrap();
        assert_eq!(out, "EVENT main (args=0, vars=0, kind=0)\n00000 retn\n");
    }

    #[test]
    fn split_mode_surfaces_cross_slice_error() {
        let data = short_circuit_container();
        let out = decompile_with_options(
            &data,
            DecompileOptions {
                split_branch_keeps: true,
                ..DecompileOptions::default()
            },
        )
        .unwrap();
        assert!(out.contains("// decompile error:"));
    }
}
