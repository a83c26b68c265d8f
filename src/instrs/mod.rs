//! Data model for virtual instructions, handler traces and virtual basic
//! blocks.
//!
//! A *handler trace* accumulates the decoded native instructions of the VM
//! handler currently executing, one CPU snapshot per instruction. On the
//! handler's terminating indirect branch the trace is deobfuscated, sliced to
//! its canonical region and classified into a [`VInstr`], which the tracer
//! appends to the active [`VBlock`].

use iced_x86::{Instruction, Register};
use smallvec::SmallVec;
use unicorn_engine::Context;

mod deobf;
pub mod profiles;
pub mod regs;

pub use deobf::deobfuscate;
pub use profiles::{determine, get_profile, Profile};

/// Operations of the virtual machine's instruction set, as far as the
/// profile registry can name them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmMnemonic {
    /// Push a constant literal onto the virtual stack.
    LConst,
    /// Load a virtual register onto the virtual stack.
    LReg,
    /// Spill the top of the virtual stack into a virtual register.
    SReg,
    /// Pop two values, push their sum.
    Add,
    /// Pop a pointer, push the value it refers to.
    Read,
    /// Pop a pointer and a value, store the value through the pointer.
    Write,
    /// Pop the next virtual instruction pointer; ends the block.
    Jmp,
    /// Leave the virtual machine; ends the block and the routine.
    VmExit,
    /// No profile matched the canonical trace.
    Unknown,
}

impl std::fmt::Display for VmMnemonic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::LConst => "lconst",
            Self::LReg => "lreg",
            Self::SReg => "sreg",
            Self::Add => "add",
            Self::Read => "read",
            Self::Write => "write",
            Self::Jmp => "jmp",
            Self::VmExit => "vmexit",
            Self::Unknown => "unknown",
        })
    }
}

/// An immediate operand decoded out of the virtual bytecode stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Imm {
    /// Width of the immediate in bits.
    pub size: u8,
    /// Zero-extended value.
    pub val: u64,
}

/// One classified virtual instruction. Immutable after classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VInstr {
    pub mnemonic: VmMnemonic,
    pub imm: Option<Imm>,
}

/// A decoded native instruction paired with the CPU state captured right
/// before it executed.
///
/// The snapshot is an owned emulator context; dropping the record releases it.
pub struct EmuInstr {
    pub instr: Instruction,
    pub cpu: Context,
}

/// The native trace of the VM handler currently executing.
///
/// Cleared on every handler terminator; the per-instruction snapshots are
/// released with it.
pub struct HandlerTrace {
    /// VIP register assignment in effect for this trace.
    pub vip: Register,
    /// VSP register assignment in effect for this trace.
    pub vsp: Register,
    /// Instruction records, in execution order.
    pub instrs: Vec<EmuInstr>,
    /// Copy of the virtual-stack window, captured at the handler's first
    /// instruction.
    pub vstack: Vec<u8>,
}

impl HandlerTrace {
    pub fn new(vip: Register, vsp: Register) -> Self {
        Self {
            vip,
            vsp,
            instrs: Vec::new(),
            vstack: Vec::new(),
        }
    }
}

/// A block's virtual instruction pointer under both address translations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VipAddr {
    /// Relative to the runtime module base.
    pub rva: u64,
    /// Rebased onto the preferred image base.
    pub img_base: u64,
}

/// The VIP/VSP register assignment a block was traced under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmRegs {
    pub vip: Register,
    pub vsp: Register,
}

/// CPU and virtual-stack state at the first native instruction of a block's
/// terminating `jmp` handler. The branch resolver re-executes from here.
pub struct JmpSnapshot {
    pub cpu: Context,
    pub vstack: Vec<u8>,
}

/// How a virtual block transfers control onward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BranchKind {
    /// Terminator not yet resolved.
    #[default]
    Unset,
    /// Unconditional virtual jump.
    Absolute,
    /// Two-way conditional virtual jump.
    Jcc,
    /// The routine leaves the virtual machine here.
    VmExit,
}

/// A maximal run of v-instructions ending in `jmp` or `vmexit`.
pub struct VBlock {
    /// Bytecode address of the block, set once by the first handler that
    /// writes the VIP register.
    pub vip: VipAddr,
    /// Register assignment in effect for the block.
    pub vm: VmRegs,
    /// Classified v-instructions in handler-termination order.
    pub vinstrs: Vec<VInstr>,
    /// Present iff the block's terminator is `jmp`.
    pub jmp: Option<JmpSnapshot>,
    /// Image-based successor addresses: empty for `vmexit`, two for `jcc`.
    pub branches: SmallVec<[u64; 2]>,
    pub branch_kind: BranchKind,
}

impl VBlock {
    pub fn new(vip: Register, vsp: Register) -> Self {
        Self {
            vip: VipAddr::default(),
            vm: VmRegs { vip, vsp },
            vinstrs: Vec::new(),
            jmp: None,
            branches: SmallVec::new(),
            branch_kind: BranchKind::Unset,
        }
    }
}

/// A virtual routine: the VMENTER RVA it was traced from plus the blocks
/// recovered so far.
#[derive(Default)]
pub struct VRoutine {
    pub rva: u32,
    pub blocks: Vec<VBlock>,
}
