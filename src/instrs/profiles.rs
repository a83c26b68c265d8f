//! The v-instruction profile registry.
//!
//! A profile describes the canonical native shape of one handler as a short
//! contiguous instruction pattern, parameterized over the routine's VIP/VSP
//! register assignment. Classification slides each pattern over the
//! deobfuscated, sliced trace; the first profile that matches names the
//! v-instruction. For profiles with an immediate operand, the first matched
//! instruction is the bytecode fetch: its pre-execution snapshot is restored
//! to recover the VIP-relative effective address, and the immediate bytes are
//! read back out of emulator memory.

use iced_x86::{Instruction, Mnemonic, OpKind, Register};
use unicorn_engine::Unicorn;

use super::regs;
use super::{EmuInstr, HandlerTrace, Imm, VInstr, VmMnemonic};

/// The canonical native pattern of one v-instruction handler.
pub struct Profile {
    pub mnemonic: VmMnemonic,
    pub name: &'static str,
    /// Immediate width in bits, if the handler decodes one.
    pub imm_size: Option<u8>,
    /// Window length `matches` expects.
    len: usize,
    /// Pattern test over a window of exactly `len` trace records.
    matches: fn(Register, Register, &[EmuInstr]) -> bool,
}

/// Classify the canonical trace of one handler.
///
/// `vip` and `vsp` are the register assignments in effect for the handler;
/// `uc` is only used to recover immediate operands from snapshots. Returns an
/// [`VmMnemonic::Unknown`] v-instruction when no profile matches.
pub fn determine<D>(
    uc: &mut Unicorn<'_, D>,
    vip: Register,
    vsp: Register,
    trace: &HandlerTrace,
) -> VInstr {
    for profile in PROFILES {
        if trace.instrs.len() < profile.len {
            continue;
        }
        for start in 0..=trace.instrs.len() - profile.len {
            let window = &trace.instrs[start..start + profile.len];
            if !(profile.matches)(vip, vsp, window) {
                continue;
            }
            let imm = match profile.imm_size {
                Some(bits) => match read_imm(uc, &window[0], bits) {
                    Some(imm) => Some(imm),
                    // Unreadable bytecode; treat as a failed match.
                    None => continue,
                },
                None => None,
            };
            return VInstr {
                mnemonic: profile.mnemonic,
                imm,
            };
        }
    }
    VInstr {
        mnemonic: VmMnemonic::Unknown,
        imm: None,
    }
}

/// Look up the profile registered for `mnemonic`.
pub fn get_profile(mnemonic: VmMnemonic) -> Option<&'static Profile> {
    PROFILES.iter().find(|p| p.mnemonic == mnemonic)
}

/// The next-handler fetch: a 32-bit `MOV reg, [VIP]` load. Everything past
/// the last of these in a handler trace is dispatch glue, not handler
/// semantics.
pub fn is_rva_fetch(instr: &Instruction, vip: Register) -> bool {
    is_vip_fetch(instr, vip, Mnemonic::Mov, 4)
}

/// Read the immediate operand for a matched profile out of emulator memory.
///
/// The fetch instruction's snapshot predates its execution, so the VIP-based
/// memory operand still addresses the immediate bytes.
fn read_imm<D>(uc: &mut Unicorn<'_, D>, fetch: &EmuInstr, bits: u8) -> Option<Imm> {
    let reg = regs::emulator_reg(fetch.instr.memory_base())?;

    let backup = uc.context_init().ok()?;
    let restored = uc.context_restore(&fetch.cpu);
    let base = uc.reg_read(reg);
    uc.context_restore(&backup).ok()?;
    restored.ok()?;

    let ea = base.ok()?.wrapping_add(fetch.instr.memory_displacement64());
    let mut buf = [0u8; 8];
    uc.mem_read(ea, &mut buf[..bits as usize / 8]).ok()?;
    Some(Imm {
        size: bits,
        val: u64::from_le_bytes(buf),
    })
}

// Ordered longest-first so a larger handler body cannot be shadowed by a
// sub-pattern; VMEXIT, the only profile that may match a bare terminator,
// goes last.
static PROFILES: &[Profile] = &[
    Profile {
        mnemonic: VmMnemonic::SReg,
        name: "SREGQ",
        imm_size: Some(8),
        len: 5,
        matches: sregq,
    },
    Profile {
        mnemonic: VmMnemonic::LReg,
        name: "LREGQ",
        imm_size: Some(8),
        len: 5,
        matches: lregq,
    },
    Profile {
        mnemonic: VmMnemonic::Write,
        name: "WRITEQ",
        imm_size: None,
        len: 5,
        matches: writeq,
    },
    Profile {
        mnemonic: VmMnemonic::LConst,
        name: "LCONSTQ",
        imm_size: Some(64),
        len: 4,
        matches: lconstq,
    },
    Profile {
        mnemonic: VmMnemonic::LConst,
        name: "LCONSTDW",
        imm_size: Some(32),
        len: 4,
        matches: lconstdw,
    },
    Profile {
        mnemonic: VmMnemonic::LConst,
        name: "LCONSTB",
        imm_size: Some(8),
        len: 4,
        matches: lconstb,
    },
    Profile {
        mnemonic: VmMnemonic::Jmp,
        name: "JMP",
        imm_size: None,
        len: 3,
        matches: jmp,
    },
    Profile {
        mnemonic: VmMnemonic::Read,
        name: "READQ",
        imm_size: None,
        len: 3,
        matches: readq,
    },
    Profile {
        mnemonic: VmMnemonic::Add,
        name: "ADDQ",
        imm_size: None,
        len: 3,
        matches: addq,
    },
    Profile {
        mnemonic: VmMnemonic::VmExit,
        name: "VMEXIT",
        imm_size: None,
        len: 1,
        matches: vmexit,
    },
];

// Spill the top of the virtual stack into a virtual register:
//   movzx r32, byte [vip]   ; virtual register index
//   add vip, 1
//   mov r64, [vsp]
//   add vsp, 8
//   mov [rsp+idx], r64      ; register file lives on the native stack
fn sregq(vip: Register, vsp: Register, w: &[EmuInstr]) -> bool {
    matches!(w, [a, b, c, d, e]
        if is_vip_fetch(&a.instr, vip, Mnemonic::Movzx, 1)
            && is_reg_step(&b.instr, Mnemonic::Add, vip, 1)
            && is_vsp_load(&c.instr, vsp)
            && is_reg_step(&d.instr, Mnemonic::Add, vsp, 8)
            && is_vreg_store(&e.instr))
}

// Push a virtual register onto the virtual stack; dual of SREGQ.
fn lregq(vip: Register, vsp: Register, w: &[EmuInstr]) -> bool {
    matches!(w, [a, b, c, d, e]
        if is_vip_fetch(&a.instr, vip, Mnemonic::Movzx, 1)
            && is_reg_step(&b.instr, Mnemonic::Add, vip, 1)
            && is_vreg_load(&c.instr)
            && is_reg_step(&d.instr, Mnemonic::Sub, vsp, 8)
            && is_vsp_store(&e.instr, vsp))
}

// Pop a pointer and a value, store the value through the pointer. The store
// must go through the register popped first and write the register popped
// second, or the window is some other pointer-shaped code.
fn writeq(vip: Register, vsp: Register, w: &[EmuInstr]) -> bool {
    matches!(w, [a, b, c, d, e]
        if is_vsp_load(&a.instr, vsp)
            && is_reg_step(&b.instr, Mnemonic::Add, vsp, 8)
            && is_vsp_load(&c.instr, vsp)
            && is_reg_step(&d.instr, Mnemonic::Add, vsp, 8)
            && is_deref_store(&e.instr, vip, vsp)
            && e.instr.memory_base() == a.instr.op0_register()
            && e.instr.op1_register() == c.instr.op0_register())
}

// Push a 64-bit constant fetched from the bytecode stream.
fn lconstq(vip: Register, vsp: Register, w: &[EmuInstr]) -> bool {
    matches!(w, [a, b, c, d]
        if is_vip_fetch(&a.instr, vip, Mnemonic::Mov, 8)
            && is_reg_step(&b.instr, Mnemonic::Add, vip, 8)
            && is_reg_step(&c.instr, Mnemonic::Sub, vsp, 8)
            && is_vsp_store(&d.instr, vsp))
}

// 32-bit constant, zero-extended into a full virtual stack slot.
fn lconstdw(vip: Register, vsp: Register, w: &[EmuInstr]) -> bool {
    matches!(w, [a, b, c, d]
        if is_vip_fetch(&a.instr, vip, Mnemonic::Mov, 4)
            && is_reg_step(&b.instr, Mnemonic::Add, vip, 4)
            && is_reg_step(&c.instr, Mnemonic::Sub, vsp, 8)
            && is_vsp_store(&d.instr, vsp))
}

// 8-bit constant, zero-extended into a full virtual stack slot.
fn lconstb(vip: Register, vsp: Register, w: &[EmuInstr]) -> bool {
    matches!(w, [a, b, c, d]
        if is_vip_fetch(&a.instr, vip, Mnemonic::Movzx, 1)
            && is_reg_step(&b.instr, Mnemonic::Add, vip, 1)
            && is_reg_step(&c.instr, Mnemonic::Sub, vsp, 8)
            && is_vsp_store(&d.instr, vsp))
}

// Pop the next VIP off the virtual stack, then fetch the first handler of the
// target block. The trailing fetch is the slice boundary itself.
fn jmp(vip: Register, vsp: Register, w: &[EmuInstr]) -> bool {
    matches!(w, [a, b, c]
        if a.instr.mnemonic() == Mnemonic::Mov
            && a.instr.op0_kind() == OpKind::Register
            && a.instr.op0_register() == vip
            && a.instr.op1_kind() == OpKind::Memory
            && a.instr.memory_base() == vsp
            && a.instr.memory_size().size() == 8
            && is_reg_step(&b.instr, Mnemonic::Add, vsp, 8)
            && is_rva_fetch(&c.instr, vip))
}

// Pop a pointer, push the 64-bit value it refers to. The dereference must go
// through the popped register and the pushed value must be its result.
fn readq(vip: Register, vsp: Register, w: &[EmuInstr]) -> bool {
    matches!(w, [a, b, c]
        if is_vsp_load(&a.instr, vsp)
            && is_deref_load(&b.instr, vip, vsp)
            && b.instr.memory_base() == a.instr.op0_register()
            && is_vsp_store(&c.instr, vsp)
            && c.instr.op1_register() == b.instr.op0_register())
}

// Pop two values, fold the first into the new stack top.
fn addq(_vip: Register, vsp: Register, w: &[EmuInstr]) -> bool {
    matches!(w, [a, b, c]
        if is_vsp_load(&a.instr, vsp)
            && is_reg_step(&b.instr, Mnemonic::Add, vsp, 8)
            && c.instr.mnemonic() == Mnemonic::Add
            && c.instr.op0_kind() == OpKind::Memory
            && c.instr.memory_base() == vsp
            && c.instr.memory_size().size() == 8
            && c.instr.op1_kind() == OpKind::Register)
}

// A handler with no next-handler fetch survives slicing with its RET intact:
// the only such handler is the one that leaves the VM.
fn vmexit(_vip: Register, _vsp: Register, w: &[EmuInstr]) -> bool {
    matches!(w, [a] if a.instr.mnemonic() == Mnemonic::Ret)
}

fn is_vip_fetch(instr: &Instruction, vip: Register, mnemonic: Mnemonic, size: usize) -> bool {
    instr.mnemonic() == mnemonic
        && instr.op0_kind() == OpKind::Register
        && instr.op1_kind() == OpKind::Memory
        && instr.memory_base() == vip
        && instr.memory_index() == Register::None
        && instr.memory_size().size() == size
}

fn is_reg_step(instr: &Instruction, mnemonic: Mnemonic, reg: Register, step: u64) -> bool {
    instr.mnemonic() == mnemonic
        && instr.op0_kind() == OpKind::Register
        && instr.op0_register() == reg
        && instr.try_immediate(1).ok() == Some(step)
}

fn is_vsp_load(instr: &Instruction, vsp: Register) -> bool {
    instr.mnemonic() == Mnemonic::Mov
        && instr.op0_kind() == OpKind::Register
        && instr.op0_register().size() == 8
        && instr.op1_kind() == OpKind::Memory
        && instr.memory_base() == vsp
        && instr.memory_size().size() == 8
}

fn is_vsp_store(instr: &Instruction, vsp: Register) -> bool {
    instr.mnemonic() == Mnemonic::Mov
        && instr.op0_kind() == OpKind::Memory
        && instr.memory_base() == vsp
        && instr.memory_index() == Register::None
        && instr.memory_size().size() == 8
        && instr.op1_kind() == OpKind::Register
        && instr.op1_register().size() == 8
}

// The virtual register file is indexed off the native stack pointer.
fn is_vreg_store(instr: &Instruction) -> bool {
    instr.mnemonic() == Mnemonic::Mov
        && instr.op0_kind() == OpKind::Memory
        && instr.memory_base() == Register::RSP
        && instr.memory_index() != Register::None
        && instr.op1_kind() == OpKind::Register
        && instr.op1_register().size() == 8
}

fn is_vreg_load(instr: &Instruction) -> bool {
    instr.mnemonic() == Mnemonic::Mov
        && instr.op0_kind() == OpKind::Register
        && instr.op0_register().size() == 8
        && instr.op1_kind() == OpKind::Memory
        && instr.memory_base() == Register::RSP
        && instr.memory_index() != Register::None
}

fn is_deref_load(instr: &Instruction, vip: Register, vsp: Register) -> bool {
    instr.mnemonic() == Mnemonic::Mov
        && instr.op0_kind() == OpKind::Register
        && instr.op0_register().size() == 8
        && instr.op1_kind() == OpKind::Memory
        && instr.memory_index() == Register::None
        && instr.memory_size().size() == 8
        && !matches!(instr.memory_base(), Register::RSP | Register::None)
        && instr.memory_base() != vip
        && instr.memory_base() != vsp
}

fn is_deref_store(instr: &Instruction, vip: Register, vsp: Register) -> bool {
    instr.mnemonic() == Mnemonic::Mov
        && instr.op0_kind() == OpKind::Memory
        && instr.memory_index() == Register::None
        && !matches!(instr.memory_base(), Register::RSP | Register::None)
        && instr.memory_base() != vip
        && instr.memory_base() != vsp
        && instr.op1_kind() == OpKind::Register
        && instr.op1_register().size() == 8
}
