//! The emulator harness: concrete execution of one virtualized routine.
//!
//! [`Tracer`] owns a 64-bit x86 emulator with the protected module and a
//! guard stack mapped in. A code hook over the module range drives the
//! per-instruction tracing callback; an interrupt hook and an unmapped-memory
//! hook repair the anti-analysis faults the obfuscator seeds into its
//! handlers. On each handler terminator the accumulated trace is
//! deobfuscated, sliced at the next-handler fetch and classified against the
//! profile registry; classified v-instructions are appended to the active
//! virtual block. A terminating virtual `jmp` snapshots the handler-entry
//! CPU/stack state so the branch resolver can speculatively re-execute both
//! conditional-branch candidates.
//!
//! All hook-visible state lives in the emulator's data value; the callbacks
//! are plain functions and nothing is global. The tracing callback re-enters
//! the emulator only through `emu_stop`, and the resolver's speculative run
//! starts only after the outer run has stopped.

use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic, OpKind, Register};
use unicorn_engine::unicorn_const::{uc_error, Arch, HookType, MemType, Mode, Permission};
use unicorn_engine::{Context, RegisterX86, UcHookId, Unicorn};

use crate::image::{VmCtx, VmImage};
use crate::instrs::{
    self, deobfuscate, profiles, regs, BranchKind, EmuInstr, HandlerTrace, JmpSnapshot, VBlock,
    VInstr, VRoutine, VmMnemonic,
};

#[cfg(test)]
mod tests;

/// Base of the emulated guard stack.
pub const STACK_BASE: u64 = 0x0100_0000;
/// Size of the emulated guard stack.
pub const STACK_SIZE: u64 = 0x10_0000;
/// Size of the virtual-stack window copied into each trace. The window covers
/// the top of the guard stack, where the virtual stack and the virtual
/// register file live.
pub const VSTACK_WINDOW: usize = 0x1_0000;

const PAGE_4KB: u64 = 0x1000;
/// Consecutive legitimate `sreg`s that prove a speculative branch target
/// entered real block-prologue code.
const SREG_RUN_TARGET: u32 = 10;
const DEFAULT_MAX_STEPS: usize = 1_000_000;

const fn vstack_base() -> u64 {
    STACK_BASE + STACK_SIZE - VSTACK_WINDOW as u64
}

/// Errors surfaced by the harness.
#[derive(Debug)]
pub enum TraceError {
    /// Emulator allocation, mapping or hook installation failed; the tracer
    /// was never usable.
    Setup(uc_error),
    /// Seeding registers or starting emulation failed.
    Start(uc_error),
    /// Swapping the tracing/speculative hooks failed.
    Hook(uc_error),
    /// Saving or restoring a CPU snapshot failed.
    Snapshot(uc_error),
    /// Code bytes at this address could not be read out of emulator memory.
    Fetch(u64),
    /// The per-block native instruction cap was exceeded.
    StepLimit(usize),
    /// Strict mode: the handler at this address matched no profile.
    UnknownHandler(u64),
}

impl std::fmt::Display for TraceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Setup(e) => write!(f, "emulator setup failed: {e:?}"),
            Self::Start(e) => write!(f, "starting emulation failed: {e:?}"),
            Self::Hook(e) => write!(f, "hook installation failed: {e:?}"),
            Self::Snapshot(e) => write!(f, "cpu snapshot failed: {e:?}"),
            Self::Fetch(va) => write!(f, "failed to read code bytes at {va:#x}"),
            Self::StepLimit(n) => write!(f, "native instruction cap of {n} exceeded"),
            Self::UnknownHandler(va) => write!(f, "unclassified handler at {va:#x}"),
        }
    }
}

impl std::error::Error for TraceError {}

/// Hook-visible state, carried as the emulator's data value.
struct EmuState {
    module_base: u64,
    image_base: u64,
    image_size: u64,
    /// Current VIP register assignment.
    vip: Register,
    /// Current VSP register assignment.
    vsp: Register,
    /// Trace of the handler currently executing.
    trace: HandlerTrace,
    /// The block being built by the tracing callback.
    blk: VBlock,
    /// Legitimate `sreg`s seen by the current speculative run.
    sreg_cnt: u32,
    /// Native instructions executed since the current run started.
    steps: usize,
    max_steps: usize,
    strict: bool,
    /// Fatal condition raised inside a callback, picked up after the stop.
    fault: Option<TraceError>,
}

/// Emulator harness for one protected module.
///
/// Construction maps the guard stack and the module image (read-write-execute,
/// for tracing) and installs the hooks; [`Tracer::emulate`] then recovers one
/// virtual block per call.
pub struct Tracer<I: VmImage> {
    uc: Unicorn<'static, EmuState>,
    image: I,
    code_hook: Option<UcHookId>,
}

impl<I: VmImage> Tracer<I> {
    /// Open the emulator, create the mappings and install the hooks.
    pub fn new(ctx: VmCtx, image: I) -> Result<Self, TraceError> {
        let state = EmuState {
            module_base: ctx.module_base,
            image_base: ctx.image_base,
            image_size: ctx.image_size,
            vip: ctx.vip,
            vsp: ctx.vsp,
            trace: HandlerTrace::new(ctx.vip, ctx.vsp),
            blk: VBlock::new(ctx.vip, ctx.vsp),
            sreg_cnt: 0,
            steps: 0,
            max_steps: DEFAULT_MAX_STEPS,
            strict: false,
            fault: None,
        };
        let mut uc =
            Unicorn::new_with_data(Arch::X86, Mode::MODE_64, state).map_err(TraceError::Setup)?;

        uc.mem_map(STACK_BASE, STACK_SIZE as usize, Permission::ALL)
            .map_err(TraceError::Setup)?;

        let map_size = ctx.image_size.next_multiple_of(PAGE_4KB) as usize;
        uc.mem_map(ctx.module_base, map_size, Permission::ALL)
            .map_err(TraceError::Setup)?;
        uc.mem_write(ctx.module_base, image.mapped())
            .map_err(TraceError::Setup)?;

        let code_hook = uc
            .add_code_hook(
                ctx.module_base,
                ctx.module_base + ctx.image_size,
                |uc, address, size| trace_exec(uc, address, size),
            )
            .map_err(TraceError::Setup)?;
        uc.add_intr_hook(|uc, intno| int_skip(uc, intno))
            .map_err(TraceError::Setup)?;
        uc.add_mem_hook(
            HookType::MEM_READ_UNMAPPED | HookType::MEM_WRITE_UNMAPPED
                | HookType::MEM_FETCH_UNMAPPED,
            0,
            u64::MAX,
            |uc, kind, address, size, value| invalid_mem(uc, kind, address, size, value),
        )
        .map_err(TraceError::Setup)?;

        Ok(Self {
            uc,
            image,
            code_hook: Some(code_hook),
        })
    }

    /// Bound the native instructions executed per run. Exceeding the bound
    /// surfaces [`TraceError::StepLimit`].
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.uc.get_data_mut().max_steps = max_steps;
        self
    }

    /// Stop with [`TraceError::UnknownHandler`] instead of recording an
    /// `unknown` v-instruction and continuing.
    pub fn with_strict_classification(mut self, strict: bool) -> Self {
        self.uc.get_data_mut().strict = strict;
        self
    }

    /// Trace the virtual block reachable from `vm_entry_rva` and append it to
    /// `vrtn`.
    ///
    /// Returns once the block terminates in a virtual `jmp` (after resolving
    /// whether it is conditional) or a `vmexit`.
    pub fn emulate(&mut self, vm_entry_rva: u32, vrtn: &mut VRoutine) -> Result<(), TraceError> {
        let (module_base, image_base) = {
            let d = self.uc.get_data_mut();
            d.blk = VBlock::new(d.vip, d.vsp);
            d.trace = HandlerTrace::new(d.vip, d.vsp);
            d.steps = 0;
            d.fault = None;
            (d.module_base, d.image_base)
        };

        let rip = module_base + vm_entry_rva as u64;
        let rsp = STACK_BASE + STACK_SIZE - PAGE_4KB;
        self.uc
            .reg_write(RegisterX86::RSP, rsp)
            .map_err(TraceError::Start)?;
        self.uc
            .reg_write(RegisterX86::RIP, rip)
            .map_err(TraceError::Start)?;
        vrtn.rva = vm_entry_rva;

        log::debug!("beginning execution at {rip:#x}");
        self.uc
            .emu_start(rip, 0, 0, 0)
            .map_err(TraceError::Start)?;
        if let Some(fault) = self.uc.get_data_mut().fault.take() {
            return Err(fault);
        }

        let mut blk = {
            let d = self.uc.get_data_mut();
            std::mem::replace(&mut d.blk, VBlock::new(d.vip, d.vsp))
        };
        log::debug!(
            "blk_{:#x}: {} virtual instructions",
            blk.vip.img_base,
            blk.vinstrs.len()
        );

        // vmexit blocks were already marked by the tracing callback.
        if blk.branch_kind == BranchKind::Unset {
            match self.could_have_jcc(&blk.vinstrs) {
                Some((b1, b2)) => {
                    let b1_legit =
                        self.legit_branch(&blk, b1.wrapping_sub(image_base).wrapping_add(module_base))?;
                    let b2_legit =
                        self.legit_branch(&blk, b2.wrapping_sub(image_base).wrapping_add(module_base))?;
                    if b1_legit && b2_legit {
                        blk.branches.push(b1);
                        blk.branches.push(b2);
                        blk.branch_kind = BranchKind::Jcc;
                        log::debug!("block has jcc, b1 = {b1:#x}, b2 = {b2:#x}");
                    } else {
                        blk.branch_kind = BranchKind::Absolute;
                        log::debug!("block has absolute jmp");
                    }
                }
                None => blk.branch_kind = BranchKind::Absolute,
            }
        }

        vrtn.blocks.push(blk);
        Ok(())
    }

    /// Detect the conditional-branch idiom over a block's v-instructions.
    ///
    /// The VM materializes both targets plus a selector as 64-bit constants
    /// near the end of the block, so at least three `lconst64`s must exist;
    /// the last two are the candidate successors, both of which must point
    /// into an executable part of the image.
    pub fn could_have_jcc(&self, vinstrs: &[VInstr]) -> Option<(u64, u64)> {
        let d = self.uc.get_data();
        find_jcc_candidates(&self.image, d.image_base, d.image_size, vinstrs)
    }

    /// Decide whether `branch_addr` (module-based) is a real successor of the
    /// block by re-executing from its `jmp` snapshot with the speculative
    /// callback installed.
    fn legit_branch(&mut self, blk: &VBlock, branch_addr: u64) -> Result<bool, TraceError> {
        let Some(jmp) = blk.jmp.as_ref() else {
            return Ok(false);
        };
        let Some(vsp_reg) = regs::emulator_reg(blk.vm.vsp) else {
            return Ok(false);
        };
        let (lo, hi) = {
            let d = self.uc.get_data();
            (d.module_base, d.module_base + d.image_size)
        };

        if let Some(hook) = self.code_hook.take() {
            self.uc.remove_hook(hook).map_err(TraceError::Hook)?;
        }
        let spec_hook = match self
            .uc
            .add_code_hook(lo, hi, |uc, address, size| spec_exec(uc, address, size))
        {
            Ok(spec_hook) => spec_hook,
            Err(e) => {
                // The tracing hook is already gone; put it back before
                // surfacing the error so later emulate calls still trace.
                if let Err(restore) = self.install_trace_hook(lo, hi) {
                    log::error!("{restore}");
                }
                return Err(TraceError::Hook(e));
            }
        };

        // Whatever happens during the speculative run, the tracing hook goes
        // back before this function returns.
        let outcome = (|| -> Result<bool, TraceError> {
            self.uc
                .context_restore(&jmp.cpu)
                .map_err(TraceError::Snapshot)?;
            self.uc
                .mem_write(vstack_base(), &jmp.vstack)
                .map_err(TraceError::Snapshot)?;

            let rip = self
                .uc
                .reg_read(RegisterX86::RIP)
                .map_err(TraceError::Start)?;
            let vsp_ptr = self.uc.reg_read(vsp_reg).map_err(TraceError::Start)?;
            self.uc
                .mem_write(vsp_ptr, &branch_addr.to_le_bytes())
                .map_err(TraceError::Start)?;

            {
                let d = self.uc.get_data_mut();
                d.sreg_cnt = 0;
                d.steps = 0;
                d.trace = HandlerTrace::new(d.vip, d.vsp);
            }

            log::trace!("speculating branch {branch_addr:#x} from {rip:#x}");
            // A speculative walk into data is expected to fail; the verdict
            // is the sreg count, not the run's own outcome.
            let _ = self.uc.emu_start(rip, 0, 0, 0);
            Ok(self.uc.get_data().sreg_cnt == SREG_RUN_TARGET)
        })();

        let _ = self.uc.remove_hook(spec_hook);
        self.install_trace_hook(lo, hi)?;
        outcome
    }

    /// Register the tracing callback over the module range and remember its
    /// hook id.
    fn install_trace_hook(&mut self, lo: u64, hi: u64) -> Result<(), TraceError> {
        let hook = self
            .uc
            .add_code_hook(lo, hi, |uc, address, size| trace_exec(uc, address, size))
            .map_err(TraceError::Hook)?;
        self.code_hook = Some(hook);
        Ok(())
    }
}

/// The conditional-branch predicate over classified v-instructions; see
/// [`Tracer::could_have_jcc`].
fn find_jcc_candidates<I: VmImage>(
    image: &I,
    image_base: u64,
    image_size: u64,
    vinstrs: &[VInstr],
) -> Option<(u64, u64)> {
    if vinstrs.last()?.mnemonic == VmMnemonic::VmExit {
        return None;
    }

    let is_lconst64 =
        |v: &&VInstr| v.mnemonic == VmMnemonic::LConst && v.imm.is_some_and(|imm| imm.size == 64);
    if vinstrs.iter().filter(is_lconst64).count() < 3 {
        return None;
    }

    let mut tail = vinstrs.iter().rev().filter(is_lconst64);
    let b1 = tail.next()?.imm?.val;
    let b2 = tail.next()?.imm?.val;

    let in_image = |va: u64| (image_base..image_base + image_size).contains(&va);
    if !in_image(b1) || !in_image(b2) {
        return None;
    }
    if !image.executable(b1 - image_base) || !image.executable(b2 - image_base) {
        return None;
    }
    Some((b1, b2))
}

/// A handler ends at `RET` or `JMP reg`.
fn is_handler_exit(instr: &Instruction) -> bool {
    instr.mnemonic() == Mnemonic::Ret
        || (instr.mnemonic() == Mnemonic::Jmp && instr.op0_kind() == OpKind::Register)
}

/// Trim the trace to the canonical handler body: everything strictly after
/// the last next-handler fetch is address-computation glue.
fn slice_at_rva_fetch(trace: &mut HandlerTrace, vip: Register) {
    if let Some(pos) = trace
        .instrs
        .iter()
        .rposition(|ei| profiles::is_rva_fetch(&ei.instr, vip))
    {
        trace.instrs.truncate(pos + 1);
    }
}

/// Read and decode the instruction at `va` out of emulator memory.
///
/// Tries the full 15-byte x86 maximum first and backs off for reads that
/// cross into unmapped space.
fn decode_at(uc: &mut Unicorn<'_, EmuState>, va: u64) -> Result<Instruction, TraceError> {
    let mut buf = [0u8; 16];
    let mut len = 0;
    for n in (1..=buf.len()).rev() {
        if uc.mem_read(va, &mut buf[..n]).is_ok() {
            len = n;
            break;
        }
    }
    if len == 0 {
        return Err(TraceError::Fetch(va));
    }
    let mut instr = Instruction::default();
    Decoder::with_ip(64, &buf[..len], va, DecoderOptions::NONE).decode_out(&mut instr);
    Ok(instr)
}

fn stop_with(uc: &mut Unicorn<'_, EmuState>, fault: TraceError) {
    log::error!("{fault}");
    uc.get_data_mut().fault = Some(fault);
    if let Err(e) = uc.emu_stop() {
        log::error!("failed to stop emulation: {e:?}");
    }
}

/// Shared front half of the tracing and speculative callbacks: decode,
/// record, and on a handler terminator hand back the canonicalized trace.
fn record_step(uc: &mut Unicorn<'_, EmuState>, address: u64) -> Option<HandlerTrace> {
    let instr = match decode_at(uc, address) {
        Ok(instr) => instr,
        Err(fault) => {
            stop_with(uc, fault);
            return None;
        }
    };
    // An undecodable byte pattern may still resolve on the next fetch once
    // the obfuscator's self-correcting tricks have run; skip, do not record.
    if instr.is_invalid() {
        return None;
    }

    {
        let d = uc.get_data_mut();
        d.steps += 1;
        if d.steps > d.max_steps {
            let max = d.max_steps;
            stop_with(uc, TraceError::StepLimit(max));
            return None;
        }
    }

    let cpu = match uc.context_init() {
        Ok(cpu) => cpu,
        Err(e) => {
            stop_with(uc, TraceError::Snapshot(e));
            return None;
        }
    };

    // First instruction of this handler: capture the virtual-stack window.
    if uc.get_data().trace.instrs.is_empty() {
        let mut vstack = vec![0u8; VSTACK_WINDOW];
        if let Err(e) = uc.mem_read(vstack_base(), &mut vstack) {
            log::error!("failed to copy the virtual stack: {e:?}");
        }
        uc.get_data_mut().trace.vstack = vstack;
    }

    uc.get_data_mut().trace.instrs.push(EmuInstr { instr, cpu });

    if !is_handler_exit(&instr) {
        return None;
    }

    // Terminator: take the trace out (a fresh one starts with the next
    // handler) and canonicalize it for the profile registry.
    let mut trace = {
        let d = uc.get_data_mut();
        let fresh = HandlerTrace::new(d.vip, d.vsp);
        std::mem::replace(&mut d.trace, fresh)
    };
    let vip = trace.vip;
    deobfuscate(&mut trace);
    slice_at_rva_fetch(&mut trace, vip);
    Some(trace)
}

/// The tracing callback, invoked for every native instruction inside the
/// module while a block is being traced.
fn trace_exec(uc: &mut Unicorn<'_, EmuState>, address: u64, _size: u32) {
    let Some(trace) = record_step(uc, address) else {
        return;
    };

    // The first terminating handler is the VM prologue: it assigns VIP but
    // realizes no v-instruction. Recover the block's bytecode address from
    // the snapshot of the last VIP write and move on.
    if uc.get_data().blk.vip == instrs::VipAddr::default() {
        recover_block_vip(uc, &trace);
        return;
    }

    let (vip, vsp) = (trace.vip, trace.vsp);
    let vinstr = profiles::determine(uc, vip, vsp, &trace);

    match profiles::get_profile(vinstr.mnemonic) {
        Some(profile) => match vinstr.imm {
            Some(imm) => log::debug!("{} {:#x}", profile.name, imm.val),
            None => log::debug!("{}", profile.name),
        },
        None => {
            log::warn!("unclassified handler at {address:#x}; canonical trace:");
            for ei in &trace.instrs {
                log::warn!("  {:016x} {}", ei.instr.ip(), ei.instr);
            }
            if uc.get_data().strict {
                stop_with(uc, TraceError::UnknownHandler(address));
                return;
            }
        }
    }

    uc.get_data_mut().blk.vinstrs.push(vinstr);

    if vinstr.mnemonic == VmMnemonic::Jmp {
        // Keep the CPU/stack state at the jmp handler's entry so the branch
        // resolver can re-execute it against candidate targets.
        if let Some(first) = trace.instrs.first() {
            match clone_context(uc, &first.cpu) {
                Ok(cpu) => {
                    let vstack = trace.vstack.clone();
                    uc.get_data_mut().blk.jmp = Some(JmpSnapshot { cpu, vstack });
                }
                Err(e) => {
                    stop_with(uc, TraceError::Snapshot(e));
                    return;
                }
            }
        }
        if let Err(e) = uc.emu_stop() {
            log::error!("failed to stop emulation: {e:?}");
        }
    } else if vinstr.mnemonic == VmMnemonic::VmExit {
        uc.get_data_mut().blk.branch_kind = BranchKind::VmExit;
        if let Err(e) = uc.emu_stop() {
            log::error!("failed to stop emulation: {e:?}");
        }
    }
    // `trace` drops here, releasing this handler's snapshots.
}

/// The speculative callback installed by the branch resolver. Identical
/// recording, but the only tolerated v-instructions are the re-executed `jmp`
/// handler itself and block-prologue `sreg`s, counted up to the threshold.
fn spec_exec(uc: &mut Unicorn<'_, EmuState>, address: u64, _size: u32) {
    let Some(trace) = record_step(uc, address) else {
        return;
    };

    let (vip, vsp) = (trace.vip, trace.vsp);
    let vinstr = profiles::determine(uc, vip, vsp, &trace);
    drop(trace);

    if vinstr.mnemonic == VmMnemonic::Jmp {
        return;
    }

    let legit_sreg = vinstr.mnemonic == VmMnemonic::SReg
        && vinstr
            .imm
            .is_some_and(|imm| imm.size == 8 && imm.val <= u8::MAX as u64);
    if !legit_sreg {
        let _ = uc.emu_stop();
        return;
    }

    let d = uc.get_data_mut();
    d.sreg_cnt += 1;
    if d.sreg_cnt == SREG_RUN_TARGET {
        let _ = uc.emu_stop();
    }
}

/// Set the block's bytecode address from the prologue handler's trace: the
/// VIP value observed at the snapshot of the latest instruction whose first
/// operand is the VIP register.
fn recover_block_vip(uc: &mut Unicorn<'_, EmuState>, trace: &HandlerTrace) {
    let vip = trace.vip;
    let Some(write) = trace.instrs.iter().rev().find(|ei| {
        ei.instr.op_count() > 0
            && ei.instr.op0_kind() == OpKind::Register
            && ei.instr.op0_register() == vip
    }) else {
        log::warn!("prologue handler never assigned the vip register");
        return;
    };
    let Some(vip_reg) = regs::emulator_reg(vip) else {
        return;
    };

    let backup = match uc.context_init() {
        Ok(backup) => backup,
        Err(e) => {
            stop_with(uc, TraceError::Snapshot(e));
            return;
        }
    };
    let vip_addr = uc
        .context_restore(&write.cpu)
        .and_then(|()| uc.reg_read(vip_reg));
    if let Err(e) = uc.context_restore(&backup) {
        stop_with(uc, TraceError::Snapshot(e));
        return;
    }

    match vip_addr {
        Ok(vip_addr) => {
            let d = uc.get_data_mut();
            d.blk.vip.rva = vip_addr.wrapping_sub(d.module_base);
            d.blk.vip.img_base = d.blk.vip.rva.wrapping_add(d.image_base);
            log::debug!("block vip rva = {:#x}", d.blk.vip.rva);
        }
        Err(e) => log::error!("failed to read the vip register: {e:?}"),
    }
}

/// Duplicate a saved snapshot by round-tripping it through the live CPU
/// state, preserving the live state.
fn clone_context(
    uc: &mut Unicorn<'_, EmuState>,
    snapshot: &Context,
) -> Result<Context, uc_error> {
    let backup = uc.context_init()?;
    let copied = uc.context_restore(snapshot).and_then(|()| uc.context_init());
    uc.context_restore(&backup)?;
    copied
}

/// Interrupt hook: the obfuscator seeds integer traps (division by zero and
/// friends) as anti-analysis; skip the faulting instruction.
fn int_skip(uc: &mut Unicorn<'_, EmuState>, intno: u32) {
    let rip = match uc.reg_read(RegisterX86::RIP) {
        Ok(rip) => rip,
        Err(e) => {
            log::error!("failed to read rip: {e:?}");
            return;
        }
    };
    match decode_at(uc, rip) {
        Ok(instr) if !instr.is_invalid() => {
            log::trace!("interrupt {intno} at {rip:#x}, skipping `{instr}`");
            if let Err(e) = uc.reg_write(RegisterX86::RIP, rip + instr.len() as u64) {
                log::error!("failed to advance rip: {e:?}");
            }
        }
        _ => stop_with(uc, TraceError::Fetch(rip)),
    }
}

/// Unmapped-memory hook: map data pages on demand, and recover from calls
/// that leave the module by synthesizing the return.
fn invalid_mem(
    uc: &mut Unicorn<'_, EmuState>,
    kind: MemType,
    address: u64,
    size: usize,
    value: i64,
) -> bool {
    match kind {
        MemType::READ_UNMAPPED => {
            log::trace!("read of unmapped memory at {address:#x}, size {size:#x}");
            uc.mem_map(address & !(PAGE_4KB - 1), PAGE_4KB as usize, Permission::ALL)
                .is_ok()
        }
        MemType::WRITE_UNMAPPED => {
            log::trace!(
                "write of unmapped memory at {address:#x}, size {size:#x}, value {value:#x}"
            );
            uc.mem_map(address & !(PAGE_4KB - 1), PAGE_4KB as usize, Permission::ALL)
                .is_ok()
        }
        MemType::FETCH_UNMAPPED => {
            let Ok(rsp) = uc.reg_read(RegisterX86::RSP) else {
                return false;
            };
            let mut ret = [0u8; 8];
            if uc.mem_read(rsp, &mut ret).is_err() {
                return false;
            }
            let rip = u64::from_le_bytes(ret);
            if uc.reg_write(RegisterX86::RSP, rsp + 8).is_err()
                || uc.reg_write(RegisterX86::RIP, rip).is_err()
            {
                return false;
            }
            log::trace!("unmapped fetch at {address:#x}, injecting return to {rip:#x}");
            true
        }
        _ => false,
    }
}
