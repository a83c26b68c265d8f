//! End-to-end tests against a synthetic virtualized routine.
//!
//! The routine is assembled into a fake module image: a VMENTER stub that
//! assigns VIP/VSP and dispatches, plus one native handler per v-instruction.
//! Bytecode is a stream of 32-bit handler RVAs with inline immediates, so the
//! dispatch tail of every handler is the canonical 32-bit `mov reg, [vip]`
//! fetch followed by address glue and `jmp reg`, exactly the shape the slicer
//! and the profile registry expect.

use iced_x86::code_asm::*;
use iced_x86::{IcedError, Register};

use crate::image::{MappedImage, VmCtx};
use crate::instrs::{BranchKind, Imm, VBlock, VRoutine, VmMnemonic};

use super::{find_jcc_candidates, slice_at_rva_fetch, TraceError, Tracer};

const BASE: u64 = 0x1_4000_0000;
const SIZE: u64 = 0x1_0000;

const VMENTER: u64 = 0x1000;
const H_LCONSTQ: u64 = 0x1100;
const H_SREG: u64 = 0x1200;
const H_JMP: u64 = 0x1300;
const H_VMEXIT: u64 = 0x1400;
const H_DIV: u64 = 0x1500;
const H_CALLOUT: u64 = 0x1600;
const H_RWUNMAPPED: u64 = 0x1700;
const H_SPIN: u64 = 0x1800;
const H_LREG: u64 = 0x1900;
const H_READ: u64 = 0x1A00;
const H_WRITE: u64 = 0x1B00;

/// Entry bytecode stream.
const BC_MAIN: u64 = 0x8000;
/// Branch-target streams for the resolver to explore.
const T1: u64 = 0x8100;
const T2: u64 = 0x8200;
/// A stream with one `sreg` too few to validate.
const T_SHORT: u64 = 0x8300;
/// Inside the image but not in an executable range.
const DATA: u64 = 0xC000;

fn asm_at(rva: u64, build: impl FnOnce(&mut CodeAssembler) -> Result<(), IcedError>) -> Vec<u8> {
    let mut a = CodeAssembler::new(64).unwrap();
    build(&mut a).unwrap();
    a.assemble(BASE + rva).unwrap()
}

/// The tail every chaining handler ends with: fetch the next handler RVA at
/// `[vip]`, rebase it and jump.
fn dispatch(a: &mut CodeAssembler) -> Result<(), IcedError> {
    a.mov(eax, dword_ptr(rsi))?;
    a.add(rsi, 4)?;
    a.mov(rdx, BASE)?;
    a.add(rax, rdx)?;
    a.jmp(rax)?;
    Ok(())
}

fn put(bytes: &mut [u8], rva: u64, data: &[u8]) {
    bytes[rva as usize..rva as usize + data.len()].copy_from_slice(data);
}

/// A fake module image with every handler assembled in, plus the given
/// bytecode streams.
fn build_image(streams: &[(u64, Vec<u8>)]) -> MappedImage {
    let mut bytes = vec![0u8; SIZE as usize];

    put(
        &mut bytes,
        VMENTER,
        &asm_at(VMENTER, |a| {
            a.mov(rax, BASE + BC_MAIN)?;
            a.mov(rsi, rax)?;
            // Redundant on purpose: the latest write to VIP in the sliced
            // trace is what the block-VIP recovery restores, and its
            // pre-execution state must already hold the bytecode address.
            a.and(rsi, rsi)?;
            a.mov(rbp, rsp)?;
            a.sub(rbp, 0x100)?;
            dispatch(a)
        }),
    );
    put(
        &mut bytes,
        H_LCONSTQ,
        &asm_at(H_LCONSTQ, |a| {
            a.mov(rax, qword_ptr(rsi))?;
            a.add(rsi, 8)?;
            a.sub(rbp, 8)?;
            a.mov(qword_ptr(rbp), rax)?;
            dispatch(a)
        }),
    );
    put(
        &mut bytes,
        H_SREG,
        &asm_at(H_SREG, |a| {
            a.movzx(eax, byte_ptr(rsi))?;
            a.add(rsi, 1)?;
            a.mov(rdx, qword_ptr(rbp))?;
            a.add(rbp, 8)?;
            a.mov(qword_ptr(rsp + rax), rdx)?;
            dispatch(a)
        }),
    );
    put(
        &mut bytes,
        H_JMP,
        &asm_at(H_JMP, |a| {
            a.mov(rsi, qword_ptr(rbp))?;
            a.add(rbp, 8)?;
            dispatch(a)
        }),
    );
    put(
        &mut bytes,
        H_VMEXIT,
        &asm_at(H_VMEXIT, |a| {
            a.pop(r15)?;
            a.pop(r14)?;
            a.ret()?;
            Ok(())
        }),
    );
    put(
        &mut bytes,
        H_DIV,
        &asm_at(H_DIV, |a| {
            // Anti-analysis divide-by-zero; the interrupt hook must step
            // over it.
            a.xor(eax, eax)?;
            a.div(eax)?;
            dispatch(a)
        }),
    );
    put(
        &mut bytes,
        H_CALLOUT,
        &asm_at(H_CALLOUT, |a| {
            // Calls out of the module; the fetch-unmapped hook synthesizes
            // the return.
            a.mov(rax, 0x7000_0000_0000u64)?;
            a.call(rax)?;
            dispatch(a)
        }),
    );
    put(
        &mut bytes,
        H_RWUNMAPPED,
        &asm_at(H_RWUNMAPPED, |a| {
            // Touches unmapped memory both ways; pages get mapped on demand.
            a.mov(rax, 0x6000_0000_0000u64)?;
            a.mov(rbx, qword_ptr(rax))?;
            a.mov(qword_ptr(rax + 0x2000), rbx)?;
            dispatch(a)
        }),
    );
    put(
        &mut bytes,
        H_SPIN,
        &asm_at(H_SPIN, |a| {
            let mut top = a.create_label();
            a.set_label(&mut top)?;
            a.nop()?;
            a.jmp(top)?;
            Ok(())
        }),
    );
    put(
        &mut bytes,
        H_LREG,
        &asm_at(H_LREG, |a| {
            a.movzx(eax, byte_ptr(rsi))?;
            a.add(rsi, 1)?;
            a.mov(rdx, qword_ptr(rsp + rax))?;
            a.sub(rbp, 8)?;
            a.mov(qword_ptr(rbp), rdx)?;
            dispatch(a)
        }),
    );
    put(
        &mut bytes,
        H_READ,
        &asm_at(H_READ, |a| {
            a.mov(rax, qword_ptr(rbp))?;
            a.mov(rax, qword_ptr(rax))?;
            a.mov(qword_ptr(rbp), rax)?;
            dispatch(a)
        }),
    );
    put(
        &mut bytes,
        H_WRITE,
        &asm_at(H_WRITE, |a| {
            a.mov(rax, qword_ptr(rbp))?;
            a.add(rbp, 8)?;
            a.mov(rdx, qword_ptr(rbp))?;
            a.add(rbp, 8)?;
            a.mov(qword_ptr(rax), rdx)?;
            dispatch(a)
        }),
    );

    for (rva, data) in streams {
        put(&mut bytes, *rva, data);
    }

    MappedImage {
        base: BASE,
        bytes,
        exec: vec![0x1000..0x2000, 0x8000..0x9000],
    }
}

/// Little-endian bytecode stream builder.
struct Bc(Vec<u8>);

impl Bc {
    fn new() -> Self {
        Self(Vec::new())
    }

    fn op(mut self, handler_rva: u64) -> Self {
        self.0.extend_from_slice(&(handler_rva as u32).to_le_bytes());
        self
    }

    fn lconst64(mut self, val: u64) -> Self {
        self = self.op(H_LCONSTQ);
        self.0.extend_from_slice(&val.to_le_bytes());
        self
    }

    fn lreg(mut self, idx: u8) -> Self {
        self = self.op(H_LREG);
        self.0.push(idx);
        self
    }

    fn sregs(mut self, count: u8) -> Self {
        for i in 0..count {
            self = self.op(H_SREG);
            self.0.push(i * 8);
        }
        self
    }

    fn jmp(self) -> Self {
        self.op(H_JMP)
    }

    fn vmexit(self) -> Self {
        self.op(H_VMEXIT)
    }
}

fn trace_routine(image: &MappedImage) -> (Tracer<&MappedImage>, VRoutine) {
    let ctx = VmCtx::new(image, BASE, VMENTER as u32, Register::RSI, Register::RBP);
    let mut tracer = Tracer::new(ctx, image).unwrap();
    let mut vrtn = VRoutine::default();
    tracer.emulate(VMENTER as u32, &mut vrtn).unwrap();
    (tracer, vrtn)
}

fn mnemonics(blk: &VBlock) -> Vec<VmMnemonic> {
    blk.vinstrs.iter().map(|v| v.mnemonic).collect()
}

/// A full prologue the resolver accepts.
fn legit_target() -> Vec<u8> {
    Bc::new().sregs(10).vmexit().0
}

#[test]
fn straight_line_exit() {
    let image = build_image(&[(BC_MAIN, Bc::new().vmexit().0)]);
    let (tracer, vrtn) = trace_routine(&image);

    assert_eq!(vrtn.rva, VMENTER as u32);
    assert_eq!(vrtn.blocks.len(), 1);
    let blk = &vrtn.blocks[0];
    assert_eq!(blk.vip.rva, BC_MAIN);
    assert_eq!(blk.vip.img_base, BASE + BC_MAIN);
    assert_eq!(mnemonics(blk), [VmMnemonic::VmExit]);
    assert_eq!(blk.branch_kind, BranchKind::VmExit);
    assert!(blk.branches.is_empty());
    assert!(blk.jmp.is_none());

    // The trace must be empty, snapshot-free and stackless after the last
    // handler terminator.
    let trace = &tracer.uc.get_data().trace;
    assert!(trace.instrs.is_empty());
    assert!(trace.vstack.is_empty());
}

#[test]
fn unconditional_jump_is_absolute() {
    let image = build_image(&[
        (BC_MAIN, Bc::new().lconst64(BASE + T1).jmp().0),
        (T1, legit_target()),
    ]);
    let (tracer, vrtn) = trace_routine(&image);

    let blk = &vrtn.blocks[0];
    assert_eq!(mnemonics(blk), [VmMnemonic::LConst, VmMnemonic::Jmp]);
    assert_eq!(
        blk.vinstrs[0].imm,
        Some(Imm {
            size: 64,
            val: BASE + T1
        })
    );
    // One lconst64 is not enough to even suspect a conditional.
    assert_eq!(tracer.could_have_jcc(&blk.vinstrs), None);
    assert_eq!(blk.branch_kind, BranchKind::Absolute);
    assert!(blk.branches.is_empty());
    assert!(blk.jmp.is_some());
}

#[test]
fn conditional_jump_with_two_valid_targets() {
    let image = build_image(&[
        (
            BC_MAIN,
            Bc::new()
                .lconst64(BASE + T1)
                .lconst64(BASE + T2)
                .lconst64(BASE + T1)
                .jmp()
                .0,
        ),
        (T1, legit_target()),
        (T2, legit_target()),
    ]);
    let (_tracer, vrtn) = trace_routine(&image);

    let blk = &vrtn.blocks[0];
    assert_eq!(blk.branch_kind, BranchKind::Jcc);
    assert_eq!(&blk.branches[..], &[BASE + T1, BASE + T2]);
    assert_eq!(blk.vinstrs.last().unwrap().mnemonic, VmMnemonic::Jmp);
}

#[test]
fn data_pointer_candidate_is_rejected_upfront() {
    let image = build_image(&[
        (
            BC_MAIN,
            Bc::new()
                .lconst64(BASE + T1)
                .lconst64(BASE + DATA)
                .lconst64(BASE + T1)
                .jmp()
                .0,
        ),
        (T1, legit_target()),
    ]);
    let (tracer, vrtn) = trace_routine(&image);

    let blk = &vrtn.blocks[0];
    assert_eq!(tracer.could_have_jcc(&blk.vinstrs), None);
    assert_eq!(blk.branch_kind, BranchKind::Absolute);
    assert!(blk.branches.is_empty());
}

#[test]
fn short_prologue_fails_speculative_validation() {
    // Nine sregs miss the threshold of ten, so only one candidate validates
    // and the block stays absolute.
    let image = build_image(&[
        (
            BC_MAIN,
            Bc::new()
                .lconst64(BASE + T1)
                .lconst64(BASE + T_SHORT)
                .lconst64(BASE + T1)
                .jmp()
                .0,
        ),
        (T1, legit_target()),
        (T_SHORT, Bc::new().sregs(9).vmexit().0),
    ]);
    let (tracer, vrtn) = trace_routine(&image);

    let blk = &vrtn.blocks[0];
    assert!(tracer.could_have_jcc(&blk.vinstrs).is_some());
    assert_eq!(blk.branch_kind, BranchKind::Absolute);
    assert!(blk.branches.is_empty());
}

#[test]
fn sreg_classifies_inside_a_block() {
    let image = build_image(&[(BC_MAIN, Bc::new().lconst64(0x1234).sregs(1).vmexit().0)]);
    let (_tracer, vrtn) = trace_routine(&image);

    let blk = &vrtn.blocks[0];
    assert_eq!(
        mnemonics(blk),
        [VmMnemonic::LConst, VmMnemonic::SReg, VmMnemonic::VmExit]
    );
    assert_eq!(blk.vinstrs[1].imm, Some(Imm { size: 8, val: 0 }));
}

#[test]
fn lreg_write_and_read_handlers_classify() {
    // Push a virtual register, store a constant through a popped pointer,
    // then read it back through the same pointer.
    let image = build_image(&[(
        BC_MAIN,
        Bc::new()
            .lreg(0)
            .lconst64(0x1122_3344_5566_7788)
            .lconst64(BASE + DATA)
            .op(H_WRITE)
            .lconst64(BASE + DATA)
            .op(H_READ)
            .vmexit()
            .0,
    )]);
    let (_tracer, vrtn) = trace_routine(&image);

    let blk = &vrtn.blocks[0];
    assert_eq!(
        mnemonics(blk),
        [
            VmMnemonic::LReg,
            VmMnemonic::LConst,
            VmMnemonic::LConst,
            VmMnemonic::Write,
            VmMnemonic::LConst,
            VmMnemonic::Read,
            VmMnemonic::VmExit
        ]
    );
    assert_eq!(blk.vinstrs[0].imm, Some(Imm { size: 8, val: 0 }));
    assert_eq!(blk.branch_kind, BranchKind::VmExit);
}

#[test]
fn divide_by_zero_is_skipped() {
    let image = build_image(&[(BC_MAIN, Bc::new().op(H_DIV).vmexit().0)]);
    let (_tracer, vrtn) = trace_routine(&image);

    let blk = &vrtn.blocks[0];
    assert_eq!(mnemonics(blk), [VmMnemonic::Unknown, VmMnemonic::VmExit]);
    assert_eq!(blk.branch_kind, BranchKind::VmExit);
}

#[test]
fn unmapped_accesses_are_repaired() {
    let image = build_image(&[(
        BC_MAIN,
        Bc::new().op(H_CALLOUT).op(H_RWUNMAPPED).vmexit().0,
    )]);
    let (_tracer, vrtn) = trace_routine(&image);

    let blk = &vrtn.blocks[0];
    assert_eq!(
        mnemonics(blk),
        [VmMnemonic::Unknown, VmMnemonic::Unknown, VmMnemonic::VmExit]
    );
    assert_eq!(blk.branch_kind, BranchKind::VmExit);
}

#[test]
fn runaway_emulation_hits_the_step_cap() {
    let image = build_image(&[(BC_MAIN, Bc::new().op(H_SPIN).0)]);
    let ctx = VmCtx::new(&image, BASE, VMENTER as u32, Register::RSI, Register::RBP);
    let mut tracer = Tracer::new(ctx, &image).unwrap().with_max_steps(500);
    let mut vrtn = VRoutine::default();

    match tracer.emulate(VMENTER as u32, &mut vrtn) {
        Err(TraceError::StepLimit(500)) => {}
        other => panic!("expected a step-limit error, got {other:?}"),
    }
    assert!(vrtn.blocks.is_empty());
}

#[test]
fn strict_mode_rejects_unknown_handlers() {
    let image = build_image(&[(BC_MAIN, Bc::new().op(H_DIV).vmexit().0)]);
    let ctx = VmCtx::new(&image, BASE, VMENTER as u32, Register::RSI, Register::RBP);
    let mut tracer = Tracer::new(ctx, &image)
        .unwrap()
        .with_strict_classification(true);
    let mut vrtn = VRoutine::default();

    match tracer.emulate(VMENTER as u32, &mut vrtn) {
        Err(TraceError::UnknownHandler(_)) => {}
        other => panic!("expected an unknown-handler error, got {other:?}"),
    }
    assert!(vrtn.blocks.is_empty());
}

mod slicing {
    use iced_x86::code_asm::*;
    use iced_x86::{Decoder, DecoderOptions, IcedError, Mnemonic, Register};
    use unicorn_engine::unicorn_const::{Arch, Mode};
    use unicorn_engine::Unicorn;

    use super::slice_at_rva_fetch;
    use crate::instrs::{EmuInstr, HandlerTrace};

    fn trace_of(build: impl FnOnce(&mut CodeAssembler) -> Result<(), IcedError>) -> HandlerTrace {
        let mut asm = CodeAssembler::new(64).unwrap();
        build(&mut asm).unwrap();
        let code = asm.assemble(0x1000).unwrap();

        let mut uc = Unicorn::new(Arch::X86, Mode::MODE_64).unwrap();
        let mut trace = HandlerTrace::new(Register::RSI, Register::RBP);
        let mut decoder = Decoder::with_ip(64, &code, 0x1000, DecoderOptions::NONE);
        while decoder.can_decode() {
            trace.instrs.push(EmuInstr {
                instr: decoder.decode(),
                cpu: uc.context_init().unwrap(),
            });
        }
        trace
    }

    #[test]
    fn truncates_after_the_last_fetch_and_is_idempotent() {
        let mut trace = trace_of(|a| {
            a.sub(rbp, 8)?;
            a.mov(qword_ptr(rbp), rax)?;
            a.mov(eax, dword_ptr(rsi))?;
            a.add(rsi, 4)?;
            a.mov(rdx, 0x1_4000_0000u64)?;
            a.add(rax, rdx)?;
            a.jmp(rax)?;
            Ok(())
        });

        slice_at_rva_fetch(&mut trace, Register::RSI);
        assert_eq!(trace.instrs.len(), 3);
        let last = trace.instrs.last().unwrap();
        assert_eq!(last.instr.mnemonic(), Mnemonic::Mov);
        assert_eq!(last.instr.memory_base(), Register::RSI);

        slice_at_rva_fetch(&mut trace, Register::RSI);
        assert_eq!(trace.instrs.len(), 3);
    }

    #[test]
    fn traces_without_a_fetch_are_untouched() {
        let mut trace = trace_of(|a| {
            a.pop(r15)?;
            a.ret()?;
            Ok(())
        });
        slice_at_rva_fetch(&mut trace, Register::RSI);
        assert_eq!(trace.instrs.len(), 2);
    }
}

mod jcc_candidates {
    use super::{find_jcc_candidates, BASE, SIZE};
    use crate::image::MappedImage;
    use crate::instrs::{Imm, VInstr, VmMnemonic};

    fn image() -> MappedImage {
        MappedImage {
            base: BASE,
            bytes: vec![0; SIZE as usize],
            exec: vec![0x8000..0x9000],
        }
    }

    fn lconst64(val: u64) -> VInstr {
        VInstr {
            mnemonic: VmMnemonic::LConst,
            imm: Some(Imm { size: 64, val }),
        }
    }

    fn plain(mnemonic: VmMnemonic) -> VInstr {
        VInstr {
            mnemonic,
            imm: None,
        }
    }

    #[test]
    fn requires_three_lconst64() {
        let image = image();
        let two = [
            lconst64(BASE + 0x8000),
            lconst64(BASE + 0x8100),
            plain(VmMnemonic::Jmp),
        ];
        assert_eq!(find_jcc_candidates(&image, BASE, SIZE, &two), None);

        let three = [
            lconst64(BASE + 0x8200),
            lconst64(BASE + 0x8000),
            lconst64(BASE + 0x8100),
            plain(VmMnemonic::Jmp),
        ];
        assert_eq!(
            find_jcc_candidates(&image, BASE, SIZE, &three),
            Some((BASE + 0x8100, BASE + 0x8000))
        );
    }

    #[test]
    fn vmexit_blocks_never_qualify() {
        let image = image();
        let vinstrs = [
            lconst64(BASE + 0x8000),
            lconst64(BASE + 0x8100),
            lconst64(BASE + 0x8200),
            plain(VmMnemonic::VmExit),
        ];
        assert_eq!(find_jcc_candidates(&image, BASE, SIZE, &vinstrs), None);
    }

    #[test]
    fn rejects_out_of_image_and_non_executable_targets() {
        let image = image();
        // Image range is closed-open: one past the end is out.
        let past_end = [
            lconst64(BASE + 0x8000),
            lconst64(BASE + SIZE),
            lconst64(BASE + 0x8100),
            plain(VmMnemonic::Jmp),
        ];
        assert_eq!(find_jcc_candidates(&image, BASE, SIZE, &past_end), None);

        let non_exec = [
            lconst64(BASE + 0x8000),
            lconst64(BASE + 0xC000),
            lconst64(BASE + 0x8100),
            plain(VmMnemonic::Jmp),
        ];
        assert_eq!(find_jcc_candidates(&image, BASE, SIZE, &non_exec), None);
    }

    #[test]
    fn small_immediates_are_not_addresses() {
        let image = image();
        let vinstrs = [
            lconst64(BASE + 0x8000),
            lconst64(BASE + 0x8100),
            lconst64(0),
            plain(VmMnemonic::Jmp),
        ];
        // The selector constant lands last and fails the image test.
        assert_eq!(find_jcc_candidates(&image, BASE, SIZE, &vinstrs), None);
    }
}
