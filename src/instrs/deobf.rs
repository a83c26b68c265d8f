//! Junk removal over handler traces.
//!
//! The obfuscator pads every handler with do-nothing instructions so that the
//! canonical pattern a profile expects is buried. The passes here run to a
//! fixpoint, never reorder surviving instructions, and are idempotent, which
//! keeps the slicer and the profile matchers downstream simple.

use iced_x86::{Instruction, Mnemonic, OpKind};

use super::HandlerTrace;

/// Remove junk instructions from `trace` in place.
pub fn deobfuscate(trace: &mut HandlerTrace) {
    loop {
        let before = trace.instrs.len();
        strip_nops(trace);
        strip_self_moves(trace);
        strip_dead_push_pop(trace);
        if trace.instrs.len() == before {
            break;
        }
    }
}

fn strip_nops(trace: &mut HandlerTrace) {
    trace.instrs.retain(|ei| ei.instr.mnemonic() != Mnemonic::Nop);
}

/// `mov r, r` and `xchg r, r` on the identical register are pure padding.
fn strip_self_moves(trace: &mut HandlerTrace) {
    trace.instrs.retain(|ei| !is_self_move(&ei.instr));
}

fn is_self_move(instr: &Instruction) -> bool {
    matches!(instr.mnemonic(), Mnemonic::Mov | Mnemonic::Xchg)
        && instr.op0_kind() == OpKind::Register
        && instr.op1_kind() == OpKind::Register
        && instr.op0_register() == instr.op1_register()
}

/// An immediately adjacent `push r; pop r` of the same register restores every
/// architectural register it touched; only the transient spill below the stack
/// pointer remains, which no profile inspects.
fn strip_dead_push_pop(trace: &mut HandlerTrace) {
    let mut i = 0;
    while i + 1 < trace.instrs.len() {
        let a = &trace.instrs[i].instr;
        let b = &trace.instrs[i + 1].instr;
        let dead = a.mnemonic() == Mnemonic::Push
            && b.mnemonic() == Mnemonic::Pop
            && a.op0_kind() == OpKind::Register
            && b.op0_kind() == OpKind::Register
            && a.op0_register() == b.op0_register();
        if dead {
            trace.instrs.drain(i..i + 2);
            i = i.saturating_sub(1);
        } else {
            i += 1;
        }
    }
}
