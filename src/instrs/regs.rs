//! Mapping from decoded register identifiers to emulator register ids.

use iced_x86::Register;
use unicorn_engine::RegisterX86;

/// Translate a general-purpose register to the emulator's id for its full
/// 64-bit register.
///
/// Returns [`None`] for anything that is not a general-purpose register;
/// the VM only ever repurposes those for VIP and VSP.
pub fn emulator_reg(reg: Register) -> Option<RegisterX86> {
    Some(match reg.full_register() {
        Register::RAX => RegisterX86::RAX,
        Register::RBX => RegisterX86::RBX,
        Register::RCX => RegisterX86::RCX,
        Register::RDX => RegisterX86::RDX,
        Register::RSP => RegisterX86::RSP,
        Register::RBP => RegisterX86::RBP,
        Register::RSI => RegisterX86::RSI,
        Register::RDI => RegisterX86::RDI,
        Register::R8 => RegisterX86::R8,
        Register::R9 => RegisterX86::R9,
        Register::R10 => RegisterX86::R10,
        Register::R11 => RegisterX86::R11,
        Register::R12 => RegisterX86::R12,
        Register::R13 => RegisterX86::R13,
        Register::R14 => RegisterX86::R14,
        Register::R15 => RegisterX86::R15,
        _ => return None,
    })
}
