//! Driver CLI: trace the entry block of a virtualized routine in a PE and
//! print what was recovered.
//!
//! The VM-context discovery pass is a separate tool, so the VIP/VSP register
//! assignment and the VMENTER RVA are taken as arguments.

use std::error::Error;
use std::path::PathBuf;

use clap::Parser;
use iced_x86::Register;

use devmp::instrs::{get_profile, BranchKind, VBlock, VmMnemonic, VRoutine};
use devmp::{map_pe_file, TraceError, Tracer, VmCtx, VmImage};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct CliArgs {
    #[arg(value_name = "MODULE", help = "Path to the protected PE file.")]
    module: PathBuf,

    #[arg(
        long,
        value_parser = parse_hex32,
        help = "RVA of the VMENTER stub, e.g. 0x1000."
    )]
    vmenter: u32,

    #[arg(
        long,
        value_parser = parse_gpr,
        help = "Native register assigned to the virtual instruction pointer, e.g. rsi."
    )]
    vip: Register,

    #[arg(
        long,
        value_parser = parse_gpr,
        help = "Native register assigned to the virtual stack pointer, e.g. rbp."
    )]
    vsp: Register,

    #[arg(long, help = "Stop on handlers no profile can classify.")]
    strict: bool,

    #[arg(
        long,
        default_value_t = 1_000_000,
        help = "Native instruction cap per traced block."
    )]
    max_steps: usize,
}

fn parse_hex32(s: &str) -> Result<u32, String> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u32::from_str_radix(digits, 16).map_err(|e| e.to_string())
}

fn parse_gpr(s: &str) -> Result<Register, String> {
    let reg = match s.to_ascii_lowercase().as_str() {
        "rax" => Register::RAX,
        "rbx" => Register::RBX,
        "rcx" => Register::RCX,
        "rdx" => Register::RDX,
        "rsp" => Register::RSP,
        "rbp" => Register::RBP,
        "rsi" => Register::RSI,
        "rdi" => Register::RDI,
        "r8" => Register::R8,
        "r9" => Register::R9,
        "r10" => Register::R10,
        "r11" => Register::R11,
        "r12" => Register::R12,
        "r13" => Register::R13,
        "r14" => Register::R14,
        "r15" => Register::R15,
        other => return Err(format!("not a 64-bit general-purpose register: {other}")),
    };
    Ok(reg)
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = CliArgs::parse();

    let file = std::fs::read(&args.module)?;
    let image = map_pe_file(&file)?;
    log::info!(
        "mapped {} at its preferred base {:#x} ({:#x} bytes)",
        args.module.display(),
        image.image_base(),
        image.image_size()
    );

    // Emulating at the preferred base keeps the image-base and module-base
    // address spaces identical.
    let ctx = VmCtx::new(&image, image.image_base(), args.vmenter, args.vip, args.vsp);
    let mut tracer = Tracer::new(ctx, &image)?
        .with_max_steps(args.max_steps)
        .with_strict_classification(args.strict);

    let mut vrtn = VRoutine::default();
    match tracer.emulate(args.vmenter, &mut vrtn) {
        Ok(()) => {}
        Err(err @ TraceError::UnknownHandler(_)) => {
            eprintln!("aborted: {err}");
            std::process::exit(1);
        }
        Err(err) => return Err(err.into()),
    }

    println!("routine at rva {:#x}:", vrtn.rva);
    for blk in &vrtn.blocks {
        print_block(&ctx, blk);
    }
    Ok(())
}

fn print_block(ctx: &VmCtx, blk: &VBlock) {
    println!(
        "  block vip rva {:#x} ({:#x}), {} v-instructions",
        blk.vip.rva,
        blk.vip.img_base,
        blk.vinstrs.len()
    );
    for vinstr in &blk.vinstrs {
        let name = get_profile(vinstr.mnemonic).map(|p| p.name).unwrap_or("UNKNOWN");
        match vinstr.imm {
            Some(imm) => println!("    {name} {:#x}:{}", imm.val, imm.size),
            None => println!("    {name}"),
        }
    }
    match blk.branch_kind {
        BranchKind::Jcc => println!(
            "  jcc -> {:#x}, {:#x}",
            blk.branches[0], blk.branches[1]
        ),
        // The core leaves absolute targets to the driver: the address the
        // jmp handler pops is the block's last in-image lconst64.
        BranchKind::Absolute => match absolute_target(ctx, blk) {
            Some(target) => println!("  jmp -> {target:#x}"),
            None => println!("  jmp -> ?"),
        },
        BranchKind::VmExit => println!("  vmexit"),
        BranchKind::Unset => println!("  unresolved"),
    }
}

fn absolute_target(ctx: &VmCtx, blk: &VBlock) -> Option<u64> {
    blk.vinstrs.iter().rev().find_map(|v| {
        let imm = v.imm.filter(|imm| {
            v.mnemonic == VmMnemonic::LConst
                && imm.size == 64
                && (ctx.image_base..ctx.image_base + ctx.image_size).contains(&imm.val)
        })?;
        Some(imm.val)
    })
}
