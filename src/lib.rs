//! Devirtualization support for VMProtect-style virtualized routines.
//!
//! A protected binary enters the obfuscator's interpreter at a *VMENTER* stub.
//! From there, byte-coded virtual instructions are dispatched against a small
//! register file, a virtual instruction pointer (VIP) and a virtual stack
//! pointer (VSP), each realized by an obfuscated native handler ending in an
//! indirect branch. This crate concretely executes such a routine inside a CPU
//! emulator, slices every handler's native trace down to its canonical region,
//! classifies it into a v-instruction, and recovers virtual basic blocks
//! together with the control-flow edges that connect them (`jmp`, `jcc`,
//! `vmexit`).
//!
//! The entry point is [`Tracer`]: construct it from a [`VmCtx`] describing the
//! protected module plus the VIP/VSP register assignment, then call
//! [`Tracer::emulate`] with a VMENTER RVA to obtain a populated
//! [`instrs::VRoutine`]. Identifying the VIP/VSP registers and walking
//! successor blocks are left to the caller.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod image;
pub mod instrs;
pub mod tracer;

pub use image::{map_pe_file, MappedImage, VmCtx, VmImage};
pub use tracer::{TraceError, Tracer};
