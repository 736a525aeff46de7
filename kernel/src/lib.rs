//! Virtual-memory subsystem for a 32-bit ARMv6 (Raspberry Pi class) kernel.
//!
//! This crate contains the memory-management core of the kernel:
//!
//! - the bit-exact descriptor layer for TTB and page-table entries
//!   (plus the software-only auxiliary entries),
//! - the early map builder that constructs the initial translation
//!   tables while the MMU is still off,
//! - the physical frame allocator (Master Page Database),
//! - the kernel virtual-address-space allocator,
//! - the live page mapper that edits translation tables at runtime,
//! - the initialization-phase heap, and
//! - the production multi-arena, size-classed heap.
//!
//! Everything outside this core (UART tracing, ATAG parsing, board
//! bring-up, the kernel entry) lives in the surrounding kernel and
//! talks to this crate through `StartupInfo` and the capability traits
//! in `heap::api`.

#![cfg_attr(not(test), no_std)]

pub mod collections;
pub mod heap;
pub mod memory;
pub mod status;
