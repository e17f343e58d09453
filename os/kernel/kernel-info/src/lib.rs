//! # Kernel Memory Configuration
//!
//! Compile-time configuration shared by the physical allocator and the
//! superpage reservation layer. Everything here is a `const`; invalid
//! combinations are rejected at compile time by the assertions in
//! [`memory`].
//!
//! ## Reservation Levels
//!
//! ```text
//! level 1  ┌───────────────────────────────────────────────┐ 2 MiB (order 9)
//!          │                                               │
//! level 0  ├──┬──┬──┬──┬──┬──┬──┬──┬──┬──┬──┬─ ... ─┬──┬──┤ 64 KiB (order 4)
//!          │  │  │  │  │  │  │  │  │  │  │  │       │  │  │ 32 runs
//! page     └──┴──┴──┴──┴──┴──┴──┴──┴──┴──┴──┴─ ... ─┴──┴──┘ 4 KiB
//! ```
//!
//! A level-1 reservation is built from `1 << (LEVEL1_ORDER - LEVEL0_ORDER)`
//! level-0 runs. The orders here are the boot defaults; the reservation
//! manager accepts other orders at construction time.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod memory;
