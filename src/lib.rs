//! rock-image - ROCK-OS initramfs construction and integration verification.
//!
//! Packs a staged root tree into a gzip-compressed newc archive, checks trees
//! and archives against the rock-init integration contract, resolves ELF
//! library dependencies and classifies QEMU boot trials.
//!
//! See `tests/helpers.rs` for the fixtures integration tests share.

pub mod artifact;
pub mod commands;
pub mod config;
pub mod contract;
pub mod elf;
pub mod preflight;
pub mod process;
pub mod qemu;
pub mod verify;
