// SPDX-License-Identifier: MPL-2.0

//! In-memory quirk patches for Darwin kernels and kernel extensions.
//!
//! A boot loader hands every loaded image to this crate through
//! [`ImageContext`] before control is transferred to the kernel. Each quirk
//! locates a known instruction sequence, data table or string in the image and
//! rewrites it so that the system runs on hardware Apple does not ship:
//!
//! ```no_run
//! use kernel_quirks::{DarwinVersion, MappedImage, QuirkConfig, apply_enabled_quirks};
//!
//! # fn load_kernel() -> (u64, &'static mut [u8], &'static [(&'static str, u64)]) { unimplemented!() }
//! let config = QuirkConfig::from("quirks.AppleXcpmCfgLock quirks.PanicNoKextDump");
//! let (base, bytes, symbols) = load_kernel();
//! let mut kernel = MappedImage::new(base, bytes, symbols).unwrap();
//! let version: DarwinVersion = "20.6.0".parse().unwrap();
//!
//! let report = apply_enabled_quirks(&config, None, &mut kernel, version);
//! assert_eq!(report.failed, 0);
//! ```
//!
//! Quirks that target a kernel version outside of their range succeed without
//! touching the image. Patches that emit code assemble it off-image first and
//! leave the image unchanged if it does not fit.

#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod cpu;
pub mod cpuid;
pub mod emit;
mod error;
pub mod generic;
pub mod image;
pub mod logger;
pub mod quirks;
pub mod records;

pub use darwin_version::DarwinVersion;

pub use self::{
    config::{QuirkConfig, QuirkSet},
    cpu::CpuInfo,
    cpuid::{apply_cpuid_override, patch_kernel_cpuid},
    error::{Error, Result},
    image::{ImageContext, MappedImage, PAGE_SIZE},
    quirks::{
        KernelQuirk, QUIRKS, QuirkName, QuirkReport, apply_enabled_quirks, apply_kernel_quirks,
        apply_quirk,
    },
};
