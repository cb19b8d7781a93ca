// SPDX-License-Identifier: MPL-2.0

//! CPUID virtualization for the kernel.
//!
//! XNU reads leaf 1 once in `cpuid_set_info` and derives the CPU family from
//! it. To run on processors the kernel does not know, the leaf-1 values are
//! replaced by constants chosen by the user. Three kernel flavors are handled:
//!
//! - release kernels, where the `cpuid` sequence is overwritten in place;
//! - older release kernels, where there is no room in place and the override
//!   is relocated into the space freed by shortening the vendor-string code;
//! - debug kernels, where `cpuid_set_cpufamily` is replaced wholesale.

use byte_patch::find_pattern;
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    little_endian::{U32, U64},
};

use crate::{
    CpuInfo, Error, ImageContext, QuirkConfig, Result,
    cpu::feature_ecx,
    emit::{self, Assembler, Register},
    image::PAGE_SIZE,
};

/// `mov ecx, 8Bh; xor eax, eax; xor edx, edx; wrmsr; mov eax, 1;
/// xor ebx, ebx; xor ecx, ecx; xor edx, edx; cpuid`
const RELEASE_FIND_NEW: [u8; 24] = [
    0xB9, 0x8B, 0x00, 0x00, 0x00, 0x31, 0xC0, 0x31, 0xD2, 0x0F, 0x30, 0xB8, 0x01, 0x00, 0x00,
    0x00, 0x31, 0xDB, 0x31, 0xC9, 0x31, 0xD2, 0x0F, 0xA2,
];

/// The same sequence without `xor eax, eax`.
const RELEASE_FIND_OLD: [u8; 22] = [
    0xB9, 0x8B, 0x00, 0x00, 0x00, 0x31, 0xD2, 0x0F, 0x30, 0xB8, 0x01, 0x00, 0x00, 0x00, 0x31,
    0xDB, 0x31, 0xC9, 0x31, 0xD2, 0x0F, 0xA2,
];

/// `mov ecx, 8Bh; rdmsr`
const MICROCODE_FIND: [u8; 7] = [0xB9, 0x8B, 0x00, 0x00, 0x00, 0x0F, 0x32];

/// `mov edx, 4; lea rsi, ...`
const LEGACY_START: [u8; 8] = [0xBA, 0x04, 0x00, 0x00, 0x00, 0x48, 0x8D, 0x35];
/// The tail of a byte store followed by `mov eax, 80000000h`.
const LEGACY_END1: [u8; 6] = [0x00, 0xB8, 0x00, 0x00, 0x00, 0x80];
/// `cpuid; mov ...`
const LEGACY_END2: [u8; 3] = [0x0F, 0xA2, 0x89];
/// `mov eax, 1`
const LEGACY_LOC1: [u8; 5] = [0xB8, 0x01, 0x00, 0x00, 0x00];
const LEGACY_LOC2: [u8; 3] = [0x0F, 0xA2, 0x89];

/// The length of the four `mov r32, imm32` override loads.
const OVERRIDE_SIZE: usize = 20;
/// The length of the vendor-string stores written over the legacy setup code.
const SIGNATURE_STORE_SIZE: usize = 3 * (5 + 2) + 2 * 4;
/// The longest distance a short jump from the legacy setup code can cover.
const LEGACY_MAX_GAP: usize = 128;

/// The body of `cpuid_set_cpufamily` written to debug kernels.
///
/// ```text
/// mov dword ptr [rdi+68h], signature
/// mov byte ptr [rdi+50h], stepping
/// mov rax, (extfamily, extmodel, model, family, type)
/// mov [rdi+48h], rax
/// mov rax, features
/// mov [rdi+58h], rax
/// mov dword ptr [rdi+0CCh], logical_per_package
/// mov dword ptr [rdi+188h], cpufamily
/// mov eax, cpufamily
/// ret
/// ```
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Clone, Copy, Debug)]
#[repr(C)]
struct CpufamilyStub {
    code1: [u8; 3],
    signature: U32,
    code2: [u8; 3],
    stepping: u8,
    code3: [u8; 2],
    cpu_type: U32,
    family: u8,
    model: u8,
    ext_model: u8,
    ext_family: u8,
    code4: [u8; 6],
    features: U64,
    code5: [u8; 10],
    logical_per_package: U32,
    code6: [u8; 6],
    apple_family1: U32,
    code7: u8,
    apple_family2: U32,
    code8: u8,
}

const CPUFAMILY_STUB: [u8; 65] = [
    0xC7, 0x47, 0x68, 0x11, 0x11, 0x11, 0x11, // mov dword ptr [rdi+68h], 11111111h
    0xC6, 0x47, 0x50, 0x22, // mov byte ptr [rdi+50h], 22h
    0x48, 0xB8, 0x55, 0x55, 0x55, 0x55, 0x44, 0x33, 0x66, 0x77, // mov rax, 7766334455555555h
    0x48, 0x89, 0x47, 0x48, // mov [rdi+48h], rax
    0x48, 0xB8, 0x88, 0x88, 0x88, 0x88, 0x88, 0x88, 0x88, 0x88, // mov rax, 8888888888888888h
    0x48, 0x89, 0x47, 0x58, // mov [rdi+58h], rax
    0xC7, 0x87, 0xCC, 0x00, 0x00, 0x00, 0x99, 0x99, 0x99, 0x99, // mov dword ptr [rdi+0CCh], ...
    0xC7, 0x87, 0x88, 0x01, 0x00, 0x00, 0xAA, 0xAA, 0xAA, 0xAA, // mov dword ptr [rdi+188h], ...
    0xB8, 0xAA, 0xAA, 0xAA, 0xAA, // mov eax, 0AAAAAAAAh
    0xC3, // ret
];

const _: () = assert!(size_of::<CpufamilyStub>() == CPUFAMILY_STUB.len());

/// Makes the kernel see `data` instead of the real leaf-1 values for every
/// bit set in `mask`.
///
/// `data` and `mask` hold EAX, EBX, ECX and EDX in that order.
///
/// Returns the number of rewritten code sites.
pub fn patch_kernel_cpuid(
    image: &mut dyn ImageContext,
    cpu: &CpuInfo,
    data: [u32; 4],
    mask: [u32; 4],
) -> Result<usize> {
    let last = image
        .image_size()
        .checked_sub(2 * PAGE_SIZE + RELEASE_FIND_NEW.len())
        .ok_or(Error::NotFound)?;

    let set_info = match image.symbol_offset("_cpuid_set_info") {
        Ok(offset) if offset < last => offset,
        _ => {
            log::warn!("Failed to locate _cpuid_set_info");
            return Err(Error::NotFound);
        }
    };

    if let Some((site, size)) = find_release_site(image.bytes(), set_info) {
        let leaf1 = merge(&with_osxsave(cpu.leaf1), &data, &mask);
        return patch_release(image.bytes_mut(), site, size, leaf1, cpu.microcode_revision);
    }

    let legacy_err = match patch_legacy(image.bytes_mut(), set_info, cpu, &data, &mask) {
        Ok(sites) => return Ok(sites),
        Err(err) => {
            log::info!("Legacy CPUID patch failed - {}, trying debug", err);
            err
        }
    };

    let cpufamily = match image.symbol_offset("_cpuid_set_cpufamily") {
        Ok(offset) if offset < last => offset,
        _ => {
            log::warn!("Failed to locate _cpuid_set_cpufamily");
            return Err(legacy_err);
        }
    };
    let leaf1 = merge(&cpu.leaf1, &data, &mask);
    patch_debug(image.bytes_mut(), cpufamily, leaf1)
}

/// Applies the `cpuid1.data`/`cpuid1.mask` override of `config` to the kernel.
///
/// Succeeds with no change when no override is configured.
pub fn apply_cpuid_override(
    config: &QuirkConfig,
    image: &mut dyn ImageContext,
    cpu: &CpuInfo,
) -> Result<usize> {
    if !config.has_cpuid_override() {
        return Ok(0);
    }
    patch_kernel_cpuid(image, cpu, config.cpuid_data, config.cpuid_mask)
}

// (data & mask) | (real & !mask), per register.
fn merge(real: &[u32; 4], data: &[u32; 4], mask: &[u32; 4]) -> [u32; 4] {
    core::array::from_fn(|i| (data[i] & mask[i]) | (real[i] & !mask[i]))
}

// XNU stops re-evaluating leaf 1 once it is virtualized, so OSXSAVE would never
// be reported after the FPU setup enables it. Report it whenever it can be set.
fn with_osxsave(mut leaf1: [u32; 4]) -> [u32; 4] {
    let ecx = &mut leaf1[CpuInfo::ECX];
    if *ecx & feature_ecx::XSAVE != 0
        && *ecx & feature_ecx::AVX != 0
        && *ecx & feature_ecx::OSXSAVE == 0
    {
        *ecx |= feature_ecx::OSXSAVE;
    }
    leaf1
}

fn find_release_site(bytes: &[u8], set_info: usize) -> Option<(usize, usize)> {
    let end = (set_info + PAGE_SIZE + RELEASE_FIND_NEW.len()).min(bytes.len());
    let window = bytes.get(set_info..end)?;

    let mut cursor = 0;
    while let Some(at) = find_pattern(&RELEASE_FIND_NEW[..4], None, window, cursor) {
        if at >= PAGE_SIZE {
            break;
        }
        let candidate = &window[at..];
        if candidate.starts_with(&RELEASE_FIND_NEW) {
            return Some((set_info + at, RELEASE_FIND_NEW.len()));
        }
        if candidate.starts_with(&RELEASE_FIND_OLD) {
            return Some((set_info + at, RELEASE_FIND_OLD.len()));
        }
        cursor = at + 1;
    }
    None
}

fn override_loads(asm: &mut Assembler, leaf1: &[u32; 4]) -> Result<()> {
    asm.mov_imm32(Register::Rax, leaf1[CpuInfo::EAX])?
        .mov_imm32(Register::Rbx, leaf1[CpuInfo::EBX])?
        .mov_imm32(Register::Rcx, leaf1[CpuInfo::ECX])?
        .mov_imm32(Register::Rdx, leaf1[CpuInfo::EDX])?;
    Ok(())
}

fn patch_release(
    bytes: &mut [u8],
    site: usize,
    size: usize,
    leaf1: [u32; 4],
    microcode_revision: u32,
) -> Result<usize> {
    let search_start = site + size;
    let search_end = (search_start + PAGE_SIZE).min(bytes.len());
    let Some(microcode) = bytes
        .get(search_start..search_end)
        .and_then(|window| find_pattern(&MICROCODE_FIND, None, window, 0))
        .map(|at| search_start + at)
    else {
        log::warn!("Failed to find the microcode read after the CPUID patch site");
        return Err(Error::Unsupported);
    };

    let mut cpuid = Assembler::new(site);
    override_loads(&mut cpuid, &leaf1)?;
    cpuid.nop_until(site + size)?;

    let mut revision = Assembler::new(microcode);
    revision
        .mov_imm32(Register::Rdx, microcode_revision)?
        .nop_until(microcode + MICROCODE_FIND.len())?;

    emit::commit(bytes, &[&cpuid, &revision])?;
    log::info!("Patched release CPUID at {:#x}", site);
    Ok(2)
}

// Scans for `pattern` from `*cursor`, sharing one page-sized budget between
// all landmarks that start at `anchor`.
fn next_landmark(
    bytes: &[u8],
    anchor: usize,
    cursor: &mut usize,
    pattern: &[u8],
) -> Result<usize> {
    let end = (anchor + PAGE_SIZE + pattern.len() - 1).min(bytes.len());
    let window = bytes.get(..end).ok_or(Error::NotFound)?;
    let at = find_pattern(pattern, None, window, *cursor)
        .filter(|at| *at < anchor + PAGE_SIZE)
        .ok_or(Error::NotFound)?;
    *cursor = at;
    Ok(at)
}

fn patch_legacy(
    bytes: &mut [u8],
    set_info: usize,
    cpu: &CpuInfo,
    data: &[u32; 4],
    mask: &[u32; 4],
) -> Result<usize> {
    let mut cursor = set_info;
    // The setup code ends with the 4-byte displacement of `lea rsi`.
    let start =
        next_landmark(bytes, set_info, &mut cursor, &LEGACY_START)? + LEGACY_START.len() + 4;
    next_landmark(bytes, set_info, &mut cursor, &LEGACY_END1)?;
    let end = next_landmark(bytes, set_info, &mut cursor, &LEGACY_END2)?
        .checked_sub(3)
        .ok_or(Error::NotFound)?;
    let location = next_landmark(bytes, set_info, &mut cursor, &LEGACY_LOC1)?;
    let location_end = next_landmark(bytes, set_info, &mut cursor, &LEGACY_LOC2)? + 2;

    // After the vendor-string stores there must be room for a short jump, the
    // override loads and a near jump, all within short jump range.
    let free = start + SIGNATURE_STORE_SIZE;
    if free >= end
        || end - free > LEGACY_MAX_GAP
        || end - free < OVERRIDE_SIZE + 7
        || location_end < location + 5
    {
        log::warn!(
            "No room for the relocated CPUID code: {:#x}..{:#x}, {:#x}..{:#x}",
            free,
            end,
            location,
            location_end
        );
        return Err(Error::OutOfResources);
    }

    // Return the highest extended leaf directly instead of querying it.
    let mut max_ext = Assembler::new(end);
    max_ext.mov_imm32(Register::Rax, cpu.max_ext_leaf)?;

    let mut relocated = Assembler::new(start);
    for (index, word) in cpu.vendor.iter().enumerate() {
        relocated
            .mov_imm32(Register::Rax, *word)?
            .store32(Register::Rsi, Register::Rax)?;
        if index < 2 {
            relocated.add_imm8(Register::Rsi, 4)?;
        }
    }
    relocated.jmp_short(end)?;
    let override_at = relocated.position();
    override_loads(&mut relocated, &merge(&with_osxsave(cpu.leaf1), data, mask))?;
    relocated.jmp_near(location_end)?.nop_until(end)?;

    let mut detour = Assembler::new(location);
    detour.jmp_near(override_at)?.nop_until(location_end)?;

    emit::commit(bytes, &[&max_ext, &relocated, &detour])?;
    log::info!("Patched legacy CPUID at {:#x}", location);
    Ok(3)
}

fn patch_debug(bytes: &mut [u8], at: usize, leaf1: [u32; 4]) -> Result<usize> {
    let cpu = CpuInfo {
        leaf1,
        ..CpuInfo::default()
    };
    let features = (u64::from(leaf1[CpuInfo::ECX]) << 32) | u64::from(leaf1[CpuInfo::EDX]);
    let family = u32::from(cpu.apple_family());

    let mut stub =
        CpufamilyStub::read_from_bytes(&CPUFAMILY_STUB).map_err(|_| Error::InvalidParameter)?;
    stub.signature.set(cpu.signature());
    stub.stepping = cpu.stepping();
    stub.cpu_type.set(u32::from(cpu.cpu_type()));
    stub.family = cpu.family();
    stub.model = cpu.model();
    stub.ext_model = cpu.ext_model();
    stub.ext_family = cpu.ext_family();
    stub.features.set(features);
    stub.logical_per_package.set(cpu.logical_per_package());
    stub.apple_family1.set(family);
    stub.apple_family2.set(family);

    let dst = bytes
        .get_mut(at..at + CPUFAMILY_STUB.len())
        .ok_or(Error::OutOfResources)?;
    dst.copy_from_slice(stub.as_bytes());
    log::info!("Replaced debug cpuid_set_cpufamily at {:#x}", at);
    Ok(1)
}
