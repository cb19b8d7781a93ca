// SPDX-License-Identifier: MPL-2.0

//! Power management quirks.

use byte_patch::find_pattern;
use darwin_version::DarwinVersion;

use super::gate;
use crate::{
    Error, ImageContext, Result,
    emit::{self, Assembler, NOP, Register},
    generic::GenericPatch,
    image::PAGE_SIZE,
    records::{XcpmMsrRecord, disable_xcpm_records},
};

const MOV_ECX_E2: [u8; 5] = [0xB9, 0xE2, 0x00, 0x00, 0x00];
const MOV_CX_E2: [u8; 4] = [0x66, 0xB9, 0xE2, 0x00];
const WRMSR: [u8; 2] = [0x0F, 0x30];
/// The furthest a `wrmsr` may follow the `mov` of its MSR index.
const WRMSR_MAX_DISTANCE: usize = 32;

/// Disables writes to `MSR_PKG_CST_CONFIG_CONTROL` in AppleIntelCPUPowerManagement.
///
/// Every `mov ecx, 0E2h` (or `mov cx, 0E2h`) is followed for up to 32 bytes;
/// the first `wrmsr` found is replaced by `nop`s. The search from one
/// assignment stops early at `leave; ret`, `pop rbp; ret`, or another
/// assignment to `ecx`.
pub(super) fn cpu_pm_cfg_lock(image: &mut dyn ImageContext, _version: DarwinVersion) -> Result<usize> {
    let bytes = image.bytes_mut();
    let end = bytes.len().saturating_sub(WRMSR_MAX_DISTANCE);

    let mut count = 0;
    let mut walker = 0;

    while walker < end {
        if bytes[walker..].starts_with(&MOV_ECX_E2) {
            walker += MOV_ECX_E2.len();
        } else if bytes[walker..].starts_with(&MOV_CX_E2) {
            walker += MOV_CX_E2.len();
        } else {
            walker += 1;
            continue;
        }

        let stop = (walker + WRMSR_MAX_DISTANCE).min(bytes.len());
        while walker < stop {
            let rest = &bytes[walker..];
            if rest.starts_with(&WRMSR) {
                bytes[walker..walker + WRMSR.len()].fill(NOP);
                walker += WRMSR.len();
                count += 1;
                break;
            }
            if rest.starts_with(&[0xC9, 0xC3]) || rest.starts_with(&[0x5D, 0xC3]) {
                walker += 2;
                break;
            }
            if is_ecx_reassign(rest) {
                break;
            }
            walker += 1;
        }
    }

    if count > 0 {
        log::info!("Patched {} CFG lock writes", count);
        Ok(count)
    } else {
        log::info!("No CFG lock writes found");
        Err(Error::NotFound)
    }
}

// `mov ecx, 0000xxxxh` or `mov cx, 00xxh`
fn is_ecx_reassign(code: &[u8]) -> bool {
    matches!(code, [0xB9, _, _, 0x00, 0x00, ..] | [0x66, 0xB9, _, 0x00, ..])
}

const XCPM_CFG_LOCK_REL: GenericPatch = GenericPatch {
    comment: "XcpmCfgLockRel",
    base: Some("_xcpm_idle"),
    // mov ecx, 0E2h; wrmsr
    find: Some(&[0xB9, 0xE2, 0x00, 0x00, 0x00, 0x0F, 0x30]),
    replace: &[0xB9, 0xE2, 0x00, 0x00, 0x00, 0x90, 0x90],
    count: 2,
    limit: 4096,
    ..GenericPatch::EMPTY
};

const XCPM_CFG_LOCK_DBG: GenericPatch = GenericPatch {
    comment: "XcpmCfgLockDbg",
    base: Some("_xcpm_cst_control_evaluate"),
    // mov edi, 0E2h; call wrmsr64 -> jmp over the call
    find: Some(&[0xBF, 0xE2, 0x00, 0x00, 0x00, 0xE8]),
    replace: &[0xEB, 0x08, 0x90, 0x90, 0x90, 0xE8],
    count: 2,
    limit: 4096,
    ..GenericPatch::EMPTY
};

/// Disables writes to `MSR_PKG_CST_CONFIG_CONTROL` from the XCPM machinery.
pub(super) fn xcpm_cfg_lock(image: &mut dyn ImageContext, version: DarwinVersion) -> Result<usize> {
    gate!(version, DarwinVersion::MOUNTAIN_LION_MIN, DarwinVersion::ANY, "XcpmCfgLock");

    let Some(stats) =
        disable_xcpm_records(image, "_xcpm_core_scope_msrs", XcpmMsrRecord::is_cfg_lock)
    else {
        return Err(Error::NotFound);
    };

    // The HWP path in _xcpm_idle writes the MSR directly.
    if let Err(err) = XCPM_CFG_LOCK_REL.apply(image) {
        log::info!("Failed to locate _xcpm_idle release patch - {}, trying dbg", err);
        if let Err(err) = XCPM_CFG_LOCK_DBG.apply(image) {
            log::warn!("Failed to locate _xcpm_idle patches - {}", err);
        }
    }

    if stats.matched > 0 {
        Ok(stats.matched)
    } else {
        Err(Error::NotFound)
    }
}

const MISC_PWR_MGMT_REL: GenericPatch = GenericPatch {
    comment: "MiscPwrMgmtRel",
    // mov ecx, 1AAh; wrmsr
    find: Some(&[0xB9, 0xAA, 0x01, 0x00, 0x00, 0x0F, 0x30]),
    replace: &[0xB9, 0xAA, 0x01, 0x00, 0x00, 0x90, 0x90],
    ..GenericPatch::EMPTY
};

// Hits both _xcpm_hwp_enable and _xcpm_enable_hw_coordination, which is
// inlined in release kernels.
const MISC_PWR_MGMT_DBG: GenericPatch = GenericPatch {
    comment: "MiscPwrMgmtDbg",
    // mov edi, 1AAh; call wrmsr64 -> jmp over the call
    find: Some(&[0xBF, 0xAA, 0x01, 0x00, 0x00, 0xE8]),
    replace: &[0xEB, 0x08, 0x90, 0x90, 0x90, 0xE8],
    ..GenericPatch::EMPTY
};

/// Disables XCPM MSR writes that unsupported CPUs fault on.
pub(super) fn xcpm_extra_msrs(
    image: &mut dyn ImageContext,
    version: DarwinVersion,
) -> Result<usize> {
    gate!(version, DarwinVersion::MOUNTAIN_LION_MIN, DarwinVersion::ANY, "XcpmExtraMsrs");

    let mut replacements = 0;

    if let Some(stats) =
        disable_xcpm_records(image, "_xcpm_pkg_scope_msrs", XcpmMsrRecord::is_package_scope)
    {
        replacements += stats.matched;
    }
    if let Some(stats) =
        disable_xcpm_records(image, "_xcpm_SMT_scope_msrs", XcpmMsrRecord::is_unconditional)
    {
        replacements += stats.matched;
    }

    let misc = MISC_PWR_MGMT_REL.apply(image).or_else(|err| {
        log::info!("Failed to patch writes to MSR_MISC_PWR_MGMT - {}, trying dbg", err);
        MISC_PWR_MGMT_DBG.apply(image)
    });
    match misc {
        Ok(_) => {
            log::info!("Patched writes to MSR_MISC_PWR_MGMT");
            replacements += 1;
        }
        Err(err) => log::warn!("Failed to patch writes to MSR_MISC_PWR_MGMT - {}", err),
    }

    if replacements > 0 {
        Ok(replacements)
    } else {
        Err(Error::NotFound)
    }
}

/// `mov ecx, 199h` (`MSR_IA32_PERF_CONTROL`)
const PERF_CTL_PREFIX: [u8; 4] = [0xB9, 0x99, 0x01, 0x00];
/// `mov ecx, 199h; wrmsr`
const PERF_CTL_FIND1: [u8; 7] = [0xB9, 0x99, 0x01, 0x00, 0x00, 0x0F, 0x30];
/// `mov ecx, 199h; xor edx, edx; wrmsr`
const PERF_CTL_FIND2: [u8; 9] = [0xB9, 0x99, 0x01, 0x00, 0x00, 0x31, 0xD2, 0x0F, 0x30];
/// `push rbp; mov rbp, rsp`
const PROLOGUE: [u8; 4] = [0x55, 0x48, 0x89, 0xE5];

/// Makes the function writing `MSR_IA32_PERF_CONTROL` always request the
/// highest performance state.
pub(super) fn xcpm_force_boost(
    image: &mut dyn ImageContext,
    version: DarwinVersion,
) -> Result<usize> {
    gate!(version, DarwinVersion::MOUNTAIN_LION_MIN, DarwinVersion::ANY, "XcpmForceBoost");

    let bytes = image.bytes_mut();
    let last = bytes.len().saturating_sub(2 * PAGE_SIZE);

    let mut cursor = PAGE_SIZE;
    let write = loop {
        let Some(at) = find_pattern(&PERF_CTL_PREFIX, None, bytes, cursor).filter(|at| *at < last)
        else {
            log::warn!("Failed to locate MSR_IA32_PERF_CONTROL write");
            return Err(Error::NotFound);
        };
        let rest = &bytes[at..];
        if rest.starts_with(&PERF_CTL_FIND1) || rest.starts_with(&PERF_CTL_FIND2) {
            break at;
        }
        cursor = at + 1;
    };

    let lowest = write - PAGE_SIZE;
    let Some(prologue) = (lowest..=write - PROLOGUE.len())
        .rev()
        .find(|at| bytes[*at..].starts_with(&PROLOGUE))
    else {
        log::warn!("Failed to locate MSR_IA32_PERF_CONTROL prologue");
        return Err(Error::NotFound);
    };

    // mov ecx, 199h; xor edx, edx; mov eax, 0FF00h; wrmsr; ret
    let mut code = Assembler::new(prologue);
    code.mov_imm32(Register::Rcx, 0x199)?
        .xor32(Register::Rdx, Register::Rdx)?
        .mov_imm32(Register::Rax, 0xFF00)?
        .wrmsr()?
        .ret()?;
    emit::commit(bytes, &[&code])?;

    log::info!("Patched write max to MSR_IA32_PERF_CONTROL");
    Ok(1)
}

const DUMMY_CPU_PM: GenericPatch = GenericPatch {
    comment: "DummyCpuPm",
    base: Some("__ZN28AppleIntelCPUPowerManagement5startEP9IOService"),
    // mov eax, 1; ret
    replace: &[0xB8, 0x01, 0x00, 0x00, 0x00, 0xC3],
    count: 1,
    ..GenericPatch::EMPTY
};

/// Makes `AppleIntelCPUPowerManagement::start` return success immediately.
pub(super) fn dummy_power_management(
    image: &mut dyn ImageContext,
    _version: DarwinVersion,
) -> Result<usize> {
    DUMMY_CPU_PM.apply(image)
}
