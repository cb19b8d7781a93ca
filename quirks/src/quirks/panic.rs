// SPDX-License-Identifier: MPL-2.0

//! Quirks that keep the kernel from panicking or from bloating panic logs.

use darwin_version::DarwinVersion;

use super::gate;
use crate::{Error, ImageContext, Result, generic::GenericPatch, image::PAGE_SIZE};

const LAPIC_INTERRUPT: &str = "_lapic_interrupt";

const LAPIC: GenericPatch = GenericPatch {
    comment: "LapicKernelPanic",
    base: Some(LAPIC_INTERRUPT),
    // mov eax, gs:18h/1Ch/20h; cmp eax, cs:_master_cpu
    find: Some(&[
        0x65, 0x8B, 0x04, 0x25, 0x00, 0x00, 0x00, 0x00, 0x3B, 0x00, 0x00, 0x00, 0x00, 0x00,
    ]),
    mask: Some(&[
        0xFF, 0xFF, 0xFF, 0xFF, 0xC3, 0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00, 0x00,
    ]),
    // xor eax, eax
    replace: &[
        0x31, 0xC0, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90,
    ],
    count: 1,
    limit: 1024,
    ..GenericPatch::EMPTY
};

const LAPIC_LEGACY: GenericPatch = GenericPatch {
    comment: "LapicKernelPanicLegacy",
    // mov eax, gs:14h/1Ch; lea rcx, _master_cpu; cmp eax, [rcx]
    find: Some(&[
        0x65, 0x8B, 0x04, 0x25, 0x10, 0x00, 0x00, 0x00, 0x48, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00,
    ]),
    mask: Some(&[
        0xFF, 0xFF, 0xFF, 0xFF, 0xF3, 0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00,
    ]),
    replace: &[
        0x31, 0xC0, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90,
        0x90, 0x90, 0x90,
    ],
    ..LAPIC
};

const LAPIC_MASTER: GenericPatch = GenericPatch {
    comment: "LapicKernelPanicMaster",
    // cmp cs:_debug_boot_arg, 0
    find: Some(&[0x83, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]),
    mask: Some(&[0xFF, 0x00, 0x00, 0x00, 0x00, 0xFF, 0xFF]),
    replace: &[0x31, 0xC0, 0x90, 0x90, 0x90, 0x90, 0x90],
    limit: 4096,
    ..LAPIC
};

/// Stops `lapic_interrupt` from panicking when a non-master core receives an
/// interrupt.
pub(super) fn lapic_kernel_panic(
    image: &mut dyn ImageContext,
    _version: DarwinVersion,
) -> Result<usize> {
    match LAPIC.apply(image) {
        Ok(changes) => {
            log::info!("Patch success lapic");
            // Drops the need for lapic_dont_panic=1. Rarely needed.
            match LAPIC_MASTER.apply(image) {
                Ok(more) => Ok(changes + more),
                Err(err) => {
                    log::info!("Failed to apply extended lapic patch - {}", err);
                    Ok(changes)
                }
            }
        }
        Err(err) => {
            log::info!("Failed to apply modern lapic patch - {}", err);
            LAPIC_LEGACY.apply(image).inspect_err(|err| {
                log::info!("Failed to apply legacy lapic patch - {}", err);
            })
        }
    }
}

const PRINT_KEXT_PANIC_LISTS: &str = "__ZN6OSKext19printKextPanicListsEPFiPKczE";

// 10.13 and 10.14 release kernels print the list inline.
const INLINE_KEXT_DUMP: GenericPatch = GenericPatch {
    comment: "PanicKextDump",
    find: Some(b"\0%.*s\0"),
    replace: b"\0\0.*s\0",
    count: 1,
    ..GenericPatch::EMPTY
};

/// Removes the kext list from panic logs.
pub(super) fn panic_no_kext_dump(
    image: &mut dyn ImageContext,
    version: DarwinVersion,
) -> Result<usize> {
    gate!(version, DarwinVersion::HIGH_SIERRA_MIN, DarwinVersion::ANY, "PanicNoKextDump");

    let last = image.image_size().saturating_sub(PAGE_SIZE);
    let record = match image.symbol_offset(PRINT_KEXT_PANIC_LISTS) {
        Ok(offset) if offset < last => offset,
        _ => {
            log::warn!("Failed to locate printKextPanicLists");
            return Err(Error::NotFound);
        }
    };

    // ret
    image.bytes_mut()[record] = 0xC3;

    match INLINE_KEXT_DUMP.apply(image) {
        Ok(_) => Ok(2),
        Err(err) => {
            log::info!("Failed to apply kext dump patch - {}", err);
            Ok(1)
        }
    }
}

const POWER_STATE_TIMEOUT: GenericPatch = GenericPatch {
    comment: "PowerStateTimeout",
    find: Some(b"com.apple\0"),
    replace: b"not.apple\0",
    count: 1,
    ..GenericPatch::EMPTY
};

/// Stops the kernel from panicking when an Apple driver misses its power
/// state change deadline.
pub(super) fn power_timeout_kernel_panic(
    image: &mut dyn ImageContext,
    version: DarwinVersion,
) -> Result<usize> {
    gate!(version, DarwinVersion::CATALINA_MIN, DarwinVersion::ANY, "PowerTimeoutKernelPanic");
    POWER_STATE_TIMEOUT.apply(image)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::MappedImage;

    const BASE: u64 = 0xFFFF_FF80_0020_0000;
    const CATALINA: DarwinVersion = DarwinVersion::new(19, 4, 0);

    #[test]
    fn modern_lapic() {
        let mut bytes = vec![0xCC; 128];
        // mov eax, gs:18h; cmp eax, cs:_master_cpu
        let code = [
            0x65, 0x8B, 0x04, 0x25, 0x18, 0x00, 0x00, 0x00, 0x3B, 0x05, 0x44, 0x33, 0x22, 0x11,
        ];
        bytes[0x30..0x3E].copy_from_slice(&code);
        // cmp cs:_debug_boot_arg, 0
        bytes[0x50..0x57].copy_from_slice(&[0x83, 0x3D, 0x10, 0x20, 0x30, 0x00, 0x00]);
        let symbols = [(LAPIC_INTERRUPT, BASE + 0x10)];
        let mut image = MappedImage::new(BASE, &mut bytes, &symbols).unwrap();

        assert_eq!(lapic_kernel_panic(&mut image, CATALINA), Ok(2));
        assert_eq!(&bytes[0x30..0x32], &[0x31, 0xC0]);
        assert!(bytes[0x32..0x3E].iter().all(|byte| *byte == 0x90));
        assert_eq!(&bytes[0x50..0x52], &[0x31, 0xC0]);
    }

    #[test]
    fn legacy_lapic() {
        let mut bytes = vec![0xCC; 64];
        // mov eax, gs:14h; lea rcx, _master_cpu; cmp eax, [rcx]
        let code = [
            0x65, 0x8B, 0x04, 0x25, 0x14, 0x00, 0x00, 0x00, 0x48, 0x8D, 0x0D, 0x01, 0x02, 0x03,
            0x04, 0x3B, 0x01,
        ];
        bytes[8..25].copy_from_slice(&code);
        let symbols = [(LAPIC_INTERRUPT, BASE)];
        let mut image = MappedImage::new(BASE, &mut bytes, &symbols).unwrap();

        assert_eq!(lapic_kernel_panic(&mut image, CATALINA), Ok(1));
        assert_eq!(&bytes[8..10], &[0x31, 0xC0]);
        assert!(bytes[10..25].iter().all(|byte| *byte == 0x90));
    }

    #[test]
    fn kext_dump() {
        let mut bytes = vec![0x55; 2 * PAGE_SIZE];
        bytes[0x200..0x206].copy_from_slice(b"\0%.*s\0");
        let symbols = [(PRINT_KEXT_PANIC_LISTS, BASE + 0x100)];
        let mut image = MappedImage::new(BASE, &mut bytes, &symbols).unwrap();

        assert_eq!(panic_no_kext_dump(&mut image, CATALINA), Ok(2));
        assert_eq!(bytes[0x100], 0xC3);
        assert_eq!(&bytes[0x200..0x206], b"\0\0.*s\0");
    }

    #[test]
    fn kext_dump_symbol_in_last_page() {
        let mut bytes = vec![0x55; 2 * PAGE_SIZE];
        let symbols = [(PRINT_KEXT_PANIC_LISTS, BASE + PAGE_SIZE as u64)];
        let mut image = MappedImage::new(BASE, &mut bytes, &symbols).unwrap();

        assert_eq!(panic_no_kext_dump(&mut image, CATALINA), Err(Error::NotFound));
        assert!(bytes.iter().all(|byte| *byte == 0x55));
    }

    #[test]
    fn power_timeout_gate() {
        let mut bytes = b"\0com.apple\0".to_vec();
        let mut image = MappedImage::without_symbols(BASE, &mut bytes);
        assert_eq!(
            power_timeout_kernel_panic(&mut image, DarwinVersion::new(18, 7, 0)),
            Ok(0)
        );
        assert_eq!(power_timeout_kernel_panic(&mut image, CATALINA), Ok(1));
        assert_eq!(bytes, b"\0not.apple\0");
    }
}
