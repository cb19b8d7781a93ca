// SPDX-License-Identifier: MPL-2.0

//! Firmware interface and memory layout quirks.

use darwin_version::DarwinVersion;

use super::gate;
use crate::{Error, ImageContext, Result, emit::NOP, generic::GenericPatch, image::PAGE_SIZE};

const SMBIOS_GUID: GenericPatch = GenericPatch {
    comment: "CustomSmbiosGuid",
    // The first fragment of the EB9D2D31 SMBIOS table GUID.
    find: Some(b"EB9D2D31"),
    replace: b"EB9D2D35",
    count: 1,
    ..GenericPatch::EMPTY
};

/// Makes AppleSMBIOS and AppleACPIPlatform read SMBIOS data from the
/// EB9D2D35 GUID, which only the boot loader populates.
pub(super) fn custom_smbios_guid(
    image: &mut dyn ImageContext,
    _version: DarwinVersion,
) -> Result<usize> {
    SMBIOS_GUID.apply(image)
}

// mov esi, 58h or mov esi, 59h -> mov esi, 0FFFFh
const RTC_CHECKSUM: GenericPatch = GenericPatch {
    comment: "DisableRtcChecksum",
    find: Some(&[0xBE, 0x58, 0x00, 0x00, 0x00]),
    mask: Some(&[0xFF, 0xFE, 0xFF, 0xFF, 0xFF]),
    replace: &[0xBE, 0xFF, 0xFF, 0x00, 0x00],
    count: 4,
    ..GenericPatch::EMPTY
};

/// Keeps AppleRTC from writing the checksum bytes of the primary RTC bank.
///
/// `updateChecksum` and `rtcRecordTracePoint` each write offsets 0x58 and
/// 0x59 through `rtcWrite`; the offsets are replaced with an out-of-range
/// value.
pub(super) fn disable_rtc_checksum(
    image: &mut dyn ImageContext,
    _version: DarwinVersion,
) -> Result<usize> {
    RTC_CHECKSUM.apply(image)
}

const REMOVE_KEXT_BOOTSTRAP: &str = "__ZN6OSKext19removeKextBootstrapEv";
const ML_STATIC_MFREE: &str = "_ml_static_mfree";
const JETTISONING: &[u8] = b"Jettisoning fileset";

const CALL_LEN: usize = 5;
const LEA_RDX: [u8; 3] = [0x48, 0x8D, 0x15];
const LEA_LEN: usize = 7;

/// Keeps `OSKext::removeKextBootstrap` from freeing the fileset `__LINKEDIT`
/// segment, which the boot loader may have placed kexts into.
///
/// The `call _ml_static_mfree` that precedes the `lea rdx` of the
/// "Jettisoning fileset" message is replaced with `nop`s.
pub(super) fn segment_jettison(
    image: &mut dyn ImageContext,
    version: DarwinVersion,
) -> Result<usize> {
    gate!(version, DarwinVersion::BIG_SUR_MIN, DarwinVersion::ANY, "SegmentJettison");

    let last = image.image_size().saturating_sub(2 * PAGE_SIZE);

    let remove = match image.symbol_offset(REMOVE_KEXT_BOOTSTRAP) {
        Ok(offset) if offset <= last => offset,
        _ => {
            log::info!("Missing removeKextBootstrap");
            return Err(Error::NotFound);
        }
    };
    let Ok(mfree) = image.symbol_offset(ML_STATIC_MFREE) else {
        log::info!("Missing ml_static_mfree");
        return Err(Error::NotFound);
    };

    if remove.abs_diff(mfree) > i32::MAX as usize {
        log::info!(
            "ml_static_mfree {:#x} and removeKextBootstrap {:#x} are too far",
            mfree,
            remove
        );
        return Err(Error::Unsupported);
    }

    let bytes = image.bytes_mut();
    let end = (remove + PAGE_SIZE).min(bytes.len());

    let mut free_call = None;
    for at in remove..end {
        match bytes[at..] {
            [0xE8, d0, d1, d2, d3, ..]
                if relative_target(at, CALL_LEN, [d0, d1, d2, d3]) == Some(mfree) =>
            {
                log::trace!("Found ml_static_mfree call at {:#x}", at);
                free_call = Some(at);
            }
            [l0, l1, l2, d0, d1, d2, d3, ..] if [l0, l1, l2] == LEA_RDX => {
                let Some(call) = free_call else {
                    continue;
                };
                let points_to_message = relative_target(at, LEA_LEN, [d0, d1, d2, d3])
                    .filter(|string| *string <= last)
                    .and_then(|string| bytes.get(string..))
                    .is_some_and(|string| string.starts_with(JETTISONING));
                if points_to_message {
                    log::info!("Found jettisoning fileset");
                    bytes[call..call + CALL_LEN].fill(NOP);
                    return Ok(1);
                }
            }
            _ => {}
        }
    }

    log::info!("Failed to find jettisoning fileset - {:?}", free_call);
    Err(Error::NotFound)
}

// The target of a rip-relative operand of the instruction at `at`.
fn relative_target(at: usize, len: usize, disp: [u8; 4]) -> Option<usize> {
    let disp = isize::try_from(i32::from_le_bytes(disp)).ok()?;
    (at + len).checked_add_signed(disp)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::MappedImage;

    const BASE: u64 = 0xFFFF_FF80_0000_0000;
    const BIG_SUR: DarwinVersion = DarwinVersion::new(20, 4, 0);

    const MFREE: usize = 0x100;
    const REMOVE: usize = 0x1000;
    const MESSAGE: usize = 0x1800;

    fn rel32(from: usize, to: usize) -> [u8; 4] {
        ((to as i64 - from as i64) as i32).to_le_bytes()
    }

    fn jettison_image(message: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0xCC; 4 * PAGE_SIZE];
        // call _ml_static_mfree
        bytes[REMOVE + 0x10] = 0xE8;
        bytes[REMOVE + 0x11..REMOVE + 0x15].copy_from_slice(&rel32(REMOVE + 0x15, MFREE));
        // lea rdx, aJettisoningFil
        bytes[REMOVE + 0x20..REMOVE + 0x23].copy_from_slice(&LEA_RDX);
        bytes[REMOVE + 0x23..REMOVE + 0x27].copy_from_slice(&rel32(REMOVE + 0x27, MESSAGE));
        bytes[MESSAGE..MESSAGE + message.len()].copy_from_slice(message);
        bytes
    }

    fn symbols() -> [(&'static str, u64); 2] {
        [
            (REMOVE_KEXT_BOOTSTRAP, BASE + REMOVE as u64),
            (ML_STATIC_MFREE, BASE + MFREE as u64),
        ]
    }

    #[test]
    fn nops_free_call() {
        let mut bytes = jettison_image(b"Jettisoning fileset Linkedit segments from Kernel\0");
        let symbols = symbols();
        let mut image = MappedImage::new(BASE, &mut bytes, &symbols).unwrap();

        assert_eq!(segment_jettison(&mut image, BIG_SUR), Ok(1));
        assert_eq!(&bytes[REMOVE + 0x10..REMOVE + 0x15], &[NOP; 5]);
        assert_eq!(&bytes[REMOVE + 0x20..REMOVE + 0x23], &LEA_RDX);
    }

    #[test]
    fn other_message_is_ignored() {
        let mut bytes = jettison_image(b"Removing kext bootstrap\0");
        let before = bytes.clone();
        let symbols = symbols();
        let mut image = MappedImage::new(BASE, &mut bytes, &symbols).unwrap();

        assert_eq!(segment_jettison(&mut image, BIG_SUR), Err(Error::NotFound));
        assert_eq!(bytes, before);
    }

    #[test]
    fn skipped_before_big_sur() {
        let mut bytes = jettison_image(b"Jettisoning fileset\0");
        let before = bytes.clone();
        let mut image = MappedImage::without_symbols(BASE, &mut bytes);

        assert_eq!(segment_jettison(&mut image, DarwinVersion::new(19, 6, 0)), Ok(0));
        assert_eq!(bytes, before);
    }

    #[test]
    fn rtc_checksum_offsets() {
        let mut bytes = Vec::<u8>::new();
        for offset in [0x58, 0x59, 0x58, 0x59] {
            bytes.extend_from_slice(&[0xBE, offset, 0x00, 0x00, 0x00, 0xE8, 0, 0, 0, 0]);
        }
        let mut image = MappedImage::without_symbols(BASE, &mut bytes);

        assert_eq!(disable_rtc_checksum(&mut image, BIG_SUR), Ok(4));
        assert!(
            bytes
                .chunks(10)
                .all(|call| call.starts_with(&[0xBE, 0xFF, 0xFF, 0x00, 0x00]))
        );
    }

    #[test]
    fn rtc_checksum_needs_all_sites() {
        let mut bytes = vec![0xBE, 0x58, 0x00, 0x00, 0x00];
        let mut image = MappedImage::without_symbols(BASE, &mut bytes);
        assert_eq!(disable_rtc_checksum(&mut image, BIG_SUR), Err(Error::NotFound));
    }

    #[test]
    fn smbios_guid() {
        let mut bytes = b"\0EB9D2D31-2D88-11D3-9A16-0090273FC14D\0".to_vec();
        let mut image = MappedImage::without_symbols(BASE, &mut bytes);
        assert_eq!(custom_smbios_guid(&mut image, BIG_SUR), Ok(1));
        assert!(bytes.starts_with(b"\0EB9D2D35-"));
    }
}
