// SPDX-License-Identifier: MPL-2.0

//! Walking arrays of fixed-size records embedded in an image.

use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    little_endian::{U32, U64},
};

use crate::ImageContext;

/// One entry of the XCPM MSR tables (`_xcpm_core_scope_msrs` and friends).
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Clone, Copy, Debug)]
#[repr(C)]
pub struct XcpmMsrRecord {
    pub msr_num: U32,
    pub applicable_cpus: U32,
    /// A pointer to the owner flag. Null for unconditional entries.
    pub flag_p: U64,
    pub bits_clear: U64,
    pub bits_set: U64,
    pub initial_value: U64,
    pub rb_value: U64,
}

const _: () = assert!(size_of::<XcpmMsrRecord>() == 48);

impl XcpmMsrRecord {
    /// `MSR_PKG_CST_CONFIG_CONTROL`, which carries the CFG lock bit.
    pub const PKG_CST_CONFIG_CONTROL: u32 = 0xE2;

    /// Whether the record belongs to the core-scope lock MSR.
    pub fn is_cfg_lock(&self) -> bool {
        self.msr_num.get() == Self::PKG_CST_CONFIG_CONTROL
    }

    /// Whether the record is a package-scope entry applicable to the common
    /// CPU masks.
    ///
    /// Most entries carry 0xDC or 0xDE in the low byte of the mask; masking
    /// with 0xFF0000FD matches both.
    pub fn is_package_scope(&self) -> bool {
        self.applicable_cpus.get() & 0xFF00_00FD == 0xDC
    }

    /// Whether the record applies regardless of any owner flag.
    pub fn is_unconditional(&self) -> bool {
        self.flag_p.get() == 0
    }

    /// Makes the record apply to no CPU.
    pub fn disable(&mut self) {
        self.applicable_cpus.set(0);
    }
}

/// The outcome of a record walk.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct WalkStats {
    /// The number of records the predicate accepted.
    pub matched: usize,
    /// The number of accepted records whose bytes were changed.
    pub changed: usize,
}

/// Walks records of type `R` from `start`, neutralizing each one for which
/// `predicate` holds.
///
/// The walk stops at the first rejected record, or once a record would start
/// at or after `image_size - size_of::<R>()`.
pub fn walk_records<R>(
    image: &mut dyn ImageContext,
    start: usize,
    mut predicate: impl FnMut(&R) -> bool,
    mut neutralize: impl FnMut(&mut R),
) -> WalkStats
where
    R: FromBytes + IntoBytes + KnownLayout + Immutable + Unaligned,
{
    let size = size_of::<R>();
    let bytes = image.bytes_mut();
    let last = bytes.len().saturating_sub(size);

    let mut stats = WalkStats::default();
    let mut offset = start;

    while offset < last {
        let slot = &mut bytes[offset..offset + size];
        let Ok(original) = R::read_from_bytes(slot) else {
            break;
        };
        let Ok(record) = R::mut_from_bytes(slot) else {
            break;
        };
        if !predicate(&*record) {
            break;
        }

        neutralize(&mut *record);
        stats.matched += 1;
        if record.as_bytes() != original.as_bytes() {
            stats.changed += 1;
        }
        offset += size;
    }

    stats
}

/// Walks the XCPM table at `symbol`, disabling every record accepted by
/// `predicate`. Returns `None` if the table cannot be located.
pub(crate) fn disable_xcpm_records(
    image: &mut dyn ImageContext,
    symbol: &str,
    predicate: impl Fn(&XcpmMsrRecord) -> bool,
) -> Option<WalkStats> {
    let Ok(start) = image.symbol_offset(symbol) else {
        log::warn!("Failed to locate {}", symbol);
        return None;
    };

    let stats = walk_records(
        image,
        start,
        |record: &XcpmMsrRecord| {
            let accepted = predicate(record);
            log::info!(
                "{} {} data {} {}",
                if accepted { "Replacing" } else { "Not matching" },
                symbol,
                record.msr_num.get(),
                record.applicable_cpus.get()
            );
            accepted
        },
        XcpmMsrRecord::disable,
    );
    Some(stats)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::MappedImage;

    fn record(msr: u32, cpus: u32, flag: u64) -> XcpmMsrRecord {
        XcpmMsrRecord {
            msr_num: U32::new(msr),
            applicable_cpus: U32::new(cpus),
            flag_p: U64::new(flag),
            bits_clear: U64::new(0),
            bits_set: U64::new(0),
            initial_value: U64::new(0),
            rb_value: U64::new(0),
        }
    }

    fn disable_cfg_lock(image: &mut dyn ImageContext) -> WalkStats {
        walk_records(
            image,
            0,
            XcpmMsrRecord::is_cfg_lock,
            XcpmMsrRecord::disable,
        )
    }

    fn table(records: &[XcpmMsrRecord], padding: usize) -> Vec<u8> {
        let mut bytes: Vec<u8> = records
            .iter()
            .flat_map(|record| record.as_bytes().to_vec())
            .collect();
        bytes.resize(bytes.len() + padding, 0xCC);
        bytes
    }

    #[test]
    fn layout() {
        let bytes = record(0xE2, 0x0000_00DE, 0x1122).as_bytes().to_vec();
        assert_eq!(&bytes[..4], &[0xE2, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &[0xDE, 0, 0, 0]);
        assert_eq!(&bytes[8..10], &[0x22, 0x11]);
    }

    #[test]
    fn stops_at_first_rejected_record() {
        let mut bytes = table(
            &[
                record(0xE2, 0xDC, 0),
                record(0xE2, 0xDE, 0),
                record(0x1AA, 0xDC, 0),
                record(0xE2, 0xDC, 0),
            ],
            64,
        );
        let mut image = MappedImage::without_symbols(0, &mut bytes);
        let stats = disable_cfg_lock(&mut image);
        assert_eq!(
            stats,
            WalkStats {
                matched: 2,
                changed: 2
            }
        );

        let cpus = |index: usize| {
            XcpmMsrRecord::read_from_bytes(&bytes[index * 48..(index + 1) * 48])
                .unwrap()
                .applicable_cpus
                .get()
        };
        assert_eq!(cpus(0), 0);
        assert_eq!(cpus(1), 0);
        assert_eq!(cpus(2), 0xDC);
        assert_eq!(cpus(3), 0xDC);
    }

    #[test]
    fn last_record_before_the_end_is_not_walked() {
        // The final 48 bytes of the image are never treated as a record.
        let mut bytes = table(&[record(0xE2, 0xDC, 0), record(0xE2, 0xDC, 0)], 0);
        let mut image = MappedImage::without_symbols(0, &mut bytes);
        let stats = disable_cfg_lock(&mut image);
        assert_eq!(stats.matched, 1);
    }

    #[test]
    fn second_walk_changes_nothing() {
        let mut bytes = table(&[record(0xE2, 0xDC, 0), record(0xE2, 0x04, 0)], 48);
        let mut image = MappedImage::without_symbols(0, &mut bytes);
        disable_cfg_lock(&mut image);
        let once = image.bytes().to_vec();

        let stats = disable_cfg_lock(&mut image);
        assert_eq!(
            stats,
            WalkStats {
                matched: 2,
                changed: 0
            }
        );
        assert_eq!(image.bytes(), once.as_slice());
    }

    #[test]
    fn scope_predicates() {
        assert!(record(0x1AD, 0x0000_00DE, 1).is_package_scope());
        assert!(record(0x1AD, 0x0000_00DC, 1).is_package_scope());
        assert!(!record(0x1AD, 0x0100_00DC, 1).is_package_scope());
        assert!(!record(0x1AD, 0x0000_00DF, 1).is_package_scope());
        assert!(record(0x1FC, 0, 0).is_unconditional());
        assert!(!record(0x1FC, 0, 0xFFFF_FF80_0000_1000).is_unconditional());
    }
}
