// SPDX-License-Identifier: MPL-2.0

//! IOPCIFamily quirks.

use darwin_version::DarwinVersion;

use super::gate;
use crate::{ImageContext, Result, generic::GenericPatch};

const DMAR_TO_RAMD: GenericPatch = GenericPatch {
    comment: "DisableIoMapper",
    find: Some(b"DMAR\0"),
    replace: b"RAMD\0",
    count: 1,
    ..GenericPatch::EMPTY
};

/// Hides the ACPI DMAR table from the I/O mapper.
pub(super) fn disable_io_mapper(
    image: &mut dyn ImageContext,
    version: DarwinVersion,
) -> Result<usize> {
    gate!(version, DarwinVersion::MOUNTAIN_LION_MIN, DarwinVersion::ANY, "DisableIoMapper");
    DMAR_TO_RAMD.apply(image)
}

const PROBE_BAR: &str = "__ZN17IOPCIConfigurator24probeBaseAddressRegisterEP16IOPCIConfigEntryjj";

// The 1 GB BAR size cap, raised to 2 GB.
const BAR_SIZE: GenericPatch = GenericPatch {
    comment: "IncreasePciBarSize",
    base: Some(PROBE_BAR),
    find: Some(&[0x00, 0x00, 0x00, 0x40]),
    replace: &[0x00, 0x00, 0x00, 0x80],
    count: 1,
    limit: 4096,
    ..GenericPatch::EMPTY
};

const BAR_SIZE_LEGACY: GenericPatch = GenericPatch {
    comment: "IncreasePciBarSizeLegacy",
    find: Some(&[0x01, 0x00, 0x00, 0x40]),
    replace: &[0x01, 0x00, 0x00, 0x80],
    ..BAR_SIZE
};

/// Raises the largest PCI BAR size IOPCIFamily accepts.
pub(super) fn increase_pci_bar_size(
    image: &mut dyn ImageContext,
    version: DarwinVersion,
) -> Result<usize> {
    gate!(version, DarwinVersion::YOSEMITE_MIN, DarwinVersion::ANY, "IncreasePciBarSize");

    BAR_SIZE.apply(image).or_else(|err| {
        log::info!("Failed to patch PCI BAR size - {}, trying legacy", err);
        BAR_SIZE_LEGACY.apply(image)
    })
}
