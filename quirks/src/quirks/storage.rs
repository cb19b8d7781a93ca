// SPDX-License-Identifier: MPL-2.0

//! Storage driver quirks.

use darwin_version::DarwinVersion;

use crate::{ImageContext, Result, generic::GenericPatch};

const TRIM_APPLE_SSD: GenericPatch = GenericPatch {
    comment: "ThirdPartyDrivesV1",
    find: Some(b"APPLE SSD\0"),
    replace: &[0; 10],
    count: 1,
    ..GenericPatch::EMPTY
};

const TRIM_APPLE: GenericPatch = GenericPatch {
    comment: "ThirdPartyDrivesV2",
    find: Some(b"APPLE\0"),
    replace: &[0; 6],
    count: 1,
    ..GenericPatch::EMPTY
};

/// Enables TRIM and other vendor features for non-Apple SSDs by blanking the
/// vendor string IOAHCIBlockStorage compares against.
pub(super) fn third_party_drives(
    image: &mut dyn ImageContext,
    version: DarwinVersion,
) -> Result<usize> {
    let mut status = TRIM_APPLE_SSD.apply(image);

    if version.in_range(DarwinVersion::CATALINA_MIN, DarwinVersion::ANY) {
        status = TRIM_APPLE.apply(image);
    } else {
        log::info!("Skipping ThirdPartyDrivesV2 on {}", version);
    }

    // Snow Leopard kernels before about 10.6.7 have no vendor check.
    match status {
        Err(err)
            if version.in_range(DarwinVersion::SNOW_LEOPARD_MIN, DarwinVersion::SNOW_LEOPARD_MAX) =>
        {
            log::info!("Assuming success for ThirdPartyDrives on {} - {}", version, err);
            Ok(0)
        }
        other => other,
    }
}

const EXTERNAL_TO_INTERNAL: GenericPatch = GenericPatch {
    comment: "ForceInternalDiskIcons",
    find: Some(b"External"),
    replace: b"Internal",
    count: 1,
    ..GenericPatch::EMPTY
};

/// Makes AppleAHCIPort report every disk as internal.
pub(super) fn internal_disk_icons(
    image: &mut dyn ImageContext,
    _version: DarwinVersion,
) -> Result<usize> {
    EXTERNAL_TO_INTERNAL.apply(image)
}
