// SPDX-License-Identifier: MPL-2.0

//! Raising the 15-port limit of the XHCI drivers.
//!
//! The port count is compared against `kUSBMaxPorts` (15) in several places;
//! every patch bumps one of those comparisons to 64.

use darwin_version::DarwinVersion;

use super::gate;
use crate::{ImageContext, Result, generic::GenericPatch};

const IOUSB_HOST_PORT: GenericPatch = GenericPatch {
    comment: "XhciPortLimit1",
    base: Some("__ZN16AppleUSBHostPort15setPortLocationEj"),
    // cmp reg, 0Fh; ja
    find: Some(&[0x0F, 0x0F, 0x87]),
    replace: &[0x40, 0x0F, 0x87],
    count: 1,
    limit: 4096,
    ..GenericPatch::EMPTY
};

const XHCI_CREATE_PORTS: GenericPatch = GenericPatch {
    comment: "XhciPortLimit2",
    base: Some("__ZN12AppleUSBXHCI11createPortsEv"),
    // cmp reg, 0Fh; jae
    find: Some(&[0x0F, 0x0F, 0x83]),
    replace: &[0x40, 0x0F, 0x83],
    count: 1,
    limit: 4096,
    ..GenericPatch::EMPTY
};

const XHCI_PCI_CREATE_PORTS: GenericPatch = GenericPatch {
    comment: "XhciPortLimit3",
    base: Some("__ZN15AppleUSBXHCIPCI11createPortsEv"),
    find: Some(&[0xFF, 0xFF, 0x10]),
    replace: &[0xFF, 0xFF, 0x40],
    count: 1,
    limit: 8192,
    ..GenericPatch::EMPTY
};

/// Patches `AppleUSBHostPort::setPortLocation` in IOUSBHostFamily.
pub(super) fn xhci_port_limit1(
    image: &mut dyn ImageContext,
    version: DarwinVersion,
) -> Result<usize> {
    gate!(version, DarwinVersion::new(18, 5, 0), DarwinVersion::ANY, "XhciPortLimit1");
    IOUSB_HOST_PORT.apply(image)
}

/// Patches `AppleUSBXHCI::createPorts`.
pub(super) fn xhci_port_limit2(
    image: &mut dyn ImageContext,
    version: DarwinVersion,
) -> Result<usize> {
    gate!(version, DarwinVersion::HIGH_SIERRA_MIN, DarwinVersion::ANY, "XhciPortLimit2");
    tolerate_high_sierra(XHCI_CREATE_PORTS.apply(image), version)
}

/// Patches `AppleUSBXHCIPCI::createPorts`.
pub(super) fn xhci_port_limit3(
    image: &mut dyn ImageContext,
    version: DarwinVersion,
) -> Result<usize> {
    gate!(
        version,
        DarwinVersion::EL_CAPITAN_MIN,
        DarwinVersion::HIGH_SIERRA_MAX,
        "XhciPortLimit3"
    );
    tolerate_high_sierra(XHCI_PCI_CREATE_PORTS.apply(image), version)
}

// Failures on High Sierra kernels are reported as success.
fn tolerate_high_sierra(result: Result<usize>, version: DarwinVersion) -> Result<usize> {
    match result {
        Err(err)
            if version.in_range(DarwinVersion::HIGH_SIERRA_MIN, DarwinVersion::HIGH_SIERRA_MAX) =>
        {
            log::info!("Assuming success for XHCI port limit on {} - {}", version, err);
            Ok(0)
        }
        other => other,
    }
}
