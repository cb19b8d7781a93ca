// SPDX-License-Identifier: MPL-2.0

//! The kernel quirk registry.
//!
//! Every quirk is a patch function keyed by [`QuirkName`]. A quirk belongs
//! either to the kernel itself or to one kernel extension, named by its bundle
//! identifier. Patch functions check the kernel version first and succeed
//! without touching the image when the quirk does not apply to it.

mod misc;
mod panic;
mod pci;
mod power;
mod storage;
mod usb;

use darwin_version::DarwinVersion;

use crate::{CpuInfo, ImageContext, QuirkConfig, Result, cpuid::apply_cpuid_override};

/// The signature shared by all quirk patch functions.
///
/// On success the function returns the number of changes it made, which is
/// zero when the quirk was skipped for this kernel version.
pub type PatchFn = fn(&mut dyn ImageContext, DarwinVersion) -> Result<usize>;

/// A registry entry.
#[derive(Clone, Copy)]
pub struct KernelQuirk {
    /// The bundle identifier of the patched kext, or `None` for the kernel.
    pub identifier: Option<&'static str>,
    pub patch: PatchFn,
}

macro_rules! define_quirks {
    ($($name:ident => $identifier:expr, $patch:path;)*) => {
        /// The names of all known quirks, in registry order.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
        pub enum QuirkName {
            $($name,)*
        }

        impl QuirkName {
            /// All quirks in registry order.
            pub const ALL: &'static [QuirkName] = &[$(QuirkName::$name,)*];

            /// Returns the quirk name as used in diagnostics.
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(QuirkName::$name => stringify!($name),)*
                }
            }
        }

        /// The registry, indexed by [`QuirkName`].
        pub static QUIRKS: [KernelQuirk; QuirkName::ALL.len()] = [
            $(KernelQuirk { identifier: $identifier, patch: $patch },)*
        ];
    };
}

define_quirks! {
    AppleCpuPmCfgLock => Some(CPU_PM_KEXT), power::cpu_pm_cfg_lock;
    AppleXcpmCfgLock => None, power::xcpm_cfg_lock;
    AppleXcpmExtraMsrs => None, power::xcpm_extra_msrs;
    AppleXcpmForceBoost => None, power::xcpm_force_boost;
    CustomSmbiosGuid1 => Some("com.apple.driver.AppleSMBIOS"), misc::custom_smbios_guid;
    CustomSmbiosGuid2 => Some("com.apple.driver.AppleACPIPlatform"), misc::custom_smbios_guid;
    DisableIoMapper => Some(PCI_KEXT), pci::disable_io_mapper;
    DisableRtcChecksum => Some("com.apple.driver.AppleRTC"), misc::disable_rtc_checksum;
    DummyPowerManagement => Some(CPU_PM_KEXT), power::dummy_power_management;
    ExternalDiskIcons => Some("com.apple.driver.AppleAHCIPort"), storage::internal_disk_icons;
    IncreasePciBarSize => Some(PCI_KEXT), pci::increase_pci_bar_size;
    LapicKernelPanic => None, panic::lapic_kernel_panic;
    PanicNoKextDump => None, panic::panic_no_kext_dump;
    PowerTimeoutKernelPanic => None, panic::power_timeout_kernel_panic;
    ThirdPartyDrives => Some("com.apple.iokit.IOAHCIBlockStorage"), storage::third_party_drives;
    XhciPortLimit1 => Some("com.apple.iokit.IOUSBHostFamily"), usb::xhci_port_limit1;
    XhciPortLimit2 => Some("com.apple.driver.usb.AppleUSBXHCI"), usb::xhci_port_limit2;
    XhciPortLimit3 => Some("com.apple.driver.usb.AppleUSBXHCIPCI"), usb::xhci_port_limit3;
    SegmentJettison => None, misc::segment_jettison;
}

const CPU_PM_KEXT: &str = "com.apple.driver.AppleIntelCPUPowerManagement";
const PCI_KEXT: &str = "com.apple.iokit.IOPCIFamily";

impl QuirkName {
    pub fn entry(self) -> &'static KernelQuirk {
        &QUIRKS[self as usize]
    }

    /// Returns the bundle identifier of the patched kext, or `None` if the
    /// quirk patches the kernel.
    pub fn identifier(self) -> Option<&'static str> {
        self.entry().identifier
    }
}

/// Applies one quirk to `image`.
pub fn apply_quirk(
    name: QuirkName,
    image: &mut dyn ImageContext,
    version: DarwinVersion,
) -> Result<usize> {
    (name.entry().patch)(image, version)
}

/// The outcome of [`apply_enabled_quirks`].
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct QuirkReport {
    /// The number of quirks that succeeded, including skipped ones.
    pub applied: usize,
    /// The number of quirks that failed.
    pub failed: usize,
}

/// Applies every quirk enabled in `config` that targets `identifier` (`None`
/// for the kernel), in registry order.
///
/// A failing quirk is logged and does not stop the remaining ones.
pub fn apply_enabled_quirks(
    config: &QuirkConfig,
    identifier: Option<&str>,
    image: &mut dyn ImageContext,
    version: DarwinVersion,
) -> QuirkReport {
    let mut report = QuirkReport::default();

    if version > DarwinVersion::MONTEREY_MAX {
        log::warn!("Kernel {} is newer than all known releases, review the results", version);
    }

    for name in QuirkName::ALL.iter().copied() {
        if !config.is_enabled(name) || name.identifier() != identifier {
            continue;
        }

        match apply_quirk(name, image, version) {
            Ok(changes) => {
                log::debug!("Applied quirk {} with {} changes", name.as_str(), changes);
                report.applied += 1;
            }
            Err(err) => {
                log::warn!("Failed to apply quirk {} - {}", name.as_str(), err);
                report.failed += 1;
            }
        }
    }

    report
}

/// Applies the enabled kernel quirks and then the configured CPUID override.
///
/// The override counts as one more quirk in the report when it is configured.
pub fn apply_kernel_quirks(
    config: &QuirkConfig,
    image: &mut dyn ImageContext,
    version: DarwinVersion,
    cpu: &CpuInfo,
) -> QuirkReport {
    let mut report = apply_enabled_quirks(config, None, image, version);

    if config.has_cpuid_override() {
        match apply_cpuid_override(config, image, cpu) {
            Ok(sites) => {
                log::debug!("Applied CPUID override at {} sites", sites);
                report.applied += 1;
            }
            Err(err) => {
                log::warn!("Failed to apply CPUID override - {}", err);
                report.failed += 1;
            }
        }
    }

    report
}

/// Returns early with success when `version` is outside `[min, max]`.
macro_rules! gate {
    ($version:expr, $min:expr, $max:expr, $what:literal) => {
        if !$version.in_range($min, $max) {
            log::info!(concat!("Skipping ", $what, " on {}"), $version);
            return Ok(0);
        }
    };
}

pub(crate) use gate;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn registry_is_indexed_by_name() {
        assert_eq!(QUIRKS.len(), 19);
        for (index, name) in QuirkName::ALL.iter().enumerate() {
            assert_eq!(*name as usize, index);
            assert!(core::ptr::eq(name.entry(), &QUIRKS[index]));
        }
    }

    #[test]
    fn owners() {
        assert_eq!(QuirkName::AppleXcpmCfgLock.identifier(), None);
        assert_eq!(QuirkName::SegmentJettison.identifier(), None);
        assert_eq!(
            QuirkName::AppleCpuPmCfgLock.identifier(),
            QuirkName::DummyPowerManagement.identifier()
        );
        assert_eq!(
            QuirkName::XhciPortLimit3.identifier(),
            Some("com.apple.driver.usb.AppleUSBXHCIPCI")
        );
        assert_eq!(QuirkName::CustomSmbiosGuid2.as_str(), "CustomSmbiosGuid2");
    }
}
