// SPDX-License-Identifier: MPL-2.0

//! Quirk selection parsed from a boot-loader command line.
//!
//! The command line is a whitespace separated list of `module.option` and
//! `module.option=value` entries, where double quotes protect whitespace:
//!
//! ```text
//! quirks.AppleXcpmCfgLock quirks.XhciPortLimit quirks.log_level=info
//! cpuid1.data=000306A9,0,0,0 cpuid1.mask=FFFFFFFF,0,0,0
//! ```
//!
//! Entries that do not belong to the quirk engine are logged and skipped.

use log::LevelFilter;

use crate::QuirkName;

bitflags::bitflags! {
    /// A set of registry entries, one bit per [`QuirkName`].
    pub struct QuirkSet: u32 {
        const APPLE_CPU_PM_CFG_LOCK = 1 << 0;
        const APPLE_XCPM_CFG_LOCK = 1 << 1;
        const APPLE_XCPM_EXTRA_MSRS = 1 << 2;
        const APPLE_XCPM_FORCE_BOOST = 1 << 3;
        const CUSTOM_SMBIOS_GUID1 = 1 << 4;
        const CUSTOM_SMBIOS_GUID2 = 1 << 5;
        const DISABLE_IO_MAPPER = 1 << 6;
        const DISABLE_RTC_CHECKSUM = 1 << 7;
        const DUMMY_POWER_MANAGEMENT = 1 << 8;
        const EXTERNAL_DISK_ICONS = 1 << 9;
        const INCREASE_PCI_BAR_SIZE = 1 << 10;
        const LAPIC_KERNEL_PANIC = 1 << 11;
        const PANIC_NO_KEXT_DUMP = 1 << 12;
        const POWER_TIMEOUT_KERNEL_PANIC = 1 << 13;
        const THIRD_PARTY_DRIVES = 1 << 14;
        const XHCI_PORT_LIMIT1 = 1 << 15;
        const XHCI_PORT_LIMIT2 = 1 << 16;
        const XHCI_PORT_LIMIT3 = 1 << 17;
        const SEGMENT_JETTISON = 1 << 18;

        const CUSTOM_SMBIOS_GUID = Self::CUSTOM_SMBIOS_GUID1.bits | Self::CUSTOM_SMBIOS_GUID2.bits;
        const XHCI_PORT_LIMIT =
            Self::XHCI_PORT_LIMIT1.bits | Self::XHCI_PORT_LIMIT2.bits | Self::XHCI_PORT_LIMIT3.bits;
    }
}

impl From<QuirkName> for QuirkSet {
    fn from(name: QuirkName) -> Self {
        Self::from_bits_truncate(1 << name as u32)
    }
}

impl QuirkSet {
    /// Looks up the user-facing name of a quirk group.
    pub fn from_config_name(name: &str) -> Option<Self> {
        let set = match name {
            "AppleCpuPmCfgLock" => Self::APPLE_CPU_PM_CFG_LOCK,
            "AppleXcpmCfgLock" => Self::APPLE_XCPM_CFG_LOCK,
            "AppleXcpmExtraMsrs" => Self::APPLE_XCPM_EXTRA_MSRS,
            "AppleXcpmForceBoost" => Self::APPLE_XCPM_FORCE_BOOST,
            "CustomSmbiosGuid" => Self::CUSTOM_SMBIOS_GUID,
            "DisableIoMapper" => Self::DISABLE_IO_MAPPER,
            "DisableRtcChecksum" => Self::DISABLE_RTC_CHECKSUM,
            "DummyPowerManagement" => Self::DUMMY_POWER_MANAGEMENT,
            "ExternalDiskIcons" => Self::EXTERNAL_DISK_ICONS,
            "IncreasePciBarSize" => Self::INCREASE_PCI_BAR_SIZE,
            "LapicKernelPanic" => Self::LAPIC_KERNEL_PANIC,
            "PanicNoKextDump" => Self::PANIC_NO_KEXT_DUMP,
            "PowerTimeoutKernelPanic" => Self::POWER_TIMEOUT_KERNEL_PANIC,
            "ThirdPartyDrives" => Self::THIRD_PARTY_DRIVES,
            "XhciPortLimit" => Self::XHCI_PORT_LIMIT,
            "SegmentJettison" => Self::SEGMENT_JETTISON,
            _ => return None,
        };
        Some(set)
    }
}

/// The quirk engine configuration.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct QuirkConfig {
    pub quirks: QuirkSet,
    /// The level requested with `quirks.log_level`, if any.
    pub log_level: Option<LevelFilter>,
    /// The leaf-1 values to report, in EAX, EBX, ECX, EDX order.
    pub cpuid_data: [u32; 4],
    /// The bits of `cpuid_data` that replace the detected values.
    pub cpuid_mask: [u32; 4],
}

impl Default for QuirkConfig {
    fn default() -> Self {
        Self {
            quirks: QuirkSet::empty(),
            log_level: None,
            cpuid_data: [0; 4],
            cpuid_mask: [0; 4],
        }
    }
}

impl QuirkConfig {
    pub fn is_enabled(&self, name: QuirkName) -> bool {
        self.quirks.contains(QuirkSet::from(name))
    }

    /// Whether a CPUID override was requested.
    pub fn has_cpuid_override(&self) -> bool {
        self.cpuid_mask.iter().any(|mask| *mask != 0)
    }
}

// Splits the command line by whitespace, keeping quoted whitespace.
fn split_arg(input: &str) -> impl Iterator<Item = &str> {
    let mut inside_quotes = false;

    input
        .split(move |c: char| {
            if c == '"' {
                inside_quotes = !inside_quotes;
            }
            !inside_quotes && c.is_whitespace()
        })
        .filter(|arg| !arg.is_empty())
}

impl From<&str> for QuirkConfig {
    fn from(cmdline: &str) -> Self {
        let mut config = QuirkConfig::default();

        for arg in split_arg(cmdline) {
            // Arg => Module "." Option | Module "." Option "=" Value
            let (entry, value) = match arg.split_once('=') {
                Some((entry, value)) => (entry, Some(value.trim_matches('"'))),
                None => (arg, None),
            };
            let Some((module, option)) = entry.split_once('.') else {
                log::warn!("Unable to parse argument {}, skipping", arg);
                continue;
            };

            match (module, option, value) {
                ("quirks", "log_level", Some(value)) => {
                    config.log_level = Some(parse_log_level(value));
                }
                ("quirks", name, None) => match QuirkSet::from_config_name(name) {
                    Some(set) => config.quirks |= set,
                    None => log::warn!("Unknown quirk {}, skipping", name),
                },
                ("cpuid1", "data", Some(value)) => match parse_words(value) {
                    Some(words) => config.cpuid_data = words,
                    None => log::warn!("Malformed CPUID data {}, skipping", value),
                },
                ("cpuid1", "mask", Some(value)) => match parse_words(value) {
                    Some(words) => config.cpuid_mask = words,
                    None => log::warn!("Malformed CPUID mask {}, skipping", value),
                },
                _ => log::warn!("Unknown argument {}, skipping", arg),
            }
        }

        config
    }
}

fn parse_log_level(value: &str) -> LevelFilter {
    match value {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        // Otherwise, OFF
        _ => LevelFilter::Off,
    }
}

// Parses exactly four comma separated hex words.
fn parse_words(value: &str) -> Option<[u32; 4]> {
    let mut words = [0u32; 4];
    let mut parts = value.split(',');

    for word in words.iter_mut() {
        let part = parts.next()?.trim();
        let digits = part
            .strip_prefix("0x")
            .or_else(|| part.strip_prefix("0X"))
            .unwrap_or(part);
        *word = u32::from_str_radix(digits, 16).ok()?;
    }

    if parts.next().is_some() {
        return None;
    }
    Some(words)
}
