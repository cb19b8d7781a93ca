// SPDX-License-Identifier: MPL-2.0

//! Processor identification data consumed by the CPUID patches.

/// A snapshot of the identification leaves of the boot processor.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct CpuInfo {
    /// The vendor string words of leaf 0 in EBX, EDX, ECX order.
    pub vendor: [u32; 3],
    /// The EAX, EBX, ECX and EDX values of leaf 1.
    pub leaf1: [u32; 4],
    /// The highest extended leaf (EAX of leaf 0x8000_0000).
    pub max_ext_leaf: u32,
    pub microcode_revision: u32,
}

/// Leaf-1 ECX feature bits.
pub mod feature_ecx {
    pub const XSAVE: u32 = 1 << 26;
    pub const OSXSAVE: u32 = 1 << 27;
    pub const AVX: u32 = 1 << 28;
}

/// Leaf-1 EDX feature bits.
pub mod feature_edx {
    pub const HTT: u32 = 1 << 28;
}

impl CpuInfo {
    pub const EAX: usize = 0;
    pub const EBX: usize = 1;
    pub const ECX: usize = 2;
    pub const EDX: usize = 3;

    /// Reads the identification leaves of the executing processor.
    ///
    /// The microcode revision needs a privileged MSR access and is left as
    /// zero. See [`read_microcode_revision`].
    #[cfg(target_arch = "x86_64")]
    pub fn detect() -> Self {
        use x86::cpuid::cpuid;

        let leaf0 = cpuid!(0);
        let leaf1 = cpuid!(1);
        let ext = cpuid!(0x8000_0000);

        Self {
            vendor: [leaf0.ebx, leaf0.edx, leaf0.ecx],
            leaf1: [leaf1.eax, leaf1.ebx, leaf1.ecx, leaf1.edx],
            max_ext_leaf: ext.eax,
            microcode_revision: 0,
        }
    }

    pub fn with_microcode_revision(mut self, revision: u32) -> Self {
        self.microcode_revision = revision;
        self
    }

    /// Returns the processor signature, i.e. leaf-1 EAX.
    pub fn signature(&self) -> u32 {
        self.leaf1[Self::EAX]
    }

    pub fn stepping(&self) -> u8 {
        (self.signature() & 0xF) as u8
    }

    /// Returns the base model, without the extended model bits.
    pub fn base_model(&self) -> u8 {
        ((self.signature() >> 4) & 0xF) as u8
    }

    pub fn family(&self) -> u8 {
        ((self.signature() >> 8) & 0xF) as u8
    }

    pub fn cpu_type(&self) -> u8 {
        ((self.signature() >> 12) & 0x3) as u8
    }

    pub fn ext_model(&self) -> u8 {
        ((self.signature() >> 16) & 0xF) as u8
    }

    pub fn ext_family(&self) -> u8 {
        ((self.signature() >> 20) & 0xFF) as u8
    }

    /// Returns the display model, which includes the extended model bits.
    pub fn model(&self) -> u8 {
        self.base_model() | (self.ext_model() << 4)
    }

    /// Returns the number of logical processors per package.
    ///
    /// Without hyper-threading support the package has exactly one.
    pub fn logical_per_package(&self) -> u32 {
        if self.leaf1[Self::EDX] & feature_edx::HTT != 0 {
            (self.leaf1[Self::EBX] >> 16) & 0xFF
        } else {
            1
        }
    }

    /// Returns the Apple CPU family value XNU would compute for this processor.
    pub fn apple_family(&self) -> AppleCpuFamily {
        AppleCpuFamily::from_signature(self.family(), self.model())
    }
}

/// Reads the microcode revision from `IA32_BIOS_SIGN_ID`.
///
/// # Safety
///
/// The caller must be running at CPL 0 on an Intel processor.
#[cfg(target_arch = "x86_64")]
pub unsafe fn read_microcode_revision() -> u32 {
    use x86::{
        cpuid::cpuid,
        msr::{IA32_BIOS_SIGN_ID, rdmsr, wrmsr},
    };

    // The revision is only latched by a CPUID(1) following a zeroing write.
    // SAFETY: The caller guarantees the privilege level and vendor.
    unsafe { wrmsr(IA32_BIOS_SIGN_ID, 0) };
    let _ = cpuid!(1);
    // SAFETY: Same as above.
    (unsafe { rdmsr(IA32_BIOS_SIGN_ID) } >> 32) as u32
}

/// The `cpufamily` values XNU exposes through `hw.cpufamily`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum AppleCpuFamily {
    Unknown = 0,
    Penryn = 0x78EA_4FBC,
    Nehalem = 0x6B5A_4CD2,
    Westmere = 0x573B_5EEC,
    SandyBridge = 0x5490_B78C,
    IvyBridge = 0x1F65_E835,
    Haswell = 0x10B2_82DC,
    Broadwell = 0x582E_D09C,
    Skylake = 0x37FC_219F,
    KabyLake = 0x0F81_7246,
    IceLake = 0x3843_5547,
    Merom = 0x426F_69EF,
    Yonah = 0x73D6_7300,
}

impl AppleCpuFamily {
    /// Maps an Intel family and display model to the XNU family.
    pub fn from_signature(family: u8, model: u8) -> Self {
        if family != 6 {
            return Self::Unknown;
        }
        match model {
            0x0E => Self::Yonah,
            0x0F | 0x16 => Self::Merom,
            0x17 | 0x1D => Self::Penryn,
            0x1A | 0x1E | 0x1F | 0x2E => Self::Nehalem,
            0x25 | 0x2C | 0x2F => Self::Westmere,
            0x2A | 0x2D => Self::SandyBridge,
            0x3A | 0x3E => Self::IvyBridge,
            0x3C | 0x3F | 0x45 | 0x46 => Self::Haswell,
            0x3D | 0x47 | 0x4F | 0x56 => Self::Broadwell,
            0x4E | 0x5E | 0x55 => Self::Skylake,
            0x8E | 0x9E | 0xA5 | 0xA6 => Self::KabyLake,
            0x7D | 0x7E => Self::IceLake,
            _ => Self::Unknown,
        }
    }
}

impl From<AppleCpuFamily> for u32 {
    fn from(family: AppleCpuFamily) -> u32 {
        family as u32
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // Core i7-8700K: family 6, model 0x9E, stepping 10.
    const COFFEE_LAKE: CpuInfo = CpuInfo {
        vendor: [0x756E_6547, 0x4965_6E69, 0x6C65_746E],
        leaf1: [0x0009_06EA, 0x0C10_0800, 0x7FFA_FBFF, 0xBFEB_FBFF],
        max_ext_leaf: 0x8000_0008,
        microcode_revision: 0xCA,
    };

    #[test]
    fn decode_signature() {
        assert_eq!(COFFEE_LAKE.stepping(), 0xA);
        assert_eq!(COFFEE_LAKE.base_model(), 0xE);
        assert_eq!(COFFEE_LAKE.ext_model(), 0x9);
        assert_eq!(COFFEE_LAKE.model(), 0x9E);
        assert_eq!(COFFEE_LAKE.family(), 6);
        assert_eq!(COFFEE_LAKE.ext_family(), 0);
        assert_eq!(COFFEE_LAKE.cpu_type(), 0);
    }

    #[test]
    fn logical_processors() {
        assert_eq!(COFFEE_LAKE.logical_per_package(), 0x10);

        let mut no_htt = COFFEE_LAKE;
        no_htt.leaf1[CpuInfo::EDX] &= !feature_edx::HTT;
        assert_eq!(no_htt.logical_per_package(), 1);
    }

    #[test]
    fn apple_families() {
        assert_eq!(COFFEE_LAKE.apple_family(), AppleCpuFamily::KabyLake);
        assert_eq!(
            AppleCpuFamily::from_signature(6, 0x3A),
            AppleCpuFamily::IvyBridge
        );
        assert_eq!(
            AppleCpuFamily::from_signature(6, 0x17),
            AppleCpuFamily::Penryn
        );
        assert_eq!(
            AppleCpuFamily::from_signature(0xF, 0x17),
            AppleCpuFamily::Unknown
        );
        assert_eq!(u32::from(AppleCpuFamily::Haswell), 0x10B2_82DC);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn detect_host() {
        let cpu = CpuInfo::detect();
        assert_ne!(cpu.vendor, [0; 3]);
        assert_ne!(cpu.family(), 0);
        assert_eq!(cpu.microcode_revision, 0);
        assert_eq!(cpu.with_microcode_revision(0x42).microcode_revision, 0x42);
    }
}
