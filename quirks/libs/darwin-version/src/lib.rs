// SPDX-License-Identifier: MPL-2.0

//! Darwin kernel versions.
//!
//! A Darwin version `major.minor.patch` is packed into a single integer as
//! `major * 10000 + minor * 100 + patch`, so that versions compare in release
//! order with plain integer comparison. The value zero is reserved as
//! [`DarwinVersion::ANY`], which stands for "no upper bound" when used as the
//! end of a range.
//!
//! ```
//! use darwin_version::DarwinVersion;
//!
//! let catalina: DarwinVersion = "19.6.0".parse().unwrap();
//! assert!(catalina.in_range(DarwinVersion::CATALINA_MIN, DarwinVersion::ANY));
//! assert!(!catalina.in_range(DarwinVersion::BIG_SUR_MIN, DarwinVersion::ANY));
//! ```

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

use core::{fmt, str::FromStr};

/// A packed Darwin kernel version.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct DarwinVersion(u32);

impl DarwinVersion {
    /// The wildcard version. As the upper end of a range it means "unbounded".
    pub const ANY: Self = Self(0);

    /// Creates a version from its components.
    ///
    /// `minor` and `patch` are expected to be below 100; larger values spill
    /// into the next component. Components too large for the packed form
    /// saturate at `u32::MAX`.
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self(
            major
                .saturating_mul(10000)
                .saturating_add(minor.saturating_mul(100))
                .saturating_add(patch),
        )
    }

    /// Creates a version from its packed representation.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u32 {
        self.0
    }

    pub const fn major(self) -> u32 {
        self.0 / 10000
    }

    pub const fn minor(self) -> u32 {
        self.0 / 100 % 100
    }

    pub const fn patch(self) -> u32 {
        self.0 % 100
    }

    /// Returns whether `self` lies within `[min, max]`.
    ///
    /// A `max` of [`DarwinVersion::ANY`] leaves the range open at the top.
    pub const fn in_range(self, min: Self, max: Self) -> bool {
        self.0 >= min.0 && (max.0 == Self::ANY.0 || self.0 <= max.0)
    }

    /// Extracts the version from a kernel banner such as
    /// `Darwin Kernel Version 19.6.0: Thu Jun 18 20:49:00 PDT 2020; ...`.
    pub fn from_kernel_banner(banner: &str) -> Result<Self, ParseError> {
        const PREFIX: &str = "Darwin Kernel Version ";

        let start = banner.find(PREFIX).ok_or(ParseError::NoBanner)?;
        let rest = &banner[start + PREFIX.len()..];
        let end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        rest[..end].parse()
    }
}

// Release ranges. Each maximum is one below the next release's minimum.
impl DarwinVersion {
    pub const SNOW_LEOPARD_MIN: Self = Self::new(10, 0, 0);
    pub const SNOW_LEOPARD_MAX: Self = Self(Self::LION_MIN.0 - 1);
    pub const LION_MIN: Self = Self::new(11, 0, 0);
    pub const LION_MAX: Self = Self(Self::MOUNTAIN_LION_MIN.0 - 1);
    pub const MOUNTAIN_LION_MIN: Self = Self::new(12, 0, 0);
    pub const MOUNTAIN_LION_MAX: Self = Self(Self::MAVERICKS_MIN.0 - 1);
    pub const MAVERICKS_MIN: Self = Self::new(13, 0, 0);
    pub const MAVERICKS_MAX: Self = Self(Self::YOSEMITE_MIN.0 - 1);
    pub const YOSEMITE_MIN: Self = Self::new(14, 0, 0);
    pub const YOSEMITE_MAX: Self = Self(Self::EL_CAPITAN_MIN.0 - 1);
    pub const EL_CAPITAN_MIN: Self = Self::new(15, 0, 0);
    pub const EL_CAPITAN_MAX: Self = Self(Self::SIERRA_MIN.0 - 1);
    pub const SIERRA_MIN: Self = Self::new(16, 0, 0);
    pub const SIERRA_MAX: Self = Self(Self::HIGH_SIERRA_MIN.0 - 1);
    pub const HIGH_SIERRA_MIN: Self = Self::new(17, 0, 0);
    pub const HIGH_SIERRA_MAX: Self = Self(Self::MOJAVE_MIN.0 - 1);
    pub const MOJAVE_MIN: Self = Self::new(18, 0, 0);
    pub const MOJAVE_MAX: Self = Self(Self::CATALINA_MIN.0 - 1);
    pub const CATALINA_MIN: Self = Self::new(19, 0, 0);
    pub const CATALINA_MAX: Self = Self(Self::BIG_SUR_MIN.0 - 1);
    pub const BIG_SUR_MIN: Self = Self::new(20, 0, 0);
    pub const BIG_SUR_MAX: Self = Self(Self::MONTEREY_MIN.0 - 1);
    pub const MONTEREY_MIN: Self = Self::new(21, 0, 0);
    pub const MONTEREY_MAX: Self = Self(Self::new(22, 0, 0).0 - 1);
}

impl fmt::Display for DarwinVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major(), self.minor(), self.patch())
    }
}

/// Errors of parsing a Darwin version string.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ParseError {
    /// The string is empty or a component is not a decimal number.
    InvalidDigit,
    /// There are more than three components.
    TooManyComponents,
    /// The major version is zero or a component is too large to pack.
    OutOfRange,
    /// The banner does not contain `Darwin Kernel Version`.
    NoBanner,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::InvalidDigit => "invalid version component",
            Self::TooManyComponents => "too many version components",
            Self::OutOfRange => "version component out of range",
            Self::NoBanner => "no kernel version banner",
        };
        f.write_str(msg)
    }
}

/// Parses `major[.minor[.patch]]`. Missing components are zero.
impl FromStr for DarwinVersion {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = [0u32; 3];
        let mut components = s.split('.');

        for part in parts.iter_mut() {
            let Some(component) = components.next() else {
                break;
            };
            if component.is_empty() || !component.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ParseError::InvalidDigit);
            }
            *part = component.parse().map_err(|_| ParseError::OutOfRange)?;
        }
        if components.next().is_some() {
            return Err(ParseError::TooManyComponents);
        }

        let [major, minor, patch] = parts;
        if major == 0 || major > 99 || minor > 99 || patch > 99 {
            return Err(ParseError::OutOfRange);
        }
        Ok(Self::new(major, minor, patch))
    }
}
