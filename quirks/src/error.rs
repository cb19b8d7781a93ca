// SPDX-License-Identifier: MPL-2.0

use core::fmt;

use byte_patch::LengthMismatch;

/// The error type which is returned from the patching APIs of this crate.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error {
    /// A symbol, a pattern or a landmark is missing from the image.
    NotFound,
    /// The image is recognized but its layout cannot be handled.
    Unsupported,
    /// The room available for relocated code is too small.
    OutOfResources,
    /// A patch descriptor or a configuration value is malformed.
    InvalidParameter,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::NotFound => "Not Found",
            Error::Unsupported => "Unsupported",
            Error::OutOfResources => "Out of Resources",
            Error::InvalidParameter => "Invalid Parameter",
        };
        f.write_str(msg)
    }
}

impl From<LengthMismatch> for Error {
    fn from(_err: LengthMismatch) -> Error {
        Error::InvalidParameter
    }
}

pub type Result<T> = core::result::Result<T, Error>;
