// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{error::Error, fmt, io};

use devicemapper::DmError;

/// A very simple breakdown of image management errors.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ErrorEnum {
    /// generic error code
    Error,
    /// invalid value passed as argument
    Invalid,
    /// something not found
    NotFound,
    /// something that should be absent is already present
    AlreadyExists,
    /// the image is in use by a mapping
    Busy,
    /// a deadline elapsed before the kernel responded
    Timeout,
}

impl fmt::Display for ErrorEnum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Super error type, distinguishing image state errors from errors
/// surfaced by the kernel or the filesystem.
#[derive(Debug)]
pub enum ImageError {
    /// Errors in image state or arguments, detected before any side effect
    Image(ErrorEnum, String),
    /// Errors returned by the devicemapper library
    Dm(DmError),
    /// IO errors, with the operation that failed
    Io(String),
    /// Errors returned by system calls
    Nix(nix::Error),
}

/// return result for image management functions
pub type ImageResult<T> = Result<T, ImageError>;

impl ImageError {
    /// Construct an Image error of the given kind.
    pub fn image<S: Into<String>>(kind: ErrorEnum, msg: S) -> ImageError {
        ImageError::Image(kind, msg.into())
    }

    /// The kind of this error, if it is an Image error.
    pub fn kind(&self) -> Option<&ErrorEnum> {
        match self {
            ImageError::Image(kind, _) => Some(kind),
            _ => None,
        }
    }

    /// Wrap an IO error with a description of what was being attempted.
    pub fn io<S: fmt::Display>(context: S, err: io::Error) -> ImageError {
        ImageError::Io(format!("{context}: {err}"))
    }
}

impl From<DmError> for ImageError {
    fn from(err: DmError) -> ImageError {
        ImageError::Dm(err)
    }
}

impl From<io::Error> for ImageError {
    fn from(err: io::Error) -> ImageError {
        ImageError::Io(err.to_string())
    }
}

impl From<nix::Error> for ImageError {
    fn from(err: nix::Error) -> ImageError {
        ImageError::Nix(err)
    }
}

impl From<serde_json::Error> for ImageError {
    fn from(err: serde_json::Error) -> ImageError {
        ImageError::Io(format!("malformed metadata: {err}"))
    }
}

impl From<tempfile::PersistError> for ImageError {
    fn from(err: tempfile::PersistError) -> ImageError {
        ImageError::Io(format!(
            "failed to persist {}: {}",
            err.file.path().display(),
            err.error
        ))
    }
}

impl fmt::Display for ImageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ImageError::Image(ref kind, ref msg) => write!(f, "image error: {kind}: {msg}"),
            ImageError::Dm(ref err) => write!(f, "{err}"),
            ImageError::Io(ref msg) => write!(f, "IO error: {msg}"),
            ImageError::Nix(ref err) => write!(f, "system call failed: {err}"),
        }
    }
}

impl Error for ImageError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ImageError::Dm(err) => Some(err),
            ImageError::Nix(err) => Some(err),
            _ => None,
        }
    }
}
