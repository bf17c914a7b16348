// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The per-image status file.
//!
//! The status file has one entry per line, each formatted as one of:
//!
//! ```text
//! dm:<name>
//! loop:<path>
//! ```
//!
//! A mapping is torn down by undoing each entry in the order it appears.
//! A device-mapper node is always listed before the loop devices beneath it.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use crate::{
    result::{ImageError, ImageResult},
    util::{remove_file_if_exists, write_atomic},
};

const DM_KIND: &str = "dm";
const LOOP_KIND: &str = "loop";

/// One kernel resource implementing a mapping.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StatusEntry {
    /// A device-mapper node, by name
    DeviceMapper(String),
    /// A loop device, by device node path
    Loop(PathBuf),
}

impl fmt::Display for StatusEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusEntry::DeviceMapper(name) => write!(f, "{DM_KIND}:{name}"),
            StatusEntry::Loop(path) => write!(f, "{LOOP_KIND}:{}", path.display()),
        }
    }
}

/// The ordered list of kernel resources implementing a mapping.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StatusRecord {
    entries: Vec<StatusEntry>,
}

impl StatusRecord {
    /// A mapping made of a single device-mapper node.
    pub fn device_mapper(name: &str) -> StatusRecord {
        StatusRecord {
            entries: vec![StatusEntry::DeviceMapper(name.to_owned())],
        }
    }

    /// A mapping made of a single loop device.
    pub fn single_loop(device: &Path) -> StatusRecord {
        StatusRecord {
            entries: vec![StatusEntry::Loop(device.to_owned())],
        }
    }

    /// A device-mapper node stitching together loop devices, listed in
    /// attachment order.
    pub fn stitched_loops(name: &str, devices: &[PathBuf]) -> StatusRecord {
        let entries = std::iter::once(StatusEntry::DeviceMapper(name.to_owned()))
            .chain(devices.iter().cloned().map(StatusEntry::Loop))
            .collect();
        StatusRecord { entries }
    }

    /// The entries in teardown order.
    pub fn entries(&self) -> &[StatusEntry] {
        &self.entries
    }

    /// Parse the contents of a status file. Blank lines are ignored;
    /// malformed lines and unknown kinds are logged and skipped.
    pub fn parse(contents: &str) -> StatusRecord {
        let mut entries = Vec::new();
        for line in contents.lines().filter(|l| !l.is_empty()) {
            match line.split_once(':') {
                Some((DM_KIND, name)) if !name.is_empty() => {
                    entries.push(StatusEntry::DeviceMapper(name.to_owned()))
                }
                Some((LOOP_KIND, path)) if !path.is_empty() => {
                    entries.push(StatusEntry::Loop(PathBuf::from(path)))
                }
                Some((kind, _)) => error!("Unknown status: {}", kind),
                None => error!("Unknown status line: {}", line),
            }
        }
        StatusRecord { entries }
    }

    /// Read the status file at path.
    pub fn read(path: &Path) -> ImageResult<StatusRecord> {
        fs::read_to_string(path)
            .map(|contents| StatusRecord::parse(&contents))
            .map_err(|err| ImageError::io(format!("read failed: {}", path.display()), err))
    }

    /// Write the record to path, replacing any previous record.
    pub fn write(&self, path: &Path) -> ImageResult<()> {
        write_atomic(path, self.to_string().as_bytes())
    }

    /// Remove the status file at path, if any.
    pub fn remove(path: &Path) -> ImageResult<bool> {
        remove_file_if_exists(path)
    }
}

/// Lines joined by newlines, with no trailing newline.
impl fmt::Display for StatusRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, entry) in self.entries.iter().enumerate() {
            if index > 0 {
                writeln!(f)?;
            }
            write!(f, "{entry}")?;
        }
        Ok(())
    }
}
