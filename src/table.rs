// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use devicemapper::SECTOR_SIZE;

use crate::{
    metadata::{ImageMetadata, Partition},
    result::{ErrorEnum, ImageError, ImageResult},
};

/// One line of a linear table: length sectors starting at logical sector
/// start, mapped to sector offset of device.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LinearTarget {
    /// Logical start sector within the new device
    pub start: u64,
    /// Length in sectors
    pub length: u64,
    /// Device node of the underlying device
    pub device: PathBuf,
    /// Start sector on the underlying device
    pub offset: u64,
}

impl fmt::Display for LinearTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} linear {} {}",
            self.start,
            self.length,
            self.device.display(),
            self.offset
        )
    }
}

/// A table of linear targets laid end to end.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LinearTable {
    targets: Vec<LinearTarget>,
}

impl LinearTable {
    /// An empty table.
    pub fn new() -> LinearTable {
        LinearTable::default()
    }

    /// Append length sectors of device, starting at offset, after the
    /// targets already in the table.
    pub fn push(&mut self, device: &Path, offset: u64, length: u64) {
        let start = self.num_sectors();
        self.targets.push(LinearTarget {
            start,
            length,
            device: device.to_owned(),
            offset,
        });
    }

    /// The targets in logical order
    pub fn targets(&self) -> &[LinearTarget] {
        &self.targets
    }

    /// Total length of the table in sectors
    pub fn num_sectors(&self) -> u64 {
        self.targets.iter().map(|t| t.length).sum()
    }

    /// Whether the table has no targets
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

impl fmt::Display for LinearTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for target in &self.targets {
            writeln!(f, "{target}")?;
        }
        Ok(())
    }
}

/// The table mapping a partition's recorded extents on the super block
/// device.
pub fn extent_table(metadata: &ImageMetadata, partition: &Partition) -> ImageResult<LinearTable> {
    let mut table = LinearTable::new();
    for extent in &partition.extents {
        table.push(
            metadata.super_block_device(),
            extent.physical_sector,
            extent.num_sectors,
        );
    }
    if table.is_empty() {
        return Err(ImageError::image(
            ErrorEnum::Invalid,
            format!("image {} has no extents", partition.name),
        ));
    }
    Ok(table)
}

/// The table stitching devices together, in order, to cover size bytes.
/// devices are paired with their sizes in bytes. Each device contributes
/// as much as is still needed, up to its own size; devices past the point
/// where size is covered are left out.
pub fn loop_device_table(devices: &[(PathBuf, u64)], size: u64) -> ImageResult<LinearTable> {
    let sector_size = SECTOR_SIZE as u64;
    if size % sector_size != 0 {
        return Err(ImageError::image(
            ErrorEnum::Invalid,
            format!("partition size {size} is not a multiple of {sector_size} bytes"),
        ));
    }

    let mut table = LinearTable::new();
    let mut needed = size / sector_size;
    for (device, device_size) in devices {
        let length = (device_size / sector_size).min(needed);
        table.push(device, 0, length);
        needed -= length;
        if needed == 0 {
            break;
        }
    }
    Ok(table)
}
