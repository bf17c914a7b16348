// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};

use devicemapper::SECTOR_SIZE;

use crate::{fiemap::Extent, metadata::LinearExtent, result::ImageResult};

/// Progress callback, called with bytes done and bytes total.
pub type ProgressFn<'a> = &'a mut dyn FnMut(u64, u64);

/// The block device holding a file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockDevice {
    /// Path of the device node
    pub path: PathBuf,
    /// Whether a device-mapper linear target may be layered over the
    /// device. True when the filesystem sits on a device-mapper node
    /// that can be resolved to the partition beneath it.
    pub can_use_device_mapper: bool,
}

impl BlockDevice {
    /// Make a new BlockDevice.
    pub fn new<P: AsRef<Path>>(path: P, can_use_device_mapper: bool) -> BlockDevice {
        BlockDevice {
            path: path.as_ref().to_owned(),
            can_use_device_mapper,
        }
    }

    /// Whether the device node is itself a device-mapper device.
    pub fn is_device_mapper(&self) -> bool {
        is_device_mapper_node(&self.path)
    }
}

/// Whether a device node path names a device-mapper device.
pub fn is_device_mapper_node(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with("dm-"))
}

/// The files and extents of a backing image.
#[derive(Clone, Debug)]
pub struct BackingFile {
    header: PathBuf,
    files: Vec<PathBuf>,
    size: u64,
    block_device: PathBuf,
    extents: Vec<Extent>,
}

impl BackingFile {
    /// Describe a backing image. extents are the extents of all files,
    /// in file order.
    pub fn new(
        header: &Path,
        files: Vec<PathBuf>,
        size: u64,
        block_device: &Path,
        extents: Vec<Extent>,
    ) -> BackingFile {
        BackingFile {
            header: header.to_owned(),
            files,
            size,
            block_device: block_device.to_owned(),
            extents,
        }
    }

    /// The header file of the image
    pub fn header(&self) -> &Path {
        &self.header
    }

    /// The files holding the data of the image, in order
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// The size of the image in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The block device holding the files
    pub fn block_device(&self) -> &Path {
        &self.block_device
    }

    /// The extents of the image, in logical order
    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    /// Whether every extent is fixed on the block device and together the
    /// extents cover the image.
    pub fn has_pinned_extents(&self) -> bool {
        !self.extents.is_empty()
            && self.extents.iter().all(Extent::is_pinned)
            && self.extents.iter().map(|e| e.length).sum::<u64>() >= self.size
    }

    /// The extents as sector ranges on the block device, trimmed so that
    /// they cover the image size rounded up to a whole sector.
    pub fn linear_extents(&self) -> Vec<LinearExtent> {
        let sector_size = SECTOR_SIZE as u64;
        let mut needed = self.size.div_ceil(sector_size);
        let mut linear = Vec::with_capacity(self.extents.len());
        for extent in &self.extents {
            if needed == 0 {
                break;
            }
            let num_sectors = (extent.length / sector_size).min(needed);
            let start = extent.physical / sector_size;
            linear.push(LinearExtent::new(start, num_sectors));
            needed -= num_sectors;
        }
        linear
    }
}

/// Allocates backing files with fixed extents.
pub trait ExtentWriter {
    /// Allocate size bytes of zeroed storage for the image whose header
    /// file is header, split across several files if the filesystem
    /// requires it.
    fn create(
        &self,
        header: &Path,
        size: u64,
        progress: Option<ProgressFn<'_>>,
    ) -> ImageResult<BackingFile>;

    /// Describe an existing image.
    fn open(&self, header: &Path) -> ImageResult<BackingFile>;

    /// The block device holding path.
    fn block_device_for_file(&self, path: &Path) -> ImageResult<BlockDevice>;

    /// The files making up the image with the given header, in order.
    fn split_file_list(&self, header: &Path) -> ImageResult<Vec<PathBuf>>;

    /// Remove every file making up the image with the given header.
    fn remove_split_files(&self, header: &Path) -> ImageResult<()>;
}
