// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! File-backed disk images, mapped as block devices of the running kernel.
//!
//! # Overview
//!
//! A backing image is one or more ordinary files on a data volume, whose
//! blocks are allocated up front and pinned in place. An image is made
//! usable as a block device in one of two ways:
//!
//! * When the data volume is a device-mapper device stacked over a
//!   partition, a dm-linear device is built directly over the image's
//!   extents on that partition.
//! * Otherwise each file is attached to a loop device, and several loop
//!   devices are joined with a dm-linear device.
//!
//! # Usage
//!
//! Images live in namespaces. `ImageManager::open("dsu")` manages the
//! images registered in `/metadata/gsi/dsu` and stored in `/data/gsi/dsu`.
//! An image is created with `ImageManager::create_backing_image()`, made
//! available with `ImageManager::map_image_device()` and released with
//! `ImageManager::unmap_image_device()`. `MappedDevice` ties a mapping to
//! the lifetime of a value.
//!
//! Each mapping is recorded in a status file next to the image's metadata.
//! Unmapping replays that file, so a mapping made by one process can be
//! torn down by another.

#![warn(missing_docs)]

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;

/// shared constants
mod consts;
/// device-mapper devices of the running kernel
mod dm_control;
/// allocation of files with fixed extents
mod extent_writer;
/// physical extents of files
mod fiemap;
/// the image lifecycle
mod image_manager;
/// loop devices of the running kernel
mod loop_control;
/// scoped mappings
mod mapped_device;
/// persistent extent layout of images
mod metadata;
/// configuration
mod options;
/// mapped-state markers
mod property;
/// return results container
mod result;
/// undo on early return
mod rollback;
/// images split across several files
mod split;
/// the per-image status file
mod status;
/// device-mapper linear tables
mod table;
#[cfg(test)]
mod testing;
/// public utilities
mod util;

pub use consts::{DATA_ROOT, IMAGE_SUFFIX, METADATA_ROOT, STATUS_SUFFIX, TEST_METADATA_ROOT};
pub use dm_control::{DeviceMapperControl, DmDeviceState, KernelDeviceMapper};
pub use extent_writer::{is_device_mapper_node, BackingFile, BlockDevice, ExtentWriter, ProgressFn};
pub use fiemap::{file_extents, Extent, ExtentFlags};
pub use image_manager::{CreateFlags, ImageBackends, ImageManager};
pub use loop_control::{KernelLoopControl, LoopControl};
pub use mapped_device::MappedDevice;
pub use metadata::{ImageMetadata, JsonMetadataStore, LinearExtent, MetadataStore, Partition};
pub use options::ImageManagerOptions;
pub use property::{mapped_image_property, FilePropertyStore, MemoryPropertyStore, PropertyStore};
pub use result::{ErrorEnum, ImageError, ImageResult};
pub use rollback::Rollback;
pub use split::SplitFileWriter;
pub use status::{StatusEntry, StatusRecord};
pub use table::{loop_device_table, LinearTable, LinearTarget};
pub use util::device_size;
