// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Physical extents of files, as reported by the FS_IOC_FIEMAP ioctl.

use std::{fs::File, os::unix::io::AsRawFd};

use crate::result::ImageResult;

/// Ask the filesystem to sync the file before mapping it.
const FIEMAP_FLAG_SYNC: u32 = 0x1;

/// Number of extents requested from the kernel per ioctl.
const EXTENTS_PER_CALL: usize = 64;

bitflags! {
    /// Flags describing a single extent.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct ExtentFlags: u32 {
        /// Last extent in the file.
        const LAST           = 0x0000_0001;
        /// Data location unknown.
        const UNKNOWN        = 0x0000_0002;
        /// Location still pending.
        const DELALLOC       = 0x0000_0004;
        /// Data cannot be read while the filesystem is unmounted.
        const ENCODED        = 0x0000_0008;
        /// Data is encrypted by the filesystem.
        const DATA_ENCRYPTED = 0x0000_0080;
        /// Extent offsets may not be block aligned.
        const NOT_ALIGNED    = 0x0000_0100;
        /// Data mixed with metadata.
        const DATA_INLINE    = 0x0000_0200;
        /// Multiple files in block.
        const DATA_TAIL      = 0x0000_0400;
        /// Space allocated, but no data written.
        const UNWRITTEN      = 0x0000_0800;
        /// File does not natively support extents.
        const MERGED         = 0x0000_1000;
        /// Space shared with other files.
        const SHARED         = 0x0000_2000;
    }
}

impl ExtentFlags {
    /// Flags meaning that the extent's blocks may not stay where they are,
    /// or cannot be addressed directly on the block device.
    pub fn unstable() -> ExtentFlags {
        ExtentFlags::UNKNOWN
            | ExtentFlags::DELALLOC
            | ExtentFlags::ENCODED
            | ExtentFlags::NOT_ALIGNED
            | ExtentFlags::DATA_INLINE
            | ExtentFlags::DATA_TAIL
            | ExtentFlags::UNWRITTEN
            | ExtentFlags::SHARED
    }
}

/// A contiguous run of physical blocks allocated to a file. Offsets and
/// lengths are in bytes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Extent {
    /// Offset of the extent within the file
    pub logical: u64,
    /// Offset of the extent on the block device
    pub physical: u64,
    /// Length of the extent
    pub length: u64,
    /// Extent flags
    pub flags: ExtentFlags,
}

impl Extent {
    /// Whether the extent can back a device-mapper linear target.
    pub fn is_pinned(&self) -> bool {
        !self.flags.intersects(ExtentFlags::unstable())
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
#[allow(dead_code)]
struct FiemapExtent {
    fe_logical: u64,
    fe_physical: u64,
    fe_length: u64,
    fe_reserved64: [u64; 2],
    fe_flags: u32,
    fe_reserved: [u32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
#[allow(dead_code)]
struct FiemapHeader {
    fm_start: u64,
    fm_length: u64,
    fm_flags: u32,
    fm_mapped_extents: u32,
    fm_extent_count: u32,
    fm_reserved: u32,
}

/// The header immediately followed by room for the extents the kernel
/// fills in.
#[repr(C)]
struct FiemapRequest {
    header: FiemapHeader,
    extents: [FiemapExtent; EXTENTS_PER_CALL],
}

nix::ioctl_readwrite!(fs_ioc_fiemap, b'f', 11, FiemapHeader);

impl From<&FiemapExtent> for Extent {
    fn from(fe: &FiemapExtent) -> Extent {
        Extent {
            logical: fe.fe_logical,
            physical: fe.fe_physical,
            length: fe.fe_length,
            flags: ExtentFlags::from_bits_truncate(fe.fe_flags),
        }
    }
}

/// Get all extents of a file, in logical order.
pub fn file_extents(file: &File) -> ImageResult<Vec<Extent>> {
    let mut extents = Vec::new();
    let mut start = 0u64;
    let mut flags = FIEMAP_FLAG_SYNC;

    loop {
        let mut request = FiemapRequest {
            header: FiemapHeader {
                fm_start: start,
                fm_length: u64::MAX,
                fm_flags: flags,
                fm_extent_count: EXTENTS_PER_CALL as u32,
                ..Default::default()
            },
            extents: [FiemapExtent::default(); EXTENTS_PER_CALL],
        };
        let request_ptr = (&mut request as *mut FiemapRequest).cast::<FiemapHeader>();
        unsafe { fs_ioc_fiemap(file.as_raw_fd(), request_ptr) }?;

        let mapped = request.header.fm_mapped_extents as usize;
        if mapped == 0 {
            break;
        }
        let batch = &request.extents[..mapped.min(EXTENTS_PER_CALL)];
        extents.extend(batch.iter().map(Extent::from));

        let last = &batch[batch.len() - 1];
        if last.fe_flags & ExtentFlags::LAST.bits() != 0 {
            break;
        }
        start = last.fe_logical + last.fe_length;
        flags = 0;
    }

    Ok(extents)
}
