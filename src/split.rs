// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Backing images stored as one file, or as a header file listing several
//! pieces when the filesystem limits file size.

use std::{
    ffi::OsString,
    fs::{self, File, OpenOptions},
    io::{self, Write},
    os::unix::{fs::MetadataExt, io::AsRawFd},
    path::{Path, PathBuf},
};

use devicemapper::Device;
use nix::{
    errno::Errno,
    libc::{self, off_t},
    sys::statfs::{statfs, MSDOS_SUPER_MAGIC},
};

use crate::{
    consts::{ALLOCATION_CHUNK_SIZE, FAT_MAX_FILE_SIZE},
    extent_writer::{BackingFile, BlockDevice, ExtentWriter, ProgressFn},
    fiemap::{file_extents, Extent},
    options::ImageManagerOptions,
    result::{ErrorEnum, ImageError, ImageResult},
    rollback::Rollback,
    util::remove_file_if_exists,
};

/// Pieces are cut on this boundary so that every piece is block aligned.
const PIECE_ALIGNMENT: u64 = 4096;

/// The path of the index'th piece of a split image, counting from 1.
pub fn piece_path(header: &Path, index: usize) -> PathBuf {
    let mut path = OsString::from(header.as_os_str());
    path.push(format!(".{index:04}"));
    PathBuf::from(path)
}

/// Sizes of the pieces needed to hold size bytes when no piece may exceed
/// limit bytes. A limit of 0 means no limit.
pub fn piece_sizes(size: u64, limit: u64) -> Vec<u64> {
    let limit = limit - limit % PIECE_ALIGNMENT;
    if limit == 0 || size <= limit {
        return vec![size];
    }
    let mut sizes = Vec::new();
    let mut remaining = size;
    while remaining > 0 {
        let piece = remaining.min(limit);
        sizes.push(piece);
        remaining -= piece;
    }
    sizes
}

/// The files of the image with the given header, in order. An image is
/// split if its first piece exists; the header then names the pieces, one
/// per line.
pub fn split_file_list(header: &Path) -> ImageResult<Vec<PathBuf>> {
    if !piece_path(header, 1).exists() {
        if !header.exists() {
            return Err(ImageError::image(
                ErrorEnum::NotFound,
                format!("no image at {}", header.display()),
            ));
        }
        return Ok(vec![header.to_owned()]);
    }

    let dir = header.parent().unwrap_or_else(|| Path::new("/"));
    let contents = fs::read_to_string(header)
        .map_err(|err| ImageError::io(format!("could not read {}", header.display()), err))?;
    let files = contents
        .lines()
        .filter(|l| !l.is_empty())
        .map(|name| dir.join(name))
        .collect::<Vec<_>>();
    if files.is_empty() {
        return Err(ImageError::image(
            ErrorEnum::Invalid,
            format!("split image header {} lists no files", header.display()),
        ));
    }
    Ok(files)
}

/// Remove the header and every piece of an image. Pieces left behind by an
/// interrupted creation are removed as well.
pub fn remove_split_files(header: &Path) -> ImageResult<()> {
    if let Ok(files) = split_file_list(header) {
        for file in files.iter().filter(|f| f.as_path() != header) {
            remove_file_if_exists(file)?;
        }
    }
    let mut index = 1;
    while remove_file_if_exists(&piece_path(header, index))? {
        index += 1;
    }
    remove_file_if_exists(header)?;
    Ok(())
}

/// Writes backing images as preallocated, zero-filled files and reads their
/// extents with FIEMAP.
#[derive(Debug)]
pub struct SplitFileWriter {
    sysfs_root: PathBuf,
    dev_root: PathBuf,
    max_piece_size: u64,
}

impl SplitFileWriter {
    /// Make a writer using the locations and limits in options.
    pub fn new(options: &ImageManagerOptions) -> SplitFileWriter {
        SplitFileWriter {
            sysfs_root: options.sysfs_root().to_owned(),
            dev_root: options.dev_root().to_owned(),
            max_piece_size: options.max_piece_size(),
        }
    }

    /// The largest piece the filesystem holding dir accepts, or 0 for no
    /// limit.
    fn piece_limit(&self, dir: &Path) -> ImageResult<u64> {
        if self.max_piece_size != 0 {
            return Ok(self.max_piece_size);
        }
        if statfs(dir)?.filesystem_type() == MSDOS_SUPER_MAGIC {
            return Ok(FAT_MAX_FILE_SIZE);
        }
        Ok(0)
    }

    /// Find the device node for a device number, looking through a
    /// device-mapper node to the partition beneath it where possible.
    pub fn resolve_block_device(&self, device: Device) -> ImageResult<BlockDevice> {
        let link = self.sysfs_root.join("dev/block").join(device.to_string());
        let sys_dir = fs::canonicalize(&link)
            .map_err(|err| ImageError::io(format!("could not resolve {}", link.display()), err))?;
        let name = sys_dir
            .file_name()
            .ok_or_else(|| {
                ImageError::image(
                    ErrorEnum::NotFound,
                    format!("no block device name for {device}"),
                )
            })?
            .to_owned();

        if !sys_dir.join("dm").exists() {
            return Ok(BlockDevice::new(self.dev_root.join(&name), false));
        }

        let slaves = fs::read_dir(sys_dir.join("slaves"))
            .map_err(|err| ImageError::io(format!("could not list slaves of {device}"), err))?
            .map(|entry| entry.map(|e| e.file_name()))
            .collect::<io::Result<Vec<_>>>()?;
        if let [slave] = slaves.as_slice() {
            let slave_is_dm = self
                .sysfs_root
                .join("class/block")
                .join(slave)
                .join("dm")
                .exists();
            if !slave_is_dm {
                return Ok(BlockDevice::new(self.dev_root.join(slave), true));
            }
        }

        debug!(
            "Device-mapper device {} is stacked over {:?}; not looking further",
            device, slaves
        );
        Ok(BlockDevice::new(self.dev_root.join(&name), false))
    }
}

fn create_file(path: &Path) -> ImageResult<File> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|err| ImageError::io(format!("could not create {}", path.display()), err))
}

/// Reserve len bytes for file and fill them with zeroes.
fn allocate_file(
    file: &File,
    len: u64,
    done: &mut u64,
    total: u64,
    progress: &mut Option<ProgressFn<'_>>,
) -> ImageResult<()> {
    let off_len = off_t::try_from(len)
        .map_err(|_| ImageError::image(ErrorEnum::Invalid, format!("size {len} too large")))?;
    match Errno::result(unsafe { libc::fallocate(file.as_raw_fd(), 0, 0, off_len) }) {
        Ok(_) => {}
        Err(Errno::EOPNOTSUPP) => debug!("fallocate unsupported, writing zeroes only"),
        Err(err) => return Err(err.into()),
    }

    let zeroes = vec![0u8; ALLOCATION_CHUNK_SIZE];
    let mut writer = file;
    let mut remaining = len;
    while remaining > 0 {
        let to_write = remaining.min(zeroes.len() as u64);
        writer.write_all(&zeroes[..to_write as usize])?;
        remaining -= to_write;
        *done += to_write;
        if let Some(progress) = progress.as_mut() {
            progress(*done, total);
        }
    }
    file.sync_all()?;
    Ok(())
}

/// Read the extents of every file, in order.
fn collect_extents(files: &[PathBuf]) -> ImageResult<(u64, Vec<Extent>)> {
    let mut size = 0;
    let mut extents = Vec::new();
    for path in files {
        let file = File::open(path)
            .map_err(|err| ImageError::io(format!("could not open {}", path.display()), err))?;
        size += file.metadata()?.len();
        extents.extend(file_extents(&file)?);
    }
    Ok((size, extents))
}

impl ExtentWriter for SplitFileWriter {
    fn create(
        &self,
        header: &Path,
        size: u64,
        mut progress: Option<ProgressFn<'_>>,
    ) -> ImageResult<BackingFile> {
        if size == 0 {
            return Err(ImageError::image(ErrorEnum::Invalid, "cannot create an empty image"));
        }
        if fs::symlink_metadata(header).is_ok() {
            return Err(ImageError::image(
                ErrorEnum::AlreadyExists,
                format!("{} already exists", header.display()),
            ));
        }
        let dir = header.parent().ok_or_else(|| {
            ImageError::image(
                ErrorEnum::Invalid,
                format!("{} has no parent directory", header.display()),
            )
        })?;
        fs::create_dir_all(dir)
            .map_err(|err| ImageError::io(format!("could not create {}", dir.display()), err))?;

        let block_device = self.block_device_for_file(dir)?;
        let sizes = piece_sizes(size, self.piece_limit(dir)?);
        let files = if sizes.len() == 1 {
            vec![header.to_owned()]
        } else {
            (1..=sizes.len()).map(|i| piece_path(header, i)).collect()
        };

        let mut rollback = Rollback::new();
        let mut done = 0;
        for (path, len) in files.iter().zip(&sizes) {
            let file = create_file(path)?;
            let created = path.clone();
            rollback.push(move || {
                if let Err(err) = remove_file_if_exists(&created) {
                    warn!("Could not remove {}: {}", created.display(), err);
                }
            });
            allocate_file(&file, *len, &mut done, size, &mut progress)?;
        }

        if files.len() > 1 {
            let mut list = String::new();
            for path in &files {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    list.push_str(name);
                    list.push('\n');
                }
            }
            let mut header_file = create_file(header)?;
            let created = header.to_owned();
            rollback.push(move || {
                if let Err(err) = remove_file_if_exists(&created) {
                    warn!("Could not remove {}: {}", created.display(), err);
                }
            });
            header_file.write_all(list.as_bytes())?;
            header_file.sync_all()?;
        }

        let (_, extents) = collect_extents(&files)?;
        rollback.commit();

        info!(
            "Created {} ({} bytes in {} file(s)) on {}",
            header.display(),
            size,
            files.len(),
            block_device.path.display()
        );
        Ok(BackingFile::new(header, files, size, &block_device.path, extents))
    }

    fn open(&self, header: &Path) -> ImageResult<BackingFile> {
        let files = split_file_list(header)?;
        let (size, extents) = collect_extents(&files)?;
        let block_device = self.block_device_for_file(header)?;
        Ok(BackingFile::new(header, files, size, &block_device.path, extents))
    }

    fn block_device_for_file(&self, path: &Path) -> ImageResult<BlockDevice> {
        let metadata = fs::metadata(path)
            .map_err(|err| ImageError::io(format!("could not stat {}", path.display()), err))?;
        self.resolve_block_device(Device::from(metadata.dev()))
    }

    fn split_file_list(&self, header: &Path) -> ImageResult<Vec<PathBuf>> {
        split_file_list(header)
    }

    fn remove_split_files(&self, header: &Path) -> ImageResult<()> {
        remove_split_files(header)
    }
}
