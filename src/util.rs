// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    fs::{self, File},
    io::{self, Write},
    os::unix::{fs::FileTypeExt, io::AsRawFd},
    path::Path,
    time::Duration,
};

use retry::{delay::Fixed, retry};
use tempfile::NamedTempFile;

use crate::{
    consts::DEVICE_POLL_INTERVAL_MS,
    result::{ErrorEnum, ImageError, ImageResult},
};

// send IOCTL via blkgetsize64
nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// Get the size in bytes of a block device, or of a regular file standing
/// in for one.
pub fn device_size(file: &File) -> ImageResult<u64> {
    let metadata = file.metadata()?;
    if !metadata.file_type().is_block_device() {
        return Ok(metadata.len());
    }

    let mut val: u64 = 0;
    unsafe { blkgetsize64(file.as_raw_fd(), &mut val) }?;
    Ok(val)
}

/// Replace the contents of path with data, so that readers observe either
/// the old contents or the new, never a mix.
pub fn write_atomic(path: &Path, data: &[u8]) -> ImageResult<()> {
    let dir = path.parent().ok_or_else(|| {
        ImageError::image(
            ErrorEnum::Invalid,
            format!("{} has no parent directory", path.display()),
        )
    })?;
    let mut tmp = NamedTempFile::new_in(dir)
        .map_err(|err| ImageError::io(format!("could not write to {}", dir.display()), err))?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;
    Ok(())
}

/// Remove a file. Return true if the file existed.
pub fn remove_file_if_exists(path: &Path) -> ImageResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(ImageError::io(format!("could not remove {}", path.display()), err)),
    }
}

/// Wait until path exists, checking until timeout has elapsed. A zero
/// timeout checks exactly once.
pub fn wait_for_path(path: &Path, timeout: Duration) -> ImageResult<()> {
    let tries = timeout.as_millis() / u128::from(DEVICE_POLL_INTERVAL_MS);
    let tries = usize::try_from(tries).unwrap_or(usize::MAX);
    retry(Fixed::from_millis(DEVICE_POLL_INTERVAL_MS).take(tries), || {
        if path.exists() {
            Ok(())
        } else {
            Err(())
        }
    })
    .map_err(|_| {
        ImageError::image(
            ErrorEnum::Timeout,
            format!(
                "{} did not appear within {} ms",
                path.display(),
                timeout.as_millis()
            ),
        )
    })
}
