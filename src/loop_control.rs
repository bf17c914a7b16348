// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    fs::{self, OpenOptions},
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
    time::Duration,
};

use loopdev::{LoopControl as LoopControlDevice, LoopDevice};

use crate::{
    result::{ErrorEnum, ImageError, ImageResult},
    util::wait_for_path,
};

// LOOP_SET_DIRECT_IO takes its argument by value
nix::ioctl_write_int_bad!(loop_set_direct_io, 0x4C08);

/// Attaches files to loop devices.
pub trait LoopControl {
    /// Attach file to a free loop device and wait up to timeout for its
    /// device node. Return the path of the device node.
    fn attach(&self, file: &Path, timeout: Duration) -> ImageResult<PathBuf>;

    /// Detach the loop device at device.
    fn detach(&self, device: &Path) -> ImageResult<()>;

    /// Make the loop device at device bypass the page cache.
    fn enable_direct_io(&self, device: &Path) -> ImageResult<()>;
}

/// Loop devices managed through /dev/loop-control.
#[derive(Debug, Default)]
pub struct KernelLoopControl;

impl KernelLoopControl {
    /// Make a new KernelLoopControl.
    pub fn new() -> KernelLoopControl {
        KernelLoopControl
    }
}

impl LoopControl for KernelLoopControl {
    fn attach(&self, file: &Path, timeout: Duration) -> ImageResult<PathBuf> {
        let metadata = fs::symlink_metadata(file)
            .map_err(|err| ImageError::io(format!("could not stat {}", file.display()), err))?;
        if metadata.file_type().is_symlink() {
            return Err(ImageError::image(
                ErrorEnum::Invalid,
                format!("refusing to attach symlink {}", file.display()),
            ));
        }

        let control = LoopControlDevice::open()
            .map_err(|err| ImageError::io("could not open loop control device", err))?;
        let device = control
            .next_free()
            .map_err(|err| ImageError::io("no free loop device", err))?;
        device
            .attach_file(file)
            .map_err(|err| ImageError::io(format!("could not attach {}", file.display()), err))?;

        let path = match device.path() {
            Some(path) => path,
            None => {
                if let Err(err) = device.detach() {
                    warn!("Could not detach unnamed loop device: {}", err);
                }
                return Err(ImageError::image(
                    ErrorEnum::NotFound,
                    format!("loop device for {} has no path", file.display()),
                ));
            }
        };

        if let Err(err) = wait_for_path(&path, timeout) {
            if let Err(detach_err) = device.detach() {
                warn!("Could not detach {}: {}", path.display(), detach_err);
            }
            return Err(err);
        }

        debug!("Attached {} to {}", file.display(), path.display());
        Ok(path)
    }

    fn detach(&self, device: &Path) -> ImageResult<()> {
        LoopDevice::open(device)
            .and_then(|loop_device| loop_device.detach())
            .map_err(|err| ImageError::io(format!("could not detach {}", device.display()), err))?;
        debug!("Detached {}", device.display());
        Ok(())
    }

    fn enable_direct_io(&self, device: &Path) -> ImageResult<()> {
        let file = OpenOptions::new()
            .read(true)
            .open(device)
            .map_err(|err| ImageError::io(format!("could not open {}", device.display()), err))?;
        unsafe { loop_set_direct_io(file.as_raw_fd(), 1) }?;
        Ok(())
    }
}
