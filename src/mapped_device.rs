// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    fmt,
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    image_manager::ImageManager,
    result::{ImageError, ImageResult},
};

/// Unmaps an image when dropped.
struct Mapping<'a> {
    manager: &'a ImageManager,
    name: String,
}

impl Drop for Mapping<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.manager.unmap_image_device(&self.name) {
            error!("Could not unmap {}: {}", self.name, err);
        }
    }
}

/// An image mapped for as long as this handle lives, opened read-write.
pub struct MappedDevice<'a> {
    // Declared before mapping so that the file is closed before the
    // device is torn down.
    file: File,
    path: PathBuf,
    mapping: Mapping<'a>,
}

impl<'a> MappedDevice<'a> {
    /// Map name through manager, waiting up to timeout, and open the mapped
    /// device. If the device cannot be opened, it is unmapped again.
    pub fn open(
        manager: &'a ImageManager,
        timeout: Duration,
        name: &str,
    ) -> ImageResult<MappedDevice<'a>> {
        let path = manager.map_image_device(name, timeout)?;
        let mapping = Mapping {
            manager,
            name: name.to_owned(),
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| ImageError::io(format!("could not open {}", path.display()), err))?;
        Ok(MappedDevice {
            file,
            path,
            mapping,
        })
    }

    /// The open mapped device
    pub fn file(&self) -> &File {
        &self.file
    }

    /// The path of the mapped device
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The name of the mapped image
    pub fn name(&self) -> &str {
        &self.mapping.name
    }
}

impl fmt::Debug for MappedDevice<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedDevice")
            .field("name", &self.mapping.name)
            .field("path", &self.path)
            .finish()
    }
}
