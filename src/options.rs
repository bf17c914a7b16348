// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::path::{Component, Path, PathBuf};

use crate::{
    consts::{DATA_ROOT, METADATA_ROOT, PROPERTY_DIR, TEST_METADATA_ROOT},
    result::{ErrorEnum, ImageError, ImageResult},
};

/// root/prefix, where prefix must stay beneath root.
fn namespace_dir(root: &Path, prefix: &str) -> ImageResult<PathBuf> {
    let relative = Path::new(prefix);
    let mut components = relative.components();
    if prefix.is_empty() || !components.all(|c| matches!(c, Component::Normal(_))) {
        return Err(ImageError::image(
            ErrorEnum::Invalid,
            format!("invalid namespace prefix \"{prefix}\""),
        ));
    }
    Ok(root.join(relative))
}

/// Encapsulates the locations and limits an image manager works with.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ImageManagerOptions {
    metadata_root: PathBuf,
    data_root: PathBuf,
    test_metadata_root: PathBuf,
    property_dir: PathBuf,
    sysfs_root: PathBuf,
    dev_root: PathBuf,
    max_piece_size: u64,
}

impl Default for ImageManagerOptions {
    fn default() -> ImageManagerOptions {
        ImageManagerOptions {
            metadata_root: PathBuf::from(METADATA_ROOT),
            data_root: PathBuf::from(DATA_ROOT),
            test_metadata_root: PathBuf::from(TEST_METADATA_ROOT),
            property_dir: PathBuf::from(PROPERTY_DIR),
            sysfs_root: PathBuf::from("/sys"),
            dev_root: PathBuf::from("/dev"),
            max_piece_size: 0,
        }
    }
}

impl ImageManagerOptions {
    /// Create options pointing at the standard system locations.
    pub fn new() -> ImageManagerOptions {
        ImageManagerOptions::default()
    }

    /// Set the root under which metadata directories are created.
    ///
    /// ```
    /// use imagemgr::ImageManagerOptions;
    ///
    /// let mut options = ImageManagerOptions::new();
    /// options
    ///     .set_metadata_root("/tmp/metadata")
    ///     .set_data_root("/tmp/data");
    /// assert_eq!(
    ///     options.metadata_dir("system").unwrap().to_str(),
    ///     Some("/tmp/metadata/system")
    /// );
    /// ```
    pub fn set_metadata_root<P: AsRef<Path>>(&mut self, root: P) -> &mut ImageManagerOptions {
        self.metadata_root = root.as_ref().to_owned();
        self
    }

    /// Set the root under which data directories are created.
    pub fn set_data_root<P: AsRef<Path>>(&mut self, root: P) -> &mut ImageManagerOptions {
        self.data_root = root.as_ref().to_owned();
        self
    }

    /// Set the root under which images may be backed by device-mapper
    /// devices.
    pub fn set_test_metadata_root<P: AsRef<Path>>(&mut self, root: P) -> &mut ImageManagerOptions {
        self.test_metadata_root = root.as_ref().to_owned();
        self
    }

    /// Set the directory of the file-backed property store.
    pub fn set_property_dir<P: AsRef<Path>>(&mut self, dir: P) -> &mut ImageManagerOptions {
        self.property_dir = dir.as_ref().to_owned();
        self
    }

    /// Set the location at which sysfs is mounted.
    pub fn set_sysfs_root<P: AsRef<Path>>(&mut self, root: P) -> &mut ImageManagerOptions {
        self.sysfs_root = root.as_ref().to_owned();
        self
    }

    /// Set the directory holding block device nodes.
    pub fn set_dev_root<P: AsRef<Path>>(&mut self, root: P) -> &mut ImageManagerOptions {
        self.dev_root = root.as_ref().to_owned();
        self
    }

    /// Set the largest size of a single backing file. 0 lets the
    /// filesystem decide.
    pub fn set_max_piece_size(&mut self, size: u64) -> &mut ImageManagerOptions {
        self.max_piece_size = size;
        self
    }

    /// The metadata directory for a namespace prefix. The prefix must be a
    /// relative path with no "." or ".." components.
    pub fn metadata_dir(&self, prefix: &str) -> ImageResult<PathBuf> {
        namespace_dir(&self.metadata_root, prefix)
    }

    /// The data directory for a namespace prefix.
    pub fn data_dir(&self, prefix: &str) -> ImageResult<PathBuf> {
        namespace_dir(&self.data_root, prefix)
    }

    /// Retrieve the test metadata root
    pub fn test_metadata_root(&self) -> &Path {
        &self.test_metadata_root
    }

    /// Retrieve the property directory
    pub fn property_dir(&self) -> &Path {
        &self.property_dir
    }

    /// Retrieve the sysfs root
    pub fn sysfs_root(&self) -> &Path {
        &self.sysfs_root
    }

    /// Retrieve the device root
    pub fn dev_root(&self) -> &Path {
        &self.dev_root
    }

    /// Retrieve the piece size limit
    pub fn max_piece_size(&self) -> u64 {
        self.max_piece_size
    }
}
