// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Persistent extent layout of the images in a metadata directory.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    consts::METADATA_FILE,
    extent_writer::BackingFile,
    result::{ErrorEnum, ImageError, ImageResult},
    util::{remove_file_if_exists, write_atomic},
};

/// A run of sectors on the super block device.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct LinearExtent {
    /// First sector of the run on the block device
    pub physical_sector: u64,
    /// Number of sectors in the run
    pub num_sectors: u64,
}

impl LinearExtent {
    /// Make a new LinearExtent.
    pub fn new(physical_sector: u64, num_sectors: u64) -> LinearExtent {
        LinearExtent {
            physical_sector,
            num_sectors,
        }
    }
}

/// The recorded layout of one image.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Partition {
    /// The image name
    pub name: String,
    /// The requested size of the image in bytes
    pub size: u64,
    /// Whether the image was created readonly
    pub readonly: bool,
    /// The image's extents, in logical order
    pub extents: Vec<LinearExtent>,
}

/// The recorded layout of every image in a metadata directory.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ImageMetadata {
    /// The block device on which all extents lie
    pub super_device: PathBuf,
    /// One entry per image
    pub partitions: Vec<Partition>,
}

/// Persistent storage of image layouts, keyed by metadata directory and
/// image name.
pub trait MetadataStore {
    /// Whether any metadata exists in dir.
    fn exists(&self, dir: &Path) -> bool;

    /// Read the metadata in dir.
    fn open(&self, dir: &Path) -> ImageResult<ImageMetadata>;

    /// Record the layout of file as the image name.
    fn update(
        &self,
        dir: &Path,
        name: &str,
        file: &BackingFile,
        size: u64,
        readonly: bool,
    ) -> ImageResult<()>;

    /// Remove the entry for name.
    fn remove_entry(&self, dir: &Path, name: &str) -> ImageResult<()>;

    /// Remove all metadata in dir.
    fn remove_namespace(&self, dir: &Path) -> ImageResult<()>;
}

impl ImageMetadata {
    /// Find the entry for name.
    pub fn find(&self, name: &str) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.name == name)
    }

    /// The size in bytes recorded for a partition.
    pub fn size_of(&self, partition: &Partition) -> u64 {
        partition.size
    }

    /// The block device on which the extents lie.
    pub fn super_block_device(&self) -> &Path {
        &self.super_device
    }
}

/// Metadata kept as one JSON document per metadata directory.
#[derive(Debug, Default)]
pub struct JsonMetadataStore;

impl JsonMetadataStore {
    /// Make a new JsonMetadataStore.
    pub fn new() -> JsonMetadataStore {
        JsonMetadataStore
    }

    fn metadata_path(dir: &Path) -> PathBuf {
        dir.join(METADATA_FILE)
    }

    fn save(dir: &Path, metadata: &ImageMetadata) -> ImageResult<()> {
        fs::create_dir_all(dir)
            .map_err(|err| ImageError::io(format!("could not create {}", dir.display()), err))?;
        let data = serde_json::to_vec_pretty(metadata)?;
        write_atomic(&JsonMetadataStore::metadata_path(dir), &data)
    }
}

impl MetadataStore for JsonMetadataStore {
    fn exists(&self, dir: &Path) -> bool {
        JsonMetadataStore::metadata_path(dir).exists()
    }

    fn open(&self, dir: &Path) -> ImageResult<ImageMetadata> {
        let path = JsonMetadataStore::metadata_path(dir);
        let data = fs::read(&path).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                ImageError::image(
                    ErrorEnum::NotFound,
                    format!("no image metadata in {}", dir.display()),
                )
            } else {
                ImageError::io(format!("could not read {}", path.display()), err)
            }
        })?;
        Ok(serde_json::from_slice(&data)?)
    }

    fn update(
        &self,
        dir: &Path,
        name: &str,
        file: &BackingFile,
        size: u64,
        readonly: bool,
    ) -> ImageResult<()> {
        let mut metadata = if self.exists(dir) {
            self.open(dir)?
        } else {
            ImageMetadata::default()
        };

        metadata.super_device = file.block_device().to_owned();
        let partition = Partition {
            name: name.to_owned(),
            size,
            readonly,
            extents: file.linear_extents(),
        };
        match metadata.partitions.iter_mut().find(|p| p.name == name) {
            Some(existing) => *existing = partition,
            None => metadata.partitions.push(partition),
        }

        JsonMetadataStore::save(dir, &metadata)
    }

    fn remove_entry(&self, dir: &Path, name: &str) -> ImageResult<()> {
        if !self.exists(dir) {
            return Ok(());
        }
        let mut metadata = self.open(dir)?;
        metadata.partitions.retain(|p| p.name != name);
        if metadata.partitions.is_empty() {
            return self.remove_namespace(dir);
        }
        JsonMetadataStore::save(dir, &metadata)
    }

    fn remove_namespace(&self, dir: &Path) -> ImageResult<()> {
        remove_file_if_exists(&JsonMetadataStore::metadata_path(dir))?;
        if let Err(err) = fs::remove_dir(dir) {
            // Status files of mapped images keep the directory alive.
            debug!("Leaving {} in place: {}", dir.display(), err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::fiemap::{Extent, ExtentFlags};

    use super::*;

    fn backing_file(dir: &Path, name: &str, physical: u64, size: u64) -> BackingFile {
        let header = dir.join(format!("{name}.img"));
        BackingFile::new(
            &header,
            vec![header.clone()],
            size,
            Path::new("/dev/nvme0n1p4"),
            vec![Extent {
                logical: 0,
                physical,
                length: size,
                flags: ExtentFlags::LAST,
            }],
        )
    }

    #[test]
    fn test_update_find_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("dsu");
        let store = JsonMetadataStore::new();
        assert!(!store.exists(&dir));
        assert_matches!(
            store.open(&dir),
            Err(ImageError::Image(ErrorEnum::NotFound, _))
        );

        let system_file = backing_file(&dir, "system", 1 << 20, 8192);
        let userdata_file = backing_file(&dir, "userdata", 1 << 30, 4096);
        store
            .update(&dir, "system", &system_file, 8192, true)
            .unwrap();
        store
            .update(&dir, "userdata", &userdata_file, 4096, false)
            .unwrap();
        assert!(store.exists(&dir));

        let metadata = store.open(&dir).unwrap();
        assert_eq!(metadata.super_block_device(), Path::new("/dev/nvme0n1p4"));
        let system = metadata.find("system").unwrap();
        assert!(system.readonly);
        assert_eq!(metadata.size_of(system), 8192);
        assert_eq!(system.extents, vec![LinearExtent::new(2048, 16)]);
        assert!(!metadata.find("userdata").unwrap().readonly);
        assert!(metadata.find("vendor").is_none());

        store.remove_entry(&dir, "system").unwrap();
        assert!(store.open(&dir).unwrap().find("system").is_none());

        store.remove_entry(&dir, "userdata").unwrap();
        assert!(!store.exists(&dir));
        assert!(!dir.exists());
    }

    #[test]
    fn test_update_replaces_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonMetadataStore::new();
        let dir = tmp.path();
        let small = backing_file(dir, "system", 4096, 4096);
        let large = backing_file(dir, "system", 8192, 4096);
        store.update(dir, "system", &small, 4096, false).unwrap();
        store.update(dir, "system", &large, 4096, true).unwrap();
        let metadata = store.open(dir).unwrap();
        assert_eq!(metadata.partitions.len(), 1);
        assert_eq!(
            metadata.partitions[0].extents,
            vec![LinearExtent::new(16, 8)]
        );
        assert!(metadata.partitions[0].readonly);
    }

    #[test]
    fn test_remove_namespace_keeps_busy_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonMetadataStore::new();
        let dir = tmp.path().join("dsu");
        let system_file = backing_file(&dir, "system", 4096, 4096);
        store
            .update(&dir, "system", &system_file, 4096, false)
            .unwrap();
        fs::write(dir.join("system.status"), "loop:/dev/loop0").unwrap();

        store.remove_namespace(&dir).unwrap();
        assert!(!store.exists(&dir));
        assert!(dir.join("system.status").exists());
    }
}
