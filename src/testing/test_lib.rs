// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::path::Path;

use tempfile::TempDir;

use crate::{
    extent_writer::BlockDevice,
    image_manager::{ImageBackends, ImageManager},
    metadata::JsonMetadataStore,
    options::ImageManagerOptions,
    property::{FilePropertyStore, PropertyStore},
    testing::{
        fakes::{FakeDeviceMapper, FakeExtentWriter, FakeLoopControl},
        logger::init_logger,
    },
};

/// A scratch directory holding metadata, data, properties and fake device
/// nodes, plus handles on the fakes for inspection after the fact.
pub struct TestEnv {
    tmp: TempDir,
    pub options: ImageManagerOptions,
    pub writer: FakeExtentWriter,
    pub loops: FakeLoopControl,
    pub dm: FakeDeviceMapper,
}

impl TestEnv {
    /// Images on storage with no device-mapper layer, so mapped with loop
    /// devices.
    pub fn loop_backed() -> TestEnv {
        TestEnv::new(BlockDevice::new("/dev/block/sda2", false), false)
    }

    /// Images on an encrypted device-mapper volume over /dev/block/sda2, so
    /// mapped with a linear target over their extents.
    pub fn dm_backed() -> TestEnv {
        TestEnv::new(BlockDevice::new("/dev/block/sda2", true), true)
    }

    pub fn new(block_device: BlockDevice, encrypted: bool) -> TestEnv {
        init_logger();
        let tmp = tempfile::Builder::new()
            .prefix("imagemgr")
            .tempdir()
            .unwrap();
        let root = tmp.path();

        let mut options = ImageManagerOptions::new();
        options
            .set_metadata_root(root.join("metadata"))
            .set_data_root(root.join("data"))
            .set_test_metadata_root(root.join("metadata/test"))
            .set_property_dir(root.join("properties"));

        TestEnv {
            writer: FakeExtentWriter::new(block_device),
            loops: FakeLoopControl::new(&root.join("dev")),
            dm: FakeDeviceMapper::new(&root.join("dev"), encrypted),
            options,
            tmp,
        }
    }

    /// Split images into pieces of at most size bytes.
    pub fn split(mut self, size: u64) -> TestEnv {
        self.writer = self.writer.with_piece_size(size);
        self
    }

    pub fn root(&self) -> &Path {
        self.tmp.path()
    }

    /// A view of the property store the managers use.
    pub fn properties(&self) -> FilePropertyStore {
        FilePropertyStore::new(self.options.property_dir())
    }

    /// A manager for the namespace prefix, on the fakes.
    pub fn manager(&self, prefix: &str) -> ImageManager {
        self.manager_with_properties(prefix, Box::new(self.properties()))
    }

    pub fn manager_with_properties(
        &self,
        prefix: &str,
        properties: Box<dyn PropertyStore>,
    ) -> ImageManager {
        ImageManager::with_backends(
            self.options.metadata_dir(prefix).unwrap(),
            self.options.data_dir(prefix).unwrap(),
            &self.options,
            ImageBackends {
                metadata: Box::new(JsonMetadataStore::new()),
                writer: Box::new(self.writer.clone()),
                loop_control: Box::new(self.loops.clone()),
                device_mapper: Box::new(self.dm.clone()),
                properties,
            },
        )
    }
}
