// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Creation, mapping and removal of named backing images.
//!
//! An image named `name` in a namespace is stored as the header file
//! `<data_dir>/<name>.img`, possibly with continuation pieces, and is
//! registered in the metadata store of `<metadata_dir>`. While it is mapped,
//! `<metadata_dir>/<name>.status` lists the kernel resources implementing
//! the mapping and the property `gsid.mapped_image.<name>` holds the path of
//! the mapped device.
//!
//! An image is mapped in one of two ways:
//!
//! * If the filesystem holding the image sits on a device-mapper node that
//!   resolves to a partition, a linear target is built over the image's
//!   recorded extents on that partition.
//! * Otherwise every file of the image is attached to a loop device. If
//!   there is more than one file, a linear target stitches the loop devices
//!   together.

use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use crate::{
    consts::{IMAGE_SUFFIX, STATUS_SUFFIX, ZERO_FILL_CHUNK_SIZE, ZERO_FILL_MAP_TIMEOUT_SECS},
    dm_control::{DeviceMapperControl, DmDeviceState, KernelDeviceMapper},
    extent_writer::{is_device_mapper_node, ExtentWriter, ProgressFn},
    loop_control::{KernelLoopControl, LoopControl},
    mapped_device::MappedDevice,
    metadata::{JsonMetadataStore, MetadataStore},
    options::ImageManagerOptions,
    property::{mapped_image_property, FilePropertyStore, PropertyStore},
    result::{ErrorEnum, ImageError, ImageResult},
    rollback::Rollback,
    split::SplitFileWriter,
    status::{StatusEntry, StatusRecord},
    table::{extent_table, loop_device_table},
    util::device_size,
};

bitflags! {
    /// Options for creating a backing image.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct CreateFlags: u32 {
        /// Record the image as readonly.
        const READONLY = 0x1;
        /// Make sure the image reads back as zeroes through its mapping.
        const ZERO_FILL = 0x2;
    }
}

/// The collaborators an ImageManager works through.
pub struct ImageBackends {
    /// Extent layout of registered images
    pub metadata: Box<dyn MetadataStore>,
    /// Allocation of backing files
    pub writer: Box<dyn ExtentWriter>,
    /// Loop devices
    pub loop_control: Box<dyn LoopControl>,
    /// Device-mapper devices
    pub device_mapper: Box<dyn DeviceMapperControl>,
    /// The mapped-state markers
    pub properties: Box<dyn PropertyStore>,
}

impl ImageBackends {
    /// Backends acting on the running system.
    pub fn system(options: &ImageManagerOptions) -> ImageBackends {
        ImageBackends {
            metadata: Box::new(JsonMetadataStore::new()),
            writer: Box::new(SplitFileWriter::new(options)),
            loop_control: Box::new(KernelLoopControl::new()),
            device_mapper: Box::new(KernelDeviceMapper::new()),
            properties: Box::new(FilePropertyStore::new(options.property_dir())),
        }
    }
}

/// Manages the backing images of one namespace.
pub struct ImageManager {
    metadata_dir: PathBuf,
    data_dir: PathBuf,
    test_metadata_root: PathBuf,
    metadata: Box<dyn MetadataStore>,
    writer: Box<dyn ExtentWriter>,
    loop_control: Box<dyn LoopControl>,
    device_mapper: Box<dyn DeviceMapperControl>,
    properties: Box<dyn PropertyStore>,
}

/// Check that name can name an image file, a status file entry and a
/// property.
fn check_name(name: &str) -> ImageResult<()> {
    let bad_char = |c: char| c == '/' || c == ':' || c.is_control();
    if name.is_empty() || name.starts_with('.') || name.contains(bad_char) {
        return Err(ImageError::image(ErrorEnum::Invalid, format!("invalid image name {name:?}")));
    }
    Ok(())
}

impl ImageManager {
    /// Open the namespace prefix under the default metadata and data roots.
    pub fn open(prefix: &str) -> ImageResult<ImageManager> {
        ImageManager::open_with_options(prefix, &ImageManagerOptions::default())
    }

    /// Open the namespace prefix under the roots given in options, acting
    /// on the running system.
    pub fn open_with_options(
        prefix: &str,
        options: &ImageManagerOptions,
    ) -> ImageResult<ImageManager> {
        Ok(ImageManager::with_backends(
            options.metadata_dir(prefix)?,
            options.data_dir(prefix)?,
            options,
            ImageBackends::system(options),
        ))
    }

    /// Manage the images registered in metadata_dir and stored in data_dir,
    /// through the given backends.
    pub fn with_backends<P, Q>(
        metadata_dir: P,
        data_dir: Q,
        options: &ImageManagerOptions,
        backends: ImageBackends,
    ) -> ImageManager
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
    {
        ImageManager {
            metadata_dir: metadata_dir.as_ref().to_owned(),
            data_dir: data_dir.as_ref().to_owned(),
            test_metadata_root: options.test_metadata_root().to_owned(),
            metadata: backends.metadata,
            writer: backends.writer,
            loop_control: backends.loop_control,
            device_mapper: backends.device_mapper,
            properties: backends.properties,
        }
    }

    /// The directory holding metadata and status files.
    pub fn metadata_dir(&self) -> &Path {
        &self.metadata_dir
    }

    /// The directory holding backing files.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn header_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{name}{IMAGE_SUFFIX}"))
    }

    fn status_path(&self, name: &str) -> PathBuf {
        self.metadata_dir.join(format!("{name}{STATUS_SUFFIX}"))
    }

    fn is_test_namespace(&self) -> bool {
        self.metadata_dir.starts_with(&self.test_metadata_root)
    }

    /// Whether the backing files of name exist.
    pub fn backing_image_exists(&self, name: &str) -> bool {
        self.header_path(name).exists()
    }

    /// Whether name is registered in the metadata store.
    pub fn partition_exists(&self, name: &str) -> bool {
        if !self.metadata.exists(&self.metadata_dir) {
            return false;
        }
        match self.metadata.open(&self.metadata_dir) {
            Ok(metadata) => metadata.find(name).is_some(),
            Err(err) => {
                warn!(
                    "Could not read metadata in {}: {}",
                    self.metadata_dir.display(),
                    err
                );
                false
            }
        }
    }

    /// The names of all registered images.
    pub fn backing_images(&self) -> ImageResult<Vec<String>> {
        if !self.metadata.exists(&self.metadata_dir) {
            return Ok(Vec::new());
        }
        let metadata = self.metadata.open(&self.metadata_dir)?;
        Ok(metadata.partitions.into_iter().map(|p| p.name).collect())
    }

    /// Whether name is mapped. An image mapped before this process could
    /// record it has a device-mapper device but no property; either is
    /// taken as proof.
    pub fn is_image_mapped(&self, name: &str) -> bool {
        let value = self.properties.get(&mapped_image_property(name), "");
        !value.is_empty() || self.device_mapper.state(name) != DmDeviceState::Invalid
    }

    /// The device name is mapped to, as recorded when it was mapped.
    pub fn mapped_image_device(&self, name: &str) -> Option<PathBuf> {
        let value = self.properties.get(&mapped_image_property(name), "");
        if value.is_empty() {
            None
        } else {
            Some(PathBuf::from(value))
        }
    }

    /// Allocate size bytes of storage for a new image name and register it.
    ///
    /// Images may not be registered against a device-mapper device outside
    /// the test metadata root, as device numbering is not stable across
    /// reboots. If creation fails at any step, no files and no registration
    /// are left behind.
    pub fn create_backing_image(
        &self,
        name: &str,
        size: u64,
        flags: CreateFlags,
        on_progress: Option<ProgressFn<'_>>,
    ) -> ImageResult<()> {
        check_name(name)?;
        let header = self.header_path(name);
        if self.backing_image_exists(name) {
            return Err(ImageError::image(
                ErrorEnum::AlreadyExists,
                format!("backing image {name} already exists"),
            ));
        }

        let file = self.writer.create(&header, size, on_progress)?;

        if is_device_mapper_node(file.block_device()) && !self.is_test_namespace() {
            error!(
                "Cannot persist images against device-mapper device: {}",
                file.block_device().display()
            );
            self.remove_files(&header);
            return Err(ImageError::image(
                ErrorEnum::Invalid,
                format!(
                    "{} is a device-mapper device",
                    file.block_device().display()
                ),
            ));
        }

        let readonly = flags.contains(CreateFlags::READONLY);
        if let Err(err) = self
            .metadata
            .update(&self.metadata_dir, name, &file, size, readonly)
        {
            error!("Could not register image {}: {}", name, err);
            self.remove_files(&header);
            return Err(err);
        }

        if flags.contains(CreateFlags::ZERO_FILL) {
            if let Err(err) = self.zero_fill_new_image(name) {
                error!("Could not zero-fill image {}: {}", name, err);
                if let Err(delete_err) = self.delete_backing_image(name) {
                    error!("Could not delete image {}: {}", name, delete_err);
                }
                return Err(err);
            }
        }

        info!("Created backing image {} ({} bytes)", name, size);
        Ok(())
    }

    fn remove_files(&self, header: &Path) {
        if let Err(err) = self.writer.remove_split_files(header) {
            error!("Could not remove {}: {}", header.display(), err);
        }
    }

    /// Zeroes written to a file on an encrypted volume read back as
    /// ciphertext through a linear mapping. Rewrite them through the
    /// mapping so that the mapped image reads back as zeroes.
    fn zero_fill_new_image(&self, name: &str) -> ImageResult<()> {
        let header = self.header_path(name);
        let device = self.writer.block_device_for_file(&header)?;
        if !device.can_use_device_mapper {
            return Ok(());
        }

        let timeout = Duration::from_secs(ZERO_FILL_MAP_TIMEOUT_SECS);
        let mapped = MappedDevice::open(self, timeout, name)?;
        let mut file = mapped.file();
        let mut remaining = device_size(file)?;
        if remaining == 0 {
            return Err(ImageError::image(
                ErrorEnum::Error,
                format!("mapped device {} has no size", mapped.path().display()),
            ));
        }

        let zeroes = [0u8; ZERO_FILL_CHUNK_SIZE];
        while remaining > 0 {
            let len = remaining.min(ZERO_FILL_CHUNK_SIZE as u64);
            file.write_all(&zeroes[..len as usize]).map_err(|err| {
                ImageError::io(format!("write failed: {}", mapped.path().display()), err)
            })?;
            remaining -= len;
        }
        file.sync_all()?;
        Ok(())
    }

    /// Remove the backing files, status file and registration of name.
    /// Refused while the image is mapped, since the filesystem could hand
    /// the image's blocks to another file while a mapping still refers to
    /// them.
    pub fn delete_backing_image(&self, name: &str) -> ImageResult<()> {
        if self.is_image_mapped(name) {
            return Err(ImageError::image(
                ErrorEnum::Busy,
                format!("backing image {name} is currently mapped to a block device"),
            ));
        }

        self.writer.remove_split_files(&self.header_path(name))?;

        let status_path = self.status_path(name);
        if let Err(err) = StatusRecord::remove(&status_path) {
            error!("Error removing {}: {}", status_path.display(), err);
        }
        self.metadata.remove_entry(&self.metadata_dir, name)?;
        info!("Deleted backing image {}", name);
        Ok(())
    }

    /// Delete every registered image, then the namespace's metadata. The
    /// metadata is kept if any image could not be deleted.
    pub fn remove_all_images(&self) -> ImageResult<()> {
        if !self.metadata.exists(&self.metadata_dir) {
            return Ok(());
        }
        let metadata = match self.metadata.open(&self.metadata_dir) {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!("Discarding unreadable metadata: {}", err);
                return self.metadata.remove_namespace(&self.metadata_dir);
            }
        };

        let mut failed = Vec::new();
        for partition in &metadata.partitions {
            if let Err(err) = self.delete_backing_image(&partition.name) {
                error!("Could not delete image {}: {}", partition.name, err);
                failed.push(partition.name.as_str());
            }
        }
        if !failed.is_empty() {
            return Err(ImageError::image(
                ErrorEnum::Busy,
                format!("could not delete images: {}", failed.join(", ")),
            ));
        }

        self.metadata.remove_namespace(&self.metadata_dir)
    }

    /// Check that every registered image still has its files, and that
    /// their blocks are pinned where the metadata says they are.
    pub fn validate(&self) -> ImageResult<()> {
        let metadata = self.metadata.open(&self.metadata_dir)?;
        for partition in &metadata.partitions {
            let header = self.header_path(&partition.name);
            let file = self.writer.open(&header).map_err(|err| {
                error!("Image is missing: {}", header.display());
                err
            })?;
            if !file.has_pinned_extents() || file.linear_extents() != partition.extents {
                error!("Image was moved: {}", header.display());
                return Err(ImageError::image(
                    ErrorEnum::Invalid,
                    format!("extents of {} have moved", header.display()),
                ));
            }
        }
        Ok(())
    }

    /// Map name to a block device, waiting up to timeout for the kernel.
    /// Return the path of the device.
    pub fn map_image_device(&self, name: &str, timeout: Duration) -> ImageResult<PathBuf> {
        check_name(name)?;
        if self.is_image_mapped(name) {
            return Err(ImageError::image(
                ErrorEnum::Busy,
                format!("backing image {name} is already mapped"),
            ));
        }

        let header = self.header_path(name);
        let device = self.writer.block_device_for_file(&header)?;
        let path = if device.can_use_device_mapper {
            self.map_with_dm_linear(name, timeout)?
        } else {
            self.map_with_loop_devices(name, timeout)?
        };

        let value = path.display().to_string();
        if let Err(err) = self.properties.set(&mapped_image_property(name), &value) {
            error!("Could not record mapping of {}: {}", name, err);
            if let Err(unmap_err) = self.force_unmap_image_device(name) {
                error!("Could not unmap {}: {}", name, unmap_err);
            }
            return Err(err);
        }

        info!("Mapped backing image {} to {}", name, path.display());
        Ok(path)
    }

    /// Map name with a linear target over its recorded extents, without
    /// waiting for a device node. Return the "major:minor" string of the
    /// new device.
    pub fn map_image_with_device_mapper(&self, name: &str) -> ImageResult<String> {
        check_name(name)?;
        self.map_with_dm_linear(name, Duration::ZERO)?;
        self.device_mapper.device_string(name)
    }

    fn map_with_dm_linear(&self, name: &str, timeout: Duration) -> ImageResult<PathBuf> {
        let metadata = self.metadata.open(&self.metadata_dir)?;
        let partition = metadata.find(name).ok_or_else(|| {
            ImageError::image(
                ErrorEnum::NotFound,
                format!("could not find image in metadata: {name}"),
            )
        })?;
        let table = extent_table(&metadata, partition)?;

        let path = self.device_mapper.create(name, &table, timeout)?;
        let mut rollback = Rollback::new();
        rollback.push(|| {
            if let Err(err) = self.device_mapper.delete(name) {
                warn!("Could not remove device {}: {}", name, err);
            }
        });

        StatusRecord::device_mapper(name).write(&self.status_path(name))?;
        rollback.commit();
        Ok(path)
    }

    fn map_with_loop_devices(&self, name: &str, timeout: Duration) -> ImageResult<PathBuf> {
        let files = self.writer.split_file_list(&self.header_path(name))?;

        let mut rollback = Rollback::new();
        let mut devices = Vec::with_capacity(files.len());
        let start = Instant::now();
        for file in &files {
            let remaining = timeout.saturating_sub(start.elapsed());
            let device = self.loop_control.attach(file, remaining)?;
            info!(
                "Created loop device {} for file {}",
                device.display(),
                file.display()
            );
            let attached = device.clone();
            rollback.push(move || {
                if let Err(err) = self.loop_control.detach(&attached) {
                    warn!("Could not detach {}: {}", attached.display(), err);
                }
            });
            devices.push(device);
        }

        // Without direct I/O every page would be cached twice.
        for device in &devices {
            self.loop_control.enable_direct_io(device)?;
        }

        let (path, record) = match devices.as_slice() {
            [] => {
                return Err(ImageError::image(
                    ErrorEnum::NotFound,
                    format!("backing image {name} has no files"),
                ))
            }
            [device] => (device.clone(), StatusRecord::single_loop(device)),
            _ => {
                let path = self.map_with_loop_device_list(&devices, name, timeout)?;
                rollback.push(|| {
                    if let Err(err) = self.device_mapper.delete(name) {
                        warn!("Could not remove device {}: {}", name, err);
                    }
                });
                (path, StatusRecord::stitched_loops(name, &devices))
            }
        };

        record.write(&self.status_path(name))?;
        rollback.commit();
        Ok(path)
    }

    /// Join loop devices, in order, into one device the recorded size of
    /// name.
    fn map_with_loop_device_list(
        &self,
        devices: &[PathBuf],
        name: &str,
        timeout: Duration,
    ) -> ImageResult<PathBuf> {
        let metadata = self.metadata.open(&self.metadata_dir)?;
        let partition = metadata.find(name).ok_or_else(|| {
            ImageError::image(
                ErrorEnum::NotFound,
                format!("could not find image in metadata: {name}"),
            )
        })?;

        let sized = devices
            .iter()
            .map(|device| {
                let file = File::open(device).map_err(|err| {
                    ImageError::io(format!("open failed: {}", device.display()), err)
                })?;
                Ok((device.clone(), device_size(&file)?))
            })
            .collect::<ImageResult<Vec<_>>>()?;
        let table = loop_device_table(&sized, metadata.size_of(partition))?;

        self.device_mapper
            .create(name, &table, timeout)
            .map_err(|err| {
                error!("Could not create device-mapper device over loop set: {err}");
                err
            })
    }

    /// Tear down the mapping of name, following its status file.
    pub fn unmap_image_device(&self, name: &str) -> ImageResult<()> {
        self.unmap(name, false)
    }

    /// Tear down the mapping of name even if it is not recorded as mapped.
    pub fn force_unmap_image_device(&self, name: &str) -> ImageResult<()> {
        self.unmap(name, true)
    }

    fn unmap(&self, name: &str, force: bool) -> ImageResult<()> {
        if !force && !self.is_image_mapped(name) {
            return Err(ImageError::image(
                ErrorEnum::NotFound,
                format!("backing image {name} is not mapped"),
            ));
        }

        let status_path = self.status_path(name);
        let record = StatusRecord::read(&status_path)?;
        for entry in record.entries() {
            match entry {
                // A device left above the loop devices keeps them busy;
                // stop here so that a retry can resume.
                StatusEntry::DeviceMapper(device) => self.device_mapper.delete_if_exists(device)?,
                StatusEntry::Loop(device) => {
                    if let Err(err) = self.loop_control.detach(device) {
                        warn!("Could not detach {}: {}", device.display(), err);
                    }
                }
            }
        }

        if let Err(err) = StatusRecord::remove(&status_path) {
            error!("Could not remove {}: {}", status_path.display(), err);
        }
        if let Err(err) = self.properties.set(&mapped_image_property(name), "") {
            error!("Could not clear mapped state of {}: {}", name, err);
        }
        info!("Unmapped backing image {}", name);
        Ok(())
    }
}
