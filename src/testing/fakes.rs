// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Stand-ins for the kernel and the filesystem. Device nodes are hard links
//! in a scratch directory, so data written through a mapped path can be
//! read back without privileges.

use std::{
    collections::{BTreeMap, HashMap},
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::Duration,
};

use crate::{
    dm_control::{DeviceMapperControl, DmDeviceState},
    extent_writer::{BackingFile, BlockDevice, ExtentWriter, ProgressFn},
    fiemap::{Extent, ExtentFlags},
    loop_control::LoopControl,
    result::{ErrorEnum, ImageError, ImageResult},
    split::{piece_path, piece_sizes, remove_split_files, split_file_list},
    table::LinearTable,
    util::remove_file_if_exists,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Default)]
struct LoopState {
    next: u32,
    // device node -> backing file
    active: BTreeMap<PathBuf, PathBuf>,
    limit: Option<usize>,
    timeouts: Vec<Duration>,
    attach_delay: Duration,
    fail_direct_io: bool,
    fail_detach: bool,
}

/// Loop devices as hard links named loopN.
#[derive(Clone, Debug)]
pub struct FakeLoopControl {
    dev_dir: PathBuf,
    state: Arc<Mutex<LoopState>>,
}

impl FakeLoopControl {
    pub fn new(dev_dir: &Path) -> FakeLoopControl {
        fs::create_dir_all(dev_dir).unwrap();
        FakeLoopControl {
            dev_dir: dev_dir.to_owned(),
            state: Arc::new(Mutex::new(LoopState::default())),
        }
    }

    /// Refuse attaches once limit devices are attached.
    pub fn set_limit(&self, limit: Option<usize>) {
        lock(&self.state).limit = limit;
    }

    /// Make each attach take at least delay.
    pub fn set_attach_delay(&self, delay: Duration) {
        lock(&self.state).attach_delay = delay;
    }

    pub fn set_fail_direct_io(&self, fail: bool) {
        lock(&self.state).fail_direct_io = fail;
    }

    pub fn set_fail_detach(&self, fail: bool) {
        lock(&self.state).fail_detach = fail;
    }

    /// Attached device nodes, in name order
    pub fn active(&self) -> Vec<PathBuf> {
        lock(&self.state).active.keys().cloned().collect()
    }

    /// The timeout passed to each attach, in call order
    pub fn timeouts(&self) -> Vec<Duration> {
        lock(&self.state).timeouts.clone()
    }
}

impl LoopControl for FakeLoopControl {
    fn attach(&self, file: &Path, timeout: Duration) -> ImageResult<PathBuf> {
        let mut state = lock(&self.state);
        state.timeouts.push(timeout);
        thread::sleep(state.attach_delay);
        if state.limit.is_some_and(|limit| state.active.len() >= limit) {
            return Err(ImageError::image(ErrorEnum::Busy, "no free loop device"));
        }
        let device = self.dev_dir.join(format!("loop{}", state.next));
        state.next += 1;
        fs::hard_link(file, &device)?;
        state.active.insert(device.clone(), file.to_owned());
        Ok(device)
    }

    fn detach(&self, device: &Path) -> ImageResult<()> {
        let mut state = lock(&self.state);
        if state.fail_detach {
            return Err(ImageError::image(ErrorEnum::Busy, "detach refused"));
        }
        if state.active.remove(device).is_none() {
            return Err(ImageError::image(
                ErrorEnum::NotFound,
                format!("{} is not attached", device.display()),
            ));
        }
        fs::remove_file(device)?;
        Ok(())
    }

    fn enable_direct_io(&self, device: &Path) -> ImageResult<()> {
        let state = lock(&self.state);
        if state.fail_direct_io {
            return Err(ImageError::image(ErrorEnum::Error, "direct I/O refused"));
        }
        if !state.active.contains_key(device) {
            return Err(ImageError::image(ErrorEnum::NotFound, "not attached"));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct DmState {
    next_minor: u32,
    // name -> (minor, device node, table)
    active: BTreeMap<String, (u32, PathBuf, LinearTable)>,
    fail_create: bool,
    fail_delete: bool,
    hide_nodes: bool,
}

/// Device-mapper devices whose contents live in per-name store files, so
/// that they survive removal and re-creation of the device. With
/// encrypted set, a new store reads back as non-zero bytes, as the
/// ciphertext of zeroes would.
#[derive(Clone, Debug)]
pub struct FakeDeviceMapper {
    dev_dir: PathBuf,
    encrypted: bool,
    state: Arc<Mutex<DmState>>,
}

impl FakeDeviceMapper {
    pub fn new(dev_dir: &Path, encrypted: bool) -> FakeDeviceMapper {
        fs::create_dir_all(dev_dir.join("dm-store")).unwrap();
        FakeDeviceMapper {
            dev_dir: dev_dir.to_owned(),
            encrypted,
            state: Arc::new(Mutex::new(DmState::default())),
        }
    }

    pub fn set_fail_create(&self, fail: bool) {
        lock(&self.state).fail_create = fail;
    }

    pub fn set_fail_delete(&self, fail: bool) {
        lock(&self.state).fail_delete = fail;
    }

    /// Create devices without device nodes.
    pub fn set_hide_nodes(&self, hide: bool) {
        lock(&self.state).hide_nodes = hide;
    }

    /// Names of live devices
    pub fn active(&self) -> Vec<String> {
        lock(&self.state).active.keys().cloned().collect()
    }

    /// The table a live device was created with
    pub fn table(&self, name: &str) -> Option<LinearTable> {
        lock(&self.state)
            .active
            .get(name)
            .map(|(_, _, table)| table.clone())
    }

    /// Make a device exist the way an early boot stage would leave it:
    /// no status file and no property.
    pub fn insert_active(&self, name: &str) {
        let mut state = lock(&self.state);
        let minor = state.next_minor;
        state.next_minor += 1;
        let node = self.dev_dir.join(format!("dm-{minor}"));
        File::create(&node).unwrap();
        state
            .active
            .insert(name.to_owned(), (minor, node, LinearTable::new()));
    }

    fn store_path(&self, name: &str) -> PathBuf {
        self.dev_dir.join("dm-store").join(name)
    }
}

impl DeviceMapperControl for FakeDeviceMapper {
    fn create(&self, name: &str, table: &LinearTable, _timeout: Duration) -> ImageResult<PathBuf> {
        let mut state = lock(&self.state);
        if state.fail_create {
            return Err(ImageError::image(ErrorEnum::Error, "create refused"));
        }
        if state.active.contains_key(name) {
            return Err(ImageError::image(
                ErrorEnum::AlreadyExists,
                format!("device {name} already exists"),
            ));
        }

        let store = self.store_path(name);
        if !store.exists() {
            let len = table.num_sectors() * 512;
            let fill = if self.encrypted { 0xA5 } else { 0 };
            let mut file = File::create(&store)?;
            file.write_all(&vec![fill; len as usize])?;
        }

        let minor = state.next_minor;
        state.next_minor += 1;
        let node = self.dev_dir.join(format!("dm-{minor}"));
        if !state.hide_nodes {
            fs::hard_link(&store, &node)?;
        }
        state
            .active
            .insert(name.to_owned(), (minor, node.clone(), table.clone()));
        Ok(node)
    }

    fn device_string(&self, name: &str) -> ImageResult<String> {
        lock(&self.state)
            .active
            .get(name)
            .map(|(minor, _, _)| format!("253:{minor}"))
            .ok_or_else(|| ImageError::image(ErrorEnum::NotFound, format!("no device {name}")))
    }

    fn delete(&self, name: &str) -> ImageResult<()> {
        let mut state = lock(&self.state);
        if state.fail_delete {
            return Err(ImageError::image(ErrorEnum::Busy, format!("device {name} busy")));
        }
        let (_, node, _) = state
            .active
            .remove(name)
            .ok_or_else(|| ImageError::image(ErrorEnum::NotFound, format!("no device {name}")))?;
        remove_file_if_exists(&node)?;
        Ok(())
    }

    fn state(&self, name: &str) -> DmDeviceState {
        if lock(&self.state).active.contains_key(name) {
            DmDeviceState::Active
        } else {
            DmDeviceState::Invalid
        }
    }
}

#[derive(Debug, Default)]
struct WriterState {
    next_physical: u64,
    extents: HashMap<PathBuf, Vec<Extent>>,
    fail_create: bool,
}

/// Backing files as sparse files, given made-up extents laid out one after
/// another on a configurable block device.
#[derive(Clone, Debug)]
pub struct FakeExtentWriter {
    block_device: BlockDevice,
    piece_size: u64,
    state: Arc<Mutex<WriterState>>,
}

impl FakeExtentWriter {
    pub fn new(block_device: BlockDevice) -> FakeExtentWriter {
        FakeExtentWriter {
            block_device,
            piece_size: 0,
            state: Arc::new(Mutex::new(WriterState {
                next_physical: 1 << 20,
                ..Default::default()
            })),
        }
    }

    /// Split images into pieces of at most size bytes.
    pub fn with_piece_size(mut self, size: u64) -> FakeExtentWriter {
        self.piece_size = size;
        self
    }

    pub fn set_fail_create(&self, fail: bool) {
        lock(&self.state).fail_create = fail;
    }

    /// Simulate the filesystem relocating the image's blocks.
    pub fn move_extents(&self, header: &Path) {
        if let Some(extents) = lock(&self.state).extents.get_mut(header) {
            for extent in extents.iter_mut() {
                extent.physical += 1 << 30;
            }
        }
    }

    /// Simulate the image's blocks losing their fixed location.
    pub fn unpin(&self, header: &Path) {
        if let Some(extents) = lock(&self.state).extents.get_mut(header) {
            for extent in extents.iter_mut() {
                extent.flags |= ExtentFlags::UNWRITTEN;
            }
        }
    }
}

impl ExtentWriter for FakeExtentWriter {
    fn create(
        &self,
        header: &Path,
        size: u64,
        mut progress: Option<ProgressFn<'_>>,
    ) -> ImageResult<BackingFile> {
        let mut state = lock(&self.state);
        if state.fail_create {
            return Err(ImageError::image(ErrorEnum::Error, "out of space"));
        }
        if header.exists() {
            return Err(ImageError::image(
                ErrorEnum::AlreadyExists,
                format!("{} exists", header.display()),
            ));
        }
        if let Some(dir) = header.parent() {
            fs::create_dir_all(dir)?;
        }

        let sizes = piece_sizes(size, self.piece_size);
        let files = if sizes.len() == 1 {
            vec![header.to_owned()]
        } else {
            (1..=sizes.len()).map(|i| piece_path(header, i)).collect()
        };

        let mut extents = Vec::new();
        let mut done = 0;
        for (path, len) in files.iter().zip(&sizes) {
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)?
                .set_len(*len)?;
            let length = len.div_ceil(4096) * 4096;
            extents.push(Extent {
                logical: 0,
                physical: state.next_physical,
                length,
                flags: ExtentFlags::LAST,
            });
            state.next_physical += length;
            done += len;
            if let Some(progress) = progress.as_mut() {
                progress(done, size);
            }
        }

        if files.len() > 1 {
            let names = files
                .iter()
                .filter_map(|f| f.file_name().and_then(|n| n.to_str()))
                .map(|n| format!("{n}\n"))
                .collect::<String>();
            fs::write(header, names)?;
        }

        state.extents.insert(header.to_owned(), extents.clone());
        Ok(BackingFile::new(header, files, size, &self.block_device.path, extents))
    }

    fn open(&self, header: &Path) -> ImageResult<BackingFile> {
        let files = split_file_list(header)?;
        let mut size = 0;
        for file in &files {
            size += fs::metadata(file)?.len();
        }
        let extents = lock(&self.state)
            .extents
            .get(header)
            .cloned()
            .ok_or_else(|| {
                ImageError::image(
                    ErrorEnum::NotFound,
                    format!("no extents for {}", header.display()),
                )
            })?;
        Ok(BackingFile::new(header, files, size, &self.block_device.path, extents))
    }

    fn block_device_for_file(&self, path: &Path) -> ImageResult<BlockDevice> {
        if !path.exists() {
            return Err(ImageError::image(
                ErrorEnum::NotFound,
                format!("{} does not exist", path.display()),
            ));
        }
        Ok(self.block_device.clone())
    }

    fn split_file_list(&self, header: &Path) -> ImageResult<Vec<PathBuf>> {
        split_file_list(header)
    }

    fn remove_split_files(&self, header: &Path) -> ImageResult<()> {
        lock(&self.state).extents.remove(header);
        remove_split_files(header)
    }
}
