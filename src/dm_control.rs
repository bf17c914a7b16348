// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use devicemapper::{
    devnode_to_devno, DevId, Device, DmDevice, DmFlags, DmName, DmOptions, LinearDev,
    LinearDevTargetParams, LinearTargetParams, Sectors, TargetLine, DM,
};

use crate::{
    result::{ErrorEnum, ImageError, ImageResult},
    table::LinearTable,
    util::wait_for_path,
};

/// The state of a device-mapper device, as far as mapping is concerned.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DmDeviceState {
    /// No device of that name exists
    Invalid,
    /// The device exists but I/O to it is suspended
    Suspended,
    /// The device exists and is live
    Active,
}

/// Creates and removes named device-mapper devices.
pub trait DeviceMapperControl {
    /// Create a device named name from table and wait up to timeout for
    /// its device node. A zero timeout does not wait. Return the path of
    /// the device node.
    fn create(&self, name: &str, table: &LinearTable, timeout: Duration) -> ImageResult<PathBuf>;

    /// The "major:minor" string of the device named name.
    fn device_string(&self, name: &str) -> ImageResult<String>;

    /// Remove the device named name.
    fn delete(&self, name: &str) -> ImageResult<()>;

    /// Remove the device named name if there is one.
    fn delete_if_exists(&self, name: &str) -> ImageResult<()> {
        if self.state(name) == DmDeviceState::Invalid {
            return Ok(());
        }
        self.delete(name)
    }

    /// The state of the device named name.
    fn state(&self, name: &str) -> DmDeviceState;
}

/// Device-mapper devices managed through /dev/mapper/control.
#[derive(Debug, Default)]
pub struct KernelDeviceMapper;

impl KernelDeviceMapper {
    /// Make a new KernelDeviceMapper.
    pub fn new() -> KernelDeviceMapper {
        KernelDeviceMapper
    }

    fn device_for_node(path: &Path) -> ImageResult<Device> {
        match devnode_to_devno(path)? {
            Some(devno) => Ok(Device::from(devno)),
            None => Err(ImageError::image(
                ErrorEnum::NotFound,
                format!("{} is not a block device", path.display()),
            )),
        }
    }

    fn dm_table(table: &LinearTable) -> ImageResult<Vec<TargetLine<LinearDevTargetParams>>> {
        table
            .targets()
            .iter()
            .map(|target| {
                let device = KernelDeviceMapper::device_for_node(&target.device)?;
                Ok(TargetLine::new(
                    Sectors(target.start),
                    Sectors(target.length),
                    LinearDevTargetParams::Linear(LinearTargetParams::new(
                        device,
                        Sectors(target.offset),
                    )),
                ))
            })
            .collect()
    }

    fn exists(dm: &DM, name: &DmName) -> ImageResult<bool> {
        Ok(dm
            .list_devices()?
            .iter()
            .any(|(dev_name, _, _)| dev_name.as_bytes() == name.as_bytes()))
    }
}

impl DeviceMapperControl for KernelDeviceMapper {
    fn create(&self, name: &str, table: &LinearTable, timeout: Duration) -> ImageResult<PathBuf> {
        if table.is_empty() {
            return Err(ImageError::image(
                ErrorEnum::Invalid,
                format!("empty table for device {name}"),
            ));
        }
        let dm = DM::new()?;
        let dm_name = DmName::new(name)?;
        if KernelDeviceMapper::exists(&dm, dm_name)? {
            return Err(ImageError::image(
                ErrorEnum::AlreadyExists,
                format!("device-mapper device {name} already exists"),
            ));
        }

        let dev = LinearDev::setup(&dm, dm_name, None, KernelDeviceMapper::dm_table(table)?)?;
        let devnode = dev.devnode();
        if !timeout.is_zero() {
            if let Err(err) = wait_for_path(&devnode, timeout) {
                let id = DevId::Name(dm_name);
                if let Err(remove_err) = dm.device_remove(&id, DmOptions::default()) {
                    warn!("Could not remove device {}: {}", name, remove_err);
                }
                return Err(err);
            }
        }

        info!(
            "Created device-mapper device {} at {} ({} sectors)",
            name,
            devnode.display(),
            table.num_sectors()
        );
        Ok(devnode)
    }

    fn device_string(&self, name: &str) -> ImageResult<String> {
        let dm = DM::new()?;
        let info = dm.device_info(&DevId::Name(DmName::new(name)?))?;
        Ok(info.device().to_string())
    }

    fn delete(&self, name: &str) -> ImageResult<()> {
        let dm = DM::new()?;
        dm.device_remove(&DevId::Name(DmName::new(name)?), DmOptions::default())?;
        debug!("Removed device-mapper device {}", name);
        Ok(())
    }

    fn state(&self, name: &str) -> DmDeviceState {
        let lookup = || -> ImageResult<DmDeviceState> {
            let dm = DM::new()?;
            let dm_name = DmName::new(name)?;
            if !KernelDeviceMapper::exists(&dm, dm_name)? {
                return Ok(DmDeviceState::Invalid);
            }
            let info = dm.device_info(&DevId::Name(dm_name))?;
            if info.flags().contains(DmFlags::DM_SUSPEND) {
                Ok(DmDeviceState::Suspended)
            } else {
                Ok(DmDeviceState::Active)
            }
        };
        lookup().unwrap_or_else(|err| {
            debug!("Could not query device {}: {}", name, err);
            DmDeviceState::Invalid
        })
    }
}
