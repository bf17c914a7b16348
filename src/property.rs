// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use crate::{
    consts::MAPPED_IMAGE_PROPERTY_PREFIX,
    result::{ErrorEnum, ImageError, ImageResult},
    util::{remove_file_if_exists, write_atomic},
};

/// Key/value state that outlives the process which set it.
pub trait PropertyStore {
    /// The value of key, or default if the key is unset.
    fn get(&self, key: &str, default: &str) -> String;

    /// Set key to value. An empty value unsets the key.
    fn set(&self, key: &str, value: &str) -> ImageResult<()>;
}

/// The property recording the device an image is mapped to.
pub fn mapped_image_property(image_name: &str) -> String {
    format!("{MAPPED_IMAGE_PROPERTY_PREFIX}{image_name}")
}

/// Check that a key can name a file in the property directory.
fn check_key(key: &str) -> ImageResult<()> {
    if key.is_empty() || key.starts_with('.') || key.contains('/') || key.contains('\0') {
        return Err(ImageError::image(
            ErrorEnum::Invalid,
            format!("invalid property name \"{key}\""),
        ));
    }
    Ok(())
}

/// A property store keeping one file per key in a directory, normally on a
/// tmpfs so that properties survive process restarts but not reboots.
#[derive(Debug)]
pub struct FilePropertyStore {
    dir: PathBuf,
}

impl FilePropertyStore {
    /// Keep properties in dir. The directory is created when the first
    /// property is set.
    pub fn new<P: AsRef<Path>>(dir: P) -> FilePropertyStore {
        FilePropertyStore {
            dir: dir.as_ref().to_owned(),
        }
    }
}

impl PropertyStore for FilePropertyStore {
    fn get(&self, key: &str, default: &str) -> String {
        if check_key(key).is_err() {
            return default.to_owned();
        }
        match fs::read_to_string(self.dir.join(key)) {
            Ok(value) => value,
            Err(err) if err.kind() == io::ErrorKind::NotFound => default.to_owned(),
            Err(err) => {
                warn!("Could not read property {}: {}", key, err);
                default.to_owned()
            }
        }
    }

    fn set(&self, key: &str, value: &str) -> ImageResult<()> {
        check_key(key)?;
        let path = self.dir.join(key);
        if value.is_empty() {
            remove_file_if_exists(&path)?;
            return Ok(());
        }
        fs::create_dir_all(&self.dir).map_err(|err| {
            ImageError::io(format!("could not create {}", self.dir.display()), err)
        })?;
        write_atomic(&path, value.as_bytes())
    }
}

/// A property store that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryPropertyStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryPropertyStore {
    /// An empty store.
    pub fn new() -> MemoryPropertyStore {
        MemoryPropertyStore::default()
    }
}

impl PropertyStore for MemoryPropertyStore {
    fn get(&self, key: &str, default: &str) -> String {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_owned())
    }

    fn set(&self, key: &str, value: &str) -> ImageResult<()> {
        check_key(key)?;
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        if value.is_empty() {
            values.remove(key);
        } else {
            values.insert(key.to_owned(), value.to_owned());
        }
        Ok(())
    }
}
