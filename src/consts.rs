// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use devicemapper::IEC;

/// Root under which per-namespace metadata directories live.
pub const METADATA_ROOT: &str = "/metadata/gsi";

/// Root under which per-namespace data directories live.
pub const DATA_ROOT: &str = "/data/gsi";

/// Metadata directories under this root may hold images whose backing
/// storage is itself a device-mapper device. Such images do not survive
/// a reboot, which is acceptable only for tests.
pub const TEST_METADATA_ROOT: &str = "/metadata/gsi/test";

/// Directory holding the file-backed property store.
pub const PROPERTY_DIR: &str = "/run/imagemgr/properties";

/// Prefix of the property marking an image as mapped. The image name is
/// not namespaced, so image names must be globally unique.
pub const MAPPED_IMAGE_PROPERTY_PREFIX: &str = "gsid.mapped_image.";

/// Suffix of the header file of a backing image in its data directory.
pub const IMAGE_SUFFIX: &str = ".img";

/// Suffix of the per-image status file in the metadata directory.
pub const STATUS_SUFFIX: &str = ".status";

/// Name of the metadata file in a metadata directory.
pub const METADATA_FILE: &str = "lp_metadata.json";

/// Size of the writes used to zero-fill a freshly mapped image.
pub const ZERO_FILL_CHUNK_SIZE: usize = 4096;

/// Size of the writes used to initialize backing files.
pub const ALLOCATION_CHUNK_SIZE: usize = IEC::Mi as usize;

/// Timeout used when mapping an image in order to zero-fill it.
pub const ZERO_FILL_MAP_TIMEOUT_SECS: u64 = 10;

/// Largest file FAT filesystems can hold.
pub const FAT_MAX_FILE_SIZE: u64 = 4 * IEC::Gi - 1;

/// Interval between checks for a device node to appear.
pub const DEVICE_POLL_INTERVAL_MS: u64 = 10;
