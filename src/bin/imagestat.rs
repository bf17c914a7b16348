// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{env, process};

use imagemgr::{ImageManager, ImageManagerOptions};

fn main() {
    env_logger::init();

    let args = env::args().skip(1).collect::<Vec<_>>();
    let prefix = match args.as_slice() {
        [prefix] => prefix.as_str(),
        [] => "dsu",
        _ => {
            eprintln!("usage: imagestat [PREFIX]");
            process::exit(2);
        }
    };

    let options = ImageManagerOptions::default();
    let manager = match ImageManager::open_with_options(prefix, &options) {
        Ok(manager) => manager,
        Err(err) => {
            eprintln!("could not open namespace {prefix}: {err}");
            process::exit(2);
        }
    };
    println!("metadata: {}", manager.metadata_dir().display());
    println!("data:     {}", manager.data_dir().display());

    let images = match manager.backing_images() {
        Ok(images) => images,
        Err(err) => {
            eprintln!("could not list images: {err}");
            process::exit(1);
        }
    };

    for name in &images {
        let files = if manager.backing_image_exists(name) {
            "present"
        } else {
            "missing"
        };
        let mapped = match manager.mapped_image_device(name) {
            Some(device) => device.display().to_string(),
            None if manager.is_image_mapped(name) => "mapped, device unknown".to_owned(),
            None => "not mapped".to_owned(),
        };
        println!("{name}: files {files}, {mapped}");
    }

    if images.is_empty() {
        println!("no images");
        return;
    }

    match manager.validate() {
        Ok(()) => println!("all images valid"),
        Err(err) => {
            println!("validation failed: {err}");
            process::exit(1);
        }
    }
}
