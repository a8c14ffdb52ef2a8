// Copyright (c) Harpoon developers, 2024, licensed under the EUPL-1.2-or-later.
//
// See LICENSE at the root of this repository (or a legal translation in LICENSE-translations).

use std::env;
use std::fs;
use std::io;
use std::path::PathBuf;

const OBJECT_ENV: &str = "HARPOON_EBPF_OBJECT";

fn main() -> io::Result<()> {
    println!("cargo:rerun-if-env-changed={OBJECT_ENV}");

    let out_dir = PathBuf::from(env::var_os("OUT_DIR").expect("cargo sets OUT_DIR"));
    let profile = env::var("PROFILE").unwrap_or_else(|_| "debug".to_owned());
    let manifest_dir =
        PathBuf::from(env::var_os("CARGO_MANIFEST_DIR").expect("cargo sets CARGO_MANIFEST_DIR"));

    let object = env::var_os(OBJECT_ENV).map(PathBuf::from).unwrap_or_else(|| {
        manifest_dir
            .join("../target/bpfel-unknown-none")
            .join(&profile)
            .join("harpoon")
    });
    println!("cargo:rerun-if-changed={}", object.display());

    let embedded = out_dir.join("harpoon.bpf.o");
    if object.is_file() {
        fs::copy(&object, &embedded)?;
    } else {
        println!(
            "cargo:warning=kernel-side object not found at {}; run `cargo xtask build-ebpf{}` first",
            object.display(),
            if profile == "release" { " --release" } else { "" }
        );
        fs::write(&embedded, b"")?;
    }
    Ok(())
}
