// Copyright (c) Harpoon developers, 2024, licensed under the EUPL-1.2-or-later.
//
// See LICENSE at the root of this repository (or a legal translation in LICENSE-translations).

mod build_ebpf;

use clap::Parser;

#[derive(Debug, Parser)]
pub struct Options {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Parser)]
enum Command {
    /// Compile the kernel-side object embedded by the harpoon binary
    BuildEbpf(build_ebpf::Options),
}

fn main() -> Result<(), anyhow::Error> {
    let opts = Options::parse();

    match opts.command {
        Command::BuildEbpf(opts) => build_ebpf::build_ebpf(opts),
    }
}
