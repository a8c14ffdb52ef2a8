// Copyright (c) Harpoon developers, 2024, licensed under the EUPL-1.2-or-later.
//
// See LICENSE at the root of this repository (or a legal translation in LICENSE-translations).

use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use clap::{Args, Parser, Subcommand};
use harpoon::syscalls::aggregate_names;
use harpoon::{
    report, AggregateOptions, AyaBackend, Baseline, CaptureOptions, CaptureSession, ProbePlan,
    SeccompProfile,
};
use log::{debug, error, info, warn};
use tokio::signal;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[clap(version, about)]
struct Options {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Capture the syscalls made while the given functions run
    Capture(CaptureArgs),
    /// Merge saved captures into a seccomp profile
    Build(BuildArgs),
}

#[derive(Debug, Args)]
struct CaptureArgs {
    /// Function symbols to trace, comma separated
    #[clap(short, long, value_delimiter = ',', required = true)]
    functions: Vec<String>,
    /// Relay the command's stdout
    #[clap(short = 'c', long = "include-cmd-stdout")]
    command_output: bool,
    /// Relay the command's stderr
    #[clap(short = 'e', long = "include-cmd-stderr")]
    command_error: bool,
    /// Report captured syscalls every SECS seconds instead of once at exit
    #[clap(long, value_name = "SECS")]
    dump_interval: Option<u64>,
    /// Forward log output of the kernel-side programs
    #[clap(long)]
    include_ebpf_output: bool,
    /// Save the captured syscalls to a file in --directory
    #[clap(short = 'S', long, requires = "directory")]
    save: bool,
    /// Directory to store saved captures in
    #[clap(short = 'D', long)]
    directory: Option<PathBuf>,
    /// The command to run, and its arguments
    #[clap(last = true, required = true)]
    command: Vec<String>,
}

#[derive(Debug, Args)]
struct BuildArgs {
    /// Directory containing saved captures
    #[clap(short = 'D', long)]
    directory: PathBuf,
    /// Syscall sets to add (dynamic, static, docker)
    #[clap(short = 's', long = "add-syscall-sets", value_delimiter = ',')]
    syscall_sets: Vec<Baseline>,
    /// Add every ABI variant of the captured syscalls
    #[clap(short = 'V', long = "add-syscall-variants")]
    variants: bool,
    /// Save the profile instead of printing it
    #[clap(short = 'S', long)]
    save: bool,
    /// File name of the saved profile
    #[clap(short = 'n', long, default_value = "seccomp.json")]
    name: PathBuf,
}

fn bump_memlock_rlimit() {
    // Bump the memlock rlimit. This is needed for older kernels that don't use the
    // new memcg based accounting, see https://lwn.net/Articles/837122/
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        debug!("remove limit on locked memory failed, ret is: {}", ret);
    }
}

async fn next_line(lines: &mut Option<UnboundedReceiver<String>>) -> Option<String> {
    match lines {
        Some(lines) => lines.recv().await,
        None => std::future::pending().await,
    }
}

fn flush_lines(lines: &mut Option<UnboundedReceiver<String>>, mut print: impl FnMut(String)) {
    if let Some(lines) = lines {
        while let Ok(line) = lines.try_recv() {
            print(line);
        }
    }
}

async fn capture(args: CaptureArgs) -> Result<(), anyhow::Error> {
    if unsafe { libc::geteuid() } != 0 {
        bail!("capturing syscalls requires root privileges");
    }
    bump_memlock_rlimit();

    let plan = ProbePlan::for_command(&args.command[0], args.functions.clone())?;
    let mut session = CaptureSession::new(AyaBackend::embedded(args.include_ebpf_output)?);
    session.arm(plan)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Exiting...");
            on_signal.cancel();
        }
    });

    let options = CaptureOptions {
        command_output: args.command_output,
        command_error: args.command_error,
        dump_interval: args
            .dump_interval
            .filter(|&secs| secs > 0)
            .map(Duration::from_secs),
    };
    let mut capture = session.start(&args.command, options, cancel.clone())?;

    let mut saved = match (args.save, &args.directory) {
        (true, Some(directory)) => Some(report::create_saved(directory, &args.functions[0])?),
        _ => None,
    };

    let mut stdout = capture.stdout.take();
    let mut stderr = capture.stderr.take();
    let mut failure = None;
    let (mut batches_open, mut errors_open) = (true, true);
    while batches_open || errors_open {
        tokio::select! {
            batch = capture.batches.recv(), if batches_open => match batch {
                Some(ids) => {
                    let written = match saved.as_mut() {
                        Some(list) => report::write_names(list, &ids),
                        None => report::write_names(&mut io::stdout(), &ids),
                    };
                    if let Err(e) = written {
                        error!("{e}");
                        failure.get_or_insert(anyhow!(e));
                        cancel.cancel();
                    }
                }
                None => batches_open = false,
            },
            reported = capture.errors.recv(), if errors_open => match reported {
                Some(e) => {
                    error!("{e}");
                    failure.get_or_insert(anyhow!(e));
                }
                None => errors_open = false,
            },
            line = next_line(&mut stdout) => match line {
                Some(line) => println!("{line}"),
                None => stdout = None,
            },
            line = next_line(&mut stderr) => match line {
                Some(line) => eprintln!("{line}"),
                None => stderr = None,
            },
        }
    }
    flush_lines(&mut stdout, |line| println!("{line}"));
    flush_lines(&mut stderr, |line| eprintln!("{line}"));

    if let Err(e) = capture.finished().await {
        warn!("capture task failed: {e}");
    }
    session.close()?;

    match (failure, saved) {
        (Some(e), Some(list)) => {
            warn!("capture failed, {} was left untouched", list.path().display());
            Err(e)
        }
        (Some(e), None) => Err(e),
        (None, Some(list)) => {
            let path = list.commit()?;
            info!("saved to {}", path.display());
            Ok(())
        }
        (None, None) => Ok(()),
    }
}

fn build(args: BuildArgs) -> Result<(), anyhow::Error> {
    let names = report::read_saved(&args.directory)
        .with_context(|| format!("reading captures from {}", args.directory.display()))?;
    let options = AggregateOptions {
        variants: args.variants,
        baselines: args.syscall_sets,
    };
    let set = aggregate_names(&names, &options)?;
    let profile = SeccompProfile::synthesize(&set).render()?;

    if args.save {
        fs::write(&args.name, format!("{profile}\n"))
            .with_context(|| format!("writing {}", args.name.display()))?;
        info!("wrote {} syscall(s) to {}", set.len(), args.name.display());
    } else {
        println!("{profile}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opts = Options::parse();
    match opts.command {
        Command::Capture(args) => capture(args).await,
        Command::Build(args) => build(args),
    }
}
