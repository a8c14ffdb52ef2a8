// Copyright (c) Harpoon developers, 2024, licensed under the EUPL-1.2-or-later.
//
// See LICENSE at the root of this repository (or a legal translation in LICENSE-translations).

//! Loading the kernel-side object and arming it for one capture.

use std::ffi::OsStr;
use std::fmt::{Display, Formatter};
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use aya::maps::perf::{AsyncPerfEventArray, PerfBufferError};
use aya::maps::{HashMap, MapError};
use aya::programs::trace_point::TracePointLinkId;
use aya::programs::uprobe::UProbeLinkId;
use aya::programs::{ProgramError, TracePoint, UProbe};
use aya::util::online_cpus;
use aya::{include_bytes_aligned, Ebpf, EbpfError};
use bytes::{Bytes, BytesMut};
use harpoon_common::{
    comm_value, COMM_LEN, CONFIG_KEY_TARGET, CONFIG_MAP, ENTER_PROGRAM, EVENTS_MAP, EXIT_PROGRAM,
    TRACEPOINT_CATEGORY, TRACEPOINT_NAME, TRACE_PROGRAM,
};
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::elf::{ResolveError, TargetBinary};
use crate::pipeline::{self, Capture, CaptureError, CaptureOptions, EventStream};
use crate::retsites::{return_sites, ReturnSites};

const READ_BUFFERS: usize = 32;
const SAMPLE_CAPACITY: usize = 64;
const EVENT_QUEUE: usize = 4096;
const LOST_QUEUE: usize = 16;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("the kernel-side object was not built into this binary (run `cargo xtask build-ebpf` and rebuild)")]
    MissingObject,

    #[error("could not load the kernel-side object")]
    Load(#[source] EbpfError),

    #[error("map {0} missing from the kernel-side object")]
    MissingMap(&'static str),

    #[error("program {0} missing from the kernel-side object")]
    MissingProgram(&'static str),

    #[error("could not prepare program {name}")]
    Program {
        name: &'static str,
        #[source]
        source: ProgramError,
    },

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("could not attach probe to {target} at 0x{address:x}")]
    Attach {
        target: String,
        address: u64,
        #[source]
        source: ProgramError,
    },

    #[error("could not detach probe from {target}")]
    Detach {
        target: String,
        #[source]
        source: ProgramError,
    },

    #[error("could not write target process `{target}` to {}", CONFIG_MAP)]
    ConfigWrite {
        target: TargetComm,
        #[source]
        source: MapError,
    },

    #[error("could not open {}", EVENTS_MAP)]
    EventMap(#[source] MapError),

    #[error("could not open the event buffer of cpu {cpu}")]
    PerfBuffer {
        cpu: u32,
        #[source]
        source: PerfBufferError,
    },

    #[error("could not list online cpus")]
    OnlineCpus(#[source] std::io::Error),

    #[error("cannot {operation} a session that is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error(transparent)]
    Capture(#[from] CaptureError),
}

/// The process name the kernel side filters on: a basename, truncated and
/// NUL-terminated like a task's comm.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TargetComm([u8; COMM_LEN]);

impl TargetComm {
    pub fn from_program<P: AsRef<Path>>(program: P) -> Self {
        let program = program.as_ref();
        let basename = program.file_name().unwrap_or(program.as_os_str());
        Self(comm_value(basename.as_bytes()))
    }

    pub fn value(&self) -> [u8; COMM_LEN] {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        let len = self.0.iter().position(|&b| b == 0).unwrap_or(COMM_LEN);
        &self.0[..len]
    }
}

impl Display for TargetComm {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", OsStr::from_bytes(self.as_bytes()).to_string_lossy())
    }
}

/// One uprobe location: a file offset inside `binary`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSite {
    pub binary: PathBuf,
    pub symbol: String,
    pub offset: u64,
}

/// What to arm: the functions of `binary` to trace, and the process name
/// whose syscalls count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbePlan {
    pub binary: PathBuf,
    pub functions: Vec<String>,
    pub target: TargetComm,
}

impl ProbePlan {
    /// Plans tracing `functions` inside the program `command` starts.
    pub fn for_command<P: AsRef<Path>>(program: P, functions: Vec<String>) -> Result<Self, ResolveError> {
        let program = program.as_ref();
        let binary = fs::canonicalize(program).map_err(|source| ResolveError::Open {
            path: program.to_path_buf(),
            source,
        })?;
        Ok(Self {
            binary,
            functions,
            target: TargetComm::from_program(program),
        })
    }
}

/// The kernel-object operations a capture needs.
pub trait ProbeBackend {
    type Link;

    fn attach_entry(&mut self, site: &ProbeSite) -> Result<Self::Link, ProbeError>;
    fn attach_exit(&mut self, site: &ProbeSite) -> Result<Self::Link, ProbeError>;
    fn attach_syscall_trace(&mut self) -> Result<Self::Link, ProbeError>;
    fn write_target(&mut self, target: &TargetComm) -> Result<(), ProbeError>;
    fn open_events(&mut self) -> Result<EventStream, ProbeError>;
    fn detach(&mut self, link: Self::Link) -> Result<(), ProbeError>;
    fn unload(self)
    where
        Self: Sized;
}

#[derive(Debug)]
pub enum AyaLink {
    Entry(String, UProbeLinkId),
    Exit(String, UProbeLinkId),
    Trace(TracePointLinkId),
}

/// [`ProbeBackend`] over the embedded aya object.
pub struct AyaBackend {
    ebpf: Ebpf,
    stop: CancellationToken,
}

fn uprobe<'a>(ebpf: &'a mut Ebpf, name: &'static str) -> Result<&'a mut UProbe, ProbeError> {
    ebpf.program_mut(name)
        .ok_or(ProbeError::MissingProgram(name))?
        .try_into()
        .map_err(|source| ProbeError::Program { name, source })
}

fn tracepoint<'a>(ebpf: &'a mut Ebpf, name: &'static str) -> Result<&'a mut TracePoint, ProbeError> {
    ebpf.program_mut(name)
        .ok_or(ProbeError::MissingProgram(name))?
        .try_into()
        .map_err(|source| ProbeError::Program { name, source })
}

impl AyaBackend {
    /// Loads the object built by `cargo xtask build-ebpf` into this binary.
    pub fn embedded(forward_logs: bool) -> Result<Self, ProbeError> {
        Self::load(
            include_bytes_aligned!(concat!(env!("OUT_DIR"), "/harpoon.bpf.o")),
            forward_logs,
        )
    }

    pub fn load(object: &[u8], forward_logs: bool) -> Result<Self, ProbeError> {
        if object.is_empty() {
            return Err(ProbeError::MissingObject);
        }
        let mut ebpf = Ebpf::load(object).map_err(ProbeError::Load)?;

        if forward_logs {
            if let Err(e) = aya_log::EbpfLogger::init(&mut ebpf) {
                // no log statements survived in the object
                warn!("failed to initialize eBPF logger: {}", e);
            }
        }

        for name in [ENTER_PROGRAM, EXIT_PROGRAM] {
            uprobe(&mut ebpf, name)?
                .load()
                .map_err(|source| ProbeError::Program { name, source })?;
        }
        tracepoint(&mut ebpf, TRACE_PROGRAM)?
            .load()
            .map_err(|source| ProbeError::Program {
                name: TRACE_PROGRAM,
                source,
            })?;
        for map in [CONFIG_MAP, EVENTS_MAP] {
            if ebpf.map(map).is_none() {
                return Err(ProbeError::MissingMap(map));
            }
        }

        info!("kernel-side object loaded");
        Ok(Self {
            ebpf,
            stop: CancellationToken::new(),
        })
    }

    fn attach_uprobe(&mut self, program: &'static str, site: &ProbeSite) -> Result<UProbeLinkId, ProbeError> {
        uprobe(&mut self.ebpf, program)?
            .attach(None, site.offset, &site.binary, None)
            .map_err(|source| ProbeError::Attach {
                target: site.symbol.clone(),
                address: site.offset,
                source,
            })
    }
}

impl ProbeBackend for AyaBackend {
    type Link = AyaLink;

    fn attach_entry(&mut self, site: &ProbeSite) -> Result<AyaLink, ProbeError> {
        let id = self.attach_uprobe(ENTER_PROGRAM, site)?;
        Ok(AyaLink::Entry(site.symbol.clone(), id))
    }

    fn attach_exit(&mut self, site: &ProbeSite) -> Result<AyaLink, ProbeError> {
        let id = self.attach_uprobe(EXIT_PROGRAM, site)?;
        Ok(AyaLink::Exit(site.symbol.clone(), id))
    }

    fn attach_syscall_trace(&mut self) -> Result<AyaLink, ProbeError> {
        let id = tracepoint(&mut self.ebpf, TRACE_PROGRAM)?
            .attach(TRACEPOINT_CATEGORY, TRACEPOINT_NAME)
            .map_err(|source| ProbeError::Attach {
                target: format!("{TRACEPOINT_CATEGORY}:{TRACEPOINT_NAME}"),
                address: 0,
                source,
            })?;
        Ok(AyaLink::Trace(id))
    }

    fn write_target(&mut self, target: &TargetComm) -> Result<(), ProbeError> {
        let map = self
            .ebpf
            .map_mut(CONFIG_MAP)
            .ok_or(ProbeError::MissingMap(CONFIG_MAP))?;
        let mut config: HashMap<_, u32, [u8; COMM_LEN]> =
            HashMap::try_from(map).map_err(|source| ProbeError::ConfigWrite {
                target: *target,
                source,
            })?;
        config
            .insert(CONFIG_KEY_TARGET, target.value(), 0)
            .map_err(|source| ProbeError::ConfigWrite {
                target: *target,
                source,
            })
    }

    fn open_events(&mut self) -> Result<EventStream, ProbeError> {
        let map = self
            .ebpf
            .take_map(EVENTS_MAP)
            .ok_or(ProbeError::MissingMap(EVENTS_MAP))?;
        let mut perf = AsyncPerfEventArray::try_from(map).map_err(ProbeError::EventMap)?;

        let (events_tx, events) = mpsc::channel(EVENT_QUEUE);
        let (lost_tx, lost) = mpsc::channel(LOST_QUEUE);
        let cpus = online_cpus().map_err(|(_, e)| ProbeError::OnlineCpus(e))?;
        for cpu in cpus {
            let mut buf = perf
                .open(cpu, None)
                .map_err(|source| ProbeError::PerfBuffer { cpu, source })?;
            let events_tx = events_tx.clone();
            let lost_tx = lost_tx.clone();
            let stop = self.stop.clone();

            tokio::spawn(async move {
                let mut buffers = (0..READ_BUFFERS)
                    .map(|_| BytesMut::with_capacity(SAMPLE_CAPACITY))
                    .collect::<Vec<_>>();

                loop {
                    let read = tokio::select! {
                        _ = stop.cancelled() => break,
                        read = buf.read_events(&mut buffers) => read,
                    };
                    let read = match read {
                        Ok(read) => read,
                        Err(e) => {
                            warn!("cpu {cpu}: could not read events: {e}");
                            break;
                        }
                    };
                    if read.lost > 0 && lost_tx.send(read.lost as u64).await.is_err() {
                        break;
                    }
                    for sample in buffers.iter().take(read.read) {
                        if events_tx.send(Bytes::copy_from_slice(sample)).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }

        Ok(EventStream { events, lost })
    }

    fn detach(&mut self, link: AyaLink) -> Result<(), ProbeError> {
        match link {
            AyaLink::Entry(symbol, id) => uprobe(&mut self.ebpf, ENTER_PROGRAM)?
                .detach(id)
                .map_err(|source| ProbeError::Detach {
                    target: symbol,
                    source,
                }),
            AyaLink::Exit(symbol, id) => uprobe(&mut self.ebpf, EXIT_PROGRAM)?
                .detach(id)
                .map_err(|source| ProbeError::Detach {
                    target: symbol,
                    source,
                }),
            AyaLink::Trace(id) => tracepoint(&mut self.ebpf, TRACE_PROGRAM)?
                .detach(id)
                .map_err(|source| ProbeError::Detach {
                    target: format!("{TRACEPOINT_CATEGORY}:{TRACEPOINT_NAME}"),
                    source,
                }),
        }
    }

    fn unload(self) {
        // dropping the object unloads its programs and maps
        drop(self);
        info!("kernel-side object unloaded");
    }
}

impl Drop for AyaBackend {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    Loaded,
    Armed,
    Capturing,
    Closed,
}

impl Display for SessionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SessionState::Loaded => "loaded",
            SessionState::Armed => "armed",
            SessionState::Capturing => "capturing",
            SessionState::Closed => "closed",
        })
    }
}

/// One loaded kernel object, the probes attached through it and the capture
/// running on top. Dropping an open session closes it.
pub struct CaptureSession<B: ProbeBackend> {
    backend: Option<B>,
    links: Vec<B::Link>,
    state: SessionState,
    target: Option<TargetComm>,
}

impl<B: ProbeBackend> CaptureSession<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend: Some(backend),
            links: Vec::new(),
            state: SessionState::Loaded,
            target: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn target(&self) -> Option<&TargetComm> {
        self.target.as_ref()
    }

    pub fn attached(&self) -> usize {
        self.links.len()
    }

    fn expect_state(&self, expected: SessionState, operation: &'static str) -> Result<(), ProbeError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ProbeError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn backend(&mut self, operation: &'static str) -> Result<&mut B, ProbeError> {
        let state = self.state;
        self.backend
            .as_mut()
            .ok_or(ProbeError::InvalidState { operation, state })
    }

    /// Resolves every function of `plan`, then attaches its entry probe and
    /// one exit probe per return site, the syscall trace, and finally
    /// writes the target process name. Any failure closes the session.
    pub fn arm(&mut self, plan: ProbePlan) -> Result<(), ProbeError> {
        self.expect_state(SessionState::Loaded, "arm")?;

        // nothing is attached until every function resolved
        let binary = TargetBinary::open(&plan.binary)?;
        let sites = plan
            .functions
            .iter()
            .map(|function| return_sites(&binary, function))
            .collect::<Result<Vec<_>, _>>()?;

        if let Err(e) = self.attach_all(&plan.binary, &sites, &plan.target) {
            warn!("arming failed, releasing {} probe(s)", self.links.len());
            if let Err(cleanup) = self.shutdown() {
                warn!("cleanup after failed arm: {cleanup}");
            }
            return Err(e);
        }

        info!(
            "armed {} function(s) of {} for process `{}`",
            sites.len(),
            plan.binary.display(),
            plan.target
        );
        self.target = Some(plan.target);
        self.state = SessionState::Armed;
        Ok(())
    }

    fn attach_all(
        &mut self,
        binary: &Path,
        sites: &[ReturnSites],
        target: &TargetComm,
    ) -> Result<(), ProbeError> {
        for function in sites {
            let entry = ProbeSite {
                binary: binary.to_path_buf(),
                symbol: function.symbol().to_owned(),
                offset: function.entry(),
            };
            let link = self.backend("arm")?.attach_entry(&entry)?;
            self.links.push(link);
            debug!("entry probe on {} at 0x{:x}", entry.symbol, entry.offset);

            for address in function.addresses() {
                let exit = ProbeSite {
                    offset: address,
                    ..entry.clone()
                };
                let link = self.backend("arm")?.attach_exit(&exit)?;
                self.links.push(link);
                debug!("exit probe on {} at 0x{:x}", exit.symbol, exit.offset);
            }
        }

        let link = self.backend("arm")?.attach_syscall_trace()?;
        self.links.push(link);
        debug!("syscall trace on {TRACEPOINT_CATEGORY}:{TRACEPOINT_NAME}");

        self.backend("arm")?.write_target(target)
    }

    /// Opens the event stream and starts `command` under trace.
    pub fn start(
        &mut self,
        command: &[String],
        options: CaptureOptions,
        cancel: CancellationToken,
    ) -> Result<Capture, ProbeError> {
        self.expect_state(SessionState::Armed, "start")?;
        let events = self.backend("start")?.open_events()?;
        let capture = pipeline::capture(command, options, events, cancel)?;
        self.state = SessionState::Capturing;
        info!("capturing");
        Ok(capture)
    }

    /// Detaches every probe and unloads the object.
    pub fn close(mut self) -> Result<(), ProbeError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), ProbeError> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        let mut first_error = None;
        if let Some(mut backend) = self.backend.take() {
            for link in self.links.drain(..) {
                if let Err(e) = backend.detach(link) {
                    warn!("{e}");
                    first_error.get_or_insert(e);
                }
            }
            backend.unload();
        }
        self.state = SessionState::Closed;
        info!("session closed");
        first_error.map_or(Ok(()), Err)
    }
}

impl<B: ProbeBackend> Drop for CaptureSession<B> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("closing session on drop: {e}");
        }
    }
}
