// Copyright (c) Harpoon developers, 2024, licensed under the EUPL-1.2-or-later.
//
// See LICENSE at the root of this repository (or a legal translation in LICENSE-translations).

mod common;

use std::time::Duration;

use bytes::Bytes;
use common::{x86_object, Call, Journal, RecordingBackend, X86_NO_RETURN, X86_TWO_RETURNS};
use harpoon::probes::TargetComm;
use harpoon::{
    aggregate, AggregateOptions, Baseline, CaptureError, CaptureOptions, CaptureSession,
    EventStream, ProbeError, ProbePlan, ResolveError, SessionState, SyscallError,
};
use syscalls::Sysno;
use tempfile::NamedTempFile;
use tokio::sync::mpsc::{self, Sender};
use tokio::time;
use tokio_util::sync::CancellationToken;

fn stream() -> (Sender<Bytes>, Sender<u64>, EventStream) {
    let (events_tx, events) = mpsc::channel(64);
    let (lost_tx, lost) = mpsc::channel(4);
    (events_tx, lost_tx, EventStream { events, lost })
}

fn sample(sysno: Sysno) -> Bytes {
    Bytes::copy_from_slice(&(sysno.id() as u32).to_le_bytes())
}

fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn plan(binary: &NamedTempFile, functions: &[&str]) -> ProbePlan {
    ProbePlan {
        binary: binary.path().to_path_buf(),
        functions: functions.iter().map(|f| f.to_string()).collect(),
        target: TargetComm::from_program("/opt/app/example-app"),
    }
}

#[tokio::test]
async fn arm_attaches_entry_exits_trace_then_config() {
    let fixture = x86_object(&[("main.init", &[0xc3]), ("main.work", X86_TWO_RETURNS)]);
    let journal = Journal::default();
    let (_events_tx, _lost_tx, events) = stream();
    let mut session = CaptureSession::new(RecordingBackend::new(journal.clone(), events));

    session.arm(plan(&fixture, &["main.work", "main.init"])).unwrap();
    assert_eq!(session.state(), SessionState::Armed);
    assert_eq!(session.attached(), 6);
    assert_eq!(
        journal.calls(),
        vec![
            Call::AttachEntry("main.work".into(), 16),
            Call::AttachExit("main.work".into(), 17),
            Call::AttachExit("main.work".into(), 21),
            Call::AttachEntry("main.init".into(), 0),
            Call::AttachExit("main.init".into(), 0),
            Call::AttachTrace,
            Call::WriteTarget(b"example-app".to_vec()),
        ]
    );

    session.close().unwrap();
    journal.assert_released();
}

#[tokio::test]
async fn resolution_failure_attaches_nothing() {
    let fixture = x86_object(&[("main.work", X86_TWO_RETURNS), ("main.spin", X86_NO_RETURN)]);
    let journal = Journal::default();
    let (_events_tx, _lost_tx, events) = stream();
    let mut session = CaptureSession::new(RecordingBackend::new(journal.clone(), events));

    let result = session.arm(plan(&fixture, &["main.work", "main.spin"]));
    assert!(matches!(
        result,
        Err(ProbeError::Resolve(ResolveError::NoReturnSites { .. }))
    ));
    assert_eq!(journal.attached(), 0);
    assert_eq!(session.state(), SessionState::Loaded);

    drop(session);
    assert_eq!(journal.calls(), vec![Call::Unload]);
}

#[tokio::test]
async fn partial_exit_attachment_is_rolled_back() {
    let fixture = x86_object(&[("main.work", X86_TWO_RETURNS)]);
    let journal = Journal::default();
    let (_events_tx, _lost_tx, events) = stream();
    let backend = RecordingBackend::new(journal.clone(), events).failing_exit(1);
    let mut session = CaptureSession::new(backend);

    match session.arm(plan(&fixture, &["main.work"])) {
        Err(ProbeError::Attach { target, address, .. }) => {
            assert_eq!(target, "main.work");
            assert_eq!(address, 5);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(session.attached(), 0);
    // entry and the first exit were attached, and both released
    assert_eq!(journal.attached(), 2);
    journal.assert_released();
}

#[tokio::test]
async fn config_failure_is_rolled_back() {
    let fixture = x86_object(&[("main.work", X86_TWO_RETURNS)]);
    let journal = Journal::default();
    let (_events_tx, _lost_tx, events) = stream();
    let backend = RecordingBackend::new(journal.clone(), events).failing_config();
    let mut session = CaptureSession::new(backend);

    assert!(matches!(
        session.arm(plan(&fixture, &["main.work"])),
        Err(ProbeError::ConfigWrite { .. })
    ));
    journal.assert_released();
    assert!(session.close().is_ok());
    assert_eq!(journal.unloads(), 1);
}

#[tokio::test]
async fn start_requires_an_armed_session() {
    let journal = Journal::default();
    let (_events_tx, _lost_tx, events) = stream();
    let mut session = CaptureSession::new(RecordingBackend::new(journal.clone(), events));

    let result = session.start(
        &argv(&["true"]),
        CaptureOptions::default(),
        CancellationToken::new(),
    );
    assert!(matches!(
        result,
        Err(ProbeError::InvalidState {
            operation: "start",
            state: SessionState::Loaded
        })
    ));
}

async fn capture_read_close_exit(options: &AggregateOptions) -> Vec<&'static str> {
    let fixture = x86_object(&[("main.readConfig", X86_TWO_RETURNS)]);
    let journal = Journal::default();
    let (events_tx, _lost_tx, events) = stream();
    let mut session = CaptureSession::new(RecordingBackend::new(journal.clone(), events));
    session.arm(plan(&fixture, &["main.readConfig"])).unwrap();

    // what the kernel side reports while the function runs
    for sysno in [Sysno::read, Sysno::read, Sysno::close, Sysno::exit_group] {
        events_tx.send(sample(sysno)).await.unwrap();
    }
    drop(events_tx);

    let capture = session
        .start(&argv(&["true"]), CaptureOptions::default(), CancellationToken::new())
        .unwrap();
    assert_eq!(session.state(), SessionState::Capturing);

    let batches = capture.collect().await.unwrap();
    assert_eq!(batches.len(), 1);
    session.close().unwrap();
    journal.assert_released();

    aggregate(&batches[0], options).unwrap().sorted_names()
}

#[tokio::test]
async fn end_to_end_without_baseline() {
    let names = capture_read_close_exit(&AggregateOptions::default()).await;
    assert_eq!(names, vec!["close", "exit_group", "read"]);
}

#[tokio::test]
async fn end_to_end_with_baseline() {
    let options = AggregateOptions {
        variants: false,
        baselines: vec![Baseline::StaticGo],
    };
    let names = capture_read_close_exit(&options).await;

    let mut expected = aggregate(&[], &options).unwrap();
    for name in ["close", "exit_group", "read"] {
        expected.insert_name(name, false).unwrap();
    }
    assert_eq!(names, expected.sorted_names());
    assert!(names.contains(&"futex"));
}

#[tokio::test]
async fn cancellation_releases_every_probe() {
    let fixture = x86_object(&[("main.serve", X86_TWO_RETURNS)]);
    let journal = Journal::default();
    let (_events_tx, _lost_tx, events) = stream();
    let mut session = CaptureSession::new(RecordingBackend::new(journal.clone(), events));
    session.arm(plan(&fixture, &["main.serve"])).unwrap();

    let cancel = CancellationToken::new();
    let capture = session
        .start(&argv(&["sleep", "30"]), CaptureOptions::default(), cancel.clone())
        .unwrap();
    let canceller = tokio::spawn(async move {
        time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let batches = time::timeout(Duration::from_secs(10), capture.collect())
        .await
        .unwrap()
        .unwrap();
    canceller.await.unwrap();
    assert!(batches.is_empty());

    session.close().unwrap();
    journal.assert_released();
    assert_eq!(journal.attached(), 4);
}

#[tokio::test]
async fn loss_is_reported_to_the_caller() {
    let fixture = x86_object(&[("main.work", X86_TWO_RETURNS)]);
    let journal = Journal::default();
    let (_events_tx, lost_tx, events) = stream();
    let mut session = CaptureSession::new(RecordingBackend::new(journal.clone(), events));
    session.arm(plan(&fixture, &["main.work"])).unwrap();
    lost_tx.send(3).await.unwrap();

    let capture = session
        .start(&argv(&["sleep", "30"]), CaptureOptions::default(), CancellationToken::new())
        .unwrap();
    let result = time::timeout(Duration::from_secs(10), capture.collect())
        .await
        .unwrap();
    assert!(matches!(result, Err(CaptureError::EventsLost { count: 3 })));

    drop(session);
    journal.assert_released();
}

#[test]
fn unknown_id_yields_no_set() {
    let options = AggregateOptions::default();
    assert_eq!(
        aggregate(&[Sysno::read.id() as u32, 77_777], &options),
        Err(SyscallError::UnknownSyscall { id: 77_777 })
    );
}
