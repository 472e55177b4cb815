//! Integration tests that drive a real tracee.
//!
//! These spawn small system binaries under ptrace; they are serialized
//! because each test forks and reaps its own child.

#![cfg(target_os = "linux")]

use rankdb_trace::{StopReason, TraceeController, TraceeMem};
use serial_test::serial;
use std::path::{Path, PathBuf};

fn true_binary() -> Option<PathBuf> {
    ["/bin/true", "/usr/bin/true"]
        .iter()
        .map(Path::new)
        .find(|p| p.exists())
        .map(Path::to_path_buf)
}

#[test]
#[serial]
fn spawn_stops_before_first_instruction_and_runs_to_exit() {
    let Some(target) = true_binary() else {
        eprintln!("skipping: no `true` binary found");
        return;
    };

    let ctl = TraceeController::spawn(&target).expect("spawn");
    // The initial exec stop leaves the tracee inspectable.
    let regs = ctl.registers(false).expect("read registers");
    assert_ne!(regs.rip(), 0);

    match ctl.cont().expect("continue") {
        StopReason::Exited(code) => assert_eq!(code, 0),
        other => panic!("expected clean exit, got {other:?}"),
    }
}

#[test]
#[serial]
fn peek_and_poke_round_trip_at_the_instruction_pointer() {
    let Some(target) = true_binary() else {
        eprintln!("skipping: no `true` binary found");
        return;
    };

    let mut ctl = TraceeController::spawn(&target).expect("spawn");
    let rip = ctl.registers(false).expect("registers").rip();

    let original = ctl.peek(rip, 12).expect("peek");
    assert_eq!(original.len(), 12);

    // Overwrite a few bytes, read them back, then restore.
    ctl.poke(rip, &[0xcc, 0xcc, 0xcc]).expect("poke");
    let patched = ctl.peek(rip, 3).expect("peek patched");
    assert_eq!(patched, vec![0xcc, 0xcc, 0xcc]);

    ctl.poke(rip, &original).expect("restore");
    assert_eq!(ctl.peek(rip, 12).expect("peek restored"), original);

    ctl.kill().expect("kill");
}

#[test]
#[serial]
fn single_step_advances_the_tracee() {
    let Some(target) = true_binary() else {
        eprintln!("skipping: no `true` binary found");
        return;
    };

    let ctl = TraceeController::spawn(&target).expect("spawn");
    let before = ctl.registers(false).expect("registers").rip();

    match ctl.single_step().expect("step") {
        StopReason::Trap => {}
        other => panic!("expected trap after single step, got {other:?}"),
    }
    let after = ctl.registers(false).expect("registers").rip();
    assert_ne!(before, after);

    ctl.kill().expect("kill");
}
