mod test_harness;

use bytes::Bytes;

use gearline::config::OrphanPolicy;
use gearline::protocol::{Frame, Inbound, Magic, PacketType};
use test_harness::{arg_text, test_config, Harness};

const CLIENT: u64 = 1;
const WORKER: u64 = 2;
const OTHER: u64 = 3;

fn harness() -> Harness {
    let mut h = Harness::new();
    h.connect(CLIENT);
    h.connect(WORKER);
    h.connect(OTHER);
    h
}

/// A response frame built from borrowed text.
fn reply(packet: PacketType, args: &[&str]) -> Frame {
    Frame::new(
        Magic::Response,
        packet,
        args.iter().map(|a| Bytes::copy_from_slice(a.as_bytes())).collect(),
    )
}

fn status_args(h: &mut Harness, conn: u64, handle: &str) -> Vec<String> {
    h.request(conn, PacketType::GetStatus, &[handle]);
    let frames = h.drain(conn);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].packet(), PacketType::StatusRes);
    (0..5).map(|i| arg_text(&frames[0], i)).collect()
}

/// The canonical exchange: submit, grab, progress, complete.
#[test]
fn test_reverse_job_end_to_end() {
    let mut h = harness();
    h.request(WORKER, PacketType::CanDo, &["reverse"]);

    h.request(CLIENT, PacketType::SubmitJob, &["reverse", "", "test"]);
    assert_eq!(
        h.drain(CLIENT),
        vec![reply(PacketType::JobCreated, &["H:test:1"])]
    );

    h.bare(WORKER, PacketType::GrabJobUniq);
    assert_eq!(
        h.drain(WORKER),
        vec![reply(
            PacketType::JobAssignUniq,
            &["H:test:1", "reverse", "", "test"]
        )]
    );
    assert_eq!(status_args(&mut h, OTHER, "H:test:1"), vec!["H:test:1", "1", "1", "0", "0"]);

    h.request(WORKER, PacketType::WorkStatus, &["H:test:1", "1", "2"]);
    assert_eq!(
        h.drain(CLIENT),
        vec![reply(PacketType::WorkStatus, &["H:test:1", "1", "2"])]
    );
    assert_eq!(status_args(&mut h, OTHER, "H:test:1"), vec!["H:test:1", "1", "1", "1", "2"]);

    h.request(WORKER, PacketType::WorkComplete, &["H:test:1", "tset"]);
    assert_eq!(
        h.drain(CLIENT),
        vec![reply(PacketType::WorkComplete, &["H:test:1", "tset"])]
    );

    // Finished jobs are gone.
    assert_eq!(status_args(&mut h, OTHER, "H:test:1"), vec!["H:test:1", "0", "0", "0", "0"]);
    assert!(h.broker.scheduler().is_empty());
    assert_eq!(h.broker.scheduler().count_running("reverse"), 0);
    assert!(h.broker.registry().worker(WORKER).unwrap().is_available());
}

#[test]
fn test_handles_are_sequential_and_never_reused() {
    let mut h = harness();
    let first = h.submit(CLIENT, PacketType::SubmitJobBg, "f", "1");
    let second = h.submit(OTHER, PacketType::SubmitJob, "f", "2");
    assert_eq!(first, "H:test:1");
    assert_eq!(second, "H:test:2");

    assert!(h.broker.state_mut().reap(&first));
    let third = h.submit(CLIENT, PacketType::SubmitJobLow, "f", "3");
    assert_eq!(third, "H:test:3");
}

/// GRAB_JOB_UNIQ → NO_JOB → PRE_SLEEP → submit → NOOP → GRAB_JOB_UNIQ → JOB_ASSIGN_UNIQ.
#[test]
fn test_sleeping_worker_is_woken_by_submission() {
    let mut h = harness();
    h.request(WORKER, PacketType::CanDo, &["f"]);

    h.bare(WORKER, PacketType::GrabJobUniq);
    assert_eq!(h.drain_types(WORKER), vec![PacketType::NoJob]);

    h.bare(WORKER, PacketType::PreSleep);
    assert!(h.drain(WORKER).is_empty());
    assert!(h.broker.registry().worker(WORKER).unwrap().sleeping);

    let handle = h.submit(CLIENT, PacketType::SubmitJob, "f", "data");
    assert_eq!(
        h.drain(WORKER),
        vec![Frame::bare(Magic::Response, PacketType::Noop)]
    );
    assert!(!h.broker.registry().worker(WORKER).unwrap().sleeping);

    h.bare(WORKER, PacketType::GrabJobUniq);
    let frames = h.drain(WORKER);
    assert_eq!(frames[0].packet(), PacketType::JobAssignUniq);
    assert_eq!(arg_text(&frames[0], 0), handle);
}

#[test]
fn test_submission_only_wakes_capable_sleepers() {
    let mut h = harness();
    h.request(WORKER, PacketType::CanDo, &["other"]);
    h.bare(WORKER, PacketType::PreSleep);

    h.submit(CLIENT, PacketType::SubmitJob, "f", "data");
    assert!(h.drain(WORKER).is_empty());
}

#[test]
fn test_pre_sleep_with_work_already_queued_gets_noop() {
    let mut h = harness();
    h.submit(CLIENT, PacketType::SubmitJobBg, "f", "data");

    h.request(WORKER, PacketType::CanDo, &["f"]);
    h.bare(WORKER, PacketType::PreSleep);
    assert_eq!(h.drain_types(WORKER), vec![PacketType::Noop]);
    assert!(!h.broker.registry().worker(WORKER).unwrap().sleeping);
}

#[test]
fn test_grab_job_uses_plain_assignment() {
    let mut h = harness();
    h.request(WORKER, PacketType::CanDo, &["f"]);
    h.request(CLIENT, PacketType::SubmitJob, &["f", "unique-1", "data"]);
    h.drain(CLIENT);

    h.bare(WORKER, PacketType::GrabJob);
    assert_eq!(
        h.drain(WORKER),
        vec![reply(PacketType::JobAssign, &["H:test:1", "f", "data"])]
    );
}

#[test]
fn test_busy_worker_gets_no_job() {
    let mut h = harness();
    h.request(WORKER, PacketType::CanDo, &["f"]);
    h.submit(CLIENT, PacketType::SubmitJob, "f", "1");
    h.submit(CLIENT, PacketType::SubmitJob, "f", "2");

    h.bare(WORKER, PacketType::GrabJobUniq);
    assert_eq!(h.drain_types(WORKER), vec![PacketType::JobAssignUniq]);
    h.bare(WORKER, PacketType::GrabJobUniq);
    assert_eq!(h.drain_types(WORKER), vec![PacketType::NoJob]);
    assert_eq!(h.broker.scheduler().count_queued("f"), 1);
}

#[test]
fn test_connection_without_abilities_gets_no_job() {
    let mut h = harness();
    h.submit(CLIENT, PacketType::SubmitJob, "f", "1");
    h.bare(OTHER, PacketType::GrabJobUniq);
    assert_eq!(h.drain_types(OTHER), vec![PacketType::NoJob]);
}

#[test]
fn test_grab_prefers_priority_across_functions() {
    let mut h = harness();
    h.request(WORKER, PacketType::CanDo, &["a"]);
    h.request(WORKER, PacketType::CanDo, &["b"]);
    h.submit(CLIENT, PacketType::SubmitJob, "a", "normal");
    let high = h.submit(CLIENT, PacketType::SubmitJobHigh, "b", "high");

    h.bare(WORKER, PacketType::GrabJobUniq);
    let frames = h.drain(WORKER);
    assert_eq!(arg_text(&frames[0], 0), high);
}

#[test]
fn test_cant_do_and_reset_abilities_stop_assignments() {
    let mut h = harness();
    h.request(WORKER, PacketType::CanDo, &["a"]);
    h.request(WORKER, PacketType::CanDoTimeout, &["b", "30"]);
    assert_eq!(
        h.broker.registry().worker(WORKER).unwrap().timeout_for("b"),
        Some(30)
    );
    h.request(WORKER, PacketType::CantDo, &["a"]);
    h.submit(CLIENT, PacketType::SubmitJob, "a", "x");

    h.bare(WORKER, PacketType::GrabJobUniq);
    assert_eq!(h.drain_types(WORKER), vec![PacketType::NoJob]);

    h.bare(WORKER, PacketType::ResetAbilities);
    assert!(h.broker.registry().worker(WORKER).unwrap().functions().is_empty());
}

#[test]
fn test_background_job_has_no_watcher() {
    let mut h = harness();
    h.request(WORKER, PacketType::CanDo, &["f"]);
    let handle = h.submit(CLIENT, PacketType::SubmitJobBg, "f", "data");
    assert!(h
        .broker
        .scheduler()
        .find_by_handle(&handle)
        .unwrap()
        .watchers()
        .is_empty());

    h.bare(WORKER, PacketType::GrabJobUniq);
    h.drain(WORKER);
    h.request(WORKER, PacketType::WorkStatus, &[handle.as_str(), "1", "2"]);
    h.request(WORKER, PacketType::WorkComplete, &[handle.as_str(), "done"]);

    assert!(h.drain(CLIENT).is_empty());
    assert!(h.broker.scheduler().find_by_handle(&handle).is_none());
}

#[test]
fn test_terminal_event_reaches_only_the_submitter() {
    let mut h = harness();
    h.request(WORKER, PacketType::CanDo, &["f"]);
    let handle = h.submit(CLIENT, PacketType::SubmitJob, "f", "data");
    h.submit(OTHER, PacketType::SubmitJob, "f", "other");

    h.bare(WORKER, PacketType::GrabJobUniq);
    h.drain(WORKER);
    h.request(WORKER, PacketType::WorkException, &[handle.as_str(), "boom"]);

    assert_eq!(
        h.drain(CLIENT),
        vec![reply(PacketType::WorkException, &[handle.as_str(), "boom"])]
    );
    assert!(h.drain(OTHER).is_empty());

    // A second terminal report for the same job goes nowhere.
    h.request(WORKER, PacketType::WorkFail, &[handle.as_str()]);
    assert!(h.drain(CLIENT).is_empty());
}

#[test]
fn test_reports_from_a_worker_not_holding_the_job_are_dropped() {
    let mut h = harness();
    h.request(WORKER, PacketType::CanDo, &["f"]);
    h.request(OTHER, PacketType::CanDo, &["f"]);
    let handle = h.submit(CLIENT, PacketType::SubmitJob, "f", "data");
    h.bare(WORKER, PacketType::GrabJobUniq);
    h.drain(WORKER);

    h.request(OTHER, PacketType::WorkComplete, &[handle.as_str(), "forged"]);
    assert!(h.drain(CLIENT).is_empty());
    assert!(h.drain(OTHER).is_empty());
    assert!(h.broker.scheduler().find_by_handle(&handle).unwrap().running);
}

#[test]
fn test_status_for_unknown_handle_is_all_zero() {
    let mut h = harness();
    assert_eq!(
        status_args(&mut h, CLIENT, "H:test:99"),
        vec!["H:test:99", "0", "0", "0", "0"]
    );
}

#[test]
fn test_wrong_argument_count_answers_error_and_keeps_connection() {
    let mut h = harness();
    h.request(CLIENT, PacketType::SubmitJob, &["reverse", "test"]);
    let frames = h.drain(CLIENT);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].packet(), PacketType::Error);
    assert_eq!(arg_text(&frames[0], 0), "ERR_WRONG_ARGS");
    assert!(h.broker.scheduler().is_empty());

    h.request(CLIENT, PacketType::EchoReq, &["still here"]);
    assert_eq!(
        h.drain(CLIENT),
        vec![reply(PacketType::EchoRes, &["still here"])]
    );
}

#[test]
fn test_invalid_arguments_answer_error() {
    let mut h = harness();
    h.request(CLIENT, PacketType::GetStatus, &[""]);
    let frames = h.drain(CLIENT);
    assert_eq!(arg_text(&frames[0], 0), "ERR_INVALID_ARG");

    h.request(CLIENT, PacketType::SubmitJob, &["  ", "", "x"]);
    let frames = h.drain(CLIENT);
    assert_eq!(arg_text(&frames[0], 0), "ERR_INVALID_ARG");
}

#[test]
fn test_unanswered_packets_are_dropped_silently() {
    let mut h = harness();
    // Malformed, but WORK_STATUS has no reply to carry an error.
    h.request(WORKER, PacketType::WorkStatus, &["H:test:1", "x", "y"]);
    // A response-only packet sent as a request.
    h.request(CLIENT, PacketType::JobCreated, &["H:test:1"]);
    // A response frame sent to the broker.
    h.broker
        .handle_frame(CLIENT, reply(PacketType::EchoRes, &["stray"]));

    assert!(h.drain(WORKER).is_empty());
    assert!(h.drain(CLIENT).is_empty());
}

#[test]
fn test_unknown_packet_type_answers_error_and_keeps_connection() {
    let mut h = harness();
    h.broker.handle_inbound(
        CLIENT,
        Inbound::Unknown {
            magic: Magic::Request,
            code: 24,
        },
    );
    let frames = h.drain(CLIENT);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].packet(), PacketType::Error);
    assert_eq!(arg_text(&frames[0], 0), "ERR_UNKNOWN_COMMAND");

    h.request(CLIENT, PacketType::EchoReq, &["hi"]);
    assert_eq!(h.drain(CLIENT), vec![reply(PacketType::EchoRes, &["hi"])]);

    // Nobody is waiting on an unknown response.
    h.broker.handle_inbound(
        CLIENT,
        Inbound::Unknown {
            magic: Magic::Response,
            code: 99,
        },
    );
    assert!(h.drain(CLIENT).is_empty());
}

#[test]
fn test_options_and_client_id() {
    let mut h = harness();
    h.request(CLIENT, PacketType::OptionReq, &["exceptions"]);
    assert_eq!(
        h.drain(CLIENT),
        vec![reply(PacketType::OptionRes, &["exceptions"])]
    );
    assert!(h.broker.state().peer(CLIENT).unwrap().exceptions);

    h.request(CLIENT, PacketType::OptionReq, &["bogus"]);
    let frames = h.drain(CLIENT);
    assert_eq!(arg_text(&frames[0], 0), "ERR_UNKNOWN_OPTION");

    h.request(WORKER, PacketType::SetClientId, &["worker-7"]);
    assert!(h.drain(WORKER).is_empty());
    assert_eq!(
        h.broker.state().peer(WORKER).unwrap().client_id.as_deref(),
        Some("worker-7")
    );
}

#[test]
fn test_orphaned_job_left_running_by_default() {
    let mut h = harness();
    h.request(WORKER, PacketType::CanDo, &["f"]);
    let handle = h.submit(CLIENT, PacketType::SubmitJob, "f", "data");
    h.bare(WORKER, PacketType::GrabJobUniq);

    h.disconnect(WORKER);
    assert!(h.broker.registry().worker(WORKER).is_none());
    assert_eq!(status_args(&mut h, OTHER, &handle)[2], "1");
    assert_eq!(h.broker.scheduler().count_running("f"), 1);

    // Nobody else is handed the job.
    h.request(OTHER, PacketType::CanDo, &["f"]);
    h.bare(OTHER, PacketType::GrabJobUniq);
    assert_eq!(h.drain_types(OTHER), vec![PacketType::NoJob]);
}

#[test]
fn test_orphaned_job_requeued_when_configured() {
    let mut h = Harness::with_config(test_config().with_orphan_policy(OrphanPolicy::Requeue));
    h.connect(CLIENT);
    h.connect(WORKER);
    h.connect(OTHER);

    h.request(WORKER, PacketType::CanDo, &["f"]);
    h.request(OTHER, PacketType::CanDo, &["f"]);
    h.bare(OTHER, PacketType::PreSleep);
    let handle = h.submit(CLIENT, PacketType::SubmitJob, "f", "data");
    h.drain(OTHER);
    h.bare(WORKER, PacketType::GrabJobUniq);
    h.bare(OTHER, PacketType::GrabJobUniq);
    assert_eq!(h.drain_types(OTHER), vec![PacketType::NoJob]);
    h.bare(OTHER, PacketType::PreSleep);

    h.disconnect(WORKER);
    assert_eq!(h.drain_types(OTHER), vec![PacketType::Noop]);
    assert_eq!(h.broker.scheduler().count_running("f"), 0);

    h.bare(OTHER, PacketType::GrabJobUniq);
    let frames = h.drain(OTHER);
    assert_eq!(arg_text(&frames[0], 0), handle);

    // The original watcher still gets the result.
    h.request(OTHER, PacketType::WorkComplete, &[handle.as_str(), "ok"]);
    assert_eq!(
        h.drain(CLIENT),
        vec![reply(PacketType::WorkComplete, &[handle.as_str(), "ok"])]
    );
}

#[test]
fn test_queue_full_rejects_submission() {
    let mut config = test_config();
    config.max_jobs = 1;
    let mut h = Harness::with_config(config);
    h.connect(CLIENT);

    h.submit(CLIENT, PacketType::SubmitJobBg, "f", "1");
    h.request(CLIENT, PacketType::SubmitJobBg, &["f", "", "2"]);
    let frames = h.drain(CLIENT);
    assert_eq!(frames[0].packet(), PacketType::Error);
    assert_eq!(arg_text(&frames[0], 0), "ERR_QUEUE_FULL");
}

#[test]
fn test_watcher_disconnect_does_not_break_the_worker() {
    let mut h = harness();
    h.request(WORKER, PacketType::CanDo, &["f"]);
    let handle = h.submit(CLIENT, PacketType::SubmitJob, "f", "data");
    h.bare(WORKER, PacketType::GrabJobUniq);
    h.disconnect(CLIENT);

    h.request(WORKER, PacketType::WorkComplete, &[handle.as_str(), "done"]);
    assert!(h.broker.scheduler().is_empty());
    assert!(h.broker.registry().worker(WORKER).unwrap().is_available());
}

#[test]
fn test_admin_commands() {
    let mut h = harness();
    h.request(WORKER, PacketType::SetClientId, &["w1"]);
    h.request(WORKER, PacketType::CanDo, &["reverse"]);
    h.submit(CLIENT, PacketType::SubmitJob, "reverse", "a");
    h.submit(CLIENT, PacketType::SubmitJob, "reverse", "b");
    h.bare(WORKER, PacketType::GrabJobUniq);

    assert_eq!(h.admin(OTHER, "status"), "reverse\t2\t1\t1\n.\n");

    let workers = h.admin(OTHER, "workers");
    assert!(workers.contains("2 127.0.0.1:40002 w1 : reverse\n"));
    assert!(workers.ends_with(".\n"));

    assert_eq!(
        h.admin(OTHER, "version"),
        format!("OK {}\n", env!("CARGO_PKG_VERSION"))
    );
    assert_eq!(
        h.admin(OTHER, "frobnicate"),
        "ERR UNKNOWN_COMMAND Unknown+server+command\n"
    );
    assert!(!h.broker.shutdown_requested());
    assert_eq!(h.admin(OTHER, "shutdown"), "OK\n");
    assert!(h.broker.shutdown_requested());
}

#[test]
fn test_admin_reap() {
    let mut h = harness();
    let background = h.submit(CLIENT, PacketType::SubmitJobBg, "f", "1");
    let foreground = h.submit(CLIENT, PacketType::SubmitJob, "f", "2");

    assert_eq!(h.admin(OTHER, &format!("reap {}", foreground)), "ERR NOT_FOUND Job+not+found+or+not+reapable\n");
    assert_eq!(h.admin(OTHER, &format!("reap {}", background)), "OK\n");
    assert_eq!(h.admin(OTHER, "reap"), "ERR INVALID_ARGUMENT Missing+job+handle\n");
    assert_eq!(h.broker.scheduler().count_queued("f"), 1);
}
