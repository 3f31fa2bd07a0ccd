//! Text administration commands, one per line on a broker connection.

use std::collections::BTreeSet;
use std::fmt::Write;

use crate::server::broker::BrokerState;

const UNKNOWN_COMMAND: &str = "ERR UNKNOWN_COMMAND Unknown+server+command\n";

/// Run one admin command and return the text to write back.
pub fn execute(state: &mut BrokerState, line: &str) -> String {
    let mut words = line.split_whitespace();
    let command = words.next().map(str::to_ascii_lowercase);
    match command.as_deref() {
        Some("status") => status_report(state),
        Some("workers") => workers_report(state),
        Some("version") => format!("OK {}\n", env!("CARGO_PKG_VERSION")),
        Some("reap") => match words.next() {
            Some(handle) if state.reap(handle) => "OK\n".to_string(),
            Some(_) => "ERR NOT_FOUND Job+not+found+or+not+reapable\n".to_string(),
            None => "ERR INVALID_ARGUMENT Missing+job+handle\n".to_string(),
        },
        Some("shutdown") => {
            tracing::info!("Shutdown requested over admin connection");
            state.request_shutdown();
            "OK\n".to_string()
        }
        _ => UNKNOWN_COMMAND.to_string(),
    }
}

/// `function\ttotal\trunning\tavailable_workers` for every function that
/// has been queued or that some worker can do.
fn status_report(state: &BrokerState) -> String {
    let mut functions: BTreeSet<String> = state.scheduler.function_list().into_iter().collect();
    for worker in state.registry.all_workers() {
        functions.extend(worker.functions());
    }

    let mut out = String::new();
    for function in functions {
        let queued = state.scheduler.count_queued(&function);
        let running = state.scheduler.count_running(&function);
        let workers = state.registry.capable_worker_count(&function);
        let _ = writeln!(out, "{}\t{}\t{}\t{}", function, queued + running, running, workers);
    }
    out.push_str(".\n");
    out
}

/// `conn_id addr client_id : function...` for every connection.
fn workers_report(state: &BrokerState) -> String {
    let mut out = String::new();
    for (conn, peer) in state.peers() {
        let functions = state
            .registry
            .worker(*conn)
            .map(|w| w.functions().join(" "))
            .unwrap_or_default();
        let _ = writeln!(
            out,
            "{} {} {} : {}",
            conn,
            peer.addr,
            peer.client_id.as_deref().unwrap_or("-"),
            functions
        );
    }
    out.push_str(".\n");
    out
}
