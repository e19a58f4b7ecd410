// tests/diagnostics.rs

use procpool::errors::format_stderr_block;
use procpool::logging::{init_logging, LogLevel};
use procpool::process::StderrBuffer;
use procpool::protocol::{encode_init, encode_message, InitResponse, TaskResponse};
use procpool::{CrashReport, ExitInfo, PoolError, TaskError, WorkerId};
use serde_json::{json, Value};

#[test]
fn exit_info_renders_missing_parts_as_null() {
    assert_eq!(
        ExitInfo::with_code(1).to_string(),
        "exit code: 1, exit signal: null"
    );
    assert_eq!(
        ExitInfo::with_signal(2).to_string(),
        "exit code: null, exit signal: SIGINT"
    );
    assert_eq!(
        ExitInfo::with_signal(64).to_string(),
        "exit code: null, exit signal: signal 64"
    );
    assert_eq!(
        ExitInfo::default().to_string(),
        "exit code: null, exit signal: null"
    );
}

#[test]
fn stderr_block_indents_every_line() {
    assert_eq!(format_stderr_block("a\nb"), "stderr:\n  a\n  b\n");
    assert_eq!(format_stderr_block(""), "stderr:\n  \n");
}

#[test]
fn crash_report_message() {
    let report = CrashReport {
        worker: WorkerId(3),
        exit: ExitInfo::with_code(134),
        stderr: "panicked at src/main.rs:10\nnote: run with RUST_BACKTRACE=1".to_string(),
    };
    assert_eq!(
        TaskError::Crashed(report).to_string(),
        "Worker process exited before responding! exit code: 134, exit signal: null\n\
         stderr:\n  panicked at src/main.rs:10\n  note: run with RUST_BACKTRACE=1\n"
    );
}

#[test]
fn only_init_and_protocol_errors_are_worker_fatal() {
    let init = PoolError::Initialization {
        worker: WorkerId(0),
        reason: "x".into(),
    };
    let protocol = PoolError::ProtocolViolation {
        worker: WorkerId(0),
        reason: "y".into(),
    };
    assert!(init.is_worker_fatal());
    assert!(protocol.is_worker_fatal());
    assert!(!PoolError::WorkerBusy.is_worker_fatal());
    assert!(!PoolError::PoolShutDown.is_worker_fatal());
    assert_eq!(protocol.to_string(), "Protocol violation from worker#0: y");
}

#[test]
fn small_stderr_is_kept_verbatim() {
    let mut buf = StderrBuffer::new(64);
    assert!(buf.is_empty());
    buf.push(b"warning: ");
    buf.push(b"deprecated flag\n");
    assert_eq!(buf.render(), "warning: deprecated flag\n");
    assert_eq!(buf.truncated_bytes(), 0);
}

#[test]
fn large_stderr_keeps_head_and_tail() {
    let mut buf = StderrBuffer::new(64);
    buf.push(b"BEGIN");
    for _ in 0..100 {
        buf.push(b"..........");
    }
    buf.push(b"END");

    let rendered = buf.render();
    assert!(rendered.starts_with("BEGIN"), "{rendered}");
    assert!(rendered.ends_with("END"), "{rendered}");
    assert_eq!(buf.truncated_bytes(), 5 + 1000 + 3 - 64);
    assert!(rendered.contains(&format!("[{} bytes truncated]", buf.truncated_bytes())));
}

#[test]
fn outgoing_messages_are_wrapped() {
    let init: Value = serde_json::from_slice(&encode_init(&json!({ "a": 1 }))).unwrap();
    assert_eq!(init, json!({ "initData": { "a": 1 } }));

    let msg: Value = serde_json::from_slice(&encode_message(&json!({ "b": [2] }))).unwrap();
    assert_eq!(msg, json!({ "message": { "b": [2] } }));
}

#[test]
fn handshake_responses_are_classified() {
    assert_eq!(
        InitResponse::classify(json!({ "initSuccess": true })),
        InitResponse::Success
    );
    assert_eq!(
        InitResponse::classify(json!({ "initError": "nope" })),
        InitResponse::Error(json!("nope"))
    );
    assert_eq!(
        InitResponse::classify(json!({ "ready": 1 })),
        InitResponse::Invalid(json!({ "ready": 1 }))
    );
    assert_eq!(
        InitResponse::classify(json!([1])),
        InitResponse::Invalid(json!([1]))
    );
}

#[test]
fn task_responses_are_classified_with_error_first() {
    assert_eq!(
        TaskResponse::classify(json!({ "response": { "ok": 1 } })),
        TaskResponse::Response(json!({ "ok": 1 }))
    );
    assert_eq!(
        TaskResponse::classify(json!({ "error": "bad", "response": 1 })),
        TaskResponse::Error(json!("bad"))
    );
    assert_eq!(
        TaskResponse::classify(json!({ "result": 1 })),
        TaskResponse::Malformed(json!({ "result": 1 }))
    );
    // A null response is still a response.
    assert_eq!(
        TaskResponse::classify(json!({ "response": null })),
        TaskResponse::Response(Value::Null)
    );
}

#[test]
fn logging_can_only_be_installed_once() {
    assert!(init_logging(Some(LogLevel::Warn)).is_ok());
    assert!(init_logging(None).is_err());
}
