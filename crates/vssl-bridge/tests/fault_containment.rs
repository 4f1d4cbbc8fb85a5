//! A panicking callback must take the process down rather than hand a
//! decision back to the engine. Each test re-runs itself in a child process
//! and inspects how the child ended.

use std::process::{Command, Output};

use vssl_bridge::loopback::{self, HandshakeScript, PeerCertificate};
use vssl_bridge::{Connection, Context, FatalPolicy, Fault, ServernameStatus, VerifyMode};

const CHILD_ENV: &str = "VSSL_FAULT_CHILD";
const CONTAINED: &str = "vssl-fault-contained:";

fn in_child() -> bool {
    std::env::var_os(CHILD_ENV).is_some()
}

fn rerun_in_child(test_name: &str) -> Output {
    let exe = std::env::current_exe().expect("test binary path");
    Command::new(exe)
        .args([test_name, "--exact", "--test-threads=1", "--nocapture"])
        .env(CHILD_ENV, "1")
        .output()
        .expect("spawn child test")
}

/// Marks that termination went through the bridge's fault path before
/// ending the process the way the default policy would.
fn report_and_abort(fault: &Fault) -> ! {
    eprintln!("{CONTAINED} {fault}");
    std::process::abort()
}

#[test]
fn panicking_verifier_is_contained_then_aborts() {
    if in_child() {
        vssl_bridge::set_fatal_hook(Some(report_and_abort));
        let engine = loopback::install().expect("loopback engine");
        let context = Context::new().expect("context");
        let conn = Connection::new(&context).expect("connection");
        conn.set_verify_callback(VerifyMode::PEER, |_, _| panic!("verifier exploded"));
        engine.accept(
            &conn,
            &HandshakeScript::new().peer(PeerCertificate::new("CN=client")),
        );
        return;
    }

    let output = rerun_in_child("panicking_verifier_is_contained_then_aborts");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!output.status.success(), "child survived a callback panic: {:?}", output.status);
    assert!(stderr.contains(CONTAINED), "fault path not taken:\n{stderr}");
    assert!(stderr.contains("verify callback panicked"), "{stderr}");
    assert!(stderr.contains("verifier exploded"), "{stderr}");
}

#[test]
fn exit_policy_uses_configured_status() {
    if in_child() {
        let config = vssl_bridge::BridgeConfig::from_json_str(
            r#"{"fatal":{"action":"exit","code":70},"log":{"install_subscriber":false}}"#,
        )
        .expect("config");
        vssl_bridge::init(&config);
        assert_eq!(vssl_bridge::fault::fatal_policy(), FatalPolicy::Exit { code: 70 });

        let engine = loopback::install().expect("loopback engine");
        let context = Context::new().expect("context");
        context.set_servername_callback(|_| -> ServernameStatus { panic!("selector exploded") });
        let conn = Connection::new(&context).expect("connection");
        engine.accept(
            &conn,
            &HandshakeScript::new().server_name("boom.example"),
        );
        return;
    }

    let output = rerun_in_child("exit_policy_uses_configured_status");
    assert_eq!(output.status.code(), Some(70));
}
