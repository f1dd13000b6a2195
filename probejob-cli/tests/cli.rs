use std::process::Command;

fn probejob(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_probejob"))
        .args(args)
        .env("RUST_LOG", "off")
        .output()
        .expect("Failed to run probejob")
}

#[test]
fn test_cli_help() {
    let output = probejob(&["--help"]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Usage: probejob"));
}

#[test]
fn test_mock_read_prints_json() {
    let output = probejob(&["--mock", "read", "0x1000", "4"]);

    assert!(output.status.success());
    let response: serde_json::Value = serde_json::from_slice(&output.stdout).expect("stdout is not JSON");
    assert_eq!(response["operation"], "read");
    assert_eq!(response["values"][0]["value"], "ffffffff");
    assert_eq!(response["reset"], "Done");
}

#[test]
fn test_failed_job_exits_with_errno() {
    let output = probejob(&["--mock", "--serial", "1234", "read", "0x1000", "4"]);

    assert!(!output.status.success());
    let error: serde_json::Value = serde_json::from_slice(&output.stderr).expect("stderr is not JSON");
    assert_eq!(error["result"], "CouldNotOpenDevice");
    assert_eq!(output.status.code(), error["errno"].as_i64().map(|e| i32::try_from(e).unwrap()));
}

#[test]
fn test_invalid_parameter_is_rejected_before_dispatch() {
    let output = probejob(&["--mock", "read-u32", "0x1001"]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Invalid parameter"));
}
