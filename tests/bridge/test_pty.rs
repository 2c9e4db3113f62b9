//! Integration tests for the pty-backed `CommandSpawner`
//!
//! These run a real `/bin/sh` on a pseudo-terminal.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use kodegen_terminal_broker::{
    BrokerError, CommandSpawner, Credentials, ProcessEvent, ProcessExit, ProcessSpawner,
    SessionId, ShellConfig, SpawnRequest, SpawnedProcess, TerminalSize,
};

fn request(size: TerminalSize) -> SpawnRequest {
    SpawnRequest {
        session_id: SessionId::from("s-test"),
        size,
        credentials: Credentials::new(Some("app.key:secret"), None),
    }
}

fn script(command: &str) -> ShellConfig {
    ShellConfig {
        args: vec!["-c".to_string(), command.to_string()],
        ..ShellConfig::default()
    }
}

/// Collect output until the exit event
async fn run_to_exit(process: &mut SpawnedProcess) -> (String, ProcessExit) {
    let mut output = Vec::new();
    let collect = async {
        while let Some(event) = process.events.recv().await {
            match event {
                ProcessEvent::Output(chunk) => output.extend(chunk),
                ProcessEvent::Exited(exit) => return exit,
            }
        }
        ProcessExit { code: None }
    };
    let exit = tokio::time::timeout(Duration::from_secs(10), collect)
        .await
        .expect("process exited");
    (String::from_utf8_lossy(&output).into_owned(), exit)
}

#[tokio::test]
async fn test_output_and_exit_status() {
    let _ = env_logger::builder().is_test(true).try_init();
    let spawner = CommandSpawner::new(script("echo hello; exit 3"));
    let mut process = spawner.spawn(request(TerminalSize::new(80, 24))).await.unwrap();

    let (output, exit) = run_to_exit(&mut process).await;
    assert!(output.contains("hello"), "output: {output:?}");
    assert_eq!(exit.code, Some(3));
    assert!(!exit.success());
}

#[tokio::test]
async fn test_interactive_input_reaches_shell() {
    let spawner = CommandSpawner::new(ShellConfig::default());
    let mut process = spawner.spawn(request(TerminalSize::new(80, 24))).await.unwrap();

    process
        .stdin
        .write_all(b"echo $((6*7)); exit 0\n")
        .await
        .unwrap();
    process.stdin.flush().await.unwrap();

    let (output, exit) = run_to_exit(&mut process).await;
    assert!(output.contains("42"), "output: {output:?}");
    assert!(exit.success());
}

#[tokio::test]
async fn test_shell_sees_a_sized_terminal() {
    let shell = ShellConfig {
        api_key_env: Some("BROKER_API_KEY".to_string()),
        env: HashMap::from([
            ("GREETING".to_string(), "hi".to_string()),
            ("LD_PRELOAD".to_string(), "/tmp/evil.so".to_string()),
        ]),
        ..script(
            "[ -t 0 ] && echo is-tty; stty size; \
             echo \"env $COLUMNS $BROKER_API_KEY $GREETING [$LD_PRELOAD]\"",
        )
    };
    let spawner = CommandSpawner::new(shell);
    let mut process = spawner.spawn(request(TerminalSize::new(132, 40))).await.unwrap();

    let (output, exit) = run_to_exit(&mut process).await;
    assert!(exit.success(), "output: {output:?}");
    assert!(output.contains("is-tty"), "output: {output:?}");
    assert!(output.contains("40 132"), "output: {output:?}");
    assert!(
        output.contains("env 132 app.key:secret hi []"),
        "output: {output:?}"
    );
}

#[tokio::test]
async fn test_resize_reaches_shell() {
    let spawner = CommandSpawner::new(ShellConfig::default());
    let mut process = spawner.spawn(request(TerminalSize::new(80, 24))).await.unwrap();

    process.control.resize(TerminalSize::new(132, 50)).unwrap();
    process.stdin.write_all(b"stty size; exit 0\n").await.unwrap();
    process.stdin.flush().await.unwrap();

    let (output, exit) = run_to_exit(&mut process).await;
    assert!(exit.success());
    assert!(output.contains("50 132"), "output: {output:?}");
}

#[tokio::test]
async fn test_kill_ends_process() {
    let spawner = CommandSpawner::new(ShellConfig::default());
    let mut process = spawner.spawn(request(TerminalSize::new(80, 24))).await.unwrap();

    process.control.kill();
    let (_, exit) = run_to_exit(&mut process).await;
    assert!(!exit.success());

    // Second kill is a no-op
    process.control.kill();
}

#[tokio::test]
async fn test_missing_program_is_spawn_error() {
    let shell = ShellConfig {
        program: PathBuf::from("/nonexistent/definitely-not-a-shell"),
        ..ShellConfig::default()
    };
    let spawner = CommandSpawner::new(shell);
    let result = spawner.spawn(request(TerminalSize::new(80, 24))).await;
    assert!(matches!(result, Err(BrokerError::Spawn(_))));
}

#[tokio::test]
async fn test_missing_cwd_is_reported() {
    let shell = ShellConfig {
        cwd: Some(PathBuf::from("/nonexistent/workdir")),
        ..ShellConfig::default()
    };
    let spawner = CommandSpawner::new(shell);
    match spawner.spawn(request(TerminalSize::new(80, 24))).await {
        Err(BrokerError::Spawn(msg)) => assert!(msg.contains("Working directory")),
        other => panic!("expected spawn error, got {other:?}"),
    }
}
