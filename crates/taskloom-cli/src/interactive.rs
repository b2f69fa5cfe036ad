use std::io::{BufRead, Write};
use std::sync::Arc;

use anyhow::Result;
use dialoguer::Confirm;
use taskloom_agents::{ApprovalGate, EngineEvent, EventSink, TaskRuntime, TurnOutcome};
use taskloom_config::AppConfig;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::app;

/// Answer confirmations and report progress until the sender goes away.
async fn drive_events(mut rx: UnboundedReceiver<EngineEvent>, gate: Arc<ApprovalGate>) {
    while let Some(event) = rx.recv().await {
        match event {
            EngineEvent::ConfirmationRequested {
                id,
                command,
                directory,
                description,
                auto_approved: false,
            } => {
                let prompt = format!("[{description}] {command}  (in {})", directory.display());
                let answer = tokio::task::spawn_blocking(move || {
                    Confirm::new()
                        .with_prompt(prompt)
                        .default(false)
                        .interact()
                })
                .await;
                if matches!(answer, Ok(Ok(true))) {
                    gate.approve(&id);
                } else {
                    debug!(%id, "declined by user");
                    gate.reject(&id);
                }
            }
            EngineEvent::ConfirmationRequested { command, .. } => {
                eprintln!("  auto-approved: {command}");
            }
            EngineEvent::ToolStarted { name, .. } => eprintln!("  -> {name}"),
            EngineEvent::ToolFinished {
                name,
                success: false,
                ..
            } => eprintln!("  !! {name} failed"),
            EngineEvent::ContextTruncated { tokens_removed, .. } => {
                eprintln!("  (trimmed ~{tokens_removed} tokens of history)")
            }
            _ => {}
        }
    }
}

/// Cancel `token` on Ctrl-C. The watcher is aborted when the task finishes.
fn cancel_on_ctrl_c(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ncancelling...");
            token.cancel();
        }
    })
}

async fn run_one(runtime: &mut TaskRuntime, task: &str) -> TurnOutcome {
    let token = runtime.renew_cancellation();
    let watcher = cancel_on_ctrl_c(token);
    let outcome = runtime.run_task(task).await;
    watcher.abort();
    outcome
}

fn print_outcome(outcome: &TurnOutcome) {
    match outcome {
        TurnOutcome::Completed { response, .. } => println!("{response}"),
        TurnOutcome::Failed { message } => eprintln!("error: {message}"),
        TurnOutcome::Cancelled { partial_response } => {
            if !partial_response.is_empty() {
                println!("{partial_response}");
            }
            eprintln!("(cancelled)");
        }
    }
}

/// Run one task. Returns the process exit code.
pub async fn run_once(config: &AppConfig, task: &str) -> Result<i32> {
    let (events, rx) = EventSink::channel();
    let mut runtime = app::build_runtime(config, events)?;
    let driver = tokio::spawn(drive_events(rx, runtime.approval_gate()));

    let outcome = run_one(&mut runtime, task).await;
    print_outcome(&outcome);
    // The gate keeps a sender alive, so the driver never sees the channel close.
    driver.abort();

    Ok(match outcome {
        TurnOutcome::Completed { .. } => 0,
        TurnOutcome::Failed { .. } => 1,
        TurnOutcome::Cancelled { .. } => 130,
    })
}

pub async fn chat(config: &AppConfig) -> Result<()> {
    let (events, rx) = EventSink::channel();
    let mut runtime = app::build_runtime(config, events)?;
    let driver = tokio::spawn(drive_events(rx, runtime.approval_gate()));
    eprintln!("taskloom chat ({}). /reset clears history, /quit exits.", config.provider.model);

    loop {
        eprint!("> ");
        std::io::stderr().flush()?;
        let (read, line) = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line).map(|n| (n, line))
        })
        .await??;
        if read == 0 {
            break;
        }
        match line.trim() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/reset" => {
                runtime.reset();
                eprintln!("(history cleared)");
                continue;
            }
            task => {
                let outcome = run_one(&mut runtime, task).await;
                print_outcome(&outcome);
            }
        }
    }

    driver.abort();
    Ok(())
}
