use colored::Colorize;
use dialoguer::Confirm;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;
use warden_security::{PendingApproval, PermissionRequest};

/// Ask on the terminal for every permission request until the channel closes.
pub async fn prompt_loop(mut approvals: broadcast::Receiver<PendingApproval>) {
    loop {
        let pending = match approvals.recv().await {
            Ok(pending) => pending,
            Err(RecvError::Lagged(skipped)) => {
                warn!("missed {skipped} permission prompts");
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        if pending.responder.is_resolved() {
            continue;
        }

        let request = pending.request.clone();
        let granted = tokio::task::spawn_blocking(move || ask(&request))
            .await
            .unwrap_or(false);
        if !pending.responder.resolve(granted) {
            println!("Request already decided (timed out or answered elsewhere).");
        }
    }
}

fn ask(request: &PermissionRequest) -> bool {
    println!();
    let marker = if request.dangerous {
        format!(" {}", "DANGEROUS".red().bold())
    } else {
        String::new()
    };
    println!(
        "Plugin {} requests {}{marker}",
        request.plugin_name.bold(),
        request.capability.as_str().cyan()
    );
    println!("  {}", request.capability.description());
    if !request.reason.is_empty() {
        println!("  reason: {}", request.reason);
    }

    Confirm::new()
        .with_prompt("Allow?")
        .default(!request.dangerous)
        .interact()
        .unwrap_or(false)
}
