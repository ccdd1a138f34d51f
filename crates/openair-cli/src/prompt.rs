use async_trait::async_trait;
use std::io::Write;
use tokio::sync::Mutex;

use openair_core::{format_bytes, AutoDecision, DecisionSource, FileMetadata};

/// Asks the operator on stdin unless a fixed answer was configured.
pub struct OperatorDecision {
    auto: Option<AutoDecision>,
    // One question on the terminal at a time when connections run concurrently
    prompt_lock: Mutex<()>,
}

impl OperatorDecision {
    pub fn new(auto_accept: Option<bool>) -> Self {
        let auto =
            auto_accept.map(|yes| if yes { AutoDecision::Accept } else { AutoDecision::Reject });
        Self { auto, prompt_lock: Mutex::new(()) }
    }
}

#[async_trait]
impl DecisionSource for OperatorDecision {
    async fn decide(&self, meta: &FileMetadata, peer: &str) -> bool {
        if let Some(auto) = &self.auto {
            return auto.decide(meta, peer).await;
        }

        let _guard = self.prompt_lock.lock().await;
        let peer = peer.to_string();
        let name = meta.name.clone();
        let size = format_bytes(meta.byte_len());

        // stdin is blocking; keep it off the runtime threads
        let answer = tokio::task::spawn_blocking(move || -> std::io::Result<bool> {
            println!("\nIncoming file request:");
            println!("  From: {}", peer);
            println!("  File: {}", name);
            println!("  Size: {}", size);
            print!("Accept? (y/n): ");
            std::io::stdout().flush()?;

            let mut input = String::new();
            std::io::stdin().read_line(&mut input)?;
            Ok(is_yes(&input))
        })
        .await;

        match answer {
            Ok(Ok(yes)) => yes,
            Ok(Err(e)) => {
                tracing::warn!("Failed to read answer, rejecting: {}", e);
                false
            }
            Err(e) => {
                tracing::warn!("Prompt task failed, rejecting: {}", e);
                false
            }
        }
    }
}

fn is_yes(input: &str) -> bool {
    let answer = input.trim().to_lowercase();
    answer == "y" || answer == "yes"
}
