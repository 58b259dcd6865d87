use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use secrecy::SecretString;

use counsel_client::{HttpAnswerService, ServiceConfig};
use counsel_core::model::Role;
use counsel_engine::{ChatEngine, GenerationOptions};
use counsel_store::SessionStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let query = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if query.trim().is_empty() {
        anyhow::bail!("usage: counsel <question>");
    }

    let config = ServiceConfig {
        base_url: std::env::var("COUNSEL_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:8000".to_string()),
        auth_token: std::env::var("COUNSEL_API_TOKEN").ok().map(SecretString::from),
        ..ServiceConfig::default()
    };
    tracing::info!(base_url = %config.base_url, "connecting to answer backend");

    let service = HttpAnswerService::new(config).context("failed to build HTTP client")?;
    let store = Arc::new(SessionStore::new());
    let engine = ChatEngine::new(store.clone(), Arc::new(service), GenerationOptions::default());

    let session_id = engine.new_chat();
    let mut changes = store.subscribe();
    let handle = engine.send(&session_id, &query)?;

    // Print tokens as they land in the store.
    let printer_sid = session_id.clone();
    let printer_store = store.clone();
    let printer = tokio::spawn(async move {
        let mut printed = 0usize;
        while changes.recv().await.is_ok() {
            let Some(session) = printer_store.session(&printer_sid) else {
                break;
            };
            let Some(message) = session.messages.iter().rev().find(|m| m.role == Role::Ai) else {
                continue;
            };
            let content: Vec<char> = message.content.chars().collect();
            if content.len() > printed {
                let delta: String = content[printed..].iter().collect();
                print!("{delta}");
                use std::io::Write;
                let _ = std::io::stdout().flush();
                printed = content.len();
            }
            if !message.is_streaming {
                break;
            }
        }
    });

    handle.settled().await;
    let _ = tokio::time::timeout(Duration::from_millis(100), printer).await;
    println!();

    if let Some(session) = store.session(&session_id) {
        for message in session.messages.iter().filter(|m| m.role == Role::Ai) {
            for follow_up in &message.follow_ups {
                tracing::info!(follow_up, "suggested follow-up");
            }
        }
    }

    Ok(())
}
