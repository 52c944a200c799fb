//! `taskmind chat`: interactive or single-message chat mode.

use std::io::Write;
use std::sync::Arc;

use taskmind_agent::{ChatEngine, ChatReply};
use taskmind_core::message::{SessionId, UserId};
use taskmind_memory::SessionStore;
use tokio::io::{AsyncBufReadExt, BufReader};

use super::runtime;

pub async fn run(
    message: Option<String>,
    user: String,
    session: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = runtime::load_config()?;
    runtime::require_api_key(&config)?;

    let model = taskmind_providers::build_model(&config)?;
    let (index, embedder) = runtime::open_index(&config)?;
    let sessions = Arc::new(SessionStore::new(&config.session));
    let engine = ChatEngine::new(sessions, index, embedder, model, &config);

    let session_id = session.map(|s| SessionId::from(&s)).unwrap_or_default();
    let user_id = UserId(user);

    if let Some(msg) = message {
        // Single message mode
        eprint!("  Thinking...");
        let reply = engine.respond(&session_id, &user_id, &msg).await;
        eprint!("\r              \r");
        let reply = reply?;
        report_context(&reply);
        println!("{}", reply.text);
        return Ok(());
    }

    // Interactive mode
    println!();
    println!("  ╔══════════════════════════════════════════════╗");
    println!("  ║        TaskMind Chat — Interactive Mode        ║");
    println!("  ╚══════════════════════════════════════════════╝");
    println!();
    println!("  Model:     {}", config.provider.model);
    println!("  User:      {user_id}");
    println!("  Session:   {session_id}");
    println!("  Budget:    {} tokens", config.context.token_budget);
    println!();
    println!("  Type your message and press Enter.");
    println!("  Type 'exit' or Ctrl+D to quit.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    print!("  You > ");
    std::io::stdout().flush()?;

    while let Some(line) = lines.next_line().await? {
        let text = line.trim();
        if text.eq_ignore_ascii_case("exit") || text.eq_ignore_ascii_case("quit") {
            break;
        }
        if !text.is_empty() {
            eprint!("  ...");
            match engine.respond(&session_id, &user_id, text).await {
                Ok(reply) => {
                    eprint!("\r     \r");
                    report_context(&reply);
                    println!();
                    for line in reply.text.lines() {
                        println!("  Assistant > {line}");
                    }
                    println!();
                }
                Err(e) => {
                    eprint!("\r     \r");
                    eprintln!("  [Error] {e}");
                    println!();
                }
            }
        }

        print!("  You > ");
        std::io::stdout().flush()?;
    }

    println!();
    println!("  Goodbye! 👋");
    println!();
    Ok(())
}

fn report_context(reply: &ChatReply) {
    tracing::debug!(
        variant = %reply.variant,
        model = %reply.model,
        memories = reply.window.memory_items().count(),
        tokens = reply.window.total_tokens,
        "Reply context"
    );
    if let Some(degradation) = reply.window.degradation {
        tracing::warn!(?degradation, "Context degraded");
    }
}
