//! One function per CLI subcommand, each mapping to one client call.

use futures_util::StreamExt;
use gemlink_client::{GeminiClient, GenerateOptions, Message};
use std::io::Write;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

pub async fn generate(
    client: &GeminiClient,
    prompt: &str,
    stream: bool,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let opts = GenerateOptions {
        temperature,
        max_output_tokens: max_tokens,
        cancel: Some(cancel),
    };

    if stream {
        let mut chunks = client.generate_stream(prompt, opts)?;
        while let Some(chunk) = chunks.next().await {
            print!("{}", chunk?);
            std::io::stdout().flush()?;
        }
        println!();
        if let Some(usage) = chunks.usage() {
            eprintln!("tokens used: {}", usage.total_tokens);
        }
        return Ok(());
    }

    let started = Instant::now();
    let result = client.generate(prompt, opts).await?;
    println!("{}", result.text);
    eprintln!(
        "tokens used: {} (generated in {:.2}s)",
        result.usage.total_tokens,
        started.elapsed().as_secs_f64()
    );
    Ok(())
}

/// Interactive chat loop. History lives here, in the caller: each turn
/// sends the whole conversation and appends the assistant reply.
pub async fn chat(client: &GeminiClient, cancel: CancellationToken) -> anyhow::Result<()> {
    println!("Interactive chat with {}. Type 'quit' to exit.", client.config().model);

    let mut history: Vec<Message> = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("\nyou: ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if matches!(input.to_ascii_lowercase().as_str(), "quit" | "exit" | "q") {
            break;
        }

        history.push(Message::user(input));
        let opts = GenerateOptions {
            cancel: Some(cancel.clone()),
            ..GenerateOptions::default()
        };
        match client.chat(&history, opts).await {
            Ok(result) => {
                println!("\ngemini: {}", result.text);
                history.push(Message::assistant(result.text));
            }
            Err(e) => {
                // Keep the failed user turn out of the history so a
                // retyped message does not appear twice upstream.
                history.pop();
                eprintln!("error: {e}");
            }
        }
    }
    Ok(())
}

pub async fn validate(client: &GeminiClient) -> anyhow::Result<()> {
    if client.validate_connection().await {
        println!("connection validation: SUCCESS");
        Ok(())
    } else {
        println!("connection validation: FAILED");
        std::process::exit(1);
    }
}

pub async fn model_info(client: &GeminiClient) -> anyhow::Result<()> {
    let info = client.get_model_info().await?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}
