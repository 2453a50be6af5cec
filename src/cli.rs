//! Command-line surface over [`Runtime`].

use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;

use crate::download::{DownloadEvent, DownloadStatus};
use crate::engine::GenerationSettings;
use crate::generation::{GenerationEvent, SendOutcome};
use crate::Runtime;

#[derive(Debug, Parser)]
#[command(name = "edgechat", version, about = "Chat with locally downloaded models")]
pub struct Cli {
    /// Data directory (manifest, models, conversations, logs)
    #[arg(long, global = true)]
    pub base_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List downloaded models
    Models,
    /// Search the remote catalog
    Search {
        query: Option<String>,
        #[arg(long, default_value_t = crate::catalog::PAGE_SIZE)]
        limit: usize,
    },
    /// Download a model's weight file
    Download {
        id: String,
        /// Access token for gated repositories
        #[arg(long)]
        token: Option<String>,
    },
    /// Delete a downloaded model
    Delete { id: String },
    /// List conversations
    Chats,
    /// Start a conversation
    NewChat {
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },
    /// Send a prompt and stream the reply
    Send {
        conversation: String,
        model: String,
        prompt: String,
        #[arg(long)]
        max_tokens: Option<i32>,
        #[arg(long)]
        temperature: Option<f32>,
        #[arg(long)]
        top_p: Option<f32>,
        #[arg(long)]
        top_k: Option<i32>,
        #[arg(long)]
        repeat_penalty: Option<f32>,
        #[arg(long)]
        system: Option<String>,
    },
    /// Print a conversation's transcript
    Show { conversation: String },
}

pub async fn dispatch(runtime: &Runtime, command: Command) -> Result<(), String> {
    match command {
        Command::Models => {
            let entries = runtime.manifest.all();
            if entries.is_empty() {
                println!("No models downloaded.");
            }
            for entry in entries {
                println!(
                    "{}\t{}\t{}",
                    entry.id,
                    entry.downloaded_at.format("%Y-%m-%d %H:%M"),
                    entry.local_path.display()
                );
            }
            Ok(())
        }
        Command::Search { query, limit } => {
            let models = runtime.catalog.search(query.as_deref(), limit).await?;
            for model in models {
                let file = model
                    .weight_file()
                    .map(|f| f.rfilename.as_str())
                    .unwrap_or("-");
                println!("{}\t{}", model.id, file);
            }
            Ok(())
        }
        Command::Download { id, token } => {
            let token = token.or_else(|| runtime.config.hf_token.clone());
            download(runtime, &id, token).await
        }
        Command::Delete { id } => {
            runtime.delete_model(&id).map_err(|e| e.to_string())?;
            println!("Deleted {id}");
            Ok(())
        }
        Command::Chats => {
            let conversations = runtime.db.list_conversations().map_err(|e| e.to_string())?;
            for c in conversations {
                let model = if c.model_id.is_empty() { "-" } else { &c.model_id };
                println!("{}\t{}\t{}\t{}", c.id, c.created_at, model, c.title);
            }
            Ok(())
        }
        Command::NewChat { title, model } => {
            let c = runtime
                .new_conversation(title.as_deref(), model.as_deref())
                .map_err(|e| e.to_string())?;
            println!("{}", c.id);
            Ok(())
        }
        Command::Send {
            conversation,
            model,
            prompt,
            max_tokens,
            temperature,
            top_p,
            top_k,
            repeat_penalty,
            system,
        } => {
            let defaults = GenerationSettings::default();
            let settings = GenerationSettings {
                temperature: temperature.unwrap_or(defaults.temperature),
                max_tokens: max_tokens.unwrap_or(defaults.max_tokens),
                top_p: top_p.unwrap_or(defaults.top_p),
                top_k: top_k.unwrap_or(defaults.top_k),
                repeat_penalty: repeat_penalty.unwrap_or(defaults.repeat_penalty),
                system_prompt: system.unwrap_or(defaults.system_prompt),
            };
            send(runtime, conversation, model, prompt, settings).await
        }
        Command::Show { conversation } => {
            let c = runtime
                .db
                .conversation(&conversation)
                .map_err(|e| e.to_string())?
                .ok_or_else(|| format!("Conversation not found: {conversation}"))?;
            println!("# {}", c.title);
            for m in runtime.db.messages(&c.id).map_err(|e| e.to_string())? {
                let marker = if m.is_error { " (error)" } else { "" };
                println!("[{:?}{}] {}", m.role, marker, m.text);
            }
            Ok(())
        }
    }
}

async fn download(runtime: &Runtime, id: &str, token: Option<String>) -> Result<(), String> {
    let model = runtime.catalog.model(id).await?;
    let mut events = runtime.downloads.subscribe();
    runtime
        .downloads
        .start(&model, token)
        .map_err(|e| e.to_string())?;

    let status = loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                runtime.downloads.cancel(id);
                continue;
            }
            event = events.recv() => event,
        };
        match event {
            Ok(DownloadEvent::Progress { id: ev_id, state }) if ev_id == id => {
                let eta = if state.eta_seconds > 0.0 {
                    format!("{:.0}s", state.eta_seconds)
                } else {
                    "?".to_string()
                };
                eprint!(
                    "\r{:>5.1}%  {}/{} bytes  eta {}   ",
                    state.progress * 100.0,
                    state.bytes_written,
                    state.total_bytes,
                    eta
                );
            }
            Ok(DownloadEvent::Finished { id: ev_id, status }) if ev_id == id => break status,
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => {
                break runtime
                    .downloads
                    .state(id)
                    .map(|s| s.status)
                    .unwrap_or(DownloadStatus::Idle)
            }
        }
    };
    eprintln!();

    match status {
        DownloadStatus::Completed => {
            println!("Downloaded {id}");
            Ok(())
        }
        DownloadStatus::Cancelled => Err(format!("Download of {id} cancelled")),
        DownloadStatus::Failed(reason) => Err(format!("Download of {id} failed: {reason}")),
        other => Err(format!("Download of {id} ended as {other:?}")),
    }
}

async fn send(
    runtime: &Runtime,
    conversation: String,
    model: String,
    prompt: String,
    settings: GenerationSettings,
) -> Result<(), String> {
    let mut events = runtime.generation.subscribe();
    let generation = runtime.generation.clone();
    let conv = conversation.clone();
    let mut task =
        tokio::spawn(async move { generation.send(&conv, &prompt, &model, &settings).await });

    let mut stdout = std::io::stdout();
    let mut listening = true;
    // Buffered tokens are printed before the task's result is taken.
    let joined = loop {
        tokio::select! {
            biased;
            event = events.recv(), if listening => match event {
                Ok(GenerationEvent::Token { conversation_id, text, .. })
                    if conversation_id == conversation =>
                {
                    let _ = write!(stdout, "{text}");
                    let _ = stdout.flush();
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => listening = false,
            },
            joined = &mut task => break joined,
            _ = tokio::signal::ctrl_c() => {
                runtime.generation.cancel(&conversation);
            }
        }
    };
    println!();

    let outcome = joined.map_err(|e| e.to_string())?.map_err(|e| e.to_string())?;
    match outcome {
        SendOutcome::Completed | SendOutcome::Cancelled => Ok(()),
        SendOutcome::ModelNotDownloaded => Err("Model not downloaded".to_string()),
        SendOutcome::EngineUnavailable(e) => Err(e.to_string()),
        SendOutcome::Abandoned => Err("Conversation was deleted during generation".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GenerationError;
    use crate::test_support::{write_model_file, FakeLoader, OfflineFetcher};
    use std::time::Duration;

    #[test]
    fn test_send_flags_parse() {
        let cli = Cli::try_parse_from([
            "edgechat",
            "--base-dir",
            "/tmp/x",
            "send",
            "c1",
            "org/m",
            "hello",
            "--max-tokens",
            "64",
            "--top-k",
            "20",
            "--system",
            "be brief",
        ])
        .unwrap();
        assert_eq!(cli.base_dir, Some(PathBuf::from("/tmp/x")));
        match cli.command {
            Command::Send {
                conversation,
                model,
                prompt,
                max_tokens,
                top_k,
                system,
                temperature,
                ..
            } => {
                assert_eq!(conversation, "c1");
                assert_eq!(model, "org/m");
                assert_eq!(prompt, "hello");
                assert_eq!(max_tokens, Some(64));
                assert_eq!(top_k, Some(20));
                assert_eq!(system.as_deref(), Some("be brief"));
                assert_eq!(temperature, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_search_limit_defaults_to_page_size() {
        let cli = Cli::try_parse_from(["edgechat", "search", "llama"]).unwrap();
        match cli.command {
            Command::Search { query, limit } => {
                assert_eq!(query.as_deref(), Some("llama"));
                assert_eq!(limit, crate::catalog::PAGE_SIZE);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_global_base_dir_after_subcommand() {
        let cli = Cli::try_parse_from(["edgechat", "models", "--base-dir", "/d"]).unwrap();
        assert_eq!(cli.base_dir, Some(PathBuf::from("/d")));
        assert!(matches!(cli.command, Command::Models));
    }

    #[test]
    fn test_send_requires_prompt() {
        assert!(Cli::try_parse_from(["edgechat", "send", "c1", "org/m"]).is_err());
    }

    // ── send ──

    fn offline_runtime(dir: &std::path::Path) -> Runtime {
        Runtime::with_backends(
            crate::config::Config::with_base_dir(dir),
            std::sync::Arc::new(FakeLoader::new(vec!["hi".into()])),
            std::sync::Arc::new(OfflineFetcher),
            crate::database::Database::open_in_memory().unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_send_returns_validation_errors() {
        let dir = tempfile::tempdir().unwrap();
        let rt = offline_runtime(dir.path());
        let c = rt.new_conversation(None, None).unwrap();
        let settings = GenerationSettings {
            max_tokens: 0,
            ..Default::default()
        };

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            send(&rt, c.id.clone(), "m".into(), "hello".into(), settings),
        )
        .await
        .expect("send returned");
        assert_eq!(result, Err(GenerationError::TokenLimit(0).to_string()));
        assert!(rt.db.messages(&c.id).unwrap().is_empty());

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            send(&rt, "missing".into(), "m".into(), "hello".into(), GenerationSettings::default()),
        )
        .await
        .expect("send returned");
        assert_eq!(
            result,
            Err(GenerationError::ConversationNotFound("missing".into()).to_string())
        );
    }

    #[tokio::test]
    async fn test_send_streams_reply_and_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let rt = offline_runtime(dir.path());
        let path = write_model_file(dir.path(), "m.gguf");
        rt.manifest
            .add(crate::manifest::ManifestEntry::new("org/m", &path))
            .unwrap();
        let c = rt.new_conversation(None, None).unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            send(&rt, c.id.clone(), "org/m".into(), "hello".into(), GenerationSettings::default()),
        )
        .await
        .expect("send returned");
        assert_eq!(result, Ok(()));
        let messages = rt.db.messages(&c.id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].text, "hi");
    }
}
