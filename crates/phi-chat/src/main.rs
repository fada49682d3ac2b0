//! # phi-chat
//!
//! Terminal chat over a local Phi model. Reads one message per line from
//! stdin and streams the reply to stdout.
//!
//! Commands: `/new [system text]` starts over, `/quit` exits. Ctrl-C stops
//! the reply being generated.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use phi_core::ChatError;
use phi_engine::{EngineConfig, OnnxLoader};
use phi_runner::RunnerFacade;
use phi_settings::PhiSettings;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Chat with a local Phi model.
#[derive(Parser, Debug)]
#[command(name = "phi-chat", about = "Chat with a local Phi model")]
struct Cli {
    /// Directory holding the ONNX model and tokenizer.
    #[arg(long)]
    model_dir: Option<PathBuf>,

    /// System message for the first conversation.
    #[arg(long)]
    system: Option<String>,

    /// Log filter (e.g. `warn`, `phi_engine=debug`).
    #[arg(long)]
    log_level: Option<String>,

    /// Settings file (defaults to `~/.phi/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,
}

impl Cli {
    fn load_settings(&self) -> Result<PhiSettings> {
        let path = self
            .settings
            .clone()
            .unwrap_or_else(phi_settings::settings_path);
        let mut settings = phi_settings::load_settings_from_path(&path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?;
        if let Some(dir) = &self.model_dir {
            settings.model.model_dir = dir.to_string_lossy().into_owned();
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        Ok(settings)
    }
}

/// One line of user input.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Quit,
    New(Option<String>),
    Say(String),
    Nothing,
}

fn parse_command(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Nothing;
    }
    if line == "/quit" {
        return Command::Quit;
    }
    if line == "/new" {
        return Command::New(None);
    }
    if let Some(rest) = line.strip_prefix("/new ") {
        let rest = rest.trim();
        return Command::New((!rest.is_empty()).then(|| rest.to_string()));
    }
    Command::Say(line.to_string())
}

/// Next stdin line, or `None` on end of input or once `interrupt` fires.
async fn next_input<R, F, T>(lines: &mut Lines<R>, interrupt: F) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
    F: Future<Output = T>,
{
    tokio::select! {
        line = lines.next_line() => line.context("Failed to read stdin"),
        _ = interrupt => Ok(None),
    }
}

async fn stream_reply(facade: &RunnerFacade, text: &str) -> Result<()> {
    let cancel = CancellationToken::new();
    let mut stream = match facade.submit_user_turn(text, cancel.clone()) {
        Ok(stream) => stream,
        Err(ChatError::NotReady) => {
            eprintln!("(model is still loading)");
            return Ok(());
        }
        Err(error) => {
            eprintln!("({error})");
            return Ok(());
        }
    };

    let mut stdout = tokio::io::stdout();
    loop {
        tokio::select! {
            fragment = stream.next() => match fragment {
                Some(fragment) => {
                    stdout.write_all(fragment.as_bytes()).await?;
                    stdout.flush().await?;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                cancel.cancel();
                eprint!(" (stopped)");
            }
        }
    }
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.load_settings()?;
    phi_core::logging::init_subscriber(&settings.logging.level);

    let loader = Arc::new(OnnxLoader::new(EngineConfig::from_settings(&settings)));
    let facade = Arc::new(RunnerFacade::with_settings(loader, &settings));
    if cli.system.is_some() {
        facade
            .start_new_conversation(cli.system.as_deref())
            .context("Failed to start conversation")?;
    }

    eprintln!("(loading model...)");
    let init = {
        let facade = Arc::clone(&facade);
        tokio::spawn(async move {
            match facade.initialize().await {
                Ok(()) => eprintln!("(model ready)"),
                Err(error) => {
                    warn!(%error, "model initialization failed");
                    eprintln!("(model failed to load: {error})");
                }
            }
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    // listening for ctrl_c replaces the default SIGINT exit, so honor it here
    while let Some(line) = next_input(&mut lines, tokio::signal::ctrl_c()).await? {
        match parse_command(&line) {
            Command::Quit => break,
            Command::Nothing => {}
            Command::New(system) => match facade.start_new_conversation(system.as_deref()) {
                Ok(()) => eprintln!("(new conversation)"),
                Err(error) => eprintln!("({error})"),
            },
            Command::Say(text) => stream_reply(&facade, &text).await?,
        }
    }

    init.abort();
    Ok(())
}
