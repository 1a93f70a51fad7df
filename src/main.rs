//! cloudsync client
//!
//! Mirrors one folder to the server, prints status events and takes simple
//! commands on stdin.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::AsyncBufReadExt;

use cloudsync::cli::{self, ClientOpts};
use cloudsync::client::{validate_credentials, ClientSession};
use cloudsync::status::ChannelSink;

const HELP: &str = "commands: send <file> <user> | users | files | quit";

enum Command<'a> {
    Send { file: &'a str, user: &'a str },
    Users,
    Files,
    Quit,
}

fn parse_command(line: &str) -> Option<Command<'_>> {
    let mut words = line.split_whitespace();
    let cmd = match words.next()? {
        "send" => Command::Send {
            file: words.next()?,
            user: words.next()?,
        },
        "users" => Command::Users,
        "files" => Command::Files,
        "quit" | "exit" => Command::Quit,
        _ => return None,
    };
    if words.next().is_some() {
        return None;
    }
    Some(cmd)
}

fn main() -> Result<()> {
    let opts = ClientOpts::parse();
    cli::init_tracing(opts.json_logs);
    let config = opts.to_config()?;

    if opts.save_config {
        if let Some(path) = &opts.config {
            config.save(path)?;
            println!("Saved settings to {}", path.display());
        }
        return Ok(());
    }

    validate_credentials(&config.username, &config.folder)?;
    let log_sink = match &opts.log_file {
        Some(p) => Some(cli::file_sink(Some(p))?),
        None => None,
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let (stop_tx, mut stop_rx) = tokio::sync::mpsc::unbounded_channel::<()>();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .context("Error setting Ctrl-C handler")?;

    rt.block_on(async move {
        let (sink, mut events) = ChannelSink::new();
        let printer = tokio::spawn(async move {
            while let Some(ev) = events.recv().await {
                println!("{}", ev);
                if let Some(log) = &log_sink {
                    log.emit(ev);
                }
            }
        });

        let session = ClientSession::connect(&config, Arc::new(sink))
            .await
            .with_context(|| format!("Failed to connect to {}", config.server))?;
        println!("{}", HELP);

        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = tokio::select! {
                _ = stop_rx.recv() => break,
                _ = session.closed() => break,
                line = lines.next_line() => line,
            };
            let line = match line {
                Ok(Some(l)) => l,
                // stdin closed: keep syncing until Ctrl-C or the server goes away
                Ok(None) => {
                    tokio::select! {
                        _ = stop_rx.recv() => {}
                        _ = session.closed() => {}
                    }
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "reading stdin");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match parse_command(&line) {
                Some(Command::Send { file, user }) => {
                    if let Err(e) = session.request_relay(file, user).await {
                        eprintln!("relay request failed: {}", e);
                    }
                }
                Some(Command::Users) => println!("online: {}", session.users().get().join(", ")),
                Some(Command::Files) => println!("on server: {}", session.files().get().join(", ")),
                Some(Command::Quit) => break,
                None => eprintln!("{}", HELP),
            }
        }

        let res = session.shutdown().await;
        // Drain the last events; a send task stuck on an unstable file may
        // still hold a sink clone
        let _ = tokio::time::timeout(std::time::Duration::from_millis(500), printer).await;
        res.context("Error while closing the session")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert!(matches!(
            parse_command("send report.txt bob"),
            Some(Command::Send {
                file: "report.txt",
                user: "bob"
            })
        ));
        assert!(matches!(parse_command("  users "), Some(Command::Users)));
        assert!(matches!(parse_command("files"), Some(Command::Files)));
        assert!(matches!(parse_command("quit"), Some(Command::Quit)));
        assert!(parse_command("send report.txt").is_none());
        assert!(parse_command("send a b c").is_none());
        assert!(parse_command("dance").is_none());
    }
}
