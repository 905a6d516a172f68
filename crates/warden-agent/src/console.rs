use std::io::BufRead;

use tokio::sync::mpsc;

pub const HELP: &str = "\
* exit - Safely stops the server with all its sub-processes.
* save - Like exit, and uploads the server's world to the remote store.
* reset - Like save, then starts everything again from the uploaded save.
* /s [command] - Sends [command] to the server.
* /b [message] - Sends [message] to the bot's chatting channel.
* help - Lists these commands.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Exit,
    Save,
    Reset,
    Help,
    Server(String),
    Broadcast(String),
    Unknown(String),
    Empty,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        if let Some(rest) = line.strip_prefix("/s ") {
            return ConsoleCommand::Server(rest.to_string());
        }
        if let Some(rest) = line.strip_prefix("/b ") {
            return ConsoleCommand::Broadcast(rest.to_string());
        }
        match line.trim().to_lowercase().as_str() {
            "" => ConsoleCommand::Empty,
            "exit" => ConsoleCommand::Exit,
            "save" => ConsoleCommand::Save,
            "reset" => ConsoleCommand::Reset,
            "help" => ConsoleCommand::Help,
            _ => ConsoleCommand::Unknown(line.to_string()),
        }
    }
}

/// Forwards operator stdin lines until EOF. Uses a plain thread so a pending
/// read never holds up runtime shutdown.
pub fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    let spawned = std::thread::Builder::new()
        .name("operator-console".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.blocking_send(line).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "operator console read failed");
                        break;
                    }
                }
            }
        });
    if let Err(err) = spawned {
        tracing::warn!(error = %err, "cannot start operator console reader");
    }
    rx
}

/// Asks a yes/no question until the answer starts with `y` or `n`.
/// `None` when the console closes first.
pub async fn confirm(question: &str, answers: &mut mpsc::Receiver<String>) -> Option<bool> {
    tracing::info!("{question}");
    loop {
        eprint!("(Y/N) ");
        let answer = answers.recv().await?;
        match answer.trim().chars().next().map(|c| c.to_ascii_lowercase()) {
            Some('y') => return Some(true),
            Some('n') => return Some(false),
            _ => continue,
        }
    }
}
