//! The local control socket: `exit`, `pause`, `resume` and `is-paused`,
//! one textual command per connection with a textual reply.

use anyhow::{Context as _, Result};
use std::path::Path;
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::net::{UnixListener, UnixStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Exit,
    Pause,
    Resume,
    IsPaused,
}

pub struct Control {
    listener: UnixListener,
}

impl Control {
    pub fn bind(path: &Path) -> Result<Self> {
        // A previous instance may have left its socket file behind.
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("Failed to remove stale control socket"),
        }

        let listener = UnixListener::bind(path)
            .with_context(|| format!("Failed to bind control socket at {}", path.display()))?;

        Ok(Self { listener })
    }

    pub async fn accept(&self) -> std::io::Result<UnixStream> {
        self.listener.accept().await.map(|(stream, _)| stream)
    }
}

/// Reads one command from the connection and answers it.
///
/// Unknown input gets an error reply; the connection is closed either way.
pub async fn handle(stream: UnixStream, paused: &mut bool) -> Option<Command> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    if reader.read_line(&mut line).await.is_err() {
        return None;
    }

    let command = match line.trim() {
        "exit" => Some(Command::Exit),
        "pause" => Some(Command::Pause),
        "resume" => Some(Command::Resume),
        "is-paused" => Some(Command::IsPaused),
        _ => None,
    };

    let reply = match command {
        Some(Command::Exit) => "ok\n".to_owned(),
        Some(Command::Pause) => {
            *paused = true;
            "ok\n".to_owned()
        }
        Some(Command::Resume) => {
            *paused = false;
            "ok\n".to_owned()
        }
        Some(Command::IsPaused) => match *paused {
            true => "paused\n".to_owned(),
            false => "not paused\n".to_owned(),
        },
        None => format!("unknown command: {}\n", line.trim()),
    };

    let mut stream = reader.into_inner();
    let _ = stream.write_all(reply.as_bytes()).await;
    let _ = stream.shutdown().await;

    command
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt as _;

    async fn roundtrip(input: &str, paused: &mut bool) -> (Option<Command>, String) {
        let (client, server) = UnixStream::pair().unwrap();

        let (mut client_read, mut client_write) = client.into_split();

        client_write.write_all(input.as_bytes()).await.unwrap();
        client_write.shutdown().await.unwrap();

        let command = handle(server, paused).await;

        let mut reply = String::new();
        client_read.read_to_string(&mut reply).await.unwrap();

        (command, reply)
    }

    #[tokio::test]
    async fn pause_and_resume_flip_the_flag() {
        let mut paused = false;

        let (command, reply) = roundtrip("pause\n", &mut paused).await;
        assert_eq!(command, Some(Command::Pause));
        assert_eq!(reply, "ok\n");
        assert!(paused);

        let (_, reply) = roundtrip("is-paused\n", &mut paused).await;
        assert_eq!(reply, "paused\n");

        let (command, _) = roundtrip("resume\n", &mut paused).await;
        assert_eq!(command, Some(Command::Resume));
        assert!(!paused);
    }

    #[tokio::test]
    async fn unknown_commands_get_an_error_reply() {
        let mut paused = false;

        let (command, reply) = roundtrip("restart\n", &mut paused).await;

        assert_eq!(command, None);
        assert_eq!(reply, "unknown command: restart\n");
    }
}
