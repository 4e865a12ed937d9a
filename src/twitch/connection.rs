use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::error::{Result as TwitchResult, TwitchError};
use super::irc_parser::{CMD_NICK, CMD_PASS, TWITCH_CAPABILITIES};

const WRITE_BUFFER: usize = 512;

/// Nick and optional password sent when registering a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcLogin {
    pub nick: String,
    pub pass: Option<String>,
}

impl IrcLogin {
    pub fn anonymous() -> Self {
        Self {
            nick: format!("justinfan{}", rand::random::<u32>() % 80000 + 1000),
            pass: None,
        }
    }

    pub fn authenticated(nick: &str, oauth_token: &str) -> Self {
        let token = oauth_token.strip_prefix("oauth:").unwrap_or(oauth_token);
        Self {
            nick: nick.to_lowercase(),
            pass: Some(format!("oauth:{}", token)),
        }
    }
}

#[derive(Debug)]
pub enum IrcEvent {
    Line(String),
    Closed(String),
}

/// A registered TCP connection to the chat server. Lines written to
/// `writer()` are sent in order by a dedicated task; received lines arrive
/// on `events` without their line terminator.
#[derive(Debug)]
pub struct IrcConnection {
    id: Uuid,
    write_tx: mpsc::Sender<String>,
    pub events: mpsc::Receiver<IrcEvent>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl IrcConnection {
    pub async fn connect(
        addr: &str,
        login: &IrcLogin,
        event_buffer_size: usize,
    ) -> TwitchResult<Self> {
        let id = Uuid::new_v4();
        tracing::info!(connection.id = %id, addr, nick = %login.nick, "Connecting to IRC server");

        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = tokio::io::split(stream);
        let (write_tx, mut write_rx) = mpsc::channel::<String>(WRITE_BUFFER);
        let (event_tx, event_rx) = mpsc::channel::<IrcEvent>(event_buffer_size);

        let writer_event_tx = event_tx.clone();
        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(mut message) = write_rx.recv().await {
                if !message.ends_with("\r\n") {
                    message.push_str("\r\n");
                }
                if let Err(e) = writer.write_all(message.as_bytes()).await {
                    let _ = writer_event_tx
                        .send(IrcEvent::Closed(format!("Write error: {}", e)))
                        .await;
                    break;
                }
                if let Err(e) = writer.flush().await {
                    let _ = writer_event_tx
                        .send(IrcEvent::Closed(format!("Flush error: {}", e)))
                        .await;
                    break;
                }
            }
        });

        let reader_event_tx = event_tx;
        let reader_task = tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        let _ = reader_event_tx
                            .send(IrcEvent::Closed("Connection closed by server".to_string()))
                            .await;
                        break;
                    }
                    Ok(_) => {
                        let trimmed = line.trim_end_matches(['\r', '\n']);
                        if trimmed.is_empty() {
                            continue;
                        }
                        if reader_event_tx
                            .send(IrcEvent::Line(trimmed.to_string()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = reader_event_tx
                            .send(IrcEvent::Closed(format!("Read error: {}", e)))
                            .await;
                        break;
                    }
                }
            }
        });

        let connection = IrcConnection {
            id,
            write_tx,
            events: event_rx,
            reader_task,
            writer_task,
        };

        connection.send_raw(TWITCH_CAPABILITIES).await?;
        if let Some(pass) = &login.pass {
            connection
                .send_raw(format!("{} {}", CMD_PASS, pass))
                .await?;
        }
        connection
            .send_raw(format!("{} {}", CMD_NICK, login.nick))
            .await?;

        Ok(connection)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn writer(&self) -> mpsc::Sender<String> {
        self.write_tx.clone()
    }

    pub async fn send_raw<S: Into<String>>(&self, line: S) -> TwitchResult<()> {
        self.write_tx.send(line.into()).await.map_err(|e| {
            TwitchError::ConnectionClosed(format!("Failed to send IRC command: {}", e))
        })
    }
}

impl Drop for IrcConnection {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}
