use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use tether_core::errors::ErrorKind;
use tether_core::ids::{JobId, SessionId};
use tether_core::protocol::{self, ClientMessage, ServerMessage};

use crate::adapter::ExecutorAdapter;
use crate::error::ExecutorError;

const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);
const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// What the client opens a session to do.
#[derive(Clone, Debug)]
pub enum Command {
    Run {
        instruction: String,
        cwd: String,
        auto_approve: bool,
    },
    Resume {
        job_id: JobId,
        resume_token: Option<String>,
    },
    Status {
        job_id: JobId,
    },
    Cancel {
        job_id: JobId,
    },
}

impl Command {
    fn opening_message(&self) -> ClientMessage {
        match self {
            Self::Run {
                instruction,
                cwd,
                auto_approve,
            } => ClientMessage::Execute {
                instruction: instruction.clone(),
                cwd: cwd.clone(),
                session_id: None,
                auto_approve: *auto_approve,
            },
            Self::Resume {
                job_id,
                resume_token,
            } => ClientMessage::Resume {
                job_id: job_id.clone(),
                resume_token: resume_token.clone(),
            },
            Self::Status { job_id } => ClientMessage::Status {
                job_id: job_id.clone(),
            },
            Self::Cancel { job_id } => ClientMessage::Cancel {
                job_id: Some(job_id.clone()),
            },
        }
    }

    /// True once `message` answers this command.
    fn is_done(&self, message: &ServerMessage) -> bool {
        match self {
            Self::Run { .. } | Self::Resume { .. } => message.ends_job() || rejected(message),
            Self::Status { .. } => matches!(message, ServerMessage::JobStatus(_) | ServerMessage::Error { .. }),
            Self::Cancel { .. } => matches!(message, ServerMessage::Cancelled { .. } | ServerMessage::Error { .. }),
        }
    }
}

/// The server refused the command outright rather than failing a step.
fn rejected(message: &ServerMessage) -> bool {
    matches!(
        message,
        ServerMessage::Error {
            code: Some(
                ErrorKind::ResumeConflict
                    | ErrorKind::NotFound
                    | ErrorKind::Unauthorized
                    | ErrorKind::MalformedMessage
            ),
            ..
        }
    )
}

/// How a client session ended.
#[derive(Clone, Debug)]
pub struct Outcome {
    pub session_id: SessionId,
    pub job_id: Option<JobId>,
    /// The message that ended the session.
    pub last: ServerMessage,
}

/// What the client knows about its job across reconnects.
#[derive(Debug, Default)]
struct Tracked {
    job_id: Option<JobId>,
    /// The current connection got past its opening reply.
    live: bool,
}

impl Tracked {
    fn for_command(command: &Command) -> Self {
        match command {
            Command::Run { .. } => Self::default(),
            Command::Resume { job_id, .. } | Command::Status { job_id } | Command::Cancel { job_id } => Self {
                job_id: Some(job_id.clone()),
                ..Self::default()
            },
        }
    }

    fn observe(&mut self, message: &ServerMessage) {
        match message {
            ServerMessage::JobStarted { job_id } => {
                self.job_id = Some(job_id.clone());
                self.live = true;
            }
            ServerMessage::Resumed { .. } => self.live = true,
            _ => {}
        }
    }
}

/// The command to send after a dropped connection, if the job can be picked up again.
///
/// The pause that follows a drop issues a token this client never saw, so the
/// resume goes out without one and relies on the principal owning the job.
fn reconnect_command(command: &Command, tracked: &Tracked, error: &ExecutorError) -> Option<Command> {
    if !matches!(command, Command::Run { .. } | Command::Resume { .. }) {
        return None;
    }
    if !matches!(error, ExecutorError::Closed | ExecutorError::Transport(_) | ExecutorError::Connect(_)) {
        return None;
    }
    let job_id = tracked.job_id.clone()?;
    Some(Command::Resume {
        job_id,
        resume_token: None,
    })
}

/// The job was still winding down on the server when the resume landed.
fn pause_pending(message: &ServerMessage) -> bool {
    matches!(
        message,
        ServerMessage::Error {
            code: Some(ErrorKind::ResumeConflict),
            ..
        }
    )
}

/// WebSocket client driving one command against a tether server.
///
/// A run or resume whose connection drops after the job id is known is
/// picked up again: the client reconnects and resumes the job, up to
/// `reconnect_attempts` times in a row with `reconnect_delay` between tries.
pub struct ExecutorClient {
    url: String,
    token: String,
    heartbeat_interval: Duration,
    reconnect_attempts: u32,
    reconnect_delay: Duration,
}

impl ExecutorClient {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            heartbeat_interval: DEFAULT_HEARTBEAT,
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Zero attempts turns reconnecting off.
    pub fn with_reconnect(mut self, attempts: u32, delay: Duration) -> Self {
        self.reconnect_attempts = attempts;
        self.reconnect_delay = delay;
        self
    }

    /// Connect, send the command and serve tool requests until it is answered.
    ///
    /// Every server message is passed to `observe` before it is acted on.
    pub async fn run(
        &self,
        command: Command,
        adapter: Arc<ExecutorAdapter>,
        mut observe: impl FnMut(&ServerMessage) + Send,
    ) -> Result<Outcome, ExecutorError> {
        let mut tracked = Tracked::for_command(&command);
        let mut current = command.clone();
        let mut reconnecting = false;
        let mut attempts = 0u32;

        loop {
            let error = match self.session(&current, &adapter, &mut observe, &mut tracked).await {
                Ok(outcome) if reconnecting && pause_pending(&outcome.last) && attempts < self.reconnect_attempts => {
                    debug!(job_id = ?outcome.job_id, "job not paused yet, retrying resume");
                    attempts += 1;
                    tokio::time::sleep(self.reconnect_delay).await;
                    continue;
                }
                Ok(outcome) => return Ok(outcome),
                Err(e) => e,
            };

            if tracked.live {
                attempts = 0;
            }
            let next = match reconnect_command(&command, &tracked, &error) {
                Some(next) if attempts < self.reconnect_attempts => next,
                _ => return Err(error),
            };
            attempts += 1;
            warn!(
                job_id = ?tracked.job_id.as_ref().map(JobId::as_str),
                attempt = attempts,
                error = %error,
                "connection lost, reconnecting"
            );
            tokio::time::sleep(self.reconnect_delay).await;
            current = next;
            reconnecting = true;
        }
    }

    /// One connection: handshake, opening message, then serve until answered.
    async fn session(
        &self,
        command: &Command,
        adapter: &Arc<ExecutorAdapter>,
        observe: &mut (impl FnMut(&ServerMessage) + Send),
        tracked: &mut Tracked,
    ) -> Result<Outcome, ExecutorError> {
        tracked.live = false;
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ExecutorError::Connect(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|e| ExecutorError::Connect(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ExecutorError::Connect(e.to_string()))?;
        let (mut sink, mut stream) = stream.split();

        let session_id = match next_message(&mut stream).await? {
            ServerMessage::Connected { session_id } => session_id,
            other => {
                return Err(ExecutorError::Connect(format!(
                    "expected connected, got {}",
                    other.kind()
                )))
            }
        };
        info!(session_id = %session_id, url = %self.url, "connected");

        send(&mut sink, &command.opening_message()).await?;

        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    send(&mut sink, &ClientMessage::Heartbeat).await?;
                }
                Some(reply) = reply_rx.recv() => {
                    send(&mut sink, &reply).await?;
                }
                message = next_message(&mut stream) => {
                    let message = message?;
                    observe(&message);
                    if matches!(message, ServerMessage::ToolRequest { .. } | ServerMessage::ApprovalRequest { .. }) {
                        let adapter = Arc::clone(adapter);
                        let tx = reply_tx.clone();
                        tokio::spawn(async move {
                            if let Some(reply) = adapter.handle(&message).await {
                                let _ = tx.send(reply);
                            }
                        });
                        continue;
                    }
                    tracked.observe(&message);
                    if command.is_done(&message) {
                        let _ = sink.send(Message::Close(None)).await;
                        return Ok(Outcome {
                            session_id,
                            job_id: tracked.job_id.clone(),
                            last: message,
                        });
                    }
                }
            }
        }
    }
}

async fn send<S>(sink: &mut S, message: &ClientMessage) -> Result<(), ExecutorError>
where
    S: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = protocol::encode(message)?;
    debug!(kind = message.kind(), "send");
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}

/// Next decodable server message. Control frames are skipped.
async fn next_message<S>(stream: &mut S) -> Result<ServerMessage, ExecutorError>
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => match protocol::decode_server(text.as_str()) {
                Ok(message) => return Ok(message),
                Err(e) => warn!(error = %e, "ignoring undecodable server frame"),
            },
            Some(Ok(Message::Close(_))) | None => return Err(ExecutorError::Closed),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    }
}
