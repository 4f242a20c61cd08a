// src/client.rs

//! Native update-agent.
//!
//! Connects to a running server over WebSocket, the same way the browser
//! script does, and keeps a [`Document`] up to date through a
//! [`Reconciler`]. Resources are considered loaded as soon as they are
//! swapped in. A self-update closes the channel and bootstraps a fresh
//! reconciler over the same document.

use crate::event::{ClientMessage, ServerMessage};
use crate::reconciler::{AgentState, Document, Effect, Reconciler};
use crate::self_version::CLIENT_SCRIPT_NAME;
use anyhow::{anyhow, bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Where the agent connects and which page it represents.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// `host:port` of the server.
    pub server: String,
    /// The page's location path, e.g. `/sub-dir/`.
    pub location: String,
    /// Directory inside the watched root that URL paths are relative to.
    pub asset_root: String,
}

impl AgentConfig {
    pub fn new(server: impl Into<String>, location: impl Into<String>) -> Self {
        AgentConfig {
            server: server.into(),
            location: location.into(),
            asset_root: String::new(),
        }
    }

    pub fn with_asset_root(mut self, asset_root: impl Into<String>) -> Self {
        self.asset_root = asset_root.into();
        self
    }

    /// WebSocket URL including the handshake query.
    pub fn socket_url(&self) -> String {
        format!(
            "ws://{}/ws?path={}&root={}",
            self.server,
            utf8_percent_encode(&self.location, NON_ALPHANUMERIC),
            utf8_percent_encode(&self.asset_root, NON_ALPHANUMERIC),
        )
    }

    fn script_src(&self) -> String {
        format!("http://{}/{}", self.server, CLIENT_SCRIPT_NAME)
    }
}

/// What the agent currently shows.
#[derive(Debug, Clone)]
pub struct AgentView {
    pub state: AgentState,
    pub document: Document,
    pub self_version: Option<u64>,
    /// Number of agents that have run, starting at 1.
    pub generation: u32,
    /// Server messages handled so far, across generations.
    pub handled: u64,
}

/// A running agent.
pub struct AgentHandle {
    view: watch::Receiver<AgentView>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

impl AgentHandle {
    pub fn view(&self) -> AgentView {
        self.view.borrow().clone()
    }

    /// Waits until `predicate` holds for the current view.
    pub async fn wait_for(&mut self, predicate: impl FnMut(&AgentView) -> bool) -> Result<AgentView> {
        let view = self
            .view
            .wait_for(predicate)
            .await
            .map_err(|_| anyhow!("agent stopped"))?;
        Ok(view.clone())
    }

    /// Closes the channel and waits for the agent to finish.
    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.task.await?
    }
}

async fn open(config: &AgentConfig) -> Result<Socket> {
    match connect_async(config.socket_url()).await {
        Ok((socket, _)) => Ok(socket),
        Err(tungstenite::Error::Http(response)) => {
            bail!("Server refused update channel for {}: {}", config.location, response.status())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to connect to {}", config.server)),
    }
}

async fn send(socket: &mut Socket, message: &ClientMessage) -> Result<()> {
    let json = serde_json::to_string(message)?;
    socket.send(Message::Text(json)).await?;
    Ok(())
}

/// Connects an agent for `document`. Fails if the server refuses the page.
pub async fn connect(config: AgentConfig, document: Document) -> Result<AgentHandle> {
    let socket = open(&config).await?;
    let reconciler = Reconciler::new(document, config.asset_root.clone(), config.script_src());

    let (view_tx, view) = watch::channel(AgentView {
        state: reconciler.state(),
        document: reconciler.document().clone(),
        self_version: None,
        generation: 1,
        handled: 0,
    });
    let (shutdown, shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(run(config, reconciler, socket, view_tx, shutdown_rx));
    Ok(AgentHandle { view, shutdown, task })
}

enum Outcome {
    Closed,
    Shutdown,
    Replace { src: String },
}

async fn run(
    config: AgentConfig,
    mut reconciler: Reconciler,
    mut socket: Socket,
    view_tx: watch::Sender<AgentView>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut generation = 1;
    let mut handled = 0;

    loop {
        for effect in reconciler.on_connected() {
            perform(&mut socket, &mut reconciler, effect).await?;
        }
        publish(&view_tx, &reconciler, generation, handled);

        match drive(&mut socket, &mut reconciler, &view_tx, &mut shutdown, generation, &mut handled).await? {
            Outcome::Closed => {
                info!("Update channel closed by server");
                return Ok(());
            }
            Outcome::Shutdown => {
                let _ = socket.close(None).await;
                return Ok(());
            }
            Outcome::Replace { src } => {
                let _ = socket.close(None).await;
                reconciler.finish_replacement();
                publish(&view_tx, &reconciler, generation, handled);

                info!("Agent replaced by {}", src);
                let document = reconciler.into_document();
                reconciler = Reconciler::new(document, config.asset_root.clone(), src);
                socket = open(&config).await?;
                generation += 1;
            }
        }
    }
}

async fn drive(
    socket: &mut Socket,
    reconciler: &mut Reconciler,
    view_tx: &watch::Sender<AgentView>,
    shutdown: &mut watch::Receiver<bool>,
    generation: u32,
    handled: &mut u64,
) -> Result<Outcome> {
    loop {
        tokio::select! {
            frame = socket.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let message: ServerMessage = match serde_json::from_str(&text) {
                        Ok(m) => m,
                        Err(e) => {
                            warn!("Ignoring malformed server message: {}", e);
                            continue;
                        }
                    };
                    debug!("Received {}", message.name());

                    let mut replacement = None;
                    for effect in reconciler.handle(message) {
                        if let Effect::ReplaceScript { src } = effect {
                            replacement = Some(src);
                        } else {
                            perform(socket, reconciler, effect).await?;
                        }
                    }
                    *handled += 1;
                    publish(view_tx, reconciler, generation, *handled);

                    if let Some(src) = replacement {
                        return Ok(Outcome::Replace { src });
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Ok(Outcome::Closed),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },
            _ = shutdown.changed() => return Ok(Outcome::Shutdown),
        }
    }
}

async fn perform(socket: &mut Socket, reconciler: &mut Reconciler, effect: Effect) -> Result<()> {
    match effect {
        Effect::WatchAsset(room) => send(socket, &ClientMessage::WatchAsset { room }).await?,
        Effect::AwaitLoad(id) => {
            reconciler.resource_loaded(id);
        }
        Effect::DocumentReplaced | Effect::Disconnect | Effect::ReplaceScript { .. } => {}
    }
    Ok(())
}

fn publish(view_tx: &watch::Sender<AgentView>, reconciler: &Reconciler, generation: u32, handled: u64) {
    view_tx.send_replace(AgentView {
        state: reconciler.state(),
        document: reconciler.document().clone(),
        self_version: reconciler.self_version(),
        generation,
        handled,
    });
}
