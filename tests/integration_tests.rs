//! # Integration Tests for Hotpage
//!
//! End-to-end tests over a real watcher, pipeline and web server bound to an
//! ephemeral port.
//!
//! - **test_css_then_html_through_agent**: A style edit followed by a markup
//!   edit reaches a native agent and keeps the style patch.
//! - **test_html_then_css_through_agent**: The reverse order ends in the same
//!   page.
//! - **test_unquoted_link_through_agent**: Both orders agree for a page whose
//!   stylesheet URL is not quoted.
//! - **test_updates_are_scoped_to_rooms**: Sessions only hear about their own
//!   page and the assets they asked to watch.
//! - **test_reload_self_on_connect**: Every session first receives the
//!   current self-version.
//! - **test_self_update_replaces_agent**: A new self-version makes the agent
//!   reconnect as a fresh generation.
//! - **test_unknown_page_is_refused**: The upgrade fails for missing pages.
//! - **test_client_script_served_with_port**: The served script carries the
//!   configured port.
//! - **test_duplicate_and_filtered_changes**: Unchanged writes, ignored paths
//!   and unsupported extensions produce no events.
//! - **test_cli_fails_without_root**: The binary exits non-zero without a root.

use futures_util::{SinkExt, StreamExt};
use hotpage::client::{self, AgentConfig, AgentHandle, AgentView};
use hotpage::event::{FsVerb, ServerMessage};
use hotpage::reconciler::{Document, MatchAttr};
use hotpage::room::Room;
use hotpage::watch_session::{run_pipeline, WatchOptions, WatchSession};
use hotpage::watcher::{self, WatchTarget};
use hotpage::web::{self, AppState};
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default timeout for events to arrive.
const SHORT_TIMEOUT: Duration = Duration::from_secs(5);
/// How long to wait before concluding that nothing is coming.
const QUIET_PERIOD: Duration = Duration::from_millis(600);

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
  <title>My Site</title>
  <link rel="stylesheet" href="css/styles.css">
</head>
<body>
  <img src="img/logo.png">
  <script src="http://localhost:3008/reloader.js"></script>
</body>
</html>"#;

const UNQUOTED_INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
  <title>My Site</title>
  <link rel=stylesheet href=css/styles.css>
</head>
<body>
  <script src="http://localhost:3008/reloader.js"></script>
</body>
</html>"#;

/// Writes the sample site, with `index` as its home page, into a fresh
/// temporary directory.
fn site(index: &str) -> tempfile::TempDir {
    let site = tempfile::tempdir().expect("Failed to create temp dir");
    let root = site.path();
    for dir in ["css", "img", "sub-dir", "ignored"] {
        fs::create_dir_all(root.join(dir)).unwrap();
    }
    fs::write(root.join("index.html"), index).unwrap();
    fs::write(root.join("page-two.html"), "<title>Page Two</title>").unwrap();
    fs::write(root.join("sub-dir/index.html"), "<title>A Subdirectory</title>").unwrap();
    fs::write(root.join("css/styles.css"), "body { background-color: red; }").unwrap();
    fs::write(root.join("img/logo.png"), [0x89, b'P', b'N', b'G']).unwrap();
    fs::write(root.join(".gitignore"), "ignored/\n").unwrap();
    site
}

/// A running server over a temporary site.
struct TestServer {
    _site: tempfile::TempDir,
    _public: tempfile::TempDir,
    root: PathBuf,
    addr: SocketAddr,
    watch: Arc<WatchSession>,
    shutdown_tx: watch::Sender<bool>,
}

impl TestServer {
    async fn start() -> TestServer {
        TestServer::start_with(INDEX_HTML).await
    }

    async fn start_with(index: &str) -> TestServer {
        let site = site(index);
        let public = tempfile::tempdir().expect("Failed to create temp dir");
        let root = site.path();

        let options = WatchOptions {
            retry: hotpage::detector::RetryPolicy {
                attempts: 3,
                delay: Duration::from_millis(20),
            },
            ..WatchOptions::default()
        };
        let watch_session = WatchSession::open(root, options).expect("Failed to open watch session");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (notification_tx, notification_rx) = mpsc::channel(64);
        watcher::run_watcher(
            vec![WatchTarget::recursive(watch_session.root())],
            Duration::from_millis(50),
            notification_tx,
        )
        .await
        .expect("Failed to start watcher");
        tokio::spawn(run_pipeline(
            Arc::clone(&watch_session),
            notification_rx,
            shutdown_rx.clone(),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("Failed to bind random port");
        let addr = listener.local_addr().unwrap();
        let state = AppState {
            watch: Arc::clone(&watch_session),
            public_dir: public.path().to_path_buf(),
            port: addr.port(),
        };
        tokio::spawn(async move {
            if let Err(e) = web::serve(listener, state, shutdown_rx).await {
                eprintln!("[Test Server] Error: {}", e);
            }
        });

        TestServer {
            root: watch_session.root().to_path_buf(),
            _site: site,
            _public: public,
            addr,
            watch: watch_session,
            shutdown_tx,
        }
    }

    fn ws_url(&self, path: &str) -> String {
        format!("ws://{}/ws?path={}", self.addr, path)
    }

    async fn open_socket(&self, path: &str) -> WsStream {
        let (ws, _) = connect_async(self.ws_url(path))
            .await
            .expect("WebSocket connect failed");
        ws
    }

    async fn agent(&self, location: &str) -> AgentHandle {
        // As the page would look with the served script URL.
        let markup = fs::read_to_string(self.root.join("index.html"))
            .unwrap()
            .replace("http://localhost:3008", &format!("http://{}", self.addr));
        client::connect(
            AgentConfig::new(self.addr.to_string(), location),
            Document::parse(location, markup),
        )
        .await
        .expect("Agent failed to connect")
    }

    /// Waits until `room` has `count` subscribers.
    async fn wait_for_members(&self, room: &str, count: usize) {
        let room = Room::new(room).unwrap();
        timeout(SHORT_TIMEOUT, async {
            while self.watch.hub().members(&room) < count {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{} never reached {} subscriber(s)", room, count));
    }

    fn write(&self, relative: &str, contents: &str) {
        fs::write(self.root.join(relative), contents).unwrap();
    }

    fn stop(self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn next_message(ws: &mut WsStream, wait: Duration) -> Option<ServerMessage> {
    timeout(wait, async {
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).ok();
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

async fn wait_for_view(agent: &mut AgentHandle, what: &str, predicate: impl FnMut(&AgentView) -> bool) -> AgentView {
    timeout(SHORT_TIMEOUT, agent.wait_for(predicate))
        .await
        .unwrap_or_else(|_| panic!("Timed out waiting for {}", what))
        .expect("Agent stopped")
}

fn style_hrefs(view: &AgentView) -> Vec<String> {
    view.document
        .urls_for("link", MatchAttr::Href, "css/styles.css")
        .into_iter()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn test_css_then_html_through_agent() {
    let server = TestServer::start().await;
    let mut agent = server.agent("/").await;

    wait_for_view(&mut agent, "self-version", |v| v.self_version.is_some()).await;
    server.wait_for_members("css/styles.css", 1).await;

    server.write("css/styles.css", "body { background-color: blue; }");
    let view = wait_for_view(&mut agent, "style patch", |v| {
        let hrefs = style_hrefs(v);
        hrefs.len() == 1 && hrefs[0].starts_with("css/styles.css?")
    })
    .await;
    let patched_href = style_hrefs(&view).remove(0);

    server.write("index.html", &INDEX_HTML.replace("My Site", "My Cool Site"));
    let view = wait_for_view(&mut agent, "markup update", |v| {
        v.document.title().as_deref() == Some("My Cool Site")
    })
    .await;

    assert_eq!(style_hrefs(&view), vec![patched_href]);
    assert_eq!(view.generation, 1);

    agent.stop().await.unwrap();
    server.stop();
}

/// Edits the stylesheet and the home page of a site served from `index`, in
/// the given order, and returns what the agent ends up showing.
async fn edit_style_and_markup(index: &str, style_first: bool) -> AgentView {
    let server = TestServer::start_with(index).await;
    let mut agent = server.agent("/").await;

    wait_for_view(&mut agent, "self-version", |v| v.self_version.is_some()).await;
    server.wait_for_members("css/styles.css", 1).await;

    let style_applied = |v: &AgentView| {
        let hrefs = style_hrefs(v);
        hrefs.len() == 1 && hrefs[0].starts_with("css/styles.css?")
    };
    let retitled = |v: &AgentView| v.document.title().as_deref() == Some("My Cool Site");

    if style_first {
        server.write("css/styles.css", "body { background-color: blue; }");
        wait_for_view(&mut agent, "style patch", style_applied).await;
        server.write("index.html", &index.replace("My Site", "My Cool Site"));
        wait_for_view(&mut agent, "markup update", retitled).await;
    } else {
        server.write("index.html", &index.replace("My Site", "My Cool Site"));
        wait_for_view(&mut agent, "markup update", retitled).await;
        server.write("css/styles.css", "body { background-color: blue; }");
        wait_for_view(&mut agent, "style patch", style_applied).await;
    }

    let view = agent.view();
    agent.stop().await.unwrap();
    server.stop();
    view
}

#[tokio::test]
async fn test_html_then_css_through_agent() {
    let view = edit_style_and_markup(INDEX_HTML, false).await;

    assert_eq!(view.document.title().as_deref(), Some("My Cool Site"));
    let hrefs = style_hrefs(&view);
    assert_eq!(hrefs.len(), 1);
    assert!(hrefs[0].starts_with("css/styles.css?"));
    assert_eq!(view.generation, 1);
}

#[tokio::test]
async fn test_unquoted_link_through_agent() {
    for style_first in [true, false] {
        let view = edit_style_and_markup(UNQUOTED_INDEX_HTML, style_first).await;

        assert_eq!(view.document.title().as_deref(), Some("My Cool Site"));
        let hrefs = style_hrefs(&view);
        assert_eq!(hrefs.len(), 1, "style_first = {}", style_first);
        assert!(
            hrefs[0].starts_with("css/styles.css?"),
            "style_first = {}: {:?}",
            style_first,
            hrefs
        );
    }
}

#[tokio::test]
async fn test_updates_are_scoped_to_rooms() {
    let server = TestServer::start().await;
    let mut home = server.open_socket("/").await;
    let mut page_two = server.open_socket("/page-two").await;

    assert!(matches!(
        next_message(&mut home, SHORT_TIMEOUT).await,
        Some(ServerMessage::ReloadSelf { .. })
    ));
    assert!(matches!(
        next_message(&mut page_two, SHORT_TIMEOUT).await,
        Some(ServerMessage::ReloadSelf { .. })
    ));

    home.send(Message::Text(
        r#"{"event":"watch-asset","data":{"room":"/css/styles.css"}}"#.to_string(),
    ))
    .await
    .unwrap();
    server.wait_for_members("css/styles.css", 1).await;

    server.write("page-two.html", "<title>Page II</title>");
    match next_message(&mut page_two, SHORT_TIMEOUT).await {
        Some(ServerMessage::HtmlUpdate(payload)) => {
            assert_eq!(payload.file_name.as_str(), "page-two.html");
            assert_eq!(payload.contents.as_deref(), Some("<title>Page II</title>"));
        }
        other => panic!("Expected html-update, got {:?}", other),
    }

    server.write("css/styles.css", "body { background-color: blue; }");
    match next_message(&mut home, SHORT_TIMEOUT).await {
        Some(ServerMessage::CssUpdate(payload)) => {
            assert_eq!(payload.file_name.as_str(), "css/styles.css");
            assert_eq!(
                payload.contents.as_deref(),
                Some("body { background-color: blue; }")
            );
        }
        other => panic!("Expected css-update, got {:?}", other),
    }

    assert_eq!(next_message(&mut home, QUIET_PERIOD).await, None);
    assert_eq!(next_message(&mut page_two, QUIET_PERIOD).await, None);
    server.stop();
}

#[tokio::test]
async fn test_reload_self_on_connect() {
    let server = TestServer::start().await;
    let mut ws = server.open_socket("/sub-dir/").await;
    assert_eq!(
        next_message(&mut ws, SHORT_TIMEOUT).await,
        Some(ServerMessage::ReloadSelf {
            self_version: server.watch.self_version().current()
        })
    );
    server.wait_for_members("sub-dir/index.html", 1).await;
    server.stop();
}

#[tokio::test]
async fn test_self_update_replaces_agent() {
    let server = TestServer::start().await;
    let mut agent = server.agent("/").await;
    let first = wait_for_view(&mut agent, "self-version", |v| v.self_version.is_some()).await;

    let next = server.watch.self_version().bump();
    assert!(Some(next) > first.self_version);
    server
        .watch
        .hub()
        .broadcast(&server.watch.self_version().message());

    let view = wait_for_view(&mut agent, "replacement agent", |v| {
        v.generation == 2 && v.self_version == Some(next)
    })
    .await;
    let scripts: Vec<&str> = view
        .document
        .elements()
        .iter()
        .filter(|el| el.tag == "script")
        .filter_map(|el| el.attr("src"))
        .collect();
    assert_eq!(scripts.len(), 1);
    assert!(scripts[0].contains("/reloader.js?"));

    agent.stop().await.unwrap();
    server.stop();
}

#[tokio::test]
async fn test_unknown_page_is_refused() {
    let server = TestServer::start().await;
    match connect_async(server.ws_url("/missing")).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 404),
        Ok(_) => panic!("Upgrade for a missing page was accepted"),
        Err(e) => panic!("Unexpected error: {}", e),
    }

    let refused = client::connect(
        AgentConfig::new(server.addr.to_string(), "/missing"),
        Document::parse("/missing", ""),
    )
    .await;
    assert!(refused.is_err());
    assert_eq!(server.watch.hub().session_count(), 0);
    server.stop();
}

#[tokio::test]
async fn test_client_script_served_with_port() {
    let server = TestServer::start().await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream
        .write_all(b"GET /reloader.js HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    timeout(SHORT_TIMEOUT, stream.read_to_string(&mut response))
        .await
        .expect("Timed out reading response")
        .unwrap();

    assert!(response.starts_with("HTTP/1.1 200"), "Response: {}", response);
    assert!(response.to_ascii_lowercase().contains("cache-control: no-cache"));
    assert!(response.contains(&format!("const PORT = {};", server.addr.port())));
    server.stop();
}

#[tokio::test]
async fn test_duplicate_and_filtered_changes() {
    // No live watcher here: every notification is delivered by hand.
    let site = site(INDEX_HTML);
    let watch_session = WatchSession::open(site.path(), WatchOptions::default()).unwrap();
    let root = watch_session.root().to_path_buf();
    let hub = watch_session.hub();
    let (id, mut rx) = hub.register();
    for room in ["css/extra.css", "ignored/skip.css", "notes.txt"] {
        hub.join(id, Room::new(room).unwrap());
    }

    fs::write(root.join("css/extra.css"), "a { color: red; }").unwrap();
    let path = root.join("css/extra.css");
    assert_eq!(watch_session.handle(FsVerb::Write, &path).await, 1);
    assert_eq!(watch_session.handle(FsVerb::Write, &path).await, 0);
    assert!(matches!(rx.try_recv(), Ok(ServerMessage::CssUpdate(_))));

    fs::write(root.join("ignored/skip.css"), "a{}").unwrap();
    fs::write(root.join("notes.txt"), "hello").unwrap();
    assert_eq!(
        watch_session
            .handle(FsVerb::Write, &root.join("ignored/skip.css"))
            .await,
        0
    );
    assert_eq!(
        watch_session.handle(FsVerb::Write, &root.join("notes.txt")).await,
        0
    );
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_cli_fails_without_root() {
    let hotpage_bin = std::env::var("CARGO_BIN_EXE_hotpage");
    if hotpage_bin.is_err() {
        eprintln!("CARGO_BIN_EXE_hotpage not set; skipping CLI integration test");
        return;
    }
    let hotpage_bin = hotpage_bin.unwrap();

    let output = std::process::Command::new(&hotpage_bin)
        .output()
        .expect("Failed to run hotpage binary");

    assert!(
        !output.status.success(),
        "Expected non-zero exit code when no root is given"
    );
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let combined = format!("{}\n{}", stdout, stderr);
    assert!(
        combined.contains("No root directory to watch"),
        "Expected error message not found. Output: {}",
        combined
    );
}
