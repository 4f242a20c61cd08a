// src/reconciler.rs

//! Client-side reconciliation of incoming updates.
//!
//! The [`Reconciler`] is the update-agent's state machine. It owns a
//! [`Document`] (the page source plus the resource-referencing elements in
//! it) and turns each server message into the smallest mutation that brings
//! the page up to date:
//!
//! - `css-update`: clone the first `<link>` referencing the file with a fresh
//!   cache-bust token; the old links are removed once the clone has loaded.
//! - `asset-update`: the same swap, on `<img src>` and icon `<link href>`.
//! - `html-update`: only for the page currently shown. Cache-bust tokens that
//!   were already applied are carried into the incoming markup before it
//!   replaces the document, so a markup edit never reverts a style or asset
//!   patch. The agent's own script is re-attached afterwards.
//! - `reload-self`: a version different from the one recorded moves the agent
//!   into replacement. It stops applying events, disconnects, and swaps its
//!   script for a cache-busted copy that bootstraps a new agent.
//!
//! Applying a style patch and a markup edit in either order yields the same
//! document.
//!
//! The reconciler performs no I/O. Side effects the host must carry out are
//! returned as [`Effect`]s.

use crate::event::{AssetKind, ServerMessage, UpdatePayload};
use crate::room::{logical_page, Room};
use regex::{Captures, Regex};
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

pub type ElementId = u64;

/// The URL attribute an update rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchAttr {
    Src,
    Href,
}

impl MatchAttr {
    pub fn name(self) -> &'static str {
        match self {
            MatchAttr::Src => "src",
            MatchAttr::Href => "href",
        }
    }
}

/// Elements an update kind may touch, each tied to its URL attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Stylesheet,
    Image,
    Icon,
}

impl Slot {
    fn for_kind(kind: AssetKind) -> &'static [Slot] {
        match kind {
            AssetKind::Style => &[Slot::Stylesheet],
            AssetKind::Asset => &[Slot::Image, Slot::Icon],
            AssetKind::Markup => &[],
        }
    }

    fn attr(self) -> MatchAttr {
        match self {
            Slot::Image => MatchAttr::Src,
            Slot::Stylesheet | Slot::Icon => MatchAttr::Href,
        }
    }

    fn accepts(self, el: &Element) -> bool {
        match self {
            Slot::Stylesheet => el.tag == "link" && !el.is_icon(),
            Slot::Icon => el.tag == "link" && el.is_icon(),
            Slot::Image => el.tag == "img",
        }
    }
}

/// A `<link>`, `<img>` or `<script>` element of the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub id: ElementId,
    pub tag: String,
    pub attrs: Vec<(String, String)>,
}

impl Element {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn set_attr(&mut self, name: &str, value: &str) {
        match self.attrs.iter_mut().find(|(k, _)| k == name) {
            Some((_, v)) => *v = value.to_string(),
            None => self.attrs.push((name.to_string(), value.to_string())),
        }
    }

    fn is_icon(&self) -> bool {
        self.attr("rel")
            .map(|rel| rel.to_ascii_lowercase().contains("icon"))
            .unwrap_or(false)
    }
}

/// Comparable view of a document: its title and resource elements in order,
/// without element ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSnapshot {
    pub title: Option<String>,
    pub elements: Vec<(String, Vec<(String, String)>)>,
}

fn element_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<(link|img|script)\b([^>]*)>").expect("valid element regex"))
}

fn attribute_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"([A-Za-z_:][-A-Za-z0-9_:.]*)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+)))?"#)
            .expect("valid attribute regex")
    })
}

fn url_attribute_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)(\s(?:href|src)\s*=\s*)(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+))"#)
            .expect("valid url attribute regex")
    })
}

fn title_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("valid title regex"))
}

/// The page as the agent sees it.
#[derive(Debug, Clone)]
pub struct Document {
    location: String,
    markup: String,
    elements: Vec<Element>,
    next_id: ElementId,
}

impl Document {
    /// Parses `markup` for a page shown at `location` (a URL path).
    pub fn parse(location: impl Into<String>, markup: impl Into<String>) -> Self {
        let mut document = Document {
            location: location.into(),
            markup: String::new(),
            elements: Vec::new(),
            next_id: 1,
        };
        document.replace_markup(markup.into());
        document
    }

    fn replace_markup(&mut self, markup: String) {
        let mut elements = Vec::new();
        for caps in element_pattern().captures_iter(&markup) {
            let attrs = attribute_pattern()
                .captures_iter(&caps[2])
                .map(|a| {
                    let value = a
                        .get(2)
                        .or_else(|| a.get(3))
                        .or_else(|| a.get(4))
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_default();
                    (a[1].to_ascii_lowercase(), value)
                })
                .collect();
            elements.push(Element {
                id: self.alloc_id(),
                tag: caps[1].to_ascii_lowercase(),
                attrs,
            });
        }
        self.markup = markup;
        self.elements = elements;
    }

    fn alloc_id(&mut self) -> ElementId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Location without query or fragment.
    pub fn location_path(&self) -> &str {
        strip_query(&self.location)
    }

    /// Document source as last replaced.
    pub fn markup(&self) -> &str {
        &self.markup
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn element(&self, id: ElementId) -> Option<&Element> {
        self.elements.iter().find(|el| el.id == id)
    }

    pub fn title(&self) -> Option<String> {
        title_pattern()
            .captures(&self.markup)
            .map(|c| c[1].trim().to_string())
    }

    /// Values of `attr` on `tag` elements whose URL path ends with `file`.
    pub fn urls_for(&self, tag: &str, attr: MatchAttr, file: &str) -> Vec<&str> {
        self.elements
            .iter()
            .filter(|el| el.tag == tag)
            .filter_map(|el| el.attr(attr.name()))
            .filter(|url| ends_with_file(&resolve_url_path(self.location_path(), url), file))
            .collect()
    }

    pub fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            title: self.title(),
            elements: self
                .elements
                .iter()
                .map(|el| (el.tag.clone(), el.attrs.clone()))
                .collect(),
        }
    }

    fn insert_after(&mut self, anchor: ElementId, element: Element) {
        let at = self
            .elements
            .iter()
            .position(|el| el.id == anchor)
            .map(|i| i + 1)
            .unwrap_or(self.elements.len());
        self.elements.insert(at, element);
    }

    fn remove(&mut self, ids: &[ElementId]) {
        self.elements.retain(|el| !ids.contains(&el.id));
    }
}

/// Drops any `?query` or `#fragment`.
pub fn strip_query(url: &str) -> &str {
    url.split(['?', '#']).next().unwrap_or_default()
}

/// `url` with its query replaced by the cache-bust `token`.
pub fn cache_bust(url: &str, token: &str) -> String {
    format!("{}?{}", strip_query(url), token)
}

/// Absolute URL path of `url` as referenced from a page at `location`.
pub fn resolve_url_path(location: &str, url: &str) -> String {
    let url = strip_query(url);
    let host_relative = |rest: &str| -> String {
        match rest.find('/') {
            Some(i) => rest[i..].to_string(),
            None => "/".to_string(),
        }
    };

    let path = if let Some((_, rest)) = url.split_once("://") {
        host_relative(rest)
    } else if let Some(rest) = url.strip_prefix("//") {
        host_relative(rest)
    } else if url.starts_with('/') {
        url.to_string()
    } else {
        let location = strip_query(location);
        let dir = match location.rfind('/') {
            Some(i) => &location[..=i],
            None => "/",
        };
        let dir = if dir.starts_with('/') {
            dir.to_string()
        } else {
            format!("/{dir}")
        };
        format!("{dir}{url}")
    };
    normalize_path(&path)
}

fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    let mut normalized = format!("/{}", segments.join("/"));
    if path.ends_with('/') && normalized.len() > 1 {
        normalized.push('/');
    }
    normalized
}

fn ends_with_file(path: &str, file: &str) -> bool {
    let file = file.trim_start_matches('/');
    !file.is_empty() && path.ends_with(&format!("/{file}"))
}

/// Source of cache-bust tokens: distinct for the life of one agent.
#[derive(Debug, Clone)]
pub struct CacheBuster {
    seed: u64,
    counter: u64,
}

impl CacheBuster {
    pub fn seeded(seed: u64) -> Self {
        CacheBuster { seed, counter: 0 }
    }

    pub fn from_clock() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        CacheBuster::seeded(seed)
    }

    pub fn next_token(&mut self) -> String {
        self.counter += 1;
        self.seed.wrapping_add(self.counter).to_string()
    }
}

/// Where the agent is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Connecting,
    Connected,
    Applying,
    SelfUpdatePending,
    Disconnecting,
    Replaced,
}

/// Work the host must perform on the reconciler's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Send `watch-asset` for this URL path.
    WatchAsset(String),
    /// Report [`Reconciler::resource_loaded`] once this element has loaded.
    AwaitLoad(ElementId),
    /// The document content was replaced.
    DocumentReplaced,
    /// Close the live channel.
    Disconnect,
    /// Load a fresh agent from `src`.
    ReplaceScript { src: String },
}

#[derive(Debug, Clone)]
struct PendingSwap {
    replacement: ElementId,
    stale: Vec<ElementId>,
}

#[derive(Debug)]
pub struct Reconciler {
    state: AgentState,
    document: Document,
    asset_root: String,
    /// `src` of the agent's own script without cache-bust token.
    script_src: String,
    /// The element the running agent was loaded from.
    own_script: Element,
    self_version: Option<u64>,
    /// Applied cache-bust tokens by room path (`/` + path under the root).
    patched: HashMap<String, String>,
    pending: Vec<PendingSwap>,
    buster: CacheBuster,
}

impl Reconciler {
    /// A fresh agent for `document`. `script_src` is the URL of the agent
    /// script, used to re-attach it after markup updates and to replace it
    /// on self-update.
    pub fn new(mut document: Document, asset_root: impl Into<String>, script_src: impl Into<String>) -> Self {
        let script_src = script_src.into();
        let found = document
            .elements
            .iter()
            .filter(|el| el.tag == "script")
            .find(|el| {
                el.attr("src")
                    .map(|src| strip_query(src) == strip_query(&script_src))
                    .unwrap_or(false)
            })
            .cloned();
        let own_script = match found {
            Some(el) => el,
            None => Element {
                id: document.alloc_id(),
                tag: "script".to_string(),
                attrs: vec![("src".to_string(), script_src.clone())],
            },
        };

        Reconciler {
            state: AgentState::Connecting,
            document,
            asset_root: asset_root.into(),
            script_src: strip_query(&script_src).to_string(),
            own_script,
            self_version: None,
            patched: HashMap::new(),
            pending: Vec::new(),
            buster: CacheBuster::from_clock(),
        }
    }

    pub fn with_buster(mut self, buster: CacheBuster) -> Self {
        self.buster = buster;
        self
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn into_document(self) -> Document {
        self.document
    }

    pub fn self_version(&self) -> Option<u64> {
        self.self_version
    }

    /// The channel is up: subscribe to every referenced resource.
    pub fn on_connected(&mut self) -> Vec<Effect> {
        self.state = AgentState::Connected;
        self.discover()
    }

    /// Applies one server message.
    pub fn handle(&mut self, msg: ServerMessage) -> Vec<Effect> {
        if matches!(
            self.state,
            AgentState::SelfUpdatePending | AgentState::Disconnecting | AgentState::Replaced
        ) {
            debug!("Agent is being replaced, ignoring {}", msg.name());
            return Vec::new();
        }

        match msg {
            ServerMessage::ReloadSelf { self_version } => self.check_version(self_version),
            ServerMessage::CssUpdate(payload) => self.apply(AssetKind::Style, payload),
            ServerMessage::HtmlUpdate(payload) => self.apply(AssetKind::Markup, payload),
            ServerMessage::AssetUpdate(payload) => self.apply(AssetKind::Asset, payload),
        }
    }

    /// A replacement element finished loading: drop the elements it
    /// supersedes. Returns `false` if no swap was waiting on `id`.
    pub fn resource_loaded(&mut self, id: ElementId) -> bool {
        let Some(at) = self.pending.iter().position(|p| p.replacement == id) else {
            return false;
        };
        let swap = self.pending.remove(at);
        self.document.remove(&swap.stale);
        true
    }

    /// The host disconnected and loaded the replacement script.
    pub fn finish_replacement(&mut self) {
        if self.state == AgentState::Disconnecting {
            self.state = AgentState::Replaced;
        }
    }

    fn apply(&mut self, kind: AssetKind, payload: UpdatePayload) -> Vec<Effect> {
        self.state = AgentState::Applying;
        let effects = match kind {
            AssetKind::Markup => self.replace_markup(payload),
            AssetKind::Style | AssetKind::Asset => self.swap_assets(kind, &payload.file_name),
        };
        self.state = AgentState::Connected;
        effects
    }

    fn check_version(&mut self, incoming: u64) -> Vec<Effect> {
        match self.self_version {
            None => {
                self.self_version = Some(incoming);
                Vec::new()
            }
            Some(current) if current == incoming => Vec::new(),
            Some(current) => {
                debug!("Agent version {} superseded by {}", current, incoming);
                self.state = AgentState::SelfUpdatePending;
                let src = cache_bust(&self.script_src, &self.buster.next_token());
                self.replace_own_script(&src);
                self.state = AgentState::Disconnecting;
                vec![Effect::Disconnect, Effect::ReplaceScript { src }]
            }
        }
    }

    /// Path under the watched root (with leading `/`) that `url` refers to.
    fn room_path(&self, url: &str) -> String {
        let path = resolve_url_path(self.document.location_path(), url);
        format!("/{}", logical_page(&self.asset_root, &path))
    }

    fn references(&self, url: &str, file: &Room) -> bool {
        ends_with_file(&self.room_path(url), file.as_str())
    }

    fn swap_assets(&mut self, kind: AssetKind, file: &Room) -> Vec<Effect> {
        let mut effects = Vec::new();
        for slot in Slot::for_kind(kind) {
            let attr = slot.attr().name();
            let matches: Vec<ElementId> = self
                .document
                .elements
                .iter()
                .filter(|el| slot.accepts(el))
                .filter(|el| el.attr(attr).map(|url| self.references(url, file)).unwrap_or(false))
                .map(|el| el.id)
                .collect();
            let Some(template) = matches.first().and_then(|id| self.document.element(*id)).cloned()
            else {
                continue;
            };

            let url = template.attr(attr).unwrap_or_default().to_string();
            let token = self.buster.next_token();
            let key = self.room_path(&url);
            self.patched.insert(key, token.clone());

            let mut replacement = template.clone();
            replacement.id = self.document.alloc_id();
            replacement.set_attr(attr, &cache_bust(&url, &token));
            let replacement_id = replacement.id;
            self.document.insert_after(template.id, replacement);

            self.pending.push(PendingSwap {
                replacement: replacement_id,
                stale: matches,
            });
            effects.push(Effect::AwaitLoad(replacement_id));
        }
        effects
    }

    fn replace_markup(&mut self, payload: UpdatePayload) -> Vec<Effect> {
        let page = logical_page(&self.asset_root, self.document.location_path());
        if !payload.file_name.matches_page(&page) {
            debug!("{} is not the current page, ignoring", payload.file_name);
            return Vec::new();
        }
        let Some(contents) = payload.contents else {
            return Vec::new();
        };

        let markup = self.carry_patches(&contents);
        self.pending.clear();
        self.document.replace_markup(markup);
        self.reattach_script();

        let mut effects = vec![Effect::DocumentReplaced];
        effects.extend(self.discover());
        effects
    }

    /// Rewrites URLs in incoming markup that point at already patched
    /// resources to their cache-busted form.
    fn carry_patches(&self, markup: &str) -> String {
        if self.patched.is_empty() {
            return markup.to_string();
        }
        url_attribute_pattern()
            .replace_all(markup, |caps: &Captures| {
                let (url, quote) = if let Some(m) = caps.get(2) {
                    (m.as_str(), "\"")
                } else if let Some(m) = caps.get(3) {
                    (m.as_str(), "'")
                } else if let Some(m) = caps.get(4) {
                    (m.as_str(), "")
                } else {
                    return caps[0].to_string();
                };
                match self.patched.get(&self.room_path(url)) {
                    Some(token) => format!("{}{quote}{}{quote}", &caps[1], cache_bust(url, token)),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    fn is_own_script(&self, el: &Element) -> bool {
        el.tag == "script"
            && el
                .attr("src")
                .map(|src| strip_query(src) == self.script_src)
                .unwrap_or(false)
    }

    /// Puts back the element the running agent was loaded from.
    fn reattach_script(&mut self) {
        if self.document.elements.iter().any(|el| self.is_own_script(el)) {
            return;
        }
        self.document.elements.push(self.own_script.clone());
    }

    fn replace_own_script(&mut self, src: &str) {
        let stale: Vec<ElementId> = self
            .document
            .elements
            .iter()
            .filter(|el| self.is_own_script(el))
            .map(|el| el.id)
            .collect();
        self.document.remove(&stale);
        let mut script = self.own_script.clone();
        script.id = self.document.alloc_id();
        script.set_attr("src", src);
        self.document.elements.push(script.clone());
        self.own_script = script;
    }

    /// `watch-asset` requests for every stylesheet, image and icon.
    fn discover(&self) -> Vec<Effect> {
        let mut seen = HashSet::new();
        self.document
            .elements
            .iter()
            .filter_map(|el| match el.tag.as_str() {
                "link" => el.attr("href"),
                "img" => el.attr("src"),
                _ => None,
            })
            .map(|url| resolve_url_path(self.document.location_path(), url))
            .filter(|path| seen.insert(path.clone()))
            .map(Effect::WatchAsset)
            .collect()
    }
}
