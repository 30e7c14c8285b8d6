//! Remote-control operations and the capability set they drive.
//!
//! An operation line is `OPCODE [args]`. The opcode ends at the first
//! space; arguments after it are whitespace-separated:
//!
//! ```text
//! KEY <code>            DPAD <up|down|left|right|center>
//! MOVE <dx> <dy>        SCROLL <dx> <dy>
//! VOLUME <delta>        MEDIA <play|pause|...>
//! LAUNCH <activity>     TEXT <rest of line, verbatim>
//! CLICK | BACK | HOME
//! ```
//!
//! An opcode outside this table is `UnsupportedOperation`; a known opcode
//! with the wrong argument count or an unparsable argument is `Malformed`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::RemoteError;
use crate::juggler::{EventHandler, OperationTable};

// ── Opcode ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Key,
    Dpad,
    Move,
    Click,
    Scroll,
    Volume,
    Media,
    Text,
    Launch,
    Back,
    Home,
}

impl Opcode {
    pub const ALL: [Opcode; 11] = [
        Opcode::Key,
        Opcode::Dpad,
        Opcode::Move,
        Opcode::Click,
        Opcode::Scroll,
        Opcode::Volume,
        Opcode::Media,
        Opcode::Text,
        Opcode::Launch,
        Opcode::Back,
        Opcode::Home,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Opcode::Key => "KEY",
            Opcode::Dpad => "DPAD",
            Opcode::Move => "MOVE",
            Opcode::Click => "CLICK",
            Opcode::Scroll => "SCROLL",
            Opcode::Volume => "VOLUME",
            Opcode::Media => "MEDIA",
            Opcode::Text => "TEXT",
            Opcode::Launch => "LAUNCH",
            Opcode::Back => "BACK",
            Opcode::Home => "HOME",
        }
    }
}

impl TryFrom<&str> for Opcode {
    type Error = RemoteError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Opcode::ALL
            .into_iter()
            .find(|op| op.as_str() == value)
            .ok_or_else(|| RemoteError::UnsupportedOperation(value.to_string()))
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Arguments ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
    Center,
}

impl FromStr for Direction {
    type Err = RemoteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "up" => Ok(Direction::Up),
            "down" => Ok(Direction::Down),
            "left" => Ok(Direction::Left),
            "right" => Ok(Direction::Right),
            "center" => Ok(Direction::Center),
            other => Err(RemoteError::Malformed(format!("unknown direction: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaAction {
    Play,
    Pause,
    PlayPause,
    Next,
    Previous,
    Stop,
    Rewind,
    FastForward,
}

impl FromStr for MediaAction {
    type Err = RemoteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "play" => Ok(MediaAction::Play),
            "pause" => Ok(MediaAction::Pause),
            "playpause" => Ok(MediaAction::PlayPause),
            "next" => Ok(MediaAction::Next),
            "previous" => Ok(MediaAction::Previous),
            "stop" => Ok(MediaAction::Stop),
            "rewind" => Ok(MediaAction::Rewind),
            "fastforward" => Ok(MediaAction::FastForward),
            other => Err(RemoteError::Malformed(format!("unknown media action: {other}"))),
        }
    }
}

// ── Request ──────────────────────────────────────────────────────

/// One parsed remote-control operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Key(u32),
    Dpad(Direction),
    Move { dx: i32, dy: i32 },
    Click,
    Scroll { dx: i32, dy: i32 },
    Volume(i32),
    Media(MediaAction),
    Text(String),
    Launch(String),
    Back,
    Home,
}

impl Request {
    /// Parse a full `OPCODE [args]` line.
    pub fn parse(line: &str) -> Result<Self, RemoteError> {
        let line = line.trim_end();
        match line.split_once(' ') {
            Some((opcode, args)) => Self::from_parts(opcode, Some(args)),
            None => Self::from_parts(line, None),
        }
    }

    /// Build from an opcode and its unparsed argument text.
    pub fn from_parts(opcode: &str, args: Option<&str>) -> Result<Self, RemoteError> {
        let opcode = Opcode::try_from(opcode)?;
        if opcode == Opcode::Text {
            return match args {
                Some(text) if !text.is_empty() => Ok(Request::Text(text.to_string())),
                _ => Err(RemoteError::Malformed("TEXT needs text".into())),
            };
        }

        let args: Vec<&str> = args.map(|a| a.split_whitespace().collect()).unwrap_or_default();
        let request = match (opcode, args.as_slice()) {
            (Opcode::Key, [code]) => Request::Key(number(opcode, code)?),
            (Opcode::Dpad, [direction]) => Request::Dpad(direction.parse()?),
            (Opcode::Move, [dx, dy]) => Request::Move {
                dx: number(opcode, dx)?,
                dy: number(opcode, dy)?,
            },
            (Opcode::Click, []) => Request::Click,
            (Opcode::Scroll, [dx, dy]) => Request::Scroll {
                dx: number(opcode, dx)?,
                dy: number(opcode, dy)?,
            },
            (Opcode::Volume, [delta]) => Request::Volume(number(opcode, delta)?),
            (Opcode::Media, [action]) => Request::Media(action.parse()?),
            (Opcode::Launch, [activity]) => Request::Launch(activity.to_string()),
            (Opcode::Back, []) => Request::Back,
            (Opcode::Home, []) => Request::Home,
            (op, args) => {
                return Err(RemoteError::Malformed(format!(
                    "{op}: unexpected argument count {}",
                    args.len()
                )));
            }
        };
        Ok(request)
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Key(_) => Opcode::Key,
            Request::Dpad(_) => Opcode::Dpad,
            Request::Move { .. } => Opcode::Move,
            Request::Click => Opcode::Click,
            Request::Scroll { .. } => Opcode::Scroll,
            Request::Volume(_) => Opcode::Volume,
            Request::Media(_) => Opcode::Media,
            Request::Text(_) => Opcode::Text,
            Request::Launch(_) => Opcode::Launch,
            Request::Back => Opcode::Back,
            Request::Home => Opcode::Home,
        }
    }

    /// Dispatch to the matching capability method.
    pub async fn apply(&self, caps: &dyn Capabilities) -> Result<(), RemoteError> {
        match self {
            Request::Key(code) => caps.key(*code).await,
            Request::Dpad(direction) => caps.dpad(*direction).await,
            Request::Move { dx, dy } => caps.cursor_move(*dx, *dy).await,
            Request::Click => caps.click().await,
            Request::Scroll { dx, dy } => caps.scroll(*dx, *dy).await,
            Request::Volume(delta) => caps.volume(*delta).await,
            Request::Media(action) => caps.media(*action).await,
            Request::Text(text) => caps.text(text).await,
            Request::Launch(activity) => caps.launch(activity).await,
            Request::Back => caps.back().await,
            Request::Home => caps.home().await,
        }
    }
}

fn number<N: FromStr>(opcode: Opcode, raw: &str) -> Result<N, RemoteError> {
    raw.parse()
        .map_err(|_| RemoteError::Malformed(format!("{opcode}: bad number '{raw}'")))
}

// ── Capabilities ─────────────────────────────────────────────────

/// The input/output collaborators operations are dispatched to.
#[async_trait]
pub trait Capabilities: Send + Sync {
    async fn key(&self, code: u32) -> Result<(), RemoteError>;
    async fn dpad(&self, direction: Direction) -> Result<(), RemoteError>;
    async fn cursor_move(&self, dx: i32, dy: i32) -> Result<(), RemoteError>;
    async fn click(&self) -> Result<(), RemoteError>;
    async fn scroll(&self, dx: i32, dy: i32) -> Result<(), RemoteError>;
    async fn volume(&self, delta: i32) -> Result<(), RemoteError>;
    async fn media(&self, action: MediaAction) -> Result<(), RemoteError>;
    async fn text(&self, text: &str) -> Result<(), RemoteError>;
    async fn launch(&self, activity: &str) -> Result<(), RemoteError>;
    async fn back(&self) -> Result<(), RemoteError>;
    async fn home(&self) -> Result<(), RemoteError>;
}

/// Where connections look up the currently bound capability set.
pub trait CapabilitySource: Send + Sync {
    fn current(&self) -> Option<Arc<dyn Capabilities>>;
}

/// Capability set that can be bound and unbound at runtime.
#[derive(Default)]
pub struct CapabilitySlot {
    bound: RwLock<Option<Arc<dyn Capabilities>>>,
}

impl CapabilitySlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `caps`, returning the previously bound set.
    pub fn bind(&self, caps: Arc<dyn Capabilities>) -> Option<Arc<dyn Capabilities>> {
        self.bound.write().replace(caps)
    }

    pub fn unbind(&self) -> Option<Arc<dyn Capabilities>> {
        self.bound.write().take()
    }

    pub fn is_bound(&self) -> bool {
        self.bound.read().is_some()
    }
}

impl CapabilitySource for CapabilitySlot {
    fn current(&self) -> Option<Arc<dyn Capabilities>> {
        self.bound.read().clone()
    }
}

impl fmt::Debug for CapabilitySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilitySlot")
            .field("bound", &self.is_bound())
            .finish()
    }
}

// ── Juggler handlers ─────────────────────────────────────────────

/// Runs one opcode against whatever capability set is bound when the
/// request arrives.
pub struct CapabilityHandler {
    opcode: Opcode,
    source: Arc<dyn CapabilitySource>,
}

impl CapabilityHandler {
    pub fn new(opcode: Opcode, source: Arc<dyn CapabilitySource>) -> Self {
        Self { opcode, source }
    }
}

#[async_trait]
impl EventHandler for CapabilityHandler {
    async fn handle(&self, extra: Option<String>) -> Result<Option<String>, RemoteError> {
        let caps = self
            .source
            .current()
            .ok_or(RemoteError::NotReady("no capability set bound"))?;
        let request = Request::from_parts(self.opcode.as_str(), extra.as_deref())?;
        request.apply(caps.as_ref()).await?;
        Ok(None)
    }
}

/// Operation table with one handler per opcode.
pub fn capability_operations(source: Arc<dyn CapabilitySource>) -> OperationTable {
    let mut ops = OperationTable::new();
    for opcode in Opcode::ALL {
        ops.register(
            opcode.as_str(),
            Arc::new(CapabilityHandler::new(opcode, Arc::clone(&source))),
        );
    }
    ops
}

// ── Tests ────────────────────────────────────────────────────────
