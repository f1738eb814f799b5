//! Live-state client for a scoreboard server.
//!
//! The server exposes its game state as a tree of dotted paths
//! (`ScoreBoard.Game(<id>).Team(1).Score`). A [`Connection`] keeps one
//! WebSocket open, registers interest in paths as they are read, and mirrors
//! every value the server pushes into a flat [`StateStore`]. The
//! [`projection`] module builds typed views over that mirror, and
//! [`scoreboard`] names the parts of the tree most clients need.
//!
//! ```no_run
//! use statter::{Connection, ConnectionConfig, StatePath};
//!
//! # async fn run() -> Result<(), statter::SessionError> {
//! let connection = Connection::new(ConnectionConfig::with_host("10.0.0.10", 8000));
//! connection.connect().await?;
//! let score = connection.fetch(&StatePath::parse("ScoreBoard.CurrentGame.Team(1).Score"));
//! # let _ = score;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod json;
pub mod keepalive;
pub mod path;
pub mod projection;
pub mod protocol;
pub mod registration;
pub mod scoreboard;
pub mod snapshot;
pub mod store;

pub use config::{ConfigError, ConnectionConfig, KeepaliveConfig, Source};
pub use connection::{Connection, Lookup};
pub use error::{SessionError, SocketId};
pub use json::{FromJson, JsonValue};
pub use path::{PathComponent, StatePath};
pub use projection::{
    ComponentId, ImmutableLeaf, Leaf, MapNodeCollection, MapValueCollection, Node, Projection,
};
pub use protocol::{ChangeKind, Command};
pub use snapshot::{Snapshot, SnapshotError};
pub use store::{ChangeEvent, StateStore, StoreEvent};
