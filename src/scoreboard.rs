//! A hand-written slice of the scoreboard tree.
//!
//! Each type wraps a [`Node`] and only names paths; all state lives in the
//! connection's store.

use uuid::Uuid;

use crate::connection::Connection;
use crate::json::{FromJson, JsonValue};
use crate::path::{PathComponent, StatePath};
use crate::projection::{
    ImmutableLeaf, Leaf, MapNodeCollection, MapValueCollection, Node, Projection,
};

/// Render milliseconds as `m:ss`, or `-:--` when unknown.
pub fn format_clock(ms: Option<i64>) -> String {
    match ms {
        Some(ms) => {
            let secs = ms / 1000;
            format!("{}:{:02}", secs / 60, secs % 60)
        }
        None => "-:--".to_owned(),
    }
}

/// Implements [`Projection`] for a newtype over [`Node`].
macro_rules! node_view {
    ($name:ident) => {
        impl Projection for $name {
            fn project(connection: &Connection, path: StatePath) -> Self {
                Self(Node::new(connection, path))
            }

            fn state_path(&self) -> &StatePath {
                self.0.path()
            }
        }

        impl $name {
            pub fn node(&self) -> &Node {
                &self.0
            }
        }
    };
}

/// Implements [`FromJson`] for a string-valued enum.
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl FromJson for $name {
            fn from_json(value: &JsonValue) -> Option<Self> {
                match value.as_str()? {
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }

            fn to_json(&self) -> JsonValue {
                JsonValue::String(self.as_str().to_owned())
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameState {
    Prepared,
    Running,
    Finished,
}

string_enum!(GameState {
    Prepared => "Prepared",
    Running => "Running",
    Finished => "Finished",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkaterRole {
    Bench,
    Blocker,
    Pivot,
    Jammer,
}

string_enum!(SkaterRole {
    Bench => "Bench",
    Blocker => "Blocker",
    Pivot => "Pivot",
    Jammer => "Jammer",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkaterFlags {
    Skater,
    AltSkater,
    Bench,
    Captain,
    BenchAltCaptain,
    AltCaptain,
}

string_enum!(SkaterFlags {
    Skater => "",
    AltSkater => "ALT",
    Bench => "B",
    Captain => "C",
    BenchAltCaptain => "BA",
    AltCaptain => "AC",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockKind {
    Period,
    Jam,
    Lineup,
    Timeout,
    Intermission,
}

impl ClockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Period => "Period",
            Self::Jam => "Jam",
            Self::Lineup => "Lineup",
            Self::Timeout => "Timeout",
            Self::Intermission => "Intermission",
        }
    }
}

/// The `ScoreBoard` root.
#[derive(Clone)]
pub struct ScoreBoard(Node);

node_view!(ScoreBoard);

impl ScoreBoard {
    pub fn new(connection: &Connection) -> Self {
        Self(Node::new(connection, StatePath::parse("ScoreBoard")))
    }

    pub fn version(&self) -> ImmutableLeaf<String> {
        ImmutableLeaf::new(
            self.0.connection(),
            self.0
                .path()
                .adding(PathComponent::Named("Version".into(), "release".into())),
        )
    }

    pub fn current_game_id(&self) -> Leaf<Uuid> {
        Leaf::new(
            self.0.connection(),
            self.0.path().child("CurrentGame").child("Game"),
        )
    }

    /// The game the server is currently showing, once its id is known.
    pub fn current_game(&self) -> Option<Game> {
        self.current_game_id().read().map(|id| self.game(id))
    }

    pub fn game(&self, id: Uuid) -> Game {
        self.0.child(PathComponent::Identified("Game".into(), id))
    }

    pub fn games(&self) -> MapNodeCollection<Game, Uuid> {
        self.0.nodes("Game")
    }
}

/// `ScoreBoard.Game(<uuid>)`.
#[derive(Clone)]
pub struct Game(Node);

node_view!(Game);

impl Game {
    pub fn id(&self) -> Option<Uuid> {
        self.0.id()
    }

    pub fn name(&self) -> ImmutableLeaf<String> {
        self.0.immutable_leaf("Name")
    }

    pub fn state(&self) -> ImmutableLeaf<GameState> {
        self.0.immutable_leaf("State")
    }

    pub fn in_jam(&self) -> ImmutableLeaf<bool> {
        self.0.immutable_leaf("InJam")
    }

    pub fn current_period_number(&self) -> ImmutableLeaf<i64> {
        self.0.immutable_leaf("CurrentPeriodNumber")
    }

    pub fn official_review(&self) -> Leaf<bool> {
        self.0.leaf("OfficialReview")
    }

    pub fn team(&self, number: i64) -> Team {
        self.0.child(PathComponent::Indexed("Team".into(), number))
    }

    pub fn team_one(&self) -> Team {
        self.team(1)
    }

    pub fn team_two(&self) -> Team {
        self.team(2)
    }

    pub fn clock(&self, kind: ClockKind) -> Clock {
        self.0
            .child(PathComponent::Named("Clock".into(), kind.as_str().to_owned()))
    }

    pub fn period_clock(&self) -> Clock {
        self.clock(ClockKind::Period)
    }

    pub fn jam_clock(&self) -> Clock {
        self.clock(ClockKind::Jam)
    }

    pub fn penalty_codes(&self) -> MapValueCollection<String, String> {
        self.0.values("PenaltyCode")
    }

    /// The skater with `id` on whichever team rosters them.
    pub fn skater(&self, id: Uuid) -> Option<Skater> {
        [self.team_one(), self.team_two()]
            .into_iter()
            .map(|team| team.skaters())
            .find(|skaters| skaters.keys().contains(&id))
            .map(|skaters| skaters.get(&id))
    }

    /// Both rosters, team one first.
    pub fn all_skaters(&self) -> Vec<Skater> {
        let mut skaters = self.team_one().skaters().all_values();
        skaters.extend(self.team_two().skaters().all_values());
        skaters
    }

    pub fn start_jam(&self) {
        self.0.command("StartJam");
    }

    pub fn stop_jam(&self) {
        self.0.command("StopJam");
    }

    pub fn timeout(&self) {
        self.0.command("Timeout");
    }

    pub fn official_timeout(&self) {
        self.0.command("OfficialTimeout");
    }

    pub fn clock_undo(&self) {
        self.0.command("ClockUndo");
    }
}

/// `Game(..).Team(1|2)`.
#[derive(Clone)]
pub struct Team(Node);

node_view!(Team);

impl Team {
    pub fn number(&self) -> Option<i64> {
        self.0.id()
    }

    pub fn name(&self) -> Leaf<String> {
        self.0.leaf("Name")
    }

    pub fn score(&self) -> ImmutableLeaf<i64> {
        self.0.immutable_leaf("Score")
    }

    pub fn jam_score(&self) -> ImmutableLeaf<i64> {
        self.0.immutable_leaf("JamScore")
    }

    pub fn timeouts(&self) -> ImmutableLeaf<i64> {
        self.0.immutable_leaf("Timeouts")
    }

    pub fn skaters(&self) -> MapNodeCollection<Skater, Uuid> {
        self.0.nodes("Skater")
    }

    pub fn timeout(&self) {
        self.0.command("Timeout");
    }

    pub fn official_review(&self) {
        self.0.command("OfficialReview");
    }
}

/// `Team(..).Skater(<uuid>)`.
#[derive(Clone)]
pub struct Skater(Node);

node_view!(Skater);

impl Skater {
    pub fn id(&self) -> Option<Uuid> {
        self.0.id()
    }

    pub fn name(&self) -> Leaf<String> {
        self.0.leaf("Name")
    }

    pub fn roster_number(&self) -> Leaf<String> {
        self.0.leaf("RosterNumber")
    }

    pub fn role(&self) -> Leaf<SkaterRole> {
        self.0.leaf("Role")
    }

    pub fn flags(&self) -> Leaf<SkaterFlags> {
        self.0.leaf("Flags")
    }
}

/// `Game(..).Clock(<kind>)`.
#[derive(Clone)]
pub struct Clock(Node);

node_view!(Clock);

impl Clock {
    /// Milliseconds remaining (or elapsed, for count-up clocks).
    pub fn time(&self) -> Leaf<i64> {
        self.0.leaf("Time")
    }

    pub fn number(&self) -> ImmutableLeaf<i64> {
        self.0.immutable_leaf("Number")
    }

    pub fn running(&self) -> ImmutableLeaf<bool> {
        self.0.immutable_leaf("Running")
    }

    pub fn display(&self) -> String {
        format_clock(self.time().read())
    }

    pub fn start(&self) {
        self.0.command("Start");
    }

    pub fn stop(&self) {
        self.0.command("Stop");
    }

    pub fn reset_time(&self) {
        self.0.command("ResetTime");
    }
}

/// `WS.Device`, this client's identity as the server sees it.
#[derive(Clone)]
pub struct Device(Node);

node_view!(Device);

impl Device {
    pub fn new(connection: &Connection) -> Self {
        Self(Node::new(connection, StatePath::parse("WS.Device")))
    }

    pub fn name(&self) -> ImmutableLeaf<String> {
        self.0.immutable_leaf("Name")
    }

    pub fn id(&self) -> ImmutableLeaf<Uuid> {
        self.0.immutable_leaf("Id")
    }
}
