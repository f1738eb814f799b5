//! Typed views over the flat mirror.
//!
//! A view is just a path plus a [`Connection`] handle. Nothing is cached:
//! every read goes to the store, and collections rescan the whole store on
//! each call so they can never go stale.

use std::collections::{BTreeMap, BTreeSet};
use std::marker::PhantomData;

use uuid::Uuid;

use crate::connection::Connection;
use crate::json::{FromJson, JsonValue};
use crate::path::{PathComponent, StatePath};
use crate::protocol::ChangeKind;

/// A view type that can be built for any path, so collections can
/// materialize their children.
pub trait Projection {
    fn project(connection: &Connection, path: StatePath) -> Self;
    fn state_path(&self) -> &StatePath;
}

/// A child id as it appears in a path parameter.
pub trait ComponentId: Ord + Clone {
    fn from_component(component: &PathComponent) -> Option<Self>;
    fn to_component(&self, name: &str) -> PathComponent;
}

impl ComponentId for Uuid {
    fn from_component(component: &PathComponent) -> Option<Self> {
        match component {
            PathComponent::Identified(_, id) => Some(*id),
            _ => None,
        }
    }

    fn to_component(&self, name: &str) -> PathComponent {
        PathComponent::Identified(name.to_owned(), *self)
    }
}

impl ComponentId for String {
    fn from_component(component: &PathComponent) -> Option<Self> {
        match component {
            PathComponent::Named(_, param) => Some(param.clone()),
            _ => None,
        }
    }

    fn to_component(&self, name: &str) -> PathComponent {
        PathComponent::Named(name.to_owned(), self.clone())
    }
}

impl ComponentId for i64 {
    fn from_component(component: &PathComponent) -> Option<Self> {
        match component {
            PathComponent::Indexed(_, index) => Some(*index),
            _ => None,
        }
    }

    fn to_component(&self, name: &str) -> PathComponent {
        PathComponent::Indexed(name.to_owned(), *self)
    }
}

/// A read/write scalar.
pub struct Leaf<T> {
    connection: Connection,
    path: StatePath,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Leaf<T> {
    fn clone(&self) -> Self {
        Self {
            connection: self.connection.clone(),
            path: self.path.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: FromJson> Leaf<T> {
    pub fn new(connection: &Connection, path: StatePath) -> Self {
        Self {
            connection: connection.clone(),
            path,
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &StatePath {
        &self.path
    }

    /// The decoded value, or `None` if absent or of the wrong shape.
    /// Registers the path on first read.
    pub fn read(&self) -> Option<T> {
        self.connection
            .get_or_subscribe(&self.path)
            .value
            .as_ref()
            .and_then(T::from_json)
    }

    pub fn raw(&self) -> Option<JsonValue> {
        self.connection.fetch(&self.path)
    }

    pub fn write(&self, value: &T, kind: ChangeKind) {
        self.connection.set(self.path.clone(), value.to_json(), kind);
    }
}

/// A server-computed scalar that must not be written locally.
pub struct ImmutableLeaf<T>(Leaf<T>);

impl<T> Clone for ImmutableLeaf<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: FromJson> ImmutableLeaf<T> {
    pub fn new(connection: &Connection, path: StatePath) -> Self {
        Self(Leaf::new(connection, path))
    }

    pub fn path(&self) -> &StatePath {
        self.0.path()
    }

    pub fn read(&self) -> Option<T> {
        self.0.read()
    }

    pub fn raw(&self) -> Option<JsonValue> {
        self.0.raw()
    }
}

/// The id of the child `kind(id)` directly under `parent` that `path` lives
/// in, if any.
fn child_id<I: ComponentId>(path: &StatePath, parent: &StatePath, kind: &str) -> Option<I> {
    match path.dropping(parent)? {
        [first, ..] if first.name() == kind => I::from_component(first),
        _ => None,
    }
}

/// All `kind(id)` child nodes directly under a parent, e.g. every
/// `Skater(<uuid>)` of a `Team(1)`.
pub struct MapNodeCollection<C, I> {
    connection: Connection,
    parent: StatePath,
    kind: String,
    _marker: PhantomData<fn() -> (C, I)>,
}

impl<C, I> Clone for MapNodeCollection<C, I> {
    fn clone(&self) -> Self {
        Self {
            connection: self.connection.clone(),
            parent: self.parent.clone(),
            kind: self.kind.clone(),
            _marker: PhantomData,
        }
    }
}

impl<C: Projection, I: ComponentId> MapNodeCollection<C, I> {
    /// Registers `parent.kind(*)` so the server sends every child.
    pub fn new(connection: &Connection, parent: StatePath, kind: &str) -> Self {
        connection.register([parent.adding(PathComponent::Wildcard(kind.to_owned()))]);
        Self {
            connection: connection.clone(),
            parent,
            kind: kind.to_owned(),
            _marker: PhantomData,
        }
    }

    pub fn wildcard_path(&self) -> StatePath {
        self.parent.adding(PathComponent::Wildcard(self.kind.clone()))
    }

    /// Distinct child ids present in the store, sorted. Several leaves under
    /// one child count once.
    pub fn keys(&self) -> Vec<I> {
        let mut ids = BTreeSet::new();
        for (path, _) in self.connection.store().scan_prefix(&self.parent) {
            if let Some(id) = child_id::<I>(&path, &self.parent, &self.kind) {
                ids.insert(id);
            }
        }
        ids.into_iter().collect()
    }

    pub fn get(&self, id: &I) -> C {
        C::project(
            &self.connection,
            self.parent.adding(id.to_component(&self.kind)),
        )
    }

    pub fn all_values(&self) -> Vec<C> {
        self.keys().iter().map(|id| self.get(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.keys().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys().is_empty()
    }
}

/// All `kind(index)` scalar leaves directly under a parent, e.g. a game's
/// `PenaltyCode(<code>)` descriptions.
pub struct MapValueCollection<V, I> {
    connection: Connection,
    parent: StatePath,
    kind: String,
    _marker: PhantomData<fn() -> (V, I)>,
}

impl<V, I> Clone for MapValueCollection<V, I> {
    fn clone(&self) -> Self {
        Self {
            connection: self.connection.clone(),
            parent: self.parent.clone(),
            kind: self.kind.clone(),
            _marker: PhantomData,
        }
    }
}

impl<V: FromJson, I: ComponentId> MapValueCollection<V, I> {
    pub fn new(connection: &Connection, parent: StatePath, kind: &str) -> Self {
        connection.register([parent.adding(PathComponent::Wildcard(kind.to_owned()))]);
        Self {
            connection: connection.clone(),
            parent,
            kind: kind.to_owned(),
            _marker: PhantomData,
        }
    }

    pub fn wildcard_path(&self) -> StatePath {
        self.parent.adding(PathComponent::Wildcard(self.kind.clone()))
    }

    /// Every decodable value keyed by index. Undecodable values are skipped.
    pub fn values(&self) -> BTreeMap<I, V> {
        self.connection
            .store()
            .scan_prefix(&self.parent)
            .into_iter()
            .filter(|(path, _)| path.len() == self.parent.len() + 1)
            .filter_map(|(path, value)| {
                let id = child_id::<I>(&path, &self.parent, &self.kind)?;
                Some((id, V::from_json(&value)?))
            })
            .collect()
    }

    pub fn keys(&self) -> Vec<I> {
        self.values().into_keys().collect()
    }

    pub fn get(&self, id: &I) -> Option<V> {
        self.leaf(id).read()
    }

    pub fn leaf(&self, id: &I) -> Leaf<V> {
        Leaf::new(
            &self.connection,
            self.parent.adding(id.to_component(&self.kind)),
        )
    }
}

/// A generic interior node of the tree. Hand-written schema types wrap one.
#[derive(Clone)]
pub struct Node {
    connection: Connection,
    path: StatePath,
}

impl Node {
    pub fn new(connection: &Connection, path: StatePath) -> Self {
        Self {
            connection: connection.clone(),
            path,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn path(&self) -> &StatePath {
        &self.path
    }

    /// The id parameter of this node's last component, if it has one.
    pub fn id<I: ComponentId>(&self) -> Option<I> {
        self.path.last().and_then(I::from_component)
    }

    pub fn leaf<T: FromJson>(&self, name: &str) -> Leaf<T> {
        Leaf::new(&self.connection, self.path.child(name))
    }

    pub fn immutable_leaf<T: FromJson>(&self, name: &str) -> ImmutableLeaf<T> {
        ImmutableLeaf::new(&self.connection, self.path.child(name))
    }

    pub fn child<C: Projection>(&self, component: PathComponent) -> C {
        C::project(&self.connection, self.path.adding(component))
    }

    pub fn nodes<C: Projection, I: ComponentId>(&self, kind: &str) -> MapNodeCollection<C, I> {
        MapNodeCollection::new(&self.connection, self.path.clone(), kind)
    }

    pub fn values<V: FromJson, I: ComponentId>(&self, kind: &str) -> MapValueCollection<V, I> {
        MapValueCollection::new(&self.connection, self.path.clone(), kind)
    }

    /// Trigger a server-side command such as `StartJam` under this node.
    pub fn command(&self, name: &str) {
        self.connection
            .set(self.path.child(name), JsonValue::Bool(true), ChangeKind::Replace);
    }
}

impl Projection for Node {
    fn project(connection: &Connection, path: StatePath) -> Self {
        Self::new(connection, path)
    }

    fn state_path(&self) -> &StatePath {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> StatePath {
        StatePath::parse(s)
    }

    fn offline_with(entries: &[(&str, JsonValue)]) -> Connection {
        let connection = Connection::offline();
        connection.store().apply(
            entries
                .iter()
                .map(|(key, value)| (p(key), value.clone())),
        );
        connection
    }

    #[test]
    fn leaf_decodes_or_yields_none() {
        let connection = offline_with(&[
            ("Team(1).Score", JsonValue::Int(5)),
            ("Team(1).Name", JsonValue::from("Black")),
        ]);
        let score: Leaf<i64> = Leaf::new(&connection, p("Team(1).Score"));
        assert_eq!(score.read(), Some(5));
        let wrong: Leaf<i64> = Leaf::new(&connection, p("Team(1).Name"));
        assert_eq!(wrong.read(), None);
        let missing: ImmutableLeaf<String> = ImmutableLeaf::new(&connection, p("Team(2).Name"));
        assert_eq!(missing.read(), None);
    }

    #[test]
    fn empty_store_gives_empty_collections() {
        let connection = Connection::offline();
        let skaters: MapNodeCollection<Node, Uuid> =
            MapNodeCollection::new(&connection, p("Team(1)"), "Skater");
        assert!(skaters.is_empty());
        let codes: MapValueCollection<String, String> =
            MapValueCollection::new(&connection, p("Game(g1)"), "PenaltyCode");
        assert!(codes.values().is_empty());
    }

    #[test]
    fn node_collection_dedups_by_child() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let a_name = format!("Team(1).Skater({a}).Name");
        let a_role = format!("Team(1).Skater({a}).Role");
        let b_name = format!("Team(1).Skater({b}).Name");
        let other = format!("Team(2).Skater({}).Name", Uuid::new_v4());
        let connection = offline_with(&[
            (a_name.as_str(), JsonValue::from("Ann")),
            (a_role.as_str(), JsonValue::from("Jammer")),
            (b_name.as_str(), JsonValue::from("Bo")),
            (other.as_str(), JsonValue::from("Cy")),
            ("Team(1).Name", JsonValue::from("Black")),
        ]);
        let skaters: MapNodeCollection<Node, Uuid> =
            MapNodeCollection::new(&connection, p("Team(1)"), "Skater");

        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(skaters.keys(), expected);

        let names: BTreeSet<String> = skaters
            .all_values()
            .iter()
            .filter_map(|node| node.leaf::<String>("Name").read())
            .collect();
        let expected_names: BTreeSet<String> = ["Ann", "Bo"].iter().map(|s| s.to_string()).collect();
        assert_eq!(names, expected_names);
    }

    #[test]
    fn node_collection_ignores_other_id_kinds() {
        let connection = offline_with(&[
            ("Game(g1).Period(1).Jam(1).Number", JsonValue::Int(1)),
            ("Game(g1).Period(2).Jam(1).Number", JsonValue::Int(1)),
            ("Game(g1).Period(*)", JsonValue::Null),
        ]);
        let periods: MapNodeCollection<Node, i64> =
            MapNodeCollection::new(&connection, p("Game(g1)"), "Period");
        assert_eq!(periods.keys(), vec![1, 2]);
        let by_name: MapNodeCollection<Node, String> =
            MapNodeCollection::new(&connection, p("Game(g1)"), "Period");
        assert!(by_name.keys().is_empty());
    }

    #[test]
    fn value_collection_maps_direct_leaves() {
        let connection = offline_with(&[
            ("Game(g1).PenaltyCode(A)", JsonValue::from("Illegal Contact")),
            ("Game(g1).PenaltyCode(B)", JsonValue::from("Back Block")),
            ("Game(g1).PenaltyCode(C)", JsonValue::Int(3)),
            ("Game(g1).PenaltyCode(D).Extra", JsonValue::from("nested")),
        ]);
        let codes: MapValueCollection<String, String> =
            MapValueCollection::new(&connection, p("Game(g1)"), "PenaltyCode");
        let values = codes.values();
        assert_eq!(values.len(), 2);
        assert_eq!(values["A"], "Illegal Contact");
        assert_eq!(codes.get(&"B".to_string()).as_deref(), Some("Back Block"));
        assert_eq!(codes.keys(), vec!["A".to_string(), "B".to_string()]);
    }

    #[tokio::test]
    async fn collections_register_their_wildcard() {
        let connection = Connection::offline();
        let _skaters: MapNodeCollection<Node, Uuid> =
            MapNodeCollection::new(&connection, p("Team(1)"), "Skater");
        let lookup = connection.get_or_subscribe(&p("Team(1).Skater(*)"));
        // Offline: still queued, not yet registered.
        assert!(lookup.pending);
    }

    #[test]
    fn node_builds_child_paths() {
        let connection = Connection::offline();
        let game = Node::new(&connection, p("ScoreBoard.Game(g1)"));
        let team: Node = game.child(PathComponent::Indexed("Team".into(), 1));
        assert_eq!(team.path().to_string(), "ScoreBoard.Game(g1).Team(1)");
        assert_eq!(team.id::<i64>(), Some(1));
        assert_eq!(
            team.leaf::<i64>("Score").path().to_string(),
            "ScoreBoard.Game(g1).Team(1).Score"
        );
    }

    #[test]
    fn writes_are_queued_not_mirrored() {
        let connection = Connection::offline();
        let score: Leaf<i64> = Leaf::new(&connection, p("Team(1).Score"));
        score.write(&7, ChangeKind::Replace);
        assert_eq!(score.read(), None);
        assert_eq!(connection.pending_write_count(), 1);

        Node::new(&connection, p("Game(g1)")).command("StartJam");
        assert_eq!(connection.pending_write_count(), 2);
    }
}
