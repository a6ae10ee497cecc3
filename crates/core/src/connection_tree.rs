use serde::Serialize;

use crate::profiles::ConnectionProfile;

const DEFAULT_SCHEMA: &str = "public";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DatabaseNode {
    pub name: String,
    pub collections: Vec<String>,
}

impl DatabaseNode {
    #[must_use]
    pub fn new(name: impl Into<String>, collections: Vec<String>) -> Self {
        Self {
            name: name.into(),
            collections,
        }
    }
}

/// A saved profile plus the runtime shape discovered for it. `expanded` and
/// `databases` are never persisted.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ConnectionNode {
    pub profile: ConnectionProfile,
    pub expanded: bool,
    pub databases: Vec<DatabaseNode>,
}

impl ConnectionNode {
    #[must_use]
    pub fn new(profile: ConnectionProfile) -> Self {
        Self {
            profile,
            expanded: false,
            databases: Vec::new(),
        }
    }

    #[must_use]
    pub fn database(&self, name: &str) -> Option<&DatabaseNode> {
        self.databases.iter().find(|database| database.name == name)
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ConnectionTree {
    nodes: Vec<ConnectionNode>,
    active: Option<String>,
}

impl ConnectionTree {
    #[must_use]
    pub fn from_profiles(profiles: &[ConnectionProfile]) -> Self {
        Self {
            nodes: profiles.iter().cloned().map(ConnectionNode::new).collect(),
            active: None,
        }
    }

    #[must_use]
    pub fn nodes(&self) -> &[ConnectionNode] {
        &self.nodes
    }

    #[must_use]
    pub fn node(&self, id: &str) -> Option<&ConnectionNode> {
        self.nodes.iter().find(|node| node.profile.id == id)
    }

    fn node_mut(&mut self, id: &str) -> Option<&mut ConnectionNode> {
        self.nodes.iter_mut().find(|node| node.profile.id == id)
    }

    #[must_use]
    pub fn active_id(&self) -> Option<&str> {
        self.active.as_deref()
    }

    #[must_use]
    pub fn active_node(&self) -> Option<&ConnectionNode> {
        self.active_id().and_then(|id| self.node(id))
    }

    #[must_use]
    pub fn is_active(&self, id: &str) -> bool {
        self.active_id() == Some(id)
    }

    #[must_use]
    pub fn profiles(&self) -> Vec<ConnectionProfile> {
        self.nodes.iter().map(|node| node.profile.clone()).collect()
    }

    /// A copy safe to render: every stored password is blanked.
    #[must_use]
    pub fn without_secrets(&self) -> Self {
        let mut tree = self.clone();
        for node in &mut tree.nodes {
            node.profile.password.clear();
        }
        tree
    }

    pub fn push(&mut self, profile: ConnectionProfile) {
        self.nodes.push(ConnectionNode::new(profile));
    }

    pub fn remove(&mut self, id: &str) -> Option<ConnectionNode> {
        let index = self.nodes.iter().position(|node| node.profile.id == id)?;
        if self.is_active(id) {
            self.active = None;
        }
        Some(self.nodes.remove(index))
    }

    /// Marks `id` as the node bearing the live session: it is expanded and
    /// every other node collapses.
    pub fn activate(&mut self, id: &str) -> bool {
        if self.node(id).is_none() {
            return false;
        }
        for node in &mut self.nodes {
            node.expanded = node.profile.id == id;
        }
        self.active = Some(id.to_string());
        true
    }

    pub fn deactivate(&mut self) {
        self.active = None;
    }

    /// Expansion only applies to the active node; anything else is a no-op.
    pub fn toggle_expand(&mut self, id: &str) -> bool {
        if !self.is_active(id) {
            return false;
        }
        match self.node_mut(id) {
            Some(node) => {
                node.expanded = !node.expanded;
                true
            }
            None => false,
        }
    }

    pub fn replace_databases(&mut self, id: &str, databases: Vec<DatabaseNode>) -> bool {
        match self.node_mut(id) {
            Some(node) => {
                node.databases = databases;
                true
            }
            None => false,
        }
    }

    /// Replaces one database's collection list in place; sibling databases
    /// under the same connection are left untouched.
    pub fn update_collections_for_database(
        &mut self,
        id: &str,
        database_name: &str,
        collections: Vec<String>,
    ) -> bool {
        let Some(node) = self.node_mut(id) else {
            return false;
        };
        match node
            .databases
            .iter_mut()
            .find(|database| database.name == database_name)
        {
            Some(database) => {
                database.collections = collections;
                true
            }
            None => false,
        }
    }

    pub fn set_default_database(&mut self, id: &str, database_name: &str) -> bool {
        match self.node_mut(id) {
            Some(node) => {
                node.profile.database = Some(database_name.to_string());
                true
            }
            None => false,
        }
    }

    /// Applies the result of a completed database switch in one step: the
    /// remembered database, that database's collections and the expansion.
    pub fn apply_switch(&mut self, id: &str, database_name: &str, collections: Vec<String>) -> bool {
        let Some(node) = self.node_mut(id) else {
            return false;
        };
        node.profile.database = Some(database_name.to_string());
        node.expanded = true;
        match node
            .databases
            .iter_mut()
            .find(|database| database.name == database_name)
        {
            Some(database) => database.collections = collections,
            None => node
                .databases
                .push(DatabaseNode::new(database_name, collections)),
        }
        true
    }
}

/// The `(database, collection)` pair targeted by the query editor.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SelectionCursor {
    database: Option<String>,
    collection: Option<String>,
}

impl SelectionCursor {
    /// A collection is only kept alongside a non-empty database; a blank
    /// database clears the whole cursor.
    pub fn select(&mut self, database: &str, collection: Option<&str>) {
        if database.trim().is_empty() {
            self.clear();
            return;
        }
        self.database = Some(database.to_string());
        self.collection = collection
            .filter(|name| !name.trim().is_empty())
            .map(str::to_string);
    }

    pub fn clear(&mut self) {
        self.database = None;
        self.collection = None;
    }

    #[must_use]
    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    #[must_use]
    pub fn collection(&self) -> Option<&str> {
        self.collection.as_deref()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.database.is_none()
    }

    /// `database.table`, with any schema prefix dropped from the table.
    #[must_use]
    pub fn label(&self) -> Option<String> {
        let database = self.database()?;
        let collection = self.collection()?;
        Some(format!(
            "{database}.{}",
            CollectionName::parse(collection).table
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionName<'a> {
    pub schema: Option<&'a str>,
    pub table: &'a str,
}

impl<'a> CollectionName<'a> {
    #[must_use]
    pub fn parse(qualified: &'a str) -> Self {
        match qualified.split_once('.') {
            Some((schema, table)) => Self {
                schema: Some(schema),
                table,
            },
            None => Self {
                schema: None,
                table: qualified,
            },
        }
    }

    #[must_use]
    pub fn display_label(&self) -> String {
        match self.schema {
            Some(schema) if schema != DEFAULT_SCHEMA => format!("{} ({schema})", self.table),
            _ => self.table.to_string(),
        }
    }
}
