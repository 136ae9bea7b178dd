use serde::{Deserialize, Serialize};
use std::fmt;

const COMMAND_COLLECTION: &str = "$cmd";
const SPECIAL_COMMAND_MARKER: &str = ".$cmd.sys.";
const SYSTEM_INDEXES: &str = "system.indexes";

/// Fully-qualified collection reference, `<database>.<collection>`.
///
/// The collection part may itself contain dots (`app.system.indexes`,
/// `admin.$cmd.sys.inprog`); only the first dot separates the database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Namespace(String);

impl Namespace {
    pub fn new(ns: impl Into<String>) -> Self {
        Namespace(ns.into())
    }

    /// Builds `<db>.<coll>`.
    pub fn from_parts(db: &str, coll: &str) -> Self {
        Namespace(format!("{}.{}", db, coll))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn db(&self) -> &str {
        match self.0.find('.') {
            Some(i) => &self.0[..i],
            None => &self.0,
        }
    }

    pub fn coll(&self) -> &str {
        match self.0.find('.') {
            Some(i) => &self.0[i + 1..],
            None => "",
        }
    }

    /// `<db>.$cmd`
    pub fn is_command(&self) -> bool {
        self.coll() == COMMAND_COLLECTION
    }

    /// `<db>.$cmd.sys.<name>`
    pub fn is_special_command(&self) -> bool {
        self.special_command_name().is_some()
    }

    /// Name of a reserved diagnostic command (`inprog`, `killop`, ...).
    pub fn special_command_name(&self) -> Option<&str> {
        self.0
            .find(SPECIAL_COMMAND_MARKER)
            .map(|i| &self.0[i + SPECIAL_COMMAND_MARKER.len()..])
    }

    /// The command namespace of this namespace's database.
    pub fn command_ns(&self) -> Namespace {
        Namespace::from_parts(self.db(), COMMAND_COLLECTION)
    }

    /// The reserved "list indexes" pseudo-collection.
    pub fn is_system_indexes(&self) -> bool {
        self.coll() == SYSTEM_INDEXES
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Namespace {
    fn from(ns: &str) -> Self {
        Namespace::new(ns)
    }
}

impl From<String> for Namespace {
    fn from(ns: String) -> Self {
        Namespace(ns)
    }
}
