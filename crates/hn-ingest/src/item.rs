//! Items as returned by the remote API
//!
//! The API returns a loosely shaped JSON object whose fields depend on the
//! item type. [`Item`] makes every optional field explicit; fields the archive
//! does not know about are ignored on decode.

use chrono::{DateTime, Datelike};
use serde::{Deserialize, Deserializer, Serialize};

/// One record from the remote source, keyed by its numeric id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: i64,

    /// Item type string (story, comment, job, poll, pollopt)
    #[serde(rename = "type")]
    pub kind: Option<String>,

    /// Author username
    pub by: Option<String>,

    /// Creation time, unix seconds
    pub time: Option<i64>,

    pub text: Option<String>,
    pub url: Option<String>,
    pub title: Option<String>,
    pub score: Option<i32>,
    pub descendants: Option<i32>,
    pub parent: Option<i64>,
    pub kids: Option<Vec<i64>>,

    #[serde(default, deserialize_with = "lenient_bool")]
    pub dead: bool,

    #[serde(default, deserialize_with = "lenient_bool")]
    pub deleted: bool,

    /// Owning poll (pollopt only)
    pub poll: Option<i64>,

    /// Poll options (poll only)
    pub parts: Option<Vec<i64>>,
}

impl Item {
    pub fn is_tombstone(&self) -> bool {
        self.dead || self.deleted
    }

    /// Shape the item the way it is persisted
    ///
    /// Tombstones keep only id, type, author, time, parent and the two flags.
    /// Everything else is dropped no matter what the payload carried.
    pub fn into_archived(self) -> Item {
        if !self.is_tombstone() {
            return self;
        }

        Item {
            id: self.id,
            kind: self.kind,
            by: self.by,
            time: self.time,
            parent: self.parent,
            dead: self.dead,
            deleted: self.deleted,
            ..Item::default()
        }
    }

    /// `(year, month)` of the creation time in UTC
    pub fn partition_key(&self) -> Option<(i32, u32)> {
        let dt = DateTime::from_timestamp(self.time?, 0)?;
        Some((dt.year(), dt.month()))
    }

    pub fn item_kind(&self) -> Option<ItemKind> {
        self.kind.as_deref().and_then(|k| k.parse().ok())
    }
}

/// Known item types
///
/// Informational only: the archive stores whatever type string the API sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    Story,
    Comment,
    Job,
    Poll,
    PollOpt,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Story => "story",
            ItemKind::Comment => "comment",
            ItemKind::Job => "job",
            ItemKind::Poll => "poll",
            ItemKind::PollOpt => "pollopt",
        }
    }
}

impl std::str::FromStr for ItemKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "story" => Ok(ItemKind::Story),
            "comment" => Ok(ItemKind::Comment),
            "job" => Ok(ItemKind::Job),
            "poll" => Ok(ItemKind::Poll),
            "pollopt" => Ok(ItemKind::PollOpt),
            other => Err(format!("unknown item type: {other}")),
        }
    }
}

impl std::fmt::Display for ItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accept `true`/`false`, integers (non-zero is true) and `null` for flags
fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }

    Ok(match Option::<Flag>::deserialize(deserializer)? {
        Some(Flag::Bool(b)) => b,
        Some(Flag::Int(n)) => n != 0,
        None => false,
    })
}
