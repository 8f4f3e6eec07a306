//! Board and card records, identities, patches and local mutations.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Reserved prefix marking a client-minted, not yet confirmed identity.
pub const TEMP_ID_PREFIX: &str = "tmp-";

/// Opaque board or card identity.
///
/// Identities minted locally before the remote store confirmed the entity
/// carry [`TEMP_ID_PREFIX`]; everything else is canonical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a fresh provisional identity.
    pub fn temporary() -> Self {
        Self(format!("{}{}", TEMP_ID_PREFIX, Uuid::new_v4().simple()))
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Board,
    Card,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Board => f.write_str("board"),
            EntityKind::Card => f.write_str("card"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Board {
    pub id: EntityId,
    pub owner_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Derived from the card set on every read. Whatever a remote snapshot
    /// carries here is ignored.
    #[serde(default)]
    pub card_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub id: EntityId,
    pub board_id: EntityId,
    pub column_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    /// Ordering key within the column.
    pub position: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A board or card record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Entity {
    Board(Board),
    Card(Card),
}

impl Entity {
    pub fn id(&self) -> &EntityId {
        match self {
            Entity::Board(b) => &b.id,
            Entity::Card(c) => &c.id,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Board(_) => EntityKind::Board,
            Entity::Card(_) => EntityKind::Card,
        }
    }

    /// The containing board of a card. Boards have no parent.
    pub fn parent(&self) -> Option<&EntityId> {
        match self {
            Entity::Board(_) => None,
            Entity::Card(c) => Some(&c.board_id),
        }
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Entity::Board(_) => None,
            Entity::Card(c) => Some(c.updated_at),
        }
    }

    /// Rewrite `from` to `to` wherever this record refers to it.
    pub fn rewrite_identity(&mut self, from: &EntityId, to: &EntityId) {
        match self {
            Entity::Board(b) => {
                if &b.id == from {
                    b.id = to.clone();
                }
            }
            Entity::Card(c) => {
                if &c.id == from {
                    c.id = to.clone();
                }
                if &c.board_id == from {
                    c.board_id = to.clone();
                }
            }
        }
    }
}

/// Distinguishes "field absent" (`None`) from "field set to null"
/// (`Some(None)`) when deserializing patches.
fn present<'de, T, D>(d: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    T::deserialize(d).map(Some)
}

/// Changed board fields only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoardPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub description: Option<Option<String>>,
}

impl BoardPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none()
    }

    pub fn apply(&self, board: &mut Board) {
        if let Some(name) = &self.name {
            board.name = name.clone();
        }
        if let Some(description) = &self.description {
            board.description = description.clone();
        }
    }
}

/// Changed card fields only. Cards never move between boards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CardPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub description: Option<Option<String>>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub priority: Option<Option<Priority>>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub due_date: Option<Option<NaiveDate>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<f64>,
}

impl CardPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.priority.is_none()
            && self.due_date.is_none()
            && self.column_id.is_none()
            && self.position.is_none()
    }

    /// Assign the changed fields. Does not touch `updated_at`; the writer
    /// decides which clock stamps the change.
    pub fn apply(&self, card: &mut Card) {
        if let Some(title) = &self.title {
            card.title = title.clone();
        }
        if let Some(description) = &self.description {
            card.description = description.clone();
        }
        if let Some(priority) = self.priority {
            card.priority = priority;
        }
        if let Some(due_date) = self.due_date {
            card.due_date = due_date;
        }
        if let Some(column_id) = &self.column_id {
            card.column_id = column_id.clone();
        }
        if let Some(position) = self.position {
            card.position = position;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Changes {
    Board(BoardPatch),
    Card(CardPatch),
}

impl Changes {
    /// Apply to a record of the matching kind; mismatched kinds are ignored.
    pub fn apply_to(&self, entity: &mut Entity, now: DateTime<Utc>) {
        match (self, entity) {
            (Changes::Board(patch), Entity::Board(board)) => patch.apply(board),
            (Changes::Card(patch), Entity::Card(card)) => {
                patch.apply(card);
                card.updated_at = now;
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBoard {
    pub owner_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCard {
    pub board_id: EntityId,
    pub column_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    /// Appended after the last card of the column when absent.
    #[serde(default)]
    pub position: Option<f64>,
}

impl NewCard {
    pub fn new(board_id: EntityId, column_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            board_id,
            column_id: column_id.into(),
            title: title.into(),
            description: None,
            priority: None,
            due_date: None,
            position: None,
        }
    }
}

/// A card proposed by the suggestion service, waiting for confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardSuggestion {
    pub card_text: String,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
}

impl CardSuggestion {
    pub fn into_new_card(self, board_id: EntityId, column_id: impl Into<String>) -> NewCard {
        NewCard {
            board_id,
            column_id: column_id.into(),
            title: self.card_text,
            description: self.project.map(|p| format!("Project: {}", p)),
            priority: self.priority,
            due_date: self.due_date,
            position: None,
        }
    }
}

/// A user-initiated change to the local view.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    CreateBoard(NewBoard),
    UpdateBoard { id: EntityId, patch: BoardPatch },
    DeleteBoard { id: EntityId },
    CreateCard(NewCard),
    UpdateCard { id: EntityId, patch: CardPatch },
    DeleteCard { id: EntityId },
}

impl Mutation {
    pub fn kind(&self) -> EntityKind {
        match self {
            Mutation::CreateBoard(_) | Mutation::UpdateBoard { .. } | Mutation::DeleteBoard { .. } => {
                EntityKind::Board
            }
            Mutation::CreateCard(_) | Mutation::UpdateCard { .. } | Mutation::DeleteCard { .. } => {
                EntityKind::Card
            }
        }
    }

    /// The identity this mutation targets, if it exists yet.
    pub fn target(&self) -> Option<&EntityId> {
        match self {
            Mutation::CreateBoard(_) | Mutation::CreateCard(_) => None,
            Mutation::UpdateBoard { id, .. }
            | Mutation::DeleteBoard { id }
            | Mutation::UpdateCard { id, .. }
            | Mutation::DeleteCard { id } => Some(id),
        }
    }
}
