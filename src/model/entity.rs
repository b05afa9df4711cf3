use std::collections::BTreeSet;

use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};

/// A ticket as mirrored on disk and on the remote tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Stable remote identifier (e.g. `ENG-42`). Never changes once assigned.
    pub id: String,
    pub title: String,
    #[serde(rename = "status")]
    pub status_name: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    /// Id of the parent entity for sub-issues.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default)]
    pub url: String,
    pub created_at: DateTime<FixedOffset>,
    pub updated_at: DateTime<FixedOffset>,
    #[serde(skip)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<Comment>,
}

impl Entity {
    pub fn with_offset(mut self, offset: FixedOffset) -> Self {
        self.created_at = self.created_at.with_timezone(&offset);
        self.updated_at = self.updated_at.with_timezone(&offset);
        for comment in &mut self.comments {
            comment.created_at = comment.created_at.with_timezone(&offset);
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<FixedOffset>,
}

/// Remote priority scale: 0 means unset, 1 is the most urgent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Priority {
    #[default]
    None,
    Urgent,
    High,
    Medium,
    Low,
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> u8 {
        match p {
            Priority::None => 0,
            Priority::Urgent => 1,
            Priority::High => 2,
            Priority::Medium => 3,
            Priority::Low => 4,
        }
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Priority::None),
            1 => Ok(Priority::Urgent),
            2 => Ok(Priority::High),
            3 => Ok(Priority::Medium),
            4 => Ok(Priority::Low),
            other => Err(format!("priority must be 0-4, got {other}")),
        }
    }
}
