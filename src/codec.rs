use anyhow::{Context, Result};
use chrono::FixedOffset;

use crate::model::entity::Entity;

const FENCE: &str = "+++";

/// Converts between an [`Entity`] and the bytes of its file.
pub trait TicketFileCodec: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<Entity>;
    fn encode(&self, entity: &Entity) -> Result<Vec<u8>>;
}

/// TOML frontmatter between `+++` fences, followed by the free-text body.
/// Timestamps are rendered in one fixed offset so output is deterministic.
#[derive(Debug, Clone)]
pub struct FrontmatterCodec {
    offset: FixedOffset,
}

impl FrontmatterCodec {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    #[cfg(test)]
    pub fn utc() -> Self {
        Self::new(chrono::Offset::fix(&chrono::Utc))
    }
}

fn split_frontmatter(rest: &str) -> Option<(&str, &str)> {
    let mut consumed = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == FENCE {
            return Some((&rest[..consumed], &rest[consumed + line.len()..]));
        }
        consumed += line.len();
    }
    None
}

impl TicketFileCodec for FrontmatterCodec {
    fn decode(&self, bytes: &[u8]) -> Result<Entity> {
        let text = std::str::from_utf8(bytes).context("file is not valid UTF-8")?;
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let first = text.lines().next().unwrap_or_default();
        anyhow::ensure!(first.trim_end() == FENCE, "missing {FENCE} frontmatter fence");
        let rest = &text[first.len()..];
        let rest = rest
            .strip_prefix("\r\n")
            .or_else(|| rest.strip_prefix('\n'))
            .unwrap_or(rest);
        let (front, body) =
            split_frontmatter(rest).context("frontmatter is missing its closing fence")?;

        let mut entity: Entity = toml::from_str(front).context("invalid frontmatter")?;
        entity.body = body.trim_start_matches(['\r', '\n']).trim_end().to_string();
        Ok(entity.with_offset(self.offset))
    }

    fn encode(&self, entity: &Entity) -> Result<Vec<u8>> {
        let entity = entity.clone().with_offset(self.offset);
        let front = toml::to_string(&entity).context("failed to render frontmatter")?;

        let mut out = String::with_capacity(front.len() + entity.body.len() + 16);
        out.push_str(FENCE);
        out.push('\n');
        out.push_str(&front);
        if !front.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(FENCE);
        out.push('\n');
        let body = entity.body.trim_end();
        if !body.is_empty() {
            out.push('\n');
            out.push_str(body);
            out.push('\n');
        }
        Ok(out.into_bytes())
    }
}
