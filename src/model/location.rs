use std::path::{Path, PathBuf};

use crate::model::entity::Entity;

pub const EXTENSION: &str = "md";
const MAX_SLUG_LEN: usize = 40;

pub fn slugify(title: &str) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let trimmed: String = slug.trim_matches('-').chars().take(MAX_SLUG_LEN).collect();
    let trimmed = trimmed.trim_end_matches('-').to_string();
    if trimmed.is_empty() {
        "untitled".into()
    } else {
        trimmed
    }
}

/// Where an entity's file lives: `<root>/<folder>/<filename>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLocation {
    pub folder: String,
    pub filename: String,
}

impl FileLocation {
    pub fn for_entity(entity: &Entity, folder: &str) -> Self {
        Self {
            folder: folder.to_string(),
            filename: filename(&entity.id, entity.parent.as_deref(), &entity.title),
        }
    }

    pub fn path(&self, root: &Path) -> PathBuf {
        root.join(&self.folder).join(&self.filename)
    }
}

/// `<id>_<slug>.md`, or `<parent>.<id>_<slug>.md` for child entities.
pub fn filename(id: &str, parent: Option<&str>, title: &str) -> String {
    match parent {
        Some(parent) => format!("{parent}.{id}_{}.{EXTENSION}", slugify(title)),
        None => format!("{id}_{}.{EXTENSION}", slugify(title)),
    }
}

/// Identity recovered from a filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub id: String,
    pub parent: Option<String>,
}

fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        && id.chars().any(|c| c.is_ascii_digit())
        && !id.starts_with('-')
}

pub fn parse_filename(name: &str) -> Option<ParsedName> {
    let stem = name.strip_suffix(&format!(".{EXTENSION}"))?;
    let head = match stem.split_once('_') {
        Some((head, _slug)) => head,
        None => stem,
    };
    let (parent, id) = match head.split_once('.') {
        Some((parent, id)) => (Some(parent), id),
        None => (None, head),
    };
    if !valid_id(id) || parent.is_some_and(|p| !valid_id(p)) {
        return None;
    }
    Some(ParsedName {
        id: id.to_string(),
        parent: parent.map(String::from),
    })
}

/// Files that live in the tree but are never entities.
pub fn is_ignored_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    name.starts_with('.') || lower == "readme.md" || lower == "index.md"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Add login validation"), "add-login-validation");
        assert_eq!(slugify("Fix bug #42!"), "fix-bug--42");
        assert_eq!(slugify("???"), "untitled");
        assert_eq!(
            slugify("A very long title that keeps going well past the limit"),
            "a-very-long-title-that-keeps-going-well"
        );
    }

    #[test]
    fn filename_encodes_identity() {
        assert_eq!(filename("ENG-42", None, "Fix login"), "ENG-42_fix-login.md");
        assert_eq!(
            filename("ENG-43", Some("ENG-42"), "Sub task"),
            "ENG-42.ENG-43_sub-task.md"
        );
    }

    #[test]
    fn parse_recovers_id_and_parent() {
        assert_eq!(
            parse_filename("ENG-42_fix-login.md"),
            Some(ParsedName {
                id: "ENG-42".into(),
                parent: None
            })
        );
        assert_eq!(
            parse_filename("ENG-42.ENG-43_sub-task.md"),
            Some(ParsedName {
                id: "ENG-43".into(),
                parent: Some("ENG-42".into())
            })
        );
        assert_eq!(parse_filename("ENG-7.md").unwrap().id, "ENG-7");
    }

    #[test]
    fn parse_rejects_malformed_names() {
        assert_eq!(parse_filename("notes.txt"), None);
        assert_eq!(parse_filename("scratch.md"), None);
        assert_eq!(parse_filename("_nothing.md"), None);
        assert_eq!(parse_filename("bad id_slug.md"), None);
        assert_eq!(parse_filename(".ENG-1_x.md"), None);
    }

    #[test]
    fn ignores_hidden_and_index_files() {
        assert!(is_ignored_name("README.md"));
        assert!(is_ignored_name("index.md"));
        assert!(is_ignored_name(".ENG-1_x.md.tmp"));
        assert!(!is_ignored_name("ENG-1_x.md"));
    }
}
