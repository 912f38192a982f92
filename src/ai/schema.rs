//! Closed schema for model responses.
//!
//! The model's JSON is untrusted: every operation object is checked against
//! these types individually so one bad entry does not discard the rest.

use serde::Deserialize;

pub const OPERATION_KINDS: &[&str] = &[
    "move",
    "copy",
    "rename",
    "delete",
    "create_directory",
    "create_file",
];

pub const PLAN_FIELDS: &[&str] = &["operations", "ambiguous", "alternatives", "notes"];

/// A single path or a list of paths
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(path) => vec![path],
            OneOrMany::Many(paths) => paths,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
pub enum WireOperation {
    Move {
        #[serde(alias = "source")]
        sources: OneOrMany,
        destination: String,
        #[serde(default)]
        overwrite: bool,
    },
    Copy {
        #[serde(alias = "source")]
        sources: OneOrMany,
        destination: String,
        #[serde(default)]
        overwrite: bool,
    },
    Rename {
        source: String,
        new_name: String,
        #[serde(default)]
        overwrite: bool,
    },
    Delete {
        #[serde(alias = "source")]
        sources: OneOrMany,
        #[serde(default)]
        recursive: bool,
        #[serde(default)]
        permanent: bool,
    },
    CreateDirectory {
        path: String,
    },
    CreateFile {
        path: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_single_source_alias() {
        let op: WireOperation =
            serde_json::from_value(json!({"op": "move", "source": "a.txt", "destination": "b/"}))
                .unwrap();
        assert_eq!(
            op,
            WireOperation::Move {
                sources: OneOrMany::One("a.txt".to_string()),
                destination: "b/".to_string(),
                overwrite: false,
            }
        );
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let result: Result<WireOperation, _> =
            serde_json::from_value(json!({"op": "create_file", "path": "x", "mode": "0777"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_field_is_rejected() {
        let result: Result<WireOperation, _> =
            serde_json::from_value(json!({"op": "rename", "source": "a.txt"}));
        let err = result.unwrap_err().to_string();
        assert!(err.contains("missing field"), "{}", err);
    }
}
