use super::parser::DirectoryListing;
use crate::utils::{format_millis, format_size};

/// System prompt for translating a request into a file operation plan
pub const PLAN_SYSTEM_PROMPT: &str = r#"You are the planning component of a file manager. Translate the user's request into a list of file operations. You never run anything yourself; the application validates and executes your plan.

OUTPUT: Respond with ONLY valid JSON in this exact format:
{
  "operations": [
    {"op": "create_directory", "path": "archive"},
    {"op": "move", "sources": ["a.txt", "b.txt"], "destination": "archive/", "overwrite": false}
  ],
  "ambiguous": false,
  "alternatives": [],
  "notes": "short explanation for the user"
}

OPERATIONS (no other fields are allowed):
- {"op": "move", "sources": [...], "destination": "...", "overwrite": false}
- {"op": "copy", "sources": [...], "destination": "...", "overwrite": false}
- {"op": "rename", "source": "...", "new_name": "...", "overwrite": false}
- {"op": "delete", "sources": [...], "recursive": false, "permanent": false}
- {"op": "create_directory", "path": "..."}
- {"op": "create_file", "path": "..."}

RULES:
1. Paths are relative to the current directory unless absolute. Use names exactly as listed.
2. A destination ending in "/" or naming an existing folder means "into that folder".
3. Operations run in order. If a destination folder does not exist, create it first.
4. "sources" may use * and ? wildcards matched against the current directory listing.
5. Set "recursive": true only when deleting a folder that is not empty.
6. Set "permanent": true only when the user explicitly asks to delete permanently.
7. Set "overwrite": true only when the user explicitly asks to replace existing files.
8. If the request is unclear, set "ambiguous": true, list the possible readings in "alternatives" and return the safest plan (possibly empty).
9. If the request is not about files, return an empty "operations" list and explain in "notes".
"#;

/// Build user prompt for one utterance
pub fn build_plan_prompt(
    utterance: &str,
    listing: &DirectoryListing,
    selection: &[String],
    history: &[String],
) -> String {
    let mut prompt = format!("CURRENT DIRECTORY: {}\n\nLISTING:\n", listing.directory.display());

    if listing.entries.is_empty() {
        prompt.push_str("(empty)\n");
    }
    for entry in &listing.entries {
        let modified = format_millis(entry.modified_at);
        if entry.is_dir() {
            prompt.push_str(&format!("- {}/ (folder, modified {})\n", entry.name, modified));
        } else {
            prompt.push_str(&format!(
                "- {} ({} {}, modified {})\n",
                entry.name,
                entry.kind.label(),
                format_size(entry.size),
                modified
            ));
        }
    }
    if listing.truncated {
        prompt.push_str(&format!(
            "... listing truncated to the first {} entries\n",
            listing.entries.len()
        ));
    }

    if !selection.is_empty() {
        prompt.push_str("\nSELECTED:\n");
        for path in selection {
            prompt.push_str(&format!("- {}\n", path));
        }
    }

    if !history.is_empty() {
        prompt.push_str("\nEARLIER REQUESTS (oldest first):\n");
        for utterance in history {
            prompt.push_str(&format!("- {}\n", utterance));
        }
    }

    prompt.push_str(&format!(
        "\nREQUEST: {}\n\nOutput ONLY valid JSON.",
        utterance.trim()
    ));
    prompt
}
