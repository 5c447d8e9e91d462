//! Lenient dynamic-event payload parsing for agent hook payloads
//! (`SPEC_FULL.md` §4.3, Design Notes "Dynamic-type event objects"):
//! a shallow `map<string, any>` with typed accessors, reached through a
//! bounded-depth recursive walker for agents whose output isn't schema'd.

use serde_json::Value;

/// Maximum recursion depth the text walker will descend into nested
/// objects/arrays while hunting for a named field.
const MAX_WALK_DEPTH: usize = 10;

/// The recognized event kinds in an `/opencode-event` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Agent turn completed.
    SessionIdle,
    /// Agent turn failed.
    SessionError,
    /// Agent session started.
    SessionStart,
    /// Agent session ended.
    SessionEnd,
    /// Any other/unrecognized `type` value.
    Other,
}

impl EventKind {
    fn from_str(s: &str) -> Self {
        match s {
            "session.idle" => Self::SessionIdle,
            "session.error" => Self::SessionError,
            "session.start" => Self::SessionStart,
            "session.end" => Self::SessionEnd,
            _ => Self::Other,
        }
    }
}

/// A leniently-parsed `/opencode-event` payload.
#[derive(Debug, Clone)]
pub struct HookEvent {
    /// Owning project name.
    pub project_name: String,
    /// Agent kind.
    pub agent_type: String,
    /// Target instance id, when the payload named one explicitly.
    pub instance_id: Option<String>,
    /// Recognized event kind.
    pub kind: EventKind,
    /// The turn's final text, if present.
    pub text: Option<String>,
    /// The turn's accumulated text, if present (preferred over `text` when
    /// both are set).
    pub turn_text: Option<String>,
}

impl HookEvent {
    /// Parse a raw JSON value into a [`HookEvent`]. Returns `None` when
    /// the required `projectName` field is missing or not a string — the
    /// caller maps that to a 400 response.
    #[must_use]
    pub fn parse(value: &Value) -> Option<Self> {
        let project_name = find_string(value, "projectName", 0)?;
        let agent_type = find_string(value, "agentType", 0).unwrap_or_default();
        let instance_id = find_string(value, "instanceId", 0);
        let kind = find_string(value, "type", 0)
            .as_deref()
            .map(EventKind::from_str)
            .unwrap_or(EventKind::Other);
        let text = find_string(value, "text", 0);
        let turn_text = find_string(value, "turnText", 0);

        Some(Self {
            project_name,
            agent_type,
            instance_id,
            kind,
            text,
            turn_text,
        })
    }

    /// The text to act on for `session.idle`/`session.error` handling:
    /// `turnText` when present, else `text`.
    #[must_use]
    pub fn effective_text(&self) -> Option<&str> {
        self.turn_text.as_deref().or(self.text.as_deref())
    }
}

/// Look for a string-valued field named `key` at the top level first, then
/// recursively through nested objects/arrays up to [`MAX_WALK_DEPTH`].
fn find_string(value: &Value, key: &str, depth: usize) -> Option<String> {
    if depth > MAX_WALK_DEPTH {
        return None;
    }
    match value {
        Value::Object(map) => {
            if let Some(Value::String(s)) = map.get(key) {
                return Some(s.clone());
            }
            map.values().find_map(|child| find_string(child, key, depth + 1))
        }
        Value::Array(items) => items.iter().find_map(|child| find_string(child, key, depth + 1)),
        _ => None,
    }
}
