use serde::{Deserialize, Serialize};

/// The change the diff engine decided on for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ChangeAction {
    NoOp,
    Create,
    Update,
    Delete,
    /// Destroy and recreate. With `before_destroy` set the new instance is
    /// created first and the old one destroyed once every dependent has moved
    /// over; otherwise the old instance is destroyed first.
    Replace { before_destroy: bool },
}

impl ChangeAction {
    pub fn is_change(&self) -> bool {
        !matches!(self, ChangeAction::NoOp)
    }

    /// Short marker used in plan renderings.
    pub fn symbol(&self) -> &'static str {
        match self {
            ChangeAction::NoOp => " ",
            ChangeAction::Create => "+",
            ChangeAction::Update => "~",
            ChangeAction::Delete => "-",
            ChangeAction::Replace { before_destroy: true } => "+/-",
            ChangeAction::Replace { before_destroy: false } => "-/+",
        }
    }
}

impl std::fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeAction::NoOp => write!(f, "no-op"),
            ChangeAction::Create => write!(f, "create"),
            ChangeAction::Update => write!(f, "update"),
            ChangeAction::Delete => write!(f, "delete"),
            ChangeAction::Replace { before_destroy: true } => {
                write!(f, "replace (create before destroy)")
            }
            ChangeAction::Replace { before_destroy: false } => {
                write!(f, "replace (destroy before create)")
            }
        }
    }
}
