use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A named permission bound to an API key.
///
/// Scopes are checked by the resource they guard, not by the key store.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Call the thinking entry point (`POST /api/v1/chat`).
    Chat,
    /// Manage API keys.
    Admin,
    /// Read operational status beyond the public health endpoints.
    Status,
}

impl Scope {
    /// All known scopes.
    pub const ALL: [Scope; 3] = [Scope::Chat, Scope::Admin, Scope::Status];

    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Chat => "chat",
            Scope::Admin => "admin",
            Scope::Status => "status",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chat" => Ok(Scope::Chat),
            "admin" => Ok(Scope::Admin),
            "status" => Ok(Scope::Status),
            other => Err(format!("unknown scope '{other}' (expected chat, admin or status)")),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn parse_roundtrip() {
        for scope in Scope::ALL {
            assert_eq!(scope.as_str().parse::<Scope>().unwrap(), scope);
        }
        assert_eq!(" Admin ".parse::<Scope>().unwrap(), Scope::Admin);
        assert!("root".parse::<Scope>().is_err());
    }

    #[test]
    fn serde_names() {
        assert_eq!(serde_json::to_string(&Scope::Chat).unwrap(), "\"chat\"");
    }
}
