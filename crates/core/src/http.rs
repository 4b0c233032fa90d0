//! HTTP verb a job's callback is delivered with.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

/// Callback verb.
///
/// Only these four verbs are delivered. Anything else a caller stored is
/// treated as `GET`, matching how the composer falls back for unknown verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpVerb {
    #[default]
    Get,
    Post,
    Put,
    Delete,
}

impl HttpVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpVerb::Get => "GET",
            HttpVerb::Post => "POST",
            HttpVerb::Put => "PUT",
            HttpVerb::Delete => "DELETE",
        }
    }

    /// Whether the payload travels in the request body (vs. the query string).
    pub fn carries_body(&self) -> bool {
        matches!(self, HttpVerb::Post | HttpVerb::Put)
    }

    /// Lenient parse: case-insensitive, unknown verbs become `GET`.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "POST" => HttpVerb::Post,
            "PUT" => HttpVerb::Put,
            "DELETE" => HttpVerb::Delete,
            _ => HttpVerb::Get,
        }
    }
}

impl core::fmt::Display for HttpVerb {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpVerb {
    type Err = core::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse_lenient(s))
    }
}
