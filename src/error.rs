//! Error taxonomy for the computation core.
//!
//! The serving layer maps these onto HTTP statuses, so the split that
//! matters is user-input errors (unknown ids, bad arguments → 4xx)
//! versus upstream/internal failures (→ 5xx). Duplicate computation
//! registration is a programming error and panics at startup instead
//! of appearing here.

use crate::tile::Quadrant;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An object, repository, commit, line, or computation id the
    /// caller named does not exist.
    #[error("{what} '{id}' not found")]
    NotFound { what: &'static str, id: String },

    /// The caller supplied something unparsable or out of range: a bad
    /// aggregation name, a malformed hash, a negative LOD.
    #[error("{0}")]
    InvalidArgument(String),

    /// The repository or cache backend failed.
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// A macro tile could not be composed because one of its four
    /// children failed.
    #[error("failed to fetch child tile ({x}, {y}) at lod {lod} ({quadrant}): {source}")]
    ChildTile {
        quadrant: Quadrant,
        lod: i64,
        x: i64,
        y: i64,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            what,
            id: id.into(),
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Error::Upstream(msg.into())
    }

    /// True when the failure was caused by the caller's input and the
    /// serving layer should answer 4xx rather than 5xx. A child-tile
    /// failure inherits the classification of its root cause.
    pub fn is_user_error(&self) -> bool {
        match self {
            Error::NotFound { .. } | Error::InvalidArgument(_) => true,
            Error::Upstream(_) => false,
            Error::ChildTile { source, .. } => source.is_user_error(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_error_classification() {
        assert!(Error::not_found("repo", "missing").is_user_error());
        assert!(Error::invalid("bad agg").is_user_error());
        assert!(!Error::upstream("io").is_user_error());
    }

    #[test]
    fn test_child_tile_inherits_classification() {
        let err = Error::ChildTile {
            quadrant: Quadrant::TopLeft,
            lod: 2,
            x: 0,
            y: 0,
            source: Box::new(Error::upstream("disk")),
        };
        assert!(!err.is_user_error());

        let err = Error::ChildTile {
            quadrant: Quadrant::BottomRight,
            lod: 1,
            x: 3,
            y: 3,
            source: Box::new(Error::not_found("computation", "nope")),
        };
        assert!(err.is_user_error());
    }

    #[test]
    fn test_child_tile_message_names_quadrant() {
        let err = Error::ChildTile {
            quadrant: Quadrant::TopRight,
            lod: 3,
            x: 5,
            y: 2,
            source: Box::new(Error::upstream("timeout")),
        };
        let msg = err.to_string();
        assert!(msg.contains("(5, 2)"));
        assert!(msg.contains("lod 3"));
        assert!(msg.contains("top-right"));
    }
}
