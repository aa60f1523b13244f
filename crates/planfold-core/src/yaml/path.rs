//! Yaml path syntax: `/`-separated mapping keys, with `[n]` for sequence
//! indices. The empty path names the document root.

use std::fmt;

use super::YamlError;

/// One step of a yaml path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(key) => f.write_str(key),
            Self::Index(i) => write!(f, "[{i}]"),
        }
    }
}

/// Split a yaml path into segments.
pub fn parse_path(path: &str) -> Result<Vec<PathSegment>, YamlError> {
    if path.is_empty() {
        return Ok(Vec::new());
    }

    path.split('/')
        .map(|raw| {
            if raw.is_empty() {
                return Err(YamlError::InvalidPath {
                    path: path.to_string(),
                    reason: "empty segment".to_string(),
                });
            }
            match raw.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                Some(index) => index
                    .parse::<usize>()
                    .map(PathSegment::Index)
                    .map_err(|_| YamlError::InvalidPath {
                        path: path.to_string(),
                        reason: format!("bad index {raw:?}"),
                    }),
                None => Ok(PathSegment::Key(raw.to_string())),
            }
        })
        .collect()
}

/// Append a segment to `base`.
pub fn join(base: &str, segment: &PathSegment) -> String {
    if base.is_empty() {
        segment.to_string()
    } else {
        format!("{base}/{segment}")
    }
}

/// The field name a path points at: its last mapping key, or `""` for the
/// root.
pub fn field_name(segments: &[PathSegment]) -> &str {
    segments
        .iter()
        .rev()
        .find_map(|s| match s {
            PathSegment::Key(key) => Some(key.as_str()),
            PathSegment::Index(_) => None,
        })
        .unwrap_or("")
}
