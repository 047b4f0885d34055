//! Endpoint identifiers: URI-like DTN names of the form `scheme:ssp`.

use std::fmt::{self, Display};
use std::str::FromStr;
use thiserror::Error as ThisError;

/// The null endpoint, used wherever a bundle field has no meaningful
/// destination.
const NULL_EID: &str = "dtn:none";

#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum EidError {
    #[error("endpoint id {0:?} has no scheme separator")]
    MissingScheme(String),
    #[error("endpoint id {0:?} has an empty scheme or ssp")]
    Empty(String),
}

/// A URI-like DTN endpoint name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointId {
    uri: String,
    colon: usize,
}

impl EndpointId {
    pub fn null() -> Self {
        NULL_EID.parse().unwrap()
    }

    pub fn is_null(&self) -> bool {
        self.uri == NULL_EID
    }

    pub fn scheme(&self) -> &str {
        &self.uri[..self.colon]
    }

    /// The scheme-specific part after the separator.
    pub fn ssp(&self) -> &str {
        &self.uri[self.colon + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.uri
    }
}

impl FromStr for EndpointId {
    type Err = EidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let colon = s
            .find(':')
            .ok_or_else(|| EidError::MissingScheme(s.into()))?;
        if colon == 0 || colon + 1 == s.len() {
            return Err(EidError::Empty(s.into()));
        }
        Ok(Self {
            uri: s.into(),
            colon,
        })
    }
}

impl Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.uri)
    }
}
