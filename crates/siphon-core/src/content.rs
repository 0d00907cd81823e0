/// Body presence state for a [`crate::request::Request`] or
/// [`crate::response::Response`].
///
/// Replaces the `CONTENT_MISSING` sentinel integer from the original
/// implementation with an explicit three-state enum (see DESIGN.md,
/// "CONTENT_MISSING sentinel").
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum Content {
    /// No body was ever present (e.g. a GET with no entity).
    #[default]
    Absent,
    /// The body bytes as captured.
    Bytes(Vec<u8>),
    /// A body existed on the wire but was not captured, e.g. because
    /// `body_size_limit` was exceeded under "skip body" policy.
    Elided,
}

impl Content {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Content::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Content::Bytes(b) => b.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Falsy presence check: `Absent` and `Elided` are both "no usable body",
    /// matching `CONTENT_MISSING`'s falsiness in the source.
    pub fn is_present(&self) -> bool {
        matches!(self, Content::Bytes(b) if !b.is_empty())
    }

    pub fn is_elided(&self) -> bool {
        matches!(self, Content::Elided)
    }
}
