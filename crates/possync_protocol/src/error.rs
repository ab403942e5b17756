//! Error types for protocol values and document conversion.

use thiserror::Error;

/// Errors raised when constructing protocol values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// An identifier was empty or malformed.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// A collection name is not known.
    #[error("unknown collection: {0}")]
    UnknownCollection(String),
}

/// Result type for document conversion.
pub type ConversionResult<T> = Result<T, ConversionError>;

/// Errors raised while converting a remote document into a typed record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConversionError {
    /// The document lacks fields every record of its kind carries.
    ///
    /// Configuration and metadata entries stored next to domain documents
    /// end up here; callers skip them rather than counting a failure.
    #[error("document {id} in {collection} is missing required fields: {}", missing.join(", "))]
    MissingFields {
        /// Collection name.
        collection: String,
        /// Document id.
        id: String,
        /// Names of the missing fields.
        missing: Vec<String>,
    },

    /// The document has the required fields but their values are invalid.
    #[error("document {id} in {collection} is malformed: {reason}")]
    Malformed {
        /// Collection name.
        collection: String,
        /// Document id.
        id: String,
        /// What was wrong.
        reason: String,
    },

    /// The collection holds no domain records.
    #[error("collection {0} does not hold domain records")]
    NotDomain(String),
}

impl ConversionError {
    /// Returns true if the document should be skipped silently.
    pub fn is_skippable(&self) -> bool {
        matches!(self, ConversionError::MissingFields { .. } | ConversionError::NotDomain(_))
    }
}
