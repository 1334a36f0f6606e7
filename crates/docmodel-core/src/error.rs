//! Error types for DocModel operations.

use crate::entity::EntityToken;
use std::fmt;

/// The primary error type for all DocModel operations.
#[derive(Debug)]
pub enum Error {
    /// The entity already has tracking state in this unit of work.
    RepeatedRegistration(RecordError),
    /// The entity has no tracking state in this unit of work.
    UnknownRecord(RecordError),
    /// A pending delete cannot be turned into an update.
    Update(RecordError),
    /// Write attempted through a read-only or reverse proxy.
    ReadOnlyProxy {
        /// Entity type behind the proxy (or owning the association).
        entity_type: String,
        /// Attribute or association property that was written.
        attribute: String,
    },
    /// Association metadata is inconsistent (unknown cardinality, dangling inverse).
    IntegrityConstraint(String),
    /// Registry misuse (duplicate declaration, write after freeze, unknown names).
    Mapping(MappingError),
    /// Malformed query statement.
    Syntax {
        /// The statement as written by the caller.
        statement: String,
        /// What was wrong with it.
        message: String,
    },
    /// Driver failure in the middle of a flush.
    Commit(CommitError),
    /// Driver failure outside a flush.
    Store(StoreError),
    /// A proxy or refresh target is gone from the store.
    DocumentNotFound {
        /// Collection that was searched.
        collection: String,
        /// Identity that was searched for.
        id: String,
    },
    /// The entity already has a different identity.
    ImmutableIdentity {
        /// Entity type.
        entity_type: String,
        /// The identity the entity already carries.
        current: String,
    },
    /// Plain attribute write on the identity key or an association property.
    ReservedAttribute {
        /// Entity type.
        entity_type: String,
        /// The attribute name.
        attribute: String,
    },
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

/// Tracking-state error for one entity.
#[derive(Debug, Clone)]
pub struct RecordError {
    pub entity_type: String,
    pub token: EntityToken,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingError {
    pub kind: MappingErrorKind,
    pub entity_type: String,
    pub property: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingErrorKind {
    /// Same property declared twice for one type
    DuplicatedMapping,
    /// Metadata written after it was frozen or first assigned
    ReadOnlyMetadata,
    /// Entity type is not registered
    UnmappedType,
    /// Association property is not declared
    UnmappedProperty,
}

/// Failure of a flush after some driver operations were already issued.
///
/// The backing store has no transactions: everything listed in `completed`
/// stays applied.
#[derive(Debug)]
pub struct CommitError {
    /// Operations that reached the store before the failure.
    pub completed: Vec<String>,
    /// The operation that failed.
    pub operation: String,
    /// The underlying driver error.
    pub source: Box<Error>,
}

#[derive(Debug)]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub collection: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// Store unreachable
    Connection,
    /// Duplicate identity on insert
    DuplicateKey,
    /// Filter or update document rejected by the driver
    InvalidDocument,
    /// Other driver error
    Driver,
}

impl RecordError {
    pub fn new(
        entity_type: impl Into<String>,
        token: EntityToken,
        message: impl Into<String>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            token,
            message: message.into(),
        }
    }
}

impl MappingError {
    pub fn new(
        kind: MappingErrorKind,
        entity_type: impl Into<String>,
        property: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            entity_type: entity_type.into(),
            property: property.map(str::to_string),
            message: message.into(),
        }
    }
}

impl StoreError {
    pub fn new(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            collection: None,
            message: message.into(),
            source: None,
        }
    }

    #[must_use]
    pub fn in_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }
}

impl Error {
    pub fn duplicated_mapping(entity_type: &str, property: &str) -> Self {
        Error::Mapping(MappingError::new(
            MappingErrorKind::DuplicatedMapping,
            entity_type,
            Some(property),
            format!("association '{property}' is already declared on {entity_type}"),
        ))
    }

    pub fn read_only_metadata(entity_type: &str, message: impl Into<String>) -> Self {
        Error::Mapping(MappingError::new(
            MappingErrorKind::ReadOnlyMetadata,
            entity_type,
            None,
            message,
        ))
    }

    pub fn unmapped_type(entity_type: &str) -> Self {
        Error::Mapping(MappingError::new(
            MappingErrorKind::UnmappedType,
            entity_type,
            None,
            format!("entity type {entity_type} is not registered"),
        ))
    }

    pub fn unmapped_property(entity_type: &str, property: &str) -> Self {
        Error::Mapping(MappingError::new(
            MappingErrorKind::UnmappedProperty,
            entity_type,
            Some(property),
            format!("{entity_type} declares no association '{property}'"),
        ))
    }

    pub fn syntax(statement: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Syntax {
            statement: statement.into(),
            message: message.into(),
        }
    }

    /// Is this a duplicated-mapping registry error?
    pub fn is_duplicated_mapping(&self) -> bool {
        matches!(self, Error::Mapping(m) if m.kind == MappingErrorKind::DuplicatedMapping)
    }

    /// Is this a read-only-metadata registry error?
    pub fn is_read_only_metadata(&self) -> bool {
        matches!(self, Error::Mapping(m) if m.kind == MappingErrorKind::ReadOnlyMetadata)
    }

    /// Did a flush fail part-way? Callers must reload the affected entities.
    pub fn is_commit_error(&self) -> bool {
        matches!(self, Error::Commit(_))
    }

    /// Get the statement that failed to compile, if any.
    pub fn statement(&self) -> Option<&str> {
        match self {
            Error::Syntax { statement, .. } => Some(statement),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::RepeatedRegistration(e) => write!(f, "Repeated registration: {}", e),
            Error::UnknownRecord(e) => write!(f, "Unknown record: {}", e),
            Error::Update(e) => write!(f, "Update error: {}", e),
            Error::ReadOnlyProxy {
                entity_type,
                attribute,
            } => write!(
                f,
                "Read-only proxy: cannot write '{}' on {}",
                attribute, entity_type
            ),
            Error::IntegrityConstraint(msg) => write!(f, "Integrity constraint: {}", msg),
            Error::Mapping(e) => write!(f, "Mapping error: {}", e),
            Error::Syntax { statement, message } => {
                write!(f, "Syntax error in statement \"{}\": {}", statement, message)
            }
            Error::Commit(e) => write!(f, "Commit error: {}", e),
            Error::Store(e) => write!(f, "Store error: {}", e),
            Error::DocumentNotFound { collection, id } => {
                write!(f, "Document {} not found in collection '{}'", id, collection)
            }
            Error::ImmutableIdentity {
                entity_type,
                current,
            } => write!(
                f,
                "Identity of {} is already established as {}",
                entity_type, current
            ),
            Error::ReservedAttribute {
                entity_type,
                attribute,
            } => write!(
                f,
                "'{}' is reserved on {} and cannot be written as a plain attribute",
                attribute, entity_type
            ),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Commit(e) => Some(e.source.as_ref()),
            Error::Store(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.entity_type, self.token, self.message)
    }
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for CommitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed after {} completed operation(s): {}",
            self.operation,
            self.completed.len(),
            self.source
        )
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(collection) = &self.collection {
            write!(f, "{} (collection '{}')", self.message, collection)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        Error::Store(err)
    }
}

impl From<MappingError> for Error {
    fn from(err: MappingError) -> Self {
        Error::Mapping(err)
    }
}

impl From<CommitError> for Error {
    fn from(err: CommitError) -> Self {
        Error::Commit(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for DocModel operations.
pub type Result<T> = std::result::Result<T, Error>;
