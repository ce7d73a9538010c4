//! Shared error taxonomy. Every subsystem error enum implements
//! [`TaxonomyError`] so the HTTP layer can map any of them to a status code
//! in one place instead of re-deriving the mapping per endpoint.

/// The seven error kinds named by the specification. These are kinds, not
/// concrete types — each subsystem still defines its own `thiserror` enum;
/// this just tags which bucket a given variant falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    ResourceExhausted,
    NotFound,
    Conflict,
    TransientIo,
    Cancelled,
    Fatal,
}

pub trait TaxonomyError {
    fn kind(&self) -> ErrorKind;
}

impl ErrorKind {
    /// The HTTP status code this kind maps to.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::ResourceExhausted => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::TransientIo => 500,
            ErrorKind::Cancelled => 200,
            ErrorKind::Fatal => 500,
        }
    }
}
