//! Defines all Certa server side errors.

use std::fmt;
use std::fmt::Display;

use crate::commons::crypto::SignerError;
use crate::server::profile::ProfileError;
use crate::server::store::StoreError;

//------------ ErrorKind -----------------------------------------------------

/// The broad category of an error.
///
/// Callers decide what to do with a failed operation based on its kind:
/// bad requests and policy violations are the requester's problem,
/// conflicts depend on current state, unavailability is temporary and
/// system failures need an operator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    BadRequest,
    PolicyViolation,
    Conflict,
    Unavailable,
    SystemFailure,
}

impl ErrorKind {
    /// Whether the same call may succeed when tried again later.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Unavailable)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ErrorKind::BadRequest => "bad request",
            ErrorKind::PolicyViolation => "policy violation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::SystemFailure => "system failure",
        };
        f.write_str(s)
    }
}

//------------ ErrorCode -----------------------------------------------------

/// The operation error code reported to protocol layers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorCode {
    AlreadyIssued,
    BadCertTemplate,
    BadPop,
    BadRequest,
    CertRevoked,
    CrlFailure,
    NotPermitted,
    SystemFailure,
    SystemUnavailable,
    UnknownCert,
    UnknownCertProfile,
    WeakPublicKey,
}

impl ErrorCode {
    pub fn kind(self) -> ErrorKind {
        match self {
            ErrorCode::BadCertTemplate
            | ErrorCode::BadPop
            | ErrorCode::BadRequest
            | ErrorCode::UnknownCertProfile => ErrorKind::BadRequest,
            ErrorCode::NotPermitted | ErrorCode::WeakPublicKey => ErrorKind::PolicyViolation,
            ErrorCode::AlreadyIssued | ErrorCode::CertRevoked | ErrorCode::UnknownCert => ErrorKind::Conflict,
            ErrorCode::SystemUnavailable => ErrorKind::Unavailable,
            ErrorCode::SystemFailure | ErrorCode::CrlFailure => ErrorKind::SystemFailure,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::AlreadyIssued => "ALREADY_ISSUED",
            ErrorCode::BadCertTemplate => "BAD_CERT_TEMPLATE",
            ErrorCode::BadPop => "BAD_POP",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::CertRevoked => "CERT_REVOKED",
            ErrorCode::CrlFailure => "CRL_FAILURE",
            ErrorCode::NotPermitted => "NOT_PERMITTED",
            ErrorCode::SystemFailure => "SYSTEM_FAILURE",
            ErrorCode::SystemUnavailable => "SYSTEM_UNAVAILABLE",
            ErrorCode::UnknownCert => "UNKNOWN_CERT",
            ErrorCode::UnknownCertProfile => "UNKNOWN_CERT_PROFILE",
            ErrorCode::WeakPublicKey => "WEAK_PUBLIC_KEY",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//------------ Error ---------------------------------------------------------

#[derive(Debug)]
pub enum Error {
    /// A failed operation with its code and a message giving context.
    Operation { code: ErrorCode, msg: String },

    /// The certificate store failed.
    Store(StoreError),

    /// A signer could not be used.
    Signer(SignerError),

    /// The certificate profile failed.
    Profile(ProfileError),

    /// An OpenSSL call failed.
    Openssl(openssl::error::ErrorStack),

    /// DER encoding failed.
    Encoding(der::Error),

    /// An item of a batch request failed.
    InBatch { index: usize, source: Box<Error> },
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Operation { code, .. } => *code,
            Error::Store(StoreError::NotPermitted(_)) => ErrorCode::NotPermitted,
            Error::Store(_) => ErrorCode::SystemFailure,
            Error::Signer(e) => {
                if e.is_no_idle_signer() {
                    ErrorCode::SystemUnavailable
                } else {
                    ErrorCode::SystemFailure
                }
            }
            Error::Profile(e) => match e {
                ProfileError::BadCertTemplate(_) => ErrorCode::BadCertTemplate,
                ProfileError::System(_) => ErrorCode::SystemFailure,
            },
            Error::Openssl(_) | Error::Encoding(_) => ErrorCode::SystemFailure,
            Error::InBatch { source, .. } => source.code(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.code().kind()
    }

    /// Returns the index of the failed batch item, if this is a batch error.
    pub fn batch_index(&self) -> Option<usize> {
        match self {
            Error::InBatch { index, .. } => Some(*index),
            _ => None,
        }
    }

    pub fn in_batch(self, index: usize) -> Self {
        Error::InBatch {
            index,
            source: Box::new(self),
        }
    }

    fn operation(code: ErrorCode, msg: impl Display) -> Self {
        Error::Operation {
            code,
            msg: msg.to_string(),
        }
    }

    pub fn already_issued(msg: impl Display) -> Self {
        Self::operation(ErrorCode::AlreadyIssued, msg)
    }

    pub fn bad_cert_template(msg: impl Display) -> Self {
        Self::operation(ErrorCode::BadCertTemplate, msg)
    }

    pub fn bad_pop(msg: impl Display) -> Self {
        Self::operation(ErrorCode::BadPop, msg)
    }

    pub fn bad_request(msg: impl Display) -> Self {
        Self::operation(ErrorCode::BadRequest, msg)
    }

    pub fn cert_revoked(msg: impl Display) -> Self {
        Self::operation(ErrorCode::CertRevoked, msg)
    }

    pub fn crl_failure(msg: impl Display) -> Self {
        Self::operation(ErrorCode::CrlFailure, msg)
    }

    pub fn not_permitted(msg: impl Display) -> Self {
        Self::operation(ErrorCode::NotPermitted, msg)
    }

    pub fn system_failure(msg: impl Display) -> Self {
        Self::operation(ErrorCode::SystemFailure, msg)
    }

    pub fn unavailable(msg: impl Display) -> Self {
        Self::operation(ErrorCode::SystemUnavailable, msg)
    }

    pub fn unknown_cert(msg: impl Display) -> Self {
        Self::operation(ErrorCode::UnknownCert, msg)
    }

    pub fn unknown_profile(name: impl Display) -> Self {
        Self::operation(ErrorCode::UnknownCertProfile, format!("unknown certprofile '{name}'"))
    }

    pub fn weak_public_key(msg: impl Display) -> Self {
        Self::operation(ErrorCode::WeakPublicKey, msg)
    }

    pub fn encoding(e: der::Error) -> Self {
        Error::Encoding(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Operation { code, msg } => write!(f, "{code}: {msg}"),
            Error::Store(e) => write!(f, "certificate store error: {e}"),
            Error::Signer(e) => write!(f, "signer error: {e}"),
            Error::Profile(e) => write!(f, "certprofile error: {e}"),
            Error::Openssl(e) => write!(f, "openssl error: {e}"),
            Error::Encoding(e) => write!(f, "encoding error: {e}"),
            Error::InBatch { index, source } => write!(f, "request {index} failed: {source}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        Error::Store(e)
    }
}

impl From<SignerError> for Error {
    fn from(e: SignerError) -> Self {
        Error::Signer(e)
    }
}

impl From<ProfileError> for Error {
    fn from(e: ProfileError) -> Self {
        Error::Profile(e)
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(e: openssl::error::ErrorStack) -> Self {
        Error::Openssl(e)
    }
}

impl From<der::Error> for Error {
    fn from(e: der::Error) -> Self {
        Error::Encoding(e)
    }
}

//------------ Tests ---------------------------------------------------------
