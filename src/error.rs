//! Crate-wide error taxonomy.
//!
//! `ServerError` reaches `main` and sets the process exit code (socket-fatal,
//! kind 5). `ConnError` covers everything a single connection's driver can
//! fail with (transport-fatal and application-error, kinds 1 and 3);
//! transient conditions (kinds 2 and 4) never construct an error value at
//! all, they're `Ok` paths with a no-op branch.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind UDP socket: {0}")]
    Bind(#[source] std::io::Error),

    #[error("failed to construct TLS context: {0}")]
    Tls(String),

    #[error("failed to load certificate material: {0}")]
    Cert(String),

    #[error("invalid bind address: {0}")]
    InvalidAddr(#[source] std::net::AddrParseError),
}

/// The application error code carried on CONNECTION_CLOSE, inferred from an
/// HTTP/3-level failure per the application-error propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppErrorCode(pub u64);

impl AppErrorCode {
    /// H3_NO_ERROR
    pub const NONE: AppErrorCode = AppErrorCode(0x100);
    /// H3_GENERAL_PROTOCOL_ERROR
    pub const GENERAL_PROTOCOL_ERROR: AppErrorCode = AppErrorCode(0x101);
    /// H3_SETTINGS_ERROR
    pub const SETTINGS_ERROR: AppErrorCode = AppErrorCode(0x109);
    /// H3_MISSING_SETTINGS
    pub const MISSING_SETTINGS: AppErrorCode = AppErrorCode(0x10a);
    /// H3_FRAME_UNEXPECTED
    pub const FRAME_UNEXPECTED: AppErrorCode = AppErrorCode(0x105);
    /// H3_FRAME_ERROR
    pub const FRAME_ERROR: AppErrorCode = AppErrorCode(0x106);
    /// QPACK_DECOMPRESSION_FAILED
    pub const QPACK_DECOMPRESSION_FAILED: AppErrorCode = AppErrorCode(0x200);
}

#[derive(Debug, Clone, Error)]
pub enum ConnError {
    /// The handshake or loss-recovery state machine failed irrecoverably.
    #[error("quic transport error: {0}")]
    Transport(String),

    /// The connection went idle for longer than the configured timeout.
    #[error("idle timeout")]
    IdleTimeout,

    /// Fewer than 3 peer-allowed uni stream credits were available when
    /// setting up the HTTP/3 engine (control + QPACK encoder/decoder).
    #[error("insufficient uni stream credit for http/3 setup")]
    H3SetupCreditExhausted,

    /// An HTTP/3-level failure, carrying the application error code that
    /// should be reported on CONNECTION_CLOSE.
    #[error("http/3 error {code:?}: {reason}")]
    Application { code: AppErrorCode, reason: String },

    /// The peer (or local code) dropped the connection without an explicit
    /// reason being available.
    #[error("connection closed: {0}")]
    Closed(String),
}

impl ConnError {
    pub fn app_error_code(&self) -> AppErrorCode {
        match self {
            ConnError::Application { code, .. } => *code,
            ConnError::H3SetupCreditExhausted => AppErrorCode::MISSING_SETTINGS,
            _ => AppErrorCode::GENERAL_PROTOCOL_ERROR,
        }
    }
}
