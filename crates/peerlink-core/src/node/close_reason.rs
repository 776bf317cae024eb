//! Why a connection was closed

use std::fmt;

/// Close reason attached to every connection close
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// Node is shutting down
    Shutdown,
    /// Peer sent `CloseConnection`
    CloseMsgReceived,
    /// We sent `CloseConnection`
    CloseMsgSent,
    /// Temporary connection used to validate an address finished
    AddressValidationCompleted,
    /// Address validation did not succeed
    AddressValidationFailed,
    /// Another connection to the same peer already exists
    DuplicateConnection,
    /// Node is at its connection limit
    TooManyConnections,
    /// Node is at its inbound connection limit
    TooManyInboundConnections,
    /// Peer is banned
    Banned,
    /// Nothing references the connection anymore
    OrphanedConnection,
    /// I/O or protocol failure
    Exception,
}

impl CloseReason {
    /// Returns true if the close is part of normal operation
    #[must_use]
    pub const fn is_graceful(self) -> bool {
        !matches!(
            self,
            CloseReason::AddressValidationFailed | CloseReason::Banned | CloseReason::Exception
        )
    }

    /// Stable name used on the wire in `CloseConnection`
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            CloseReason::Shutdown => "SHUTDOWN",
            CloseReason::CloseMsgReceived => "CLOSE_MSG_RECEIVED",
            CloseReason::CloseMsgSent => "CLOSE_MSG_SENT",
            CloseReason::AddressValidationCompleted => "ADDRESS_VALIDATION_COMPLETED",
            CloseReason::AddressValidationFailed => "ADDRESS_VALIDATION_FAILED",
            CloseReason::DuplicateConnection => "DUPLICATE_CONNECTION",
            CloseReason::TooManyConnections => "TOO_MANY_CONNECTIONS",
            CloseReason::TooManyInboundConnections => "TOO_MANY_INBOUND_CONNECTIONS",
            CloseReason::Banned => "BANNED",
            CloseReason::OrphanedConnection => "ORPHANED_CONNECTION",
            CloseReason::Exception => "EXCEPTION",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Close reason with optional context attached after construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseDetails {
    /// Close reason
    pub reason: CloseReason,
    /// Free-text detail
    pub details: Option<String>,
    /// Error that caused the close
    pub cause: Option<String>,
}

impl CloseDetails {
    /// Details with just a reason
    #[must_use]
    pub const fn new(reason: CloseReason) -> Self {
        Self {
            reason,
            details: None,
            cause: None,
        }
    }

    /// Attach detail text
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Attach the causing error
    #[must_use]
    pub fn with_cause(mut self, cause: &dyn std::error::Error) -> Self {
        self.cause = Some(cause.to_string());
        self
    }
}

impl From<CloseReason> for CloseDetails {
    fn from(reason: CloseReason) -> Self {
        CloseDetails::new(reason)
    }
}

impl fmt::Display for CloseDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)?;
        if let Some(details) = &self.details {
            write!(f, " ({details})")?;
        }
        if let Some(cause) = &self.cause {
            write!(f, " caused by: {cause}")?;
        }
        Ok(())
    }
}
