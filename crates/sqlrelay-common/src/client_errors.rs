//! Client-visible limit error codes
//!
//! Clients key off these numeric codes, so the values and the canonical
//! message text are part of the wire contract and must never change.
//! The 900000+ range was chosen to stay clear of native database codes.

use std::collections::HashMap;

use once_cell::sync::Lazy;

/// SQLSTATE-like tag carried with every limit error
pub const LIMIT_SQLSTATE: &str = "SQLR";

/// A per-instance limit violated by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientLimitError {
    /// No server-side cursor was free to run the query
    NoCursors,
    /// Client info string exceeded `maxclientinfolength`
    MaxClientInfoLength,
    /// Query text exceeded `maxquerysize`
    MaxQueryLength,
    /// Bind variable count exceeded `maxbindcount`
    MaxBindCount,
    /// A bind variable name exceeded `maxbindnamelength`
    MaxBindNameLength,
    /// A string bind value exceeded `maxstringbindvaluelength`
    MaxStringBindValueLength,
    /// A lob bind value exceeded `maxlobbindvaluelength`
    MaxLobBindValueLength,
    /// The same bind variable name was supplied twice
    DuplicateBindName,
    /// Column count exceeded `maxselectlist`
    MaxSelectList,
    /// Resume was requested for a cursor that is not suspended
    ResultSetNotSuspended,
}

impl ClientLimitError {
    /// Every limit error, in code order
    pub const ALL: [ClientLimitError; 10] = [
        Self::NoCursors,
        Self::MaxClientInfoLength,
        Self::MaxQueryLength,
        Self::MaxBindCount,
        Self::MaxBindNameLength,
        Self::MaxStringBindValueLength,
        Self::MaxLobBindValueLength,
        Self::DuplicateBindName,
        Self::MaxSelectList,
        Self::ResultSetNotSuspended,
    ];

    /// Look up a wire code, e.g. one received back from a server
    pub fn from_code(code: u64) -> Option<Self> {
        static BY_CODE: Lazy<HashMap<u64, ClientLimitError>> = Lazy::new(|| {
            ClientLimitError::ALL
                .iter()
                .map(|limit| (limit.code(), *limit))
                .collect()
        });
        BY_CODE.get(&code).copied()
    }

    /// The wire error code
    pub const fn code(self) -> u64 {
        match self {
            Self::NoCursors => 900000,
            Self::MaxClientInfoLength => 900001,
            Self::MaxQueryLength => 900002,
            Self::MaxBindCount => 900003,
            Self::MaxBindNameLength => 900004,
            Self::MaxStringBindValueLength => 900005,
            Self::MaxLobBindValueLength => 900006,
            Self::DuplicateBindName => 900007,
            Self::MaxSelectList => 900008,
            Self::ResultSetNotSuspended => 900009,
        }
    }

    /// The canonical message text
    pub const fn message(self) -> &'static str {
        match self {
            Self::NoCursors => {
                "No server-side cursors were available to process the query."
            }
            Self::MaxClientInfoLength => "Maximum client info length exceeded.",
            Self::MaxQueryLength => "Maximum query length exceeded.",
            Self::MaxBindCount => "Maximum bind variable count exceeded.",
            Self::MaxBindNameLength => "Maximum bind variable name length exceeded.",
            Self::MaxStringBindValueLength => {
                "Maximum string bind value length exceeded."
            }
            Self::MaxLobBindValueLength => "Maximum lob bind value length exceeded.",
            Self::DuplicateBindName => "Duplicate bind variable name.",
            Self::MaxSelectList => "Maximum column count exceeded.",
            Self::ResultSetNotSuspended => {
                "The requested result set was not suspended."
            }
        }
    }
}

impl std::fmt::Display for ClientLimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message(), self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_canonical() {
        assert_eq!(ClientLimitError::NoCursors.code(), 900000);
        assert_eq!(ClientLimitError::MaxQueryLength.code(), 900002);
        assert_eq!(ClientLimitError::ResultSetNotSuspended.code(), 900009);
    }

    #[test]
    fn messages_are_canonical() {
        assert_eq!(
            ClientLimitError::MaxQueryLength.message(),
            "Maximum query length exceeded."
        );
        assert_eq!(
            ClientLimitError::DuplicateBindName.message(),
            "Duplicate bind variable name."
        );
    }

    #[test]
    fn code_lookup_round_trips() {
        for limit in ClientLimitError::ALL {
            assert_eq!(ClientLimitError::from_code(limit.code()), Some(limit));
        }
        assert_eq!(ClientLimitError::from_code(900010), None);
        assert_eq!(ClientLimitError::from_code(1064), None);
    }
}
