//! Driver registry
//!
//! Explicit dispatch from a configured driver name to a connection.
//! Backend drivers are separate builds; asking for one that is not
//! compiled in fails with a clear error rather than a dlopen attempt.

use crate::error::{DriverError, DriverResult};
use crate::stub::StubDriver;
use crate::traits::DriverConnection;

/// Known backend kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    Oracle,
    Db2,
    Mysql,
    Postgresql,
    Firebird,
    Informix,
    Odbc,
    Stub,
}

impl DriverKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "oracle" => Some(Self::Oracle),
            "db2" => Some(Self::Db2),
            "mysql" => Some(Self::Mysql),
            "postgresql" | "postgres" => Some(Self::Postgresql),
            "firebird" => Some(Self::Firebird),
            "informix" => Some(Self::Informix),
            "odbc" => Some(Self::Odbc),
            "stub" => Some(Self::Stub),
            _ => None,
        }
    }
}

/// Instantiate a driver connection by configured name
pub fn open_driver(name: &str) -> DriverResult<Box<dyn DriverConnection>> {
    match DriverKind::from_name(name) {
        Some(DriverKind::Stub) => Ok(Box::new(StubDriver::new())),
        Some(kind) => Err(DriverError::recoverable(
            0,
            "IM002",
            format!("driver '{:?}' is not compiled into this build", kind),
        )),
        None => Err(DriverError::recoverable(
            0,
            "IM002",
            format!("unknown driver '{}'", name),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_resolves() {
        assert!(open_driver("stub").is_ok());
        assert!(open_driver("STUB").is_ok());
    }

    #[test]
    fn known_but_uncompiled_drivers_refuse() {
        let err = open_driver("oracle").unwrap_err();
        assert_eq!(err.sqlstate, "IM002");
    }

    #[test]
    fn unknown_driver_refuses() {
        let err = open_driver("sybase").unwrap_err();
        assert!(err.message.contains("unknown driver"));
    }
}
