//! Backend driver contract
//!
//! The seam that keeps the core driver-agnostic: a connection trait, a
//! cursor trait, a portable type enum, and a capability map queried at
//! log-in time. Real backends (Oracle, DB2, MySQL, PostgreSQL, ...) live
//! out of tree; the core ships only the stub driver used for tests and
//! bring-up.

mod error;
mod registry;
pub mod stub;
mod traits;
mod types;

pub use error::{DriverError, DriverResult};
pub use registry::{open_driver, DriverKind};
pub use stub::{StubBehavior, StubDriver, StubTable};
pub use traits::{BindFormat, DriverCapabilities, DriverConnection, DriverCursor};
pub use types::{ColumnInfo, ColumnType, Field, Row};

pub use sqlrelay_protocol::binds::{BindValue, DateTimeTz};
