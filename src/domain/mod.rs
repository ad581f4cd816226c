//! Domain model: settlement records, their state machines, and the ports the
//! application layer drives.

pub mod escrow;
pub mod money;
pub mod ports;
pub mod receipt;
pub mod transaction;
