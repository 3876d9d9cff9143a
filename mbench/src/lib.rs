// TODO add a column-store backend next to the in-memory one
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// this one appears to suggest invalid changes
#![allow(clippy::significant_drop_tightening)]

pub mod backend;
pub mod client;
pub mod executor;
pub mod protocol;
pub mod record;
pub mod server;
pub mod session;
pub mod value;
pub mod worker;
pub mod workload;
