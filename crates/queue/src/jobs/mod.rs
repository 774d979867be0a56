//! Job definitions.

#![allow(missing_docs)]

mod delivery;

pub use delivery::{DeliveryJob, JobDecodeError};
