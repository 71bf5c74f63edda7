//! Binary layouts exchanged with callers
//!
//! `calculate` is the in-band header prefixed to raw data gathered from several
//! subdevices. `export` is the self-describing envelope used to calculate
//! metric values offline.

pub mod calculate;
pub mod export;
