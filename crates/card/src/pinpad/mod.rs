//! PIN-pad reader support: feature probing and direct-PIN frame encoding

pub mod features;
pub mod frame;
