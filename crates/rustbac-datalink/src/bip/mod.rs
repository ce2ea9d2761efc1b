pub mod bvlc;
pub mod service;
pub mod transport;
