mod ipam;

pub use ipam::*;
