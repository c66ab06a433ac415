pub mod hash;
pub mod sos;
