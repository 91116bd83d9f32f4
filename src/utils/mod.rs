pub mod artifact;
pub mod formatters;
pub mod sos;
