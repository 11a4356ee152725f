pub mod caller;
pub mod quota;
