pub mod broker;
pub mod raw;
