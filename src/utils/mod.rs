pub mod idgen;
pub mod logging;
