#![warn(missing_docs)]

//! logging, ini-import and filehandler

#[macro_use]
pub mod conv;
pub mod crypto;
pub mod filehelper;
pub mod ini;
pub mod log;
