//! # stormware-gsheets
//!
//! Google Sheets connector. A sheet is read as a [`stormware_core::Table`]
//! whose first row is the header, and written back with per-column
//! alignment and number formats.

pub mod spreadsheet;

pub use spreadsheet::{format_request, GridProperties, GridRange, Spreadsheet};
