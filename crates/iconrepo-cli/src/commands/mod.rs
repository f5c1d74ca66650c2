//! Command handlers

pub mod blobstore;
pub mod check;
pub mod config;
pub mod icon;
pub mod iconfile;
pub mod tag;
