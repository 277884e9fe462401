pub mod app;
pub mod archive;
pub mod batcher;
pub mod codec;
pub mod config;
pub mod converter;
pub mod domain;
pub mod error;
pub mod fs_util;
pub mod issues;
pub mod ledger;
pub mod manifest;
pub mod nifti;
pub mod output;
pub mod reclaim;
pub mod relocate;
pub mod slices;
pub mod store;
pub mod verify;
