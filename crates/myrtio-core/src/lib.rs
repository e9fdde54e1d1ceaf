#![no_std]

//! Shared device plumbing: record storage on NOR flash, a small HTTP client
//! and embassy-net helpers.

pub mod http;
pub mod net;
pub mod storage;
