// src/lib.rs

//! chanwatch Library

pub mod client;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod storage;
