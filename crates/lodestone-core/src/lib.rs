//! # Lodestone Core
//!
//! Runtime-free logic shared by every Lodestone backend and service:
//! data models and the metadata codec, chunkers, hybrid fusion, highlight
//! excerpts, query expansion, vector math and the [`Embedder`] trait, the
//! three backend contracts, and in-memory backends.
//!
//! This crate has no tokio, sqlx, or network dependencies. Persistent
//! backends and the HTTP provider stack live in the `lodestone` crate.
//!
//! [`Embedder`]: embedding::Embedder

pub mod chunk;
pub mod embedding;
pub mod expansion;
pub mod fusion;
pub mod highlight;
pub mod models;
pub mod store;
