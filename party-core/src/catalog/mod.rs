//! Media Catalog Client
//!
//! REST client for the media server that stores the audio files parties
//! listen to: library listing, uploads, playlists and stream URLs.

mod client;
mod types;

pub use client::{CatalogClient, CatalogError};
pub use types::*;
