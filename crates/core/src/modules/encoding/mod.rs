//! Text and binary encodings.

pub mod base64;
pub mod hex;
pub mod json;
pub mod yaml;
