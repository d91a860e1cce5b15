#![warn(future_incompatible, nonstandard_style, rust_2018_idioms, unused)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::wildcard_imports,
    clippy::similar_names,
    clippy::cast_possible_truncation,
    clippy::too_many_lines
)]

mod client;
mod connection;
pub mod error;
pub mod flags;
pub mod flow;
pub mod frame;
pub mod hpack;
pub mod huffman;
mod request;
mod response;
pub mod settings;
mod stream;
mod stream_coordinator;
pub mod types;

pub use bytes::Bytes;
pub use client::Client;
pub use connection::{Connection, ConnectionConfig, PushPromise, ResponseHandle};
pub use error::{ConnectionError, Error, StreamError};
pub use request::{Method, Request};
pub use response::Response;
pub use types::ErrorCode;
pub use url::Url;
