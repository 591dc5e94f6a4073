//! Response shaping helpers.
//!
//! Stateless functions that turn a payload into a correctly-shaped HTTP
//! response: status, content headers, caching and compression policy. The
//! server's handlers call these; nothing here touches the network.

pub mod responder;

pub use responder::{
    forbidden, send_audio, send_binary, send_image, send_json, send_text, ImageFormat,
    ResponderError,
};
