//! Server-Sent Events: the `text/event-stream` serializer, a one-way
//! connection with immediate flushing, and a typed broadcast hub.

pub mod connection;
pub mod event;
pub mod hub;
pub mod token;

pub use self::{
    connection::SseConnection,
    event::Event,
    hub::{EventData, Json, SseHub, Text},
    token::CancelToken,
};
