//! Core data types shared by the broker and its clients

pub mod message;

pub use message::Message;
