//! Wire messages and their tag-dispatched binary codec

pub mod message;

pub use message::{
    Message, NodeRequest, NodeResponse, StructuralChange, SubmitResponse, CUSTOM_TAG_BASE,
};
