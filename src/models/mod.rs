pub mod message;

pub use message::{
    Attachment, Message, MessageDraft, MessageType, Reactions, DELETED_MESSAGE_TEXT,
};
