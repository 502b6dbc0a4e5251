pub mod audio;
pub mod events;
pub mod items;
pub mod session;

pub use audio::{AudioFormat, ServerVadTurnDetection, TranscriptionModel, TurnDetection, Voice};
pub use events::{ClientEvent, ServerEvent};
pub use items::{Content, Item, MessageItem, MessageRole};
pub use session::Session;
