pub mod mailbox;

pub use mailbox::{CloseReason, FrameMailbox, MailboxStats, Publish, WakePolicy};
