//! Session bookkeeping: translating external session keys into stable
//! thread ids, rotating conversations, and archiving rotated transcripts.

pub mod archive;
pub mod manager;

pub use archive::{ArchiveRecord, ArchiveWriter};
pub use manager::{SessionManager, SessionState};
