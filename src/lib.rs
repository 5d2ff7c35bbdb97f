//! briefkasten - a local IMAP mirror.
//!
//! The sync engine keeps a server-side mailbox coherent with a local
//! triple-store: a transaction-stamped metadata database, an FTS5 fulltext
//! index, and raw RFC822 files on disk. After every folder sync the
//! composite versioning layer publishes an immutable snapshot linking the
//! two stores' generations, so historical states of the whole mirror can
//! be queried.

pub mod account;
pub mod composite;
pub mod config;
pub mod constants;
pub mod index;
pub mod mail;
pub mod store;
pub mod sync;

pub use account::Account;
pub use composite::{Composite, CompositeSnapshot, CompositeView};
pub use config::Config;
pub use index::{SearchFilter, SearchHit};
pub use mail::{ImapGateway, MailSource, MessageFlags};
pub use store::{MessageKey, MessageRecord};
pub use sync::{detect_changes, ChangeSet, SyncOutcome};
