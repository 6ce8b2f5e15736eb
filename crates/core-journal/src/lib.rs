//! Tether Core Journal: durable record of undelivered broker messages
//!
//! # Overview
//!
//! When a message cannot be sent it is appended to the delivery log of the
//! connection it was meant for. After the connection recovers, the backlog is
//! replayed in order from the position recorded in the replay manifest.
//!
//! # On-disk layout
//!
//! ```text
//! <location>/
//! ├── manifest.log              ← one line per connection, rewritten atomically
//! ├── orders.delivery.log       ← append-only, one line per undelivered message
//! └── billing.delivery.log
//! ```
//!
//! Every line is `<timestamp> <level> <logName> <json-object>`.
//!
//! # Example
//!
//! ```no_run
//! use tether_core_journal::DeliveryLog;
//! use serde_json::Map;
//!
//! let log = DeliveryLog::initialize("/var/lib/tether/delivery-log", ["orders"])?;
//! log.append("orders", &Map::new(), &Map::new())?;
//!
//! let start = log.pointer("orders");
//! for entry in log.stream_from("orders", start)? {
//!     let entry = entry?;
//!     println!("replaying {:?}", entry.message);
//! }
//! # Ok::<(), tether_core_journal::JournalError>(())
//! ```

pub mod error;
pub mod journal;
pub mod manifest;
pub mod record;

pub use error::{JournalError, Result};
pub use journal::{BacklogStatus, DeliveryLog, EntryStream, Settled};
pub use manifest::{Manifest, MANIFEST_FILE_NAME};
pub use record::{DeliveryLogEntry, ManifestEntry};
