//! Lock-free alternating (double-buffered) shared-memory record transport.
//!
//! A producer process owns a mapped region file with two equal buffer halves.
//! Its threads append length-prefixed records to the active half with a
//! wait-free reservation protocol; a single reader daemon asks the producer
//! (over an out-of-band control channel) to switch halves and then drains the
//! retired half without any locks. A sticky detach flag lets the daemon drain
//! post-mortem data after the producer stopped writing.
//!
//! ```ignore
//! let factory = WriterFactory::new("/tmp");
//! let (writer, shm_file) = factory.create(8 << 20, false, "MYAP")?;
//! let type_id = writer.try_register_type(b"...registration bytes...")?;
//! writer.write_record_now(type_id, 16, |payload| payload.fill(0))?;
//!
//! // Daemon side, after a Connect advertised `shm_file.path`:
//! let mut reader = ReaderFactory::open(&shm_file.path, producer_pid)?;
//! // ... acquire handshake yields a grant ...
//! reader.arm(grant);
//! reader.drain(|registration| { /* type table */ }, |record| { /* route */ });
//! ```

pub mod error;
mod invariants;
pub mod layout;
pub mod mapping;
pub mod reader;
pub mod record;
pub mod ring;
pub mod writer;

// Re-export main types
pub use error::{ShmError, WriteError};
pub use layout::{RegionHeader, LAYOUT_VERSION, REGION_MAGIC};
pub use mapping::{ReaderFactory, ShmFile, WriterFactory};
pub use reader::ShmReader;
pub use record::{
    RecordHeader, SharedRecord, TypeId, TypeRegistration, LEN_PREFIX_BYTES, MAX_PAYLOAD_BYTES,
    RECORD_HEADER_BYTES, REGISTRATION_TYPE_ID,
};
pub use ring::AcquireGrant;
pub use writer::ShmWriter;
