//! Region files: naming, creation, opening, mmap lifetime.

use crate::error::ShmError;
use crate::layout::{RegionHeader, LAYOUT_VERSION, REGION_MAGIC};
use crate::reader::ShmReader;
use crate::record::{LEN_PREFIX_BYTES, MAX_PAYLOAD_BYTES, RECORD_HEADER_BYTES};
use crate::ring::RawRing;
use crate::writer::ShmWriter;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

const FILE_SUFFIX: &str = ".shmem";
const DYNAMIC_SUFFIX_LEN: usize = 6;
// Owner read/write, group and others read-only.
const FILE_MODE: u32 = 0o644;

/// Smallest half that can hold one maximum-sized record.
const MIN_HALF_LEN: u32 = (MAX_PAYLOAD_BYTES + RECORD_HEADER_BYTES + LEN_PREFIX_BYTES) as u32;

/// A mapped region; unmapped on drop.
#[derive(Debug)]
pub(crate) struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: the mapping is just an address range; access discipline lives in
// the ring protocol.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    fn map(file: &File, len: usize, writable: bool) -> Result<Self, ShmError> {
        let prot = if writable {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_READ
        };
        // Safety: len is non-zero and the fd is a regular file of that size.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                prot,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(ShmError::Io(std::io::Error::last_os_error()));
        }
        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or(ShmError::Misaligned)?;
        if (ptr.as_ptr() as usize) % std::mem::align_of::<RegionHeader>() != 0 {
            // Safety: freshly mapped above.
            unsafe {
                libc::munmap(ptr.as_ptr().cast(), len);
            }
            return Err(ShmError::Misaligned);
        }
        Ok(Self { ptr, len })
    }

    fn ring(&self, half_len: u32) -> RawRing {
        let header = self.ptr.cast::<RegionHeader>();
        let halves = [
            // Safety: offsets are within the mapping by construction.
            unsafe {
                NonNull::new_unchecked(
                    self.ptr.as_ptr().add(RegionHeader::half_offset(0, half_len)),
                )
            },
            unsafe {
                NonNull::new_unchecked(
                    self.ptr.as_ptr().add(RegionHeader::half_offset(1, half_len)),
                )
            },
        ];
        // Safety: the mapping covers header plus both halves (validated by
        // the factories) and outlives the ring inside ShmWriter/ShmReader.
        unsafe { RawRing::new(header, halves, half_len) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // Safety: ptr/len came from a successful mmap.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

/// Name and identity of a created region file.
#[derive(Debug, Clone)]
pub struct ShmFile {
    /// Full path of the region file.
    pub path: PathBuf,
    /// Receiver-name stem (`logging.<APP>.<UID>` or `logging-<suffix>`),
    /// shared with the control channel.
    pub identifier: String,
}

/// Creates producer-side regions.
pub struct WriterFactory {
    base_dir: PathBuf,
}

impl WriterFactory {
    /// Region files go to `base_dir` (production: `/tmp`).
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Creates, sizes and maps a fresh region file.
    ///
    /// `ring_len` is the total payload capacity (split into two halves);
    /// each half must hold at least one maximum-sized record. With
    /// `dynamic` the file gets a random identity, otherwise the
    /// deterministic `logging.<APP>.<UID>` name (pre-unlinking any stale
    /// file from a crashed predecessor).
    pub fn create(
        &self,
        ring_len: u32,
        dynamic: bool,
        app_id: &str,
    ) -> Result<(ShmWriter, ShmFile), ShmError> {
        let half_len = ring_len / 2;
        if half_len < MIN_HALF_LEN {
            return Err(ShmError::InvalidRingSize {
                ring_len,
                min_half: MIN_HALF_LEN,
            });
        }

        let (file, shm_file) = if dynamic {
            self.create_dynamic()?
        } else {
            self.create_static(app_id)?
        };

        let total = RegionHeader::region_len(half_len);
        file.set_len(total as u64)?;
        // The create mode passes through the umask; force the final bits.
        std::fs::set_permissions(&shm_file.path, std::fs::Permissions::from_mode(FILE_MODE))?;

        let mapping = Mapping::map(&file, total, true)?;
        // Safety: the mapping is fresh, writable, large enough, and aligned.
        unsafe {
            mapping
                .ptr
                .cast::<RegionHeader>()
                .as_ptr()
                .write(RegionHeader::new(std::process::id(), half_len));
        }

        let ring = mapping.ring(half_len);
        Ok((ShmWriter::new(ring, mapping), shm_file))
    }

    fn create_static(&self, app_id: &str) -> Result<(File, ShmFile), ShmError> {
        // Safety: getuid never fails.
        let uid = unsafe { libc::getuid() };
        let identifier = format!("logging.{app_id}.{uid}");
        let path = self.base_dir.join(format!("{identifier}{FILE_SUFFIX}"));

        // A stale file from a crashed predecessor must not be reopened in
        // place; unlink lets any process still mapping it finish undisturbed.
        if path.exists() {
            let _ = std::fs::remove_file(&path);
        }

        let file = open_exclusive(&path)?;
        Ok((file, ShmFile { path, identifier }))
    }

    fn create_dynamic(&self) -> Result<(File, ShmFile), ShmError> {
        // A handful of attempts is plenty for a 62^6 namespace.
        for _ in 0..16 {
            let suffix: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(DYNAMIC_SUFFIX_LEN)
                .map(char::from)
                .collect();
            let identifier = format!("logging-{suffix}");
            let path = self.base_dir.join(format!("{identifier}{FILE_SUFFIX}"));
            match open_exclusive(&path) {
                Ok(file) => return Ok((file, ShmFile { path, identifier })),
                Err(ShmError::Io(err)) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(err) => return Err(err),
            }
        }
        Err(ShmError::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "could not find a free dynamic region name",
        )))
    }
}

fn open_exclusive(path: &Path) -> Result<File, ShmError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .mode(FILE_MODE)
        .custom_flags(libc::O_CLOEXEC)
        .open(path)
        .map_err(ShmError::Io)
}

/// Opens daemon-side read-only views of producer regions.
pub struct ReaderFactory;

impl ReaderFactory {
    /// Opens and validates the region a `Connect` advertised.
    ///
    /// The file must carry the expected magic, layout version and producer
    /// pid; the recorded half length must fit inside the file.
    pub fn open(path: &Path, expected_pid: u32) -> Result<ShmReader, ShmError> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let header_len = std::mem::size_of::<RegionHeader>() as u64;
        if file_len < header_len {
            return Err(ShmError::FileTooSmall {
                file_len,
                required: header_len,
            });
        }

        let mapping = Mapping::map(&file, file_len as usize, false)?;
        // Safety: the mapping is at least header-sized and aligned.
        let header = unsafe { mapping.ptr.cast::<RegionHeader>().as_ref() };

        let magic = header.magic.load(Ordering::Acquire);
        if magic != REGION_MAGIC {
            return Err(ShmError::BadMagic { found: magic });
        }
        if header.version != LAYOUT_VERSION {
            return Err(ShmError::VersionMismatch {
                found: header.version,
            });
        }
        if header.producer_pid != expected_pid {
            return Err(ShmError::PidMismatch {
                found: header.producer_pid,
                expected: expected_pid,
            });
        }

        let half_len = header.half_len;
        let required = RegionHeader::region_len(half_len) as u64;
        if file_len < required {
            return Err(ShmError::FileTooSmall { file_len, required });
        }

        let ring = mapping.ring(half_len);
        Ok(ShmReader::new(ring, mapping))
    }
}
