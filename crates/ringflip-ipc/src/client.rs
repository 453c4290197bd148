//! Producer-side control-channel client.

use crate::channel::{Receiver, Sender};
use crate::error::WireError;
use crate::message::{app_id_bytes, ConnectMessage, ControlMessage};
use ringflip::{ShmFile, ShmWriter};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Name of the daemon's receiver socket inside the channel directory.
pub const DAEMON_RECEIVER_NAME: &str = "logging.datarouter_recv";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Serves the daemon's acquire requests for one producer region.
///
/// Single-threaded by construction: one receiver, one thread calling
/// [`serve`](Self::serve), which is also the only caller of the writer's
/// switch operation.
pub struct MessageClient {
    writer: Arc<ShmWriter>,
    receiver: Receiver,
    sender: Sender,
    identity: ConnectMessage,
    shm_path: PathBuf,
    first_message_received: bool,
    stop: Arc<AtomicBool>,
}

impl MessageClient {
    /// Binds the client receiver, connects to the daemon and advertises the
    /// region.
    ///
    /// `channel_dir` holds the socket files (production: `/tmp`);
    /// `shm_file` is what the region factory returned.
    pub fn connect(
        channel_dir: impl Into<PathBuf>,
        app_id: &str,
        writer: Arc<ShmWriter>,
        shm_file: &ShmFile,
    ) -> Result<Self, WireError> {
        let channel_dir = channel_dir.into();

        let use_dynamic_id = shm_file.identifier.starts_with("logging-");
        let mut random_suffix = [0u8; 6];
        if use_dynamic_id {
            let suffix = &shm_file.identifier["logging-".len()..];
            random_suffix.copy_from_slice(suffix.as_bytes());
        }
        // Safety: getuid never fails.
        let uid = unsafe { libc::getuid() };
        let identity = ConnectMessage {
            app_id: app_id_bytes(app_id),
            uid,
            use_dynamic_id,
            random_suffix,
        };

        let receiver = Receiver::bind(channel_dir.join(&shm_file.identifier))?;
        receiver.set_poll_interval(POLL_INTERVAL)?;

        let sender = Sender::connect(channel_dir.join(DAEMON_RECEIVER_NAME))?;
        sender.send(&ControlMessage::Connect(identity))?;

        Ok(Self {
            writer,
            receiver,
            sender,
            identity,
            shm_path: shm_file.path.clone(),
            first_message_received: false,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag that makes [`serve`](Self::serve) return.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// The identity advertised to the daemon.
    pub fn identity(&self) -> &ConnectMessage {
        &self.identity
    }

    /// Serves acquire requests until stopped; detaches the writer on exit.
    pub fn serve(mut self) {
        while !self.stop.load(Ordering::Relaxed) {
            match self.receiver.recv() {
                Ok(Some((message, _pid))) => self.handle(&message),
                Ok(None) => {}
                Err(_) => break,
            }
        }
        self.writer.detach();
    }

    /// Handles one daemon message; exposed for single-step tests.
    pub fn serve_one(&mut self) -> Result<bool, WireError> {
        match self.receiver.recv()? {
            Some((message, _pid)) => {
                self.handle(&message);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn handle(&mut self, message: &ControlMessage) {
        if !self.first_message_received {
            self.first_message_received = true;
            // The daemon has the region open; unlink so a crash of this
            // process cannot leak the file.
            let _ = std::fs::remove_file(&self.shm_path);
        }

        if matches!(message, ControlMessage::AcquireRequest) {
            let grant = self.writer.switch_for_read();
            let _ = self
                .sender
                .send(&ControlMessage::AcquireResponse(grant));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringflip::{ReaderFactory, WriterFactory, MAX_PAYLOAD_BYTES};

    const RING_LEN: u32 = 2 * (MAX_PAYLOAD_BYTES as u32 + 14);

    #[test]
    fn connect_then_acquire_handshake() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = Receiver::bind(dir.path().join(DAEMON_RECEIVER_NAME)).unwrap();

        let factory = WriterFactory::new(dir.path());
        let (writer, shm_file) = factory.create(RING_LEN, true, "").unwrap();
        let writer = Arc::new(writer);

        writer
            .write_record(5, 1, 5, |p| p.copy_from_slice(b"hello"))
            .unwrap();

        let mut client =
            MessageClient::connect(dir.path(), "MYAP", Arc::clone(&writer), &shm_file).unwrap();

        let (message, pid) = daemon.recv().unwrap().expect("connect message");
        let ControlMessage::Connect(connect) = message else {
            panic!("expected Connect, got {message:?}");
        };
        assert_eq!(pid, std::process::id());
        assert_eq!(connect.identifier(), shm_file.identifier);

        // Open the region before the client unlinks it.
        let mut reader =
            ReaderFactory::open(&shm_file.path, pid).expect("open advertised region");

        let daemon_sender = Sender::connect(dir.path().join(connect.identifier())).unwrap();
        daemon_sender.send(&ControlMessage::AcquireRequest).unwrap();

        assert!(client.serve_one().unwrap(), "request was pending");
        // First daemon message makes the client unlink the region file.
        assert!(!shm_file.path.exists());

        let (message, _) = daemon.recv().unwrap().expect("acquire response");
        let ControlMessage::AcquireResponse(grant) = message else {
            panic!("expected AcquireResponse, got {message:?}");
        };

        assert_eq!(reader.arm(grant), Some(5 + 10 + 4));
        let mut payloads = Vec::new();
        reader.drain(|_| {}, |record| payloads.push(record.payload.to_vec()));
        assert_eq!(payloads, vec![b"hello".to_vec()]);
    }
}
