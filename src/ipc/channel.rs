//! Bidirectional, ordered message transport between host and module.
//!
//! Two transports sit behind the same [`Channel`] type:
//! - an in-process queue pair used when the module runs on a host thread
//! - a Unix stream socket used across a process boundary (or a loaded
//!   library that only understands file descriptors)
//!
//! Inbound traffic always lands in a crossbeam queue. For sockets a background
//! reader thread decodes frames into that queue, so `recv` has the same
//! blocking and deadline semantics for every transport.
use crate::config::types::{Result, VmError};
use crate::ipc::message::{Frame, HEADER_LEN, REPLY_FLAG};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// File descriptor number the root socket occupies in a module process.
pub const ROOT_SOCKET_FD: RawFd = 3;

/// Environment variable advertising the root socket to a module process.
pub const ROOT_SOCKET_ENV: &str = "VMHOST_ROOT_SOCKET";

enum Outbound {
    Queue(Mutex<Option<Sender<Result<Frame>>>>),
    Socket(Mutex<UnixStream>),
}

pub struct Channel {
    label: String,
    outbound: Outbound,
    inbound: Receiver<Result<Frame>>,
    closed: AtomicBool,
    next_tag: AtomicU32,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    /// Connected in-process endpoints: `(host, module)`.
    pub fn pair(host_label: &str, module_label: &str) -> (Channel, Channel) {
        let (to_module, module_inbox) = crossbeam_channel::unbounded();
        let (to_host, host_inbox) = crossbeam_channel::unbounded();
        let host = Channel::from_queue(host_label, to_module, host_inbox);
        let module = Channel::from_queue(module_label, to_host, module_inbox);
        (host, module)
    }

    fn from_queue(label: &str, tx: Sender<Result<Frame>>, rx: Receiver<Result<Frame>>) -> Self {
        Self {
            label: label.to_string(),
            outbound: Outbound::Queue(Mutex::new(Some(tx))),
            inbound: rx,
            closed: AtomicBool::new(false),
            next_tag: AtomicU32::new(1),
            reader: Mutex::new(None),
        }
    }

    /// Wrap a connected stream and start its reader thread.
    pub fn from_stream(label: &str, stream: UnixStream) -> Result<Channel> {
        let read_half = stream.try_clone()?;
        let (tx, rx) = crossbeam_channel::unbounded();
        let reader_label = label.to_string();
        let reader = thread::Builder::new()
            .name(format!("chan-{}", label))
            .spawn(move || read_frames(reader_label, read_half, tx))?;

        Ok(Self {
            label: label.to_string(),
            outbound: Outbound::Socket(Mutex::new(stream)),
            inbound: rx,
            closed: AtomicBool::new(false),
            next_tag: AtomicU32::new(1),
            reader: Mutex::new(Some(reader)),
        })
    }

    /// Host endpoint plus the raw peer stream to hand to the module.
    pub fn socket_pair(label: &str) -> Result<(Channel, UnixStream)> {
        let (host, peer) = UnixStream::pair()?;
        Ok((Channel::from_stream(label, host)?, peer))
    }

    /// Adopt an inherited socket descriptor.
    ///
    /// # Safety
    /// `fd` must be an open Unix stream socket owned by nobody else.
    pub unsafe fn from_raw_fd(label: &str, fd: RawFd) -> Result<Channel> {
        Channel::from_stream(label, UnixStream::from_raw_fd(fd))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Tag for a new outbound call. Never 0 and never carries the reply bit.
    pub fn next_tag(&self) -> u32 {
        loop {
            let tag = self.next_tag.fetch_add(1, Ordering::Relaxed) & !REPLY_FLAG;
            if tag != 0 {
                return tag;
            }
        }
    }

    pub fn send(&self, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(self.broken("channel closed"));
        }
        match &self.outbound {
            Outbound::Queue(tx) => {
                let guard = tx.lock().unwrap_or_else(|e| e.into_inner());
                match guard.as_ref() {
                    Some(tx) => tx
                        .send(Ok(frame))
                        .map_err(|_| self.broken("peer endpoint dropped")),
                    None => Err(self.broken("channel closed")),
                }
            }
            Outbound::Socket(stream) => {
                let bytes = frame.encode()?;
                let mut stream = stream.lock().unwrap_or_else(|e| e.into_inner());
                stream
                    .write_all(&bytes)
                    .and_then(|_| stream.flush())
                    .map_err(|e| self.broken(&format!("write failed: {}", e)))
            }
        }
    }

    /// Block until the next inbound frame or peer disconnect.
    pub fn recv(&self) -> Result<Frame> {
        self.recv_deadline(None)?
            .ok_or_else(|| self.broken("receive interrupted"))
    }

    /// Like `recv`, but gives up at `deadline` and returns `Ok(None)`.
    pub fn recv_deadline(&self, deadline: Option<Instant>) -> Result<Option<Frame>> {
        if self.is_closed() {
            return Err(self.broken("channel closed"));
        }
        let item = match deadline {
            None => self
                .inbound
                .recv()
                .map_err(|_| self.broken("peer disconnected"))?,
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(Instant::now());
                match self.inbound.recv_timeout(timeout) {
                    Ok(item) => item,
                    Err(RecvTimeoutError::Timeout) => return Ok(None),
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(self.broken("peer disconnected"))
                    }
                }
            }
        };
        if self.is_closed() {
            return Err(self.broken("channel closed"));
        }
        item.map(Some)
    }

    /// Tear down this endpoint. The peer observes a disconnect.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        match &self.outbound {
            Outbound::Queue(tx) => {
                let mut guard = tx.lock().unwrap_or_else(|e| e.into_inner());
                guard.take();
            }
            Outbound::Socket(stream) => {
                let stream = stream.lock().unwrap_or_else(|e| e.into_inner());
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
        log::debug!("Channel {} closed", self.label);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn broken(&self, reason: &str) -> VmError {
        VmError::ChannelBroken(format!("{}: {}", self.label, reason))
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
        let reader = self
            .reader
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = reader {
            let _ = handle.join();
        }
    }
}

/// Reader loop for socket transports. Ends on EOF, read error or bad header.
fn read_frames(label: String, mut stream: UnixStream, tx: Sender<Result<Frame>>) {
    let mut header = [0u8; HEADER_LEN];
    loop {
        if let Err(e) = stream.read_exact(&mut header) {
            log::debug!("Channel {} reader stopped: {}", label, e);
            return;
        }
        let (len, id, tag) = match Frame::decode_header(&header) {
            Ok(parts) => parts,
            Err(e) => {
                log::error!("Channel {} received malformed frame: {}", label, e);
                let _ = tx.send(Err(e));
                return;
            }
        };
        let mut payload = vec![0u8; len];
        if let Err(e) = stream.read_exact(&mut payload) {
            log::warn!("Channel {} lost peer mid-frame: {}", label, e);
            return;
        }
        if tx.send(Ok(Frame { id, tag, payload })).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::message::MAX_PAYLOAD;
    use std::time::Duration;

    fn assert_fifo(a: &Channel, b: &Channel) {
        for i in 1..=3u32 {
            a.send(Frame::one_way(i, vec![i as u8])).unwrap();
        }
        for i in 1..=3u32 {
            let frame = b.recv().unwrap();
            assert_eq!(frame.id, i);
            assert_eq!(frame.payload, vec![i as u8]);
        }
    }

    #[test]
    fn test_queue_preserves_send_order() {
        let (host, module) = Channel::pair("host", "module");
        assert_fifo(&host, &module);
        assert_fifo(&module, &host);
    }

    #[test]
    fn test_socket_preserves_send_order() {
        let (host, peer) = Channel::socket_pair("host").unwrap();
        let module = Channel::from_stream("module", peer).unwrap();
        assert_fifo(&host, &module);
        assert_fifo(&module, &host);
    }

    #[test]
    fn test_queue_peer_drop_breaks_channel() {
        let (host, module) = Channel::pair("host", "module");
        drop(module);
        assert!(matches!(host.recv(), Err(VmError::ChannelBroken(_))));
        assert!(matches!(
            host.send(Frame::one_way(1, Vec::new())),
            Err(VmError::ChannelBroken(_))
        ));
    }

    #[test]
    fn test_socket_peer_close_breaks_channel() {
        let (host, peer) = Channel::socket_pair("host").unwrap();
        let module = Channel::from_stream("module", peer).unwrap();
        module.close();
        assert!(matches!(host.recv(), Err(VmError::ChannelBroken(_))));
    }

    #[test]
    fn test_recv_deadline_times_out() {
        let (host, _module) = Channel::pair("host", "module");
        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(host.recv_deadline(Some(deadline)).unwrap().is_none());
    }

    #[test]
    fn test_closed_endpoint_rejects_traffic() {
        let (host, module) = Channel::pair("host", "module");
        host.close();
        assert!(host.is_closed());
        assert!(host.send(Frame::one_way(1, Vec::new())).is_err());
        assert!(matches!(module.recv(), Err(VmError::ChannelBroken(_))));
    }

    #[test]
    fn test_malformed_socket_header_is_protocol_violation() {
        let (host, mut peer) = Channel::socket_pair("host").unwrap();
        let mut header = [0u8; HEADER_LEN];
        header[..4].copy_from_slice(&u32::MAX.to_le_bytes());
        peer.write_all(&header).unwrap();
        assert!(matches!(host.recv(), Err(VmError::Protocol(_))));
    }

    #[test]
    fn test_oversized_frame_is_refused_and_channel_survives() {
        let (host, peer) = Channel::socket_pair("host").unwrap();
        let module = Channel::from_stream("module", peer).unwrap();
        let big = Frame::one_way(1, vec![0u8; MAX_PAYLOAD + 1]);
        assert!(matches!(host.send(big), Err(VmError::PayloadTooLarge(_))));

        host.send(Frame::one_way(2, b"ok".to_vec())).unwrap();
        assert_eq!(module.recv().unwrap().id, 2);
    }

    #[test]
    fn test_tags_skip_zero_and_reply_bit() {
        let (host, _module) = Channel::pair("host", "module");
        host.next_tag.store(REPLY_FLAG - 1, Ordering::Relaxed);
        let a = host.next_tag();
        let b = host.next_tag();
        assert_eq!(a, REPLY_FLAG - 1);
        assert_ne!(b, 0);
        assert_eq!(b & REPLY_FLAG, 0);
    }
}
