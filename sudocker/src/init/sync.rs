//! Typed, length-prefixed sync messages exchanged between the orchestrator
//! (parent) and the containerized init process (child) over a
//! `SOCK_SEQPACKET` socketpair, with optional file-descriptor passing via
//! `SCM_RIGHTS`.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{
    recvmsg, sendmsg, socketpair, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags,
    SockFlag, SockType,
};
use serde::{Deserialize, Serialize};
use sudocker_shared::{SudockerError, SudockerResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SyncMessage {
    #[serde(rename = "procReady")]
    Ready,
    #[serde(rename = "procRun")]
    Run,
    #[serde(rename = "procHooks")]
    Hooks,
    #[serde(rename = "procHooksDone")]
    HooksDone,
    #[serde(rename = "procMountPlease")]
    MountPlease { source: String, target: String },
    #[serde(rename = "procMountFd")]
    MountFd,
    #[serde(rename = "procError")]
    Error { message: String },
}

impl SyncMessage {
    pub fn into_result(self) -> SudockerResult<SyncMessage> {
        match self {
            SyncMessage::Error { message } => Err(SudockerError::Internal(message)),
            other => Ok(other),
        }
    }
}

/// One end of the sync socketpair.
pub struct SyncChannel {
    fd: OwnedFd,
}

impl SyncChannel {
    /// Creates a connected pair: index 0 is conventionally kept by the
    /// parent, index 1 is inherited by the child across `clone`.
    pub fn pair() -> SudockerResult<(SyncChannel, SyncChannel)> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .map_err(|e| SudockerError::syscall("socketpair", e))?;
        Ok((SyncChannel { fd: a }, SyncChannel { fd: b }))
    }

    pub fn from_owned_fd(fd: OwnedFd) -> Self {
        Self { fd }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn into_owned_fd(self) -> OwnedFd {
        self.fd
    }

    pub fn write(&self, msg: &SyncMessage) -> SudockerResult<()> {
        let data = serde_json::to_vec(msg)?;
        let iov = [std::io::IoSlice::new(&data)];
        sendmsg::<()>(self.fd.as_raw_fd(), &iov, &[], MsgFlags::empty(), None)
            .map_err(|e| SudockerError::syscall("sendmsg", e))?;
        Ok(())
    }

    /// Sends a message alongside an open file descriptor via `SCM_RIGHTS`.
    pub fn write_with_fd(&self, msg: &SyncMessage, fd: RawFd) -> SudockerResult<()> {
        let data = serde_json::to_vec(msg)?;
        let iov = [std::io::IoSlice::new(&data)];
        let fds = [fd];
        let cmsg = [ControlMessage::ScmRights(&fds)];
        sendmsg::<()>(self.fd.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)
            .map_err(|e| SudockerError::syscall("sendmsg", e))?;
        Ok(())
    }

    pub fn read(&self) -> SudockerResult<SyncMessage> {
        let (msg, _fd) = self.read_maybe_fd()?;
        Ok(msg)
    }

    /// Reads one message, returning any file descriptor passed alongside
    /// it via `SCM_RIGHTS`.
    pub fn read_maybe_fd(&self) -> SudockerResult<(SyncMessage, Option<OwnedFd>)> {
        let mut buf = [0u8; 4096];
        let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
        let mut iov = [std::io::IoSliceMut::new(&mut buf)];

        let result = recvmsg::<()>(
            self.fd.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::empty(),
        )
        .map_err(|e| SudockerError::syscall("recvmsg", e))?;

        if result.bytes == 0 {
            return Err(SudockerError::Internal("sync channel closed unexpectedly".into()));
        }

        let msg: SyncMessage = serde_json::from_slice(&buf[..result.bytes])?;

        let mut fd = None;
        for cmsg in result.cmsgs().map_err(|e| SudockerError::syscall("recvmsg cmsgs", e))? {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                if let Some(raw) = fds.into_iter().next() {
                    fd = Some(unsafe { OwnedFd::from_raw_fd(raw) });
                }
            }
        }

        Ok((msg, fd))
    }

    /// Reads a message and asserts it is of the expected shape, erroring
    /// on anything else including `procError` (mirroring the "unexpected
    /// message type is fatal" rule).
    pub fn expect(&self, matches: impl Fn(&SyncMessage) -> bool, what: &str) -> SudockerResult<SyncMessage> {
        let msg = self.read()?;
        if let SyncMessage::Error { message } = &msg {
            return Err(SudockerError::Internal(format!("child reported error: {message}")));
        }
        if !matches(&msg) {
            return Err(SudockerError::Internal(format!("unexpected sync message, wanted {what}")));
        }
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn pair_round_trips_a_plain_message() {
        let (a, b) = SyncChannel::pair().unwrap();
        a.write(&SyncMessage::Ready).unwrap();
        let got = b.expect(|m| matches!(m, SyncMessage::Ready), "procReady").unwrap();
        assert!(matches!(got, SyncMessage::Ready));
    }

    #[test]
    fn expect_surfaces_a_procerror_as_internal() {
        let (a, b) = SyncChannel::pair().unwrap();
        a.write(&SyncMessage::Error { message: "boom".into() }).unwrap();
        let err = b.expect(|m| matches!(m, SyncMessage::Ready), "procReady").unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn expect_rejects_a_mismatched_message_type() {
        let (a, b) = SyncChannel::pair().unwrap();
        a.write(&SyncMessage::Run).unwrap();
        let err = b.expect(|m| matches!(m, SyncMessage::Ready), "procReady").unwrap_err();
        assert!(err.to_string().contains("procReady"));
    }

    #[test]
    fn into_result_converts_error_variant_only() {
        assert!(SyncMessage::Ready.into_result().is_ok());
        assert!(SyncMessage::Error { message: "x".into() }.into_result().is_err());
    }

    #[test]
    fn write_with_fd_passes_a_duplicable_descriptor() {
        let (a, b) = SyncChannel::pair().unwrap();
        let tmp = tempfile::tempfile().unwrap();
        a.write_with_fd(&SyncMessage::MountFd, tmp.as_raw_fd()).unwrap();
        let (msg, fd) = b.read_maybe_fd().unwrap();
        assert!(matches!(msg, SyncMessage::MountFd));
        assert!(fd.is_some());
    }
}
