//! File-descriptor passing over a connected Unix-domain socket.
//!
//! Both directions use `SCM_RIGHTS` ancillary data attached to a two-byte
//! dummy payload; most kernels refuse ancillary-only messages. Received
//! descriptors are owned immediately by a close-on-drop handle.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{
    recvmsg, sendmsg, socketpair, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags,
    SockFlag, SockType, UnixAddr,
};
use tokio::io::Interest;
use tokio::net::UnixStream;

use crate::error::ProtocolError;

/// The dummy payload carried alongside the descriptor.
const FD_PAYLOAD: &[u8; 2] = b"xy";

fn errno_to_io(e: nix::errno::Errno) -> std::io::Error {
    std::io::Error::from_raw_os_error(e as i32)
}

/// Send one descriptor over `stream`.
pub async fn send_fd(stream: &UnixStream, fd: &impl AsRawFd) -> Result<(), ProtocolError> {
    let raw = fd.as_raw_fd();
    stream
        .async_io(Interest::WRITABLE, || {
            let iov = [IoSlice::new(FD_PAYLOAD)];
            let fds = [raw];
            let cmsg = [ControlMessage::ScmRights(&fds)];
            sendmsg::<UnixAddr>(
                stream.as_raw_fd(),
                &iov,
                &cmsg,
                MsgFlags::empty(),
                None,
            )
            .map(|_| ())
            .map_err(errno_to_io)
        })
        .await
        .map_err(|e| ProtocolError::io("sending file descriptor", e))
}

/// Receive one descriptor from `stream`.
pub async fn receive_fd(stream: &UnixStream) -> Result<OwnedFd, ProtocolError> {
    let raw: RawFd = stream
        .async_io(Interest::READABLE, || {
            let mut payload = [0u8; FD_PAYLOAD.len()];
            let mut iov = [IoSliceMut::new(&mut payload)];
            let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);
            let msg = recvmsg::<UnixAddr>(
                stream.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buffer),
                MsgFlags::empty(),
            )
            .map_err(errno_to_io)?;
            if msg.bytes == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed before sending a descriptor",
                ));
            }
            for cmsg in msg.cmsgs().map_err(errno_to_io)? {
                if let ControlMessageOwned::ScmRights(fds) = cmsg {
                    if let Some(fd) = fds.first() {
                        return Ok(*fd);
                    }
                }
            }
            Err(std::io::Error::other(
                "no SCM_RIGHTS control message received",
            ))
        })
        .await
        .map_err(|e| ProtocolError::io("receiving file descriptor", e))?;
    // The descriptor was just handed to this process by the kernel; wrap
    // it before anything can leak it.
    #[allow(unsafe_code)]
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

/// A connected socket pair: a stream for this process and a descriptor to
/// hand to the peer.
pub fn tunnel_pair() -> Result<(UnixStream, OwnedFd), ProtocolError> {
    let (ours, theirs) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .map_err(|e| ProtocolError::io("creating socket pair", errno_to_io(e)))?;
    let ours = stream_from_fd(ours)?;
    Ok((ours, theirs))
}

/// Adopt a received descriptor as a tokio stream.
pub fn stream_from_fd(fd: OwnedFd) -> Result<UnixStream, ProtocolError> {
    let std_stream = std::os::unix::net::UnixStream::from(fd);
    std_stream
        .set_nonblocking(true)
        .map_err(|e| ProtocolError::io("configuring tunnel socket", e))?;
    UnixStream::from_std(std_stream).map_err(|e| ProtocolError::io("adopting tunnel socket", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn descriptor_crosses_a_socket_pair() {
        let (left, right_fd) = tunnel_pair().unwrap();
        let right = stream_from_fd(right_fd).unwrap();

        // Create a second pair and push one end across the first.
        let (mut inner, inner_fd) = tunnel_pair().unwrap();
        send_fd(&left, &inner_fd).await.unwrap();
        drop(inner_fd);

        let received = receive_fd(&right).await.unwrap();
        let mut adopted = stream_from_fd(received).unwrap();

        inner.write_all(b"through the tunnel").await.unwrap();
        inner.shutdown().await.unwrap();
        let mut got = Vec::new();
        adopted.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"through the tunnel");
    }
}
