// Copyright (c) 2013-2016 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License:
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! Tokio adapter for running a peer over an `AsyncRead`/`AsyncWrite`
//! byte stream.
//!
//! The peer itself never suspends; this module supplies the two pumps
//! that feed it: a read loop that pushes completed transport bytes into
//! the peer, and a write queue that drains the peer's outbound messages
//! to the stream, flushing after each write.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use bosun::{Error, Result};

use crate::peer::Peer;
use crate::Transport;

/// A transport that hands outbound buffers to an unbounded channel,
/// to be drained by [`drain_writes`].
pub struct ChannelTransport {
    sender: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

/// Creates the transport plus the receiver end for the write pump.
pub fn channel_transport() -> (ChannelTransport, mpsc::UnboundedReceiver<Vec<u8>>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        ChannelTransport {
            sender: Some(sender),
        },
        receiver,
    )
}

impl Transport for ChannelTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        match &self.sender {
            Some(sender) => sender
                .send(bytes.to_vec())
                .map_err(|_| Error::disconnected("write queue has terminated")),
            None => Err(Error::disconnected("transport is closed")),
        }
    }

    fn close(&mut self) {
        self.sender = None;
    }
}

/// Reads the stream to EOF, feeding the peer. A clean EOF at a frame
/// boundary resolves `Ok`; mid-frame truncation and read errors are
/// reported to the peer and returned.
pub async fn pump_reads<R>(peer: Peer, mut reader: R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8192];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                let error: Error = e.into();
                peer.handle_close(Some(error.clone()));
                return Err(error);
            }
        };
        if n == 0 {
            peer.handle_close(None);
            return Ok(());
        }
        peer.handle_bytes(&buf[..n])?;
    }
}

/// Writes queued outbound messages to the stream in order, flushing
/// after each one. Resolves when the transport closes.
pub async fn drain_writes<W>(mut receiver: mpsc::UnboundedReceiver<Vec<u8>>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(bytes) = receiver.recv().await {
        writer.write_all(&bytes).await?;
        writer.flush().await?;
    }
    writer.shutdown().await?;
    Ok(())
}
