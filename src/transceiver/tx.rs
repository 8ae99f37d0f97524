//! Write pipeline.
//!
//! One task per connection owns the write half. Producers enqueue through a
//! bounded mpsc channel; the task drains whatever is ready into a batch and
//! writes it with a single vectored write, so FIFO order is kept while small
//! frames share syscalls.
//!
//! ```text
//! frame_transmit ─┐
//! frame_transmit ─┼─► mpsc::Sender<Outbound> ─► TX task ─► write half
//! close(false)  ──┘        (Shutdown)
//! ```

use std::io::IoSlice;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

use super::Activity;
use crate::protocol::{Frame, HEADER_SIZE};

/// Maximum frames written in one vectored write.
const MAX_BATCH_SIZE: usize = 64;

/// Item on the TX queue.
#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(OutboundFrame),
    /// Flush, shut down the write side, and stop.
    Shutdown,
}

/// A frame ready to be written: pre-encoded header plus payload.
#[derive(Debug)]
pub(crate) struct OutboundFrame {
    header: [u8; HEADER_SIZE],
    payload: Bytes,
}

impl OutboundFrame {
    pub(crate) fn new(frame: &Frame) -> Self {
        Self {
            header: frame.header().encode(),
            payload: frame.payload_bytes(),
        }
    }

    #[inline]
    fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Why the TX pipeline stopped.
#[derive(Debug)]
pub(crate) enum TxEnd {
    /// Shutdown sentinel processed, or every producer went away.
    Shutdown,
    Aborted,
    Failed(std::io::Error),
}

pub(crate) async fn tx_loop<W>(
    mut queue: mpsc::Receiver<Outbound>,
    mut writer: W,
    mut abort: watch::Receiver<bool>,
    activity: Activity,
) -> TxEnd
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = tokio::select! {
            biased;
            _ = abort.wait_for(|aborted| *aborted) => return TxEnd::Aborted,
            item = queue.recv() => item,
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        let mut shutdown = false;
        match first {
            Some(Outbound::Frame(frame)) => batch.push(frame),
            Some(Outbound::Shutdown) | None => shutdown = true,
        }

        while !shutdown && batch.len() < MAX_BATCH_SIZE {
            match queue.try_recv() {
                Ok(Outbound::Frame(frame)) => batch.push(frame),
                Ok(Outbound::Shutdown) => shutdown = true,
                Err(_) => break,
            }
        }

        if !batch.is_empty() {
            let written = tokio::select! {
                biased;
                _ = abort.wait_for(|aborted| *aborted) => return TxEnd::Aborted,
                r = write_batch(&mut writer, &batch) => r,
            };
            if let Err(e) = written {
                return TxEnd::Failed(e);
            }
            activity.touch();
        }

        if shutdown {
            // Frames enqueued after the sentinel are never written.
            queue.close();
            return match writer.shutdown().await {
                Ok(()) => TxEnd::Shutdown,
                Err(e) => TxEnd::Failed(e),
            };
        }
    }
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(OutboundFrame::size).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            ));
        }
        total_written += written;
    }

    writer.flush().await
}

/// Build IoSlice array for the data left after `skip_bytes` were written.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for frame in batch {
        let header_end = offset + HEADER_SIZE;
        if skip_bytes < header_end {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&frame.header[start..]));
        }
        offset = header_end;

        if !frame.payload.is_empty() {
            let payload_end = offset + frame.payload.len();
            if skip_bytes < payload_end {
                let start = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&frame.payload[start..]));
            }
            offset = payload_end;
        }
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::{duplex, AsyncReadExt};

    fn outbound(tid: u16, payload: &'static [u8]) -> OutboundFrame {
        OutboundFrame::new(&Frame::modbus(tid, Bytes::from_static(payload)).unwrap())
    }

    #[test]
    fn test_remaining_slices_no_skip() {
        let batch = vec![outbound(1, b"\x01\x03\x00")];
        let slices = build_remaining_slices(&batch, 0);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), HEADER_SIZE);
    }

    #[test]
    fn test_remaining_slices_partial_header() {
        let batch = vec![outbound(1, b"\x01\x03\x00")];
        let slices = build_remaining_slices(&batch, 4);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), HEADER_SIZE - 4);
        assert_eq!(slices[1].len(), 3);
    }

    #[test]
    fn test_remaining_slices_into_second_frame() {
        let batch = vec![outbound(1, b"\x01\x03"), outbound(2, b"\x01\x04")];
        let slices = build_remaining_slices(&batch, HEADER_SIZE + 2 + 1);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), HEADER_SIZE - 1);
        assert_eq!(&slices[1][..], b"\x01\x04");
    }

    #[tokio::test]
    async fn test_write_batch_preserves_order() {
        let mut buf = Cursor::new(Vec::new());
        let batch = vec![outbound(7, b"\x01\x03"), outbound(8, b"\x02\x04\x09")];
        write_batch(&mut buf, &batch).await.unwrap();

        let written = buf.into_inner();
        assert_eq!(
            written,
            vec![
                0x00, 0x07, 0x00, 0x00, 0x00, 0x02, 0x01, 0x03, //
                0x00, 0x08, 0x00, 0x00, 0x00, 0x03, 0x02, 0x04, 0x09,
            ]
        );
    }

    #[tokio::test]
    async fn test_shutdown_sentinel_closes_write_side() {
        let (client, mut server) = duplex(1024);
        let (tx, rx) = mpsc::channel(4);
        let (_abort_tx, abort_rx) = watch::channel(false);
        let task = tokio::spawn(tx_loop(rx, client, abort_rx, Activity::new()));

        tx.send(Outbound::Frame(outbound(1, b"\x01\x03"))).await.unwrap();
        tx.send(Outbound::Shutdown).await.unwrap();

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received.len(), HEADER_SIZE + 2);
        assert!(matches!(task.await.unwrap(), TxEnd::Shutdown));
    }

    #[tokio::test]
    async fn test_abort_stops_idle_pipeline() {
        let (client, _server) = duplex(1024);
        let (_tx, rx) = mpsc::channel::<Outbound>(4);
        let (abort_tx, abort_rx) = watch::channel(false);
        let task = tokio::spawn(tx_loop(rx, client, abort_rx, Activity::new()));

        abort_tx.send_replace(true);
        assert!(matches!(task.await.unwrap(), TxEnd::Aborted));
    }
}
