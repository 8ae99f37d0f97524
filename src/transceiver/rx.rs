//! Read pipeline.
//!
//! Reads into a [`FrameBuffer`] and delivers every complete frame either to a
//! bounded queue (pull mode) or to a [`FrameHandler`] (push mode). End of
//! stream, a read error, a short read, the idle timeout or a forced close all
//! end the pipeline.

use tokio::io::AsyncRead;
use tokio::sync::{mpsc, watch};

use super::{Activity, FrameHandler};
use crate::protocol::{Frame, FrameBuffer};

/// Where received frames go.
pub(crate) enum RxSink {
    Queue(mpsc::Sender<Frame>),
    Handler(Box<dyn FrameHandler>),
}

/// Why the RX pipeline stopped.
#[derive(Debug)]
pub(crate) enum RxEnd {
    Eof,
    /// The peer closed in the middle of a frame.
    ShortRead,
    Idle,
    Aborted,
    /// The pull-mode consumer went away.
    Detached,
    Failed(std::io::Error),
}

pub(crate) async fn rx_loop<R>(
    mut reader: R,
    mut sink: RxSink,
    mut abort: watch::Receiver<bool>,
    activity: Activity,
) -> RxEnd
where
    R: AsyncRead + Unpin,
{
    let mut buffer = FrameBuffer::new();

    let end = 'read: loop {
        while let Some(frame) = buffer.next_frame() {
            match &mut sink {
                RxSink::Handler(handler) => handler.on_frame(frame),
                RxSink::Queue(queue) => {
                    let sent = tokio::select! {
                        biased;
                        _ = abort.wait_for(|aborted| *aborted) => break 'read RxEnd::Aborted,
                        sent = queue.send(frame) => sent,
                    };
                    if sent.is_err() {
                        break 'read RxEnd::Detached;
                    }
                }
            }
        }

        let read = tokio::select! {
            biased;
            _ = abort.wait_for(|aborted| *aborted) => break RxEnd::Aborted,
            _ = activity.idle() => break RxEnd::Idle,
            read = buffer.read_from(&mut reader) => read,
        };

        match read {
            Ok(0) if buffer.is_mid_frame() => break RxEnd::ShortRead,
            Ok(0) => break RxEnd::Eof,
            Ok(_) => activity.touch(),
            Err(e) => break RxEnd::Failed(e),
        }
    };

    // Dropping the queue sender signals end of stream to pull-mode receivers.
    if let RxSink::Handler(handler) = &mut sink {
        handler.on_end();
    }
    end
}
