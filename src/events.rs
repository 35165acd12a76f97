//! Pipeline to caller event delivery.
//!
//! Frames and progress reports travel on a bounded lane and are dropped when
//! the caller falls behind. Lifecycle statuses (started, end of stream,
//! source unavailable, stopped) travel on their own lane and are never
//! dropped. A status is never delivered ahead of frames sent before it.

use std::time::{Duration, Instant};

use crossbeam_channel::{select, Receiver, Sender, TryRecvError, TrySendError};

pub use crossbeam_channel::RecvTimeoutError;

use crate::pipeline::{PipelineEvent, StreamStatus};

/// Create a connected sender/receiver pair holding up to `frame_capacity`
/// undelivered frames.
pub fn event_channel(frame_capacity: usize) -> (EventSender, EventReceiver) {
    let (frames_tx, frames_rx) = crossbeam_channel::bounded(frame_capacity.max(1));
    let (status_tx, status_rx) = crossbeam_channel::unbounded();
    (
        EventSender {
            frames: frames_tx,
            statuses: status_tx,
        },
        EventReceiver {
            frames: frames_rx,
            statuses: status_rx,
            held: None,
        },
    )
}

#[derive(Clone, Debug)]
pub struct EventSender {
    frames: Sender<PipelineEvent>,
    statuses: Sender<PipelineEvent>,
}

impl EventSender {
    /// Queue an event without blocking. Returns false when a droppable event
    /// was discarded because the caller is behind.
    pub fn send(&self, event: PipelineEvent) -> bool {
        if is_lifecycle(&event) {
            // Only fails once the receiver is gone, and then nobody is listening.
            let _ = self.statuses.send(event);
            return true;
        }
        !matches!(self.frames.try_send(event), Err(TrySendError::Full(_)))
    }

    pub fn status(&self, stream_id: &str, status: StreamStatus) -> bool {
        self.send(PipelineEvent::Status {
            stream_id: stream_id.to_string(),
            status,
        })
    }
}

fn is_lifecycle(event: &PipelineEvent) -> bool {
    match event {
        PipelineEvent::Frame(_) => false,
        PipelineEvent::Status { status, .. } => !matches!(status, StreamStatus::Progress { .. }),
    }
}

pub struct EventReceiver {
    frames: Receiver<PipelineEvent>,
    statuses: Receiver<PipelineEvent>,
    /// A status received while frames sent before it may still be queued.
    held: Option<PipelineEvent>,
}

impl EventReceiver {
    /// Wait up to `timeout` for the next event.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<PipelineEvent, RecvTimeoutError> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut frames_closed = false;
            let mut statuses_closed = false;
            match self.frames.try_recv() {
                Ok(event) => return Ok(event),
                Err(TryRecvError::Disconnected) => frames_closed = true,
                Err(TryRecvError::Empty) => {}
            }
            if let Some(event) = self.held.take() {
                return Ok(event);
            }
            match self.statuses.try_recv() {
                Ok(event) => {
                    // Frames sent before this status are already visible;
                    // go round once more so they come out first.
                    self.held = Some(event);
                    continue;
                }
                Err(TryRecvError::Disconnected) => statuses_closed = true,
                Err(TryRecvError::Empty) => {}
            }
            if frames_closed && statuses_closed {
                return Err(RecvTimeoutError::Disconnected);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(RecvTimeoutError::Timeout);
            }
            select! {
                recv(self.frames) -> event => {
                    if let Ok(event) = event {
                        return Ok(event);
                    }
                }
                recv(self.statuses) -> event => {
                    if let Ok(event) = event {
                        self.held = Some(event);
                    }
                }
                default(remaining) => return Err(RecvTimeoutError::Timeout),
            }
        }
    }

    /// Everything currently queued, in delivery order.
    pub fn drain(&mut self) -> Vec<PipelineEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.recv_timeout(Duration::ZERO) {
            out.push(event);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(frames: u64) -> PipelineEvent {
        PipelineEvent::Status {
            stream_id: "cam".into(),
            status: StreamStatus::Progress {
                frames,
                total_count: 0,
            },
        }
    }

    fn label(event: &PipelineEvent) -> String {
        match event {
            PipelineEvent::Frame(update) => format!("frame {}", update.sequence),
            PipelineEvent::Status { status, .. } => format!("{:?}", status),
        }
    }

    #[test]
    fn lifecycle_statuses_survive_a_full_frame_lane() {
        let (tx, mut rx) = event_channel(2);
        assert!(tx.status("cam", StreamStatus::Started));
        assert!(tx.send(progress(1)));
        assert!(tx.send(progress(2)));
        assert!(!tx.send(progress(3)));
        assert!(tx.status("cam", StreamStatus::EndOfStream));
        assert!(tx.status("cam", StreamStatus::Stopped { frames: 3 }));

        let seen: Vec<String> = rx.drain().iter().map(label).collect();
        assert_eq!(
            seen,
            vec![
                "Progress { frames: 1, total_count: 0 }",
                "Progress { frames: 2, total_count: 0 }",
                "Started",
                "EndOfStream",
                "Stopped { frames: 3 }",
            ]
        );
    }

    #[test]
    fn disconnects_once_senders_are_gone_and_queue_is_empty() {
        let (tx, mut rx) = event_channel(4);
        tx.status("cam", StreamStatus::Stopped { frames: 0 });
        drop(tx);
        assert!(rx.recv_timeout(Duration::from_millis(10)).is_ok());
        assert!(matches!(
            rx.recv_timeout(Duration::from_millis(10)),
            Err(RecvTimeoutError::Disconnected)
        ));
    }

    #[test]
    fn times_out_while_senders_are_alive() {
        let (_tx, mut rx) = event_channel(4);
        assert!(matches!(
            rx.recv_timeout(Duration::from_millis(5)),
            Err(RecvTimeoutError::Timeout)
        ));
    }
}
