//! Dedicated writer task: the only task that ever writes to a tunnel's
//! WebSocket sink. Every other task that wants to send a frame does so by
//! pushing onto this channel, so the session's outgoing byte stream always
//! stays ordered and single-writer even though frames originate from the
//! read loop, the heartbeat task, and dispatcher workers.

use axum::extract::ws::{CloseFrame, Message};
use futures_util::SinkExt;
use tokio::sync::{mpsc, watch};

use super::protocol::Frame;

pub type FrameSender = mpsc::UnboundedSender<Frame>;

/// Spawns the writer task. `shutdown_rx` is the same channel the session's
/// read loop and heartbeat watch for process/takeover shutdown (§5: "send
/// close frames to all sessions with reason shutdown"); the writer races it
/// against the frame channel so a process shutdown sends a transport-level
/// close even if no frame is currently queued.
pub fn spawn<S>(mut sink: S, mut shutdown_rx: watch::Receiver<bool>) -> (FrameSender, tokio::task::JoinHandle<()>)
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: axum::extract::ws::close_code::NORMAL,
                                reason: "shutdown".into(),
                            })))
                            .await;
                        return;
                    }
                }
                frame = rx.recv() => {
                    match frame {
                        Some(frame) => {
                            let message = Message::Text(frame.to_json());
                            if sink.send(message).await.is_err() {
                                return;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });
    (tx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn shutdown_closes_the_transport_with_reason_shutdown() {
        let sent: Arc<Mutex<Vec<Message>>> = Arc::new(Mutex::new(Vec::new()));
        let recorded = sent.clone();
        let test_sink = futures_util::sink::unfold((), move |_, message: Message| {
            let sent = recorded.clone();
            async move {
                sent.lock().unwrap().push(message);
                Ok::<(), axum::Error>(())
            }
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (_frame_tx, handle) = spawn(test_sink, shutdown_rx);
        let _ = shutdown_tx.send(true);
        handle.await.unwrap();

        let sent = sent.lock().unwrap();
        match sent.last() {
            Some(Message::Close(Some(frame))) => assert_eq!(frame.reason, "shutdown"),
            other => panic!("expected a close frame with reason \"shutdown\", got {other:?}"),
        }
    }

    #[tokio::test]
    async fn queued_frames_are_written_before_the_channel_closes() {
        let sent: Arc<Mutex<Vec<Message>>> = Arc::new(Mutex::new(Vec::new()));
        let recorded = sent.clone();
        let test_sink = futures_util::sink::unfold((), move |_, message: Message| {
            let sent = recorded.clone();
            async move {
                sent.lock().unwrap().push(message);
                Ok::<(), axum::Error>(())
            }
        });

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (frame_tx, handle) = spawn(test_sink, shutdown_rx);
        frame_tx.send(Frame::Ping).unwrap();
        drop(frame_tx);
        handle.await.unwrap();

        let sent = sent.lock().unwrap();
        assert!(matches!(&sent[0], Message::Text(t) if t == r#"{"type":"ping"}"#));
        assert!(matches!(sent.last(), Some(Message::Close(None))));
    }
}
