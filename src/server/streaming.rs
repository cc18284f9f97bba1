use super::aggregator::StreamAggregator;
use super::logger::ChatCompletionLogger;
use super::{ChatCompletionChunk, ErrorFrame};
use crate::core::FragmentStream;
use axum::response::sse::Event;
use flume::r#async::RecvStream;
use flume::{Receiver, Sender};
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::{
    pin::Pin,
    task::{Context, Poll},
};
use tokio::sync::watch;

#[derive(Debug, PartialEq)]
pub enum StreamingStatus {
    Uninitialized,
    Started,
    Interrupted,
    Stopped,
}

#[derive(Debug)]
pub enum ChatResponse {
    Chunk(ChatCompletionChunk),
    Error(ErrorFrame),
    Done, //finish flag
}

/// SSE body fed by the task driving the generation.
pub struct Streamer {
    rx: RecvStream<'static, ChatResponse>,
    pub status: StreamingStatus,
    disconnect_tx: Option<watch::Sender<bool>>,
}

impl Streamer {
    pub fn new(rx: Receiver<ChatResponse>, disconnect_tx: watch::Sender<bool>) -> Self {
        Self {
            rx: rx.into_stream(),
            status: StreamingStatus::Uninitialized,
            disconnect_tx: Some(disconnect_tx),
        }
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        if self.status != StreamingStatus::Stopped {
            if let Some(tx) = self.disconnect_tx.as_ref() {
                let _ = tx.send(true);
            }
        }
    }
}

impl Stream for Streamer {
    type Item = Result<Event, axum::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.status == StreamingStatus::Stopped {
            return Poll::Ready(None);
        }
        match self.rx.poll_next_unpin(cx) {
            Poll::Ready(Some(resp)) => match resp {
                ChatResponse::Chunk(chunk) => {
                    if self.status != StreamingStatus::Started {
                        self.status = StreamingStatus::Started;
                    }
                    Poll::Ready(Some(Event::default().json_data(chunk)))
                }
                ChatResponse::Error(frame) => Poll::Ready(Some(Event::default().json_data(frame))),
                ChatResponse::Done => {
                    self.status = StreamingStatus::Stopped;
                    Poll::Ready(Some(Ok(Event::default().data("[DONE]"))))
                }
            },
            Poll::Ready(None) => {
                self.status = StreamingStatus::Interrupted;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Pump engine fragments through the aggregator into the client channel until
/// the response is complete or the client goes away.
pub async fn drive_stream(
    mut fragments: FragmentStream,
    mut aggregator: StreamAggregator,
    tx: Sender<ChatResponse>,
    mut disconnect_rx: watch::Receiver<bool>,
    logger: Option<Arc<ChatCompletionLogger>>,
) {
    loop {
        let frames = tokio::select! {
            _ = disconnect_rx.changed() => {
                tracing::info!("Client disconnected, stopping generation");
                return;
            }
            item = fragments.next() => match item {
                Some(Ok(fragment)) => {
                    if let Some(logger) = &logger {
                        logger.log_stream_token(&fragment.delta_text);
                    }
                    aggregator.push(&fragment)
                }
                Some(Err(e)) => {
                    tracing::error!("Stream error: {}", e);
                    aggregator.fail(e.to_string())
                }
                None => aggregator.finish(),
            }
        };

        for frame in frames {
            if let Some(logger) = &logger {
                match &frame {
                    ChatResponse::Chunk(chunk) if chunk.finish_reason().is_some() => {
                        logger.log_stream_end(chunk)
                    }
                    ChatResponse::Error(e) => logger.log_error(&e.error.message),
                    _ => {}
                }
            }
            if let Err(e) = tx.send(frame) {
                tracing::info!("Stream send to client error {:?}", e);
                return;
            }
        }

        if aggregator.is_done() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EngineError, GenerationFragment};
    use std::time::Duration;

    fn fragments(items: Vec<crate::core::Result<GenerationFragment>>) -> FragmentStream {
        futures::stream::iter(items).boxed()
    }

    fn frag(text: &str) -> crate::core::Result<GenerationFragment> {
        Ok(GenerationFragment::new("chatcmpl-x", "qwen", text, 5))
    }

    async fn collect(
        stream: FragmentStream,
        aggregator: StreamAggregator,
    ) -> Vec<ChatResponse> {
        let (tx, rx) = flume::unbounded();
        let (_disconnect_tx, disconnect_rx) = watch::channel(false);
        drive_stream(stream, aggregator, tx, disconnect_rx, None).await;
        rx.drain().collect()
    }

    #[tokio::test]
    async fn drives_text_to_terminal_and_sentinel() {
        let frames = collect(
            fragments(vec![frag("Hi "), frag("there")]),
            StreamAggregator::new("qwen"),
        )
        .await;
        assert_eq!(frames.len(), 4);
        assert!(matches!(&frames[2], ChatResponse::Chunk(c) if c.finish_reason() == Some("stop")));
        assert!(matches!(frames[3], ChatResponse::Done));
    }

    #[tokio::test]
    async fn stops_pulling_after_tool_calls() {
        let frames = collect(
            fragments(vec![
                frag("<tool_call><function=bash><parameter=command>ls</parameter></function>"),
                frag("</tool_call>"),
                Err(EngineError::Payload("must never be reached".to_string())),
            ]),
            StreamAggregator::new("qwen"),
        )
        .await;
        assert!(matches!(&frames[0], ChatResponse::Chunk(c) if c.tool_calls().len() == 1));
        assert!(
            matches!(&frames[1], ChatResponse::Chunk(c) if c.finish_reason() == Some("tool_calls"))
        );
        assert!(matches!(frames[2], ChatResponse::Done));
        assert_eq!(frames.len(), 3);
    }

    #[tokio::test]
    async fn upstream_error_becomes_error_frame() {
        let frames = collect(
            fragments(vec![frag("partial"), Err(EngineError::NotReady)]),
            StreamAggregator::new("qwen"),
        )
        .await;
        let n = frames.len();
        assert!(matches!(&frames[n - 2], ChatResponse::Error(e) if e.error.error_type == "stream_error"));
        assert!(matches!(frames[n - 1], ChatResponse::Done));
    }

    #[tokio::test]
    async fn disconnect_stops_the_driver() {
        let (tx, rx) = flume::unbounded();
        let (disconnect_tx, disconnect_rx) = watch::channel(false);
        let streamer = Streamer::new(rx, disconnect_tx);
        let handle = tokio::spawn(drive_stream(
            futures::stream::pending().boxed(),
            StreamAggregator::new("qwen"),
            tx,
            disconnect_rx,
            None,
        ));
        drop(streamer);
        let joined = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(joined.is_ok(), "driver kept running after disconnect");
    }

    #[tokio::test]
    async fn streamer_ends_after_sentinel() {
        let (tx, rx) = flume::unbounded();
        let (disconnect_tx, mut disconnect_rx) = watch::channel(false);
        let mut streamer = Streamer::new(rx, disconnect_tx);

        let mut aggregator = StreamAggregator::new("qwen");
        for frame in aggregator
            .push(&GenerationFragment::new("id", "qwen", "hello", 1))
            .into_iter()
            .chain(aggregator.finish())
        {
            tx.send(frame).unwrap();
        }

        let mut events = 0;
        while let Some(event) = streamer.next().await {
            assert!(event.is_ok());
            events += 1;
        }
        assert_eq!(events, 3);
        assert_eq!(streamer.status, StreamingStatus::Stopped);
        drop(streamer);
        assert!(!*disconnect_rx.borrow_and_update());
    }
}
