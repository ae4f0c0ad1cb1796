//! Shared helpers for the crate's tests.

use mux_core::{pipe, Link, MultiBuffer, MuxResult, PipeReader, PipeWriter, Reader, Writer};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A session link plus the test's ends of both pipes: `feed` writes into the
/// session's input, `drain` reads what the session wrote to its output.
pub struct TestLink {
    pub link: Link,
    pub feed: PipeWriter,
    pub drain: PipeReader,
}

pub fn test_link() -> TestLink {
    let (input, feed) = pipe(64);
    let (drain, output) = pipe(64);
    TestLink {
        link: Link::new(input, output),
        feed,
        drain,
    }
}

/// Writer that accepts everything and takes `delay` to close.
pub struct SlowCloseWriter {
    pub delay: Duration,
}

impl Writer for SlowCloseWriter {
    fn write_multi_buffer(
        &mut self,
        _mb: MultiBuffer,
    ) -> Pin<Box<dyn Future<Output = MuxResult<()>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = MuxResult<()>> + Send + '_>> {
        let delay = self.delay;
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            Ok(())
        })
    }
}

/// Reader at end of stream that records when it gets closed.
pub struct FlagReader {
    pub closed: Arc<AtomicBool>,
}

impl Reader for FlagReader {
    fn read_multi_buffer(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = MuxResult<MultiBuffer>> + Send + '_>> {
        Box::pin(async { Ok(MultiBuffer::new()) })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = MuxResult<()>> + Send + '_>> {
        self.closed.store(true, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

/// A link whose output closes slowly, plus the flag its input sets on close.
pub fn slow_close_link(delay: Duration) -> (Link, Arc<AtomicBool>) {
    let closed = Arc::new(AtomicBool::new(false));
    let link = Link::new(
        FlagReader {
            closed: Arc::clone(&closed),
        },
        SlowCloseWriter { delay },
    );
    (link, closed)
}

/// Poll `cond` until it holds, failing the test after five seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
