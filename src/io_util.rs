use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::util::timeout_with_context;

pub async fn write_all_with_timeout<W: AsyncWrite + Unpin, C: Into<String>>(
    writer: &mut W,
    buf: &[u8],
    timeout: Duration,
    context: C,
) -> Result<()> {
    timeout_with_context(timeout, writer.write_all(buf), context).await
}

pub async fn shutdown_with_timeout<W: AsyncWrite + Unpin>(
    writer: &mut W,
    timeout: Duration,
) -> Result<()> {
    timeout_with_context(timeout, writer.shutdown(), "shutting down stream").await
}

#[cfg(test)]
mod tests {
    use super::write_all_with_timeout;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;

    use tokio::io::AsyncWrite;

    struct PendingWriter;

    impl AsyncWrite for PendingWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Pending
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn write_all_with_timeout_times_out_on_stalled_writer() {
        let handle = tokio::spawn(async {
            let mut writer = PendingWriter;
            write_all_with_timeout(
                &mut writer,
                b"payload",
                Duration::from_secs(1),
                "writing response headers",
            )
            .await
        });

        tokio::time::advance(Duration::from_secs(2)).await;
        let err = handle.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
