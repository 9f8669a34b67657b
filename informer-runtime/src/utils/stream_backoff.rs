use std::{
    future::Future,
    pin::Pin,
    task::{ready, Context, Poll},
};

use futures::{Stream, TryStream};
use pin_project::pin_project;
use tokio::time::{sleep, Sleep};

use super::ResettableBackoff;

/// Pauses a fallible stream after each error, according to a [`ResettableBackoff`]
///
/// The error itself is passed through right away; it is the *next* poll of the inner stream
/// that waits out the delay. Any [`Ok`] value starts the delay sequence over.
///
/// Once the backoff has no delay left, the stream ends after the error that exhausted it.
/// Retry loops that must outlive every failure should use a backoff that never runs out,
/// such as [`DefaultBackoff`](crate::watcher::DefaultBackoff).
#[pin_project]
pub struct StreamBackoff<S, B> {
    #[pin]
    stream: S,
    backoff: B,
    #[pin]
    pause: Option<Sleep>,
    exhausted: bool,
}

impl<S: TryStream, B: ResettableBackoff> StreamBackoff<S, B> {
    /// Wraps `stream`, sleeping according to `backoff` after each error
    pub fn new(stream: S, backoff: B) -> Self {
        Self {
            stream,
            backoff,
            pause: None,
            exhausted: false,
        }
    }
}

impl<S: TryStream, B: ResettableBackoff> Stream for StreamBackoff<S, B> {
    type Item = Result<S::Ok, S::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        if *this.exhausted {
            return Poll::Ready(None);
        }
        if let Some(pause) = this.pause.as_mut().as_pin_mut() {
            ready!(pause.poll(cx));
            tracing::trace!("backoff elapsed, polling again");
            this.pause.set(None);
        }

        let item = ready!(this.stream.try_poll_next(cx));
        match &item {
            Some(Err(_)) => match this.backoff.next() {
                Some(delay) => {
                    tracing::debug!(?delay, "error received, backing off");
                    this.pause.set(Some(sleep(delay)));
                }
                None => {
                    tracing::warn!("error received and backoff exhausted, ending the stream");
                    *this.exhausted = true;
                }
            },
            Some(Ok(_)) => this.backoff.reset(),
            None => {}
        }
        Poll::Ready(item)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{task::Poll, time::Duration};

    use super::StreamBackoff;
    use crate::utils::{ResettableBackoff, ResettableBackoffWrapper};
    use backon::ConstantBuilder;
    use futures::{channel::mpsc, pin_mut, poll, stream, StreamExt};

    #[tokio::test(start_paused = true)]
    async fn pauses_after_an_error() {
        let delay = Duration::from_secs(1);
        let events = StreamBackoff::new(
            stream::iter([Ok(0), Err(1), Ok(2)]),
            ResettableBackoffWrapper::new(ConstantBuilder::default().with_delay(delay).without_max_times()),
        );
        pin_mut!(events);
        assert_eq!(poll!(events.next()), Poll::Ready(Some(Ok(0))));
        assert_eq!(poll!(events.next()), Poll::Ready(Some(Err(1))));
        assert_eq!(poll!(events.next()), Poll::Pending);
        tokio::time::advance(delay).await;
        assert_eq!(poll!(events.next()), Poll::Ready(Some(Ok(2))));
        assert_eq!(poll!(events.next()), Poll::Ready(None));
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_errors_grow_the_pause_until_a_success() {
        let (tx, rx) = mpsc::unbounded();
        let events = StreamBackoff::new(rx, LinearBackoff::new(Duration::from_secs(2)));
        pin_mut!(events);

        tx.unbounded_send(Err("list failed")).unwrap();
        assert_eq!(poll!(events.next()), Poll::Ready(Some(Err("list failed"))));
        tokio::time::advance(Duration::from_secs(2)).await;
        tx.unbounded_send(Err("list failed again")).unwrap();
        assert_eq!(poll!(events.next()), Poll::Ready(Some(Err("list failed again"))));

        // second pause is 4s
        tx.unbounded_send(Ok("listed")).unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(poll!(events.next()), Poll::Pending);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(poll!(events.next()), Poll::Ready(Some(Ok("listed"))));

        // and the success started the sequence over
        tx.unbounded_send(Err("watch failed")).unwrap();
        tx.unbounded_send(Ok("watching")).unwrap();
        assert_eq!(poll!(events.next()), Poll::Ready(Some(Err("watch failed"))));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(poll!(events.next()), Poll::Ready(Some(Ok("watching"))));

        drop(tx);
        assert_eq!(poll!(events.next()), Poll::Ready(None));
    }

    #[tokio::test]
    async fn ends_once_the_backoff_is_exhausted() {
        let events = StreamBackoff::new(
            stream::iter([Ok(0), Err(1), Ok(2)]),
            ResettableBackoffWrapper::new(ConstantBuilder::default().with_max_times(0)),
        );
        assert_eq!(events.collect::<Vec<_>>().await, vec![Ok(0), Err(1)]);
    }

    /// Each delay is one `interval` longer than the previous one
    pub struct LinearBackoff {
        interval: Duration,
        current: Duration,
    }

    impl LinearBackoff {
        pub fn new(interval: Duration) -> Self {
            Self {
                interval,
                current: Duration::ZERO,
            }
        }
    }

    impl Iterator for LinearBackoff {
        type Item = Duration;

        fn next(&mut self) -> Option<Duration> {
            self.current += self.interval;
            Some(self.current)
        }
    }

    impl ResettableBackoff for LinearBackoff {
        fn reset(&mut self) {
            self.current = Duration::ZERO;
        }
    }
}
