//! Quorum Wait
//!
//! Send the same request to several peers and resume once enough of them
//! answered, or the deadline passed. Replies that arrive after the quorum
//! was reached are not waited for.

use std::future::Future;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};

use crate::error::{Error, Result};

/// Replies gathered by [`broadcast`]
#[derive(Debug)]
pub struct QuorumReplies<T> {
    pub replies: Vec<T>,
    /// Peers that answered with an error
    pub failed: usize,
    /// Requests sent
    pub sent: usize,
    pub required: usize,
    pub timed_out: bool,
}

impl<T> QuorumReplies<T> {
    pub fn reached(&self) -> bool {
        self.replies.len() >= self.required
    }

    /// Replies if the quorum was reached
    pub fn into_result(self) -> Result<Vec<T>> {
        if self.reached() {
            Ok(self.replies)
        } else {
            Err(Error::QuorumTimeout {
                reached: self.replies.len(),
                required: self.required,
            })
        }
    }
}

/// Drive `requests` until `quorum` succeed, all finish, or `timeout` expires
pub async fn broadcast<I, F, T>(requests: I, quorum: usize, timeout: Duration) -> QuorumReplies<T>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T>>,
{
    let mut pending: FuturesUnordered<F> = requests.into_iter().collect();
    let sent = pending.len();
    let mut replies = Vec::with_capacity(quorum.min(sent));
    let mut failed = 0;
    let mut timed_out = false;

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    while replies.len() < quorum {
        tokio::select! {
            next = pending.next() => match next {
                Some(Ok(reply)) => replies.push(reply),
                Some(Err(e)) => {
                    tracing::debug!("Quorum request failed: {}", e);
                    failed += 1;
                }
                None => break,
            },
            _ = &mut deadline => {
                timed_out = true;
                break;
            }
        }
    }

    if replies.len() < quorum {
        tracing::debug!(
            "Quorum wait ended with {}/{} replies ({} failed, timed out: {})",
            replies.len(),
            quorum,
            failed,
            timed_out
        );
    }

    QuorumReplies {
        replies,
        failed,
        sent,
        required: quorum,
        timed_out,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use futures::FutureExt;

    fn reply_after(ms: u64, value: u32) -> BoxFuture<'static, Result<u32>> {
        async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(value)
        }
        .boxed()
    }

    fn fail_after(ms: u64) -> BoxFuture<'static, Result<u32>> {
        async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Err(Error::Network("peer down".into()))
        }
        .boxed()
    }

    #[tokio::test]
    async fn test_quorum_reached_early() {
        let requests = vec![reply_after(5, 1), reply_after(10, 2), reply_after(5_000, 3)];
        let result = broadcast(requests, 2, Duration::from_secs(2)).await;
        assert!(result.reached());
        assert!(!result.timed_out);
        let mut replies = result.into_result().unwrap();
        replies.sort();
        assert_eq!(replies, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_quorum_timeout() {
        let requests = vec![reply_after(5, 1), reply_after(5_000, 2), reply_after(5_000, 3)];
        let result = broadcast(requests, 2, Duration::from_millis(50)).await;
        assert!(result.timed_out);
        assert_eq!(result.replies, vec![1]);
        assert!(matches!(
            result.into_result(),
            Err(Error::QuorumTimeout { reached: 1, required: 2 })
        ));
    }

    #[tokio::test]
    async fn test_errors_do_not_count() {
        let requests = vec![reply_after(5, 1), fail_after(1), fail_after(2)];
        let result = broadcast(requests, 2, Duration::from_secs(1)).await;
        assert!(!result.timed_out);
        assert_eq!(result.failed, 2);
        assert_eq!(result.sent, 3);
        assert!(result.into_result().is_err());
    }
}
