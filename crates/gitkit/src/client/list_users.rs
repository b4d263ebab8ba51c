use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio_util::sync::ReusableBoxFuture;

use super::Client;
use crate::api::User;

type PageResult = crate::Result<(Vec<User>, Option<Box<str>>)>;

/// Streams pages of users, following page tokens until the last page.
///
/// An error ends the stream, but [`ListUsersStream::retry`] picks up again from the
/// page that failed.
pub struct ListUsersStream {
    page_size: usize,
    page_token: Option<Box<str>>,
    fut: ReusableBoxFuture<'static, (Client, PageResult)>,
    state: State,
}

enum State {
    Requesting,
    Failed(Client),
    Done,
}

impl ListUsersStream {
    pub(super) fn new(client: Client, page_size: usize) -> Self {
        let page_size = page_size.max(1);

        Self {
            page_size,
            page_token: None,
            fut: ReusableBoxFuture::new(make_request(client, page_size, None)),
            state: State::Requesting,
        }
    }

    pub async fn next(&mut self) -> crate::Result<Option<Vec<User>>> {
        let mut pinned = Pin::new(self);
        std::future::poll_fn(|cx| pinned.as_mut().poll_next(cx))
            .await
            .transpose()
    }

    /// Drains every page into a single list.
    pub async fn collect(mut self) -> crate::Result<Vec<User>> {
        let mut users = Vec::new();

        while let Some(mut page) = self.next().await? {
            users.append(&mut page);
        }

        Ok(users)
    }

    /// Restarts after an error, re-requesting the page that failed. Returns false if the
    /// stream hadn't failed.
    pub fn retry(&mut self) -> bool {
        match std::mem::replace(&mut self.state, State::Requesting) {
            State::Failed(client) => {
                self.fut
                    .set(make_request(client, self.page_size, self.page_token.clone()));
                true
            }
            other => {
                self.state = other;
                false
            }
        }
    }
}

impl Stream for ListUsersStream {
    type Item = crate::Result<Vec<User>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        match this.state {
            State::Done | State::Failed(_) => Poll::Ready(None),
            State::Requesting => {
                let (client, result) = std::task::ready!(this.fut.poll(cx));

                match result {
                    Err(error) => {
                        this.state = State::Failed(client);
                        Poll::Ready(Some(Err(error)))
                    }
                    // an empty page ends the listing, even with a page token
                    Ok((users, _)) if users.is_empty() => {
                        this.state = State::Done;
                        Poll::Ready(None)
                    }
                    Ok((users, Some(next_page_token))) => {
                        // kick off the next request
                        this.fut.set(make_request(
                            client,
                            this.page_size,
                            Some(next_page_token.clone()),
                        ));
                        this.page_token = Some(next_page_token);
                        Poll::Ready(Some(Ok(users)))
                    }
                    Ok((users, None)) => {
                        this.state = State::Done;
                        Poll::Ready(Some(Ok(users)))
                    }
                }
            }
        }
    }
}

// make requests through the same, non-generic function, that way
// the future should have a consistent layout, letting ReusableBoxFuture
// reuse the memory
async fn make_request(
    client: Client,
    page_size: usize,
    page_token: Option<Box<str>>,
) -> (Client, PageResult) {
    let result = client.list_users_n(page_size, page_token.as_deref()).await;
    (client, result)
}
