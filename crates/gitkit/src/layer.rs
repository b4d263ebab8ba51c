use std::borrow::Cow;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use http::{Request, Response, header};
use tower::{Layer, Service};

use crate::client::Client;
use crate::token::Token;

type VerifyFuture<ReqBody> =
    Pin<Box<dyn Future<Output = (Request<ReqBody>, crate::Result<Token>)> + Send + 'static>>;

/// Verifies the ID token of each request, from the client's cookie or an
/// `Authorization: Bearer` header. On success the [`Token`] is added to the request
/// extensions, otherwise the request is answered with a `401`.
#[derive(Debug, Clone)]
pub struct VerifyTokenLayer {
    client: Client,
}

impl VerifyTokenLayer {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl<S> Layer<S> for VerifyTokenLayer {
    type Service = VerifyTokenService<S>;

    fn layer(&self, service: S) -> Self::Service {
        VerifyTokenService {
            service,
            client: self.client.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerifyTokenService<S> {
    service: S,
    client: Client,
}

impl<S, ReqBody, RespBody> Service<Request<ReqBody>> for VerifyTokenService<S>
where
    S: Service<Request<ReqBody>, Response = Response<RespBody>> + Clone,
    ReqBody: Send + 'static,
    RespBody: From<Cow<'static, str>>,
{
    type Response = Response<RespBody>;
    type Error = S::Error;
    type Future = VerifyTokenFuture<ReqBody, RespBody, S>;

    #[inline]
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let Some(token) = extract_token(&self.client, &request).map(str::to_owned) else {
            return VerifyTokenFuture::error(crate::Error::MissingToken);
        };

        // we need to replace the original service with the cloned service.
        // this is because the cloned service might not be ready
        // (via poll_ready), even if the original one was.
        //
        // see the issue in tower describing in more detail:
        // https://github.com/tower-rs/tower/issues/547#issuecomment-767629149
        let mut service = self.service.clone();
        std::mem::swap(&mut service, &mut self.service);

        let client = self.client.clone();

        let verify_future = Box::pin(async move {
            let result = client.validate_token(&token).await;
            (request, result)
        });

        VerifyTokenFuture::PendingVerification {
            verify_future,
            service,
        }
    }
}

/// The client's cookie takes priority over the `Authorization` header.
fn extract_token<'a, B>(client: &Client, request: &'a Request<B>) -> Option<&'a str> {
    let headers = request.headers();

    client.token_from_request(headers).or_else(|| {
        headers
            .get(header::AUTHORIZATION)?
            .to_str()
            .ok()?
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|token| !token.is_empty())
    })
}

pin_project_lite::pin_project! {
    #[project = VerifyTokenFutureProject]
    pub enum VerifyTokenFuture<ReqBody, RespBody, S: Service<Request<ReqBody>, Response = Response<RespBody>>> {
        Error { error: crate::Error, logged: bool },
        PendingVerification {
            #[pin]
            verify_future: VerifyFuture<ReqBody>,
            service: S,
        },
        Calling { #[pin] fut: S::Future },
    }
}

impl<ReqBody, RespBody, S> VerifyTokenFuture<ReqBody, RespBody, S>
where
    S: Service<Request<ReqBody>, Response = Response<RespBody>>,
{
    fn error(error: impl Into<crate::Error>) -> Self {
        Self::Error {
            error: error.into(),
            logged: false,
        }
    }
}

fn make_error_response<B>(error: &crate::Error) -> Response<B>
where
    B: From<Cow<'static, str>>,
{
    let (status, body) = error.to_response_parts();
    let mut resp = Response::new(B::from(body));
    *resp.status_mut() = status;
    resp
}

impl<ReqBody, RespBody, S> Future for VerifyTokenFuture<ReqBody, RespBody, S>
where
    S: Service<Request<ReqBody>, Response = Response<RespBody>>,
    RespBody: From<Cow<'static, str>>,
{
    type Output = Result<Response<RespBody>, S::Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            match self.as_mut().project() {
                VerifyTokenFutureProject::Error { error, logged } => {
                    if !*logged {
                        tracing::warn!(message = "rejected request without a valid id token", %error);
                        *logged = true;
                    }
                    return Poll::Ready(Ok(make_error_response(error)));
                }
                VerifyTokenFutureProject::PendingVerification {
                    verify_future,
                    service,
                } => {
                    let (mut request, result) = std::task::ready!(verify_future.poll(cx));

                    match result {
                        Ok(token) => {
                            request.extensions_mut().insert(token);
                            let fut = service.call(request);
                            self.set(VerifyTokenFuture::Calling { fut });
                        }
                        Err(error) => self.set(VerifyTokenFuture::error(error)),
                    }
                }
                VerifyTokenFutureProject::Calling { fut } => return fut.poll(cx),
            }
        }
    }
}
