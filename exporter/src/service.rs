use crate::SyncContext;
use hyper::body::Incoming;
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use shared::http::{TextBody, make_error_response, make_text_response};
use std::pin::Pin;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// HTTP trigger. A request to `/` runs one sync and answers with its summary,
/// or with the error that ended it.
#[derive(Clone)]
pub struct SyncService {
    context: Arc<SyncContext>,
}

impl SyncService {
    pub fn new(context: Arc<SyncContext>) -> Self {
        SyncService { context }
    }
}

impl Service<Request<Incoming>> for SyncService {
    type Response = Response<TextBody>;
    type Error = ServiceError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let context = self.context.clone();
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        Box::pin(async move {
            let response = match (method, path.as_str()) {
                (Method::GET | Method::POST, "/") => match context.run().await {
                    Ok(summary) => make_text_response(StatusCode::OK, format!("{summary}\n")),
                    Err(e) => make_text_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{e}\n")),
                },
                (_, "/") => make_error_response(StatusCode::METHOD_NOT_ALLOWED),
                _ => make_error_response(StatusCode::NOT_FOUND),
            };
            Ok(response)
        })
    }
}
