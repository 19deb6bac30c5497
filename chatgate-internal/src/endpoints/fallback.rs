use axum::http::Uri;

use crate::error::{Error, ErrorDetails};

pub async fn handle_404(uri: Uri) -> Error {
    Error::new(ErrorDetails::RouteNotFound {
        path: uri.path().to_string(),
    })
}
