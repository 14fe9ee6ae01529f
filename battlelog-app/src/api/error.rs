use battlelog_db::QueryError;
use log::error;
use miette::Diagnostic;
use rocket::http::Status;
use rocket::response::Responder;
use rocket::{Request, Response};
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ApiError {
    #[error("invalid query: {0}")]
    BadQuery(String),

    #[error("not found")]
    NotFound,

    #[error("the store is unavailable")]
    StoreOffline,

    #[error("internal error")]
    Db(#[source] QueryError),
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        if battlelog_db::is_connection_error(&err) {
            ApiError::StoreOffline
        } else {
            ApiError::Db(err)
        }
    }
}

impl ApiError {
    fn status(&self) -> Status {
        match self {
            ApiError::BadQuery(_) => Status::BadRequest,
            ApiError::NotFound => Status::NotFound,
            ApiError::StoreOffline => Status::ServiceUnavailable,
            ApiError::Db(_) => Status::InternalServerError,
        }
    }
}

impl<'r, 'o: 'r> Responder<'r, 'o> for ApiError {
    fn respond_to(self, _: &'r Request<'_>) -> rocket::response::Result<'o> {
        if let ApiError::Db(err) = &self {
            error!("{err:#?}");
        }

        // The body stays short and opaque; details go to the log only.
        let rendered = format!("{{\"error\":{}}}", serde_json::json!(self.to_string()));

        Response::build()
            .status(self.status())
            .header(rocket::http::ContentType::JSON)
            .sized_body(rendered.len(), std::io::Cursor::new(rendered))
            .ok()
    }
}
