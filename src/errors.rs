use std::io::Cursor;

use rocket::http::{ContentType, Status};
use rocket::response;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("database error {0:?}")]
    Db(#[from] diesel::result::Error),

    #[error("multipart decoding error {0:?}")]
    Multipart(#[from] multer::Error),

    #[error("IO error")]
    Io(#[from] std::io::Error),

    #[error("User already exists: {0}")]
    UserAlreadyExists(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl<'r> response::Responder<'r, 'static> for AppError {
    fn respond_to(self, _: &'r rocket::Request<'_>) -> response::Result<'static> {
        let (err_str, status) = match &self {
            AppError::Multipart(multer::Error::StreamSizeExceeded { limit }) => {
                let err_str = format!("Request body exceeds the limit of {} bytes", limit);
                (err_str, Status::PayloadTooLarge)
            }
            AppError::UserAlreadyExists(name) => {
                let err_str = format!("User already exists: {}", name);
                (err_str, Status::BadRequest)
            }
            _ => {
                log::error!("got a generic error! {:?}", self);
                ("Internal server error".to_string(), Status::InternalServerError)
            }
        };
        response::Response::build()
            .sized_body(err_str.len(), Cursor::new(err_str))
            .status(status)
            .header(ContentType::Text)
            .ok()
    }
}
