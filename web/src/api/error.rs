use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use asset_tracker::{controller::ControllerError, types::ValidationError};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Controller(#[from] ControllerError),
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError::Controller(e.into())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: u16,
    message: String,
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Controller(ControllerError::Validation(_))
            | ApiError::Controller(ControllerError::Registry(_)) => StatusCode::BAD_REQUEST,
            ApiError::Controller(ControllerError::Rejected) => StatusCode::FORBIDDEN,
            ApiError::Controller(ControllerError::Store(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();

        HttpResponse::build(status).json(ErrorBody {
            code: status.as_u16(),
            message: self.to_string(),
        })
    }
}
