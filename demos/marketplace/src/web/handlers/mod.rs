// demos/marketplace/src/web/handlers/mod.rs

pub mod event_handlers;
pub mod file_handlers;
pub mod session_handlers;

use crate::errors::AppError;
use actix_web::{FromRequest, HttpRequest};
use formstage::{OwnerRef, SessionId};

/// The caller's identity, if any. Requests without an `X-User-ID` header act
/// as guests.
#[derive(Debug, Clone)]
pub struct OptionalUser(pub Option<OwnerRef>);

impl OptionalUser {
  pub fn owner(&self) -> Option<&OwnerRef> {
    self.0.as_ref()
  }
}

impl FromRequest for OptionalUser {
  type Error = AppError;
  type Future = futures_util::future::Ready<Result<Self, Self::Error>>;

  fn from_request(req: &HttpRequest, _payload: &mut actix_web::dev::Payload) -> Self::Future {
    let owner = match req.headers().get("X-User-ID").map(|h| h.to_str()) {
      None => Ok(None),
      Some(Ok(raw)) if !raw.trim().is_empty() => Ok(Some(OwnerRef::new(raw.trim()))),
      Some(_) => Err(AppError::Validation("X-User-ID header must be a non-empty string".to_string())),
    };
    futures_util::future::ready(owner.map(OptionalUser))
  }
}

pub(crate) fn parse_session_id(raw: &str) -> Result<SessionId, AppError> {
  Ok(SessionId::parse(raw)?)
}
