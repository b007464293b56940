use std::str::FromStr;

use actix_web::dev::Payload;
use actix_web::http::header::HeaderMap;
use actix_web::{FromRequest, HttpRequest};
use futures::future::{ready, Ready};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::typedid::{TypedId, TypedIdMarker};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

pub type UserId = TypedId<User>;

#[derive(Clone, Debug)]
pub struct User;

impl TypedIdMarker for User {
    fn tag() -> &'static str {
        "USR"
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Driver,
    BusinessOwner,
    Admin,
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Role, Error> {
        match s {
            "driver" => Ok(Role::Driver),
            "business_owner" => Ok(Role::BusinessOwner),
            "admin" => Ok(Role::Admin),
            _ => Err(Error::MissingIdentity),
        }
    }
}

/// The already-authenticated caller, as asserted by the upstream auth proxy.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Identity {
    pub user_id: UserId,
    pub role: Role,
}

impl Identity {
    pub fn new(user_id: UserId, role: Role) -> Identity {
        Identity { user_id, role }
    }

    pub fn from_headers(headers: &HeaderMap) -> Result<Identity, Error> {
        let user_id = headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<UserId>().ok())
            .ok_or(Error::MissingIdentity)?;
        let role = headers
            .get(USER_ROLE_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or(Error::MissingIdentity)?
            .parse()?;

        Ok(Identity { user_id, role })
    }

    pub fn require(&self, role: Role) -> Result<UserId, Error> {
        self.require_any(&[role])
    }

    pub fn require_any(&self, roles: &[Role]) -> Result<UserId, Error> {
        if !roles.contains(&self.role) {
            return Err(Error::PermissionDenied {
                user_id: self.user_id,
                role: self.role,
                allowed_roles: roles.to_vec(),
            });
        }

        Ok(self.user_id)
    }
}

impl FromRequest for Identity {
    type Error = Error;
    type Future = Ready<Result<Identity, Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(Identity::from_headers(req.headers()))
    }
}
