// weatherdash - Dashboard backend for a personal weather station
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

//! Roles assigned by the authenticating proxy in front of the dashboard.
//!
//! The proxy passes the user and role as `X-Hub-*` headers. When it isn't present
//! (running standalone) every request is treated as coming from an admin.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use std::convert::Infallible;

pub const ROLE_HEADER: &str = "X-Hub-Role";
pub const USER_HEADER: &str = "X-Hub-User";
pub const AUTHENTICATED_HEADER: &str = "X-Hub-Authenticated";

const ADMIN_ROLE: &str = "admin";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRole {
    pub role: String,
    pub user: Option<String>,
}

impl UserRole {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(str::to_owned)
        };

        let role = header(ROLE_HEADER).unwrap_or_else(|| ADMIN_ROLE.to_owned());
        let user = header(USER_HEADER);

        tracing::debug!(
            message = "request role",
            role = %role,
            user = ?user,
            authenticated = ?header(AUTHENTICATED_HEADER),
        );

        UserRole { role, user }
    }

    pub fn is_admin(&self) -> bool {
        self.role == ADMIN_ROLE
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for UserRole
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(UserRole::from_headers(&parts.headers))
    }
}
