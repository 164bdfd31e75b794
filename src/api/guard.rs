//! Who is calling, resolved once per request before dispatch.

use super::error::HandlerErr;
use super::types::AppState;
use crate::auth::{Role, Session};
use rusqlite::OptionalExtension;

#[derive(Debug, Clone)]
pub enum Auth {
    Anonymous,
    /// A token was presented but could not be accepted; the reason is
    /// reported by any method that needs a session.
    Invalid(String),
    Session(Session),
}

impl Auth {
    pub fn resolve(state: &AppState, token: Option<&str>, now: i64) -> Auth {
        let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) else {
            return Auth::Anonymous;
        };
        let claims = match state.tokens.verify(token, now) {
            Ok(c) => c,
            Err(e) => return Auth::Invalid(e.to_string()),
        };
        if state.revoked.is_revoked(&claims.jti) {
            return Auth::Invalid("token has been revoked".to_string());
        }

        let row = state
            .db
            .query_row(
                "SELECT u.username, u.role, u.branch_id, u.student_id, s.active
                 FROM users u LEFT JOIN students s ON s.id = u.student_id
                 WHERE u.id = ?",
                [&claims.sub],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, Option<String>>(2)?,
                        r.get::<_, Option<String>>(3)?,
                        r.get::<_, Option<i64>>(4)?,
                    ))
                },
            )
            .optional();
        let (username, role, branch_id, student_id, active) = match row {
            Ok(Some(r)) => r,
            Ok(None) => return Auth::Invalid("account no longer exists".to_string()),
            Err(e) => return Auth::Invalid(format!("session lookup failed: {e}")),
        };
        let Some(role) = Role::parse(&role) else {
            return Auth::Invalid("account has an unknown role".to_string());
        };
        if role == Role::Student && active != Some(1) {
            return Auth::Invalid("student account is inactive".to_string());
        }
        Auth::Session(Session {
            user_id: claims.sub,
            username,
            role,
            branch_id,
            student_id,
            token_id: claims.jti,
            expires_at: claims.exp,
        })
    }

    pub fn session(&self) -> Result<&Session, HandlerErr> {
        match self {
            Auth::Session(s) => Ok(s),
            Auth::Anonymous => Err(HandlerErr::unauthorized("sign in required")),
            Auth::Invalid(reason) => Err(HandlerErr::unauthorized(reason.clone())),
        }
    }

    pub fn staff(&self) -> Result<&Session, HandlerErr> {
        let s = self.session()?;
        if !s.role.is_staff() {
            return Err(HandlerErr::forbidden("staff access required"));
        }
        Ok(s)
    }

    pub fn admin(&self) -> Result<&Session, HandlerErr> {
        let s = self.session()?;
        if !s.is_admin() {
            return Err(HandlerErr::forbidden("admin access required"));
        }
        Ok(s)
    }

    /// The calling student's own id.
    pub fn student(&self) -> Result<(&Session, &str), HandlerErr> {
        let s = self.session()?;
        match (s.role, s.student_id.as_deref()) {
            (Role::Student, Some(id)) => Ok((s, id)),
            _ => Err(HandlerErr::forbidden("student access required")),
        }
    }
}

pub fn ensure_branch(session: &Session, branch_id: &str) -> Result<(), HandlerErr> {
    if session.can_access_branch(branch_id) {
        Ok(())
    } else {
        Err(HandlerErr::forbidden("outside your branch"))
    }
}

/// Branch filter for list queries. Sub-admins are pinned to their own
/// branch whatever they ask for; asking for another one is refused.
pub fn scope_branch(
    session: &Session,
    requested: Option<String>,
) -> Result<Option<String>, HandlerErr> {
    match session.role {
        Role::Admin => Ok(requested),
        Role::SubAdmin => {
            let own = session
                .branch_id
                .clone()
                .ok_or_else(|| HandlerErr::forbidden("sub-admin has no branch"))?;
            if let Some(r) = requested {
                if r != own {
                    return Err(HandlerErr::forbidden("outside your branch"));
                }
            }
            Ok(Some(own))
        }
        Role::Student => Err(HandlerErr::forbidden("staff access required")),
    }
}
