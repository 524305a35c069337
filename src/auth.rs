use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Student,
    Teacher,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Teacher => "teacher",
            Role::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s.trim() {
            "student" => Some(Role::Student),
            "teacher" => Some(Role::Teacher),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// The authenticated user a request runs as.
#[derive(Debug, Clone, PartialEq)]
pub struct Caller {
    pub user_id: String,
    pub email: String,
    pub name: String,
    pub role: Role,
}

impl Caller {
    pub fn is(&self, role: Role) -> bool {
        self.role == role
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Access {
    Public,
    Authenticated,
    Roles(&'static [Role]),
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Authentication required")]
    MissingToken,
    #[error("Token is invalid")]
    InvalidToken,
    #[error("Access denied. Required role: {required}")]
    Forbidden { required: String },
    #[error("Session lifetime of {hours} hours is out of range")]
    SessionLifetime { hours: i64 },
    #[error("Invalid or expired verification token")]
    VerificationInvalid,
    #[error("Email is already verified")]
    AlreadyVerified,
    #[error("password hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),
    #[error("session storage failed: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::MissingToken | AuthError::InvalidToken => "unauthorized",
            AuthError::Forbidden { .. } => "forbidden",
            AuthError::VerificationInvalid | AuthError::AlreadyVerified => "bad_params",
            AuthError::SessionLifetime { .. } | AuthError::Hash(_) => "internal_error",
            AuthError::Storage(_) => "db_query_failed",
        }
    }
}

fn hex_digest(input: &[u8]) -> String {
    Sha256::digest(input)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// bcrypt hash in the usual `$2b$<cost>$...` form.
pub fn hash_password(password: &str, cost: u32) -> Result<String, AuthError> {
    Ok(bcrypt::hash(password, cost)?)
}

/// Malformed stored hashes never match.
pub fn verify_password(password: &str, stored: &str) -> bool {
    bcrypt::verify(password, stored).unwrap_or(false)
}

pub fn token_digest(token: &str) -> String {
    hex_digest(token.as_bytes())
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(Debug)]
pub struct IssuedSession {
    pub token: String,
    pub expires_at: String,
}

pub fn issue_session(
    conn: &Connection,
    user_id: &str,
    ttl_hours: i64,
) -> Result<IssuedSession, AuthError> {
    let now = Utc::now();
    let expires_at = Duration::try_hours(ttl_hours)
        .and_then(|ttl| now.checked_add_signed(ttl))
        .ok_or(AuthError::SessionLifetime { hours: ttl_hours })?;
    let expires_at = fmt_ts(expires_at);
    let token = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO sessions(token_hash, user_id, created_at, expires_at) VALUES(?, ?, ?, ?)",
        params![token_digest(&token), user_id, fmt_ts(now), expires_at],
    )?;
    Ok(IssuedSession { token, expires_at })
}

/// Looks up the session behind `token`. Expired sessions are removed and
/// reported as invalid.
pub fn resolve_session(conn: &Connection, token: &str) -> Result<Caller, AuthError> {
    let token = token.trim();
    let token = token.strip_prefix("Bearer ").unwrap_or(token).trim();
    if token.is_empty() {
        return Err(AuthError::MissingToken);
    }
    let digest = token_digest(token);
    let row: Option<(String, String, String, String, String)> = conn
        .query_row(
            "SELECT s.expires_at, u.id, u.email, u.name, u.role
             FROM sessions s
             JOIN users u ON u.id = s.user_id
             WHERE s.token_hash = ?",
            [&digest],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()?;
    let Some((expires_at, user_id, email, name, role)) = row else {
        return Err(AuthError::InvalidToken);
    };
    if expires_at <= fmt_ts(Utc::now()) {
        conn.execute("DELETE FROM sessions WHERE token_hash = ?", [&digest])?;
        log::debug!("event=session_expired module=auth status=removed user={}", user_id);
        return Err(AuthError::InvalidToken);
    }
    let role = Role::parse(&role).ok_or(AuthError::InvalidToken)?;
    Ok(Caller {
        user_id,
        email,
        name,
        role,
    })
}

pub fn revoke_session(conn: &Connection, token: &str) -> Result<bool, AuthError> {
    let token = token.trim();
    let token = token.strip_prefix("Bearer ").unwrap_or(token).trim();
    let n = conn.execute(
        "DELETE FROM sessions WHERE token_hash = ?",
        [token_digest(token)],
    )?;
    Ok(n > 0)
}

pub fn count_active_sessions(conn: &Connection) -> Result<i64, AuthError> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM sessions WHERE expires_at > ?",
        [fmt_ts(Utc::now())],
        |r| r.get(0),
    )?)
}

pub const EMAIL_VERIFICATION_TTL_HOURS: i64 = 24;

pub struct IssuedVerification {
    pub token: String,
    pub expires_at: String,
}

/// Replaces any outstanding verification token for the user and marks the
/// address unverified until the new token is confirmed.
pub fn issue_email_verification(
    conn: &Connection,
    user_id: &str,
) -> Result<IssuedVerification, AuthError> {
    let token = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
    let now = Utc::now();
    let expires_at = fmt_ts(now + Duration::hours(EMAIL_VERIFICATION_TTL_HOURS));
    conn.execute(
        "INSERT INTO email_verifications(user_id, token_hash, created_at, expires_at)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(user_id) DO UPDATE SET
            token_hash = excluded.token_hash,
            created_at = excluded.created_at,
            expires_at = excluded.expires_at",
        params![user_id, token_digest(&token), fmt_ts(now), expires_at],
    )?;
    conn.execute(
        "UPDATE users SET is_email_verified = 0 WHERE id = ?",
        [user_id],
    )?;
    Ok(IssuedVerification { token, expires_at })
}

/// Confirms `token` for the user registered under `email`. Returns the
/// user id on success; the token is single use.
pub fn confirm_email(conn: &Connection, email: &str, token: &str) -> Result<String, AuthError> {
    let user: Option<(String, bool)> = conn
        .query_row(
            "SELECT id, is_email_verified FROM users WHERE email = ?",
            [email],
            |r| Ok((r.get(0)?, r.get::<_, i64>(1)? != 0)),
        )
        .optional()?;
    let Some((user_id, verified)) = user else {
        return Err(AuthError::VerificationInvalid);
    };
    if verified {
        return Err(AuthError::AlreadyVerified);
    }
    let pending: Option<(String, String)> = conn
        .query_row(
            "SELECT token_hash, expires_at FROM email_verifications WHERE user_id = ?",
            [&user_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((stored, expires_at)) = pending else {
        return Err(AuthError::VerificationInvalid);
    };
    if stored != token_digest(token.trim()) || expires_at <= fmt_ts(Utc::now()) {
        return Err(AuthError::VerificationInvalid);
    }
    conn.execute(
        "UPDATE users SET is_email_verified = 1, updated_at = ? WHERE id = ?",
        params![fmt_ts(Utc::now()), user_id],
    )?;
    conn.execute(
        "DELETE FROM email_verifications WHERE user_id = ?",
        [&user_id],
    )?;
    Ok(user_id)
}

pub fn authorize(access: Access, caller: Option<&Caller>) -> Result<(), AuthError> {
    match access {
        Access::Public => Ok(()),
        Access::Authenticated => caller.map(|_| ()).ok_or(AuthError::MissingToken),
        Access::Roles(roles) => {
            let caller = caller.ok_or(AuthError::MissingToken)?;
            if roles.contains(&caller.role) {
                Ok(())
            } else {
                Err(AuthError::Forbidden {
                    required: roles
                        .iter()
                        .map(|r| r.as_str())
                        .collect::<Vec<_>>()
                        .join(" or "),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn conn_with_user(role: &str) -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        db::init_schema(&conn).expect("schema");
        let now = db::now_rfc3339();
        conn.execute(
            "INSERT INTO users(id, name, email, password_hash, role, profile_picture, contact_info, created_at, updated_at)
             VALUES('u1', 'Ada', 'ada@example.com', ?, ?, 'default-avatar.png', '0123456789', ?, ?)",
            params![hash_password("secret1", 4).expect("hash"), role, now, now],
        )
        .expect("insert user");
        conn
    }

    #[test]
    fn password_hash_roundtrip_is_salted() {
        let a = hash_password("hunter22", 4).expect("hash");
        let b = hash_password("hunter22", 4).expect("hash");
        assert_ne!(a, b);
        assert!(a.starts_with("$2b$04$"));
        assert!(verify_password("hunter22", &a));
        assert!(verify_password("hunter22", &b));
        assert!(!verify_password("hunter23", &a));
        assert!(!verify_password("hunter22", "plain"));
    }

    #[test]
    fn session_lifecycle() {
        let conn = conn_with_user("teacher");
        let issued = issue_session(&conn, "u1", 1).expect("issue");
        let caller = resolve_session(&conn, &issued.token).expect("resolve");
        assert_eq!(caller.user_id, "u1");
        assert_eq!(caller.role, Role::Teacher);

        let bearer = format!("Bearer {}", issued.token);
        assert!(resolve_session(&conn, &bearer).is_ok());

        // Only the digest is persisted.
        let stored: String = conn
            .query_row("SELECT token_hash FROM sessions", [], |r| r.get(0))
            .expect("stored");
        assert_ne!(stored, issued.token);

        assert!(revoke_session(&conn, &issued.token).expect("revoke"));
        assert!(matches!(
            resolve_session(&conn, &issued.token),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn expired_session_is_rejected_and_removed() {
        let conn = conn_with_user("student");
        let issued = issue_session(&conn, "u1", -1).expect("issue");
        let e = resolve_session(&conn, &issued.token).expect_err("expired");
        assert_eq!(e.code(), "unauthorized");
        let left: i64 = conn
            .query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0))
            .expect("count");
        assert_eq!(left, 0);
    }

    #[test]
    fn out_of_range_session_lifetime_is_an_error() {
        let conn = conn_with_user("student");
        let e = issue_session(&conn, "u1", 100_000_000_000).expect_err("overflow");
        assert_eq!(e.code(), "internal_error");
        let e = issue_session(&conn, "u1", i64::MAX).expect_err("overflow");
        assert!(matches!(e, AuthError::SessionLifetime { hours: i64::MAX }));
        let left: i64 = conn
            .query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0))
            .expect("count");
        assert_eq!(left, 0);
    }

    fn is_verified(conn: &Connection) -> bool {
        conn.query_row("SELECT is_email_verified FROM users WHERE id = 'u1'", [], |r| {
            r.get::<_, i64>(0)
        })
        .expect("flag")
            != 0
    }

    #[test]
    fn email_verification_is_single_use() {
        let conn = conn_with_user("student");
        let first = issue_email_verification(&conn, "u1").expect("issue");
        let second = issue_email_verification(&conn, "u1").expect("reissue");
        assert_ne!(first.token, second.token);

        let e = confirm_email(&conn, "ada@example.com", &first.token).expect_err("replaced");
        assert!(matches!(e, AuthError::VerificationInvalid));
        assert!(matches!(
            confirm_email(&conn, "nobody@example.com", &second.token),
            Err(AuthError::VerificationInvalid)
        ));
        assert!(!is_verified(&conn));

        assert_eq!(
            confirm_email(&conn, "ada@example.com", &second.token).expect("confirm"),
            "u1"
        );
        assert!(is_verified(&conn));
        let e = confirm_email(&conn, "ada@example.com", &second.token).expect_err("used");
        assert!(matches!(e, AuthError::AlreadyVerified));
        assert_eq!(e.code(), "bad_params");
    }

    #[test]
    fn expired_email_verification_is_rejected() {
        let conn = conn_with_user("teacher");
        let issued = issue_email_verification(&conn, "u1").expect("issue");
        conn.execute(
            "UPDATE email_verifications SET expires_at = '2000-01-01T00:00:00.000000Z'",
            [],
        )
        .expect("age token");
        assert!(matches!(
            confirm_email(&conn, "ada@example.com", &issued.token),
            Err(AuthError::VerificationInvalid)
        ));
        assert!(!is_verified(&conn));
    }

    #[test]
    fn role_policy() {
        let student = Caller {
            user_id: "s".into(),
            email: "s@example.com".into(),
            name: "S".into(),
            role: Role::Student,
        };
        const STAFF: &[Role] = &[Role::Admin, Role::Teacher];
        assert!(authorize(Access::Public, None).is_ok());
        assert_eq!(
            authorize(Access::Authenticated, None)
                .expect_err("needs token")
                .code(),
            "unauthorized"
        );
        assert!(authorize(Access::Authenticated, Some(&student)).is_ok());
        let e = authorize(Access::Roles(STAFF), Some(&student)).expect_err("forbidden");
        assert_eq!(e.code(), "forbidden");
        assert!(e.to_string().contains("admin or teacher"));
    }
}
