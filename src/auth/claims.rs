use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AuthError;

/// Verified tenant identity extracted from a bearer token. Created by the
/// validator, attached to the request scope, discarded when the scope ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedClaims {
    pub subject: Uuid,
    pub email: Option<String>,
    pub email_verified: bool,
    pub org_id: Uuid,
    pub app_id: Option<Uuid>,
    pub role: ClaimRole,
    pub username: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimRole {
    Admin,
    Developer,
    #[default]
    User,
    Viewer,
}

impl ClaimRole {
    /// Unknown role strings degrade to the least-privileged default rather
    /// than failing the whole token.
    fn parse(s: &str) -> Self {
        match s {
            "admin" => ClaimRole::Admin,
            "developer" => ClaimRole::Developer,
            "viewer" => ClaimRole::Viewer,
            _ => ClaimRole::User,
        }
    }
}

/// Audience may be a single string or a list depending on the token type.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn contains(&self, needle: &str) -> bool {
        match self {
            OneOrMany::One(s) => s == needle,
            OneOrMany::Many(v) => v.iter().any(|s| s == needle),
        }
    }
}

/// `email_verified` arrives as a bool in id tokens and as the string
/// "true"/"false" from some IdP mappers.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Boolish {
    Bool(bool),
    Text(String),
}

impl Boolish {
    pub fn as_bool(&self) -> bool {
        match self {
            Boolish::Bool(b) => *b,
            Boolish::Text(s) => s == "true",
        }
    }
}

/// Wire shape of the JWT payload, before claim-level checks.
#[derive(Debug, Deserialize)]
pub struct RawClaims {
    pub sub: String,
    pub iss: String,
    pub aud: Option<OneOrMany>,
    pub exp: i64,
    pub iat: i64,
    pub token_use: Option<String>,
    #[serde(rename = "custom:tenantId")]
    pub tenant_id: Option<String>,
    #[serde(rename = "custom:app_id")]
    pub app_id: Option<String>,
    #[serde(rename = "custom:userRole")]
    pub user_role: Option<String>,
    pub email: Option<String>,
    pub email_verified: Option<Boolish>,
    #[serde(rename = "cognito:username")]
    pub username: Option<String>,
}

impl RawClaims {
    /// Promote raw claims into `ParsedClaims`, enforcing the UUID formats.
    /// Issuer/audience/token_use checks live in the validator, which needs
    /// the configured values.
    pub fn into_parsed(self) -> Result<ParsedClaims, AuthError> {
        let subject = Uuid::parse_str(&self.sub)
            .map_err(|_| AuthError::InvalidToken("sub is not a UUID".into()))?;

        let org_id = self
            .tenant_id
            .as_deref()
            .ok_or_else(|| AuthError::InvalidToken("missing custom:tenantId claim".into()))
            .and_then(|s| {
                Uuid::parse_str(s)
                    .map_err(|_| AuthError::InvalidToken("custom:tenantId is not a UUID".into()))
            })?;

        let app_id = match self.app_id.as_deref() {
            Some(s) => Some(
                Uuid::parse_str(s)
                    .map_err(|_| AuthError::InvalidToken("custom:app_id is not a UUID".into()))?,
            ),
            None => None,
        };

        Ok(ParsedClaims {
            subject,
            email: self.email,
            email_verified: self.email_verified.map(|b| b.as_bool()).unwrap_or(false),
            org_id,
            app_id,
            role: self
                .user_role
                .as_deref()
                .map(ClaimRole::parse)
                .unwrap_or_default(),
            username: self.username,
            issued_at: Utc
                .timestamp_opt(self.iat, 0)
                .single()
                .ok_or_else(|| AuthError::InvalidToken("iat out of range".into()))?,
            expires_at: Utc
                .timestamp_opt(self.exp, 0)
                .single()
                .ok_or_else(|| AuthError::InvalidToken("exp out of range".into()))?,
        })
    }
}

#[cfg(test)]
impl ParsedClaims {
    pub fn test_claims(org_id: Uuid, app_id: Option<Uuid>) -> Self {
        ParsedClaims {
            subject: Uuid::new_v4(),
            email: Some("tester@example.com".into()),
            email_verified: true,
            org_id,
            app_id,
            role: ClaimRole::User,
            username: Some("tester".into()),
            issued_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(sub: &str, tenant: Option<&str>, app: Option<&str>) -> RawClaims {
        RawClaims {
            sub: sub.into(),
            iss: "https://idp.example".into(),
            aud: Some(OneOrMany::One("client".into())),
            exp: Utc::now().timestamp() + 600,
            iat: Utc::now().timestamp(),
            token_use: Some("access".into()),
            tenant_id: tenant.map(String::from),
            app_id: app.map(String::from),
            user_role: None,
            email: None,
            email_verified: None,
            username: None,
        }
    }

    #[test]
    fn test_into_parsed_happy() {
        let org = Uuid::new_v4();
        let app = Uuid::new_v4();
        let parsed = raw(
            &Uuid::new_v4().to_string(),
            Some(&org.to_string()),
            Some(&app.to_string()),
        )
        .into_parsed()
        .unwrap();
        assert_eq!(parsed.org_id, org);
        assert_eq!(parsed.app_id, Some(app));
        assert_eq!(parsed.role, ClaimRole::User);
    }

    #[test]
    fn test_bad_subject_uuid() {
        let org = Uuid::new_v4().to_string();
        let err = raw("not-a-uuid", Some(&org), None).into_parsed().unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }

    #[test]
    fn test_missing_tenant_claim() {
        let sub = Uuid::new_v4().to_string();
        let err = raw(&sub, None, None).into_parsed().unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }

    #[test]
    fn test_bad_app_uuid() {
        let sub = Uuid::new_v4().to_string();
        let org = Uuid::new_v4().to_string();
        let err = raw(&sub, Some(&org), Some("nope")).into_parsed().unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }

    #[test]
    fn test_role_parsing_defaults() {
        assert_eq!(ClaimRole::parse("admin"), ClaimRole::Admin);
        assert_eq!(ClaimRole::parse("developer"), ClaimRole::Developer);
        assert_eq!(ClaimRole::parse("viewer"), ClaimRole::Viewer);
        assert_eq!(ClaimRole::parse("user"), ClaimRole::User);
        assert_eq!(ClaimRole::parse("root"), ClaimRole::User);
    }

    #[test]
    fn test_one_or_many_audience() {
        let one = OneOrMany::One("a".into());
        assert!(one.contains("a"));
        assert!(!one.contains("b"));
        let many = OneOrMany::Many(vec!["a".into(), "b".into()]);
        assert!(many.contains("b"));
        assert!(!many.contains("c"));
    }

    #[test]
    fn test_boolish_variants() {
        let b: Boolish = serde_json::from_str("true").unwrap();
        assert!(b.as_bool());
        let s: Boolish = serde_json::from_str("\"true\"").unwrap();
        assert!(s.as_bool());
        let f: Boolish = serde_json::from_str("\"false\"").unwrap();
        assert!(!f.as_bool());
    }
}
