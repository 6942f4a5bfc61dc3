use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Role of the signed-in account as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Student,
    Staff,
    Admin,
    Unknown,
}

impl Role {
    pub fn parse(s: Option<&str>) -> Self {
        match s.map(|r| r.trim().to_lowercase()).as_deref() {
            Some("student") => Role::Student,
            Some("staff") => Role::Staff,
            Some("admin") => Role::Admin,
            _ => Role::Unknown,
        }
    }

    /// Staff and admins can triage complaints.
    pub fn can_triage(&self) -> bool {
        matches!(self, Role::Staff | Role::Admin)
    }
}

/// Cached snapshot of the authenticated identity.
///
/// Not authoritative: server responses always supersede it. Fields the
/// backend sends that are not modelled here are kept in `extra` so they
/// survive a round trip through the credential store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default, deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_image: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserProfile {
    pub fn role(&self) -> Role {
        Role::parse(self.role.as_deref())
    }

    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.email.as_deref())
            .unwrap_or("Unknown user")
    }
}

/// Shallow merge: every top-level key in `patch` overwrites the same key in
/// `base`, keys missing from `patch` are kept.
pub(crate) fn merge_shallow(base: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        base.insert(key.clone(), value.clone());
    }
}

/// Ids arrive as strings from some endpoints and numbers from others.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_role_parse() {
        assert_eq!(Role::parse(Some("Admin")), Role::Admin);
        assert_eq!(Role::parse(Some(" staff ")), Role::Staff);
        assert_eq!(Role::parse(Some("student")), Role::Student);
        assert_eq!(Role::parse(Some("dean")), Role::Unknown);
        assert_eq!(Role::parse(None), Role::Unknown);
        assert!(Role::Staff.can_triage());
        assert!(!Role::Student.can_triage());
    }

    #[test]
    fn test_deserialize_keeps_unknown_fields() {
        let user: UserProfile = serde_json::from_value(json!({
            "id": 17,
            "name": "Grace",
            "coverImage": "/covers/17.png",
            "department": "CS"
        }))
        .expect("valid user");
        assert_eq!(user.id.as_deref(), Some("17"));
        assert_eq!(user.cover_image.as_deref(), Some("/covers/17.png"));
        assert_eq!(user.extra.get("department"), Some(&json!("CS")));

        let back = serde_json::to_value(&user).expect("serializes");
        assert_eq!(back["department"], "CS");
        assert!(back.get("email").is_none());
    }

    #[test]
    fn test_merge_shallow() {
        let mut base = json!({"name": "Grace", "avatar": "old.png"})
            .as_object()
            .cloned()
            .unwrap_or_default();
        let patch = json!({"avatar": "new.png"}).as_object().cloned().unwrap_or_default();
        merge_shallow(&mut base, &patch);
        assert_eq!(base["name"], "Grace");
        assert_eq!(base["avatar"], "new.png");
    }

    #[test]
    fn test_display_name_fallbacks() {
        let mut user = UserProfile {
            email: Some("g@campus.edu".into()),
            ..Default::default()
        };
        assert_eq!(user.display_name(), "g@campus.edu");
        user.name = Some("Grace".into());
        assert_eq!(user.display_name(), "Grace");
    }
}
