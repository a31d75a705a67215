use serde::{Deserialize, Serialize};

/// Account record. Login answers `{id, name, email}`, the user details
/// endpoint answers `{firstName, lastName, email, role}`; both shapes parse.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct User {
    #[serde(default, deserialize_with = "id_as_string")]
    pub id: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "firstName")]
    pub first_name: Option<String>,
    #[serde(rename = "lastName")]
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub role: Option<String>,
}

/// Ids arrive as strings or numbers depending on the backend
fn id_as_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

impl User {
    pub fn display_name(&self) -> String {
        let full = match (&self.first_name, &self.last_name) {
            (Some(first), Some(last)) => format!("{} {}", first, last),
            (Some(first), None) => first.clone(),
            (None, Some(last)) => last.clone(),
            (None, None) => String::new(),
        };
        if !full.trim().is_empty() {
            return full;
        }
        self.name
            .clone()
            .filter(|n| !n.is_empty())
            .or_else(|| self.email.clone())
            .unwrap_or_else(|| "Unknown user".to_string())
    }
}
